//! `gocp` operator CLI: inspect and refresh the kill-switch cache, and read or
//! change the settings records the module host evaluates.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gocp_core::config::{self, Config};
use gocp_modules::{KillSwitch, SettingsStore};
use gocp_storage::{NativeDatabase, VersionedStore, open_database};
use serde_json::Value;
use tracing::debug;

mod commands;

#[derive(Parser)]
#[command(name = "gocp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or refresh the remote disable list
    RemoteDisable {
        #[command(subcommand)]
        command: RemoteDisableCommand,
    },
    /// Read or change a module's stored settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand)]
enum RemoteDisableCommand {
    /// Fetch the list from the configured endpoint and cache it
    Refresh,
    /// Print the cached list
    List,
    /// Show whether a module is disabled for the configured host version
    Status {
        /// Module id
        id: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print the stored record for a module
    Show {
        /// Module id
        id: String,
    },
    /// Change the enabled flag or suboption values
    Set {
        /// Module id
        id: String,

        /// Turn the module on or off
        #[arg(long)]
        enabled: Option<bool>,

        /// Suboption value; JSON literals are parsed, anything else is text
        #[arg(long = "option", value_name = "NAME=VALUE", value_parser = commands::parse_option)]
        options: Vec<(String, Value)>,
    },
    /// Forget the stored record so defaults apply again
    Reset {
        /// Module id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("failed to load configuration")?;

    gocp_core::logging::init_tracing(&config.logging.level)
        .context("failed to initialize logging")?;

    let store = open_store(&config).await?;
    let mut out = io::stdout();

    match cli.command {
        Commands::RemoteDisable { command } => {
            let version = config
                .host
                .version()
                .context("invalid host version")?;
            let kill_switch = KillSwitch::from_config(store, version, &config.remote_disable)
                .context("failed to set up the kill switch")?;

            match command {
                RemoteDisableCommand::Refresh => commands::refresh(&kill_switch, &mut out).await,
                RemoteDisableCommand::List => commands::list(&kill_switch, &mut out).await,
                RemoteDisableCommand::Status { id } => {
                    commands::status(&kill_switch, &id, &mut out).await
                }
            }
        }
        Commands::Settings { command } => {
            let settings = SettingsStore::new(store);

            match command {
                SettingsCommand::Show { id } => {
                    commands::show_settings(&settings, &id, &mut out).await
                }
                SettingsCommand::Set {
                    id,
                    enabled,
                    options,
                } => commands::set_settings(&settings, &id, enabled, options, &mut out).await,
                SettingsCommand::Reset { id } => {
                    commands::reset_settings(&settings, &id, &mut out).await
                }
            }
        }
    }
}

async fn open_store(config: &Config) -> Result<VersionedStore<NativeDatabase>> {
    let path = config.storage.resolved_path();
    debug!(path = %path.display(), "opening module store");
    let db = open_database(&path)
        .await
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(VersionedStore::new(Arc::new(db)))
}
