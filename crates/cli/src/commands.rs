use std::io::Write;

use anyhow::{Context, Result, bail};
use gocp_modules::{KillSwitch, RefreshOutcome, RemoteStatus, SettingsStore};
use gocp_storage::Database;
use serde_json::Value;

/// Parse `name=value`. The value is read as a JSON literal when it is one
/// (`true`, `3`, `"quoted"`), otherwise taken as text.
pub fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("option name is empty in {raw:?}"));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

pub async fn refresh<D: Database>(kill_switch: &KillSwitch<D>, out: &mut impl Write) -> Result<()> {
    match kill_switch.refresh().await.context("refresh failed")? {
        RefreshOutcome::Updated { entries } => {
            writeln!(out, "cached {entries} disable entries")?;
            Ok(())
        }
        RefreshOutcome::Skipped => bail!("remote_disable.base_url is not configured"),
    }
}

pub async fn list<D: Database>(kill_switch: &KillSwitch<D>, out: &mut impl Write) -> Result<()> {
    let entries = kill_switch
        .cached_entries()
        .await
        .context("failed to read the cached list")?;

    if entries.is_empty() {
        writeln!(out, "no cached disable entries")?;
        return Ok(());
    }
    for entry in entries {
        let range = entry.version_range.as_deref().unwrap_or("-");
        writeln!(out, "{}\t{}\t{}", entry.id, range, entry.message)?;
    }
    Ok(())
}

pub async fn status<D: Database>(
    kill_switch: &KillSwitch<D>,
    id: &str,
    out: &mut impl Write,
) -> Result<()> {
    let status = kill_switch
        .status_of(id)
        .await
        .context("failed to read the cached list")?;
    let version = kill_switch.current_version();

    match status {
        RemoteStatus::Allowed => writeln!(out, "{id}: allowed on {version}")?,
        RemoteStatus::Disabled { message } if message.is_empty() => {
            writeln!(out, "{id}: disabled on {version}")?
        }
        RemoteStatus::Disabled { message } => {
            writeln!(out, "{id}: disabled on {version}: {message}")?
        }
    }
    Ok(())
}

pub async fn show_settings<D: Database>(
    settings: &SettingsStore<D>,
    id: &str,
    out: &mut impl Write,
) -> Result<()> {
    let record = settings
        .get(id)
        .await
        .with_context(|| format!("failed to read settings for {id}"))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

pub async fn set_settings<D: Database>(
    settings: &SettingsStore<D>,
    id: &str,
    enabled: Option<bool>,
    options: Vec<(String, Value)>,
    out: &mut impl Write,
) -> Result<()> {
    if enabled.is_none() && options.is_empty() {
        bail!("nothing to change; pass --enabled or --option");
    }

    let mut record = settings
        .get(id)
        .await
        .with_context(|| format!("failed to read settings for {id}"))?;
    if enabled.is_some() {
        record.enabled = enabled;
    }
    record.options.extend(options);

    settings
        .set(id, &record)
        .await
        .with_context(|| format!("failed to store settings for {id}"))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

pub async fn reset_settings<D: Database>(
    settings: &SettingsStore<D>,
    id: &str,
    out: &mut impl Write,
) -> Result<()> {
    let removed = settings
        .reset(id)
        .await
        .with_context(|| format!("failed to reset settings for {id}"))?;
    if removed {
        writeln!(out, "{id}: settings reset")?;
    } else {
        writeln!(out, "{id}: nothing stored")?;
    }
    Ok(())
}
