use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub remote_disable: RemoteDisableConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Facts about the running host build that modules are gated against.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_host_version")]
    pub version: String,
}

impl HostConfig {
    pub fn version(&self) -> Result<semver::Version, ConfigError> {
        semver::Version::parse(&self.version).map_err(|error| ConfigError::InvalidValue {
            field: "host.version".to_string(),
            message: error.to_string(),
        })
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: default_host_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDisableConfig {
    /// Base URL the disable list is fetched from. Refreshing is skipped when unset.
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub refresh_on_startup: bool,
}

impl Default for RemoteDisableConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_timeout_ms(),
            refresh_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

impl StorageConfig {
    /// The configured database path, or the platform data directory default.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => data_path(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    version: Option<String>,
    remote_disable_url: Option<String>,
    log_level: Option<String>,
    storage_path: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[host]
# version = "1.0.0"

[remote_disable]
# base_url = "https://updates.example.org"
timeout_ms = 10000
refresh_on_startup = true

[logging]
level = "info"

[event_bus]
channel_capacity = 256

[storage]
# path = "~/.local/share/gocp/gocp.db"
"#;

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "gocp", "gocp")
}

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.config_dir().join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

/// Return the default on-disk location of the module store.
pub fn data_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.data_dir().join("gocp.db"),
        None => PathBuf::from("gocp.db"),
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. A missing file is created with
/// defaults and the defaults are returned.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path.as_ref(), config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(path)?;
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(error) => return Err(ConfigError::Io(error)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        version: std::env::var("GOCP_VERSION").ok(),
        remote_disable_url: std::env::var("GOCP_REMOTE_DISABLE_URL").ok(),
        log_level: std::env::var("GOCP_LOG_LEVEL").ok(),
        storage_path: std::env::var("GOCP_STORAGE_PATH").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(version) = overrides.version {
        config.host.version = version;
    }
    if let Some(url) = overrides.remote_disable_url {
        config.remote_disable.base_url = Some(url);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    if let Some(path) = overrides.storage_path {
        config.storage.path = Some(path);
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    config.host.version()?;

    if let Some(base_url) = &config.remote_disable.base_url {
        let parsed = url::Url::parse(base_url).map_err(|error| ConfigError::InvalidValue {
            field: "remote_disable.base_url".to_string(),
            message: error.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                field: "remote_disable.base_url".to_string(),
                message: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
    }

    if config.remote_disable.timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "remote_disable.timeout_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.event_bus.channel_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "event_bus.channel_capacity".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    tracing::info!(path = %path.display(), "wrote default configuration");
    Ok(())
}
