//! Remotely delivered kill switch.
//!
//! The disable list is fetched from `<base>/remote-disable/remote-disable.json`
//! and cached in the versioned store. Every failure leaves the previous cache
//! in place, and anything that cannot be read or evaluated counts as "not
//! disabled".

use std::time::Duration;

use gocp_core::config::RemoteDisableConfig;
use gocp_storage::{Database, StoreError, VersionedStore};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::version_range::VersionRange;

pub const REMOTE_DISABLE_KEY: &str = "remote_disable";
pub const REMOTE_DISABLE_SCHEMA_VERSION: u32 = 1;
const LIST_PATH: &str = "remote-disable/remote-disable.json";
const USER_AGENT: &str = concat!("gocp/", env!("CARGO_PKG_VERSION"));

/// One row of the disable list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisablementEntry {
    #[serde(alias = "guid")]
    pub id: String,
    /// `None` when the list omits the range; such an entry disables nothing.
    #[serde(alias = "extensionVersion", default, skip_serializing_if = "Option::is_none")]
    pub version_range: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct DisableList {
    disabled: Vec<DisablementEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Allowed,
    Disabled { message: String },
}

impl RemoteStatus {
    pub fn is_disabled(&self) -> bool {
        matches!(self, RemoteStatus::Disabled { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            RemoteStatus::Disabled { message } => Some(message),
            RemoteStatus::Allowed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The cache now holds this many entries.
    Updated { entries: usize },
    /// No base URL is configured.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("disable list from {url} is malformed: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to cache disable list: {0}")]
    Store(#[from] StoreError),
}

struct Remote {
    http: reqwest::Client,
    list_url: String,
}

/// Decides from the cached disable list whether a module may run on the
/// current host version.
pub struct KillSwitch<D: Database> {
    store: VersionedStore<D>,
    current_version: Version,
    remote: Option<Remote>,
}

impl<D: Database> KillSwitch<D> {
    /// A kill switch that only reads the cache. [`KillSwitch::refresh`] is a
    /// no-op until a remote is attached.
    pub fn new(store: VersionedStore<D>, current_version: Version) -> Self {
        Self {
            store,
            current_version,
            remote: None,
        }
    }

    pub fn with_remote(mut self, base_url: &str, timeout: Duration) -> Result<Self, RefreshError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(RefreshError::Client)?;

        self.remote = Some(Remote {
            http,
            list_url: format!("{}/{LIST_PATH}", base_url.trim_end_matches('/')),
        });
        Ok(self)
    }

    pub fn from_config(
        store: VersionedStore<D>,
        current_version: Version,
        config: &RemoteDisableConfig,
    ) -> Result<Self, RefreshError> {
        let kill_switch = Self::new(store, current_version);
        match &config.base_url {
            Some(base_url) => {
                kill_switch.with_remote(base_url, Duration::from_millis(config.timeout_ms))
            }
            None => Ok(kill_switch),
        }
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    pub fn list_url(&self) -> Option<&str> {
        self.remote.as_ref().map(|remote| remote.list_url.as_str())
    }

    /// Fetch the disable list and replace the cache with it.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let Some(remote) = &self.remote else {
            debug!("no remote disable url configured, skipping refresh");
            return Ok(RefreshOutcome::Skipped);
        };

        let entries = match fetch(remote).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(url = %remote.list_url, %error, "remote disable refresh failed, keeping cached list");
                return Err(error);
            }
        };

        self.store
            .set(REMOTE_DISABLE_KEY, &entries, REMOTE_DISABLE_SCHEMA_VERSION)
            .await
            .inspect_err(|error| warn!(%error, "failed to cache remote disable list"))?;

        info!(url = %remote.list_url, entries = entries.len(), "remote disable list refreshed");
        Ok(RefreshOutcome::Updated {
            entries: entries.len(),
        })
    }

    /// The cached list; empty when never fetched or written by another schema.
    pub async fn cached_entries(&self) -> Result<Vec<DisablementEntry>, StoreError> {
        Ok(self
            .store
            .get::<Vec<DisablementEntry>>(REMOTE_DISABLE_KEY, REMOTE_DISABLE_SCHEMA_VERSION)
            .await?
            .unwrap_or_default())
    }

    pub async fn status_of(&self, module_id: &str) -> Result<RemoteStatus, StoreError> {
        let entries = self.cached_entries().await?;
        Ok(evaluate(&entries, module_id, &self.current_version))
    }
}

async fn fetch(remote: &Remote) -> Result<Vec<DisablementEntry>, RefreshError> {
    let url = &remote.list_url;
    let response = remote
        .http
        .get(url)
        .send()
        .await
        .map_err(|source| RefreshError::Transport {
            url: url.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(RefreshError::Status {
            url: url.clone(),
            status: status.as_u16(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|source| RefreshError::Transport {
            url: url.clone(),
            source,
        })?;
    let list: DisableList =
        serde_json::from_slice(&body).map_err(|source| RefreshError::Decode {
            url: url.clone(),
            source,
        })?;

    Ok(list.disabled)
}

/// Status of `module_id` under `entries` for a host running `version`.
///
/// Only the first entry naming the module is consulted. An entry whose
/// range is missing or cannot be parsed does not disable anything.
pub fn evaluate(entries: &[DisablementEntry], module_id: &str, version: &Version) -> RemoteStatus {
    let Some(entry) = entries.iter().find(|entry| entry.id == module_id) else {
        return RemoteStatus::Allowed;
    };
    let Some(raw_range) = entry.version_range.as_deref() else {
        warn!(module_id, "ignoring disable entry without a version range");
        return RemoteStatus::Allowed;
    };

    match VersionRange::parse(raw_range) {
        Ok(range) if range.matches(version) => RemoteStatus::Disabled {
            message: entry.message.clone(),
        },
        Ok(_) => RemoteStatus::Allowed,
        Err(error) => {
            warn!(module_id, %error, "ignoring disable entry with unusable version range");
            RemoteStatus::Allowed
        }
    }
}
