use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::select_all;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Top-level routing domain of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Domain {
    /// Host process lifecycle and kill-switch housekeeping.
    System,
    /// The patched page: navigation and content swaps.
    Page,
    /// User-facing module settings.
    Settings,
    /// Module lifecycle transitions.
    Module,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::System, Domain::Page, Domain::Settings, Domain::Module];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::System => "system",
            Domain::Page => "page",
            Domain::Settings => "settings",
            Domain::Module => "module",
        }
    }

    pub fn parse(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|domain| domain.as_str() == segment)
    }
}

/// Hierarchical channel name, e.g. `page.navigated` or `module.activated`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Lowercase dot-separated segments of `a-z`, `0-9` and `_`, led by a known domain.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        name.split('.').next().and_then(Domain::parse).is_some()
    }

    pub fn domain(&self) -> Domain {
        self.0
            .split('.')
            .next()
            .and_then(Domain::parse)
            .unwrap_or(Domain::System)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    /// Links follow-up events (e.g. a refresh result) to the request that caused them.
    pub correlation_id: Option<Uuid>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core host component, named.
    System(String),
    /// The embedding page (navigation, mutation batches).
    Host,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System ────────────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },
    RemoteDisableRefreshRequested,
    RemoteDisableRefreshed {
        entries: usize,
    },
    RemoteDisableRefreshFailed {
        reason: String,
    },

    // ── Page ──────────────────────────────────────────────────────
    PageNavigated {
        url: String,
    },

    // ── Settings ──────────────────────────────────────────────────
    /// `module_id` is `None` when several modules changed at once.
    SettingsChanged {
        module_id: Option<String>,
    },

    // ── Module lifecycle ──────────────────────────────────────────
    ModuleActivated {
        module_id: String,
    },
    ModuleDeactivated {
        module_id: String,
    },
    ModuleSuppressed {
        module_id: String,
        reason: String,
    },
    ModuleFailed {
        module_id: String,
        phase: String,
        error: String,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// One tokio broadcast channel per [`Domain`].
#[derive(Clone)]
pub struct BroadcastEventBus {
    senders: BTreeMap<Domain, broadcast::Sender<Event>>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let senders = Domain::ALL
            .into_iter()
            .map(|domain| (domain, broadcast::channel(capacity).0))
            .collect();

        Self { senders }
    }

    fn domains_for_pattern(pattern: &str) -> Result<Vec<Domain>, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(Domain::ALL.to_vec());
        }

        Domain::parse(first_segment)
            .map(|domain| vec![domain])
            .ok_or_else(|| EventBusError::InvalidPattern(pattern.to_string()))
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .senders
            .get(&event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // No receivers is not an error.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = Self::domains_for_pattern(pattern)?
            .into_iter()
            .filter_map(|domain| self.senders.get(&domain))
            .map(broadcast::Sender::subscribe)
            .collect();

        Ok(EventSubscription { matcher, receivers })
    }
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: Vec<broadcast::Receiver<Event>>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let received = {
                let pending = self
                    .receivers
                    .iter_mut()
                    .map(|receiver| Box::pin(receiver.recv()));
                select_all(pending).await.0
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '!'))
}
