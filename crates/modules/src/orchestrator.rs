//! Drives every registered module through its lifecycle.
//!
//! A pass asks the kill switch and the user's settings about each module and
//! activates, keeps, restarts or deactivates it accordingly. Hooks run inside
//! their own failure boundary: an error or panic in one module is recorded
//! and never stops the rest of the pass.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use gocp_core::config::{Config, ConfigError};
use gocp_core::event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventSource, EventSubscription,
};
use gocp_core::EventBusError;
use gocp_storage::{Database, VersionedStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::descriptor::{HookResult, ModuleDescriptor, ResolvedOptions, Suboption};
use crate::ledger::{Ledger, panic_message};
use crate::registry::ModuleRegistry;
use crate::remote_disable::{KillSwitch, RefreshError, RefreshOutcome, RemoteStatus};
use crate::settings::{ModuleSettings, SettingsStore};

const SOURCE: &str = "orchestrator";

/// What caused a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    SettingsChanged,
    RemoteDisableRefreshed,
    /// The page the modules patched was replaced; active modules restart.
    Navigation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    RemoteDisabled { message: String },
    UserDisabled,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressReason::RemoteDisabled { message } if message.is_empty() => {
                f.write_str("remotely disabled")
            }
            SuppressReason::RemoteDisabled { message } => write!(f, "remotely disabled: {message}"),
            SuppressReason::UserDisabled => f.write_str("disabled by user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePhase {
    Registered,
    Evaluating,
    Suppressed(SuppressReason),
    Active,
    Deactivating,
    /// A hook failed during the last pass.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Init,
    Activate,
    Deactivate,
    Dispose,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPhase::Init => "init",
            HookPhase::Activate => "activate",
            HookPhase::Deactivate => "deactivate",
            HookPhase::Dispose => "dispose",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("module {module_id} failed during {phase}: {reason}")]
pub struct ActivationFailure {
    pub module_id: String,
    pub phase: HookPhase,
    pub reason: String,
}

/// Why an orchestrator could not be built from configuration.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up the kill switch: {0}")]
    KillSwitch(#[from] RefreshError),
}

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub activated: Vec<String>,
    pub deactivated: Vec<String>,
    pub suppressed: Vec<String>,
    pub failures: Vec<ActivationFailure>,
}

impl PassReport {
    fn merge(&mut self, other: PassReport) {
        self.activated.extend(other.activated);
        self.deactivated.extend(other.deactivated);
        self.suppressed.extend(other.suppressed);
        self.failures.extend(other.failures);
    }
}

/// Read-only view of a module's runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleStatus {
    pub id: String,
    pub phase: ModulePhase,
    pub initialized: bool,
    pub active: bool,
    pub options: Option<ResolvedOptions>,
    pub last_failure: Option<ActivationFailure>,
}

/// One row of the settings surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsEntry {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub default_enabled: bool,
    pub suboptions: BTreeMap<String, Suboption>,
    /// The user's explicit choice, if any.
    pub user_enabled: Option<bool>,
    pub enabled: bool,
    pub options: ResolvedOptions,
    pub active: bool,
    /// Shown instead of the toggle while the kill switch applies.
    pub remote_disabled: Option<String>,
}

enum Decision {
    Suppress(SuppressReason),
    Enable(ResolvedOptions),
}

struct RuntimeState {
    descriptor: Arc<ModuleDescriptor>,
    phase: ModulePhase,
    initialized: bool,
    init_failed: bool,
    ledger: Option<Ledger>,
    options: Option<ResolvedOptions>,
    last_failure: Option<ActivationFailure>,
}

impl RuntimeState {
    fn new(descriptor: Arc<ModuleDescriptor>) -> Self {
        Self {
            descriptor,
            phase: ModulePhase::Registered,
            initialized: false,
            init_failed: false,
            ledger: None,
            options: None,
            last_failure: None,
        }
    }

    fn id(&self) -> &str {
        self.descriptor.id()
    }

    fn is_active(&self) -> bool {
        self.ledger.is_some()
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            id: self.id().to_string(),
            phase: self.phase.clone(),
            initialized: self.initialized,
            active: self.is_active(),
            options: self.options.clone(),
            last_failure: self.last_failure.clone(),
        }
    }
}

/// Owns the runtime state of every registered module.
///
/// Passes are serialized. Hooks run synchronously while the pass holds the
/// state, so they must not wait on the orchestrator.
pub struct Orchestrator<D: Database> {
    registry: Arc<ModuleRegistry>,
    kill_switch: KillSwitch<D>,
    settings: SettingsStore<D>,
    bus: Option<Arc<dyn EventBus>>,
    refresh_on_startup: bool,
    states: Mutex<Vec<RuntimeState>>,
}

impl<D: Database> Orchestrator<D> {
    pub fn new(
        registry: impl Into<Arc<ModuleRegistry>>,
        kill_switch: KillSwitch<D>,
        settings: SettingsStore<D>,
    ) -> Self {
        let registry = registry.into();
        let states = registry.iter().cloned().map(RuntimeState::new).collect();
        Self {
            registry,
            kill_switch,
            settings,
            bus: None,
            refresh_on_startup: true,
            states: Mutex::new(states),
        }
    }

    /// Wire the kill switch, settings and a fresh event bus from `config`,
    /// all backed by `store`.
    pub fn from_config(
        registry: impl Into<Arc<ModuleRegistry>>,
        store: VersionedStore<D>,
        config: &Config,
    ) -> Result<Self, SetupError> {
        let kill_switch =
            KillSwitch::from_config(store.clone(), config.host.version()?, &config.remote_disable)?;
        let bus = Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));

        Ok(Self::new(registry, kill_switch, SettingsStore::new(store))
            .with_event_bus(bus)
            .refresh_on_startup(config.remote_disable.refresh_on_startup))
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn refresh_on_startup(mut self, refresh: bool) -> Self {
        self.refresh_on_startup = refresh;
        self
    }

    pub fn event_bus(&self) -> Option<&Arc<dyn EventBus>> {
        self.bus.as_ref()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn kill_switch(&self) -> &KillSwitch<D> {
        &self.kill_switch
    }

    pub fn settings(&self) -> &SettingsStore<D> {
        &self.settings
    }

    /// Refresh the kill switch when configured to, then run the startup pass.
    pub async fn start(&self) -> PassReport {
        if self.refresh_on_startup {
            self.refresh_kill_switch(None).await;
        }
        let report = self.run_pass(Trigger::Startup).await;
        self.publish("system.startup.complete", EventPayload::StartupComplete);
        report
    }

    /// Fetch the disable list and re-evaluate every module against it.
    pub async fn refresh_remote_disable(&self) -> PassReport {
        self.refresh_and_evaluate(None).await
    }

    async fn refresh_and_evaluate(&self, request: Option<Uuid>) -> PassReport {
        self.refresh_kill_switch(request).await;
        self.run_pass(Trigger::RemoteDisableRefreshed).await
    }

    pub async fn run_pass(&self, trigger: Trigger) -> PassReport {
        let mut states = self.states.lock().await;
        let mut report = PassReport::default();

        for state in states.iter_mut() {
            let previous = state.phase.clone();
            if !matches!(previous, ModulePhase::Active) {
                state.phase = ModulePhase::Evaluating;
            }
            let decision = self.decide(&state.descriptor).await;
            self.apply(state, &previous, decision, trigger, &mut report);
        }

        info!(
            ?trigger,
            activated = report.activated.len(),
            deactivated = report.deactivated.len(),
            suppressed = report.suppressed.len(),
            failures = report.failures.len(),
            "module pass complete"
        );
        report
    }

    /// Deactivate every active module.
    pub async fn shutdown(&self) -> PassReport {
        let mut states = self.states.lock().await;
        let mut report = PassReport::default();
        for state in states.iter_mut().filter(|state| state.is_active()) {
            self.deactivate(state, &mut report);
        }
        info!(deactivated = report.deactivated.len(), "modules shut down");
        report
    }

    /// Run the startup sequence, then follow bus events until shutdown is
    /// requested or the bus closes.
    ///
    /// `events` should match every channel (`**`) and be created before any
    /// of the events it must see are published.
    pub async fn drive(&self, mut events: EventSubscription) -> PassReport {
        let mut report = self.start().await;

        loop {
            match events.recv().await {
                Ok(Event { id, payload, .. }) => match payload {
                    EventPayload::PageNavigated { url } => {
                        debug!(%url, "page navigated");
                        report.merge(self.run_pass(Trigger::Navigation).await);
                    }
                    EventPayload::SettingsChanged { module_id } => {
                        debug!(?module_id, "settings changed");
                        report.merge(self.run_pass(Trigger::SettingsChanged).await);
                    }
                    EventPayload::RemoteDisableRefreshRequested => {
                        report.merge(self.refresh_and_evaluate(Some(id)).await);
                    }
                    EventPayload::ShutdownRequested { reason } => {
                        info!(%reason, "shutdown requested");
                        report.merge(self.shutdown().await);
                        return report;
                    }
                    _ => {}
                },
                Err(EventBusError::Lagged(missed)) => {
                    warn!(missed, "event subscription lagged, re-evaluating all modules");
                    report.merge(self.run_pass(Trigger::SettingsChanged).await);
                }
                Err(error) => {
                    info!(%error, "event bus closed");
                    report.merge(self.shutdown().await);
                    return report;
                }
            }
        }
    }

    pub async fn module_status(&self, module_id: &str) -> Option<ModuleStatus> {
        self.states
            .lock()
            .await
            .iter()
            .find(|state| state.id() == module_id)
            .map(RuntimeState::status)
    }

    pub async fn statuses(&self) -> Vec<ModuleStatus> {
        self.states.lock().await.iter().map(RuntimeState::status).collect()
    }

    pub async fn active_modules(&self) -> Vec<String> {
        self.states
            .lock()
            .await
            .iter()
            .filter(|state| state.is_active())
            .map(|state| state.id().to_string())
            .collect()
    }

    /// Metadata and current choices for every module the settings surface lists.
    pub async fn settings_view(&self) -> Vec<SettingsEntry> {
        let active: Vec<String> = self.active_modules().await;
        let mut entries = Vec::new();

        for descriptor in self.registry.settings_entries() {
            let id = descriptor.id();
            let settings = self.read_settings(id).await;
            let remote = self.read_remote_status(id).await;

            entries.push(SettingsEntry {
                id: id.to_string(),
                display_name: descriptor.display_name().to_string(),
                description: descriptor.description().map(str::to_string),
                default_enabled: descriptor.default_enabled(),
                suboptions: descriptor.suboptions().clone(),
                user_enabled: settings.enabled,
                enabled: settings.enabled_or(descriptor.default_enabled()),
                options: descriptor.resolve_options(&settings.options),
                active: active.iter().any(|active_id| active_id == id),
                remote_disabled: remote.message().map(str::to_string),
            });
        }

        entries
    }

    /// Refresh and announce the result, linked to `request` when a bus event
    /// asked for it.
    async fn refresh_kill_switch(&self, request: Option<Uuid>) {
        match self.kill_switch.refresh().await {
            Ok(RefreshOutcome::Updated { entries }) => self.publish_correlated(
                "system.remote_disable.refreshed",
                EventPayload::RemoteDisableRefreshed { entries },
                request,
            ),
            Ok(RefreshOutcome::Skipped) => {}
            Err(error) => self.publish_correlated(
                "system.remote_disable.refresh_failed",
                EventPayload::RemoteDisableRefreshFailed {
                    reason: error.to_string(),
                },
                request,
            ),
        }
    }

    async fn read_remote_status(&self, module_id: &str) -> RemoteStatus {
        self.kill_switch
            .status_of(module_id)
            .await
            .unwrap_or_else(|error| {
                warn!(module_id, %error, "could not read disable list, treating module as allowed");
                RemoteStatus::Allowed
            })
    }

    async fn read_settings(&self, module_id: &str) -> ModuleSettings {
        self.settings.get(module_id).await.unwrap_or_else(|error| {
            warn!(module_id, %error, "could not read module settings, using defaults");
            ModuleSettings::default()
        })
    }

    async fn decide(&self, descriptor: &ModuleDescriptor) -> Decision {
        let id = descriptor.id();
        if let RemoteStatus::Disabled { message } = self.read_remote_status(id).await {
            return Decision::Suppress(SuppressReason::RemoteDisabled { message });
        }

        let settings = self.read_settings(id).await;
        if !settings.enabled_or(descriptor.default_enabled()) {
            return Decision::Suppress(SuppressReason::UserDisabled);
        }

        Decision::Enable(descriptor.resolve_options(&settings.options))
    }

    fn apply(
        &self,
        state: &mut RuntimeState,
        previous: &ModulePhase,
        decision: Decision,
        trigger: Trigger,
        report: &mut PassReport,
    ) {
        match decision {
            Decision::Suppress(reason) => {
                // Already suppressed for the same reason: nothing to report.
                let unchanged =
                    matches!(previous, ModulePhase::Suppressed(prior) if *prior == reason);
                if state.is_active() {
                    self.deactivate(state, report);
                }
                if !unchanged {
                    debug!(module_id = state.id(), %reason, "module suppressed");
                    report.suppressed.push(state.id().to_string());
                    self.publish(
                        "module.suppressed",
                        EventPayload::ModuleSuppressed {
                            module_id: state.id().to_string(),
                            reason: reason.to_string(),
                        },
                    );
                }
                state.phase = ModulePhase::Suppressed(reason);
            }
            Decision::Enable(options) => {
                if state.init_failed {
                    state.phase = ModulePhase::Failed;
                    return;
                }
                if state.is_active() {
                    let restart = trigger == Trigger::Navigation
                        || state.options.as_ref() != Some(&options);
                    if !restart {
                        state.phase = ModulePhase::Active;
                        return;
                    }
                    self.deactivate(state, report);
                }
                self.activate(state, options, report);
            }
        }
    }

    fn activate(&self, state: &mut RuntimeState, options: ResolvedOptions, report: &mut PassReport) {
        let descriptor = Arc::clone(&state.descriptor);

        if !state.initialized {
            match run_hook(|| descriptor.run_init()) {
                Ok(()) => state.initialized = true,
                Err(reason) => {
                    state.init_failed = true;
                    self.fail(state, HookPhase::Init, reason, report);
                    return;
                }
            }
        }

        let ledger = Ledger::new(descriptor.id());
        match run_hook(|| descriptor.run_activate(&options, &ledger)) {
            Ok(()) => {
                debug!(module_id = descriptor.id(), resources = ledger.len(), "module activated");
                state.ledger = Some(ledger);
                state.options = Some(options);
                state.phase = ModulePhase::Active;
                report.activated.push(descriptor.id().to_string());
                self.publish(
                    "module.activated",
                    EventPayload::ModuleActivated {
                        module_id: descriptor.id().to_string(),
                    },
                );
            }
            Err(reason) => {
                if let Err(error) = ledger.dispose() {
                    warn!(module_id = descriptor.id(), %error, "cleanup after failed activation was incomplete");
                }
                self.fail(state, HookPhase::Activate, reason, report);
            }
        }
    }

    fn deactivate(&self, state: &mut RuntimeState, report: &mut PassReport) {
        let Some(ledger) = state.ledger.take() else {
            return;
        };
        state.phase = ModulePhase::Deactivating;

        let descriptor = Arc::clone(&state.descriptor);
        if let Err(reason) = run_hook(|| descriptor.run_deactivate()) {
            self.fail(state, HookPhase::Deactivate, reason, report);
        }
        if let Err(error) = ledger.dispose() {
            self.fail(state, HookPhase::Dispose, error.to_string(), report);
        }

        state.options = None;
        state.phase = ModulePhase::Evaluating;
        report.deactivated.push(descriptor.id().to_string());
        debug!(module_id = descriptor.id(), "module deactivated");
        self.publish(
            "module.deactivated",
            EventPayload::ModuleDeactivated {
                module_id: descriptor.id().to_string(),
            },
        );
    }

    fn fail(&self, state: &mut RuntimeState, phase: HookPhase, reason: String, report: &mut PassReport) {
        let failure = ActivationFailure {
            module_id: state.id().to_string(),
            phase,
            reason,
        };
        warn!(module_id = state.id(), %phase, reason = %failure.reason, "module hook failed");

        self.publish(
            "module.failed",
            EventPayload::ModuleFailed {
                module_id: failure.module_id.clone(),
                phase: phase.to_string(),
                error: failure.reason.clone(),
            },
        );
        if !matches!(phase, HookPhase::Deactivate | HookPhase::Dispose) {
            state.phase = ModulePhase::Failed;
        }
        state.last_failure = Some(failure.clone());
        report.failures.push(failure);
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        self.publish_correlated(channel, payload, None);
    }

    fn publish_correlated(&self, channel: &str, payload: EventPayload, correlation: Option<Uuid>) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Ok(channel) = Channel::new(channel) {
            let mut event = Event::new(channel, EventSource::System(SOURCE.to_string()), payload);
            if let Some(correlation) = correlation {
                event = event.with_correlation(correlation);
            }
            let _ = bus.publish(event);
        }
    }
}

fn run_hook<F>(hook: F) -> Result<(), String>
where
    F: FnOnce() -> HookResult,
{
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(error.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use gocp_test_support::fixtures;
    use gocp_storage::{NativeDatabase, VersionedStore};
    use gocp_test_support::store::{UnavailableDatabase, temp_store};
    use semver::Version;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::timeout;
    use tracing_test::traced_test;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::descriptor::Suboption;
    use crate::registry::RegistryBuilder;
    use crate::remote_disable::{
        DisablementEntry, REMOTE_DISABLE_KEY, REMOTE_DISABLE_SCHEMA_VERSION,
    };

    /// Counts what the orchestrator did to one module.
    #[derive(Default)]
    struct Counters {
        inits: AtomicUsize,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        removals: AtomicUsize,
        fail_init: AtomicBool,
        fail_activate: AtomicBool,
        panic_activate: AtomicBool,
    }

    impl Counters {
        fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    fn counted(id: &str, counters: &Arc<Counters>) -> ModuleDescriptor {
        counted_with(ModuleDescriptor::builder(id, id), counters)
    }

    fn counted_with(
        builder: crate::descriptor::ModuleDescriptorBuilder,
        counters: &Arc<Counters>,
    ) -> ModuleDescriptor {
        let init_counters = Arc::clone(counters);
        let activate_counters = Arc::clone(counters);
        let deactivate_counters = Arc::clone(counters);
        builder
            .on_init(move || {
                init_counters.inits.fetch_add(1, Ordering::SeqCst);
                if init_counters.fail_init.load(Ordering::SeqCst) {
                    return Err("init exploded".into());
                }
                Ok(())
            })
            .on_activate(move |_, ledger| {
                activate_counters.activations.fetch_add(1, Ordering::SeqCst);
                let removal_counters = Arc::clone(&activate_counters);
                ledger.defer(move || {
                    removal_counters.removals.fetch_add(1, Ordering::SeqCst);
                })?;
                if activate_counters.panic_activate.load(Ordering::SeqCst) {
                    panic!("selector not found");
                }
                if activate_counters.fail_activate.load(Ordering::SeqCst) {
                    return Err("page layout changed".into());
                }
                Ok(())
            })
            .on_deactivate(move || {
                deactivate_counters.deactivations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
    }

    struct Harness {
        orchestrator: Orchestrator<NativeDatabase>,
        store: VersionedStore<NativeDatabase>,
        _dir: TempDir,
    }

    async fn harness(modules: Vec<ModuleDescriptor>, version: &str) -> Harness {
        let (store, dir) = temp_store().await;
        let mut builder = RegistryBuilder::new();
        for module in modules {
            builder.register(module).unwrap();
        }
        let orchestrator = Orchestrator::new(
            builder.freeze(),
            KillSwitch::new(store.clone(), Version::parse(version).unwrap()),
            SettingsStore::new(store.clone()),
        );
        Harness {
            orchestrator,
            store,
            _dir: dir,
        }
    }

    async fn cache_disable_list(store: &VersionedStore<NativeDatabase>, entries: &[(&str, &str, &str)]) {
        let entries: Vec<DisablementEntry> = entries
            .iter()
            .map(|(id, range, message)| DisablementEntry {
                id: id.to_string(),
                version_range: Some(range.to_string()),
                message: message.to_string(),
            })
            .collect();
        store
            .set(REMOTE_DISABLE_KEY, &entries, REMOTE_DISABLE_SCHEMA_VERSION)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn startup_activates_modules_enabled_by_default() {
        let on = Arc::new(Counters::default());
        let off = Arc::new(Counters::default());
        let h = harness(
            vec![
                counted("{on}", &on),
                counted_with(ModuleDescriptor::builder("{off}", "Off").default_enabled(false), &off),
            ],
            "1.0.0",
        )
        .await;

        let report = h.orchestrator.start().await;
        assert_eq!(report.activated, ["{on}"]);
        assert_eq!(report.suppressed, ["{off}"]);
        assert_eq!(Counters::count(&on.inits), 1);
        assert_eq!(Counters::count(&off.inits), 0);

        let status = h.orchestrator.module_status("{off}").await.unwrap();
        assert_eq!(status.phase, ModulePhase::Suppressed(SuppressReason::UserDisabled));
    }

    #[tokio::test]
    async fn disabling_disposes_and_reenabling_skips_init() {
        let counters = Arc::new(Counters::default());
        let h = harness(vec![counted("{m}", &counters)], "1.0.0").await;
        h.orchestrator.start().await;

        let settings = h.orchestrator.settings();
        for _ in 0..2 {
            settings.set_enabled("{m}", false).await.unwrap();
            let report = h.orchestrator.run_pass(Trigger::SettingsChanged).await;
            assert_eq!(report.deactivated, ["{m}"]);

            settings.set_enabled("{m}", true).await.unwrap();
            let report = h.orchestrator.run_pass(Trigger::SettingsChanged).await;
            assert_eq!(report.activated, ["{m}"]);
        }

        assert_eq!(Counters::count(&counters.inits), 1);
        assert_eq!(Counters::count(&counters.activations), 3);
        assert_eq!(Counters::count(&counters.deactivations), 2);
        assert_eq!(Counters::count(&counters.removals), 2);
    }

    #[tokio::test]
    async fn unchanged_settings_keep_module_running() {
        let counters = Arc::new(Counters::default());
        let h = harness(vec![counted("{m}", &counters)], "1.0.0").await;
        h.orchestrator.start().await;

        let report = h.orchestrator.run_pass(Trigger::SettingsChanged).await;
        assert_eq!(report, PassReport::default());
        assert_eq!(Counters::count(&counters.activations), 1);
    }

    #[tokio::test]
    async fn option_change_restarts_with_new_options() {
        let counters = Arc::new(Counters::default());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let counted = Arc::clone(&counters);
        let module = ModuleDescriptor::builder("{grades}", "Grades")
            .suboption("precision", Suboption::number("Decimal places", 2.0))
            .on_activate(move |options, _| {
                counted.activations.fetch_add(1, Ordering::SeqCst);
                sink.lock().unwrap().push(options.number("precision"));
                Ok(())
            })
            .build();
        let h = harness(vec![module], "1.0.0").await;
        h.orchestrator.start().await;

        h.orchestrator
            .settings()
            .set_option("{grades}", "precision", json!(0))
            .await
            .unwrap();
        let report = h.orchestrator.run_pass(Trigger::SettingsChanged).await;

        assert_eq!(report.deactivated, ["{grades}"]);
        assert_eq!(report.activated, ["{grades}"]);
        assert_eq!(*seen.lock().unwrap(), [Some(2.0), Some(0.0)]);
    }

    #[tokio::test]
    async fn navigation_restarts_active_modules() {
        let counters = Arc::new(Counters::default());
        let h = harness(vec![counted("{m}", &counters)], "1.0.0").await;
        h.orchestrator.start().await;

        h.orchestrator.run_pass(Trigger::Navigation).await;
        assert_eq!(Counters::count(&counters.activations), 2);
        assert_eq!(Counters::count(&counters.removals), 1);
        assert_eq!(Counters::count(&counters.inits), 1);
    }

    #[tokio::test]
    async fn remote_disable_suppresses_before_init() {
        let counters = Arc::new(Counters::default());
        let h = harness(vec![counted("{m}", &counters)], "1.1.0").await;
        cache_disable_list(&h.store, &[("{m}", "<=1.2.0", "Broken on this version")]).await;

        let report = h.orchestrator.start().await;
        assert_eq!(report.suppressed, ["{m}"]);
        assert_eq!(Counters::count(&counters.inits), 0);

        let status = h.orchestrator.module_status("{m}").await.unwrap();
        assert_matches!(
            status.phase,
            ModulePhase::Suppressed(SuppressReason::RemoteDisabled { message }) if message == "Broken on this version"
        );

        let view = h.orchestrator.settings_view().await;
        assert_eq!(view[0].remote_disabled.as_deref(), Some("Broken on this version"));
        assert!(!view[0].active);
    }

    #[tokio::test]
    async fn remote_disable_refresh_deactivates_running_module() {
        let counters = Arc::new(Counters::default());
        let h = harness(vec![counted("{m}", &counters)], "1.1.0").await;
        h.orchestrator.start().await;

        cache_disable_list(&h.store, &[("{m}", "*", "")]).await;
        let report = h.orchestrator.refresh_remote_disable().await;

        assert_eq!(report.deactivated, ["{m}"]);
        assert_eq!(Counters::count(&counters.removals), 1);
        assert!(h.orchestrator.active_modules().await.is_empty());
    }

    #[tokio::test]
    async fn init_failure_is_permanent() {
        let counters = Arc::new(Counters::default());
        counters.fail_init.store(true, Ordering::SeqCst);
        let h = harness(vec![counted("{m}", &counters)], "1.0.0").await;

        let report = h.orchestrator.start().await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].phase, HookPhase::Init);

        counters.fail_init.store(false, Ordering::SeqCst);
        h.orchestrator.run_pass(Trigger::SettingsChanged).await;
        h.orchestrator.run_pass(Trigger::Navigation).await;

        assert_eq!(Counters::count(&counters.inits), 1);
        assert_eq!(Counters::count(&counters.activations), 0);
        let status = h.orchestrator.module_status("{m}").await.unwrap();
        assert_eq!(status.phase, ModulePhase::Failed);
        assert!(!status.initialized);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_activation_disposes_partial_ledger_and_spares_others() {
        let broken = Arc::new(Counters::default());
        broken.fail_activate.store(true, Ordering::SeqCst);
        let healthy = Arc::new(Counters::default());
        let h = harness(vec![counted("{broken}", &broken), counted("{healthy}", &healthy)], "1.0.0").await;

        let report = h.orchestrator.start().await;
        assert_eq!(report.activated, ["{healthy}"]);
        assert_eq!(
            report.failures,
            [ActivationFailure {
                module_id: "{broken}".to_string(),
                phase: HookPhase::Activate,
                reason: "page layout changed".to_string(),
            }]
        );
        assert_eq!(Counters::count(&broken.removals), 1);
        assert!(logs_contain("module hook failed"));

        broken.fail_activate.store(false, Ordering::SeqCst);
        let report = h.orchestrator.run_pass(Trigger::SettingsChanged).await;
        assert_eq!(report.activated, ["{broken}"]);
        assert_eq!(Counters::count(&broken.inits), 1);
    }

    #[tokio::test]
    async fn panicking_activate_is_isolated() {
        let broken = Arc::new(Counters::default());
        broken.panic_activate.store(true, Ordering::SeqCst);
        let healthy = Arc::new(Counters::default());
        let h = harness(vec![counted("{broken}", &broken), counted("{healthy}", &healthy)], "1.0.0").await;

        let report = h.orchestrator.start().await;
        assert_eq!(report.activated, ["{healthy}"]);
        assert!(report.failures[0].reason.contains("selector not found"));
        assert_eq!(Counters::count(&broken.removals), 1);
    }

    #[tokio::test]
    async fn failing_deactivate_still_disposes() {
        let removals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removals);
        let module = ModuleDescriptor::builder("{m}", "M")
            .on_activate(move |_, ledger| {
                let counter = Arc::clone(&counter);
                ledger.defer(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })?;
                Ok(())
            })
            .on_deactivate(|| Err("teardown failed".into()))
            .build();
        let h = harness(vec![module], "1.0.0").await;
        h.orchestrator.start().await;

        let report = h.orchestrator.shutdown().await;
        assert_eq!(report.deactivated, ["{m}"]);
        assert_eq!(report.failures[0].phase, HookPhase::Deactivate);
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn storage_failures_fail_open() {
        let counters = Arc::new(Counters::default());
        let mut builder = RegistryBuilder::new();
        builder.register(counted("{m}", &counters)).unwrap();
        let store = UnavailableDatabase::store();
        let orchestrator = Orchestrator::new(
            builder.freeze(),
            KillSwitch::new(store.clone(), Version::new(1, 0, 0)),
            SettingsStore::new(store),
        );

        let report = orchestrator.start().await;
        assert_eq!(report.activated, ["{m}"]);
        assert!(logs_contain("treating module as allowed"));
        assert!(logs_contain("using defaults"));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut events = bus.subscribe("module.*").unwrap();
        let counters = Arc::new(Counters::default());
        let h = harness(vec![counted("{m}", &counters)], "1.0.0").await;
        let orchestrator = h.orchestrator.with_event_bus(bus.clone());

        orchestrator.start().await;
        orchestrator.shutdown().await;

        let activated = events.recv().await.unwrap();
        assert_eq!(activated.channel.as_str(), "module.activated");
        assert_eq!(
            activated.payload,
            EventPayload::ModuleActivated {
                module_id: "{m}".to_string()
            }
        );
        let deactivated = events.recv().await.unwrap();
        assert_eq!(deactivated.channel.as_str(), "module.deactivated");
    }

    #[tokio::test]
    async fn settings_view_lists_visible_modules_with_choices() {
        let counters = Arc::new(Counters::default());
        let h = harness(
            vec![
                counted_with(
                    ModuleDescriptor::builder("{grades}", "Grade Percentage")
                        .description("Show percentages next to grades")
                        .suboption("showLetter", Suboption::boolean("Show letter", true)),
                    &counters,
                ),
                counted_with(
                    ModuleDescriptor::builder("{internal}", "Internal").show_in_settings(false),
                    &counters,
                ),
            ],
            "1.0.0",
        )
        .await;
        h.orchestrator
            .settings()
            .set_option("{grades}", "showLetter", json!(false))
            .await
            .unwrap();
        h.orchestrator.start().await;

        let view = h.orchestrator.settings_view().await;
        assert_eq!(view.len(), 1);
        let grades = &view[0];
        assert_eq!(grades.display_name, "Grade Percentage");
        assert_eq!(grades.description.as_deref(), Some("Show percentages next to grades"));
        assert_eq!(grades.user_enabled, None);
        assert!(grades.enabled);
        assert!(grades.active);
        assert_eq!(grades.options.bool("showLetter"), Some(false));
        assert!(grades.remote_disabled.is_none());
    }

    #[tokio::test]
    async fn shutdown_deactivates_everything() {
        let first = Arc::new(Counters::default());
        let second = Arc::new(Counters::default());
        let h = harness(vec![counted("{a}", &first), counted("{b}", &second)], "1.0.0").await;
        h.orchestrator.start().await;

        let report = h.orchestrator.shutdown().await;
        assert_eq!(report.deactivated, ["{a}", "{b}"]);
        assert!(h.orchestrator.active_modules().await.is_empty());
        assert_eq!(Counters::count(&first.removals) + Counters::count(&second.removals), 2);
    }

    const HIDE_COMPLETED: &str = "{4d1a8b10-6c3e-4f0e-9a4e-2f1c6a0d9b71}";

    async fn disable_list_server(fixture: &str, expected_requests: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/remote-disable/remote-disable.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixtures::remote_disable(fixture)))
            .expect(expected_requests)
            .mount(&server)
            .await;
        server
    }

    fn host_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(Channel::new(channel).unwrap(), EventSource::Host, payload)
    }

    #[tokio::test]
    async fn repeated_suppression_is_reported_once() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut events = bus.subscribe("module.suppressed").unwrap();
        let counters = Arc::new(Counters::default());
        let h = harness(
            vec![counted_with(ModuleDescriptor::builder("{off}", "Off").default_enabled(false), &counters)],
            "1.0.0",
        )
        .await;
        let orchestrator = h.orchestrator.with_event_bus(bus.clone());

        assert_eq!(orchestrator.start().await.suppressed, ["{off}"]);
        for _ in 0..3 {
            let report = orchestrator.run_pass(Trigger::SettingsChanged).await;
            assert!(report.suppressed.is_empty());
        }
        let status = orchestrator.module_status("{off}").await.unwrap();
        assert_eq!(status.phase, ModulePhase::Suppressed(SuppressReason::UserDisabled));

        // A new reason is a change worth reporting.
        cache_disable_list(&h.store, &[("{off}", "*", "pulled")]).await;
        let report = orchestrator.run_pass(Trigger::RemoteDisableRefreshed).await;
        assert_eq!(report.suppressed, ["{off}"]);

        let reasons: Vec<EventPayload> = vec![
            events.recv().await.unwrap().payload,
            events.recv().await.unwrap().payload,
        ];
        assert_eq!(
            reasons,
            [
                EventPayload::ModuleSuppressed {
                    module_id: "{off}".to_string(),
                    reason: "disabled by user".to_string(),
                },
                EventPayload::ModuleSuppressed {
                    module_id: "{off}".to_string(),
                    reason: "remotely disabled: pulled".to_string(),
                },
            ]
        );
        assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());
        assert_eq!(Counters::count(&counters.inits), 0);
    }

    #[tokio::test]
    async fn from_config_refreshes_on_startup_when_asked() {
        let server = disable_list_server("disabled-list.json", 1).await;
        let (store, _dir) = temp_store().await;
        let counters = Arc::new(Counters::default());
        let mut builder = RegistryBuilder::new();
        builder.register(counted(HIDE_COMPLETED, &counters)).unwrap();

        let mut config = Config::default();
        config.host.version = "1.2.0".to_string();
        config.remote_disable.base_url = Some(server.uri());
        let orchestrator = Orchestrator::from_config(builder.freeze(), store, &config).unwrap();

        let report = orchestrator.start().await;
        assert_eq!(report.suppressed, [HIDE_COMPLETED]);
        assert_eq!(Counters::count(&counters.inits), 0);
    }

    #[tokio::test]
    async fn from_config_skips_startup_refresh_and_sizes_the_bus() {
        let server = disable_list_server("disabled-list.json", 0).await;
        let (store, _dir) = temp_store().await;
        let counters = Arc::new(Counters::default());
        let mut builder = RegistryBuilder::new();
        builder.register(counted(HIDE_COMPLETED, &counters)).unwrap();

        let mut config = Config::default();
        config.host.version = "1.2.0".to_string();
        config.remote_disable.base_url = Some(server.uri());
        config.remote_disable.refresh_on_startup = false;
        config.event_bus.channel_capacity = 2;
        let orchestrator = Orchestrator::from_config(builder.freeze(), store, &config).unwrap();
        let bus = orchestrator.event_bus().unwrap();
        let mut pages = bus.subscribe("page.**").unwrap();

        let report = orchestrator.start().await;
        assert_eq!(report.activated, [HIDE_COMPLETED]);

        for index in 0..5 {
            bus.publish(host_event(
                "page.navigated",
                EventPayload::PageNavigated {
                    url: format!("https://example.org/{index}"),
                },
            ))
            .unwrap();
        }
        assert_matches!(pages.recv().await, Err(EventBusError::Lagged(3)));
    }

    #[test]
    fn from_config_rejects_an_invalid_host_version() {
        let mut config = Config::default();
        config.host.version = "next".to_string();
        let error = Orchestrator::from_config(
            ModuleRegistry::default(),
            UnavailableDatabase::store(),
            &config,
        )
        .err()
        .unwrap();
        assert_matches!(error, SetupError::Config(_));
    }

    #[tokio::test]
    async fn bus_refresh_request_links_result_to_request() {
        let server = disable_list_server("empty-list.json", 1).await;
        let (store, _dir) = temp_store().await;
        let mut config = Config::default();
        config.remote_disable.base_url = Some(server.uri());
        config.remote_disable.refresh_on_startup = false;
        let orchestrator =
            Orchestrator::from_config(ModuleRegistry::default(), store, &config).unwrap();
        let bus = Arc::clone(orchestrator.event_bus().unwrap());
        let driver_events = bus.subscribe("**").unwrap();
        let mut refreshed = bus.subscribe("system.remote_disable.refreshed").unwrap();

        let request = host_event(
            "system.remote_disable.refresh_requested",
            EventPayload::RemoteDisableRefreshRequested,
        );
        let request_id = request.id;
        bus.publish(request).unwrap();

        let script = async {
            let event = refreshed.recv().await.unwrap();
            bus.publish(host_event(
                "system.shutdown.requested",
                EventPayload::ShutdownRequested {
                    reason: "done".to_string(),
                },
            ))
            .unwrap();
            event
        };
        let (_, event) = timeout(Duration::from_secs(10), async {
            tokio::join!(orchestrator.drive(driver_events), script)
        })
        .await
        .unwrap();

        assert_eq!(event.payload, EventPayload::RemoteDisableRefreshed { entries: 0 });
        assert_eq!(event.correlation_id, Some(request_id));
        assert_eq!(event.source, EventSource::System("orchestrator".to_string()));
    }
}
