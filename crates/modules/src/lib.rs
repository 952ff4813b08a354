pub mod descriptor;
pub mod dom;
pub mod ledger;
pub mod listener;
pub mod orchestrator;
pub mod registry;
pub mod remote_disable;
pub mod settings;
pub mod version_range;

pub use descriptor::{
    HookError, HookResult, ModuleDescriptor, ModuleDescriptorBuilder, ResolvedOptions, Suboption,
    SuboptionKind,
};
pub use dom::{DomWait, DomWatcher, MutationSource};
pub use ledger::{
    DisposalError, Disposer, Ledger, LedgerError, LedgerHandle, Removable, RemoveError,
};
pub use listener::{EventTarget, Listener};
pub use orchestrator::{
    ActivationFailure, HookPhase, ModulePhase, ModuleStatus, Orchestrator, PassReport,
    SettingsEntry, SetupError, SuppressReason, Trigger,
};
pub use registry::{ModuleRegistry, RegistryBuilder, RegistryError};
pub use remote_disable::{
    DisablementEntry, KillSwitch, REMOTE_DISABLE_KEY, REMOTE_DISABLE_SCHEMA_VERSION,
    RefreshError, RefreshOutcome, RemoteStatus,
};
pub use settings::{ModuleSettings, SETTINGS_SCHEMA_VERSION, SettingsStore};
pub use version_range::{VersionRange, VersionRangeError};
