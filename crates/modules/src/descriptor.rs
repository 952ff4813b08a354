use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::Ledger;

/// Error type returned by module hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;
pub type HookResult = Result<(), HookError>;

type InitHook = Box<dyn Fn() -> HookResult + Send + Sync>;
type ActivateHook = Box<dyn Fn(&ResolvedOptions, &Ledger) -> HookResult + Send + Sync>;
type DeactivateHook = Box<dyn Fn() -> HookResult + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SuboptionKind {
    Boolean,
    Text,
    Number,
    Choice { choices: Vec<String> },
}

impl SuboptionKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            SuboptionKind::Boolean => value.is_boolean(),
            SuboptionKind::Text => value.is_string(),
            SuboptionKind::Number => value.is_number(),
            SuboptionKind::Choice { choices } => value
                .as_str()
                .is_some_and(|choice| choices.iter().any(|allowed| allowed == choice)),
        }
    }
}

/// A user-tunable knob a module exposes on the settings surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suboption {
    pub label: String,
    #[serde(flatten)]
    pub kind: SuboptionKind,
    pub default: Value,
}

impl Suboption {
    pub fn boolean(label: impl Into<String>, default: bool) -> Self {
        Self {
            label: label.into(),
            kind: SuboptionKind::Boolean,
            default: Value::Bool(default),
        }
    }

    pub fn text(label: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: SuboptionKind::Text,
            default: Value::String(default.into()),
        }
    }

    pub fn number(label: impl Into<String>, default: f64) -> Self {
        Self {
            label: label.into(),
            kind: SuboptionKind::Number,
            default: serde_json::Number::from_f64(default)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }

    pub fn choice<I, S>(label: impl Into<String>, choices: I, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            kind: SuboptionKind::Choice {
                choices: choices.into_iter().map(Into::into).collect(),
            },
            default: Value::String(default.into()),
        }
    }
}

/// Suboption values for one activation: the stored user value where it is
/// valid for the option's kind, the declared default otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedOptions(BTreeMap<String, Value>);

impl ResolvedOptions {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Immutable description of a module: metadata shown to users plus the
/// lifecycle hooks the orchestrator drives.
pub struct ModuleDescriptor {
    id: String,
    display_name: String,
    description: Option<String>,
    default_enabled: bool,
    show_in_settings: bool,
    suboptions: BTreeMap<String, Suboption>,
    init: Option<InitHook>,
    activate: Option<ActivateHook>,
    deactivate: Option<DeactivateHook>,
}

impl ModuleDescriptor {
    pub fn builder(
        id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> ModuleDescriptorBuilder {
        ModuleDescriptorBuilder {
            descriptor: ModuleDescriptor {
                id: id.into(),
                display_name: display_name.into(),
                description: None,
                default_enabled: true,
                show_in_settings: true,
                suboptions: BTreeMap::new(),
                init: None,
                activate: None,
                deactivate: None,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn default_enabled(&self) -> bool {
        self.default_enabled
    }

    pub fn show_in_settings(&self) -> bool {
        self.show_in_settings
    }

    pub fn suboptions(&self) -> &BTreeMap<String, Suboption> {
        &self.suboptions
    }

    pub fn has_activate(&self) -> bool {
        self.activate.is_some()
    }

    pub fn resolve_options(&self, stored: &BTreeMap<String, Value>) -> ResolvedOptions {
        let resolved = self
            .suboptions
            .iter()
            .map(|(name, suboption)| {
                let value = stored
                    .get(name)
                    .filter(|value| suboption.kind.accepts(value))
                    .unwrap_or(&suboption.default);
                (name.clone(), value.clone())
            })
            .collect();
        ResolvedOptions(resolved)
    }

    pub(crate) fn run_init(&self) -> HookResult {
        match &self.init {
            Some(init) => init(),
            None => Ok(()),
        }
    }

    pub(crate) fn run_activate(&self, options: &ResolvedOptions, ledger: &Ledger) -> HookResult {
        match &self.activate {
            Some(activate) => activate(options, ledger),
            None => Ok(()),
        }
    }

    pub(crate) fn run_deactivate(&self) -> HookResult {
        match &self.deactivate {
            Some(deactivate) => deactivate(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("default_enabled", &self.default_enabled)
            .field("show_in_settings", &self.show_in_settings)
            .field("suboptions", &self.suboptions.keys().collect::<Vec<_>>())
            .field("init", &self.init.is_some())
            .field("deactivate", &self.deactivate.is_some())
            .finish_non_exhaustive()
    }
}

pub struct ModuleDescriptorBuilder {
    descriptor: ModuleDescriptor,
}

impl ModuleDescriptorBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = Some(description.into());
        self
    }

    pub fn default_enabled(mut self, enabled: bool) -> Self {
        self.descriptor.default_enabled = enabled;
        self
    }

    pub fn show_in_settings(mut self, show: bool) -> Self {
        self.descriptor.show_in_settings = show;
        self
    }

    pub fn suboption(mut self, name: impl Into<String>, suboption: Suboption) -> Self {
        self.descriptor.suboptions.insert(name.into(), suboption);
        self
    }

    /// One-time setup, run before the first activation only.
    pub fn on_init<F>(mut self, init: F) -> Self
    where
        F: Fn() -> HookResult + Send + Sync + 'static,
    {
        self.descriptor.init = Some(Box::new(init));
        self
    }

    /// Runs every time the module becomes enabled. Everything it sets up
    /// must be registered in the ledger it is handed.
    pub fn on_activate<F>(mut self, activate: F) -> Self
    where
        F: Fn(&ResolvedOptions, &Ledger) -> HookResult + Send + Sync + 'static,
    {
        self.descriptor.activate = Some(Box::new(activate));
        self
    }

    /// Runs before the activation's ledger is disposed.
    pub fn on_deactivate<F>(mut self, deactivate: F) -> Self
    where
        F: Fn() -> HookResult + Send + Sync + 'static,
    {
        self.descriptor.deactivate = Some(Box::new(deactivate));
        self
    }

    pub fn build(self) -> ModuleDescriptor {
        self.descriptor
    }
}
