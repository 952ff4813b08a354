use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{ModuleDescriptor, SuboptionKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("module {id} is already registered as {existing:?}; rejected {rejected:?}")]
    DuplicateModule {
        id: String,
        existing: String,
        rejected: String,
    },

    #[error("invalid descriptor for module {id}: {reason}")]
    InvalidDescriptor { id: String, reason: String },
}

/// Collects module registrations during startup.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    modules: Vec<Arc<ModuleDescriptor>>,
    index: BTreeMap<String, usize>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `descriptor`. A second registration under an existing id is
    /// rejected and the first one stays.
    pub fn register(
        &mut self,
        descriptor: ModuleDescriptor,
    ) -> Result<Arc<ModuleDescriptor>, RegistryError> {
        validate(&descriptor)?;

        if let Some(&position) = self.index.get(descriptor.id()) {
            return Err(RegistryError::DuplicateModule {
                id: descriptor.id().to_string(),
                existing: self.modules[position].display_name().to_string(),
                rejected: descriptor.display_name().to_string(),
            });
        }

        let descriptor = Arc::new(descriptor);
        self.index
            .insert(descriptor.id().to_string(), self.modules.len());
        self.modules.push(Arc::clone(&descriptor));
        debug!(module_id = descriptor.id(), name = descriptor.display_name(), "registered module");
        Ok(descriptor)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// End the registration phase.
    pub fn freeze(self) -> ModuleRegistry {
        ModuleRegistry {
            modules: self.modules,
            index: self.index,
        }
    }
}

/// The registered modules, read-only once startup is over.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<ModuleDescriptor>>,
    index: BTreeMap<String, usize>,
}

impl ModuleRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ModuleDescriptor>> {
        self.index.get(id).map(|&position| &self.modules[position])
    }

    /// Registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Descriptors the settings surface lists.
    pub fn settings_entries(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
        self.modules.iter().filter(|module| module.show_in_settings())
    }
}

fn validate(descriptor: &ModuleDescriptor) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidDescriptor {
        id: descriptor.id().to_string(),
        reason,
    };

    if descriptor.id().trim().is_empty() {
        return Err(invalid("id must not be blank".to_string()));
    }
    if descriptor.display_name().trim().is_empty() {
        return Err(invalid("display name must not be blank".to_string()));
    }
    if !descriptor.has_activate() {
        return Err(invalid("an activate hook is required".to_string()));
    }

    for (name, suboption) in descriptor.suboptions() {
        if suboption.label.trim().is_empty() {
            return Err(invalid(format!("suboption {name} has a blank label")));
        }
        if matches!(&suboption.kind, SuboptionKind::Choice { choices } if choices.is_empty()) {
            return Err(invalid(format!("suboption {name} offers no choices")));
        }
        if !suboption.kind.accepts(&suboption.default) {
            return Err(invalid(format!(
                "default {} of suboption {name} does not fit its type",
                suboption.default
            )));
        }
    }

    Ok(())
}
