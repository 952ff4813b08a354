use std::collections::BTreeMap;

use gocp_storage::{Database, StoreError, VersionedStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const SETTINGS_KEY_PREFIX: &str = "module-settings/";
pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// What the user chose for one module on the settings surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// `None` until the user touches the toggle; the descriptor default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl ModuleSettings {
    pub fn enabled_or(&self, default_enabled: bool) -> bool {
        self.enabled.unwrap_or(default_enabled)
    }
}

pub fn settings_key(module_id: &str) -> String {
    format!("{SETTINGS_KEY_PREFIX}{module_id}")
}

/// Per-module settings records in the versioned store.
pub struct SettingsStore<D: Database> {
    store: VersionedStore<D>,
}

impl<D: Database> Clone for SettingsStore<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<D: Database> SettingsStore<D> {
    pub fn new(store: VersionedStore<D>) -> Self {
        Self { store }
    }

    /// The stored record, or the empty record when nothing valid is stored.
    pub async fn get(&self, module_id: &str) -> Result<ModuleSettings, StoreError> {
        Ok(self
            .store
            .get::<ModuleSettings>(&settings_key(module_id), SETTINGS_SCHEMA_VERSION)
            .await?
            .unwrap_or_default())
    }

    pub async fn set(&self, module_id: &str, settings: &ModuleSettings) -> Result<(), StoreError> {
        self.store
            .set(&settings_key(module_id), settings, SETTINGS_SCHEMA_VERSION)
            .await?;
        debug!(module_id, "stored module settings");
        Ok(())
    }

    pub async fn set_enabled(&self, module_id: &str, enabled: bool) -> Result<(), StoreError> {
        let mut settings = self.get(module_id).await?;
        settings.enabled = Some(enabled);
        self.set(module_id, &settings).await
    }

    pub async fn set_option(
        &self,
        module_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut settings = self.get(module_id).await?;
        settings.options.insert(name.to_string(), value);
        self.set(module_id, &settings).await
    }

    /// Forget the user's choices for `module_id`.
    pub async fn reset(&self, module_id: &str) -> Result<bool, StoreError> {
        self.store.remove(&settings_key(module_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gocp_test_support::store::temp_store;
    use serde_json::json;

    #[tokio::test]
    async fn untouched_module_has_empty_settings() {
        let (store, _dir) = temp_store().await;
        let settings = SettingsStore::new(store);

        let record = settings.get("{grades}").await.unwrap();
        assert_eq!(record, ModuleSettings::default());
        assert!(record.enabled_or(true));
        assert!(!record.enabled_or(false));
    }

    #[tokio::test]
    async fn set_enabled_keeps_options() {
        let (store, _dir) = temp_store().await;
        let settings = SettingsStore::new(store);

        settings
            .set_option("{grades}", "precision", json!(1))
            .await
            .unwrap();
        settings.set_enabled("{grades}", false).await.unwrap();

        let record = settings.get("{grades}").await.unwrap();
        assert_eq!(record.enabled, Some(false));
        assert_eq!(record.options.get("precision"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn records_live_under_the_module_key() {
        let (store, _dir) = temp_store().await;
        let settings = SettingsStore::new(store.clone());
        settings.set_enabled("{grades}", true).await.unwrap();

        let raw: Option<serde_json::Value> = store
            .get("module-settings/{grades}", SETTINGS_SCHEMA_VERSION)
            .await
            .unwrap();
        assert_eq!(raw, Some(json!({"enabled": true, "options": {}})));
    }

    #[tokio::test]
    async fn reset_forgets_choices() {
        let (store, _dir) = temp_store().await;
        let settings = SettingsStore::new(store);
        settings.set_enabled("{grades}", false).await.unwrap();

        assert!(settings.reset("{grades}").await.unwrap());
        assert_eq!(settings.get("{grades}").await.unwrap().enabled, None);
        assert!(!settings.reset("{grades}").await.unwrap());
    }
}
