use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::{env, fs, path::Path};

use crate::auth::AuthError;
use crate::storage::{CONFIG_KEY, KeyValueStore};

/// How document sync is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// Sync on every document create/update/delete hook.
    #[default]
    Automatic,
    /// Sync only through an explicit per-document action.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_client_id", alias = "clientId")]
    pub client_id: String,
    #[serde(default, alias = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_authorize_url", alias = "authorizeUrl")]
    pub authorize_url: String,
    #[serde(default = "default_token_url", alias = "tokenUrl")]
    pub token_url: String,
    #[serde(default = "default_api_base_url", alias = "apiBaseUrl")]
    pub api_base_url: String,
    #[serde(default = "default_redirect_url", alias = "redirectUrl")]
    pub redirect_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_sync_endpoint", alias = "syncEndpoint")]
    pub sync_endpoint: String,
    #[serde(default, alias = "worldId")]
    pub world_id: String,
    /// Allow-list of journal container names. Absent means "sync everything".
    /// Stored values may be a comma-separated string.
    #[serde(
        default,
        alias = "allowedJournals",
        deserialize_with = "deserialize_allow_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_journals: Option<Vec<String>>,
    #[serde(default)]
    pub trigger: SyncTrigger,
}

// Defaults mirror the public Lorebound deployment.
fn default_client_id() -> String { "foundry_app".to_string() }
fn default_authorize_url() -> String { "https://auth.niclee.dev/authorize".to_string() }
fn default_token_url() -> String { "https://auth.niclee.dev/token".to_string() }
fn default_api_base_url() -> String { "https://apilorebound.niclee.dev/api".to_string() }
fn default_redirect_url() -> String { "https://auth.niclee.dev/oauth-callback".to_string() }
fn default_scope() -> String { "openid profile".to_string() }
fn default_sync_endpoint() -> String { "/notes".to_string() }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_secret: None,
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            api_base_url: default_api_base_url(),
            redirect_url: default_redirect_url(),
            scope: default_scope(),
            sync_endpoint: default_sync_endpoint(),
            world_id: String::new(),
            allowed_journals: None,
            trigger: SyncTrigger::default(),
        }
    }
}

fn deserialize_allow_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AllowList {
        List(Vec<String>),
        Csv(String),
    }

    let raw: Option<AllowList> = Option::deserialize(deserializer)?;
    Ok(raw.map(|list| match list {
        AllowList::List(names) => names,
        AllowList::Csv(csv) => csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }))
}

impl SyncConfig {
    /// Config fields an authorization flow cannot start without.
    pub fn validate_for_authorize(&self) -> Result<(), AuthError> {
        if self.client_id.is_empty() {
            return Err(AuthError::ConfigIncomplete("client_id"));
        }
        if self.authorize_url.is_empty() {
            return Err(AuthError::ConfigIncomplete("authorize_url"));
        }
        if self.token_url.is_empty() {
            return Err(AuthError::ConfigIncomplete("token_url"));
        }
        Ok(())
    }

    /// Load configuration from file and environment, for standalone use
    /// (the CLI binary). Embedding hosts go through [`ConfigStore`] instead.
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config_path = env::var("LOREBOUND_CONFIG").unwrap_or_else(|_| {
            let home_config = format!(
                "{}/.config/lorebound/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = vec!["./lorebound.toml", home_config.as_str()];

            for path in locations {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }

            "./lorebound.toml".to_string()
        });

        if !Path::new(&config_path).exists() {
            tracing::debug!("no config file at {}, using defaults", config_path);
            return Ok(Self::default());
        }

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        // Substitute environment variables
        let config_content = Self::substitute_env_vars(&config_content);

        let config: SyncConfig = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        Ok(config)
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = env::var(var_name).unwrap_or_default();
                result.replace_range(start..start + end + 1, &value);
            } else {
                break;
            }
        }

        result
    }
}

/// Reads config from the shared-scope settings store, layering stored
/// overrides on top of built-in defaults. Writes merge with the current
/// record rather than replacing it.
pub struct ConfigStore {
    store: Arc<dyn KeyValueStore>,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// A store pre-seeded with a fixed config, for standalone contexts.
    pub fn fixed(config: SyncConfig) -> Self {
        let store = Arc::new(crate::storage::MemoryStore::new());
        if let Ok(value) = serde_json::to_value(&config) {
            let _ = store.set(CONFIG_KEY, value);
        }
        Self { store }
    }

    /// Current effective configuration. Read fresh on every use; a broken
    /// stored record degrades to the defaults rather than failing a sync.
    pub fn get(&self) -> SyncConfig {
        let stored = match self.store.get(CONFIG_KEY) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stored config, using defaults");
                None
            }
        };

        let Some(stored) = stored else {
            return SyncConfig::default();
        };

        let mut base = match serde_json::to_value(SyncConfig::default()) {
            Ok(v) => v,
            Err(_) => return SyncConfig::default(),
        };
        merge_objects(&mut base, &stored);

        match serde_json::from_value(base) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "stored config is malformed, using defaults");
                SyncConfig::default()
            }
        }
    }

    /// Merge-on-write: only the keys present in `patch` are changed.
    pub fn set(&self, patch: Value) -> Result<()> {
        let mut current = serde_json::to_value(self.get())?;
        merge_objects(&mut current, &patch);
        self.store.set(CONFIG_KEY, current)
    }
}

fn merge_objects(base: &mut Value, overlay: &Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (base, overlay) {
        for (key, value) in overlay_map {
            let key = canonical_key(key);
            if value.is_null() {
                base_map.remove(&key);
            } else {
                base_map.insert(key, value.clone());
            }
        }
    }
}

/// Host settings records use camelCase keys; ours are snake_case. Folding
/// them together here keeps the merged record free of duplicate fields.
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_env_var_substitution() {
        unsafe { env::set_var("TEST_LB_VAR", "test_value") };

        let input = "client_secret = \"${TEST_LB_VAR}\"";
        let output = SyncConfig::substitute_env_vars(input);

        assert_eq!(output, "client_secret = \"test_value\"");

        unsafe { env::remove_var("TEST_LB_VAR") };
    }

    #[test]
    fn test_defaults_when_store_empty() {
        let store = ConfigStore::new(Arc::new(MemoryStore::new()));
        let config = store.get();
        assert_eq!(config.client_id, "foundry_app");
        assert_eq!(config.sync_endpoint, "/notes");
        assert_eq!(config.trigger, SyncTrigger::Automatic);
    }

    #[test]
    fn test_merge_on_write() {
        let store = ConfigStore::new(Arc::new(MemoryStore::new()));
        store.set(json!({"client_secret": "s3cret"})).unwrap();
        store.set(json!({"world_id": "w-1"})).unwrap();

        let config = store.get();
        assert_eq!(config.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.world_id, "w-1");
        // untouched keys keep their defaults
        assert_eq!(config.token_url, "https://auth.niclee.dev/token");
    }

    #[test]
    fn test_allow_list_from_csv() {
        let store = ConfigStore::new(Arc::new(MemoryStore::new()));
        store
            .set(json!({"allowed_journals": "Lore, Campaign Notes"}))
            .unwrap();

        let config = store.get();
        assert_eq!(
            config.allowed_journals,
            Some(vec!["Lore".to_string(), "Campaign Notes".to_string()])
        );
    }

    #[test]
    fn test_camel_case_aliases() {
        let store = MemoryStore::new();
        store
            .set(
                CONFIG_KEY,
                json!({"clientId": "app", "tokenUrl": "https://idp/token"}),
            )
            .unwrap();

        let config = ConfigStore::new(Arc::new(store)).get();
        assert_eq!(config.client_id, "app");
        assert_eq!(config.token_url, "https://idp/token");
    }

    #[test]
    fn test_validate_for_authorize() {
        let mut config = SyncConfig::default();
        assert!(config.validate_for_authorize().is_ok());

        config.client_id = String::new();
        assert!(matches!(
            config.validate_for_authorize(),
            Err(AuthError::ConfigIncomplete("client_id"))
        ));
    }
}
