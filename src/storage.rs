/// Scoped key-value storage for OAuth configuration and tokens.
/// The host application's settings store is treated as opaque: two scoped
/// instances are expected, one shared-scope for config and one client-scope
/// for the token record.
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Shared-scope key holding the OAuth configuration record.
pub const CONFIG_KEY: &str = "oauthConfig";
/// Client-scope key holding the current token record.
pub const TOKEN_KEY: &str = "oauthToken";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    /// Setting `Value::Null` clears the key.
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// In-process store, used by embedding hosts that bridge to their own
/// settings layer and by tests.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(values.get(key).filter(|v| !v.is_null()).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        if value.is_null() {
            values.remove(key);
        } else {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}

/// System keyring backed store for the client-scoped token record.
/// Uses native keyring: Secret Service (Linux), Keychain (macOS),
/// Credential Manager (Windows).
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entry = keyring::Entry::new(&self.service, key)?;
        match entry.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let entry = keyring::Entry::new(&self.service, key)?;
        if value.is_null() {
            match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            entry.set_password(&serde_json::to_string(&value)?)?;
            Ok(())
        }
    }
}
