// Key-value store seam for persisted extension metadata
//
// The routing core never touches storage; hosts use it for wallet info and the
// debug-logger switch.

use crate::error::StoreError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;

pub const DEBUG_LOGGER_STORAGE_KEY: &str = "$$ONEKEY_DEBUG_LOGGER";
pub const WALLET_INFO_LOCAL_KEY: &str = "onekey_wallet_info_local_key";
pub const WALLET_INFO_LOCAL_KEY_V5: &str = "onekey_wallet_info_local_key_v5";

/// Persistent JSON values keyed by string, like `chrome.storage.local`.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Human-readable description of where values live
    fn description(&self) -> String;
}

pub fn get_typed<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn set_typed<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StoreError> {
    store.set(key, serde_json::to_value(value)?)
}

/// Wallet metadata shared with connected pages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub accounts: Vec<String>,
}

/// Current wallet info, preferring the v5 record over the legacy one.
pub fn load_wallet_info(store: &dyn KeyValueStore) -> Result<Option<WalletInfo>, StoreError> {
    if let Some(info) = get_typed(store, WALLET_INFO_LOCAL_KEY_V5)? {
        return Ok(Some(info));
    }
    get_typed(store, WALLET_INFO_LOCAL_KEY)
}

/// The debug-logger switch is truthy when set to `true` or a non-empty string.
pub fn debug_logger_enabled(store: &dyn KeyValueStore) -> Result<bool, StoreError> {
    Ok(match store.get(DEBUG_LOGGER_STORAGE_KEY)? {
        Some(Value::Bool(enabled)) => enabled,
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    })
}

/// Process-local store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }

    fn description(&self) -> String {
        "in-memory store".to_string()
    }
}
