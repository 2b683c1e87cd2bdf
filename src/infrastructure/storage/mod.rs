//! Document storage implementations

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::application::errors::StorageError;
use crate::domain::traits::DocumentStore;

/// JSON file-based store, one pretty-printed file per key under `base_path`
pub struct JsonFileStore {
    base_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(StorageError::Unavailable(format!("invalid document key '{}'", key)));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, document: &Value) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-memory store
#[derive(Default, Clone)]
pub struct MemoryStore {
    docs: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.docs.read().await.get(key).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, document: &Value) -> Result<(), StorageError> {
        self.docs.write().await.insert(key.to_string(), document.clone());
        Ok(())
    }
}

/// Key of an account's settings document
pub fn settings_key(uin: &str) -> String {
    format!("settings/{}.json", uin)
}

/// Key of an account's disabled-plugin list
pub fn disabled_key(uin: &str) -> String {
    format!("disabled/{}.json", uin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.load(&settings_key("1")).await.unwrap().is_none());

        let doc = json!({ "100": { "name": "g", "plugin": {} } });
        store.save(&settings_key("1"), &doc).await.unwrap();
        assert_eq!(store.load(&settings_key("1")).await.unwrap(), Some(doc));
        assert!(dir.path().join("settings/1.json").exists());
        assert!(!dir.path().join("settings/1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.save("../evil.json", &json!([])).await.is_err());
        assert!(store.load("a//b").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save("k", &json!(["a"])).await.unwrap();
        assert_eq!(store.get("k").await, Some(json!(["a"])));
    }
}
