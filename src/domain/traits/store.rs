use async_trait::async_trait;
use serde_json::Value;

use crate::application::errors::StorageError;

/// Store trait - abstraction for document persistence
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the document stored under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Replace the document stored under `key`
    async fn save(&self, key: &str, document: &Value) -> Result<(), StorageError>;
}
