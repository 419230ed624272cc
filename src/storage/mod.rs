//! Storage abstraction layer
//!
//! Collections persist manifests, segments and index files through this
//! interface so the same code runs against a local directory or memory.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub mod local;
pub mod memory;

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read object from storage
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write object to storage
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete object from storage
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List object keys under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { root_path: String },
    Memory,
}

/// Create storage backend from config
pub fn create_storage(config: StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { root_path } => {
            let backend = local::LocalStorage::new(root_path)?;
            Ok(Box::new(backend))
        }
        StorageConfig::Memory => Ok(Box::new(memory::MemoryStorage::new())),
    }
}
