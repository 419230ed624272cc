//! In-memory storage backend

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::{Error, Result};

use super::StorageBackend;

/// Volatile storage, mostly for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::storage(format!("Object not found: {}", key)))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let objects = self.objects.read().await;
        Ok(objects
            .keys()
            .filter(|k| {
                let rest = if prefix.is_empty() {
                    Some(k.as_str())
                } else {
                    k.strip_prefix(prefix).and_then(|r| r.strip_prefix('/'))
                };
                // Direct children only, like a directory listing
                rest.is_some_and(|r| !r.is_empty() && !r.contains('/'))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        storage.put("a/1", Bytes::from("x")).await.unwrap();
        storage.put("a/2", Bytes::from("y")).await.unwrap();
        storage.put("b/1", Bytes::from("z")).await.unwrap();

        assert_eq!(storage.list("a").await.unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(storage.get("b/1").await.unwrap(), Bytes::from("z"));

        storage.delete("a/1").await.unwrap();
        assert!(!storage.exists("a/1").await.unwrap());
        assert!(storage.get("a/1").await.is_err());
    }
}
