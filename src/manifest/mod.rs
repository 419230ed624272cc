//! Collection manifest management
//!
//! The manifest is the source of truth for which Parquet segments make up a
//! collection, the vector dimension they were written with and the metric
//! queries must use.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::StorageBackend;
use crate::types::{DistanceMetric, SegmentInfo};
use crate::{Error, Result};

/// Collection manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub collection: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub segments: Vec<SegmentInfo>,
    pub total_records: usize,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(collection: String, dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            version: 1,
            collection,
            dimension,
            metric,
            segments: Vec::new(),
            total_records: 0,
            updated_at: Utc::now(),
        }
    }

    /// Add a sealed segment
    pub fn add_segment(&mut self, segment: SegmentInfo) {
        self.total_records += segment.row_count;
        self.segments.push(segment);
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

/// Loads and saves manifests
pub struct ManifestManager {
    storage: Arc<dyn StorageBackend>,
}

impl ManifestManager {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn manifest_key(collection: &str) -> String {
        format!("{}/manifest.json", collection)
    }

    pub async fn load(&self, collection: &str) -> Result<Manifest> {
        let key = Self::manifest_key(collection);

        let data = self
            .storage
            .get(&key)
            .await
            .map_err(|_| Error::CollectionNotFound(collection.to_string()))?;

        let json = String::from_utf8(data.to_vec())
            .map_err(|e| Error::internal(format!("Invalid UTF-8 in manifest: {}", e)))?;

        Manifest::from_json(&json)
    }

    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        let json = manifest.to_json()?;
        let key = Self::manifest_key(&manifest.collection);
        self.storage.put(&key, Bytes::from(json.into_bytes())).await
    }

    pub async fn exists(&self, collection: &str) -> Result<bool> {
        self.storage.exists(&Self::manifest_key(collection)).await
    }

    pub async fn create(
        &self,
        collection: String,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Manifest> {
        if self.exists(&collection).await? {
            return Err(Error::InvalidRequest(format!(
                "Collection {} already exists",
                collection
            )));
        }

        let manifest = Manifest::new(collection, dimension, metric);
        self.save(&manifest).await?;
        Ok(manifest)
    }

    pub async fn delete(&self, collection: &str) -> Result<()> {
        self.storage.delete(&Self::manifest_key(collection)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_add_segment() {
        let mut manifest = Manifest::new("sp500".to_string(), 32, DistanceMetric::L2);
        assert_eq!(manifest.version, 1);

        manifest.add_segment(SegmentInfo {
            segment_id: "seg_1".to_string(),
            file_path: "sp500/segments/seg_1.parquet".to_string(),
            row_count: 10,
            created_at: Utc::now(),
        });

        assert_eq!(manifest.version, 2);
        assert_eq!(manifest.total_records, 10);
        assert_eq!(manifest.segments.len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_manager() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let manager = ManifestManager::new(storage);

        let manifest = manager
            .create("sp500".to_string(), 32, DistanceMetric::L2)
            .await
            .unwrap();

        let loaded = manager.load("sp500").await.unwrap();
        assert_eq!(loaded.version, manifest.version);
        assert_eq!(loaded.dimension, 32);

        assert!(manager.exists("sp500").await.unwrap());
        assert!(manager
            .create("sp500".to_string(), 32, DistanceMetric::L2)
            .await
            .is_err());

        manager.delete("sp500").await.unwrap();
        assert!(matches!(
            manager.load("sp500").await,
            Err(Error::CollectionNotFound(_))
        ));
    }
}
