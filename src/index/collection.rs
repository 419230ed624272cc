//! Persistent collection of indexed windows
//!
//! A collection ties together:
//! - Manifest (dimension, metric, segment list)
//! - Storage (local directory or memory)
//! - Parquet segments holding sealed records
//! - WAL holding records accepted since the last seal
//! - The in-memory [`FlatIndex`] that answers queries

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::index::{FlatIndex, IndexHit, MetadataFilter, NearestNeighborIndex};
use crate::manifest::{Manifest, ManifestManager};
use crate::segment::{SegmentReader, SegmentWriter};
use crate::storage::StorageBackend;
use crate::types::{CollectionStats, DistanceMetric, IndexRecord, SegmentInfo};
use crate::wal::{WalManager, WalOperation};
use crate::{Error, Result};

/// Default number of buffered records that triggers sealing a segment
pub const DEFAULT_SEGMENT_ROWS: usize = 50_000;

/// Collection tuning
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Directory for the WAL; `None` keeps unsealed records in memory only
    pub wal_dir: Option<PathBuf>,
    /// Seal a segment once this many records are buffered
    pub segment_rows: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            wal_dir: None,
            segment_rows: DEFAULT_SEGMENT_ROWS,
        }
    }
}

struct WriteState {
    wal: Option<WalManager>,
    /// Records logged in the WAL but not yet in a segment
    buffer: Vec<IndexRecord>,
}

/// Persistent nearest-neighbor collection
pub struct Collection {
    name: String,
    dimension: usize,
    storage: Arc<dyn StorageBackend>,
    manifest_manager: ManifestManager,
    manifest: RwLock<Manifest>,
    index: RwLock<FlatIndex>,
    writer: Mutex<WriteState>,
    segment_rows: usize,
}

impl Collection {
    /// Create a new, empty collection
    pub async fn create(
        name: impl Into<String>,
        dimension: usize,
        metric: DistanceMetric,
        storage: Arc<dyn StorageBackend>,
        options: CollectionOptions,
    ) -> Result<Self> {
        let name = name.into();
        let index = FlatIndex::new(dimension, metric)?;
        let manifest_manager = ManifestManager::new(storage.clone());
        let manifest = manifest_manager
            .create(name.clone(), dimension, metric)
            .await?;

        // A fresh collection must not inherit a stale log
        let mut wal = open_wal(&options).await?;
        if let Some(wal) = wal.as_mut() {
            wal.truncate().await?;
        }

        tracing::info!(collection = %name, dimension, ?metric, "Created collection");

        Ok(Self {
            name,
            dimension,
            storage,
            manifest_manager,
            manifest: RwLock::new(manifest),
            index: RwLock::new(index),
            writer: Mutex::new(WriteState {
                wal,
                buffer: Vec::new(),
            }),
            segment_rows: options.segment_rows.max(1),
        })
    }

    /// Load an existing collection: read every segment, then replay the WAL
    pub async fn open(
        name: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        options: CollectionOptions,
    ) -> Result<Self> {
        let name = name.into();
        let manifest_manager = ManifestManager::new(storage.clone());
        let manifest = manifest_manager.load(&name).await?;

        let mut index = FlatIndex::new(manifest.dimension, manifest.metric)?;
        for segment in &manifest.segments {
            let data = storage.get(&segment.file_path).await.map_err(|e| {
                Error::IndexUnavailable(format!(
                    "Failed to read segment {}: {}",
                    segment.segment_id, e
                ))
            })?;
            index.add(SegmentReader::read_parquet(data)?)?;
        }

        let wal = open_wal(&options).await?;
        let mut buffer = Vec::new();
        if let Some(wal) = &wal {
            for op in wal.replay().await? {
                let WalOperation::Insert { records } = op;
                index.add(records.clone())?;
                buffer.extend(records);
            }
        }

        tracing::info!(
            collection = %name,
            segments = manifest.segments.len(),
            records = index.len(),
            replayed = buffer.len(),
            "Opened collection"
        );

        Ok(Self {
            name,
            dimension: manifest.dimension,
            storage,
            manifest_manager,
            manifest: RwLock::new(manifest),
            index: RwLock::new(index),
            writer: Mutex::new(WriteState { wal, buffer }),
            segment_rows: options.segment_rows.max(1),
        })
    }

    /// Open the collection if its manifest exists, otherwise create it
    pub async fn open_or_create(
        name: impl Into<String>,
        dimension: usize,
        metric: DistanceMetric,
        storage: Arc<dyn StorageBackend>,
        options: CollectionOptions,
    ) -> Result<Self> {
        let name = name.into();
        if ManifestManager::new(storage.clone()).exists(&name).await? {
            let collection = Self::open(name, storage, options).await?;
            if collection.dimension != dimension {
                return Err(Error::DimensionMismatch {
                    expected: collection.dimension,
                    got: dimension,
                });
            }
            Ok(collection)
        } else {
            Self::create(name, dimension, metric, storage, options).await
        }
    }

    /// Open a collection that must already hold windows.
    ///
    /// Nothing is written when the collection is missing; a missing or empty
    /// collection is reported as [`Error::EmptyCorpus`].
    pub async fn open_populated(
        name: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        options: CollectionOptions,
    ) -> Result<Self> {
        let name = name.into();
        let collection = match Self::open(name.clone(), storage, options).await {
            Ok(collection) => collection,
            Err(Error::CollectionNotFound(_)) => {
                return Err(Error::EmptyCorpus(format!(
                    "collection {} has not been built",
                    name
                )))
            }
            Err(e) => return Err(e),
        };

        if collection.index.read().await.names().is_empty() {
            return Err(Error::EmptyCorpus(format!(
                "collection {} holds no windows",
                name
            )));
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write buffered records to a new Parquet segment and truncate the WAL
    async fn seal(&self, state: &mut WriteState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        let segment_id = format!(
            "seg_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );
        let file_path = format!("{}/segments/{}.parquet", self.name, segment_id);

        let writer = SegmentWriter::new(self.dimension)?;
        let data = writer.write_parquet(&state.buffer)?;
        let size = data.len();

        self.storage
            .put(&file_path, data)
            .await
            .map_err(|e| Error::index_write(format!("Failed to write segment: {}", e)))?;

        let mut manifest = self.manifest.write().await;
        manifest.add_segment(SegmentInfo {
            segment_id: segment_id.clone(),
            file_path: file_path.clone(),
            row_count: state.buffer.len(),
            created_at: chrono::Utc::now(),
        });
        self.manifest_manager
            .save(&manifest)
            .await
            .map_err(|e| Error::index_write(format!("Failed to save manifest: {}", e)))?;

        tracing::info!(
            collection = %self.name,
            segment = %segment_id,
            rows = state.buffer.len(),
            bytes = size,
            "Sealed segment"
        );

        state.buffer.clear();
        if let Some(wal) = state.wal.as_mut() {
            wal.truncate().await?;
        }
        Ok(())
    }

    /// Remove every record: segments, WAL and in-memory index.
    /// The manifest is kept (empty) so the collection stays openable.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.writer.lock().await;
        let mut manifest = self.manifest.write().await;

        for segment in &manifest.segments {
            self.storage.delete(&segment.file_path).await?;
        }

        let mut fresh = Manifest::new(self.name.clone(), manifest.dimension, manifest.metric);
        fresh.version = manifest.version + 1;
        self.manifest_manager.save(&fresh).await?;
        *manifest = fresh;

        state.buffer.clear();
        if let Some(wal) = state.wal.as_mut() {
            wal.truncate().await?;
        }
        self.index.write().await.clear();

        tracing::info!(collection = %self.name, "Cleared collection");
        Ok(())
    }

    pub async fn stats(&self) -> CollectionStats {
        // Lock order: writer, manifest, index
        let state = self.writer.lock().await;
        let manifest = self.manifest.read().await;
        let index = self.index.read().await;

        CollectionStats {
            segment_count: manifest.segments.len(),
            buffered_records: state.buffer.len(),
            ..index.stats()
        }
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }
}

async fn open_wal(options: &CollectionOptions) -> Result<Option<WalManager>> {
    match &options.wal_dir {
        Some(dir) => Ok(Some(WalManager::new(dir).await?)),
        None => Ok(None),
    }
}

#[async_trait]
impl NearestNeighborIndex for Collection {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert_batch(&self, records: Vec<IndexRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut state = self.writer.lock().await;
        let records = {
            let index = self.index.read().await;
            index.validate(&records)?;
            let total = records.len();
            // Unchanged records are already persisted; rewriting them would
            // grow the segments on every stable-id rebuild
            let changed: Vec<IndexRecord> =
                records.into_iter().filter(|r| !index.contains(r)).collect();
            if changed.len() < total {
                tracing::debug!(
                    collection = %self.name,
                    unchanged = total - changed.len(),
                    "Skipped unchanged records"
                );
            }
            changed
        };
        if records.is_empty() {
            return Ok(());
        }

        if let Some(wal) = state.wal.as_mut() {
            wal.append(WalOperation::Insert {
                records: records.clone(),
            })
            .await?;
        }

        self.index.write().await.add(records.clone())?;
        state.buffer.extend(records);

        if state.buffer.len() >= self.segment_rows {
            self.seal(&mut state).await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>> {
        self.index.read().await.search(vector, k, filter)
    }

    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.index.read().await.names())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.writer.lock().await;
        self.seal(&mut state).await?;
        if let Some(wal) = state.wal.as_mut() {
            wal.sync().await?;
        }
        Ok(())
    }
}
