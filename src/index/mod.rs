//! Nearest-neighbor index
//!
//! [`NearestNeighborIndex`] is the contract the builder and the query engine
//! depend on. [`Collection`] is the persistent implementation (Parquet
//! segments + WAL + exact in-memory search); [`FlatIndex`] is the search
//! structure it keeps in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{IndexRecord, RecordId, Vector, WindowMetadata};
use crate::Result;

pub mod collection;
pub mod flat;

pub use collection::{Collection, CollectionOptions};
pub use flat::FlatIndex;

/// Single equality condition on window metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FilterCondition {
    Name(String),
    WindowSize(usize),
}

impl FilterCondition {
    fn matches(&self, metadata: &WindowMetadata) -> bool {
        match self {
            FilterCondition::Name(name) => metadata.name == *name,
            FilterCondition::WindowSize(size) => metadata.window_size == *size,
        }
    }
}

/// Conjunction of exact-match metadata conditions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub conditions: Vec<FilterCondition>,
}

impl MetadataFilter {
    pub fn name_eq(name: impl Into<String>) -> Self {
        Self {
            conditions: vec![FilterCondition::Name(name.into())],
        }
    }

    pub fn and(mut self, condition: FilterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, metadata: &WindowMetadata) -> bool {
        self.conditions.iter().all(|c| c.matches(metadata))
    }

    /// The name this filter pins, if any
    pub fn name(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match c {
            FilterCondition::Name(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// One search result, ascending distance order within a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub id: RecordId,
    pub metadata: WindowMetadata,
    pub distance: f32,
    /// The stored (normalized) vector
    pub vector: Vector,
}

/// Vector store contract: insert embeddings with metadata, query top-k.
#[async_trait]
pub trait NearestNeighborIndex: Send + Sync {
    /// Dimension every inserted and queried vector must have
    fn dimension(&self) -> usize;

    /// Insert one vector. An existing id is overwritten.
    async fn insert(&self, vector: Vector, id: RecordId, metadata: WindowMetadata) -> Result<()> {
        self.insert_batch(vec![IndexRecord {
            id,
            vector,
            metadata,
        }])
        .await
    }

    /// Insert many records in one call
    async fn insert_batch(&self, records: Vec<IndexRecord>) -> Result<()>;

    /// Up to `k` nearest records, ascending by distance, restricted by `filter`
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>>;

    /// Distinct series names present in the index, sorted
    async fn names(&self) -> Result<Vec<String>>;

    /// Make every accepted insert durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
