//! Exact nearest-neighbor search over every stored vector

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::index::{IndexHit, MetadataFilter};
use crate::types::{CollectionStats, DistanceMetric, IndexRecord, RecordId};
use crate::{Error, Result};

/// In-memory flat index
///
/// Keeps every record and scans the candidates on each query, so results are
/// exact: a query equal to a stored vector always comes back with distance 0.
/// Records are also bucketed by series name so per-name queries only scan
/// that name's windows.
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,

    /// Map from record id to position in `records`
    id_map: HashMap<RecordId, usize>,

    /// Positions of each name's records
    by_name: HashMap<String, Vec<usize>>,

    records: Vec<IndexRecord>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidRequest(
                "index dimension must be positive".into(),
            ));
        }

        Ok(Self {
            dimension,
            metric,
            id_map: HashMap::new(),
            by_name: HashMap::new(),
            records: Vec::new(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Check dimensions without inserting anything
    pub fn validate(&self, records: &[IndexRecord]) -> Result<()> {
        match records.iter().find(|r| r.vector.len() != self.dimension) {
            Some(bad) => Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: bad.vector.len(),
            }),
            None => Ok(()),
        }
    }

    /// Whether an identical record (same id, vector and metadata) is stored
    pub fn contains(&self, record: &IndexRecord) -> bool {
        self.id_map
            .get(&record.id)
            .is_some_and(|&pos| self.records[pos] == *record)
    }

    /// Add records; an id that already exists is overwritten in place
    pub fn add(&mut self, records: Vec<IndexRecord>) -> Result<()> {
        self.validate(&records)?;

        for record in records {
            if let Some(&pos) = self.id_map.get(&record.id) {
                let old_name = &self.records[pos].metadata.name;
                if *old_name != record.metadata.name {
                    if let Some(positions) = self.by_name.get_mut(old_name) {
                        positions.retain(|p| *p != pos);
                    }
                    self.by_name
                        .entry(record.metadata.name.clone())
                        .or_default()
                        .push(pos);
                }
                self.records[pos] = record;
            } else {
                let pos = self.records.len();
                self.id_map.insert(record.id.clone(), pos);
                self.by_name
                    .entry(record.metadata.name.clone())
                    .or_default()
                    .push(pos);
                self.records.push(record);
            }
        }

        Ok(())
    }

    /// Top-k nearest records, ascending by distance (ties by insertion order)
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, usize)> = match filter.and_then(|f| f.name()) {
            Some(name) => self
                .by_name
                .get(name)
                .map(|positions| self.score(query, positions.iter().copied(), filter))
                .unwrap_or_default(),
            None => self.score(query, 0..self.records.len(), filter),
        };

        let cmp = |a: &(f32, usize), b: &(f32, usize)| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        };

        if scored.len() > top_k {
            scored.select_nth_unstable_by(top_k - 1, cmp);
            scored.truncate(top_k);
        }
        scored.sort_by(cmp);

        Ok(scored
            .into_iter()
            .map(|(distance, pos)| {
                let record = &self.records[pos];
                IndexHit {
                    id: record.id.clone(),
                    metadata: record.metadata.clone(),
                    distance,
                    vector: record.vector.clone(),
                }
            })
            .collect())
    }

    fn score(
        &self,
        query: &[f32],
        positions: impl Iterator<Item = usize>,
        filter: Option<&MetadataFilter>,
    ) -> Vec<(f32, usize)> {
        positions
            .filter(|&pos| filter.map_or(true, |f| f.matches(&self.records[pos].metadata)))
            .map(|pos| (self.distance(query, &self.records[pos].vector), pos))
            .collect()
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            DistanceMetric::L2 => l2_distance(a, b),
            DistanceMetric::Cosine => cosine_distance(a, b),
        }
    }

    /// Distinct names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_name
            .iter()
            .filter(|(_, positions)| !positions.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> CollectionStats {
        let mut per_window_size = BTreeMap::new();
        let mut per_name = BTreeMap::new();
        for record in &self.records {
            *per_window_size
                .entry(record.metadata.window_size)
                .or_insert(0) += 1;
            *per_name.entry(record.metadata.name.clone()).or_insert(0) += 1;
        }

        CollectionStats {
            total_records: self.records.len(),
            per_window_size,
            per_name,
            ..CollectionStats::default()
        }
    }

    pub fn clear(&mut self) {
        self.id_map.clear();
        self.by_name.clear();
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Euclidean distance
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// `1 - cosine similarity`, with zero vectors treated as orthogonal
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na * nb)).max(0.0)
}
