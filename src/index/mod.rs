//! Exact nearest-neighbor vector index.
//!
//! Vectors are stored row-major in one flat buffer with a parallel sequence of
//! record ids: the vector at position `i` belongs to `ids[i]`. Search is a
//! brute-force scan using squared Euclidean distance. An approximate structure
//! could replace the scan without changing `search`'s contract.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk format version written by `save`.
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An index of dimension 0 can hold no vectors and answer no queries.
    #[error("index has zero dimension")]
    ZeroDimension,

    #[error("index I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization failed: {0}")]
    Serialization(String),

    #[error("index file is corrupt: {0}")]
    Corrupt(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// A search hit: index position, owning record id and squared distance.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub record_id: String,
    pub distance: f32,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    dimension: usize,
    ids: Vec<String>,
    vectors: Vec<f32>,
}

/// Max-heap entry; the worst candidate sits on top so it can be evicted.
struct Candidate {
    distance: f32,
    position: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<f32>,
    ids: Vec<String>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            ids: Vec::new(),
        }
    }

    /// Pre-size for `capacity` vectors.
    pub fn with_capacity(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::with_capacity(dimension * capacity),
            ids: Vec::with_capacity(capacity),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Record ids in position order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Append a vector; it becomes position `count() - 1`.
    pub fn add(&mut self, vector: &[f32], record_id: impl Into<String>) -> IndexResult<usize> {
        self.check_dimension(vector)?;
        self.vectors.extend_from_slice(vector);
        self.ids.push(record_id.into());
        Ok(self.ids.len() - 1)
    }

    /// The `k` nearest vectors to `query`, closest first.
    ///
    /// Equal distances keep storage order. `k` larger than `count()` returns
    /// every vector.
    pub fn search(&self, query: &[f32], k: usize) -> IndexResult<Vec<Neighbor>> {
        self.check_dimension(query)?;
        let k = k.min(self.count());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        for (position, row) in self.vectors.chunks_exact(self.dimension).enumerate() {
            let candidate = Candidate {
                distance: squared_l2(query, row),
                position,
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                position: c.position,
                record_id: self.ids[c.position].clone(),
                distance: c.distance,
            })
            .collect())
    }

    /// Write the index to `path` (dimension, id sequence and raw vectors).
    pub fn save(&self, path: impl AsRef<Path>) -> IndexResult<()> {
        let persisted = PersistedIndex {
            version: FORMAT_VERSION,
            dimension: self.dimension,
            ids: self.ids.clone(),
            vectors: self.vectors.clone(),
        };
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &persisted)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Read an index written by `save`.
    pub fn load(path: impl AsRef<Path>) -> IndexResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let persisted: PersistedIndex = bincode::deserialize_from(reader)
            .map_err(|e| IndexError::Corrupt(e.to_string()))?;

        if persisted.version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version {}",
                persisted.version
            )));
        }
        if persisted.dimension == 0 && !persisted.ids.is_empty() {
            return Err(IndexError::Corrupt("zero dimension with stored ids".to_string()));
        }
        if persisted.vectors.len() != persisted.dimension * persisted.ids.len() {
            return Err(IndexError::Corrupt(format!(
                "{} floats for {} ids of dimension {}",
                persisted.vectors.len(),
                persisted.ids.len(),
                persisted.dimension
            )));
        }

        Ok(Self {
            dimension: persisted.dimension,
            vectors: persisted.vectors,
            ids: persisted.ids,
        })
    }

    fn check_dimension(&self, vector: &[f32]) -> IndexResult<()> {
        if self.dimension == 0 {
            return Err(IndexError::ZeroDimension);
        }
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-dimensional index whose squared distances from the origin are the given values.
    fn index_with_distances(distances: &[f32]) -> VectorIndex {
        let mut index = VectorIndex::new(1);
        for (i, d) in distances.iter().enumerate() {
            index.add(&[d.sqrt()], format!("r{}", i)).unwrap();
        }
        index
    }

    #[test]
    fn test_search_returns_closest_first() {
        let index = index_with_distances(&[0.1, 0.5, 0.3]);
        let hits = index.search(&[0.0], 2).unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r2"]);
        assert!((hits[0].distance - 0.1).abs() < 1e-6);
        assert!((hits[1].distance - 0.3).abs() < 1e-6);
        assert_eq!(hits[1].position, 2);
    }

    #[test]
    fn test_ties_keep_storage_order() {
        let mut index = VectorIndex::new(2);
        index.add(&[1.0, 0.0], "a").unwrap();
        index.add(&[0.0, 1.0], "b").unwrap();
        index.add(&[-1.0, 0.0], "c").unwrap();
        index.add(&[0.0, 3.0], "far").unwrap();

        let hits = index.search(&[0.0, 0.0], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_k_larger_than_count() {
        let index = index_with_distances(&[0.4, 0.2]);
        assert_eq!(index.search(&[0.0], 10).unwrap().len(), 2);
        assert!(VectorIndex::new(3).search(&[0.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        match index.add(&[1.0, 2.0], "short") {
            Err(IndexError::DimensionMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (3, 2));
            }
            other => panic!("Expected DimensionMismatch, got {:?}", other),
        }
        assert_eq!(index.count(), 0);

        index.add(&[1.0, 2.0, 3.0], "ok").unwrap();
        assert!(matches!(
            index.search(&[1.0; 4], 1),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 4 })
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = VectorIndex::new(3);
        index.add(&[0.1, 0.2, 0.3], "a").unwrap();
        index.add(&[-1.0, 0.5, 2.0], "b").unwrap();
        index.add(&[0.0, 0.0, 1e-7], "c").unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path).unwrap();
        assert_eq!(loaded, index);

        let query = [0.05, 0.1, 0.2];
        assert_eq!(loaded.search(&query, 3).unwrap(), index.search(&query, 3).unwrap());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        std::fs::write(&path, b"not an index").unwrap();
        assert!(matches!(VectorIndex::load(&path), Err(IndexError::Corrupt(_))));
    }

    #[test]
    fn test_zero_dimension_index_errors_instead_of_panicking() {
        let mut index = VectorIndex::new(0);
        assert!(matches!(index.search(&[], 3), Err(IndexError::ZeroDimension)));
        assert!(matches!(index.add(&[], "a"), Err(IndexError::ZeroDimension)));
        assert!(index.is_empty());
    }
}
