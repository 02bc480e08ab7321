use crate::handle::{CoverageStatus, DeclaringType, DuPair, FieldHandle, MethodHandle};
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can arise while persisting or restoring the coverage store.
///
/// In-memory operations on the store never fail; only snapshot I/O does.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading or writing the snapshot file failed.
    #[error("Coverage store I/O error: {0}")]
    Io(String),

    /// Encoding the snapshot (JSON or bincode) failed.
    #[error("Coverage store serialization error: {0}")]
    Serialization(String),

    /// Decoding the snapshot (JSON or bincode) failed.
    #[error("Coverage store deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
impl From<EncodeError> for StoreError {
    fn from(err: EncodeError) -> Self {
        StoreError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for StoreError {
    fn from(err: DecodeError) -> Self {
        StoreError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// All state the store holds for one declaring type.
#[derive(Debug, Default)]
struct TypePartition {
    /// Registered pairs in insertion order, with their status.
    pairs: IndexMap<DuPair, CoverageStatus>,
    /// Bodies of every PUT generated for this type.
    puts: IndexSet<String>,
}

/// The authoritative registry of DU pairs, their coverage, and generated PUTs.
///
/// State is partitioned by declaring type and every partition has its own
/// lock, so work on unrelated types never contends. Each public operation
/// takes exactly one partition lock, which keeps every registration and
/// marking atomic on its own.
///
/// One store is created per process and shared by `Arc`.
#[derive(Debug, Default)]
pub struct CoverageStore {
    partitions: DashMap<DeclaringType, Arc<Mutex<TypePartition>>>,
}

/// Per-type counters reported by [`CoverageStore::summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSummary {
    pub declaring_type: DeclaringType,
    pub pairs: usize,
    pub covered: usize,
    pub puts: usize,
}

impl TypeSummary {
    pub fn uncovered(&self) -> usize {
        self.pairs - self.covered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub types: Vec<TypeSummary>,
}

impl StoreSummary {
    pub fn total_pairs(&self) -> usize {
        self.types.iter().map(|t| t.pairs).sum()
    }

    pub fn total_covered(&self) -> usize {
        self.types.iter().map(|t| t.covered).sum()
    }

    pub fn total_puts(&self) -> usize {
        self.types.iter().map(|t| t.puts).sum()
    }
}

impl CoverageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated from the snapshot at `path`, if any.
    pub fn open(path: &Path, format: SnapshotFormat) -> Result<Self, StoreError> {
        let store = Self::new();
        let snapshot = StoreSnapshot::load_from_path(path, format)?;
        let restored = store.restore(&snapshot);
        debug!(path = ?path, pairs = restored, "Restored coverage store from snapshot");
        Ok(store)
    }

    /// Returns the partition for `ty`, creating it if needed. The map guard is
    /// released before the caller locks the partition.
    fn partition(&self, ty: &DeclaringType) -> Arc<Mutex<TypePartition>> {
        if let Some(existing) = self.partitions.get(ty) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.partitions.entry(ty.clone()).or_default().value())
    }

    fn existing_partition(&self, ty: &DeclaringType) -> Option<Arc<Mutex<TypePartition>>> {
        self.partitions
            .get(ty)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Inserts `pair` as `Uncovered` unless it is already registered.
    ///
    /// Returns `true` only when the pair was newly inserted.
    pub fn register(&self, pair: DuPair) -> bool {
        let partition = self.partition(pair.declaring_type());
        let mut guard = partition.lock();
        if guard.pairs.contains_key(&pair) {
            return false;
        }
        guard.pairs.insert(pair, CoverageStatus::Uncovered);
        true
    }

    /// Marks a registered pair as covered. Unknown pairs are ignored.
    ///
    /// Returns `true` if the status changed.
    pub fn mark_covered(&self, pair: &DuPair) -> bool {
        let Some(partition) = self.existing_partition(pair.declaring_type()) else {
            return false;
        };
        let mut guard = partition.lock();
        match guard.pairs.get_mut(pair) {
            Some(status) if *status == CoverageStatus::Uncovered => {
                *status = CoverageStatus::Covered;
                true
            }
            _ => false,
        }
    }

    pub fn status_of(&self, pair: &DuPair) -> Option<CoverageStatus> {
        let partition = self.existing_partition(pair.declaring_type())?;
        let guard = partition.lock();
        guard.pairs.get(pair).copied()
    }

    /// A point-in-time copy of the uncovered pairs of `ty`, in insertion order.
    pub fn uncovered_pairs_for(&self, ty: &DeclaringType) -> Vec<DuPair> {
        let Some(partition) = self.existing_partition(ty) else {
            return Vec::new();
        };
        let guard = partition.lock();
        guard
            .pairs
            .iter()
            .filter(|(_, status)| **status == CoverageStatus::Uncovered)
            .map(|(pair, _)| pair.clone())
            .collect()
    }

    pub fn has_generated_put(&self, ty: &DeclaringType, body: &str) -> bool {
        self.existing_partition(ty)
            .is_some_and(|partition| partition.lock().puts.contains(body))
    }

    /// Remembers that a PUT with `body` was generated for `ty`.
    ///
    /// Returns `false` if the body was already recorded.
    pub fn record_put(&self, ty: &DeclaringType, body: &str) -> bool {
        let partition = self.partition(ty);
        let mut guard = partition.lock();
        guard.puts.insert(body.to_string())
    }

    pub fn puts_for(&self, ty: &DeclaringType) -> Vec<String> {
        self.existing_partition(ty)
            .map(|partition| partition.lock().puts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every type with at least one pair or PUT, sorted by name.
    pub fn types(&self) -> Vec<DeclaringType> {
        let mut types: Vec<DeclaringType> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    /// Types that currently have at least one uncovered pair, sorted by name.
    pub fn types_with_uncovered(&self) -> Vec<DeclaringType> {
        self.types()
            .into_iter()
            .filter(|ty| {
                self.existing_partition(ty).is_some_and(|partition| {
                    partition
                        .lock()
                        .pairs
                        .values()
                        .any(|status| *status == CoverageStatus::Uncovered)
                })
            })
            .collect()
    }

    pub fn summary(&self) -> StoreSummary {
        let types = self
            .types()
            .into_iter()
            .filter_map(|ty| {
                let partition = self.existing_partition(&ty)?;
                let guard = partition.lock();
                let covered = guard
                    .pairs
                    .values()
                    .filter(|status| **status == CoverageStatus::Covered)
                    .count();
                Some(TypeSummary {
                    pairs: guard.pairs.len(),
                    covered,
                    puts: guard.puts.len(),
                    declaring_type: ty,
                })
            })
            .collect();
        StoreSummary { types }
    }

    /// Drops every pair, status and PUT record.
    ///
    /// Must not run concurrently with any mutation of the store. A write
    /// through a partition fetched before the clear lands in a detached
    /// partition and is lost.
    pub fn reset(&self) {
        self.partitions.clear();
    }

    /// Copies the whole store into a serializable snapshot, types sorted by
    /// name and pairs in insertion order.
    pub fn snapshot(&self) -> StoreSnapshot {
        let types = self
            .types()
            .into_iter()
            .filter_map(|ty| {
                let partition = self.existing_partition(&ty)?;
                let guard = partition.lock();
                Some(TypeSnapshot {
                    declaring_type: ty.as_str().to_string(),
                    pairs: guard
                        .pairs
                        .iter()
                        .map(|(pair, status)| PairSnapshot {
                            field: pair.field().name().to_string(),
                            def_method: pair.def_method().name().to_string(),
                            use_method: pair.use_method().name().to_string(),
                            covered: *status == CoverageStatus::Covered,
                        })
                        .collect(),
                    puts: guard.puts.iter().cloned().collect(),
                })
            })
            .collect();
        StoreSnapshot { types }
    }

    /// Re-applies a snapshot through `register`, `mark_covered` and
    /// `record_put`, so covered pairs in the store stay covered.
    ///
    /// Returns the number of pairs that were newly registered.
    pub fn restore(&self, snapshot: &StoreSnapshot) -> usize {
        let mut registered = 0;
        for ty_snapshot in &snapshot.types {
            let ty = DeclaringType::new(ty_snapshot.declaring_type.as_str());
            for entry in &ty_snapshot.pairs {
                let pair = match DuPair::new(
                    FieldHandle::new(entry.field.as_str(), ty.clone()),
                    MethodHandle::new(entry.def_method.as_str(), ty.clone()),
                    MethodHandle::new(entry.use_method.as_str(), ty.clone()),
                ) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed pair in snapshot");
                        continue;
                    }
                };
                if self.register(pair.clone()) {
                    registered += 1;
                }
                if entry.covered {
                    self.mark_covered(&pair);
                }
            }
            for body in &ty_snapshot.puts {
                self.record_put(&ty, body);
            }
        }
        registered
    }

    pub fn save_to_path(&self, path: &Path, format: SnapshotFormat) -> Result<(), StoreError> {
        self.snapshot().save_to_path(path, format)
    }
}

/// Encoding used when the store is persisted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotFormat {
    #[default]
    Json,
    Bincode,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub types: Vec<TypeSnapshot>,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeSnapshot {
    pub declaring_type: String,
    pub pairs: Vec<PairSnapshot>,
    pub puts: Vec<String>,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct PairSnapshot {
    pub field: String,
    pub def_method: String,
    pub use_method: String,
    pub covered: bool,
}

impl StoreSnapshot {
    fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Writes the snapshot next to `path` and renames it into place, so a
    /// crash mid-write leaves the previous snapshot intact.
    pub fn save_to_path(&self, path: &Path, format: SnapshotFormat) -> Result<(), StoreError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| {
            StoreError::Io(format!("Failed to create snapshot directory {:?}: {}", dir, e))
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            StoreError::Io(format!("Failed to create temp file in {:?}: {}", dir, e))
        })?;

        match format {
            SnapshotFormat::Json => {
                let mut writer = BufWriter::new(temp.as_file_mut());
                serde_json::to_writer_pretty(&mut writer, self).map_err(|e| {
                    StoreError::Serialization(format!(
                        "Failed to serialize snapshot to JSON for {:?}: {}",
                        path, e
                    ))
                })?;
                writer.flush()?;
            }
            SnapshotFormat::Bincode => {
                let bytes = bincode::encode_to_vec(self, Self::bincode_config())?;
                temp.write_all(&bytes).map_err(|e| {
                    StoreError::Io(format!("Failed to write snapshot for {:?}: {}", path, e))
                })?;
            }
        }

        temp.persist(path).map_err(|e| {
            StoreError::Io(format!("Failed to move snapshot into place at {:?}: {}", path, e))
        })?;
        Ok(())
    }

    /// Reads a snapshot. A missing or empty file yields an empty snapshot.
    pub fn load_from_path(path: &Path, format: SnapshotFormat) -> Result<Self, StoreError> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let file = File::open(path)
            .map_err(|e| StoreError::Io(format!("Failed to open snapshot {:?}: {}", path, e)))?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::default());
        }

        match format {
            SnapshotFormat::Json => serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                StoreError::Deserialization(format!(
                    "Failed to parse JSON from snapshot {:?}: {}. The file might be corrupted.",
                    path, e
                ))
            }),
            SnapshotFormat::Bincode => {
                let bytes = fs::read(path)?;
                let (snapshot, _length): (Self, usize) =
                    bincode::decode_from_slice(&bytes, Self::bincode_config())?;
                Ok(snapshot)
            }
        }
    }
}
