//! Persisted index snapshots and the in-process pointer to the live one.
//!
//! A snapshot is the vector index, its metadata table and a manifest. Each
//! build writes a new generation directory:
//!
//! ```text
//! snapshots/
//!   CURRENT                    name of the live generation
//!   gen-20240101T000000-ab12cd34/
//!     index.bin
//!     metadata.json
//!     manifest.json
//! ```
//!
//! Files are written into `.staging-<generation>`, the directory is renamed
//! into place, and only then is `CURRENT` replaced (write to a temp file +
//! rename). A failure at any step leaves the previous generation live.
//!
//! Several processes may share one snapshot root (`build-index` next to a
//! running `serve`). Writing requires a [`SnapshotWriter`], which owns the
//! root's `LOCK` file for as long as it lives; a second writer is refused
//! with `SnapshotError::Locked`. Readers take no lock. A server notices
//! generations published by another process through [`SnapshotReloader`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::index::{IndexError, VectorIndex};
use crate::models::{EmbeddingConfig, RecordMetadata};

const CURRENT_FILE: &str = "CURRENT";
const INDEX_FILE: &str = "index.bin";
const METADATA_FILE: &str = "metadata.json";
const MANIFEST_FILE: &str = "manifest.json";
const GENERATION_PREFIX: &str = "gen-";
const STAGING_PREFIX: &str = ".staging-";
const LOCK_FILE: &str = "LOCK";

/// A `LOCK` file untouched for this long is taken to belong to a writer that
/// died without releasing it.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("snapshot serialization failed: {0}")]
    Serialization(String),

    /// Index, metadata and manifest disagree with each other.
    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),

    #[error("snapshot generation already exists: {0}")]
    AlreadyExists(String),

    /// Another writer, possibly in another process, holds the snapshot root.
    #[error("snapshot directory is locked ({0})")]
    Locked(String),
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Describes one persisted generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotManifest {
    pub generation: String,
    pub model_name: String,
    pub dimension: usize,
    pub count: usize,
    pub built_at: DateTime<Utc>,

    /// Record ids that were in the store but failed to embed.
    #[serde(default)]
    pub excluded: Vec<String>,
}

impl SnapshotManifest {
    pub fn embedding_config(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            model_name: self.model_name.clone(),
            dimension: self.dimension,
        }
    }
}

/// A fresh generation name, unique and ordered by build time.
pub fn new_generation() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}-{}",
        GENERATION_PREFIX,
        Utc::now().format("%Y%m%dT%H%M%S"),
        &suffix[..8]
    )
}

/// An immutable, internally consistent index + metadata pair.
#[derive(Debug)]
pub struct Snapshot {
    manifest: SnapshotManifest,
    index: VectorIndex,
    metadata: Vec<RecordMetadata>,
}

impl Snapshot {
    /// Assemble a snapshot, checking that metadata row `i` describes index
    /// position `i` and that the manifest matches both.
    pub fn new(
        manifest: SnapshotManifest,
        index: VectorIndex,
        metadata: Vec<RecordMetadata>,
    ) -> SnapshotResult<Self> {
        if index.count() != metadata.len() {
            return Err(SnapshotError::Inconsistent(format!(
                "index holds {} vectors but metadata has {} rows",
                index.count(),
                metadata.len()
            )));
        }
        if manifest.count != index.count() || manifest.dimension != index.dimension() {
            return Err(SnapshotError::Inconsistent(format!(
                "manifest describes {} x {} but index is {} x {}",
                manifest.count,
                manifest.dimension,
                index.count(),
                index.dimension()
            )));
        }
        if let Some((position, row)) = index
            .ids()
            .iter()
            .zip(&metadata)
            .enumerate()
            .find_map(|(i, (id, row))| (*id != row.record_id).then_some((i, row)))
        {
            return Err(SnapshotError::Inconsistent(format!(
                "position {} holds {} in the index but {} in metadata",
                position,
                index.ids()[position],
                row.record_id
            )));
        }

        Ok(Self {
            manifest,
            index,
            metadata,
        })
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn metadata(&self) -> &[RecordMetadata] {
        &self.metadata
    }

    pub fn generation(&self) -> &str {
        &self.manifest.generation
    }

    pub fn embedding_config(&self) -> EmbeddingConfig {
        self.manifest.embedding_config()
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }
}

/// Generation directories under one snapshot root.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Use `root` as the snapshot directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> SnapshotResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Name of the live generation, if any build has completed.
    pub fn current_generation(&self) -> SnapshotResult<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(contents) => {
                let name = contents.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the live generation, or `None` before the first build.
    pub fn load_current(&self) -> SnapshotResult<Option<Snapshot>> {
        match self.current_generation()? {
            Some(generation) => self.load(&generation).map(Some),
            None => Ok(None),
        }
    }

    /// Load a specific generation.
    pub fn load(&self, generation: &str) -> SnapshotResult<Snapshot> {
        let dir = self.root.join(generation);

        let manifest: SnapshotManifest =
            serde_json::from_reader(BufReader::new(File::open(dir.join(MANIFEST_FILE))?))?;
        let metadata: Vec<RecordMetadata> =
            serde_json::from_reader(BufReader::new(File::open(dir.join(METADATA_FILE))?))?;
        let index = VectorIndex::load(dir.join(INDEX_FILE))?;

        if manifest.generation != generation {
            return Err(SnapshotError::Inconsistent(format!(
                "directory {} holds manifest for {}",
                generation, manifest.generation
            )));
        }
        Snapshot::new(manifest, index, metadata)
    }

    /// Take the root's `LOCK` file.
    ///
    /// A lock older than six hours is assumed abandoned and broken with a
    /// warning. Staging directories found once the lock is held can only be
    /// leftovers of a writer that died, and are removed.
    ///
    /// # Errors
    /// `SnapshotError::Locked` while another writer holds the root
    pub fn lock(&self) -> SnapshotResult<SnapshotWriter> {
        let lock_path = self.root.join(LOCK_FILE);
        match create_lock_file(&lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock_path).unwrap_or_default();
                let holder = holder.trim().to_string();
                if !lock_is_stale(&lock_path) {
                    return Err(SnapshotError::Locked(holder));
                }
                warn!(path = %lock_path.display(), holder = %holder, "breaking stale snapshot lock");
                match fs::remove_file(&lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                create_lock_file(&lock_path).map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => SnapshotError::Locked(holder),
                    _ => SnapshotError::Io(e),
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        let writer = SnapshotWriter {
            store: self.clone(),
            lock_path,
        };
        writer.remove_orphaned_staging();
        Ok(writer)
    }
}

fn create_lock_file(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let written = writeln!(file, "pid {} since {}", std::process::id(), Utc::now().to_rfc3339())
        .and_then(|()| file.sync_all());
    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

/// Exclusive writer for one snapshot root, obtained from
/// [`SnapshotStore::lock`]. Dropping it releases the lock.
#[derive(Debug)]
pub struct SnapshotWriter {
    store: SnapshotStore,
    lock_path: PathBuf,
}

impl SnapshotWriter {
    /// Write `snapshot` as a new generation and make it current.
    ///
    /// Afterwards every generation except the new one and the one it replaced
    /// is pruned; a server that read the old `CURRENT` a moment ago can still
    /// load it. Pruning failures are logged and do not fail the call.
    pub fn persist(&self, snapshot: &Snapshot) -> SnapshotResult<()> {
        let root = &self.store.root;
        let generation = snapshot.generation();
        let final_dir = root.join(generation);
        if final_dir.exists() {
            return Err(SnapshotError::AlreadyExists(generation.to_string()));
        }
        let previous = self.store.current_generation()?;

        let staging = root.join(format!("{}{}", STAGING_PREFIX, generation));
        if let Err(e) = self.write_generation(&staging, snapshot) {
            remove_staging(&staging);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &final_dir) {
            remove_staging(&staging);
            return Err(e.into());
        }

        self.write_current(generation)?;
        info!(generation, count = snapshot.count(), "snapshot is now current");

        self.prune(generation, previous.as_deref());
        Ok(())
    }

    fn write_generation(&self, dir: &Path, snapshot: &Snapshot) -> SnapshotResult<()> {
        fs::create_dir_all(dir)?;
        snapshot.index.save(dir.join(INDEX_FILE))?;
        write_json(&dir.join(METADATA_FILE), &snapshot.metadata)?;
        write_json(&dir.join(MANIFEST_FILE), &snapshot.manifest)?;
        Ok(())
    }

    fn write_current(&self, generation: &str) -> SnapshotResult<()> {
        let root = &self.store.root;
        let mut tmp = NamedTempFile::new_in(root)?;
        writeln!(tmp, "{}", generation)?;
        tmp.as_file().sync_all()?;
        tmp.persist(root.join(CURRENT_FILE))
            .map_err(|e| SnapshotError::Io(e.error))?;
        Ok(())
    }

    /// Remove generation directories other than `keep` and `previous`.
    ///
    /// Staging directories are left alone here; they are only cleared when
    /// the lock is taken.
    fn prune(&self, keep: &str, previous: Option<&str>) {
        let entries = match fs::read_dir(&self.store.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "could not list snapshot directory for pruning");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(GENERATION_PREFIX)
                || name == keep
                || Some(name.as_str()) == previous
                || !entry.path().is_dir()
            {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(generation = %name, "pruned old snapshot"),
                Err(e) => warn!(generation = %name, error = %e, "failed to prune old snapshot"),
            }
        }
    }

    fn remove_orphaned_staging(&self) {
        let Ok(entries) = fs::read_dir(&self.store.root) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!(path = %entry.path().display(), "removing staging directory left by an interrupted build");
                remove_staging(&entry.path());
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed to release snapshot lock");
        }
    }
}

fn remove_staging(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        debug!(path = %path.display(), error = %e, "could not remove staging directory");
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> SnapshotResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Shared pointer to the snapshot queries should use.
///
/// Readers hold the lock only long enough to clone the `Arc`, so a query that
/// started before a publish keeps using the snapshot it acquired.
#[derive(Debug, Default)]
pub struct SnapshotHandle {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }

    /// Replace the live snapshot.
    pub fn publish(&self, snapshot: Arc<Snapshot>) {
        *self.current.write() = Some(snapshot);
    }
}

/// Outcome of one [`SnapshotReloader::reload`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// `CURRENT` names the generation already live.
    Unchanged,
    /// A newer generation was loaded and published.
    Reloaded(String),
    /// `CURRENT` names a generation built with another embedding model.
    Rejected { generation: String, reason: String },
}

/// Publishes generations that another process made current.
///
/// A server owns one of these next to its [`SnapshotHandle`]. Each `reload`
/// compares `CURRENT` with the live snapshot; a failed load keeps the live
/// snapshot and is reported to the caller.
#[derive(Debug, Clone)]
pub struct SnapshotReloader {
    store: SnapshotStore,
    handle: Arc<SnapshotHandle>,
    expected: EmbeddingConfig,
    rejected: Arc<Mutex<Option<String>>>,
}

impl SnapshotReloader {
    pub fn new(store: SnapshotStore, handle: Arc<SnapshotHandle>, expected: EmbeddingConfig) -> Self {
        Self {
            store,
            handle,
            expected,
            rejected: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reload(&self) -> SnapshotResult<ReloadOutcome> {
        let Some(generation) = self.store.current_generation()? else {
            return Ok(ReloadOutcome::Unchanged);
        };
        let live = self.handle.current();
        if live.as_ref().is_some_and(|s| s.generation() == generation)
            || self.rejected.lock().as_deref() == Some(generation.as_str())
        {
            return Ok(ReloadOutcome::Unchanged);
        }

        let snapshot = self.store.load(&generation)?;
        if snapshot.embedding_config() != self.expected {
            let reason = format!(
                "built with {} ({} dims), serving {} ({} dims)",
                snapshot.manifest().model_name,
                snapshot.manifest().dimension,
                self.expected.model_name,
                self.expected.dimension
            );
            warn!(generation = %generation, reason = %reason, "not publishing snapshot");
            *self.rejected.lock() = Some(generation.clone());
            return Ok(ReloadOutcome::Rejected { generation, reason });
        }

        info!(
            generation = %generation,
            count = snapshot.count(),
            previous = live.as_ref().map(|s| s.generation()).unwrap_or("none"),
            "reloaded snapshot"
        );
        self.handle.publish(Arc::new(snapshot));
        Ok(ReloadOutcome::Reloaded(generation))
    }

    /// `reload` on the blocking pool.
    pub async fn reload_async(&self) -> SnapshotResult<ReloadOutcome> {
        let reloader = self.clone();
        tokio::task::spawn_blocking(move || reloader.reload())
            .await
            .map_err(|e| SnapshotError::Io(io::Error::other(e)))?
    }

    /// Call `reload` every `interval` until the returned task is aborted.
    pub fn spawn_watch(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reload_async().await {
                    warn!(error = %e, "snapshot reload failed, keeping the live snapshot");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(generation: &str, ids: &[&str]) -> Snapshot {
        snapshot_for_model(generation, ids, "mock")
    }

    fn snapshot_for_model(generation: &str, ids: &[&str], model: &str) -> Snapshot {
        let mut index = VectorIndex::new(2);
        let mut metadata = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            index.add(&[i as f32, 1.0], *id).unwrap();
            metadata.push(RecordMetadata {
                record_id: id.to_string(),
                title: format!("Title {}", id),
                abstract_text: format!("Abstract {}", id),
                url: None,
            });
        }
        let manifest = SnapshotManifest {
            generation: generation.to_string(),
            model_name: model.to_string(),
            dimension: 2,
            count: ids.len(),
            built_at: Utc::now(),
            excluded: vec![],
        };
        Snapshot::new(manifest, index, metadata).unwrap()
    }

    #[test]
    fn test_generation_names_are_unique() {
        let a = new_generation();
        let b = new_generation();
        assert!(a.starts_with(GENERATION_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_snapshot_rejects_misaligned_metadata() {
        let mut index = VectorIndex::new(1);
        index.add(&[0.0], "a").unwrap();
        index.add(&[1.0], "b").unwrap();
        let metadata = vec![
            RecordMetadata {
                record_id: "b".into(),
                title: String::new(),
                abstract_text: String::new(),
                url: None,
            },
            RecordMetadata {
                record_id: "a".into(),
                title: String::new(),
                abstract_text: String::new(),
                url: None,
            },
        ];
        let manifest = SnapshotManifest {
            generation: "gen-x".into(),
            model_name: "mock".into(),
            dimension: 1,
            count: 2,
            built_at: Utc::now(),
            excluded: vec![],
        };
        assert!(matches!(
            Snapshot::new(manifest, index, metadata),
            Err(SnapshotError::Inconsistent(_))
        ));
    }

    fn mock_config() -> EmbeddingConfig {
        EmbeddingConfig {
            model_name: "mock".to_string(),
            dimension: 2,
        }
    }

    #[test]
    fn test_persist_and_load_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots")).unwrap();
        assert!(store.load_current().unwrap().is_none());

        store.lock().unwrap().persist(&snapshot("gen-1", &["a", "b"])).unwrap();
        let loaded = store.load_current().unwrap().unwrap();

        assert_eq!(loaded.generation(), "gen-1");
        assert_eq!(loaded.index().ids(), &["a".to_string(), "b".to_string()]);
        assert_eq!(loaded.metadata()[1].title, "Title b");
    }

    #[test]
    fn test_new_generation_replaces_and_prunes_old() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let writer = store.lock().unwrap();

        writer.persist(&snapshot("gen-1", &["a"])).unwrap();
        writer.persist(&snapshot("gen-2", &["a", "b"])).unwrap();

        assert_eq!(store.current_generation().unwrap().as_deref(), Some("gen-2"));
        assert_eq!(store.load_current().unwrap().unwrap().count(), 2);
        // The generation just replaced stays loadable for readers mid-reload.
        assert!(dir.path().join("gen-1").exists());

        writer.persist(&snapshot("gen-3", &["a", "b", "c"])).unwrap();
        assert!(!dir.path().join("gen-1").exists());
        assert!(dir.path().join("gen-2").exists());
        assert_eq!(store.load_current().unwrap().unwrap().count(), 3);
    }

    #[test]
    fn test_failed_persist_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let writer = store.lock().unwrap();
        writer.persist(&snapshot("gen-1", &["a"])).unwrap();

        fs::create_dir_all(dir.path().join("gen-2")).unwrap();
        let result = writer.persist(&snapshot("gen-2", &["a", "b"]));

        assert!(matches!(result, Err(SnapshotError::AlreadyExists(_))));
        let live = store.load_current().unwrap().unwrap();
        assert_eq!(live.generation(), "gen-1");
        assert_eq!(live.count(), 1);
    }

    #[test]
    fn test_corrupt_generation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.lock().unwrap().persist(&snapshot("gen-1", &["a"])).unwrap();

        fs::write(dir.path().join("gen-1").join(METADATA_FILE), "[]").unwrap();
        assert!(matches!(
            store.load_current(),
            Err(SnapshotError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_second_store_on_same_root_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let first = SnapshotStore::open(dir.path()).unwrap();
        let second = SnapshotStore::open(dir.path()).unwrap();

        let writer = first.lock().unwrap();
        assert!(matches!(second.lock(), Err(SnapshotError::Locked(_))));

        // A build in flight in the other store keeps its staging directory.
        let in_flight = dir.path().join(".staging-gen-9");
        fs::create_dir_all(&in_flight).unwrap();
        writer.persist(&snapshot("gen-1", &["a"])).unwrap();
        writer.persist(&snapshot("gen-2", &["a", "b"])).unwrap();
        assert!(in_flight.exists());
        assert!(dir.path().join("gen-1").exists());

        drop(writer);
        assert!(!dir.path().join(LOCK_FILE).exists());
        second
            .lock()
            .unwrap()
            .persist(&snapshot("gen-3", &["a", "b", "c"]))
            .unwrap();
        assert_eq!(first.current_generation().unwrap().as_deref(), Some("gen-3"));
    }

    #[test]
    fn test_lock_clears_orphaned_staging() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let orphan = dir.path().join(".staging-gen-0");
        fs::create_dir_all(&orphan).unwrap();

        let _writer = store.lock().unwrap();
        assert!(!orphan.exists());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let lock_path = dir.path().join(LOCK_FILE);
        fs::write(&lock_path, "pid 1 since long ago\n").unwrap();

        assert!(matches!(store.lock(), Err(SnapshotError::Locked(_))));

        let old = std::time::SystemTime::now() - Duration::from_secs(7 * 60 * 60);
        File::options()
            .write(true)
            .open(&lock_path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let writer = store.lock().unwrap();
        let holder = fs::read_to_string(&lock_path).unwrap();
        assert!(holder.contains(&format!("pid {}", std::process::id())));
        drop(writer);
    }

    #[test]
    fn test_reloader_publishes_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let handle = Arc::new(SnapshotHandle::new());
        let reloader = SnapshotReloader::new(store.clone(), handle.clone(), mock_config());

        assert_eq!(reloader.reload().unwrap(), ReloadOutcome::Unchanged);

        // Another process builds while this one serves.
        let builder_store = SnapshotStore::open(dir.path()).unwrap();
        builder_store.lock().unwrap().persist(&snapshot("gen-1", &["a"])).unwrap();

        assert_eq!(
            reloader.reload().unwrap(),
            ReloadOutcome::Reloaded("gen-1".to_string())
        );
        assert_eq!(handle.current().unwrap().generation(), "gen-1");
        assert_eq!(reloader.reload().unwrap(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn test_reloader_rejects_other_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let handle = Arc::new(SnapshotHandle::with_snapshot(snapshot("gen-1", &["a"])));
        let reloader = SnapshotReloader::new(store.clone(), handle.clone(), mock_config());

        store
            .lock()
            .unwrap()
            .persist(&snapshot_for_model("gen-2", &["a", "b"], "other-model"))
            .unwrap();

        assert!(matches!(
            reloader.reload().unwrap(),
            ReloadOutcome::Rejected { ref generation, .. } if generation == "gen-2"
        ));
        assert_eq!(handle.current().unwrap().generation(), "gen-1");
        assert_eq!(reloader.reload().unwrap(), ReloadOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_live_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let handle = Arc::new(SnapshotHandle::with_snapshot(snapshot("gen-1", &["a"])));
        let reloader = SnapshotReloader::new(store, handle.clone(), mock_config());

        fs::write(dir.path().join(CURRENT_FILE), "gen-missing\n").unwrap();

        assert!(reloader.reload_async().await.is_err());
        assert_eq!(handle.current().unwrap().generation(), "gen-1");
    }

    #[test]
    fn test_handle_readers_keep_their_snapshot() {
        let handle = SnapshotHandle::new();
        assert!(handle.current().is_none());

        handle.publish(Arc::new(snapshot("gen-1", &["a"])));
        let held = handle.current().unwrap();

        handle.publish(Arc::new(snapshot("gen-2", &["a", "b"])));
        assert_eq!(held.generation(), "gen-1");
        assert_eq!(handle.current().unwrap().generation(), "gen-2");
    }
}
