//! File-backed event store.
//!
//! Streams are stored as JSON Lines under a base directory. Commits stage
//! every touched file next to its destination and rename them into place,
//! so readers never observe a half-written file.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::async_store::{AsyncEventStore, AsyncTransaction};
use crate::event::{Event, SequenceOrder, StoredEvent};
use crate::registry::Registry;
use crate::snapshot::Snapshot;
use crate::store::{EventStore, Transaction};

/// Manages the on-disk directory layout of a [`FileStore`].
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <id>/
///             events.jsonl        -- one StoredEvent per line
///     snapshots/
///         <id>/
///             <snapshot_kind>.jsonl
///     meta/
///         streams.jsonl           -- stream registry, one entry per id
/// ```
///
/// `StreamLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a new `StreamLayout` rooted at the given base directory.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for all store data. It does not need
    ///   to exist yet; directories are created on the first commit.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns `<base_dir>/streams/<id>`.
    pub fn stream_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join("streams").join(id)
    }

    /// Returns `<base_dir>/streams/<id>/events.jsonl`.
    pub fn events_path(&self, id: &str) -> PathBuf {
        self.stream_dir(id).join("events.jsonl")
    }

    /// Returns `<base_dir>/snapshots/<id>/<snapshot_kind>.jsonl`.
    pub fn snapshot_path(&self, id: &str, snapshot_kind: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(id)
            .join(format!("{snapshot_kind}.jsonl"))
    }

    /// Returns `<base_dir>/meta`.
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    /// Returns `<base_dir>/meta/streams.jsonl`, the stream registry.
    pub fn registry_path(&self) -> PathBuf {
        self.meta_dir().join("streams.jsonl")
    }

    /// Ids recorded in the stream registry, in registration order.
    ///
    /// Lines that are not registry entries are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the registry exists but cannot be read.
    pub fn registered_streams(&self) -> io::Result<Vec<String>> {
        let path = self.registry_path();
        let mut ids = Vec::new();
        for line in read_lines(&path)? {
            match serde_json::from_str::<StreamEntry>(&line) {
                Ok(entry) => ids.push(entry.id),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "ignoring corrupt stream registry line"
                ),
            }
        }
        Ok(ids)
    }

    /// Registry lines for those of `ids` not registered yet. Empty when
    /// every id is already known.
    fn registrations<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
    ) -> io::Result<Vec<String>> {
        let known: HashSet<String> = self.registered_streams()?.into_iter().collect();
        let ts = chrono::Utc::now().timestamp();
        ids.into_iter()
            .filter(|id| !known.contains(*id))
            .map(|id| {
                serde_json::to_string(&StreamEntry { id: id.clone(), ts }).map_err(io::Error::from)
            })
            .collect()
    }

    /// Lists all stream ids, read from the stream registry.
    ///
    /// # Returns
    ///
    /// A sorted `Vec<String>`. Empty if nothing was committed yet.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the registry exists but cannot be read.
    pub fn list_streams(&self) -> io::Result<Vec<String>> {
        let mut ids = self.registered_streams()?;
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// One line of `meta/streams.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
struct StreamEntry {
    id: String,
    /// Unix seconds of the first commit that wrote the stream.
    ts: i64,
}

/// Reject ids and kinds that would escape their directory.
fn check_component(value: &str) -> io::Result<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{value}` cannot be used as a path component"),
        ));
    }
    Ok(())
}

/// Read a JSON Lines file. A missing file reads as empty.
fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    BufReader::new(file)
        .lines()
        .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("jsonl.tmp")
}

/// Builder for [`FileStore`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use eventfold_kernel::{FileStore, Registry};
///
/// let registry = Arc::new(Registry::builder().build());
/// let store = FileStore::builder("/var/lib/users")
///     .auto_snapshot_each(50)
///     .open(registry)
///     .expect("open store");
/// # let _ = store;
/// ```
#[derive(Debug, Clone)]
pub struct FileStoreBuilder {
    base_dir: PathBuf,
    auto_snapshot_each: Option<NonZeroU64>,
}

impl FileStoreBuilder {
    /// Cadence given to holders this store loads. `0` disables it.
    pub fn auto_snapshot_each(mut self, n: u64) -> Self {
        self.auto_snapshot_each = NonZeroU64::new(n);
        self
    }

    /// Create the base directory if needed and open the store.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the base directory cannot be created.
    pub fn open(self, registry: Arc<Registry>) -> io::Result<FileStore> {
        fs::create_dir_all(&self.base_dir)?;
        tracing::debug!(base_dir = %self.base_dir.display(), "file store opened");
        Ok(FileStore {
            layout: StreamLayout::new(self.base_dir),
            registry,
            auto_snapshot_each: self.auto_snapshot_each,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }
}

/// Event store persisting streams as JSON Lines files.
///
/// Commits within one process are serialized. Each file a commit touches
/// is replaced atomically.
///
/// `Clone` is cheap; clones share the commit lock.
#[derive(Debug, Clone)]
pub struct FileStore {
    layout: StreamLayout,
    registry: Arc<Registry>,
    auto_snapshot_each: Option<NonZeroU64>,
    commit_lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn builder(base_dir: impl Into<PathBuf>) -> FileStoreBuilder {
        FileStoreBuilder {
            base_dir: base_dir.into(),
            auto_snapshot_each: None,
        }
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    /// Ids of every stream with committed events.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the streams directory cannot be read.
    pub fn list_streams(&self) -> io::Result<Vec<String>> {
        self.layout.list_streams()
    }

    fn begin(&self) -> FileTransaction {
        FileTransaction {
            layout: self.layout.clone(),
            commit_lock: Arc::clone(&self.commit_lock),
            events: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    fn stage_events(tx: &mut FileTransaction, id: &str, events: &[Event]) -> io::Result<()> {
        check_component(id)?;
        let lines = tx.events.entry(id.to_owned()).or_default();
        for event in events {
            lines.push(serde_json::to_string(&StoredEvent::encode(event)?)?);
        }
        Ok(())
    }

    fn stage_snapshots(tx: &mut FileTransaction, snapshots: &[Snapshot]) -> io::Result<()> {
        for snapshot in snapshots {
            check_component(&snapshot.owner_id)?;
            check_component(&snapshot.kind)?;
            tx.snapshots
                .entry((snapshot.owner_id.clone(), snapshot.kind.clone()))
                .or_default()
                .push(serde_json::to_string(snapshot)?);
        }
        Ok(())
    }

    fn read_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> io::Result<Vec<Event>> {
        check_component(id)?;
        let path = self.layout.events_path(id);
        let mut events = Vec::new();
        for (n, line) in read_lines(&path)?.iter().enumerate() {
            let stored: StoredEvent = serde_json::from_str(line).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}:{}: {e}", path.display(), n + 1),
                )
            })?;
            let in_range = after.is_none_or(|after| stored.sequence_order > after)
                && as_of.is_none_or(|as_of| stored.sequence_order <= as_of);
            if in_range {
                let event = self
                    .registry
                    .decode(&stored)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                events.push(event);
            }
        }
        Ok(events)
    }

    fn read_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> io::Result<Option<Snapshot>> {
        check_component(id)?;
        check_component(snapshot_kind)?;
        let path = self.layout.snapshot_path(id, snapshot_kind);

        let mut latest: Option<Snapshot> = None;
        for line in read_lines(&path)? {
            let snapshot: Snapshot = match serde_json::from_str(&line) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "ignoring corrupt snapshot line"
                    );
                    continue;
                }
            };
            let eligible = as_of.is_none_or(|as_of| snapshot.sequence_order <= as_of);
            let newer = latest
                .as_ref()
                .is_none_or(|l| snapshot.sequence_order >= l.sequence_order);
            if eligible && newer {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }
}

/// Lines staged against a [`FileStore`]. Dropping it discards them.
#[derive(Debug)]
pub struct FileTransaction {
    layout: StreamLayout,
    commit_lock: Arc<Mutex<()>>,
    events: BTreeMap<String, Vec<String>>,
    snapshots: BTreeMap<(String, String), Vec<String>>,
}

impl FileTransaction {
    /// Stage every touched file, then publish them all.
    ///
    /// Everything that can fail for a reason other than the final renames
    /// (directory creation, reads, serialization, temp writes) happens in
    /// the staging phase, which leaves the store untouched on error. A
    /// failed rename reverts the files already published.
    fn write(self) -> io::Result<()> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut targets: Vec<(PathBuf, Vec<String>)> = Vec::new();
        let registrations = self.layout.registrations(self.events.keys())?;
        for (id, lines) in self.events {
            targets.push((self.layout.events_path(&id), lines));
        }
        for ((id, kind), lines) in self.snapshots {
            targets.push((self.layout.snapshot_path(&id, &kind), lines));
        }
        if !registrations.is_empty() {
            targets.push((self.layout.registry_path(), registrations));
        }

        let mut staged: Vec<Staged> = Vec::with_capacity(targets.len());
        for (path, lines) in targets {
            match Staged::prepare(path, &lines) {
                Ok(file) => staged.push(file),
                Err(e) => {
                    discard(&staged);
                    return Err(e);
                }
            }
        }

        publish(&staged)?;
        tracing::debug!(files = staged.len(), "file transaction committed");
        Ok(())
    }
}

/// A file written to its temp sibling and waiting to be renamed into place.
#[derive(Debug)]
struct Staged {
    tmp: PathBuf,
    path: PathBuf,
    /// Length of `path` before the commit, `None` if it did not exist.
    original_len: Option<u64>,
}

impl Staged {
    /// Write the existing contents of `path` plus `lines` to its temp
    /// sibling.
    fn prepare(path: PathBuf, lines: &[String]) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (mut contents, original_len) = match fs::read(&path) {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                (bytes, Some(len))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (Vec::new(), None),
            Err(e) => return Err(e),
        };
        if contents.last().is_some_and(|b| *b != b'\n') {
            contents.push(b'\n');
        }
        for line in lines {
            contents.extend_from_slice(line.as_bytes());
            contents.push(b'\n');
        }

        let tmp = tmp_path(&path);
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(&contents)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(Self {
            tmp,
            path,
            original_len,
        })
    }

    /// Undo a published rename by cutting the file back to its old length,
    /// or removing it if the commit created it.
    fn revert(&self) -> io::Result<()> {
        match self.original_len {
            Some(len) => OpenOptions::new().write(true).open(&self.path)?.set_len(len),
            None => fs::remove_file(&self.path),
        }
    }
}

fn discard(staged: &[Staged]) {
    for file in staged {
        let _ = fs::remove_file(&file.tmp);
    }
}

/// Rename every staged file into place. On failure, files already renamed
/// are reverted and the remaining temp files removed.
fn publish(staged: &[Staged]) -> io::Result<()> {
    for (n, file) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(&file.tmp, &file.path) {
            for done in &staged[..n] {
                if let Err(undo) = done.revert() {
                    tracing::error!(
                        path = %done.path.display(),
                        error = %undo,
                        "failed to revert a partially published commit"
                    );
                }
            }
            discard(&staged[n..]);
            return Err(e);
        }
    }
    Ok(())
}

impl Transaction for FileTransaction {
    type Error = io::Error;

    fn commit(self) -> io::Result<()> {
        self.write()
    }
}

#[async_trait]
impl AsyncTransaction for FileTransaction {
    type Error = io::Error;

    async fn commit(self) -> io::Result<()> {
        tokio::task::spawn_blocking(move || self.write())
            .await
            .map_err(io::Error::other)?
    }
}

impl EventStore for FileStore {
    type Error = io::Error;
    type Transaction = FileTransaction;

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.auto_snapshot_each
    }

    fn transaction(&self) -> io::Result<FileTransaction> {
        Ok(self.begin())
    }

    fn get_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> io::Result<Vec<Event>> {
        self.read_events(id, after, as_of)
    }

    fn get_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> io::Result<Option<Snapshot>> {
        self.read_last_snapshot(id, snapshot_kind, as_of)
    }

    fn save_events(&self, tx: &mut FileTransaction, id: &str, events: &[Event]) -> io::Result<()> {
        Self::stage_events(tx, id, events)
    }

    fn save_snapshots(&self, tx: &mut FileTransaction, snapshots: &[Snapshot]) -> io::Result<()> {
        Self::stage_snapshots(tx, snapshots)
    }
}

/// Reads and commits run on tokio's blocking pool.
#[async_trait]
impl AsyncEventStore for FileStore {
    type Error = io::Error;
    type Transaction = FileTransaction;

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.auto_snapshot_each
    }

    async fn transaction(&self) -> io::Result<FileTransaction> {
        Ok(self.begin())
    }

    async fn get_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> io::Result<Vec<Event>> {
        let store = self.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || store.read_events(&id, after, as_of))
            .await
            .map_err(io::Error::other)?
    }

    async fn get_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> io::Result<Option<Snapshot>> {
        let store = self.clone();
        let id = id.to_owned();
        let kind = snapshot_kind.to_owned();
        tokio::task::spawn_blocking(move || store.read_last_snapshot(&id, &kind, as_of))
            .await
            .map_err(io::Error::other)?
    }

    async fn save_events(
        &self,
        tx: &mut FileTransaction,
        id: &str,
        events: &[Event],
    ) -> io::Result<()> {
        Self::stage_events(tx, id, events)
    }

    async fn save_snapshots(
        &self,
        tx: &mut FileTransaction,
        snapshots: &[Snapshot],
    ) -> io::Result<()> {
        Self::stage_snapshots(tx, snapshots)
    }
}
