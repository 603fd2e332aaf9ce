//! In-process event store.
//!
//! Keeps every stream in memory behind a single [`RwLock`]. Useful for
//! tests and for services that rebuild their state on startup. Both the
//! blocking and the async store contracts are implemented; writes are
//! staged on the transaction and applied under one write lock at commit.

use std::collections::HashMap;
use std::convert::Infallible;
use std::num::NonZeroU64;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::async_store::{AsyncEventStore, AsyncTransaction};
use crate::event::{Event, SequenceOrder};
use crate::registry::Registry;
use crate::snapshot::Snapshot;
use crate::store::{EventStore, Transaction};

#[derive(Debug, Default)]
struct Streams {
    /// Events per stream id, in commit order.
    events: HashMap<String, Vec<Event>>,
    /// Snapshots per stream id, then per snapshot kind.
    snapshots: HashMap<String, HashMap<String, Vec<Snapshot>>>,
}

/// Events and snapshots held in memory.
///
/// `Clone` is cheap; clones share the same streams.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_kernel::{InMemoryStore, Registry};
///
/// let store = InMemoryStore::new(Arc::new(Registry::builder().build()))
///     .with_auto_snapshot_each(100);
/// assert_eq!(store.event_count("missing"), 0);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    registry: Arc<Registry>,
    streams: Arc<RwLock<Streams>>,
    auto_snapshot_each: Option<NonZeroU64>,
}

impl InMemoryStore {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            streams: Arc::default(),
            auto_snapshot_each: None,
        }
    }

    /// Cadence given to holders this store loads. `0` disables it.
    pub fn with_auto_snapshot_each(mut self, n: u64) -> Self {
        self.auto_snapshot_each = NonZeroU64::new(n);
        self
    }

    /// Number of committed events for `id`.
    pub fn event_count(&self, id: &str) -> usize {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams.events.get(id).map_or(0, Vec::len)
    }

    /// Committed snapshots of `kind` for `id`, in commit order.
    pub fn snapshots(&self, id: &str, kind: &str) -> Vec<Snapshot> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .snapshots
            .get(id)
            .and_then(|by_kind| by_kind.get(kind))
            .cloned()
            .unwrap_or_default()
    }

    /// Ids with at least one committed event or snapshot.
    pub fn list_streams(&self) -> Vec<String> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = streams
            .events
            .keys()
            .chain(streams.snapshots.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            streams: Arc::clone(&self.streams),
            events: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    fn read_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> Vec<Event> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = streams.events.get(id) else {
            return Vec::new();
        };
        stream
            .iter()
            .filter(|e| after.is_none_or(|after| e.sequence_order() > after))
            .filter(|e| as_of.is_none_or(|as_of| e.sequence_order() <= as_of))
            .cloned()
            .collect()
    }

    fn read_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> Option<Snapshot> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .snapshots
            .get(id)?
            .get(snapshot_kind)?
            .iter()
            .filter(|s| as_of.is_none_or(|as_of| s.sequence_order <= as_of))
            .max_by_key(|s| s.sequence_order)
            .cloned()
    }
}

/// Writes staged against an [`InMemoryStore`].
///
/// Nothing is visible to readers until [`commit`](Transaction::commit);
/// dropping the transaction discards the staged writes.
#[derive(Debug)]
pub struct MemoryTransaction {
    streams: Arc<RwLock<Streams>>,
    events: Vec<(String, Event)>,
    snapshots: Vec<Snapshot>,
}

impl MemoryTransaction {
    fn apply(self) {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        for (id, event) in self.events {
            streams.events.entry(id).or_default().push(event);
        }
        for snapshot in self.snapshots {
            streams
                .snapshots
                .entry(snapshot.owner_id.clone())
                .or_default()
                .entry(snapshot.kind.clone())
                .or_default()
                .push(snapshot);
        }
    }
}

impl Transaction for MemoryTransaction {
    type Error = Infallible;

    fn commit(self) -> Result<(), Infallible> {
        self.apply();
        Ok(())
    }
}

#[async_trait]
impl AsyncTransaction for MemoryTransaction {
    type Error = Infallible;

    async fn commit(self) -> Result<(), Infallible> {
        self.apply();
        Ok(())
    }
}

impl EventStore for InMemoryStore {
    type Error = Infallible;
    type Transaction = MemoryTransaction;

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.auto_snapshot_each
    }

    fn transaction(&self) -> Result<MemoryTransaction, Infallible> {
        Ok(self.begin())
    }

    fn get_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> Result<Vec<Event>, Infallible> {
        Ok(self.read_events(id, after, as_of))
    }

    fn get_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Option<Snapshot>, Infallible> {
        Ok(self.read_last_snapshot(id, snapshot_kind, as_of))
    }

    fn save_events(
        &self,
        tx: &mut MemoryTransaction,
        id: &str,
        events: &[Event],
    ) -> Result<(), Infallible> {
        tx.events
            .extend(events.iter().map(|e| (id.to_owned(), e.clone())));
        Ok(())
    }

    fn save_snapshots(
        &self,
        tx: &mut MemoryTransaction,
        snapshots: &[Snapshot],
    ) -> Result<(), Infallible> {
        tx.snapshots.extend_from_slice(snapshots);
        Ok(())
    }
}

#[async_trait]
impl AsyncEventStore for InMemoryStore {
    type Error = Infallible;
    type Transaction = MemoryTransaction;

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.auto_snapshot_each
    }

    async fn transaction(&self) -> Result<MemoryTransaction, Infallible> {
        Ok(self.begin())
    }

    async fn get_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> Result<Vec<Event>, Infallible> {
        Ok(self.read_events(id, after, as_of))
    }

    async fn get_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Option<Snapshot>, Infallible> {
        Ok(self.read_last_snapshot(id, snapshot_kind, as_of))
    }

    async fn save_events(
        &self,
        tx: &mut MemoryTransaction,
        id: &str,
        events: &[Event],
    ) -> Result<(), Infallible> {
        tx.events
            .extend(events.iter().map(|e| (id.to_owned(), e.clone())));
        Ok(())
    }

    async fn save_snapshots(
        &self,
        tx: &mut MemoryTransaction,
        snapshots: &[Snapshot],
    ) -> Result<(), Infallible> {
        tx.snapshots.extend_from_slice(snapshots);
        Ok(())
    }
}
