//! Blocking event store contract.
//!
//! A backend supplies a handful of primitive hooks (transactions, event and
//! snapshot reads and writes). The provided [`EventStore::save`] and
//! [`EventStore::load`] family are written once on top of them, so every
//! backend drains buffers and reconstructs holders identically.

use std::num::NonZeroU64;
use std::sync::Arc;

use crate::aggregate::{Aggregate, Holder, Pending, State};
use crate::error::{ApplyError, StoreError};
use crate::event::{Event, SequenceOrder};
use crate::projection::{Projection, ProjectionState};
use crate::registry::Registry;
use crate::snapshot::Snapshot;

/// A scoped unit of work against a backend.
///
/// Writes made through the transaction become visible only when
/// [`commit`](Transaction::commit) succeeds. Dropping the transaction
/// without committing rolls it back, so every early return and panic path
/// releases it.
pub trait Transaction {
    type Error;

    /// Make the staged writes visible, all at once.
    fn commit(self) -> Result<(), Self::Error>;
}

/// Split a holder's pending buffer into the events and snapshots to
/// persist, each in buffer order.
///
/// Events of a holder that does not own its stream are dropped.
pub(crate) fn partition<H: Holder>(holder: &H) -> (Vec<Event>, Vec<Snapshot>) {
    let mut events = Vec::new();
    let mut snapshots = Vec::new();
    for entry in holder.pending() {
        match entry {
            Pending::Event(event) if H::OWNS_STREAM => events.push(event.clone()),
            Pending::Event(event) => tracing::trace!(
                id = holder.id(),
                event = event.kind().name(),
                "event not persisted for a holder without its own stream"
            ),
            Pending::Snapshot(snapshot) => snapshots.push(snapshot.clone()),
        }
    }
    (events, snapshots)
}

/// Seed a holder from an optional snapshot.
pub(crate) fn seed<H: Holder>(
    id: &str,
    snapshot: Option<&Snapshot>,
    registry: Arc<Registry>,
) -> Result<H, ApplyError> {
    match snapshot {
        Some(snapshot) => H::restore(id, snapshot, registry),
        None => Ok(H::empty(id, registry)),
    }
}

/// Replay an event tail in ascending sequence order.
///
/// Events the holder does not admit are skipped. The sort is stable, so
/// events sharing a marker keep the order the backend returned them in.
pub(crate) fn replay_tail<H: Holder>(holder: &mut H, mut events: Vec<Event>) -> Result<(), ApplyError> {
    events.sort_by_key(Event::sequence_order);
    for event in events.iter().filter(|e| H::admits(e.kind())) {
        holder.replay(event)?;
    }
    Ok(())
}

/// Blocking persistence boundary for aggregates and projections.
///
/// # Required hooks
///
/// - [`transaction`](EventStore::transaction) opens a scope that commits
///   only on [`Transaction::commit`] and rolls back when dropped.
/// - [`get_events`](EventStore::get_events) returns the stream of `id`
///   restricted to markers strictly after `after` and at or before `as_of`.
/// - [`get_last_snapshot`](EventStore::get_last_snapshot) returns the
///   latest snapshot of the given kind at or before `as_of`.
/// - [`save_events`](EventStore::save_events) and
///   [`save_snapshots`](EventStore::save_snapshots) stage writes on a
///   transaction.
///
/// Backend failures are returned unchanged inside
/// [`StoreError::Backend`].
pub trait EventStore {
    type Error: std::error::Error + Send + Sync + 'static;
    type Transaction: Transaction<Error = Self::Error>;

    /// Registry used to rebuild holders.
    fn registry(&self) -> &Arc<Registry>;

    /// Cadence handed to loaded holders. Replay itself never snapshots.
    fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        None
    }

    fn transaction(&self) -> Result<Self::Transaction, Self::Error>;

    fn get_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> Result<Vec<Event>, Self::Error>;

    fn get_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Option<Snapshot>, Self::Error>;

    fn save_events(
        &self,
        tx: &mut Self::Transaction,
        id: &str,
        events: &[Event],
    ) -> Result<(), Self::Error>;

    fn save_snapshots(
        &self,
        tx: &mut Self::Transaction,
        snapshots: &[Snapshot],
    ) -> Result<(), Self::Error>;

    /// Persist a holder's pending buffer in one transaction.
    ///
    /// Does nothing when the buffer is empty. The buffer is cleared only
    /// after the commit succeeds; on failure it is left intact and the
    /// call can be retried.
    ///
    /// For a [`Projection`] only the buffered snapshots are written. Its
    /// events live in the owner's stream, so buffered projection events
    /// are discarded with the rest of the buffer.
    ///
    /// # Errors
    ///
    /// [`StoreError::Backend`] if any step of the transaction fails.
    fn save<H: Holder>(&self, holder: &mut H) -> Result<(), StoreError<Self::Error>> {
        if holder.pending().is_empty() {
            return Ok(());
        }
        let (events, snapshots) = partition(holder);
        if events.is_empty() && snapshots.is_empty() {
            holder.clear_pending();
            return Ok(());
        }

        let mut tx = self.transaction().map_err(StoreError::Backend)?;
        if !events.is_empty() {
            self.save_events(&mut tx, holder.id(), &events)
                .map_err(StoreError::Backend)?;
        }
        if !snapshots.is_empty() {
            self.save_snapshots(&mut tx, &snapshots)
                .map_err(StoreError::Backend)?;
        }
        tx.commit().map_err(StoreError::Backend)?;

        holder.clear_pending();
        tracing::debug!(
            id = holder.id(),
            events = events.len(),
            snapshots = snapshots.len(),
            "pending buffer saved"
        );
        Ok(())
    }

    /// Rebuild an aggregate, optionally as it was at `as_of`.
    ///
    /// An id with no stored data yields an empty aggregate.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Backend`] if a read fails.
    /// - [`StoreError::Apply`] if the snapshot or an event cannot be
    ///   replayed.
    fn load<S: State>(
        &self,
        id: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Aggregate<S>, StoreError<Self::Error>> {
        self.load_holder(id, as_of)
    }

    /// Rebuild a projection of the aggregate `id` from its own snapshots
    /// and the whitelisted part of the aggregate's events.
    fn load_projection<P: ProjectionState>(
        &self,
        id: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Projection<P>, StoreError<Self::Error>> {
        self.load_holder(id, as_of)
    }

    /// Shared algorithm behind [`load`](EventStore::load) and
    /// [`load_projection`](EventStore::load_projection).
    ///
    /// Starts from the latest eligible snapshot of `H`'s snapshot kind (or
    /// an empty holder), then replays the events after the snapshot's
    /// marker up to `as_of`.
    fn load_holder<H: Holder>(
        &self,
        id: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<H, StoreError<Self::Error>> {
        let snapshot = self
            .get_last_snapshot(id, H::snapshot_kind(), as_of)
            .map_err(StoreError::Backend)?;
        let mut holder = seed::<H>(id, snapshot.as_ref(), Arc::clone(self.registry()))?;

        let after = snapshot.as_ref().map(|s| s.sequence_order);
        let events = self.get_events(id, after, as_of).map_err(StoreError::Backend)?;
        let replayed = events.len();
        replay_tail(&mut holder, events)?;
        holder.set_auto_snapshot_each(self.auto_snapshot_each());

        tracing::debug!(
            id,
            snapshot_kind = H::snapshot_kind(),
            from_snapshot = snapshot.is_some(),
            replayed,
            "holder loaded"
        );
        Ok(holder)
    }
}
