//! Suspension-capable event store contract.
//!
//! Mirrors [`EventStore`](crate::EventStore) with `async` hooks, for
//! backends that wait on I/O. Observable semantics are identical. A
//! transaction is owned by the future driving `save`, so cancelling that
//! future before the commit drops the transaction and rolls it back.

use std::num::NonZeroU64;
use std::sync::Arc;

use async_trait::async_trait;

use crate::aggregate::{Aggregate, Holder, State};
use crate::error::StoreError;
use crate::event::{Event, SequenceOrder};
use crate::projection::{Projection, ProjectionState};
use crate::registry::Registry;
use crate::snapshot::Snapshot;
use crate::store::{partition, replay_tail, seed};

/// Async counterpart of [`Transaction`](crate::Transaction). Dropping it
/// without committing rolls it back.
#[async_trait]
pub trait AsyncTransaction: Send {
    type Error;

    async fn commit(self) -> Result<(), Self::Error>;
}

/// Async persistence boundary for aggregates and projections.
///
/// See [`EventStore`](crate::EventStore) for the contract of each hook.
#[async_trait]
pub trait AsyncEventStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Transaction: AsyncTransaction<Error = Self::Error>;

    fn registry(&self) -> &Arc<Registry>;

    fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        None
    }

    async fn transaction(&self) -> Result<Self::Transaction, Self::Error>;

    async fn get_events(
        &self,
        id: &str,
        after: Option<SequenceOrder>,
        as_of: Option<SequenceOrder>,
    ) -> Result<Vec<Event>, Self::Error>;

    async fn get_last_snapshot(
        &self,
        id: &str,
        snapshot_kind: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Option<Snapshot>, Self::Error>;

    async fn save_events(
        &self,
        tx: &mut Self::Transaction,
        id: &str,
        events: &[Event],
    ) -> Result<(), Self::Error>;

    async fn save_snapshots(
        &self,
        tx: &mut Self::Transaction,
        snapshots: &[Snapshot],
    ) -> Result<(), Self::Error>;

    /// Persist a holder's pending buffer in one transaction. The buffer is
    /// cleared only after the commit succeeds. Projections write only their
    /// snapshots, as with [`EventStore::save`](crate::EventStore::save).
    async fn save<H: Holder>(&self, holder: &mut H) -> Result<(), StoreError<Self::Error>> {
        if holder.pending().is_empty() {
            return Ok(());
        }
        let (events, snapshots) = partition(holder);
        if events.is_empty() && snapshots.is_empty() {
            holder.clear_pending();
            return Ok(());
        }

        let mut tx = self.transaction().await.map_err(StoreError::Backend)?;
        if !events.is_empty() {
            self.save_events(&mut tx, holder.id(), &events)
                .await
                .map_err(StoreError::Backend)?;
        }
        if !snapshots.is_empty() {
            self.save_snapshots(&mut tx, &snapshots)
                .await
                .map_err(StoreError::Backend)?;
        }
        tx.commit().await.map_err(StoreError::Backend)?;

        holder.clear_pending();
        tracing::debug!(
            id = holder.id(),
            events = events.len(),
            snapshots = snapshots.len(),
            "pending buffer saved"
        );
        Ok(())
    }

    async fn load<S: State>(
        &self,
        id: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Aggregate<S>, StoreError<Self::Error>> {
        self.load_holder(id, as_of).await
    }

    async fn load_projection<P: ProjectionState>(
        &self,
        id: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<Projection<P>, StoreError<Self::Error>> {
        self.load_holder(id, as_of).await
    }

    /// Rebuild a holder from its latest eligible snapshot plus the event
    /// tail, as [`EventStore::load_holder`](crate::EventStore::load_holder).
    async fn load_holder<H: Holder>(
        &self,
        id: &str,
        as_of: Option<SequenceOrder>,
    ) -> Result<H, StoreError<Self::Error>> {
        let snapshot = self
            .get_last_snapshot(id, H::snapshot_kind(), as_of)
            .await
            .map_err(StoreError::Backend)?;
        let after = snapshot.as_ref().map(|s| s.sequence_order);
        let events = self
            .get_events(id, after, as_of)
            .await
            .map_err(StoreError::Backend)?;

        // No await past this point: the holder is built and replayed in one go.
        let mut holder = seed::<H>(id, snapshot.as_ref(), Arc::clone(self.registry()))?;
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
