//! Task that confines one aggregate to a single writer.
//!
//! An [`Aggregate`] is not safe for concurrent mutation. The actor runs as
//! a tokio task that exclusively owns the aggregate and an
//! [`AsyncEventStore`], and processes messages from an `mpsc` channel one
//! at a time. Callers talk to it through a cloneable [`AggregateHandle`].
//!
//! Public API: [`AggregateHandle`], [`spawn_aggregate`] (start an actor
//! for an aggregate already in memory) and [`open_aggregate`] (load from a
//! store, then start).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::aggregate::{Aggregate, State};
use crate::async_store::AsyncEventStore;
use crate::error::{ApplyError, HandleError, StoreError};
use crate::event::{Event, SequenceOrder};

/// Capacity of the actor's mailbox.
const MAILBOX_CAPACITY: usize = 32;

/// Messages sent from `AggregateHandle` to the actor loop.
///
/// Each variant carries a `oneshot::Sender` for the actor to reply on
/// once the operation completes.
pub(crate) enum ActorMessage<S: State, St: AsyncEventStore> {
    /// Apply an event to the aggregate.
    Apply {
        event: Event,
        reply: oneshot::Sender<Result<(), ApplyError>>,
    },

    /// Retrieve a clone of the current state.
    GetState { reply: oneshot::Sender<S> },

    /// Number of uncommitted buffer entries.
    PendingLen { reply: oneshot::Sender<usize> },

    /// Buffer a snapshot outside the automatic cadence.
    Snapshot {
        reply: oneshot::Sender<Result<(), ApplyError>>,
    },

    /// Drain the pending buffer through the store.
    Save {
        reply: oneshot::Sender<Result<(), StoreError<St::Error>>>,
    },

    /// Stop the actor loop.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Runs the actor loop.
///
/// The loop exits when the channel closes (all handles dropped) or a
/// `Shutdown` message is received. Unsaved entries are dropped with a
/// warning on exit.
async fn run_actor<S, St>(
    mut aggregate: Aggregate<S>,
    store: Arc<St>,
    mut rx: mpsc::Receiver<ActorMessage<S, St>>,
) where
    S: State + Clone,
    St: AsyncEventStore + 'static,
{
    let id = aggregate.id().to_owned();
    tracing::debug!(owner = S::KIND.name(), %id, "aggregate actor started");

    while let Some(msg) = rx.recv().await {
        match msg {
            ActorMessage::Apply { event, reply } => {
                let result = aggregate.apply(event).map(|_| ());
                // A dropped receiver means the caller stopped waiting.
                let _ = reply.send(result);
            }
            ActorMessage::GetState { reply } => {
                let _ = reply.send(aggregate.state().clone());
            }
            ActorMessage::PendingLen { reply } => {
                let _ = reply.send(aggregate.pending().len());
            }
            ActorMessage::Snapshot { reply } => {
                let result = aggregate.record_snapshot().map(|_| ());
                let _ = reply.send(result);
            }
            ActorMessage::Save { reply } => {
                let result = store
                    .save(&mut aggregate)
                    .instrument(tracing::debug_span!("save", owner = S::KIND.name(), %id))
                    .await;
                if let Err(e) = &result {
                    tracing::warn!(owner = S::KIND.name(), %id, error = %e, "save failed");
                }
                let _ = reply.send(result);
            }
            ActorMessage::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    if !aggregate.pending().is_empty() {
        tracing::warn!(
            owner = S::KIND.name(),
            %id,
            unsaved = aggregate.pending().len(),
            "aggregate actor stopped with unsaved entries"
        );
    }
    tracing::debug!(owner = S::KIND.name(), %id, "aggregate actor stopped");
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Every clone talks to the same
/// actor, which applies messages in the order it receives them.
pub struct AggregateHandle<S: State, St: AsyncEventStore> {
    id: Arc<str>,
    sender: mpsc::Sender<ActorMessage<S, St>>,
}

// Manual `Clone` because neither `S` nor `St` need be `Clone` for the
// handle; only the `Sender` is cloned.
impl<S: State, St: AsyncEventStore> Clone for AggregateHandle<S, St> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            sender: self.sender.clone(),
        }
    }
}

impl<S: State, St: AsyncEventStore> std::fmt::Debug for AggregateHandle<S, St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("owner", &S::KIND.name())
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<S: State, St: AsyncEventStore> AggregateHandle<S, St> {
    /// Id of the aggregate behind this handle.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Apply an event to the aggregate.
    ///
    /// # Errors
    ///
    /// * [`HandleError::Apply`] -- no handler resolved; nothing changed.
    /// * [`HandleError::ActorGone`] -- the actor task has exited.
    pub async fn apply(&self, event: Event) -> Result<(), HandleError<St::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Apply { event, reply: tx })
            .await
            .map_err(|_| HandleError::ActorGone)?;
        Ok(rx.await.map_err(|_| HandleError::ActorGone)??)
    }

    /// Read a clone of the current state.
    ///
    /// # Errors
    ///
    /// * [`HandleError::ActorGone`] -- the actor task has exited.
    pub async fn state(&self) -> Result<S, HandleError<St::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)
    }

    /// Number of events and snapshots waiting for the next save.
    pub async fn pending_len(&self) -> Result<usize, HandleError<St::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::PendingLen { reply: tx })
            .await
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)
    }

    /// Buffer a snapshot of the current state for the next save.
    pub async fn record_snapshot(&self) -> Result<(), HandleError<St::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Snapshot { reply: tx })
            .await
            .map_err(|_| HandleError::ActorGone)?;
        Ok(rx.await.map_err(|_| HandleError::ActorGone)??)
    }

    /// Persist the pending buffer through the actor's store.
    ///
    /// # Errors
    ///
    /// * [`HandleError::Store`] -- the store failed; the buffer is kept and
    ///   the save can be retried.
    /// * [`HandleError::ActorGone`] -- the actor task has exited.
    pub async fn save(&self) -> Result<(), HandleError<St::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Save { reply: tx })
            .await
            .map_err(|_| HandleError::ActorGone)?;
        Ok(rx.await.map_err(|_| HandleError::ActorGone)??)
    }

    /// Stop the actor. Unsaved entries are discarded.
    pub async fn shutdown(&self) -> Result<(), HandleError<St::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Shutdown { reply: tx })
            .await
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)
    }

    /// Check whether the actor backing this handle is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Start an actor that owns `aggregate` and saves through `store`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_aggregate<S, St>(aggregate: Aggregate<S>, store: Arc<St>) -> AggregateHandle<S, St>
where
    S: State + Clone,
    St: AsyncEventStore + 'static,
{
    let (tx, rx) = mpsc::channel::<ActorMessage<S, St>>(MAILBOX_CAPACITY);
    let id: Arc<str> = Arc::from(aggregate.id());
    tokio::spawn(run_actor(aggregate, store, rx));
    AggregateHandle { id, sender: tx }
}

/// Load aggregate `id` from `store` and start an actor for it.
///
/// # Arguments
///
/// * `store` - Store used both to load the aggregate and to save it later.
/// * `id` - Aggregate id. An id with no stored data starts empty.
/// * `as_of` - Optional point in time to load the aggregate at.
///
/// # Errors
///
/// Returns [`StoreError`] if loading fails.
pub async fn open_aggregate<S, St>(
    store: Arc<St>,
    id: &str,
    as_of: Option<SequenceOrder>,
) -> Result<AggregateHandle<S, St>, StoreError<St::Error>>
where
    S: State + Clone,
    St: AsyncEventStore + 'static,
{
    let aggregate = store.load::<S>(id, as_of).await?;
    Ok(spawn_aggregate(aggregate, store))
}
