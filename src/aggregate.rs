//! State trait and the aggregate replay engine.

use std::any::Any;
use std::fmt::Debug;
use std::num::NonZeroU64;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ApplyError;
use crate::event::{Event, SequenceOrder};
use crate::kind::{Kind, Role};
use crate::registry::Registry;
use crate::snapshot::{self, Attributes, Snapshot};

/// The attributes of an aggregate or projection.
///
/// The implementing struct is mutated in place by registered handlers.
/// Its serde fields are the attributes captured by snapshots; use
/// `#[serde(skip)]` for anything that must not be captured and
/// `#[serde(default)]` so that partial attribute sets can be restored.
///
/// # Contract
///
/// - `KIND` must have [`Role::Owner`].
/// - `Default` is the empty state a fresh holder starts from.
pub trait State: Default + Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Identity of this owner type.
    const KIND: &'static Kind;

    /// Name of the snapshot type produced for this state. Stores keep
    /// snapshots of different kinds apart, so an aggregate and each of its
    /// projections resume from their own snapshots.
    fn snapshot_kind() -> &'static str {
        Self::KIND.name()
    }

    /// Capture the attributes stored in a snapshot.
    ///
    /// Override to post-process the captured mapping (drop fields, add
    /// derived values). The result must still restore into `Self`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state cannot be captured.
    fn capture(&self) -> serde_json::Result<Attributes> {
        snapshot::capture(self)
    }
}

/// Object-safe view of a [`State`] handed to registered handlers.
pub trait AnyState: Send + Sync {
    fn kind(&self) -> &'static Kind;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Raw attribute mapping, without [`State::capture`] post-processing.
    fn attributes(&self) -> serde_json::Result<Attributes>;

    /// Replace the state with one restored from `attributes`.
    fn assign(&mut self, attributes: &Attributes) -> serde_json::Result<()>;
}

impl<S: State> AnyState for S {
    fn kind(&self) -> &'static Kind {
        S::KIND
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn attributes(&self) -> serde_json::Result<Attributes> {
        snapshot::capture(self)
    }

    fn assign(&mut self, attributes: &Attributes) -> serde_json::Result<()> {
        *self = snapshot::restore(attributes)?;
        Ok(())
    }
}

impl<'a> dyn AnyState + 'a {
    /// Typed access when the state is exactly `O`.
    pub fn downcast_mut<O: State>(&mut self) -> Option<&mut O> {
        self.as_any_mut().downcast_mut::<O>()
    }

    /// Run `f` against this state viewed as `O`.
    ///
    /// When the state is exactly `O`, `f` gets it directly. Otherwise `O` is
    /// restored from this state's attributes, `f` runs on that view, and
    /// every attribute the two types share by name is written back. This
    /// is how a handler declared for an ancestor owner, or copied from an
    /// aggregate onto a projection, mutates a different concrete type.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if either state cannot be mapped.
    pub fn with_view<O: State, R>(&mut self, f: impl FnOnce(&mut O) -> R) -> serde_json::Result<R> {
        if let Some(exact) = self.as_any_mut().downcast_mut::<O>() {
            return Ok(f(exact));
        }

        let mut attributes = self.attributes()?;
        let mut view: O = snapshot::restore(&attributes)?;
        let out = f(&mut view);
        for (name, value) in snapshot::capture(&view)? {
            if let Some(slot) = attributes.get_mut(&name) {
                *slot = value;
            }
        }
        self.assign(&attributes)?;
        Ok(out)
    }
}

/// An entry of a holder's uncommitted buffer.
#[derive(Debug, Clone)]
pub enum Pending {
    Event(Event),
    Snapshot(Snapshot),
}

impl Pending {
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Pending::Event(event) => Some(event),
            Pending::Snapshot(_) => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&Snapshot> {
        match self {
            Pending::Snapshot(snapshot) => Some(snapshot),
            Pending::Event(_) => None,
        }
    }
}

/// Replay machinery shared by [`Aggregate`] and
/// [`Projection`](crate::Projection).
#[derive(Debug)]
pub(crate) struct Core<S> {
    id: String,
    state: S,
    pending: Vec<Pending>,
    events_applied: u64,
    auto_snapshot_each_n: Option<NonZeroU64>,
    last_sequence: Option<SequenceOrder>,
    registry: Arc<Registry>,
}

impl<S: State> Core<S> {
    pub(crate) fn new(id: String, registry: Arc<Registry>) -> Self {
        debug_assert_eq!(S::KIND.role(), Role::Owner);
        Self {
            id,
            state: S::default(),
            pending: Vec::new(),
            events_applied: 0,
            auto_snapshot_each_n: None,
            last_sequence: None,
            registry,
        }
    }

    /// Seed a holder from a snapshot without running `Default`-based
    /// initialization of the attributes it carries.
    pub(crate) fn from_snapshot(
        id: String,
        snapshot: &Snapshot,
        registry: Arc<Registry>,
    ) -> Result<Self, ApplyError> {
        let state: S = snapshot::restore(&snapshot.data)?;
        Ok(Self {
            state,
            last_sequence: Some(snapshot.sequence_order),
            ..Self::new(id, registry)
        })
    }

    /// Run the resolved handler for `event` without buffering anything.
    pub(crate) fn fold(&mut self, event: &Event) -> Result<(), ApplyError> {
        self.registry.dispatch(S::KIND, &mut self.state, event)?;

        let marker = event.sequence_order();
        match self.last_sequence {
            Some(last) if marker < last => {
                tracing::warn!(
                    owner = S::KIND.name(),
                    id = %self.id,
                    event = event.kind().name(),
                    "event applied out of sequence order"
                );
            }
            _ => self.last_sequence = Some(marker),
        }

        tracing::trace!(owner = S::KIND.name(), event = event.kind().name(), "event applied");
        Ok(())
    }

    pub(crate) fn apply(&mut self, event: Event) -> Result<(), ApplyError> {
        self.fold(&event)?;
        self.pending.push(Pending::Event(event));
        self.events_applied += 1;

        if let Some(n) = self.auto_snapshot_each_n
            && self.events_applied % n.get() == 0
        {
            let snapshot = self.create_snapshot()?;
            tracing::debug!(
                owner = S::KIND.name(),
                id = %self.id,
                events_applied = self.events_applied,
                "automatic snapshot"
            );
            self.pending.push(Pending::Snapshot(snapshot));
        }
        Ok(())
    }

    pub(crate) fn create_snapshot(&self) -> Result<Snapshot, ApplyError> {
        Ok(Snapshot::new(
            self.id.clone(),
            S::snapshot_kind(),
            self.state.capture()?,
            self.last_sequence.unwrap_or(SequenceOrder::ORIGIN),
        ))
    }

    pub(crate) fn record_snapshot(&mut self) -> Result<(), ApplyError> {
        let snapshot = self.create_snapshot()?;
        self.pending.push(Pending::Snapshot(snapshot));
        Ok(())
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> &S {
        &self.state
    }

    pub(crate) fn into_state(self) -> S {
        self.state
    }

    pub(crate) fn pending(&self) -> &[Pending] {
        &self.pending
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn events_applied(&self) -> u64 {
        self.events_applied
    }

    pub(crate) fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.auto_snapshot_each_n
    }

    pub(crate) fn set_auto_snapshot_each(&mut self, n: Option<NonZeroU64>) {
        self.auto_snapshot_each_n = n;
    }

    pub(crate) fn last_sequence(&self) -> Option<SequenceOrder> {
        self.last_sequence
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// A state holder whose attributes change only by applying events.
///
/// Applied events, together with any snapshots taken along the way, are
/// kept in an uncommitted buffer until an event store drains it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_kernel::{Aggregate, Event, EventType, Kind, Registry, State};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Counter {
///     value: u64,
/// }
///
/// impl State for Counter {
///     const KIND: &'static Kind = &Kind::owner("counter");
/// }
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Added {
///     amount: u64,
/// }
///
/// impl EventType for Added {
///     const KIND: &'static Kind = &Kind::event("counter.added");
/// }
///
/// let mut builder = Registry::builder();
/// builder
///     .handle::<Counter, Added>(|c, e| c.value += e.amount)
///     .unwrap();
/// let registry = Arc::new(builder.build());
///
/// let mut counter = Aggregate::<Counter>::new(registry);
/// counter
///     .apply(Event::new(Added { amount: 2 }))
///     .unwrap()
///     .apply(Event::new(Added { amount: 3 }))
///     .unwrap();
///
/// assert_eq!(counter.state().value, 5);
/// assert_eq!(counter.pending().len(), 2);
/// ```
#[derive(Debug)]
pub struct Aggregate<S: State> {
    core: Core<S>,
}

impl<S: State> Aggregate<S> {
    /// Create an empty aggregate with a fresh UUID v4 id.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), registry)
    }

    /// Create an empty aggregate with the given id.
    pub fn with_id(id: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            core: Core::new(id.into(), registry),
        }
    }

    /// Take a snapshot automatically after every `n` applied events.
    /// `0` disables automatic snapshots.
    pub fn with_auto_snapshot_each(mut self, n: u64) -> Self {
        self.core.set_auto_snapshot_each(NonZeroU64::new(n));
        self
    }

    /// Rebuild an aggregate from a snapshot.
    ///
    /// The state is assigned directly from `snapshot.data`; the buffer is
    /// empty and the applied-events counter starts at zero.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Attributes`] if the snapshot data does not
    /// restore into `S`.
    pub fn from_snapshot(
        id: impl Into<String>,
        snapshot: &Snapshot,
        registry: Arc<Registry>,
    ) -> Result<Self, ApplyError> {
        Ok(Self {
            core: Core::from_snapshot(id.into(), snapshot, registry)?,
        })
    }

    /// Apply an event through the registry.
    ///
    /// The handler resolved for `(S, event kind)` runs with the upcast
    /// event. On success the original event is buffered, the counter is
    /// incremented and, on every `n`-th event when automatic snapshots are
    /// enabled, a snapshot is buffered right after it.
    ///
    /// # Returns
    ///
    /// `self`, for chaining.
    ///
    /// # Errors
    ///
    /// - [`ApplyError::HandlerNotFound`] if no handler resolves. Nothing
    ///   changes.
    /// - [`ApplyError::Attributes`] if a bridged handler or the automatic
    ///   snapshot fails to map attributes.
    pub fn apply(&mut self, event: Event) -> Result<&mut Self, ApplyError> {
        self.core.apply(event)?;
        Ok(self)
    }

    /// Capture the current state without buffering it.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Attributes`] if the state cannot be captured.
    pub fn create_snapshot(&self) -> Result<Snapshot, ApplyError> {
        self.core.create_snapshot()
    }

    /// Capture the current state and buffer the snapshot for the next save,
    /// outside the automatic cadence.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Attributes`] if the state cannot be captured.
    pub fn record_snapshot(&mut self) -> Result<&mut Self, ApplyError> {
        self.core.record_snapshot()?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn state(&self) -> &S {
        self.core.state()
    }

    pub fn into_state(self) -> S {
        self.core.into_state()
    }

    /// Uncommitted events and snapshots, in application order.
    pub fn pending(&self) -> &[Pending] {
        self.core.pending()
    }

    /// Events applied (not replayed) since this instance was created.
    pub fn events_applied(&self) -> u64 {
        self.core.events_applied()
    }

    pub fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.core.auto_snapshot_each()
    }

    /// Marker of the latest event folded into the state.
    pub fn last_sequence(&self) -> Option<SequenceOrder> {
        self.core.last_sequence()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.core.registry()
    }
}

/// Common surface of [`Aggregate`] and [`Projection`](crate::Projection)
/// used by the event store contract.
pub trait Holder: Sized + Send + 'static {
    type State: State;

    /// Whether buffered events belong to the stream under [`id`](Holder::id).
    ///
    /// `false` for holders that replay another holder's stream: stores then
    /// persist only their snapshots and discard their buffered events.
    const OWNS_STREAM: bool;

    fn id(&self) -> &str;

    fn pending(&self) -> &[Pending];

    /// Drop the uncommitted buffer. Called by stores after a successful
    /// commit and by nothing else.
    fn clear_pending(&mut self);

    fn set_auto_snapshot_each(&mut self, n: Option<NonZeroU64>);

    /// Snapshot type this holder resumes from.
    fn snapshot_kind() -> &'static str {
        <Self::State as State>::snapshot_kind()
    }

    /// Whether this holder may apply events of `kind`.
    fn admits(kind: &'static Kind) -> bool;

    /// An empty holder, the starting point when no snapshot exists.
    fn empty(id: &str, registry: Arc<Registry>) -> Self;

    /// A holder seeded from `snapshot`.
    fn restore(id: &str, snapshot: &Snapshot, registry: Arc<Registry>) -> Result<Self, ApplyError>;

    /// Fold a stored event into the state without buffering it and without
    /// triggering automatic snapshots.
    fn replay(&mut self, event: &Event) -> Result<(), ApplyError>;
}

impl<S: State> Holder for Aggregate<S> {
    type State = S;
    const OWNS_STREAM: bool = true;

    fn id(&self) -> &str {
        self.core.id()
    }

    fn pending(&self) -> &[Pending] {
        self.core.pending()
    }

    fn clear_pending(&mut self) {
        self.core.clear_pending();
    }

    fn set_auto_snapshot_each(&mut self, n: Option<NonZeroU64>) {
        self.core.set_auto_snapshot_each(n);
    }

    fn admits(_kind: &'static Kind) -> bool {
        true
    }

    fn empty(id: &str, registry: Arc<Registry>) -> Self {
        Self::with_id(id, registry)
    }

    fn restore(id: &str, snapshot: &Snapshot, registry: Arc<Registry>) -> Result<Self, ApplyError> {
        Self::from_snapshot(id, snapshot, registry)
    }

    fn replay(&mut self, event: &Event) -> Result<(), ApplyError> {
        self.core.fold(event)
    }
}
