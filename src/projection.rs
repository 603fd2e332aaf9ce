//! Projections: read models restricted to a whitelist of event kinds.
//!
//! A projection is a state holder tied to one owner (aggregate) type. It
//! replays the owner's events through the same registry, but only those
//! whose kind belongs to a family named in its whitelist. Handlers for
//! whitelisted events the projection does not define itself are inherited
//! from the owner by [`RegistryBuilder::associate`](crate::RegistryBuilder::associate).

use std::num::NonZeroU64;
use std::sync::Arc;

use crate::aggregate::{Core, Holder, Pending, State};
use crate::error::ApplyError;
use crate::event::{Event, SequenceOrder};
use crate::kind::Kind;
use crate::registry::Registry;
use crate::snapshot::Snapshot;

/// State of a projection.
///
/// # Contract
///
/// - `EVENTS` lists event kinds only. An event is admitted when its kind
///   is one of them or descends from one of them.
/// - The projection must be associated with
///   [`RegistryBuilder::associate`](crate::RegistryBuilder::associate)
///   before it can inherit its owner's handlers.
/// - `snapshot_kind()` must differ from the owner's so both can be stored
///   for the same id. The default, the projection's own kind name, does.
pub trait ProjectionState: State {
    /// The aggregate state this projection derives from.
    type Owner: State;

    /// Event kinds this projection may apply.
    const EVENTS: &'static [&'static Kind];
}

fn admitted<P: ProjectionState>(kind: &'static Kind) -> bool {
    P::EVENTS.iter().any(|allowed| kind.is_a(allowed))
}

fn rejected<P: ProjectionState>(event: &Event) -> ApplyError {
    ApplyError::HandlerNotFound {
        owner: P::KIND.name(),
        event: event.kind().name(),
    }
}

/// A read model replayed from a subset of its owner's events.
#[derive(Debug)]
pub struct Projection<P: ProjectionState> {
    core: Core<P>,
}

impl<P: ProjectionState> Projection<P> {
    /// Create an empty projection with a fresh UUID v4 id.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), registry)
    }

    /// Create an empty projection with the given id, usually the id of the
    /// aggregate it derives from.
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

    /// Rebuild a projection from one of its own snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Attributes`] if the snapshot data does not
    /// restore into `P`.
    pub fn from_snapshot(
        id: impl Into<String>,
        snapshot: &Snapshot,
        registry: Arc<Registry>,
    ) -> Result<Self, ApplyError> {
        Ok(Self {
            core: Core::from_snapshot(id.into(), snapshot, registry)?,
        })
    }

    /// Returns `true` if events of `kind` pass the whitelist.
    pub fn admits(kind: &'static Kind) -> bool {
        admitted::<P>(kind)
    }

    /// Apply an event, as [`Aggregate::apply`](crate::Aggregate::apply).
    ///
    /// # Errors
    ///
    /// [`ApplyError::HandlerNotFound`] if the event is outside the
    /// whitelist. The registry is not consulted in that case, so a handler
    /// the owner defines for that event does not make it applicable.
    pub fn apply(&mut self, event: Event) -> Result<&mut Self, ApplyError> {
        if !admitted::<P>(event.kind()) {
            return Err(rejected::<P>(&event));
        }
        self.core.apply(event)?;
        Ok(self)
    }

    pub fn create_snapshot(&self) -> Result<Snapshot, ApplyError> {
        self.core.create_snapshot()
    }

    pub fn record_snapshot(&mut self) -> Result<&mut Self, ApplyError> {
        self.core.record_snapshot()?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn state(&self) -> &P {
        self.core.state()
    }

    pub fn into_state(self) -> P {
        self.core.into_state()
    }

    pub fn pending(&self) -> &[Pending] {
        self.core.pending()
    }

    pub fn events_applied(&self) -> u64 {
        self.core.events_applied()
    }

    pub fn auto_snapshot_each(&self) -> Option<NonZeroU64> {
        self.core.auto_snapshot_each()
    }

    pub fn last_sequence(&self) -> Option<SequenceOrder> {
        self.core.last_sequence()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.core.registry()
    }
}

impl<P: ProjectionState> Holder for Projection<P> {
    type State = P;
    // Events come from the owner's stream; only snapshots are ours to write.
    const OWNS_STREAM: bool = false;

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

    fn admits(kind: &'static Kind) -> bool {
        admitted::<P>(kind)
    }

    fn empty(id: &str, registry: Arc<Registry>) -> Self {
        Self::with_id(id, registry)
    }

    fn restore(id: &str, snapshot: &Snapshot, registry: Arc<Registry>) -> Result<Self, ApplyError> {
        Self::from_snapshot(id, snapshot, registry)
    }

    fn replay(&mut self, event: &Event) -> Result<(), ApplyError> {
        if !admitted::<P>(event.kind()) {
            return Err(rejected::<P>(event));
        }
        self.core.fold(event)
    }
}
