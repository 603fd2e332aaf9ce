//! Handler registry: maps (owner kind, event kind) pairs to mutators.
//!
//! Handlers are registered on a [`RegistryBuilder`] during startup and then
//! frozen into an immutable [`Registry`], shared as `Arc<Registry>`. Lookups
//! walk both kinds' ancestor chains, owner axis outermost, so a handler
//! bound to a more specific owner wins over one bound to a more specific
//! event at a less specific owner.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::aggregate::{AnyState, State};
use crate::error::{ApplyError, RegisterError};
use crate::event::{AnyEvent, Event, EventType, StoredEvent};
use crate::kind::{Kind, Role};
use crate::projection::ProjectionState;

/// A type-erased mutator. Receives the owner's state and the upcast event.
pub type Handler = Arc<dyn Fn(&mut dyn AnyState, &Event) -> Result<(), ApplyError> + Send + Sync>;

type Decoder = fn(Value) -> serde_json::Result<Arc<dyn AnyEvent>>;

type HandlerTable = HashMap<&'static str, HashMap<&'static str, Handler>>;

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut dyn AnyState, &Event) -> Result<(), ApplyError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn decoder<E: EventType>(value: Value) -> serde_json::Result<Arc<dyn AnyEvent>> {
    Ok(Arc::new(serde_json::from_value::<E>(value)?))
}

fn check_role(kind: &'static Kind, expected: Role) -> Result<(), RegisterError> {
    if kind.role() == expected {
        Ok(())
    } else {
        Err(RegisterError::RoleMismatch {
            kind: kind.name(),
            expected,
        })
    }
}

/// A registration list must be non-empty and hold only `expected` kinds.
fn check_targets(targets: &[&'static Kind], expected: Role) -> Result<(), RegisterError> {
    let Some(first) = targets.first() else {
        return Err(RegisterError::EmptyTargets);
    };
    let mismatched = targets.iter().filter(|k| k.role() != expected).count();
    match mismatched {
        0 => Ok(()),
        n if n == targets.len() => Err(RegisterError::RoleMismatch {
            kind: first.name(),
            expected,
        }),
        _ => Err(RegisterError::MixedKinds),
    }
}

fn resolve<'a>(
    handlers: &'a HandlerTable,
    owner: &'static Kind,
    event: &'static Kind,
) -> Option<&'a Handler> {
    for owner in owner.ancestors() {
        let Some(by_event) = handlers.get(owner.name()) else {
            continue;
        };
        for event in event.ancestors() {
            if let Some(h) = by_event.get(event.name()) {
                return Some(h);
            }
        }
    }
    None
}

/// Mutable registration phase of a [`Registry`].
///
/// Every registration method checks its inputs before touching the table,
/// so a failed call leaves the builder unchanged.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HandlerTable,
    decoders: HashMap<&'static str, Decoder>,
    projection_snapshots: HashMap<&'static str, Vec<&'static str>>,
    whitelists: HashMap<&'static str, &'static [&'static Kind]>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to exactly `(owner, event)`.
    ///
    /// # Errors
    ///
    /// - [`RegisterError::RoleMismatch`] if either kind has the wrong role.
    /// - [`RegisterError::Duplicate`] if the pair is already bound. The
    ///   existing handler is kept.
    pub fn set_handler(
        &mut self,
        owner: &'static Kind,
        event: &'static Kind,
        handler: Handler,
    ) -> Result<&mut Self, RegisterError> {
        check_role(owner, Role::Owner)?;
        check_role(event, Role::Event)?;
        self.ensure_free(owner, event)?;
        self.insert(owner, event, handler);
        Ok(self)
    }

    /// Resolve the nearest handler, see [`Registry::get_handler`].
    pub fn get_handler(&self, owner: &'static Kind, event: &'static Kind) -> Option<&Handler> {
        resolve(&self.handlers, owner, event)
    }

    /// Copy every handler bound directly under `from` onto `to`.
    ///
    /// Pairs `to` already binds are left as they are.
    pub fn copy_handlers(
        &mut self,
        from: &'static Kind,
        to: &'static Kind,
    ) -> Result<&mut Self, RegisterError> {
        check_role(from, Role::Owner)?;
        check_role(to, Role::Owner)?;

        let Some(source) = self.handlers.get(from.name()).cloned() else {
            return Ok(self);
        };
        let target = self.handlers.entry(to.name()).or_default();
        for (event, h) in source {
            target.entry(event).or_insert(h);
        }
        tracing::debug!(from = from.name(), to = to.name(), "handlers copied");
        Ok(self)
    }

    /// Bind a typed mutator of `O` to events of kind `E`.
    ///
    /// The handler is resolved for descendants of either kind too. When it
    /// runs against a different owner type or payload type, it sees a
    /// structural view restored from the shared attribute names.
    pub fn handle<O, E>(
        &mut self,
        f: impl Fn(&mut O, &E) + Send + Sync + 'static,
    ) -> Result<&mut Self, RegisterError>
    where
        O: State,
        E: EventType,
    {
        let h = handler(move |state, event| {
            let decoded;
            let payload = match event.data::<E>() {
                Some(exact) => exact,
                None => {
                    decoded = event.decode::<E>()?;
                    &decoded
                }
            };
            state.with_view::<O, _>(|owner| f(owner, payload))?;
            Ok(())
        });
        self.set_handler(O::KIND, E::KIND, h)?;
        self.decoders.insert(E::KIND.name(), decoder::<E>);
        Ok(self)
    }

    /// Bind one mutator of `O` to several event kinds at once.
    ///
    /// Only kinds are known here, not payload types, so no decoders are
    /// registered. Call [`event`](Self::event) for each payload type that
    /// a store must read back, or loads fail with
    /// [`ApplyError::UnknownEventKind`].
    ///
    /// # Errors
    ///
    /// - [`RegisterError::EmptyTargets`] if `events` is empty.
    /// - [`RegisterError::MixedKinds`] if `events` also names owner kinds.
    /// - [`RegisterError::RoleMismatch`] if `events` names only owner kinds.
    /// - [`RegisterError::Duplicate`] if any pair is already bound; nothing
    ///   is registered in that case.
    pub fn on<O: State>(
        &mut self,
        events: &[&'static Kind],
        f: impl Fn(&mut O, &Event) + Send + Sync + 'static,
    ) -> Result<&mut Self, RegisterError> {
        check_targets(events, Role::Event)?;
        for &event in events {
            self.ensure_free(O::KIND, event)?;
        }

        let h = handler(move |state, event| {
            state.with_view::<O, _>(|owner| f(owner, event))?;
            Ok(())
        });
        for &event in events {
            self.insert(O::KIND, event, Arc::clone(&h));
        }
        Ok(self)
    }

    /// Bind a handler carried by the event type `E` onto several owner
    /// kinds.
    ///
    /// The handler receives the owner as [`AnyState`]; use its
    /// `downcast_mut` or `with_view` to reach the attributes.
    ///
    /// # Errors
    ///
    /// Same as [`on`](Self::on), with the roles swapped.
    pub fn intrinsic<E: EventType>(
        &mut self,
        owners: &[&'static Kind],
        f: impl Fn(&E, &mut dyn AnyState) -> Result<(), ApplyError> + Send + Sync + 'static,
    ) -> Result<&mut Self, RegisterError> {
        check_targets(owners, Role::Owner)?;
        for &owner in owners {
            self.ensure_free(owner, E::KIND)?;
        }

        let h = handler(move |state, event| match event.data::<E>() {
            Some(exact) => f(exact, state),
            None => f(&event.decode::<E>()?, state),
        });
        for &owner in owners {
            self.insert(owner, E::KIND, Arc::clone(&h));
        }
        self.decoders.insert(E::KIND.name(), decoder::<E>);
        Ok(self)
    }

    /// Register the decoder for `E` without binding a handler.
    ///
    /// [`handle`](Self::handle) and [`intrinsic`](Self::intrinsic) do this
    /// already. It is needed for event types bound only through
    /// [`on`](Self::on) or [`set_handler`](Self::set_handler), and for
    /// types only reached through inheritance or upcasting, so that stores
    /// can read them back.
    pub fn event<E: EventType>(&mut self) -> &mut Self {
        self.decoders.insert(E::KIND.name(), decoder::<E>);
        self
    }

    /// Wire projection `P` to its owner.
    ///
    /// Records `P`'s snapshot kind under the owner, and for each whitelisted
    /// event kind `P` does not handle itself, binds the handler the owner
    /// resolves for it. Register the owner's handlers, and `P`'s own, first.
    ///
    /// # Errors
    ///
    /// - [`RegisterError::AlreadyAssociated`] on a second call for `P`.
    /// - The list errors of [`on`](Self::on) if `P::EVENTS` is malformed.
    pub fn associate<P: ProjectionState>(&mut self) -> Result<&mut Self, RegisterError> {
        let projection = P::KIND;
        let owner = <P::Owner as State>::KIND;
        check_role(projection, Role::Owner)?;
        if self.whitelists.contains_key(projection.name()) {
            return Err(RegisterError::AlreadyAssociated(projection.name()));
        }
        check_targets(P::EVENTS, Role::Event)?;

        for &event in P::EVENTS {
            let own = self
                .handlers
                .get(projection.name())
                .is_some_and(|by_event| by_event.contains_key(event.name()));
            if own {
                continue;
            }
            if let Some(h) = resolve(&self.handlers, owner, event).cloned() {
                self.insert(projection, event, h);
            }
        }

        self.projection_snapshots
            .entry(owner.name())
            .or_default()
            .push(P::snapshot_kind());
        self.whitelists.insert(projection.name(), P::EVENTS);
        tracing::debug!(
            projection = projection.name(),
            owner = owner.name(),
            "projection associated"
        );
        Ok(self)
    }

    /// Freeze the table.
    pub fn build(self) -> Registry {
        Registry {
            handlers: self.handlers,
            decoders: self.decoders,
            projection_snapshots: self.projection_snapshots,
            whitelists: self.whitelists,
        }
    }

    fn ensure_free(&self, owner: &'static Kind, event: &'static Kind) -> Result<(), RegisterError> {
        let taken = self
            .handlers
            .get(owner.name())
            .is_some_and(|by_event| by_event.contains_key(event.name()));
        if taken {
            Err(RegisterError::Duplicate {
                owner: owner.name(),
                event: event.name(),
            })
        } else {
            Ok(())
        }
    }

    fn insert(&mut self, owner: &'static Kind, event: &'static Kind, handler: Handler) {
        tracing::trace!(owner = owner.name(), event = event.name(), "handler registered");
        self.handlers
            .entry(owner.name())
            .or_default()
            .insert(event.name(), handler);
    }
}

/// Immutable handler table used by every state holder.
///
/// Built once with [`Registry::builder`]; lookups take no locks.
pub struct Registry {
    handlers: HandlerTable,
    decoders: HashMap<&'static str, Decoder>,
    projection_snapshots: HashMap<&'static str, Vec<&'static str>>,
    whitelists: HashMap<&'static str, &'static [&'static Kind]>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Resolve the nearest handler for `(owner, event)`.
    ///
    /// Walks `owner`'s ancestors, most derived first, and for each of them
    /// walks `event`'s ancestors, most derived first. The first bound pair
    /// wins. Returns `None` when no combination is bound.
    pub fn get_handler(&self, owner: &'static Kind, event: &'static Kind) -> Option<&Handler> {
        resolve(&self.handlers, owner, event)
    }

    /// Run the handler resolved for `owner` and the event's kind against
    /// `state`, passing the upcast event.
    ///
    /// # Errors
    ///
    /// [`ApplyError::HandlerNotFound`] if nothing resolves, otherwise
    /// whatever the handler returns.
    pub fn dispatch(
        &self,
        owner: &'static Kind,
        state: &mut dyn AnyState,
        event: &Event,
    ) -> Result<(), ApplyError> {
        let handler =
            self.get_handler(owner, event.kind())
                .ok_or(ApplyError::HandlerNotFound {
                    owner: owner.name(),
                    event: event.kind().name(),
                })?;
        handler(state, &event.upcast())
    }

    /// Snapshot kinds of the projections associated with `owner`, in
    /// association order.
    pub fn projection_snapshot_kinds(&self, owner: &Kind) -> &[&'static str] {
        self.projection_snapshots
            .get(owner.name())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Event kinds an associated projection may apply.
    pub fn whitelist(&self, projection: &Kind) -> Option<&'static [&'static Kind]> {
        self.whitelists.get(projection.name()).copied()
    }

    /// Turn a persisted event back into an [`Event`].
    ///
    /// # Errors
    ///
    /// - [`ApplyError::UnknownEventKind`] if no decoder is registered.
    /// - [`ApplyError::Attributes`] if the payload does not fit its type.
    pub fn decode(&self, stored: &StoredEvent) -> Result<Event, ApplyError> {
        let decode = self
            .decoders
            .get(stored.kind.as_str())
            .ok_or_else(|| ApplyError::UnknownEventKind(stored.kind.clone()))?;
        let data = decode(stored.data.clone())?;
        Ok(Event::from_parts(data, stored.sequence_order))
    }

    /// Publish this registry as the process-wide one.
    ///
    /// # Errors
    ///
    /// [`RegisterError::AlreadyInstalled`] if a registry was installed
    /// before. The existing one stays in place.
    pub fn install(self) -> Result<Arc<Registry>, RegisterError> {
        let registry = Arc::new(self);
        GLOBAL
            .set(Arc::clone(&registry))
            .map_err(|_| RegisterError::AlreadyInstalled)?;
        tracing::debug!(owners = registry.handlers.len(), "registry installed");
        Ok(registry)
    }

    /// The process-wide registry, if one was installed.
    pub fn global() -> Option<Arc<Registry>> {
        GLOBAL.get().cloned()
    }
}

fn bindings(handlers: &HandlerTable) -> usize {
    handlers.values().map(HashMap::len).sum()
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("owners", &self.handlers.len())
            .field("bindings", &bindings(&self.handlers))
            .field("decoders", &self.decoders.len())
            .field("projections", &self.whitelists.len())
            .finish()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("owners", &self.handlers.len())
            .field("bindings", &bindings(&self.handlers))
            .field("decoders", &self.decoders.len())
            .field("projections", &self.whitelists.len())
            .finish()
    }
}
