//! Crate-level error types for registration, event application, and storage.

use crate::kind::Role;

/// Error raised while building a [`Registry`](crate::Registry).
///
/// All variants describe a misconfiguration and are expected to surface
/// once, during startup, before any event is applied.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// A handler already exists for exactly this (owner, event) pair.
    ///
    /// The existing handler is kept.
    #[error("a handler is already registered for owner `{owner}` and event `{event}`")]
    Duplicate {
        owner: &'static str,
        event: &'static str,
    },

    /// One registration call named both owner kinds and event kinds.
    #[error("a registration must list only event kinds or only owner kinds, not both")]
    MixedKinds,

    /// A kind of the wrong role was given where the other role is required.
    #[error("kind `{kind}` is not an {expected} kind")]
    RoleMismatch { kind: &'static str, expected: Role },

    /// A registration call named no target kinds.
    #[error("a registration must name at least one target kind")]
    EmptyTargets,

    /// The projection was already associated with its owner.
    #[error("projection `{0}` is already associated")]
    AlreadyAssociated(&'static str),

    /// [`Registry::install`](crate::Registry::install) was called twice.
    #[error("a process-wide registry is already installed")]
    AlreadyInstalled,
}

/// Error returned when an event cannot be applied to a state holder.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// No handler resolves for this (owner, event) pair, or a projection
    /// was given an event outside its whitelist.
    ///
    /// The holder is left untouched.
    #[error("no handler for event `{event}` on `{owner}`")]
    HandlerNotFound {
        owner: &'static str,
        event: &'static str,
    },

    /// A persisted event names a kind with no registered decoder.
    #[error("no decoder registered for event kind `{0}`")]
    UnknownEventKind(String),

    /// Converting state or payloads through their attribute mapping failed.
    ///
    /// Raised when capturing or restoring a snapshot, or when a handler
    /// declared for one type is run against a structurally different one.
    #[error("attribute mapping failed: {0}")]
    Attributes(#[from] serde_json::Error),
}

/// Error returned by the store contract's `save` and `load` operations.
///
/// Generic over `E`, the backend's own error type, which is forwarded
/// untouched.
#[derive(Debug, thiserror::Error)]
pub enum StoreError<E: std::error::Error + Send + Sync + 'static> {
    /// The backend failed (connectivity, transaction, I/O).
    #[error(transparent)]
    Backend(E),

    /// Rebuilding a holder from stored data failed.
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Error returned by an [`AggregateHandle`](crate::AggregateHandle).
#[derive(Debug, thiserror::Error)]
pub enum HandleError<E: std::error::Error + Send + Sync + 'static> {
    /// The event could not be applied.
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Saving through the store failed.
    #[error(transparent)]
    Store(#[from] StoreError<E>),

    /// The task that owns the aggregate has stopped.
    #[error("aggregate task is no longer running")]
    ActorGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("backend offline")]
    struct Offline;

    #[test]
    fn duplicate_names_both_kinds() {
        let err = RegisterError::Duplicate {
            owner: "user",
            event: "user.registered",
        };
        assert_eq!(
            err.to_string(),
            "a handler is already registered for owner `user` and event `user.registered`"
        );
    }

    #[test]
    fn role_mismatch_display() {
        let err = RegisterError::RoleMismatch {
            kind: "user",
            expected: Role::Event,
        };
        assert_eq!(err.to_string(), "kind `user` is not an event kind");
    }

    #[test]
    fn handler_not_found_display() {
        let err = ApplyError::HandlerNotFound {
            owner: "money",
            event: "user.registered",
        };
        assert_eq!(
            err.to_string(),
            "no handler for event `user.registered` on `money`"
        );
    }

    #[test]
    fn attributes_from_serde_error() {
        let serde_err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let err = ApplyError::from(serde_err);
        assert!(err.to_string().starts_with("attribute mapping failed"));
    }

    #[test]
    fn store_error_backend_is_transparent() {
        let err: StoreError<Offline> = StoreError::Backend(Offline);
        assert_eq!(err.to_string(), "backend offline");
    }

    #[test]
    fn store_error_from_apply_error() {
        let err: StoreError<Offline> = ApplyError::UnknownEventKind("gone".into()).into();
        assert!(matches!(err, StoreError::Apply(_)));
        assert_eq!(err.to_string(), "no decoder registered for event kind `gone`");
    }

    #[test]
    fn handle_error_actor_gone_display() {
        let err: HandleError<Offline> = HandleError::ActorGone;
        assert_eq!(err.to_string(), "aggregate task is no longer running");
    }

    // Errors cross task boundaries through `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<RegisterError>();
            assert_send_sync::<ApplyError>();
            assert_send_sync::<StoreError<Offline>>();
            assert_send_sync::<HandleError<Offline>>();
        }
    };
}
