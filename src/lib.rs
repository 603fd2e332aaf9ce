//! Event-sourcing kernel: handler registry, replay engine, and store contract.
//!
//! State holders ([`Aggregate`], [`Projection`]) change only by applying
//! events through a [`Registry`] of handlers resolved along both the owner
//! and the event kind hierarchy. Event stores ([`EventStore`],
//! [`AsyncEventStore`]) drain their pending buffers transactionally and
//! rebuild them from the latest snapshot plus the event tail.

mod actor;
pub use actor::{AggregateHandle, open_aggregate, spawn_aggregate};
mod aggregate;
pub use aggregate::{Aggregate, AnyState, Holder, Pending, State};
mod async_store;
pub use async_store::{AsyncEventStore, AsyncTransaction};
mod error;
mod event;
mod kind;
mod memory;
mod projection;
mod registry;
pub mod snapshot;
mod storage;
mod store;

pub use error::{ApplyError, HandleError, RegisterError, StoreError};
pub use event::{AnyEvent, Event, EventType, SequenceOrder, StoredEvent};
pub use kind::{Ancestors, Kind, Role};
pub use memory::{InMemoryStore, MemoryTransaction};
pub use projection::{Projection, ProjectionState};
pub use registry::{Handler, Registry, RegistryBuilder};
pub use snapshot::{Attributes, Snapshot};
pub use storage::{FileStore, FileStoreBuilder, FileTransaction, StreamLayout};
pub use store::{EventStore, Transaction};
