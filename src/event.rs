//! Event envelopes, payload traits, and the sequence-order marker.
//!
//! An [`Event`] pairs a type-erased payload with the [`SequenceOrder`] it
//! was stamped with. Payload types implement [`EventType`]; the object-safe
//! [`AnyEvent`] view is derived for them automatically.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kind::Kind;

/// Last marker handed out by [`SequenceOrder::now`], in nanoseconds.
static LAST_STAMP: AtomicI64 = AtomicI64::new(i64::MIN);

/// Ordering key for events and snapshots.
///
/// A UTC timestamp with nanosecond precision. [`SequenceOrder::now`] never
/// returns the same value twice within a process, so events stamped in
/// application order are strictly increasing even when the wall clock
/// stalls or steps backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceOrder(DateTime<Utc>);

impl SequenceOrder {
    /// The Unix epoch. Marks snapshots of a holder that has not folded any
    /// event yet.
    pub const ORIGIN: SequenceOrder = SequenceOrder(DateTime::<Utc>::UNIX_EPOCH);

    /// Stamp a new marker from the wall clock, strictly after every marker
    /// previously returned by this function.
    pub fn now() -> Self {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = LAST_STAMP.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last.saturating_add(1));
            match LAST_STAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Self(DateTime::from_timestamp_nanos(next)),
                Err(actual) => last = actual,
            }
        }
    }

    /// The underlying timestamp.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for SequenceOrder {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

/// A domain event payload.
///
/// `KIND` places the payload in the event hierarchy. Payloads must
/// serialize to JSON so that stores can persist them and so that a handler
/// declared for an ancestor kind can read a descendant's fields.
///
/// # Schema evolution
///
/// [`upcast`](EventType::upcast) is applied right before a payload is
/// handed to a handler. The default returns the payload unchanged. An
/// outdated payload type overrides it to convert itself into the current
/// shape; declaring the outdated kind with `.extends(Current::KIND)` lets it
/// resolve to the current handler.
pub trait EventType: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Identity of this payload type.
    const KIND: &'static Kind;

    /// Migrate this payload to the shape current handlers expect.
    fn upcast(self: Arc<Self>) -> Arc<dyn AnyEvent> {
        self
    }
}

/// Object-safe view of an [`EventType`]. Implemented for every event type.
pub trait AnyEvent: Debug + Send + Sync + 'static {
    fn kind(&self) -> &'static Kind;

    fn as_any(&self) -> &dyn Any;

    /// Dynamic entry point for [`EventType::upcast`].
    fn upcast_arc(self: Arc<Self>) -> Arc<dyn AnyEvent>;

    /// Serialize the payload to JSON.
    fn to_value(&self) -> serde_json::Result<Value>;
}

impl<E: EventType> AnyEvent for E {
    fn kind(&self) -> &'static Kind {
        E::KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn upcast_arc(self: Arc<Self>) -> Arc<dyn AnyEvent> {
        EventType::upcast(self)
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// An immutable fact: a payload plus its sequence-order marker.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone)]
pub struct Event {
    data: Arc<dyn AnyEvent>,
    sequence_order: SequenceOrder,
}

impl Event {
    /// Wrap `data`, stamped with [`SequenceOrder::now`].
    pub fn new<E: EventType>(data: E) -> Self {
        Self::at(data, SequenceOrder::now())
    }

    /// Wrap `data` with a caller-supplied marker.
    pub fn at<E: EventType>(data: E, sequence_order: impl Into<SequenceOrder>) -> Self {
        Self {
            data: Arc::new(data),
            sequence_order: sequence_order.into(),
        }
    }

    /// Wrap an already type-erased payload. Used by stores when decoding.
    pub fn from_parts(data: Arc<dyn AnyEvent>, sequence_order: SequenceOrder) -> Self {
        Self {
            data,
            sequence_order,
        }
    }

    pub fn kind(&self) -> &'static Kind {
        self.data.kind()
    }

    pub fn sequence_order(&self) -> SequenceOrder {
        self.sequence_order
    }

    /// The type-erased payload.
    pub fn payload(&self) -> &dyn AnyEvent {
        self.data.as_ref()
    }

    /// Typed access when the payload is exactly `E`.
    pub fn data<E: EventType>(&self) -> Option<&E> {
        self.data.as_any().downcast_ref::<E>()
    }

    /// Returns `true` if the payload is exactly `E`.
    pub fn is<E: EventType>(&self) -> bool {
        self.data.as_any().is::<E>()
    }

    /// Read the payload as `E` through its JSON form.
    ///
    /// Works for any payload whose fields are a superset of `E`'s, which is
    /// how a handler declared for an ancestor kind reads a descendant.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be represented as `E`.
    pub fn decode<E: EventType>(&self) -> serde_json::Result<E> {
        serde_json::from_value(self.data.to_value()?)
    }

    /// The same event with its payload migrated by [`EventType::upcast`].
    /// The marker is preserved.
    pub fn upcast(&self) -> Event {
        Event {
            data: Arc::clone(&self.data).upcast_arc(),
            sequence_order: self.sequence_order,
        }
    }
}

/// Persisted form of an [`Event`].
///
/// Serialized as `{ "kind": "...", "sequence_order": "...", "data": ... }`.
/// Turning a `StoredEvent` back into an [`Event`] requires the payload's
/// decoder, see [`Registry::decode`](crate::Registry::decode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Name of the payload's [`Kind`].
    pub kind: String,
    /// Marker copied from the event.
    pub sequence_order: SequenceOrder,
    /// JSON payload. `null` for unit payloads.
    #[serde(default)]
    pub data: Value,
}

impl StoredEvent {
    /// Encode an event for persistence.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    pub fn encode(event: &Event) -> serde_json::Result<Self> {
        Ok(Self {
            kind: event.kind().name().to_owned(),
            sequence_order: event.sequence_order(),
            data: event.payload().to_value()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        name: String,
    }

    impl EventType for Renamed {
        const KIND: &'static Kind = &Kind::event("test.renamed");
    }

    /// Outdated shape of `Renamed` that stored the name in two parts.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RenamedV1 {
        first: String,
        last: String,
    }

    impl EventType for RenamedV1 {
        const KIND: &'static Kind = &Kind::event("test.renamed.v1").extends(Renamed::KIND);

        fn upcast(self: Arc<Self>) -> Arc<dyn AnyEvent> {
            Arc::new(Renamed {
                name: format!("{} {}", self.first, self.last),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged;

    impl EventType for Pinged {
        const KIND: &'static Kind = &Kind::event("test.pinged");
    }

    #[test]
    fn new_event_is_stamped_with_current_time() {
        let before = Utc::now() - Duration::seconds(1);
        let event = Event::new(Pinged);
        assert!(event.sequence_order().as_datetime() > before);
    }

    #[test]
    fn custom_sequence_order_is_kept() {
        let yesterday = Utc::now() - Duration::days(1);
        let event = Event::at(Pinged, yesterday);
        assert_eq!(event.sequence_order().as_datetime(), yesterday);
    }

    #[test]
    fn now_is_strictly_increasing() {
        let stamps: Vec<SequenceOrder> = (0..1000).map(|_| SequenceOrder::now()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn default_upcast_is_identity() {
        let event = Event::new(Renamed {
            name: "Ada".into(),
        });
        let upcast = event.upcast();
        assert_eq!(upcast.kind(), Renamed::KIND);
        assert_eq!(upcast.sequence_order(), event.sequence_order());
        assert!(Arc::ptr_eq(&event.data, &upcast.data));
    }

    #[test]
    fn overridden_upcast_migrates_payload() {
        let event = Event::new(RenamedV1 {
            first: "Ada".into(),
            last: "Lovelace".into(),
        });
        let upcast = event.upcast();

        assert_eq!(upcast.kind(), Renamed::KIND);
        assert_eq!(upcast.sequence_order(), event.sequence_order());
        assert_eq!(
            upcast.data::<Renamed>().map(|r| r.name.as_str()),
            Some("Ada Lovelace")
        );
    }

    #[test]
    fn typed_access_requires_exact_type() {
        let event = Event::new(Pinged);
        assert!(event.is::<Pinged>());
        assert!(event.data::<Renamed>().is_none());
    }

    #[test]
    fn decode_reads_through_json() {
        let event = Event::new(Renamed {
            name: "Grace".into(),
        });
        let decoded: Renamed = event.decode().expect("decode should succeed");
        assert_eq!(decoded.name, "Grace");
        assert!(event.decode::<RenamedV1>().is_err());
    }

    #[test]
    fn stored_event_carries_kind_marker_and_payload() {
        let event = Event::new(Renamed {
            name: "Linus".into(),
        });
        let stored = StoredEvent::encode(&event).expect("encode should succeed");

        assert_eq!(stored.kind, "test.renamed");
        assert_eq!(stored.sequence_order, event.sequence_order());
        assert_eq!(stored.data, serde_json::json!({ "name": "Linus" }));

        let line = serde_json::to_string(&stored).expect("serialize");
        let parsed: StoredEvent = serde_json::from_str(&line).expect("parse");
        assert_eq!(parsed, stored);
    }

    #[test]
    fn unit_payload_stores_null() {
        let stored = StoredEvent::encode(&Event::new(Pinged)).expect("encode should succeed");
        assert!(stored.data.is_null());
    }
}
