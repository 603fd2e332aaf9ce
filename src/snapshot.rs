//! Point-in-time captures of a state holder's public attributes.
//!
//! A snapshot stores the holder's state as a JSON object keyed by
//! attribute name. The state struct's serde fields form the explicit list
//! of captured attributes; fields marked `#[serde(skip)]` stay private.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::SequenceOrder;

/// Attribute name to value mapping captured from a state holder.
pub type Attributes = serde_json::Map<String, Value>;

/// A captured image of a holder's state at a position in its event sequence.
///
/// Loading resumes from `sequence_order`: only events strictly after it are
/// replayed on top of `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Id of the aggregate or projection this snapshot belongs to.
    pub owner_id: String,
    /// Snapshot type name, see [`State::snapshot_kind`](crate::State::snapshot_kind).
    pub kind: String,
    /// Captured attributes.
    pub data: Attributes,
    /// Marker of the last event folded into `data`.
    pub sequence_order: SequenceOrder,
}

impl Snapshot {
    pub fn new(
        owner_id: impl Into<String>,
        kind: impl Into<String>,
        data: Attributes,
        sequence_order: SequenceOrder,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            kind: kind.into(),
            data,
            sequence_order,
        }
    }
}

/// Capture a value's serde fields as [`Attributes`].
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails or the value does not
/// serialize to a JSON object.
pub fn capture<T: Serialize>(value: &T) -> serde_json::Result<Attributes> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "state must serialize to a JSON object, got `{other}`"
        ))),
    }
}

/// Build a value from captured [`Attributes`].
///
/// Attributes unknown to `T` are ignored; attributes missing from `data`
/// fall back to `T`'s serde defaults.
///
/// # Errors
///
/// Returns `serde_json::Error` if the attributes do not fit `T`.
pub fn restore<T: DeserializeOwned>(data: &Attributes) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(data.clone()))
}
