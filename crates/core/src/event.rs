use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// A typed domain event.
///
/// Events are immutable facts. Each type carries a stable discriminator
/// (`EVENT_TYPE`) that is persisted next to the JSON payload and used to route
/// the payload back to a mutation function during rehydration.
///
/// `Default` is required so that payloads written by a newer or older schema
/// can still be decoded field-by-field (see [`crate::decode`]).
pub trait Event:
    Serialize + DeserializeOwned + Default + Clone + core::fmt::Debug + Send + Sync + 'static
{
    /// Stable event name (e.g. `"order.item_added"`).
    const EVENT_TYPE: &'static str;

    /// Serialize into the untyped form handed to the event store.
    fn emit(&self) -> DomainResult<Emitted> {
        Emitted::new(self)
    }
}

/// An event produced by a command, not yet positioned in a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub event_type: String,
    pub payload: JsonValue,
}

impl Emitted {
    pub fn new<E: Event>(event: &E) -> DomainResult<Self> {
        let payload = serde_json::to_value(event).map_err(|e| {
            DomainError::invariant(format!("event '{}' is not serializable: {e}", E::EVENT_TYPE))
        })?;
        Ok(Self {
            event_type: E::EVENT_TYPE.to_string(),
            payload,
        })
    }
}
