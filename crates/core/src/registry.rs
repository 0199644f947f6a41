//! Event-type dispatch.
//!
//! Maps each persisted event-type discriminator to a pure mutation function for
//! one aggregate state type. Built once per aggregate type via
//! [`crate::Aggregate::registry`].

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::decode::{DecodeError, decode_lenient};
use crate::event::Event;

type Mutation<S> = Box<dyn Fn(&mut S, &JsonValue) -> Result<Vec<String>, DecodeError> + Send + Sync>;

/// What happened when a stored payload was routed through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Decoded strictly and applied.
    Applied,
    /// Applied using the fields that decoded; the listed members were dropped.
    AppliedPartially { ignored_fields: Vec<String> },
    /// No mutation is registered for this event type. State is unchanged.
    UnknownType,
    /// The payload could not be decoded at all. State is unchanged.
    Undecodable(String),
}

impl ApplyOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied | Self::AppliedPartially { .. })
    }
}

pub struct EventRegistry<S> {
    aggregate_type: &'static str,
    mutations: HashMap<&'static str, Mutation<S>>,
}

impl<S: 'static> EventRegistry<S> {
    pub fn new(aggregate_type: &'static str) -> Self {
        Self {
            aggregate_type,
            mutations: HashMap::new(),
        }
    }

    /// Register the mutation for event type `E`. Registering the same type twice
    /// replaces the earlier mutation.
    pub fn on<E: Event>(mut self, mutate: fn(&mut S, E)) -> Self {
        self.mutations.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut S, payload: &JsonValue| {
                let decoded = decode_lenient::<E>(payload)?;
                mutate(state, decoded.value);
                Ok(decoded.ignored_fields)
            }),
        );
        self
    }
}

impl<S> EventRegistry<S> {
    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mutations.keys().copied()
    }

    /// Route a stored payload to its mutation.
    ///
    /// `state` is only touched when the outcome reports it was applied.
    pub fn apply(&self, state: &mut S, event_type: &str, payload: &JsonValue) -> ApplyOutcome {
        let Some(mutate) = self.mutations.get(event_type) else {
            return ApplyOutcome::UnknownType;
        };
        match mutate(state, payload) {
            Ok(ignored_fields) if ignored_fields.is_empty() => ApplyOutcome::Applied,
            Ok(ignored_fields) => ApplyOutcome::AppliedPartially { ignored_fields },
            Err(e) => ApplyOutcome::Undecodable(e.to_string()),
        }
    }
}

impl<S> core::fmt::Debug for EventRegistry<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.event_types().collect();
        types.sort_unstable();
        f.debug_struct("EventRegistry")
            .field("aggregate_type", &self.aggregate_type)
            .field("event_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Counter {
        total: i64,
        label: String,
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Incremented {
        by: i64,
    }

    impl Event for Incremented {
        const EVENT_TYPE: &'static str = "counter.incremented";
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Labelled {
        label: String,
        colour: u8,
    }

    impl Event for Labelled {
        const EVENT_TYPE: &'static str = "counter.labelled";
    }

    fn registry() -> EventRegistry<Counter> {
        EventRegistry::<Counter>::new("counter")
            .on::<Incremented>(|c, e| c.total += e.by)
            .on::<Labelled>(|c, e| c.label = e.label)
    }

    #[test]
    fn routes_by_discriminator() {
        let registry = registry();
        let mut state = Counter::default();

        let outcome = registry.apply(&mut state, "counter.incremented", &json!({ "by": 3 }));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(state.total, 3);
    }

    #[test]
    fn unknown_types_leave_state_alone() {
        let registry = registry();
        let mut state = Counter::default();

        let outcome = registry.apply(&mut state, "counter.reset", &json!({}));
        assert_eq!(outcome, ApplyOutcome::UnknownType);
        assert_eq!(state.total, 0);
    }

    #[test]
    fn partial_payloads_are_applied_and_reported() {
        let registry = registry();
        let mut state = Counter::default();

        let outcome = registry.apply(
            &mut state,
            "counter.labelled",
            &json!({ "label": "north", "colour": "red" }),
        );
        assert_eq!(
            outcome,
            ApplyOutcome::AppliedPartially {
                ignored_fields: vec!["colour".to_string()]
            }
        );
        assert_eq!(state.label, "north");
    }

    #[test]
    fn undecodable_payloads_leave_state_alone() {
        let registry = registry();
        let mut state = Counter::default();

        let outcome = registry.apply(&mut state, "counter.incremented", &json!("three"));
        assert!(matches!(outcome, ApplyOutcome::Undecodable(_)));
        assert!(!outcome.was_applied());
        assert_eq!(state.total, 0);
    }

    #[test]
    fn debug_lists_registered_types_in_order() {
        let rendered = format!("{:?}", registry());
        assert_eq!(
            rendered,
            r#"EventRegistry { aggregate_type: "counter", event_types: ["counter.incremented", "counter.labelled"] }"#
        );
    }

    #[test]
    fn registering_a_type_twice_keeps_the_later_mutation() {
        let registry = registry().on::<Incremented>(|c, e| c.total -= e.by);
        let mut state = Counter::default();

        registry.apply(&mut state, "counter.incremented", &json!({ "by": 2 }));
        assert_eq!(state.total, -2);
        assert_eq!(registry.event_types().count(), 2);
    }
}
