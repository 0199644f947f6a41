//! Order aggregate and wiring shared by the unit and pipeline tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use chronicle_core::{
    Aggregate, AggregateId, Command, DomainError, DomainResult, Emitted, Event, EventRegistry,
    ManualClock,
};
use chronicle_events::{EventEnvelope, InMemoryEventBus};

use crate::event_store::{InMemoryEventStore, StoredEvent};
use crate::repository::EventSourcedRepository;
use crate::snapshot::InMemorySnapshotStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: AggregateId,
    pub skus: Vec<String>,
    pub item_count: u32,
    pub total_cents: i64,
    pub placed_by: Option<String>,
    pub shipped_with: Option<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemAdded {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl Event for ItemAdded {
    const EVENT_TYPE: &'static str = "order.item_added";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub placed_by: String,
}

impl Event for OrderPlaced {
    const EVENT_TYPE: &'static str = "order.placed";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderShipped {
    pub carrier: String,
}

impl Event for OrderShipped {
    const EVENT_TYPE: &'static str = "order.shipped";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteAdded {
    pub text: String,
}

impl Event for NoteAdded {
    const EVENT_TYPE: &'static str = "order.note_added";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderCommand {
    AddItem {
        sku: String,
        quantity: u32,
        unit_price_cents: i64,
    },
    /// One single-unit line per sku, all from one command.
    AddBundle {
        skus: Vec<String>,
        unit_price_cents: i64,
    },
    Place {
        by: String,
    },
    Ship {
        carrier: String,
    },
    Annotate {
        text: String,
    },
}

impl OrderCommand {
    pub fn add(sku: &str, quantity: u32, unit_price_cents: i64) -> Self {
        Self::AddItem {
            sku: sku.to_string(),
            quantity,
            unit_price_cents,
        }
    }

    pub fn bundle(skus: &[&str], unit_price_cents: i64) -> Self {
        Self::AddBundle {
            skus: skus.iter().map(|sku| sku.to_string()).collect(),
            unit_price_cents,
        }
    }

    pub fn place(by: &str) -> Self {
        Self::Place { by: by.to_string() }
    }

    pub fn ship(carrier: &str) -> Self {
        Self::Ship {
            carrier: carrier.to_string(),
        }
    }

    pub fn annotate(text: &str) -> Self {
        Self::Annotate {
            text: text.to_string(),
        }
    }
}

impl Command for OrderCommand {
    fn command_name(&self) -> &'static str {
        match self {
            OrderCommand::AddItem { .. } => "add_item",
            OrderCommand::AddBundle { .. } => "add_bundle",
            OrderCommand::Place { .. } => "place",
            OrderCommand::Ship { .. } => "ship",
            OrderCommand::Annotate { .. } => "annotate",
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;

    const AGGREGATE_TYPE: &'static str = "order";

    fn initial(id: AggregateId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    fn registry() -> EventRegistry<Self> {
        EventRegistry::<Self>::new(Self::AGGREGATE_TYPE)
            .on::<ItemAdded>(|order, e| {
                order.item_count += e.quantity;
                order.total_cents += i64::from(e.quantity) * e.unit_price_cents;
                order.skus.push(e.sku);
            })
            .on::<OrderPlaced>(|order, e| order.placed_by = Some(e.placed_by))
            .on::<OrderShipped>(|order, e| order.shipped_with = Some(e.carrier))
            .on::<NoteAdded>(|order, e| order.notes.push(e.text))
    }

    fn handle(&self, command: &OrderCommand) -> DomainResult<Vec<Emitted>> {
        match command {
            OrderCommand::AddItem {
                sku,
                quantity,
                unit_price_cents,
            } => {
                if *quantity == 0 {
                    return Err(DomainError::validation("quantity must be positive"));
                }
                if self.placed_by.is_some() {
                    return Err(DomainError::conflict("order already placed"));
                }
                Ok(vec![
                    ItemAdded {
                        sku: sku.clone(),
                        quantity: *quantity,
                        unit_price_cents: *unit_price_cents,
                    }
                    .emit()?,
                ])
            }
            OrderCommand::AddBundle {
                skus,
                unit_price_cents,
            } => {
                if skus.is_empty() {
                    return Err(DomainError::validation("bundle is empty"));
                }
                if self.placed_by.is_some() {
                    return Err(DomainError::conflict("order already placed"));
                }
                skus.iter()
                    .map(|sku| {
                        ItemAdded {
                            sku: sku.clone(),
                            quantity: 1,
                            unit_price_cents: *unit_price_cents,
                        }
                        .emit()
                    })
                    .collect()
            }
            OrderCommand::Place { by } => {
                if self.item_count == 0 {
                    return Err(DomainError::invariant("cannot place an empty order"));
                }
                if self.placed_by.is_some() {
                    return Err(DomainError::conflict("order already placed"));
                }
                Ok(vec![OrderPlaced { placed_by: by.clone() }.emit()?])
            }
            OrderCommand::Ship { carrier } => {
                if self.placed_by.is_none() {
                    return Err(DomainError::invariant("order must be placed before shipping"));
                }
                if self.shipped_with.is_some() {
                    return Err(DomainError::conflict("order already shipped"));
                }
                Ok(vec![OrderShipped { carrier: carrier.clone() }.emit()?])
            }
            OrderCommand::Annotate { text } => {
                if text.trim().is_empty() {
                    return Err(DomainError::validation("note text is empty"));
                }
                Ok(vec![NoteAdded { text: text.clone() }.emit()?])
            }
        }
    }
}

/// Fixed test epoch plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes)
}

/// A raw stored event, stamped at `at(minute)`.
pub fn stored(
    aggregate_id: AggregateId,
    sequence_number: u64,
    event_type: &str,
    payload: JsonValue,
    minute: i64,
) -> StoredEvent {
    StoredEvent {
        event_id: Uuid::now_v7(),
        aggregate_id,
        aggregate_type: Order::AGGREGATE_TYPE.to_string(),
        sequence_number,
        event_type: event_type.to_string(),
        actor: None,
        etag: None,
        occurred_at: at(minute),
        payload,
    }
}

/// `ItemAdded` of one unit at position `sequence_number`, stamped at `at(sequence_number)`.
pub fn item_added(aggregate_id: AggregateId, sequence_number: u64) -> StoredEvent {
    stored(
        aggregate_id,
        sequence_number,
        ItemAdded::EVENT_TYPE,
        serde_json::json!({
            "sku": format!("sku-{sequence_number}"),
            "quantity": 1,
            "unit_price_cents": 100
        }),
        sequence_number as i64,
    )
}

pub type TestBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type OrderRepository = EventSourcedRepository<Order, Arc<InMemoryEventStore>, TestBus>;

/// In-memory wiring around one manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryEventStore>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub bus: TestBus,
    pub repository: Arc<OrderRepository>,
}

impl Harness {
    pub fn new() -> Self {
        chronicle_observability::init();

        let clock = Arc::new(ManualClock::new(at(0)));
        let store = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let bus: TestBus = Arc::new(InMemoryEventBus::new());
        let repository = Arc::new(
            OrderRepository::new(store.clone(), bus.clone(), clock.clone())
                .with_snapshots(snapshots.clone()),
        );

        Self {
            clock,
            store,
            snapshots,
            bus,
            repository,
        }
    }

    /// A second repository over the same store and bus, without snapshots.
    pub fn unsnapshotted_repository(&self) -> OrderRepository {
        OrderRepository::new(self.store.clone(), self.bus.clone(), self.clock.clone())
    }

    /// Create and save an order with `items` single-unit lines.
    pub async fn seed_order(&self, items: usize) -> AggregateId {
        let id = AggregateId::new();
        let mut order = self.repository.create(id);
        for n in 0..items {
            order
                .execute(
                    &OrderCommand::add(&format!("sku-{n}"), 1, 100),
                    self.repository.context().by("seeder"),
                )
                .unwrap();
        }
        self.repository.save(&mut order).await.unwrap();
        id
    }
}
