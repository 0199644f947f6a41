use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::warn;

use chronicle_core::Clock;
use chronicle_events::{EventBus, InMemoryEventBus, Subscription};

use super::message::DeliveredMessage;
use super::transport::{QueueTransport, TransportError, TransportFault};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DELIVERIES: u32 = 10;

#[derive(Debug, Clone)]
struct Entry {
    body: String,
    delivery_count: u32,
    /// Lock expiry once delivered; the deliver-at time before that.
    invisible_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    dead_letters: Vec<DeliveredMessage>,
}

/// In-process queue with visibility timeouts and a dead-letter list.
///
/// Visibility is measured on the injected clock, so tests drive redelivery by
/// advancing a `ManualClock`.
#[derive(Debug)]
pub struct InMemoryQueue {
    clock: Arc<dyn Clock>,
    visibility_timeout: chrono::Duration,
    max_deliveries: u32,
    state: Mutex<QueueState>,
    faults: InMemoryEventBus<TransportFault>,
    arrivals: Notify,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            visibility_timeout: chrono::Duration::from_std(DEFAULT_VISIBILITY_TIMEOUT)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            state: Mutex::new(QueueState::default()),
            faults: InMemoryEventBus::new(),
            arrivals: Notify::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(timeout) = chrono::Duration::from_std(timeout) {
            self.visibility_timeout = timeout;
        }
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Messages not yet completed or dead-lettered.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeliveredMessage> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    fn fault(&self, message_id: Option<String>, reason: String) {
        let fault = TransportFault {
            message_id,
            reason,
            occurred_at: self.clock.now(),
        };
        if let Err(e) = self.faults.publish(fault) {
            warn!(error = ?e, "failed to publish transport fault");
        }
    }

    fn take_visible(&self, max: usize) -> Result<Vec<DeliveredMessage>, TransportError> {
        let now = self.clock.now();
        let mut faults = Vec::new();
        let mut delivered = Vec::new();

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::State("queue lock poisoned".to_string()))?;
            let QueueState {
                entries,
                dead_letters,
                ..
            } = &mut *state;

            let visible: Vec<u64> = entries
                .iter()
                .filter(|(_, e)| e.invisible_until.is_none_or(|until| until <= now))
                .map(|(id, _)| *id)
                .collect();

            for id in visible {
                if delivered.len() >= max {
                    break;
                }
                let Some(entry) = entries.get_mut(&id) else {
                    continue;
                };
                let message_id = id.to_string();

                if entry.delivery_count > 0 {
                    faults.push((
                        message_id.clone(),
                        format!("lock expired after delivery {}", entry.delivery_count),
                    ));
                }
                if entry.delivery_count >= self.max_deliveries {
                    if let Some(entry) = entries.remove(&id) {
                        faults.push((
                            message_id.clone(),
                            format!("dead-lettered after {} deliveries", entry.delivery_count),
                        ));
                        dead_letters.push(DeliveredMessage {
                            message_id,
                            body: entry.body,
                            delivery_count: entry.delivery_count,
                        });
                    }
                    continue;
                }

                entry.delivery_count += 1;
                entry.invisible_until = Some(now + self.visibility_timeout);
                delivered.push(DeliveredMessage {
                    message_id,
                    body: entry.body.clone(),
                    delivery_count: entry.delivery_count,
                });
            }
        }

        for (message_id, reason) in faults {
            self.fault(Some(message_id), reason);
        }
        Ok(delivered)
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send(&self, body: String, not_before: Option<DateTime<Utc>>) -> Result<String, TransportError> {
        let id = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::State("queue lock poisoned".to_string()))?;
            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(
                id,
                Entry {
                    body,
                    delivery_count: 0,
                    invisible_until: not_before,
                },
            );
            id
        };
        self.arrivals.notify_one();
        Ok(id.to_string())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<DeliveredMessage>, TransportError> {
        let delivered = self.take_visible(max)?;
        if !delivered.is_empty() || wait.is_zero() {
            return Ok(delivered);
        }

        let _ = tokio::time::timeout(wait, self.arrivals.notified()).await;
        self.take_visible(max)
    }

    async fn complete(&self, message: &DeliveredMessage) -> Result<(), TransportError> {
        let id: u64 = message
            .message_id
            .parse()
            .map_err(|_| TransportError::Command(format!("unknown message id '{}'", message.message_id)))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::State("queue lock poisoned".to_string()))?;
        state.entries.remove(&id);
        Ok(())
    }

    fn faults(&self) -> Subscription<TransportFault> {
        self.faults.subscribe()
    }
}
