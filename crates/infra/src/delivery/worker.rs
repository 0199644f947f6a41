use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chronicle_events::Subscription;

use crate::scheduling::ScheduledCommandStore;

use super::adapter::QueueDeliveryAdapter;
use super::transport::TransportFault;

/// Delivery worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Messages requested per receive
    pub batch_size: usize,
    /// How long a receive waits when the queue is empty
    pub receive_wait: Duration,
    /// Pause after a failed receive
    pub error_backoff: Duration,
    /// Interval of the trigger pass over everything due; `None` disables it
    pub sweep_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "delivery-worker".to_string(),
            batch_size: 16,
            receive_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            sweep_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Handle to stop a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "delivery worker ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Receives delivery messages and runs them through the adapter.
///
/// - Each message is handled independently; dispositions are logged
/// - Transport faults are drained into the log after every batch
/// - An optional periodic sweep catches commands whose message never arrived
#[derive(Debug)]
pub struct DeliveryWorker;

impl DeliveryWorker {
    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn<S>(adapter: Arc<QueueDeliveryAdapter<S>>, config: WorkerConfig) -> WorkerHandle
    where
        S: ScheduledCommandStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let faults = adapter.transport().faults();
        let join = tokio::spawn(worker_loop(adapter, config, faults, shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop<S>(
    adapter: Arc<QueueDeliveryAdapter<S>>,
    config: WorkerConfig,
    faults: Subscription<TransportFault>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: ScheduledCommandStore + 'static,
{
    let name = config.name.as_str();
    let mut sweep = config.sweep_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    info!(worker = name, "delivery worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick(&mut sweep) => {
                match adapter.engine().sweep().await {
                    Ok(result) if !result.is_empty() => debug!(
                        worker = name,
                        succeeded = result.successful_commands.len(),
                        failed = result.failed_commands.len(),
                        "sweep finished"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(worker = name, error = %e, "sweep failed"),
                }
            }
            received = adapter.transport().receive(config.batch_size, config.receive_wait) => {
                match received {
                    Ok(messages) => {
                        for message in &messages {
                            let disposition = adapter.handle(message).await;
                            debug!(worker = name, message_id = %message.message_id, ?disposition, "message handled");
                        }
                    }
                    Err(e) => {
                        warn!(worker = name, error = %e, "receive failed");
                        tokio::time::sleep(config.error_backoff).await;
                    }
                }
            }
        }

        for fault in faults.drain() {
            warn!(
                worker = name,
                message_id = fault.message_id.as_deref().unwrap_or("-"),
                reason = %fault.reason,
                "transport fault"
            );
        }
    }

    info!(worker = name, "delivery worker stopped");
}

/// Next sweep tick, or never when sweeping is disabled.
async fn tick(sweep: &mut Option<tokio::time::Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
