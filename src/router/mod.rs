//! Subscription manager.
//!
//! The [`Router`] owns the table of active subscriber workers, one per
//! subscribing AE title. A title goes from absent to active the first time
//! it registers; there is no business-logic path back to absent, only
//! [`Router::shutdown`]. Subscribe and unsubscribe commands travel over a
//! per-title FIFO channel to exactly the worker owning that title; titles
//! are fully independent of each other.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::BusConnector;
use crate::delivery::EventReporter;
use crate::topic::TopicCodec;

mod worker;

use worker::SubscriberWorker;

/// Capacity of a per-subscriber command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Grace period for a worker to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Subscription command, applied FIFO by the owning worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe { filter: String },
    Unsubscribe { filter: String },
}

struct SubscriberHandle {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Owns all subscriber workers and routes commands to them.
pub struct Router {
    connector: Arc<dyn BusConnector>,
    reporter: Arc<EventReporter>,
    codec: TopicCodec,
    subscribers: Mutex<HashMap<String, SubscriberHandle>>,
}

impl Router {
    pub fn new(
        connector: Arc<dyn BusConnector>,
        reporter: Arc<EventReporter>,
        codec: TopicCodec,
    ) -> Self {
        Self {
            connector,
            reporter,
            codec,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `title` to `topic` (default: everything under the topic
    /// base). Starts a worker for the title on first registration; later
    /// registrations reuse the existing worker and add the new filter to
    /// it. Subscriptions are additive.
    pub async fn register_subscriber(&self, title: &str, topic: Option<&str>) {
        let filter = self.codec.filter(topic);

        // The table guard is released before the send: a wedged worker with
        // a full command channel must only delay its own title.
        let cmd_tx = {
            let mut subscribers = self.subscribers.lock().await;
            match subscribers.entry(title.to_string()) {
                Entry::Occupied(entry) => entry.get().cmd_tx.clone(),
                Entry::Vacant(entry) => {
                    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
                    let worker = SubscriberWorker::new(
                        title.to_string(),
                        self.connector.clone(),
                        self.reporter.clone(),
                        self.codec.clone(),
                        cmd_rx,
                    );
                    let task = tokio::spawn(worker.run());
                    info!(title = %title, "Registered subscriber, worker started");
                    entry.insert(SubscriberHandle { cmd_tx, task }).cmd_tx.clone()
                }
            }
        };

        if cmd_tx
            .send(Command::Subscribe {
                filter: filter.clone(),
            })
            .await
            .is_err()
        {
            warn!(title = %title, "Subscriber worker is gone, dropping subscribe command");
            return;
        }
        info!(title = %title, filter = %filter, "Subscribe command enqueued");
    }

    /// Unsubscribe `title` from `topic` (default filter when absent). An
    /// unknown title is reported and otherwise ignored.
    pub async fn unregister_subscriber(&self, title: &str, topic: Option<&str>) {
        let filter = self.codec.filter(topic);

        let cmd_tx = {
            let subscribers = self.subscribers.lock().await;
            let Some(handle) = subscribers.get(title) else {
                warn!(title = %title, "Subscriber not found");
                return;
            };
            handle.cmd_tx.clone()
        };

        if cmd_tx
            .send(Command::Unsubscribe {
                filter: filter.clone(),
            })
            .await
            .is_err()
        {
            warn!(title = %title, "Subscriber worker is gone, dropping unsubscribe command");
            return;
        }
        info!(title = %title, filter = %filter, "Unsubscribe command enqueued");
    }

    /// Whether a worker is active for `title`.
    pub async fn is_active(&self, title: &str) -> bool {
        self.subscribers.lock().await.contains_key(title)
    }

    /// Number of active subscriber workers.
    pub async fn active_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Stop all workers: close their command channels, wait a bounded
    /// grace period, abort stragglers.
    pub async fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock().await;
        let handles: Vec<(String, SubscriberHandle)> = subscribers.drain().collect();
        drop(subscribers);

        for (title, handle) in handles {
            let SubscriberHandle { cmd_tx, mut task } = handle;
            drop(cmd_tx);
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(_) => debug!(title = %title, "Subscriber worker stopped"),
                Err(_) => {
                    warn!(title = %title, "Subscriber worker unresponsive, aborting");
                    task.abort();
                }
            }
        }
        info!("All subscriber workers stopped");
    }
}
