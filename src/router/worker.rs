//! Per-title subscriber worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusConnector, BusMessage};
use crate::delivery::EventReporter;
use crate::relay::relay_bus_message;
use crate::topic::TopicCodec;

use super::Command;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One worker per subscribing AE title.
///
/// Owns a dedicated bus connection whose client id is the title itself,
/// applies subscription commands strictly in arrival order, and forwards
/// every received message to the delivery path. Terminates when the
/// command channel closes.
pub struct SubscriberWorker {
    title: String,
    connector: Arc<dyn BusConnector>,
    reporter: Arc<EventReporter>,
    codec: TopicCodec,
    cmd_rx: mpsc::Receiver<Command>,
    // Filters currently applied, replayed after a reconnect.
    filters: Vec<String>,
}

impl SubscriberWorker {
    pub fn new(
        title: String,
        connector: Arc<dyn BusConnector>,
        reporter: Arc<EventReporter>,
        codec: TopicCodec,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            title,
            connector,
            reporter,
            codec,
            cmd_rx,
            filters: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let (mut bus, mut msg_rx) = self.connect_with_retry().await;

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.apply_command(bus.as_ref(), cmd).await,
                        None => {
                            debug!(title = %self.title, "Command channel closed, worker stopping");
                            if let Err(e) = bus.disconnect().await {
                                warn!(title = %self.title, error = %e, "Disconnect failed");
                            }
                            return;
                        }
                    }
                }

                msg = msg_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(&msg).await,
                        None => {
                            warn!(title = %self.title, "Bus connection lost, reconnecting");
                            let (new_bus, new_rx) = self.connect_with_retry().await;
                            bus = new_bus;
                            msg_rx = new_rx;
                            self.resubscribe(bus.as_ref()).await;
                        }
                    }
                }
            }
        }
    }

    async fn apply_command(&mut self, bus: &dyn BusClient, cmd: Command) {
        match cmd {
            Command::Subscribe { filter } => {
                if let Err(e) = bus.subscribe(&filter).await {
                    warn!(title = %self.title, filter = %filter, error = %e, "Subscribe failed");
                    return;
                }
                if !self.filters.contains(&filter) {
                    self.filters.push(filter.clone());
                }
                info!(title = %self.title, filter = %filter, "Subscribed");
            }
            Command::Unsubscribe { filter } => {
                if let Err(e) = bus.unsubscribe(&filter).await {
                    warn!(title = %self.title, filter = %filter, error = %e, "Unsubscribe failed");
                    return;
                }
                self.filters.retain(|f| f != &filter);
                info!(title = %self.title, filter = %filter, "Unsubscribed");
            }
        }
    }

    async fn handle_message(&self, message: &BusMessage) {
        relay_bus_message(&self.codec, &self.reporter, &self.title, message).await;
    }

    async fn resubscribe(&self, bus: &dyn BusClient) {
        for filter in &self.filters {
            if let Err(e) = bus.subscribe(filter).await {
                warn!(title = %self.title, filter = %filter, error = %e, "Resubscribe failed");
            }
        }
    }

    async fn connect_with_retry(&self) -> (Arc<dyn BusClient>, mpsc::Receiver<BusMessage>) {
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            match self.connector.connect(&self.title).await {
                Ok(connection) => {
                    info!(title = %self.title, "Subscriber connected to bus");
                    return connection;
                }
                Err(e) => {
                    warn!(
                        title = %self.title,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Bus connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }
}
