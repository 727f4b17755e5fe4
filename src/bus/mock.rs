//! Mock bus implementation for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{BusClient, BusConnector, BusError, BusMessage, QoS, Result};

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct MockPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock bus connection recording every call, with injectable inbound
/// messages and failure modes.
pub struct MockBus {
    connected: AtomicBool,
    fail_publish_prefix: Mutex<Option<String>>,
    published: Mutex<Vec<MockPublish>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    message_tx: mpsc::Sender<BusMessage>,
}

impl MockBus {
    /// Create a connected mock together with its message stream.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<BusMessage>) {
        let (message_tx, message_rx) = mpsc::channel(64);
        let bus = Arc::new(Self {
            connected: AtomicBool::new(true),
            fail_publish_prefix: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            message_tx,
        });
        (bus, message_rx)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail only publishes whose topic starts with `prefix`.
    pub fn set_fail_publish_prefix(&self, prefix: Option<&str>) {
        *self.fail_publish_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    /// Deliver an inbound message as if it arrived on a subscribed filter.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.message_tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await
            .expect("mock message receiver dropped");
    }

    pub fn published(&self) -> Vec<MockPublish> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<MockPublish> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusClient for MockBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        if let Some(prefix) = self.fail_publish_prefix.lock().unwrap().as_deref() {
            if topic.starts_with(prefix) {
                return Err(BusError::Publish(format!(
                    "mock publish failure for '{topic}'"
                )));
            }
        }
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.published.lock().unwrap().push(MockPublish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.subscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.unsubscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }
}

/// Connector handing out [`MockBus`] instances, retrievable afterwards by
/// client id for inspection and message injection.
#[derive(Default)]
pub struct MockConnector {
    buses: Mutex<HashMap<String, Arc<MockBus>>>,
    fail_next_connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// The connection created for `client_id`, if any.
    pub fn bus(&self, client_id: &str) -> Option<Arc<MockBus>> {
        self.buses.lock().unwrap().get(client_id).cloned()
    }
}

#[async_trait]
impl BusConnector for MockConnector {
    async fn connect(
        &self,
        client_id: &str,
    ) -> Result<(Arc<dyn BusClient>, mpsc::Receiver<BusMessage>)> {
        let remaining = self.fail_next_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BusError::Connection("mock connect failure".to_string()));
        }

        let (bus, message_rx) = MockBus::new();
        self.buses
            .lock()
            .unwrap()
            .insert(client_id.to_string(), bus.clone());
        Ok((bus, message_rx))
    }
}
