//! Pub/sub bus abstraction.
//!
//! This module contains:
//! - `BusClient` trait: connect-state, publish, subscribe, unsubscribe
//! - `BusConnector` trait: one connection per identity, with its inbound
//!   message stream
//! - Implementations: MQTT (rumqttc), Mock
//!
//! Each subscriber worker holds its own connection identified by its AE
//! title; the protocol service handlers and the health aggregator share a
//! single outbound connection identified by the adapter AE title.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod mock;
pub mod mqtt;

pub use mock::{MockBus, MockConnector};
pub use mqtt::{MqttBus, MqttConnector};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("Not connected to broker")]
    Disconnected,
}

/// Delivery guarantee requested for a publish or subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// At least once.
    #[default]
    AtLeastOnce,
    /// Exactly once.
    ExactlyOnce,
}

impl QoS {
    /// Map a numeric QoS level (0..=2); anything else falls back to 1.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

/// A message received on a subscribed filter.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// One live connection to the broker.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Current connection state as last observed by the transport.
    fn is_connected(&self) -> bool;

    /// Publish a payload. Enqueue-level success only; no broker
    /// acknowledgment is awaited.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Unsubscribe from a topic filter.
    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Cleanly disconnect.
    async fn disconnect(&self) -> Result<()>;
}

/// Creates broker connections for a given client identity.
///
/// Returns the client handle together with the receiving end of its
/// inbound message stream. Connections are independent: a worker's broken
/// connection never affects another worker or the shared outbound one.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(
        &self,
        client_id: &str,
    ) -> Result<(Arc<dyn BusClient>, mpsc::Receiver<BusMessage>)>;
}
