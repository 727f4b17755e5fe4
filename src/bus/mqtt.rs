//! MQTT bus implementation backed by rumqttc.
//!
//! Each connection runs its own event loop task that tracks connect state,
//! forwards inbound publishes to the owner's message channel and retries
//! after transport errors, so the broker link heals itself without the
//! owning worker noticing more than a `is_connected() == false` window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS as MqttQoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BusClient, BusConnector, BusError, BusMessage, QoS, Result};

/// Capacity of the per-connection inbound message channel.
const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Delay before re-polling the event loop after a transport error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

/// Connector holding the broker address; one [`MqttBus`] per identity.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(60),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

#[async_trait]
impl BusConnector for MqttConnector {
    async fn connect(
        &self,
        client_id: &str,
    ) -> Result<(Arc<dyn BusClient>, mpsc::Receiver<BusMessage>)> {
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));

        let bus = Arc::new(MqttBus {
            client,
            connected: connected.clone(),
            stopping: stopping.clone(),
            client_id: client_id.to_string(),
        });

        let client_id = client_id.to_string();
        let host = self.host.clone();
        let port = self.port;
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        info!(
                            client_id = %client_id,
                            broker = %format!("{host}:{port}"),
                            "Connected to MQTT broker"
                        );
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = BusMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload,
                        };
                        match message_tx.try_send(message) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(
                                    client_id = %client_id,
                                    topic = %publish.topic,
                                    "Inbound message channel full, dropping message"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                // Publish-only connections drop their receiver.
                                debug!(
                                    client_id = %client_id,
                                    topic = %publish.topic,
                                    "No message consumer, dropping message"
                                );
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!(client_id = %client_id, "Broker requested disconnect");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        if stopping.load(Ordering::SeqCst) {
                            debug!(client_id = %client_id, "MQTT event loop stopped");
                            break;
                        }
                        warn!(
                            client_id = %client_id,
                            error = %e,
                            "MQTT connection error, retrying in {:?}",
                            RECONNECT_DELAY
                        );
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok((bus, message_rx))
    }
}

/// One MQTT connection. Publish calls enqueue into the client's request
/// channel; rumqttc serializes concurrent senders internally.
pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    client_id: String,
}

#[async_trait]
impl BusClient for MqttBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        self.client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.client
            .subscribe(filter, MqttQoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BusError::Unsubscribe(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        debug!(client_id = %self.client_id, "Disconnecting from MQTT broker");
        self.client
            .disconnect()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }
}
