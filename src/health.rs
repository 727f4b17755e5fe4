//! Background health aggregator.
//!
//! Probes the bus connection and the DIMSE server surface on an interval,
//! publishes retained status topics plus a heartbeat, and keeps running
//! through probe failures. Consumers watch the retained status topics; the
//! heartbeat is fire-and-forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusError, QoS};
use crate::config::HealthConfig;
use crate::dimse::ServerLiveness;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Health of one tracked component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Unknown,
    Healthy,
    Degraded,
    Error,
}

impl ComponentHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentHealth::Unknown => "unknown",
            ComponentHealth::Healthy => "healthy",
            ComponentHealth::Degraded => "degraded",
            ComponentHealth::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
struct ComponentStatus {
    health: ComponentHealth,
    detail: Option<Value>,
    checked_at: DateTime<Utc>,
}

/// Tracked component healths, with the overall status derived on read.
#[derive(Debug, Default)]
pub struct HealthState {
    mqtt: Option<ComponentStatus>,
    dimse: Option<ComponentStatus>,
    components: HashMap<String, ComponentStatus>,
}

impl HealthState {
    fn health_of(slot: &Option<ComponentStatus>) -> ComponentHealth {
        slot.as_ref()
            .map(|s| s.health)
            .unwrap_or(ComponentHealth::Unknown)
    }

    pub fn mqtt(&self) -> ComponentHealth {
        Self::health_of(&self.mqtt)
    }

    pub fn dimse(&self) -> ComponentHealth {
        Self::health_of(&self.dimse)
    }

    /// Overall status: any error wins, then any degraded; healthy requires
    /// both tracked surfaces to be exactly healthy.
    pub fn overall(&self) -> ComponentHealth {
        let all = || {
            [self.mqtt(), self.dimse()]
                .into_iter()
                .chain(self.components.values().map(|s| s.health))
        };
        if all().any(|h| h == ComponentHealth::Error) {
            ComponentHealth::Error
        } else if all().any(|h| h == ComponentHealth::Degraded) {
            ComponentHealth::Degraded
        } else if self.mqtt() == ComponentHealth::Healthy && self.dimse() == ComponentHealth::Healthy
        {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::Unknown
        }
    }

    fn set(&mut self, name: &str, health: ComponentHealth, detail: Option<Value>) {
        let status = ComponentStatus {
            health,
            detail,
            checked_at: Utc::now(),
        };
        match name {
            "mqtt" => self.mqtt = Some(status),
            "dimse" => self.dimse = Some(status),
            other => {
                self.components.insert(other.to_string(), status);
            }
        }
    }

    fn component_json(status: &ComponentStatus) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("status".to_string(), json!(status.health.as_str()));
        body.insert(
            "last_check".to_string(),
            json!(status.checked_at.to_rfc3339()),
        );
        if let Some(detail) = &status.detail {
            body.insert("detail".to_string(), detail.clone());
        }
        Value::Object(body)
    }

    /// Composite wire form: overall status plus every component, the two
    /// tracked surfaces included.
    fn to_json(&self) -> Value {
        let mut components = serde_json::Map::new();
        for (name, slot) in [("mqtt", &self.mqtt), ("dimse", &self.dimse)] {
            components.insert(
                name.to_string(),
                match slot {
                    Some(status) => Self::component_json(status),
                    None => json!({"status": ComponentHealth::Unknown.as_str()}),
                },
            );
        }
        for (name, status) in &self.components {
            components.insert(name.clone(), Self::component_json(status));
        }
        json!({
            "status": self.overall().as_str(),
            "components": components,
        })
    }
}

/// Periodic health prober and publisher.
pub struct HealthMonitor {
    bus: Arc<dyn BusClient>,
    liveness: Option<Arc<dyn ServerLiveness>>,
    config: HealthConfig,
    node_id: String,
    state: Mutex<HealthState>,
    heartbeat_count: AtomicU64,
    interval: Duration,
    error_backoff: Duration,
}

/// Running monitor task plus its stop signal.
pub struct HealthHandle {
    monitor: Arc<HealthMonitor>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthHandle {
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Stop the loop and wait for the final offline publish.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health monitor task failed");
        }
    }
}

impl HealthMonitor {
    pub fn new(
        bus: Arc<dyn BusClient>,
        liveness: Option<Arc<dyn ServerLiveness>>,
        config: HealthConfig,
    ) -> Self {
        let interval = config.interval();
        Self {
            bus,
            liveness,
            config,
            node_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(HealthState::default()),
            heartbeat_count: AtomicU64::new(0),
            interval,
            error_backoff: ERROR_BACKOFF,
        }
    }

    /// Override loop timing (the interval defaults to the configured one).
    pub fn with_timing(mut self, interval: Duration, error_backoff: Duration) -> Self {
        self.interval = interval;
        self.error_backoff = error_backoff;
        self
    }

    // A probe panicking mid-update must not take the whole monitor down
    // with it; a poisoned guard still holds consistent enough state.
    fn state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the health of a named component outside the probed surfaces.
    pub fn set_component(&self, name: &str, health: ComponentHealth, detail: Option<Value>) {
        self.state().set(name, health, detail);
    }

    /// Current overall status.
    pub fn overall(&self) -> ComponentHealth {
        self.state().overall()
    }

    /// Start the background loop.
    pub fn spawn(self) -> HealthHandle {
        let monitor = Arc::new(self);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.clone().run(stop_rx));
        HealthHandle {
            monitor,
            stop_tx,
            task,
        }
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(node = %self.node_id, interval_secs = self.interval.as_secs(), "Health monitor started");
        loop {
            let delay = match self.run_cycle().await {
                Ok(()) => self.interval,
                Err(e) => {
                    warn!(error = %e, "Health cycle failed");
                    {
                        let mut state = self.state();
                        state.set("mqtt", ComponentHealth::Error, None);
                        state.set("dimse", ComponentHealth::Error, None);
                    }
                    if let Err(e) = self.publish_status().await {
                        debug!(error = %e, "Could not publish error status");
                    }
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.publish_offline().await;
        info!("Health monitor stopped");
    }

    /// One probe-and-publish cycle.
    async fn run_cycle(&self) -> Result<(), BusError> {
        let mqtt = self.check_mqtt().await;
        let dimse = self.check_dimse();
        {
            let mut state = self.state();
            state.set("mqtt", mqtt, None);
            state.set("dimse", dimse, None);
        }

        self.publish_status().await?;

        if let Err(e) = self.publish_heartbeat().await {
            warn!(error = %e, "Heartbeat publish failed");
        }
        Ok(())
    }

    /// Trial publish over the live connection.
    async fn check_mqtt(&self) -> ComponentHealth {
        if !self.bus.is_connected() {
            return ComponentHealth::Error;
        }
        let topic = format!("{}/test/{}", self.config.topic_prefix, self.node_id);
        match self
            .bus
            .publish(&topic, Vec::new(), QoS::AtMostOnce, false)
            .await
        {
            Ok(()) => ComponentHealth::Healthy,
            Err(e) => {
                warn!(error = %e, "Health trial publish failed");
                ComponentHealth::Degraded
            }
        }
    }

    fn check_dimse(&self) -> ComponentHealth {
        match &self.liveness {
            Some(liveness) if liveness.is_listening() => ComponentHealth::Healthy,
            Some(_) => ComponentHealth::Error,
            None => ComponentHealth::Unknown,
        }
    }

    async fn publish_status(&self) -> Result<(), BusError> {
        let (composite, mqtt, dimse) = {
            let state = self.state();
            let mut composite = state.to_json();
            composite["timestamp"] = json!(Utc::now().to_rfc3339());
            composite["node_id"] = json!(self.node_id);
            (composite, state.mqtt(), state.dimse())
        };

        let prefix = &self.config.topic_prefix;
        let qos = self.config.status_qos();
        let retain = self.config.retained;

        self.bus
            .publish(
                &format!("{prefix}/status"),
                serde_json::to_vec(&composite).unwrap_or_default(),
                qos,
                retain,
            )
            .await?;
        for (surface, health) in [("mqtt", mqtt), ("dimse", dimse)] {
            let body = json!({
                "status": health.as_str(),
                "timestamp": Utc::now().to_rfc3339(),
                "node_id": self.node_id,
            });
            self.bus
                .publish(
                    &format!("{prefix}/{surface}"),
                    serde_json::to_vec(&body).unwrap_or_default(),
                    qos,
                    retain,
                )
                .await?;
        }
        Ok(())
    }

    async fn publish_heartbeat(&self) -> Result<(), BusError> {
        let count = self.heartbeat_count.fetch_add(1, Ordering::SeqCst) + 1;
        let body = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "count": count,
            "node_id": self.node_id,
        });
        self.bus
            .publish(
                &format!("{}/heartbeat", self.config.topic_prefix),
                serde_json::to_vec(&body).unwrap_or_default(),
                QoS::AtMostOnce,
                false,
            )
            .await
    }

    /// Final retained status, published on shutdown.
    async fn publish_offline(&self) {
        let body = json!({
            "status": "offline",
            "node_id": self.node_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .bus
            .publish(
                &format!("{}/status", self.config.topic_prefix),
                serde_json::to_vec(&body).unwrap_or_default(),
                self.config.status_qos(),
                true,
            )
            .await
        {
            warn!(error = %e, "Could not publish offline status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;

    struct Listening(bool);

    impl ServerLiveness for Listening {
        fn is_listening(&self) -> bool {
            self.0
        }
    }

    fn state_with(
        mqtt: ComponentHealth,
        dimse: ComponentHealth,
        extra: Option<ComponentHealth>,
    ) -> HealthState {
        let mut state = HealthState::default();
        state.set("mqtt", mqtt, None);
        state.set("dimse", dimse, None);
        if let Some(health) = extra {
            state.set("database", health, None);
        }
        state
    }

    #[test]
    fn test_overall_precedence() {
        use ComponentHealth::*;
        assert_eq!(state_with(Healthy, Healthy, None).overall(), Healthy);
        assert_eq!(state_with(Healthy, Unknown, None).overall(), Unknown);
        assert_eq!(state_with(Healthy, Degraded, None).overall(), Degraded);
        assert_eq!(state_with(Error, Healthy, None).overall(), Error);
        assert_eq!(state_with(Degraded, Error, None).overall(), Error);
        assert_eq!(state_with(Healthy, Healthy, Some(Degraded)).overall(), Degraded);
        assert_eq!(state_with(Healthy, Healthy, Some(Error)).overall(), Error);
        assert_eq!(state_with(Unknown, Unknown, None).overall(), Unknown);
    }

    #[test]
    fn test_fresh_state_is_unknown() {
        assert_eq!(HealthState::default().overall(), ComponentHealth::Unknown);
    }

    fn monitor(bus: Arc<MockBus>, liveness: Option<Arc<dyn ServerLiveness>>) -> HealthMonitor {
        HealthMonitor::new(bus, liveness, HealthConfig::default())
    }

    #[tokio::test]
    async fn test_cycle_publishes_status_and_heartbeat() {
        let (bus, _rx) = MockBus::new();
        let m = monitor(bus.clone(), Some(Arc::new(Listening(true))));

        m.run_cycle().await.unwrap();

        let status = bus.published_to("health/dicom_broker/status");
        assert_eq!(status.len(), 1);
        assert!(status[0].retain);
        assert_eq!(status[0].qos, QoS::AtLeastOnce);
        let body: Value = serde_json::from_slice(&status[0].payload).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["mqtt"]["status"], "healthy");
        assert_eq!(body["components"]["dimse"]["status"], "healthy");
        assert!(body["components"]["mqtt"]["last_check"].is_string());
        assert!(body["node_id"].is_string());
        assert!(body["timestamp"].is_string());

        for surface in ["mqtt", "dimse"] {
            let published = bus.published_to(&format!("health/dicom_broker/{surface}"));
            assert_eq!(published.len(), 1);
            let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
            assert_eq!(body["status"], "healthy");
            assert!(body["node_id"].is_string());
            assert!(body["timestamp"].is_string());
        }

        let heartbeat = bus.published_to("health/dicom_broker/heartbeat");
        assert_eq!(heartbeat.len(), 1);
        assert!(!heartbeat[0].retain);
        assert_eq!(heartbeat[0].qos, QoS::AtMostOnce);
        let beat: Value = serde_json::from_slice(&heartbeat[0].payload).unwrap();
        assert_eq!(beat["count"], 1);
    }

    #[tokio::test]
    async fn test_trial_publish_failure_degrades_mqtt() {
        let (bus, _rx) = MockBus::new();
        bus.set_fail_publish_prefix(Some("health/dicom_broker/test"));
        let m = monitor(bus.clone(), None);

        m.run_cycle().await.unwrap();

        let status = bus.published_to("health/dicom_broker/status");
        let body: Value = serde_json::from_slice(&status[0].payload).unwrap();
        assert_eq!(body["components"]["mqtt"]["status"], "degraded");
        assert_eq!(body["components"]["dimse"]["status"], "unknown");
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_server_not_listening_is_error() {
        let (bus, _rx) = MockBus::new();
        let m = monitor(bus.clone(), Some(Arc::new(Listening(false))));

        m.run_cycle().await.unwrap();

        let status = bus.published_to("health/dicom_broker/status");
        let body: Value = serde_json::from_slice(&status[0].payload).unwrap();
        assert_eq!(body["components"]["dimse"]["status"], "error");
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_cycle_failure_keeps_loop_alive() {
        let (bus, _rx) = MockBus::new();
        bus.set_connected(false);
        let handle = monitor(bus.clone(), None)
            .with_timing(Duration::from_millis(10), Duration::from_millis(10))
            .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.monitor().overall(), ComponentHealth::Error);

        // Once the connection recovers, the next cycle publishes again.
        bus.set_connected(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bus.published_to("health/dicom_broker/status").is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_publishes_offline() {
        let (bus, _rx) = MockBus::new();
        let handle = monitor(bus.clone(), Some(Arc::new(Listening(true))))
            .with_timing(Duration::from_secs(60), Duration::from_secs(60))
            .spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;

        let status = bus.published_to("health/dicom_broker/status");
        let last = status.last().unwrap();
        assert!(last.retain);
        let body: Value = serde_json::from_slice(&last.payload).unwrap();
        assert_eq!(body["status"], "offline");
    }

    #[tokio::test]
    async fn test_named_component_feeds_overall() {
        let (bus, _rx) = MockBus::new();
        let m = monitor(bus, Some(Arc::new(Listening(true))));
        m.run_cycle().await.unwrap();
        assert_eq!(m.overall(), ComponentHealth::Healthy);

        m.set_component("registry", ComponentHealth::Error, Some(json!({"path": "x"})));
        assert_eq!(m.overall(), ComponentHealth::Error);
    }

    #[tokio::test]
    async fn test_named_component_appears_in_composite() {
        let (bus, _rx) = MockBus::new();
        let m = monitor(bus.clone(), Some(Arc::new(Listening(true))));
        m.set_component("registry", ComponentHealth::Degraded, Some(json!({"path": "x"})));
        m.run_cycle().await.unwrap();

        let status = bus.published_to("health/dicom_broker/status");
        let body: Value = serde_json::from_slice(&status[0].payload).unwrap();
        assert_eq!(body["components"]["registry"]["status"], "degraded");
        assert_eq!(body["components"]["registry"]["detail"]["path"], "x");
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_state_survives_a_panicked_holder() {
        let (bus, _rx) = MockBus::new();
        let m = monitor(bus, None);

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = m.state.lock().unwrap();
            panic!("probe blew up");
        }));

        m.set_component("registry", ComponentHealth::Error, None);
        assert_eq!(m.overall(), ComponentHealth::Error);
    }
}
