//! Protocol service handlers.
//!
//! One [`UpsService`] instance serves every inbound association. Handlers
//! take explicit request primitives and return explicit status/response
//! pairs; the association transport that frames them on the wire is an
//! external collaborator.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{BusClient, QoS};
use crate::dimse::{
    is_global_subscription_uid, AssociationContext, NActionRequest, NActionResponse,
    NEventRequest, NEventResponse, ACTION_SUBSCRIBE, ACTION_SUSPEND_GLOBAL, ACTION_UNSUBSCRIBE,
    STATUS_NO_SUCH_EVENT_TYPE, STATUS_PROCESSING_FAILURE, STATUS_RECEIVING_AE_UNKNOWN,
    STATUS_SUCCESS, STATUS_UNRECOGNIZED_ACTION_TYPE, UPS_FILTERED_GLOBAL_SUBSCRIPTION_INSTANCE_UID,
    UPS_PUSH_SOP_CLASS_UID,
};
use crate::registry::SharedRegistry;
use crate::router::Router;
use crate::topic::{Subtopic, TopicCodec};

const DEFAULT_PUBLISH_WAIT_ATTEMPTS: u32 = 10;
const DEFAULT_PUBLISH_WAIT_DELAY: Duration = Duration::from_millis(500);

/// DIMSE-facing service: C-ECHO, N-ACTION and N-EVENT-REPORT handling.
pub struct UpsService {
    registry: Arc<SharedRegistry>,
    router: Arc<Router>,
    bus: Arc<dyn BusClient>,
    codec: TopicCodec,
    publish_wait_attempts: u32,
    publish_wait_delay: Duration,
}

impl UpsService {
    pub fn new(
        registry: Arc<SharedRegistry>,
        router: Arc<Router>,
        bus: Arc<dyn BusClient>,
        codec: TopicCodec,
    ) -> Self {
        Self {
            registry,
            router,
            bus,
            codec,
            publish_wait_attempts: DEFAULT_PUBLISH_WAIT_ATTEMPTS,
            publish_wait_delay: DEFAULT_PUBLISH_WAIT_DELAY,
        }
    }

    /// Override how long [`handle_n_event`](Self::handle_n_event) waits for
    /// the outbound connection to come back before failing the request.
    pub fn with_publish_wait(mut self, attempts: u32, delay: Duration) -> Self {
        self.publish_wait_attempts = attempts;
        self.publish_wait_delay = delay;
        self
    }

    /// C-ECHO: verification is always answered with success.
    pub fn handle_echo(&self, ctx: &AssociationContext) -> u16 {
        info!(
            calling = %ctx.calling_ae_title,
            address = %ctx.address,
            port = ctx.port,
            "C-ECHO received"
        );
        STATUS_SUCCESS
    }

    /// N-ACTION: subscription management on behalf of the receiving AE.
    pub async fn handle_n_action(
        &self,
        ctx: &AssociationContext,
        request: &NActionRequest,
    ) -> NActionResponse {
        let info = request.action_information.clone().unwrap_or_default();
        // The peer may subscribe a third party; without a ReceivingAE the
        // requester subscribes itself.
        let receiving_ae = info
            .receiving_ae
            .clone()
            .unwrap_or_else(|| ctx.calling_ae_title.clone());

        if self.registry.lookup_or_reload(&receiving_ae).await.is_none() {
            warn!(
                calling = %ctx.calling_ae_title,
                receiving = %receiving_ae,
                "N-ACTION names an unknown receiving AE"
            );
            return NActionResponse::failure_with_comment(
                STATUS_RECEIVING_AE_UNKNOWN,
                format!("Receiving AE '{receiving_ae}' is not recognized"),
            );
        }

        let uid = request.requested_sop_instance_uid.as_str();
        let topic = if is_global_subscription_uid(uid) {
            if uid == UPS_FILTERED_GLOBAL_SUBSCRIPTION_INSTANCE_UID && !info.extra.is_empty() {
                // Filter attributes are accepted but do not narrow the
                // subscription yet.
                debug!(
                    receiving = %receiving_ae,
                    filter = ?info.extra,
                    "Filtered global subscription requested, filter not applied"
                );
            }
            None
        } else {
            Some(self.codec.workitem_scope(uid))
        };

        if info.deletion_lock_requested() {
            debug!(receiving = %receiving_ae, "Deletion lock requested, not honored");
        }

        match request.action_type_id {
            ACTION_SUBSCRIBE => {
                info!(
                    calling = %ctx.calling_ae_title,
                    receiving = %receiving_ae,
                    instance = %uid,
                    "Subscribe"
                );
                self.router
                    .register_subscriber(&receiving_ae, topic.as_deref())
                    .await;
                NActionResponse::success()
            }
            ACTION_UNSUBSCRIBE => {
                info!(
                    calling = %ctx.calling_ae_title,
                    receiving = %receiving_ae,
                    instance = %uid,
                    "Unsubscribe"
                );
                self.router
                    .unregister_subscriber(&receiving_ae, topic.as_deref())
                    .await;
                NActionResponse::success()
            }
            ACTION_SUSPEND_GLOBAL => {
                info!(
                    calling = %ctx.calling_ae_title,
                    receiving = %receiving_ae,
                    "Suspend global subscription"
                );
                self.router.unregister_subscriber(&receiving_ae, None).await;
                NActionResponse::success()
            }
            other => {
                warn!(
                    calling = %ctx.calling_ae_title,
                    action_type = other,
                    "Unrecognized N-ACTION type"
                );
                NActionResponse::failure_with_comment(
                    STATUS_UNRECOGNIZED_ACTION_TYPE,
                    format!("Unrecognized action type: {other}"),
                )
            }
        }
    }

    /// N-EVENT-REPORT: normalize the event and publish it onto the bus.
    pub async fn handle_n_event(
        &self,
        ctx: &AssociationContext,
        request: &NEventRequest,
    ) -> NEventResponse {
        let Some(subtopic) = Subtopic::from_event_type_id(request.event_type_id) else {
            warn!(
                calling = %ctx.calling_ae_title,
                event_type = request.event_type_id,
                "Rejecting N-EVENT-REPORT with unsupported event type"
            );
            return NEventResponse {
                status: STATUS_NO_SUCH_EVENT_TYPE,
            };
        };

        let mut event = request.event_information.clone().unwrap_or_default();
        let uid = event
            .sop_instance_uid
            .clone()
            .unwrap_or_else(|| request.affected_sop_instance_uid.clone());

        event.event_type_id = Some(request.event_type_id);
        event.affected_sop_class_uid = Some(UPS_PUSH_SOP_CLASS_UID.to_string());
        event.affected_sop_instance_uid = Some(uid.clone());

        let topic = self.codec.workitem(&uid, subtopic);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(workitem = %uid, error = %e, "Failed to encode event payload");
                return NEventResponse {
                    status: STATUS_PROCESSING_FAILURE,
                };
            }
        };

        if !self.await_bus_connected().await {
            warn!(
                workitem = %uid,
                "Bus connection still down, failing N-EVENT-REPORT"
            );
            return NEventResponse {
                status: STATUS_PROCESSING_FAILURE,
            };
        }

        match self
            .bus
            .publish(&topic, payload, QoS::AtLeastOnce, false)
            .await
        {
            Ok(()) => {
                info!(
                    calling = %ctx.calling_ae_title,
                    workitem = %uid,
                    topic = %topic,
                    "Event published"
                );
                NEventResponse {
                    status: STATUS_SUCCESS,
                }
            }
            Err(e) => {
                warn!(workitem = %uid, topic = %topic, error = %e, "Publish failed");
                NEventResponse {
                    status: STATUS_PROCESSING_FAILURE,
                }
            }
        }
    }

    /// Wait a bounded number of polls for the outbound connection.
    async fn await_bus_connected(&self) -> bool {
        for attempt in 0..self.publish_wait_attempts {
            if self.bus.is_connected() {
                return true;
            }
            debug!(attempt, "Waiting for bus connection");
            tokio::time::sleep(self.publish_wait_delay).await;
        }
        self.bus.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBus, MockConnector};
    use crate::dataset::UpsEventDataset;
    use crate::delivery::EventReporter;
    use crate::dimse::{
        ActionInfo, LoopbackScu, ResponseSet, UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID,
    };
    use std::io::Write;

    struct Fixture {
        service: UpsService,
        router: Arc<Router>,
        connector: Arc<MockConnector>,
        bus: Arc<MockBus>,
        _file: tempfile::NamedTempFile,
    }

    fn fixture() -> Fixture {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[
                {"AETitle": "WATCHER", "IPAddr": "127.0.0.1", "Port": 11115},
                {"AETitle": "PROXY", "IPAddr": "127.0.0.1", "Port": 11116}
            ]"#,
        )
        .unwrap();
        file.flush().unwrap();
        let registry = Arc::new(SharedRegistry::load(file.path()).unwrap());

        let (scu, _delivered) = LoopbackScu::new();
        let reporter = Arc::new(EventReporter::new(
            registry.clone(),
            Arc::new(scu),
            "UPSEventBroker01",
        ));
        let connector = Arc::new(MockConnector::new());
        let router = Arc::new(Router::new(
            connector.clone(),
            reporter,
            TopicCodec::default(),
        ));

        let (bus, _rx) = MockBus::new();
        let service = UpsService::new(registry, router.clone(), bus.clone(), TopicCodec::default())
            .with_publish_wait(2, Duration::from_millis(1));

        Fixture {
            service,
            router,
            connector,
            bus,
            _file: file,
        }
    }

    fn ctx(calling: &str) -> AssociationContext {
        AssociationContext {
            calling_ae_title: calling.to_string(),
            address: "127.0.0.1".to_string(),
            port: 54321,
        }
    }

    fn subscribe_request(uid: &str, receiving: Option<&str>) -> NActionRequest {
        NActionRequest {
            action_type_id: ACTION_SUBSCRIBE,
            requested_sop_instance_uid: uid.to_string(),
            action_information: receiving.map(|r| ActionInfo {
                receiving_ae: Some(r.to_string()),
                ..Default::default()
            }),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_echo_always_succeeds() {
        let fx = fixture();
        assert_eq!(fx.service.handle_echo(&ctx("ANY_AE")), STATUS_SUCCESS);
    }

    #[tokio::test]
    async fn test_global_subscribe_uses_default_filter() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_action(
                &ctx("WATCHER"),
                &subscribe_request(UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID, None),
            )
            .await;

        assert_eq!(response.status, STATUS_SUCCESS);
        assert_eq!(response.body, Some(ResponseSet::success()));
        assert!(fx.router.is_active("WATCHER").await);

        let connector = fx.connector.clone();
        wait_until(move || {
            connector
                .bus("WATCHER")
                .map(|b| b.subscriptions() == vec!["/workitems/#".to_string()])
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_workitem_subscribe_scopes_filter() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_action(&ctx("WATCHER"), &subscribe_request("1.2.3.4", None))
            .await;
        assert_eq!(response.status, STATUS_SUCCESS);

        let connector = fx.connector.clone();
        wait_until(move || {
            connector
                .bus("WATCHER")
                .map(|b| b.subscriptions() == vec!["/workitems/1.2.3.4/#".to_string()])
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_receiving_ae_overrides_requester() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_action(
                &ctx("PROXY"),
                &subscribe_request(UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID, Some("WATCHER")),
            )
            .await;
        assert_eq!(response.status, STATUS_SUCCESS);
        assert!(fx.router.is_active("WATCHER").await);
        assert!(!fx.router.is_active("PROXY").await);
    }

    #[tokio::test]
    async fn test_unknown_receiving_ae_is_rejected() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_action(
                &ctx("GHOST"),
                &subscribe_request(UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID, None),
            )
            .await;

        assert_eq!(response.status, STATUS_RECEIVING_AE_UNKNOWN);
        let body = response.body.unwrap();
        assert!(body.error_comment.unwrap().contains("GHOST"));
        assert!(!fx.router.is_active("GHOST").await);
    }

    #[tokio::test]
    async fn test_unrecognized_action_type() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_action(
                &ctx("WATCHER"),
                &NActionRequest {
                    action_type_id: 99,
                    requested_sop_instance_uid: "1.2.3.4".to_string(),
                    action_information: None,
                },
            )
            .await;

        assert_eq!(response.status, STATUS_UNRECOGNIZED_ACTION_TYPE);
        assert!(response
            .body
            .unwrap()
            .error_comment
            .unwrap()
            .contains("99"));
        assert!(!fx.router.is_active("WATCHER").await);
    }

    #[tokio::test]
    async fn test_suspend_global_unsubscribes_default_filter() {
        let fx = fixture();
        fx.service
            .handle_n_action(
                &ctx("WATCHER"),
                &subscribe_request(UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID, None),
            )
            .await;
        let response = fx
            .service
            .handle_n_action(
                &ctx("WATCHER"),
                &NActionRequest {
                    action_type_id: ACTION_SUSPEND_GLOBAL,
                    requested_sop_instance_uid: UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID.to_string(),
                    action_information: None,
                },
            )
            .await;
        assert_eq!(response.status, STATUS_SUCCESS);

        let connector = fx.connector.clone();
        wait_until(move || {
            connector
                .bus("WATCHER")
                .map(|b| b.unsubscriptions() == vec!["/workitems/#".to_string()])
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_state_event_is_published() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_event(
                &ctx("MODALITY"),
                &NEventRequest {
                    event_type_id: 1,
                    affected_sop_class_uid: UPS_PUSH_SOP_CLASS_UID.to_string(),
                    affected_sop_instance_uid: "1.2.3.4".to_string(),
                    event_information: None,
                },
            )
            .await;
        assert_eq!(response.status, STATUS_SUCCESS);

        let published = fx.bus.published_to("/workitems/1.2.3.4/state");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert!(!published[0].retain);

        let event: UpsEventDataset = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(event.event_type_id, Some(1));
        assert_eq!(
            event.affected_sop_class_uid.as_deref(),
            Some(UPS_PUSH_SOP_CLASS_UID)
        );
        assert_eq!(event.affected_sop_instance_uid.as_deref(), Some("1.2.3.4"));
    }

    #[tokio::test]
    async fn test_cancel_request_topic() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_event(
                &ctx("MODALITY"),
                &NEventRequest {
                    event_type_id: 2,
                    affected_sop_class_uid: UPS_PUSH_SOP_CLASS_UID.to_string(),
                    affected_sop_instance_uid: "1.2.3.4".to_string(),
                    event_information: None,
                },
            )
            .await;
        assert_eq!(response.status, STATUS_SUCCESS);
        assert_eq!(
            fx.bus.published_to("/workitems/1.2.3.4/cancelrequest").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_dataset_instance_uid_takes_precedence() {
        let fx = fixture();
        fx.service
            .handle_n_event(
                &ctx("MODALITY"),
                &NEventRequest {
                    event_type_id: 1,
                    affected_sop_class_uid: UPS_PUSH_SOP_CLASS_UID.to_string(),
                    affected_sop_instance_uid: "1.2.3.4".to_string(),
                    event_information: Some(UpsEventDataset {
                        sop_instance_uid: Some("9.9.9".to_string()),
                        ..Default::default()
                    }),
                },
            )
            .await;

        let published = fx.bus.published_to("/workitems/9.9.9/state");
        assert_eq!(published.len(), 1);
        let event: UpsEventDataset = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(event.affected_sop_instance_uid.as_deref(), Some("9.9.9"));
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_rejected_without_publish() {
        let fx = fixture();
        let response = fx
            .service
            .handle_n_event(
                &ctx("MODALITY"),
                &NEventRequest {
                    event_type_id: 7,
                    affected_sop_class_uid: UPS_PUSH_SOP_CLASS_UID.to_string(),
                    affected_sop_instance_uid: "1.2.3.4".to_string(),
                    event_information: None,
                },
            )
            .await;
        assert_eq!(response.status, STATUS_NO_SUCH_EVENT_TYPE);
        assert!(fx.bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_bus_down_fails_after_bounded_wait() {
        let fx = fixture();
        fx.bus.set_connected(false);
        let response = fx
            .service
            .handle_n_event(
                &ctx("MODALITY"),
                &NEventRequest {
                    event_type_id: 1,
                    affected_sop_class_uid: UPS_PUSH_SOP_CLASS_UID.to_string(),
                    affected_sop_instance_uid: "1.2.3.4".to_string(),
                    event_information: None,
                },
            )
            .await;
        assert_eq!(response.status, STATUS_PROCESSING_FAILURE);
        assert!(fx.bus.published().is_empty());
    }
}
