//! Bus to DIMSE translation path.
//!
//! Invoked by a subscriber worker for every message received on one of its
//! filters. Undecodable topics and malformed payloads are logged and
//! dropped; no delivery guarantee is claimed for malformed input.

use tracing::{debug, warn};

use crate::bus::BusMessage;
use crate::dataset::UpsEventDataset;
use crate::delivery::EventReporter;
use crate::dimse::{is_global_subscription_uid, UPS_PUSH_SOP_CLASS_UID};
use crate::topic::TopicCodec;

/// Translate one bus message into an event report for `owner_title`.
///
/// Returns the delivery status when a delivery was attempted, `None` when
/// the message was dropped.
pub async fn relay_bus_message(
    codec: &TopicCodec,
    reporter: &EventReporter,
    owner_title: &str,
    message: &BusMessage,
) -> Option<u16> {
    let decoded = match codec.decode(&message.topic) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(
                owner = %owner_title,
                segments = ?e.segments(),
                "Dropping message with invalid topic"
            );
            return None;
        }
    };

    // Subscription bookkeeping instances are not deliverable workitems.
    if is_global_subscription_uid(&decoded.uid) {
        debug!(
            owner = %owner_title,
            topic = %message.topic,
            "Ignoring global subscription bookkeeping message"
        );
        return None;
    }

    let mut event: UpsEventDataset = match serde_json::from_slice(&message.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                owner = %owner_title,
                topic = %message.topic,
                error = %e,
                payload = %String::from_utf8_lossy(&message.payload),
                "Dropping message with malformed JSON payload"
            );
            return None;
        }
    };

    if event.event_type_id.is_none() {
        event.event_type_id = Some(decoded.subtopic.event_type_id());
    }
    if event.affected_sop_class_uid.is_none() {
        event.affected_sop_class_uid = Some(UPS_PUSH_SOP_CLASS_UID.to_string());
    }
    if event.affected_sop_instance_uid.is_none() {
        event.affected_sop_instance_uid = Some(decoded.uid.clone());
    }

    let status = reporter.send_event_report(&event, owner_title).await;
    debug!(
        owner = %owner_title,
        workitem = %decoded.uid,
        status,
        "Relayed bus message to DIMSE peer"
    );
    Some(status)
}
