//! DIMSE-side contract: UPS UIDs, status codes and request/response
//! primitives.
//!
//! The association transport itself is an external collaborator. Inbound
//! requests reach the adapter as the explicit primitive structs below, and
//! outbound event delivery goes through the [`scu::UpsEventScu`] seam, so
//! any DIMSE stack can be wired against this crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod scu;

pub use scu::{DeliveredEvent, LoopbackScu, UpsEventScu};

// ============================================================================
// Well-known UIDs
// ============================================================================

/// Unified Procedure Step Push SOP class.
pub const UPS_PUSH_SOP_CLASS_UID: &str = "1.2.840.10008.5.1.4.34.6.1";

/// Well-known instance UID addressed by global subscription requests.
pub const UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID: &str = "1.2.840.10008.5.1.4.34.5";

/// Well-known instance UID addressed by filtered global subscription
/// requests.
pub const UPS_FILTERED_GLOBAL_SUBSCRIPTION_INSTANCE_UID: &str = "1.2.840.10008.5.1.4.34.5.1";

/// True for the two well-known global subscription instance UIDs.
pub fn is_global_subscription_uid(uid: &str) -> bool {
    uid == UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID
        || uid == UPS_FILTERED_GLOBAL_SUBSCRIPTION_INSTANCE_UID
}

// ============================================================================
// Action type ids (UPS Watch N-ACTION)
// ============================================================================

/// Subscribe to receive UPS event reports.
pub const ACTION_SUBSCRIBE: u16 = 3;
/// Unsubscribe from receiving UPS event reports.
pub const ACTION_UNSUBSCRIBE: u16 = 4;
/// Suspend global subscription.
pub const ACTION_SUSPEND_GLOBAL: u16 = 5;

// ============================================================================
// Status codes
// ============================================================================

/// Success.
pub const STATUS_SUCCESS: u16 = 0x0000;
/// Processing failure.
pub const STATUS_PROCESSING_FAILURE: u16 = 0x0110;
/// No such event type.
pub const STATUS_NO_SUCH_EVENT_TYPE: u16 = 0x0113;
/// Failed: unrecognized action type (UPS CC.2.3-3).
pub const STATUS_UNRECOGNIZED_ACTION_TYPE: u16 = 0xC304;
/// Failed: receiving AE title is not recognized (UPS CC.2.3-3).
pub const STATUS_RECEIVING_AE_UNKNOWN: u16 = 0xC308;

// ============================================================================
// Request/response primitives
// ============================================================================

/// Peer identity of the association an inbound request arrived on.
#[derive(Debug, Clone)]
pub struct AssociationContext {
    /// Calling AE title of the requesting peer.
    pub calling_ae_title: String,
    /// Peer network address.
    pub address: String,
    /// Peer port.
    pub port: u16,
}

/// Action information dataset of an N-ACTION subscribe/unsubscribe request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionInfo {
    /// AE title that should receive forwarded event reports.
    #[serde(rename = "ReceivingAE", skip_serializing_if = "Option::is_none")]
    pub receiving_ae: Option<String>,

    /// Deletion lock flag, "TRUE" or "FALSE". Carried but not used by the
    /// broker.
    #[serde(rename = "DeletionLock", skip_serializing_if = "Option::is_none")]
    pub deletion_lock: Option<String>,

    /// Filter attributes and anything else the peer sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActionInfo {
    pub fn deletion_lock_requested(&self) -> bool {
        self.deletion_lock.as_deref() == Some("TRUE")
    }
}

/// Inbound N-ACTION request primitive.
#[derive(Debug, Clone)]
pub struct NActionRequest {
    /// Action type id, see [`ACTION_SUBSCRIBE`] and friends.
    pub action_type_id: u16,
    /// Target of the action: a workitem UID or one of the well-known
    /// global subscription instance UIDs.
    pub requested_sop_instance_uid: String,
    /// Decoded action information dataset, if the peer sent one.
    pub action_information: Option<ActionInfo>,
}

/// N-ACTION response: final status plus an optional response dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct NActionResponse {
    pub status: u16,
    pub body: Option<ResponseSet>,
}

impl NActionResponse {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS,
            body: Some(ResponseSet::success()),
        }
    }

    pub fn failure_with_comment(status: u16, comment: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(ResponseSet::error(status, comment)),
        }
    }
}

/// Response dataset mirrored back to the peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSet {
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(rename = "ErrorComment", skip_serializing_if = "Option::is_none")]
    pub error_comment: Option<String>,
}

impl ResponseSet {
    pub fn success() -> Self {
        Self {
            status: Some(STATUS_SUCCESS),
            error_comment: None,
        }
    }

    pub fn error(status: u16, comment: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error_comment: Some(comment.into()),
        }
    }
}

/// Inbound N-EVENT-REPORT request primitive.
#[derive(Debug, Clone)]
pub struct NEventRequest {
    /// Event type id: 1 = state report, 2 = cancel request.
    pub event_type_id: u16,
    /// Affected SOP class of the request.
    pub affected_sop_class_uid: String,
    /// Affected SOP instance (workitem) UID of the request.
    pub affected_sop_instance_uid: String,
    /// Decoded event information dataset, if present.
    pub event_information: Option<crate::dataset::UpsEventDataset>,
}

/// N-EVENT-REPORT response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NEventResponse {
    pub status: u16,
}

// ============================================================================
// Errors and seams
// ============================================================================

/// Errors from the DIMSE transport seam.
#[derive(Debug, thiserror::Error)]
pub enum DimseError {
    #[error("Association with '{peer}' rejected, aborted or never connected: {reason}")]
    Association { peer: String, reason: String },

    #[error("Failed to send event report: {0}")]
    Send(String),
}

/// Externally observable liveness signal of the DIMSE server surface.
///
/// The health aggregator treats a missing probe as status `unknown`.
pub trait ServerLiveness: Send + Sync {
    fn is_listening(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_subscription_uids() {
        assert!(is_global_subscription_uid(
            UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID
        ));
        assert!(is_global_subscription_uid(
            UPS_FILTERED_GLOBAL_SUBSCRIPTION_INSTANCE_UID
        ));
        assert!(!is_global_subscription_uid("1.2.3.4"));
    }

    #[test]
    fn test_response_set_wire_form() {
        let body = ResponseSet::error(STATUS_UNRECOGNIZED_ACTION_TYPE, "Unrecognized action");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Status"], 0xC304);
        assert_eq!(json["ErrorComment"], "Unrecognized action");
    }

    #[test]
    fn test_action_info_deletion_lock() {
        let info: ActionInfo = serde_json::from_value(serde_json::json!({
            "ReceivingAE": "NEVENT_RECEIVER",
            "DeletionLock": "TRUE"
        }))
        .unwrap();
        assert!(info.deletion_lock_requested());
        assert_eq!(info.receiving_ae.as_deref(), Some("NEVENT_RECEIVER"));
    }
}
