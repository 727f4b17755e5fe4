//! UPS event dataset carried as the event body.
//!
//! The attributes the adapter inspects are typed; everything else rides in
//! an opaque extension map so peer-supplied attributes survive the trip
//! through the bus unchanged. The JSON wire form uses DICOM keyword names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event dataset for UPS N-EVENT-REPORT, serialized as the bus payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsEventDataset {
    /// Event type id: 1 = state report, 2 = cancel request.
    #[serde(rename = "EventTypeID", skip_serializing_if = "Option::is_none")]
    pub event_type_id: Option<u16>,

    /// SOP class of the affected workitem (UPS Push).
    #[serde(
        rename = "AffectedSOPClassUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub affected_sop_class_uid: Option<String>,

    /// The workitem identifier.
    #[serde(
        rename = "AffectedSOPInstanceUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub affected_sop_instance_uid: Option<String>,

    /// Some peers carry the workitem identifier here instead; when present
    /// it takes precedence over the request-level affected instance UID.
    #[serde(rename = "SOPInstanceUID", skip_serializing_if = "Option::is_none")]
    pub sop_instance_uid: Option<String>,

    /// Unrecognized attributes, forwarded verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
