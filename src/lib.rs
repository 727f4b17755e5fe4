//! upsbridge - DICOM UPS event to MQTT broker adapter
//!
//! Bridges the DIMSE request/response surface for Unified Procedure Step
//! workitem events (N-ACTION subscribe/unsubscribe, N-EVENT-REPORT, C-ECHO)
//! with an MQTT publish/subscribe transport. DIMSE peers subscribe to
//! workitem events carried over the bus, and inbound event reports are
//! republished onto the bus, without either side knowing about the other.
//!
//! The wire-level DIMSE association transport is an external collaborator:
//! inbound requests arrive as explicit primitive structs handled by
//! [`service::UpsService`], and outbound delivery goes through the
//! [`dimse::scu::UpsEventScu`] seam.

pub mod bus;
pub mod config;
pub mod dataset;
pub mod delivery;
pub mod dimse;
pub mod health;
pub mod registry;
pub mod relay;
pub mod router;
pub mod service;
pub mod topic;
pub mod utils;
