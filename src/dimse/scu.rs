//! Outbound event delivery seam (SCU side).
//!
//! [`UpsEventScu`] is the boundary the real DIMSE stack plugs into: one
//! call covers "establish an association with the UPS Push presentation
//! context, send N-EVENT-REPORT, release". [`LoopbackScu`] is the
//! in-process implementation used by standalone mode and tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DimseError, STATUS_SUCCESS};
use crate::dataset::UpsEventDataset;
use crate::registry::AeAddress;

/// Sends a UPS event report to one peer over a fresh association.
#[async_trait]
pub trait UpsEventScu: Send + Sync {
    /// Establish, send, release. Returns the peer's reported status code.
    async fn send_event_report(
        &self,
        target: &AeAddress,
        calling_ae_title: &str,
        called_ae_title: &str,
        event: &UpsEventDataset,
    ) -> Result<u16, DimseError>;
}

/// An event report as it left the adapter, for in-process consumers.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub target: AeAddress,
    pub event: UpsEventDataset,
}

/// In-process SCU that hands delivered events to a channel instead of the
/// network. Always reports success while the receiving side is alive.
pub struct LoopbackScu {
    tx: mpsc::UnboundedSender<DeliveredEvent>,
}

impl LoopbackScu {
    /// Create the SCU together with the receiving end of the loopback.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeliveredEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl UpsEventScu for LoopbackScu {
    async fn send_event_report(
        &self,
        target: &AeAddress,
        calling_ae_title: &str,
        called_ae_title: &str,
        event: &UpsEventDataset,
    ) -> Result<u16, DimseError> {
        self.tx
            .send(DeliveredEvent {
                calling_ae_title: calling_ae_title.to_string(),
                called_ae_title: called_ae_title.to_string(),
                target: target.clone(),
                event: event.clone(),
            })
            .map_err(|_| DimseError::Association {
                peer: called_ae_title.to_string(),
                reason: "loopback receiver dropped".to_string(),
            })?;
        Ok(STATUS_SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> AeAddress {
        AeAddress {
            host: "127.0.0.1".to_string(),
            port: 11115,
        }
    }

    #[tokio::test]
    async fn test_loopback_delivers_and_reports_success() {
        let (scu, mut rx) = LoopbackScu::new();
        let event = UpsEventDataset {
            event_type_id: Some(1),
            ..Default::default()
        };

        let status = scu
            .send_event_report(&address(), "UPSEventBroker01", "NEVENT_RECEIVER", &event)
            .await
            .unwrap();
        assert_eq!(status, STATUS_SUCCESS);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.called_ae_title, "NEVENT_RECEIVER");
        assert_eq!(delivered.event.event_type_id, Some(1));
    }

    #[tokio::test]
    async fn test_loopback_fails_when_receiver_dropped() {
        let (scu, rx) = LoopbackScu::new();
        drop(rx);
        let err = scu
            .send_event_report(
                &address(),
                "UPSEventBroker01",
                "GONE",
                &UpsEventDataset::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DimseError::Association { .. }));
    }
}
