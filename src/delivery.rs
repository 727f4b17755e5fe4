//! Outbound delivery of UPS events to subscriber peers.

use std::sync::Arc;

use tracing::{info, warn};

use crate::dataset::UpsEventDataset;
use crate::dimse::{
    UpsEventScu, STATUS_PROCESSING_FAILURE, STATUS_RECEIVING_AE_UNKNOWN, STATUS_SUCCESS,
};
use crate::registry::SharedRegistry;

/// Sends event reports to destination AEs over fresh associations.
///
/// Routing failures (unknown destination) and transport failures
/// (association rejected, aborted, timed out) come back as DIMSE status
/// codes, never as errors: one undeliverable event must not disturb the
/// owning worker.
pub struct EventReporter {
    registry: Arc<SharedRegistry>,
    scu: Arc<dyn UpsEventScu>,
    calling_ae_title: String,
}

impl EventReporter {
    pub fn new(
        registry: Arc<SharedRegistry>,
        scu: Arc<dyn UpsEventScu>,
        calling_ae_title: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            scu,
            calling_ae_title: calling_ae_title.into(),
        }
    }

    /// Resolve the destination, send the event, return the peer status.
    pub async fn send_event_report(
        &self,
        event: &UpsEventDataset,
        destination_title: &str,
    ) -> u16 {
        let address = match self.registry.lookup_or_reload(destination_title).await {
            Some(address) => address,
            None => {
                warn!(
                    destination = %destination_title,
                    "AE not found in application entity registry"
                );
                return STATUS_RECEIVING_AE_UNKNOWN;
            }
        };

        match self
            .scu
            .send_event_report(&address, &self.calling_ae_title, destination_title, event)
            .await
        {
            Ok(status) => {
                if status == STATUS_SUCCESS {
                    info!(
                        destination = %destination_title,
                        "N-EVENT-REPORT delivered"
                    );
                } else {
                    warn!(
                        destination = %destination_title,
                        status,
                        "N-EVENT-REPORT answered with non-success status"
                    );
                }
                status
            }
            Err(e) => {
                warn!(
                    destination = %destination_title,
                    error = %e,
                    "Failed to deliver N-EVENT-REPORT"
                );
                STATUS_PROCESSING_FAILURE
            }
        }
    }
}
