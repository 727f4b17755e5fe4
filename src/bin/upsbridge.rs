//! UPS event broker adapter binary.
//!
//! Bridges DIMSE UPS workitem events onto an MQTT broker and back. The
//! association listener that frames inbound DIMSE requests is wired
//! externally against [`UpsService`]; this binary runs the shared broker
//! connection, the subscriber workers, the health loop and a small stdin
//! console for driving the handlers interactively.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use upsbridge::bus::{BusConnector, BusError, MqttConnector};
use upsbridge::config::Config;
use upsbridge::delivery::EventReporter;
use upsbridge::dimse::{
    AssociationContext, LoopbackScu, NActionRequest, NEventRequest, ACTION_SUBSCRIBE,
    ACTION_UNSUBSCRIBE, UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID, UPS_PUSH_SOP_CLASS_UID,
};
use upsbridge::health::HealthMonitor;
use upsbridge::registry::SharedRegistry;
use upsbridge::router::Router;
use upsbridge::service::UpsService;
use upsbridge::topic::TopicCodec;
use upsbridge::utils::bootstrap::init_tracing;
use upsbridge::utils::retry::connection_backoff;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        ae_title = %config.server.ae_title,
        "Starting upsbridge"
    );

    let registry = Arc::new(SharedRegistry::load(&config.registry.path)?);
    info!(path = %config.registry.path, "Application entity registry loaded");

    let connector = Arc::new(
        MqttConnector::new(&config.broker.host, config.broker.port)
            .with_keep_alive(config.broker.keep_alive()),
    );

    // Shared outbound connection for the protocol handlers and the health
    // loop. Subscriber workers open their own connections on demand.
    let client_id = config.server.ae_title.clone();
    let (bus, _inbound) = {
        let connector = connector.clone();
        (move || {
            let connector = connector.clone();
            let client_id = client_id.clone();
            async move { connector.connect(&client_id).await }
        })
        .retry(connection_backoff())
        .notify(|err: &BusError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Broker connection failed, retrying");
        })
        .await?
    };
    info!("Connected to broker");

    // Without an external SCU wired in, delivered events are logged.
    let (scu, mut delivered) = LoopbackScu::new();
    tokio::spawn(async move {
        while let Some(event) = delivered.recv().await {
            info!(
                destination = %event.called_ae_title,
                address = %format!("{}:{}", event.target.host, event.target.port),
                workitem = event.event.affected_sop_instance_uid.as_deref().unwrap_or("?"),
                "Event report ready for delivery"
            );
        }
    });

    let codec = TopicCodec::with_prefix(&config.broker.topic_prefix);
    let reporter = Arc::new(EventReporter::new(
        registry.clone(),
        Arc::new(scu),
        config.server.ae_title.clone(),
    ));
    let router = Arc::new(Router::new(
        connector.clone() as Arc<dyn BusConnector>,
        reporter,
        codec.clone(),
    ));
    let service = UpsService::new(registry, router.clone(), bus.clone(), codec);

    let health = if config.health.enabled {
        Some(HealthMonitor::new(bus.clone(), None, config.health.clone()).spawn())
    } else {
        None
    };

    run_console(&service, &config.server.ae_title).await;

    info!("Shutting down");
    if let Some(health) = health {
        health.shutdown().await;
    }
    router.shutdown().await;
    if let Err(e) = bus.disconnect().await {
        warn!(error = %e, "Broker disconnect failed");
    }
    Ok(())
}

/// Interactive console: drives the protocol handlers from stdin until EOF,
/// `quit` or ctrl-c.
async fn run_console(service: &UpsService, ae_title: &str) {
    let ctx = AssociationContext {
        calling_ae_title: ae_title.to_string(),
        address: "127.0.0.1".to_string(),
        port: 0,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("commands: subscribe <AE> [uid] | unsubscribe <AE> [uid] | event <uid> <1|2> | echo | quit");
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["subscribe", title, rest @ ..] | ["unsubscribe", title, rest @ ..] => {
                let action = if parts[0] == "subscribe" {
                    ACTION_SUBSCRIBE
                } else {
                    ACTION_UNSUBSCRIBE
                };
                let uid = rest
                    .first()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| UPS_GLOBAL_SUBSCRIPTION_INSTANCE_UID.to_string());
                let request = NActionRequest {
                    action_type_id: action,
                    requested_sop_instance_uid: uid,
                    action_information: Some(upsbridge::dimse::ActionInfo {
                        receiving_ae: Some(title.to_string()),
                        ..Default::default()
                    }),
                };
                let response = service.handle_n_action(&ctx, &request).await;
                println!("status: 0x{:04X}", response.status);
            }
            ["event", uid, event_type] => match event_type.parse::<u16>() {
                Ok(event_type) => {
                    let request = NEventRequest {
                        event_type_id: event_type,
                        affected_sop_class_uid: UPS_PUSH_SOP_CLASS_UID.to_string(),
                        affected_sop_instance_uid: uid.to_string(),
                        event_information: None,
                    };
                    let response = service.handle_n_event(&ctx, &request).await;
                    println!("status: 0x{:04X}", response.status);
                }
                Err(_) => println!("event type must be a number"),
            },
            ["echo"] => {
                println!("status: 0x{:04X}", service.handle_echo(&ctx));
            }
            ["quit"] | ["exit"] => break,
            [] => {}
            other => println!("unknown command: {other:?}"),
        }
    }
}
