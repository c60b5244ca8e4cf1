use color_eyre::{eyre::eyre, Result};
use openerbridge::bridge::{BridgeHandle, BridgeOptions};
use openerbridge::config::BridgeConfig;
use openerbridge::gateway::BridgeEvent;
use openerbridge::mqtt::{ConnectionState, MqttHandler, MqttStatus};
use openerbridge::persistence::SnapshotStore;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = BridgeConfig::config_path();
    BridgeConfig::ensure_default_config(&config_path).await?;
    let config = BridgeConfig::load(&config_path).await?;
    setup_logging_env(config.log_level());

    info!("Using config {}", config_path.display());
    if config.gateways.is_empty() {
        warn!("No gateways configured, add [[gateways]] entries to {}", config_path.display());
    }

    let options = BridgeOptions::new(
        config.gateway_settings(),
        SnapshotStore::new(&config.storage_dir),
    )
    .with_sweep_interval(config.sweep_interval());
    let (bridge, outbound_rx) = BridgeHandle::new(options);

    for gateway in &config.gateways {
        bridge
            .add_gateway(&gateway.sn, gateway.name.clone())
            .await
            .map_err(|e| eyre!("Failed to start gateway {}: {}", gateway.sn, e))?;
    }

    let shutdown = CancellationToken::new();
    let (mqtt_handler, status_rx) = MqttHandler::new(config.mqtt.clone(), bridge.router(), outbound_rx);
    let mqtt_task = tokio::spawn(mqtt_handler.run(shutdown.clone()));
    let events_task = tokio::spawn(log_events(bridge.subscribe(), shutdown.clone()));
    let status_task = tokio::spawn(log_connection(status_rx, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
    info!("Ctrl-C received, shutting down");

    if let Err(e) = bridge.shutdown().await {
        error!("Bridge shutdown incomplete: {}", e);
    }
    shutdown.cancel();

    let status = mqtt_task
        .await
        .map_err(|e| eyre!("MQTT task panicked: {}", e))?;
    info!(
        "MQTT handler stopped: {} received, {} sent, {} undecodable",
        status.messages_received, status.messages_sent, status.decode_failures
    );
    let _ = events_task.await;
    let _ = status_task.await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn log_events(mut events: broadcast::Receiver<BridgeEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(BridgeEvent::DeviceAdded { gateway_sn, device_id, name, .. }) => {
                    info!("{}: {} paired as {}", gateway_sn, device_id, name);
                }
                Ok(BridgeEvent::GatewayOffline { gateway_sn, reason }) => {
                    warn!("{} offline ({:?})", gateway_sn, reason);
                }
                Ok(event) => debug!("{:?}", event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn log_connection(mut status: watch::Receiver<MqttStatus>, shutdown: CancellationToken) {
    let mut last = status.borrow().connection_state;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.connection_state == last {
                    continue;
                }
                match current.connection_state {
                    ConnectionState::Connected => info!("MQTT connected"),
                    ConnectionState::Reconnecting | ConnectionState::Failed => warn!(
                        "MQTT {:?}: {}",
                        current.connection_state,
                        current.error_messages.last().map(String::as_str).unwrap_or("no error recorded")
                    ),
                    state => debug!("MQTT {:?}", state),
                }
                last = current.connection_state;
            }
        }
    }
}
