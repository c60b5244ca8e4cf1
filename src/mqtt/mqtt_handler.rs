use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::MqttMessage;
use crate::gateway::{GatewayRouter, WorkerMessage};
use crate::protocol::{decode, REPORT_TOPIC};

const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub decode_failures: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Transport adapter between the broker and the gateway workers.
///
/// Inbound publishes on the report topic are decoded and routed by gateway
/// serial. Outbound messages come from the workers through one channel.
pub struct MqttHandler {
    status: MqttStatus,
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    router: GatewayRouter,
    outbound: mpsc::Receiver<MqttMessage>,
    status_tx: watch::Sender<MqttStatus>,
}

impl MqttHandler {
    pub fn new(
        config: MqttConfig,
        router: GatewayRouter,
        outbound: mpsc::Receiver<MqttMessage>,
    ) -> (Self, watch::Receiver<MqttStatus>) {
        let mut mqtt_options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(user) = &config.user {
            mqtt_options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, config.capacity.max(1));
        let status = MqttStatus {
            connection_state: ConnectionState::Connecting,
            ..Default::default()
        };
        let (status_tx, status_rx) = watch::channel(status.clone());

        (
            MqttHandler {
                status,
                client,
                eventloop,
                config,
                router,
                outbound,
                status_tx,
            },
            status_rx,
        )
    }

    /// Drives the connection until `shutdown` fires. Returns the final status.
    pub async fn run(mut self, shutdown: CancellationToken) -> MqttStatus {
        info!(
            "Connecting to MQTT broker {}:{}",
            self.config.host, self.config.port
        );
        let mut outbound_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("MQTT handler shutting down");
                    if let Err(e) = self.client.try_disconnect() {
                        debug!("Disconnect request failed: {}", e);
                    }
                    break;
                }

                message = self.outbound.recv(), if outbound_open => {
                    match message {
                        Some(message) => self.publish(message).await,
                        None => {
                            debug!("Outbound channel closed");
                            outbound_open = false;
                        }
                    }
                }

                event = self.eventloop.poll() => {
                    self.handle_event(event).await;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.status
    }

    async fn handle_event(&mut self, event: Result<Event, rumqttc::ConnectionError>) {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                self.set_state(ConnectionState::Connected);

                if let Err(e) = self.client.try_subscribe(REPORT_TOPIC, QoS::AtLeastOnce) {
                    error!("Failed to subscribe to {}: {}", REPORT_TOPIC, e);
                    self.record_error(format!("Subscribe failed: {}", e));
                }
                self.router.broadcast_transport(true).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.status.messages_received += 1;
                self.status.last_activity = Some(chrono::Local::now());

                if publish.topic != REPORT_TOPIC {
                    debug!("Ignoring message on topic {}", publish.topic);
                    return;
                }

                match decode(&publish.payload) {
                    Ok(frame) => {
                        debug!("Received {}", frame);
                        self.router.route_frame(frame).await;
                    }
                    Err(e) => {
                        self.status.decode_failures += 1;
                        warn!(
                            "Dropping frame: {} ({})",
                            e,
                            String::from_utf8_lossy(&publish.payload)
                        );
                    }
                }
                self.publish_status();
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                debug!("Subscription acknowledged: {:?}", suback.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the connection");
                self.connection_lost().await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                self.record_error(e.to_string());
                self.connection_lost().await;
                tokio::time::sleep(Duration::from_secs(self.config.reconnect_delay_secs)).await;
            }
        }
    }

    async fn connection_lost(&mut self) {
        let was_connected = self.status.connection_state == ConnectionState::Connected;
        let next = if was_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Failed
        };
        self.set_state(next);

        if was_connected {
            self.router.broadcast_transport(false).await;
        }
    }

    async fn publish(&mut self, message: MqttMessage) {
        debug!("Publishing {}", message);

        match self.client.try_publish(
            message.topic.clone(),
            QoS::AtLeastOnce,
            false,
            message.content.clone().into_bytes(),
        ) {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(chrono::Local::now());
                self.publish_status();
            }
            Err(e) => {
                warn!("Failed to publish on {}: {}", message.topic, e);
                self.record_error(format!("Publish failed: {}", e));

                if let (Some(gateway_sn), Some(frame_id)) = (message.gateway_sn, message.frame_id) {
                    let delivered = self
                        .router
                        .send_to(&gateway_sn, WorkerMessage::PublishFailed { frame_id })
                        .await;
                    if !delivered {
                        debug!("Gateway {} gone, publish failure not reported", gateway_sn);
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.connection_state != state {
            debug!(
                "MQTT connection state {:?} -> {:?}",
                self.status.connection_state, state
            );
            self.status.connection_state = state;
            self.publish_status();
        }
    }

    fn record_error(&mut self, message: String) {
        self.status.error_messages.push(message);
        if self.status.error_messages.len() > MAX_ERROR_MESSAGES {
            self.status.error_messages.remove(0);
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status.clone());
    }
}
