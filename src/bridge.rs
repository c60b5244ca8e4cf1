//! Collaborator-facing API.
//!
//! `BridgeHandle` is what entity adapters and setup code talk to. It owns one
//! worker per gateway and forwards every call to the worker that owns the
//! gateway or device in question.
//!
//! ```text
//! BridgeHandle ──► GatewayRouter ──► GatewayWorker (SN123) ──► outbound ──► MqttHandler
//!      ▲                         └──► GatewayWorker (GW-7F01)
//!      └──────────── broadcast<BridgeEvent> ◄──────────┘
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::BridgeError;
use crate::gateway::{
    BridgeEvent, CommandId, CommandOutcome, Device, GatewayCore, GatewayInfo, GatewayRouter,
    GatewaySettings, GatewayWorkerHandle, WorkerMessage,
};
use crate::mqtt::MqttMessage;
use crate::persistence::SnapshotStore;
use crate::protocol::ControlAction;

const OUTBOUND_CAPACITY: usize = 100;
const EVENT_CAPACITY: usize = 256;

pub struct BridgeOptions {
    pub settings: GatewaySettings,
    pub sweep_interval: Duration,
    pub store: SnapshotStore,
    pub clock: Arc<dyn Clock>,
}

impl BridgeOptions {
    pub fn new(settings: GatewaySettings, store: SnapshotStore) -> Self {
        Self {
            settings,
            sweep_interval: Duration::from_secs(5),
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

struct BridgeInner {
    router: GatewayRouter,
    workers: RwLock<HashMap<String, GatewayWorkerHandle>>,
    outbound: mpsc::Sender<MqttMessage>,
    events: broadcast::Sender<BridgeEvent>,
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    settings: GatewaySettings,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

impl BridgeHandle {
    /// Builds the bridge. The returned receiver carries every outbound MQTT
    /// message and is normally handed to [`MqttHandler`](crate::mqtt::MqttHandler).
    pub fn new(options: BridgeOptions) -> (Self, mpsc::Receiver<MqttMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = BridgeInner {
            router: GatewayRouter::new(),
            workers: RwLock::new(HashMap::new()),
            outbound,
            events,
            store: Arc::new(options.store),
            clock: options.clock,
            settings: options.settings,
            sweep_interval: options.sweep_interval,
            shutdown: CancellationToken::new(),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            outbound_rx,
        )
    }

    pub fn router(&self) -> GatewayRouter {
        self.inner.router.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub async fn gateways(&self) -> Vec<String> {
        self.inner.router.gateways().await
    }

    /// Starts a worker for a gateway and returns once its snapshot is loaded.
    pub async fn add_gateway(&self, gateway_sn: &str, name: Option<String>) -> Result<(), BridgeError> {
        let gateway_sn = gateway_sn.trim();
        if gateway_sn.is_empty() {
            return Err(BridgeError::GatewayNotFound(String::new()));
        }

        let mut workers = self.inner.workers.write().await;
        if workers.contains_key(gateway_sn) {
            return Err(BridgeError::GatewayExists(gateway_sn.to_string()));
        }

        let core = GatewayCore::new(gateway_sn, name, self.inner.settings.clone());
        let handle = GatewayWorkerHandle::spawn(
            core,
            self.inner.outbound.clone(),
            self.inner.events.clone(),
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.router.clone(),
            self.inner.sweep_interval,
            self.inner.shutdown.child_token(),
        );

        if !self.inner.router.register(gateway_sn, handle.sender()).await {
            return Err(BridgeError::GatewayExists(gateway_sn.to_string()));
        }

        // The worker answers only after hydration, so device routes exist from here on.
        let info = match handle
            .request(|response_tx| WorkerMessage::Info { response_tx })
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.inner.router.unregister(gateway_sn).await;
                return Err(e);
            }
        };
        workers.insert(gateway_sn.to_string(), handle);

        info!(
            "Gateway {} added with {} devices",
            gateway_sn, info.device_count
        );
        Ok(())
    }

    /// Stops the gateway's worker and forgets its persisted state.
    pub async fn remove_gateway(&self, gateway_sn: &str) -> Result<(), BridgeError> {
        let mut handle = self
            .inner
            .workers
            .write()
            .await
            .remove(gateway_sn)
            .ok_or_else(|| BridgeError::GatewayNotFound(gateway_sn.to_string()))?;

        self.inner.router.unregister(gateway_sn).await;
        handle.shutdown().await?;
        self.inner
            .store
            .delete(gateway_sn)
            .await
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;

        info!("Gateway {} removed", gateway_sn);
        Ok(())
    }

    /// Opens (or extends) the pairing window. Returns its deadline.
    pub async fn begin_pairing(&self, gateway_sn: &str) -> Result<DateTime<Utc>, BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::BeginPairing { response_tx })
            .await
    }

    /// Closes the pairing window. `false` when none was open.
    pub async fn stop_pairing(&self, gateway_sn: &str) -> Result<bool, BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::StopPairing { response_tx })
            .await
    }

    /// Publishes a control frame and returns a handle that resolves with the outcome.
    pub async fn control_device(
        &self,
        device_id: &str,
        action: ControlAction,
    ) -> Result<CommandHandle, BridgeError> {
        let gateway_sn = self
            .inner
            .router
            .gateway_for_device(device_id)
            .await
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;

        let device = device_id.to_string();
        let (command_id, outcome) = self
            .request(&gateway_sn, |response_tx| WorkerMessage::Control {
                device_id: device,
                action,
                response_tx,
            })
            .await??;

        Ok(CommandHandle {
            command_id,
            gateway_sn,
            device_id: device_id.to_string(),
            action,
            outcome,
        })
    }

    /// Deletes a device. Unknown ids are a no-op returning `false`.
    pub async fn delete_device(&self, device_id: &str) -> Result<bool, BridgeError> {
        let gateway_sn = match self.inner.router.gateway_for_device(device_id).await {
            Some(gateway_sn) => gateway_sn,
            None => {
                debug!("Delete of unknown device {} ignored", device_id);
                return Ok(false);
            }
        };

        let device = device_id.to_string();
        self.request(&gateway_sn, |response_tx| WorkerMessage::DeleteDevice {
            device_id: device,
            response_tx,
        })
        .await
    }

    /// Drops all devices of a replaced gateway. Ordinals keep counting.
    pub async fn rebind_gateway(&self, gateway_sn: &str) -> Result<(), BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::Rebind { response_tx })
            .await
    }

    pub async fn request_status(&self, gateway_sn: &str) -> Result<(), BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::RequestStatus { response_tx })
            .await
    }

    pub async fn gateway_info(&self, gateway_sn: &str) -> Result<GatewayInfo, BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::Info { response_tx })
            .await
    }

    pub async fn list_devices(&self, gateway_sn: &str) -> Result<Vec<Device>, BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::ListDevices { response_tx })
            .await
    }

    /// Runs the deadline sweep of one gateway immediately.
    pub async fn sweep(&self, gateway_sn: &str) -> Result<(), BridgeError> {
        self.request(gateway_sn, |response_tx| WorkerMessage::Sweep { response_tx })
            .await
    }

    /// Stops every worker. Pending commands resolve as cancelled, snapshots are written.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        info!("Shutting down bridge");
        self.inner.shutdown.cancel();

        let handles: Vec<(String, GatewayWorkerHandle)> =
            self.inner.workers.write().await.drain().collect();

        let mut result = Ok(());
        for (gateway_sn, mut handle) in handles {
            self.inner.router.unregister(&gateway_sn).await;
            if let Err(e) = handle.shutdown().await {
                warn!("Worker {} did not stop cleanly: {}", gateway_sn, e);
                result = Err(e);
            }
        }
        result
    }

    async fn request<T>(
        &self,
        gateway_sn: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage,
    ) -> Result<T, BridgeError> {
        let workers = self.inner.workers.read().await;
        let handle = workers
            .get(gateway_sn)
            .ok_or_else(|| BridgeError::GatewayNotFound(gateway_sn.to_string()))?;
        handle.request(build).await
    }
}

/// A control command in flight.
#[derive(Debug)]
pub struct CommandHandle {
    pub command_id: CommandId,
    pub gateway_sn: String,
    pub device_id: String,
    pub action: ControlAction,
    outcome: oneshot::Receiver<CommandOutcome>,
}

impl CommandHandle {
    /// Waits for the terminal outcome. A vanished worker counts as cancelled.
    pub async fn outcome(self) -> CommandOutcome {
        self.outcome.await.unwrap_or(CommandOutcome::Cancelled)
    }

    /// Waits for the outcome and maps everything but an ack onto an error.
    pub async fn wait(self) -> Result<(), BridgeError> {
        let device_id = self.device_id.clone();
        let action = self.action;
        match self.outcome().await {
            CommandOutcome::Acked => Ok(()),
            CommandOutcome::TimedOut => Err(BridgeError::CommandTimeout { device_id, action }),
            CommandOutcome::Superseded => {
                Err(BridgeError::CommandSuperseded { device_id, action })
            }
            CommandOutcome::Rejected(errcode) => Err(BridgeError::CommandRejected {
                device_id,
                action,
                errcode,
            }),
            CommandOutcome::Cancelled => Err(BridgeError::CommandCancelled { device_id, action }),
            CommandOutcome::PublishFailed => Err(BridgeError::Transport(format!(
                "Command {} for {} was never published",
                action, device_id
            ))),
        }
    }
}
