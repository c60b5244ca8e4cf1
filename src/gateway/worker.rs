//! Gateway worker with statum lifecycle
//!
//! Each configured gateway gets one worker task that owns its [`GatewayCore`].
//! The inbox is the only way in, which keeps frame handling for the gateway in
//! arrival order and keeps its state away from every other task.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Hydrated ──► Running ──► Draining ──► Stopped
//!   (create)      (snapshot)   (inbox,      (cancel,
//!                               sweep and    persist)
//!                               discovery)
//! ```

use chrono::{DateTime, Utc};
use statum::{machine, state};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::correlator::{CommandId, CommandOutcome};
use super::dispatcher::{Effect, GatewayCore, GatewayInfo};
use super::events::BridgeEvent;
use super::registry::Device;
use super::router::GatewayRouter;
use crate::clock::Clock;
use crate::error::BridgeError;
use crate::mqtt::message_manager::MqttMessage;
use crate::persistence::SnapshotStore;
use crate::protocol::{ControlAction, Frame};

const INBOX_CAPACITY: usize = 100;

/// Accepted control request: the command id and where its outcome arrives.
pub type PendingCommand = (CommandId, oneshot::Receiver<CommandOutcome>);

/// Everything a worker can be asked to do.
pub enum WorkerMessage {
    Frame(Frame),
    TransportState(bool),
    PublishFailed {
        frame_id: u64,
    },
    BeginPairing {
        response_tx: oneshot::Sender<DateTime<Utc>>,
    },
    StopPairing {
        response_tx: oneshot::Sender<bool>,
    },
    Control {
        device_id: String,
        action: ControlAction,
        response_tx: oneshot::Sender<Result<PendingCommand, BridgeError>>,
    },
    DeleteDevice {
        device_id: String,
        response_tx: oneshot::Sender<bool>,
    },
    Rebind {
        response_tx: oneshot::Sender<()>,
    },
    RequestStatus {
        response_tx: oneshot::Sender<()>,
    },
    Info {
        response_tx: oneshot::Sender<GatewayInfo>,
    },
    ListDevices {
        response_tx: oneshot::Sender<Vec<Device>>,
    },
    /// Runs the deadline sweep now instead of waiting for the next tick
    Sweep {
        response_tx: oneshot::Sender<()>,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Initializing, // Core built, nothing loaded
    Hydrated,     // Snapshot applied
    Running,      // Serving the inbox
    Draining,     // Cancelling and persisting
    Stopped,
}

#[machine]
pub struct GatewayWorker<S: WorkerState> {
    core: GatewayCore,
    inbox: mpsc::Receiver<WorkerMessage>,
    outbound: mpsc::Sender<MqttMessage>,
    events: broadcast::Sender<BridgeEvent>,
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    router: GatewayRouter,
    waiters: HashMap<CommandId, oneshot::Sender<CommandOutcome>>,
    sweep_interval: Duration,
}

impl<S: WorkerState> GatewayWorker<S> {
    pub fn gateway_sn(&self) -> &str {
        self.core.gateway_sn()
    }

    /// Carries out effects in order. Publishing can fail and feed new effects back.
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        let mut persist = false;

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Publish(frame) => {
                    if let Err(e) = self.publish(&frame).await {
                        error!("Failed to publish {}: {}", frame, e);
                        queue.extend(self.core.publish_failed(frame.id));
                    }
                }
                Effect::Notify(event) => self.notify(event).await,
                Effect::Resolve {
                    command_id,
                    outcome,
                } => {
                    if let Some(waiter) = self.waiters.remove(&command_id) {
                        if waiter.send(outcome).is_err() {
                            debug!("Nobody waiting on command {}", command_id);
                        }
                    }
                }
                Effect::Persist => persist = true,
            }
        }

        if persist {
            self.persist().await;
        }
    }

    async fn publish(&self, frame: &Frame) -> Result<(), BridgeError> {
        let message = MqttMessage::for_frame(frame)
            .map_err(|e| BridgeError::Transport(format!("Failed to encode frame: {}", e)))?;
        debug!("Queueing {} on {}", frame, message.topic);
        self.outbound
            .send(message)
            .await
            .map_err(|e| BridgeError::ChannelError(format!("Outbound channel closed: {}", e)))
    }

    async fn notify(&self, event: BridgeEvent) {
        match &event {
            BridgeEvent::DeviceAdded { device_id, .. } => {
                self.router.bind_device(device_id, self.core.gateway_sn()).await
            }
            BridgeEvent::DeviceRemoved { device_id, .. } => {
                self.router
                    .unbind_device(device_id, self.core.gateway_sn())
                    .await
            }
            _ => {}
        }

        if self.events.send(event).is_err() {
            debug!("No event subscribers for gateway {}", self.core.gateway_sn());
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.core.snapshot()).await {
            error!(
                "Failed to persist gateway {}: {}",
                self.core.gateway_sn(),
                e
            );
        }
    }
}

impl GatewayWorker<Initializing> {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        core: GatewayCore,
        inbox: mpsc::Receiver<WorkerMessage>,
        outbound: mpsc::Sender<MqttMessage>,
        events: broadcast::Sender<BridgeEvent>,
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        router: GatewayRouter,
        sweep_interval: Duration,
    ) -> Self {
        info!("Initializing worker for gateway {}", core.gateway_sn());

        Self::new(
            core,
            inbox,
            outbound,
            events,
            store,
            clock,
            router,
            HashMap::new(), // waiters
            sweep_interval,
        )
    }

    /// Restores the persisted snapshot. A broken snapshot starts the gateway fresh.
    pub async fn hydrate(mut self) -> GatewayWorker<Hydrated> {
        let gateway_sn = self.core.gateway_sn().to_string();

        match self.store.load(&gateway_sn).await {
            Ok(Some(snapshot)) => self.core.restore(snapshot),
            Ok(None) => info!("No snapshot for gateway {}, starting fresh", gateway_sn),
            Err(e) => warn!(
                "Ignoring unreadable snapshot for gateway {}: {}",
                gateway_sn, e
            ),
        }

        for device in self.core.list_devices() {
            self.router.bind_device(&device.device_id, &gateway_sn).await;
        }

        self.transition()
    }
}

impl GatewayWorker<Hydrated> {
    pub fn activate(mut self) -> GatewayWorker<Running> {
        info!("Activating worker for gateway {}", self.core.gateway_sn());
        let now = self.clock.now();
        self.core.schedule_discovery(now);
        self.transition()
    }
}

impl GatewayWorker<Running> {
    /// Serves the inbox and runs periodic sweeps until cancelled or orphaned.
    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) -> GatewayWorker<Draining> {
        info!("Worker loop started for gateway {}", self.core.gateway_sn());

        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received for gateway {}", self.core.gateway_sn());
                    break;
                }

                message = self.inbox.recv() => {
                    match message {
                        Some(message) => self.process(message).await,
                        None => {
                            info!("Inbox closed for gateway {}", self.core.gateway_sn());
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    let now = self.clock.now();
                    let effects = self.core.sweep(now);
                    self.apply(effects).await;
                }
            }
        }

        self.transition()
    }

    async fn process(&mut self, message: WorkerMessage) {
        let now = self.clock.now();

        match message {
            WorkerMessage::Frame(frame) => {
                let effects = self.core.handle(frame, now);
                self.apply(effects).await;
            }
            WorkerMessage::TransportState(connected) => {
                let effects = if connected {
                    self.core.transport_up()
                } else {
                    self.core.transport_down()
                };
                self.apply(effects).await;
            }
            WorkerMessage::PublishFailed { frame_id } => {
                let effects = self.core.publish_failed(frame_id);
                self.apply(effects).await;
            }
            WorkerMessage::BeginPairing { response_tx } => {
                let (start, effects) = self.core.begin_pairing(now);
                self.apply(effects).await;
                let _ = response_tx.send(start.deadline());
            }
            WorkerMessage::StopPairing { response_tx } => {
                let (stopped, effects) = self.core.stop_pairing();
                self.apply(effects).await;
                let _ = response_tx.send(stopped);
            }
            WorkerMessage::Control {
                device_id,
                action,
                response_tx,
            } => match self.core.send_control(&device_id, action, now) {
                Ok((command_id, effects)) => {
                    let (outcome_tx, outcome_rx) = oneshot::channel();
                    self.waiters.insert(command_id, outcome_tx);
                    self.apply(effects).await;
                    let _ = response_tx.send(Ok((command_id, outcome_rx)));
                }
                Err(e) => {
                    debug!("Control request for {} refused: {}", device_id, e);
                    let _ = response_tx.send(Err(e));
                }
            },
            WorkerMessage::DeleteDevice {
                device_id,
                response_tx,
            } => {
                let (removed, effects) = self.core.delete_device(&device_id);
                self.apply(effects).await;
                let _ = response_tx.send(removed);
            }
            WorkerMessage::Rebind { response_tx } => {
                let effects = self.core.rebind();
                self.apply(effects).await;
                let _ = response_tx.send(());
            }
            WorkerMessage::RequestStatus { response_tx } => {
                let effects = self.core.request_status();
                self.apply(effects).await;
                let _ = response_tx.send(());
            }
            WorkerMessage::Info { response_tx } => {
                let _ = response_tx.send(self.core.info());
            }
            WorkerMessage::ListDevices { response_tx } => {
                let _ = response_tx.send(self.core.list_devices());
            }
            WorkerMessage::Sweep { response_tx } => {
                let effects = self.core.sweep(now);
                self.apply(effects).await;
                let _ = response_tx.send(());
            }
        }
    }
}

impl GatewayWorker<Draining> {
    /// Cancels pending commands, writes the final snapshot and stops.
    pub async fn shutdown(mut self) -> GatewayWorker<Stopped> {
        info!("Draining worker for gateway {}", self.core.gateway_sn());

        let effects = self.core.cancel_pending();
        self.apply(effects).await;

        for (command_id, waiter) in self.waiters.drain() {
            debug!("Cancelling orphaned waiter for command {}", command_id);
            let _ = waiter.send(CommandOutcome::Cancelled);
        }

        self.persist().await;
        info!("Worker stopped for gateway {}", self.core.gateway_sn());
        self.transition()
    }
}

impl GatewayWorker<Stopped> {}

/// Handle for a gateway worker running in a tokio task
#[derive(Debug)]
pub struct GatewayWorkerHandle {
    pub gateway_sn: String,

    sender: mpsc::Sender<WorkerMessage>,

    task_handle: Option<JoinHandle<()>>,

    shutdown: CancellationToken,
}

impl GatewayWorkerHandle {
    /// Spawns hydrate, activate and the main loop for `core` in one task.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        core: GatewayCore,
        outbound: mpsc::Sender<MqttMessage>,
        events: broadcast::Sender<BridgeEvent>,
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        router: GatewayRouter,
        sweep_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let gateway_sn = core.gateway_sn().to_string();
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);

        let worker = GatewayWorker::create(
            core,
            inbox,
            outbound,
            events,
            store,
            clock,
            router,
            sweep_interval,
        );

        let task_shutdown = shutdown.clone();
        let task_sn = gateway_sn.clone();
        let task_handle = tokio::spawn(async move {
            debug!("Spawning worker task for gateway {}", task_sn);
            let running = worker.hydrate().await.activate();
            let draining = running.run_until_shutdown(task_shutdown).await;
            let _ = draining.shutdown().await;
        });

        Self {
            gateway_sn,
            sender,
            task_handle: Some(task_handle),
            shutdown,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<WorkerMessage> {
        self.sender.clone()
    }

    /// Sends a request built around a fresh response channel and awaits the answer.
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage,
    ) -> Result<T, BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender.send(build(response_tx)).await.map_err(|e| {
            BridgeError::ChannelError(format!(
                "Worker for gateway {} unavailable: {}",
                self.gateway_sn, e
            ))
        })?;
        response_rx.await.map_err(|e| {
            BridgeError::ChannelError(format!(
                "Worker for gateway {} dropped the request: {}",
                self.gateway_sn, e
            ))
        })
    }

    /// Gracefully shuts down the worker and waits for its final snapshot
    pub async fn shutdown(&mut self) -> Result<(), BridgeError> {
        debug!("Sending shutdown signal to worker: {}", self.gateway_sn);
        self.shutdown.cancel();

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(()) => {
                    debug!("Worker task completed: {}", self.gateway_sn);
                    Ok(())
                }
                Err(e) => {
                    error!("Worker task panicked: {} - {}", self.gateway_sn, e);
                    Err(BridgeError::ThreadError(format!(
                        "Worker task panicked: {}",
                        e
                    )))
                }
            }
        } else {
            debug!("Worker already shut down: {}", self.gateway_sn);
            Ok(())
        }
    }
}
