//! Demultiplexes inbound traffic to the worker owning each gateway.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::worker::WorkerMessage;
use crate::protocol::Frame;

#[derive(Debug, Default)]
struct RouteTable {
    gateways: HashMap<String, mpsc::Sender<WorkerMessage>>,
    /// device id -> gateway serial
    devices: HashMap<String, String>,
}

/// Shared lookup from gateway serial and device id to a worker inbox.
#[derive(Debug, Clone, Default)]
pub struct GatewayRouter {
    table: Arc<RwLock<RouteTable>>,
}

impl GatewayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the serial is already routed.
    pub async fn register(&self, gateway_sn: &str, sender: mpsc::Sender<WorkerMessage>) -> bool {
        let mut table = self.table.write().await;
        if table.gateways.contains_key(gateway_sn) {
            return false;
        }
        table.gateways.insert(gateway_sn.to_string(), sender);
        true
    }

    pub async fn unregister(&self, gateway_sn: &str) -> Option<mpsc::Sender<WorkerMessage>> {
        let mut table = self.table.write().await;
        table.devices.retain(|_, owner| owner != gateway_sn);
        table.gateways.remove(gateway_sn)
    }

    pub async fn sender(&self, gateway_sn: &str) -> Option<mpsc::Sender<WorkerMessage>> {
        self.table.read().await.gateways.get(gateway_sn).cloned()
    }

    pub async fn gateways(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.table.read().await.gateways.keys().cloned().collect();
        serials.sort();
        serials
    }

    pub async fn bind_device(&self, device_id: &str, gateway_sn: &str) {
        let mut table = self.table.write().await;
        if let Some(previous) = table
            .devices
            .insert(device_id.to_string(), gateway_sn.to_string())
        {
            if previous != gateway_sn {
                warn!(
                    "Device {} moved from gateway {} to {}",
                    device_id, previous, gateway_sn
                );
            }
        }
    }

    pub async fn unbind_device(&self, device_id: &str, gateway_sn: &str) {
        let mut table = self.table.write().await;
        if table.devices.get(device_id).map(String::as_str) == Some(gateway_sn) {
            table.devices.remove(device_id);
        }
    }

    pub async fn gateway_for_device(&self, device_id: &str) -> Option<String> {
        self.table.read().await.devices.get(device_id).cloned()
    }

    /// Hands a frame to its gateway's worker. Frames for unknown gateways are dropped.
    ///
    /// Never waits on the inbox: the caller is the transport task, which also
    /// drains the workers' outbound queue.
    pub async fn route_frame(&self, frame: Frame) -> bool {
        let sender = match self.sender(&frame.gateway_sn).await {
            Some(sender) => sender,
            None => {
                debug!("No worker for gateway {}, dropping {}", frame.gateway_sn, frame);
                return false;
            }
        };

        let gateway_sn = frame.gateway_sn.clone();
        deliver(&gateway_sn, &sender, WorkerMessage::Frame(frame))
    }

    pub async fn send_to(&self, gateway_sn: &str, message: WorkerMessage) -> bool {
        match self.sender(gateway_sn).await {
            Some(sender) => deliver(gateway_sn, &sender, message),
            None => false,
        }
    }

    /// Tells every worker whether the broker connection is up.
    pub async fn broadcast_transport(&self, connected: bool) {
        let senders: Vec<(String, mpsc::Sender<WorkerMessage>)> = self
            .table
            .read()
            .await
            .gateways
            .iter()
            .map(|(gateway_sn, sender)| (gateway_sn.clone(), sender.clone()))
            .collect();
        for (gateway_sn, sender) in senders {
            deliver(&gateway_sn, &sender, WorkerMessage::TransportState(connected));
        }
    }
}

fn deliver(gateway_sn: &str, sender: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) -> bool {
    match sender.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Inbox of gateway {} is full, dropping message", gateway_sn);
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!("Worker for gateway {} is gone", gateway_sn);
            false
        }
    }
}
