//! Bridge tests.
//!
//! Drive complete gateway workers through the public handle: inbound frames go in
//! through the router, outbound frames are read from the channel that would feed
//! the MQTT client, and time only moves when the manual clock is advanced.

use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use openerbridge::{
    bridge::{BridgeHandle, BridgeOptions},
    clock::ManualClock,
    gateway::{BridgeEvent, GatewaySettings, OfflineReason},
    mqtt::MqttMessage,
    persistence::SnapshotStore,
    protocol::{decode, ControlAction},
    BridgeError,
};

const GW: &str = "SN123";

struct Harness {
    bridge: BridgeHandle,
    outbound: mpsc::Receiver<MqttMessage>,
    events: broadcast::Receiver<BridgeEvent>,
    clock: ManualClock,
}

/// Helper to start a bridge with one gateway and a 90 s liveness window.
async fn start(storage: &Path) -> Harness {
    let clock = ManualClock::default();
    let settings = GatewaySettings {
        liveness_timeout: ChronoDuration::seconds(90),
        ..Default::default()
    };
    let options = BridgeOptions::new(settings, SnapshotStore::new(storage))
        .with_clock(Arc::new(clock.clone()))
        .with_sweep_interval(Duration::from_secs(3600));

    let (bridge, outbound) = BridgeHandle::new(options);
    let events = bridge.subscribe();
    bridge.add_gateway(GW, None).await.unwrap();

    Harness {
        bridge,
        outbound,
        events,
        clock,
    }
}

impl Harness {
    /// Routes a frame and waits until the worker has processed it.
    async fn inject(&self, frame: Value) {
        let frame = decode(frame.to_string().as_bytes()).unwrap();
        let gateway_sn = frame.gateway_sn.clone();
        assert!(self.bridge.router().route_frame(frame).await);
        self.bridge.gateway_info(&gateway_sn).await.unwrap();
    }

    fn sent(&mut self) -> Vec<(String, Value)> {
        let mut sent = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            sent.push((
                message.topic.clone(),
                serde_json::from_str(&message.content).unwrap(),
            ));
        }
        sent
    }

    fn events(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn pair(&mut self, devices: &[&str]) {
        self.bridge.begin_pairing(GW).await.unwrap();
        for device in devices {
            self.inject(bind_result(device)).await;
        }
        self.sent();
        self.events();
    }
}

fn bind_result(device: &str) -> Value {
    json!({"head": "$SH", "ctype": "003", "id": 40, "sn": GW, "bind": 1,
           "data": {"errcode": 0, "sn": device}})
}

fn status_report(device: &str, travel: u16) -> Value {
    json!({"head": "$SH", "ctype": "005", "id": 41, "sn": GW,
           "data": {"sn": device, "status": "online", "attrs": [
               {"attribute": "voltage", "value": 112},
               {"attribute": "r_travel", "value": travel.to_string()}]}})
}

fn heartbeat() -> Value {
    json!({"head": "$SH", "ctype": "002", "id": 42, "sn": GW, "data": {"status": "online"}})
}

fn device_names(devices: &[openerbridge::Device]) -> Vec<String> {
    devices.iter().map(|device| device.display_name()).collect()
}

#[tokio::test]
async fn test_pairing_assigns_ordinals_without_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;

    harness.bridge.begin_pairing(GW).await.unwrap();
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "gateway/SN123/req");
    assert_eq!(sent[0].1["ctype"], json!("003"));
    assert_eq!(sent[0].1["data"]["sn"], json!("FFFFFFFFFFFF"));

    harness.inject(bind_result("DEV-A")).await;
    harness.inject(bind_result("DEV-B")).await;
    let devices = harness.bridge.list_devices(GW).await.unwrap();
    assert_eq!(device_names(&devices), vec!["Opener 01", "Opener 02"]);

    assert!(harness.bridge.delete_device("DEV-A").await.unwrap());
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1["bind"], json!(0));
    assert_eq!(sent[0].1["data"]["sn"], json!("DEV-A"));

    harness.inject(bind_result("DEV-C")).await;
    let devices = harness.bridge.list_devices(GW).await.unwrap();
    assert_eq!(device_names(&devices), vec!["Opener 02", "Opener 03"]);

    let added: Vec<u32> = harness
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BridgeEvent::DeviceAdded { ordinal, .. } => Some(ordinal),
            _ => None,
        })
        .collect();
    assert_eq!(added, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_bind_frame_while_idle_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;
    harness.events();

    harness.inject(bind_result("DEV-A")).await;

    let info = harness.bridge.gateway_info(GW).await.unwrap();
    assert_eq!(info.device_count, 0);
    assert_eq!(info.next_ordinal, 1);
    assert!(!info.online);
    assert!(harness.events().is_empty());
    assert!(harness.sent().is_empty());
}

#[tokio::test]
async fn test_status_report_acks_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;
    harness.pair(&["DEV-A"]).await;

    let command = harness
        .bridge
        .control_device("DEV-A", ControlAction::Open)
        .await
        .unwrap();
    let sent = harness.sent();
    assert_eq!(sent[0].1["ctype"], json!("004"));
    assert_eq!(
        sent[0].1["data"],
        json!({"sn": "DEV-A", "attribute": "w_travel", "value": "100"})
    );

    harness.inject(status_report("DEV-A", 100)).await;
    command.wait().await.unwrap();

    let devices = harness.bridge.list_devices(GW).await.unwrap();
    assert_eq!(devices[0].travel, Some(100));
    assert_eq!(devices[0].battery_voltage, Some(11.2));
}

#[tokio::test]
async fn test_close_supersedes_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;
    harness.pair(&["DEV-A"]).await;

    let open = harness
        .bridge
        .control_device("DEV-A", ControlAction::Open)
        .await
        .unwrap();
    let close = harness
        .bridge
        .control_device("DEV-A", ControlAction::Close)
        .await
        .unwrap();

    assert!(matches!(
        open.wait().await,
        Err(BridgeError::CommandSuperseded { .. })
    ));
    assert_eq!(harness.bridge.gateway_info(GW).await.unwrap().pending_commands, 1);

    let sent = harness.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1["data"]["value"], json!("0"));

    harness.inject(status_report("DEV-A", 0)).await;
    close.wait().await.unwrap();
}

#[tokio::test]
async fn test_command_times_out_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;
    harness.pair(&["DEV-A"]).await;

    let command = harness
        .bridge
        .control_device("DEV-A", ControlAction::Close)
        .await
        .unwrap();

    harness.clock.advance(ChronoDuration::seconds(31));
    harness.bridge.sweep(GW).await.unwrap();

    assert!(matches!(
        command.wait().await,
        Err(BridgeError::CommandTimeout { .. })
    ));
    assert_eq!(harness.bridge.gateway_info(GW).await.unwrap().pending_commands, 0);

    harness.bridge.sweep(GW).await.unwrap();
    let resolved = harness
        .events()
        .into_iter()
        .filter(|event| matches!(event, BridgeEvent::CommandResolved { .. }))
        .count();
    assert_eq!(resolved, 1);
}

#[tokio::test]
async fn test_gateway_offline_after_missed_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;

    harness.inject(heartbeat()).await;
    assert!(harness.bridge.gateway_info(GW).await.unwrap().online);
    let sent = harness.sent();
    assert_eq!(sent[0].1["data"], json!({"errcode": 0}));

    harness.clock.advance(ChronoDuration::seconds(90));
    harness.bridge.sweep(GW).await.unwrap();
    assert!(harness.bridge.gateway_info(GW).await.unwrap().online);

    harness.clock.advance(ChronoDuration::seconds(1));
    harness.bridge.sweep(GW).await.unwrap();
    assert!(!harness.bridge.gateway_info(GW).await.unwrap().online);
    assert!(harness.events().contains(&BridgeEvent::GatewayOffline {
        gateway_sn: GW.to_string(),
        reason: OfflineReason::HeartbeatLost,
    }));

    harness.inject(heartbeat()).await;
    assert!(harness.bridge.gateway_info(GW).await.unwrap().online);
}

#[tokio::test]
async fn test_periodic_discovery_requests_status() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;

    harness.clock.advance(ChronoDuration::seconds(299));
    harness.bridge.sweep(GW).await.unwrap();
    assert!(harness.sent().is_empty());

    harness.clock.advance(ChronoDuration::seconds(1));
    harness.bridge.sweep(GW).await.unwrap();
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, format!("gateway/{}/req", GW));
    assert_eq!(sent[0].1["ctype"], json!("002"));
}

#[tokio::test]
async fn test_ordinals_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut harness = start(dir.path()).await;
        harness.pair(&["DEV-A", "DEV-B"]).await;
        assert!(harness.bridge.delete_device("DEV-A").await.unwrap());
        harness.bridge.shutdown().await.unwrap();
    }

    let mut harness = start(dir.path()).await;
    let devices = harness.bridge.list_devices(GW).await.unwrap();
    assert_eq!(device_names(&devices), vec!["Opener 02"]);

    harness.pair(&["DEV-C"]).await;
    let devices = harness.bridge.list_devices(GW).await.unwrap();
    assert_eq!(device_names(&devices), vec!["Opener 02", "Opener 03"]);

    harness
        .bridge
        .control_device("DEV-B", ControlAction::Stop)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_gateway_bind_request_is_answered() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;

    harness
        .inject(json!({"head": "$SH", "ctype": "001", "id": 7, "sn": GW,
                       "data": {"vesion": "2.1", "model": "WG-1", "userid": "u1"}}))
        .await;

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1["id"], json!(7));
    assert_eq!(
        sent[0].1["data"],
        json!({"errcode": 0, "uuid": "4bc297c6-308d-4397-b1d6-2ef6ccc329d3"})
    );
    let info = harness.bridge.gateway_info(GW).await.unwrap();
    assert!(info.bound);
    assert!(info.online);
}

#[tokio::test]
async fn test_unknown_targets() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(dir.path()).await;

    assert!(!harness.bridge.delete_device("ghost").await.unwrap());
    assert!(matches!(
        harness
            .bridge
            .control_device("ghost", ControlAction::Open)
            .await,
        Err(BridgeError::DeviceNotFound(_))
    ));
    assert!(matches!(
        harness.bridge.begin_pairing("nope").await,
        Err(BridgeError::GatewayNotFound(_))
    ));
    assert!(matches!(
        harness.bridge.add_gateway(GW, None).await,
        Err(BridgeError::GatewayExists(_))
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_pending_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;
    harness.pair(&["DEV-A"]).await;

    let command = harness
        .bridge
        .control_device("DEV-A", ControlAction::CustomTravel)
        .await
        .unwrap();
    harness.bridge.shutdown().await.unwrap();

    assert!(matches!(
        command.wait().await,
        Err(BridgeError::CommandCancelled { .. })
    ));
}

#[tokio::test]
async fn test_remove_gateway_deletes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start(dir.path()).await;
    harness.pair(&["DEV-A"]).await;

    let store = SnapshotStore::new(dir.path());
    assert!(store.load(GW).await.unwrap().is_some());

    harness.bridge.remove_gateway(GW).await.unwrap();
    assert!(store.load(GW).await.unwrap().is_none());
    assert!(harness.bridge.gateways().await.is_empty());
}
