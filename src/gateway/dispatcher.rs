//! Protocol dispatcher for a single gateway.
//!
//! `GatewayCore` owns the registry, the pairing machine and the command
//! correlator of one gateway. Every entry point mutates state synchronously and
//! returns the [`Effect`]s the caller has to carry out: frames to publish, events
//! to broadcast, command waiters to wake and snapshots to write. Nothing in here
//! touches the transport or the clock directly, so every transition can be driven
//! from a test with explicit instants.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::correlator::{CommandCorrelator, CommandId, CommandOutcome, Resolution};
use super::events::{BridgeEvent, OfflineReason};
use super::pairing::{PairingEndReason, PairingMachine, PairingStart, PairingState};
use super::registry::{Device, DeviceRegistry, Registration};
use super::RegistryError;
use crate::error::BridgeError;
use crate::persistence::{DeviceRecord, GatewaySnapshot};
use crate::protocol::frame::PAIRING_BROADCAST_SN;
use crate::protocol::{
    BindDevice, BindGateway, ControlAction, DeviceControl, DeviceStatus, Frame, FrameBody,
    GatewayStatus, Numeric,
};

/// UUID returned to gateways in 001 replies unless configured otherwise.
pub const DEFAULT_CLIENT_UUID: &str = "4bc297c6-308d-4397-b1d6-2ef6ccc329d3";

/// Battery readings arrive in tenths of a volt.
const BATTERY_SCALE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub pairing_window: Duration,
    /// Silence after which the gateway counts as offline
    pub liveness_timeout: Duration,
    pub command_timeout: Duration,
    /// Immediate republish attempts after a failed publish (0 disables)
    pub publish_retries: u32,
    pub client_uuid: String,
    /// Period of unsolicited 002 status requests, `None` disables them
    pub discovery_interval: Option<Duration>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            pairing_window: Duration::seconds(60),
            liveness_timeout: Duration::seconds(1200),
            command_timeout: Duration::seconds(30),
            publish_retries: 0,
            client_uuid: DEFAULT_CLIENT_UUID.to_string(),
            discovery_interval: Some(Duration::seconds(300)),
        }
    }
}

/// Work produced by the dispatcher for the owning task.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(Frame),
    Notify(BridgeEvent),
    Resolve {
        command_id: CommandId,
        outcome: CommandOutcome,
    },
    Persist,
}

/// Point-in-time view of a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayInfo {
    pub gateway_sn: String,
    pub name: Option<String>,
    pub online: bool,
    pub bound: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub pairing: PairingState,
    pub device_count: usize,
    pub pending_commands: usize,
    pub next_ordinal: u32,
}

#[derive(Debug)]
pub struct GatewayCore {
    gateway_sn: String,
    name: Option<String>,
    settings: GatewaySettings,
    registry: DeviceRegistry,
    pairing: PairingMachine,
    commands: CommandCorrelator,
    online: bool,
    last_seen: Option<DateTime<Utc>>,
    next_discovery: Option<DateTime<Utc>>,
    next_frame_id: u64,
}

impl GatewayCore {
    pub fn new(gateway_sn: impl Into<String>, name: Option<String>, settings: GatewaySettings) -> Self {
        let gateway_sn = gateway_sn.into();
        Self {
            registry: DeviceRegistry::new(gateway_sn.clone()),
            pairing: PairingMachine::new(settings.pairing_window),
            commands: CommandCorrelator::new(settings.command_timeout),
            gateway_sn,
            name,
            settings,
            online: false,
            last_seen: None,
            next_discovery: None,
            next_frame_id: 1,
        }
    }

    pub fn gateway_sn(&self) -> &str {
        &self.gateway_sn
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.state()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn pending_command(&self, device_id: &str) -> Option<&super::OutstandingCommand> {
        self.commands.get(device_id)
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.registry.list_devices()
    }

    pub fn info(&self) -> GatewayInfo {
        GatewayInfo {
            gateway_sn: self.gateway_sn.clone(),
            name: self.name.clone(),
            online: self.online,
            bound: self.pairing.is_bound(),
            last_seen: self.last_seen,
            pairing: self.pairing.state(),
            device_count: self.registry.len(),
            pending_commands: self.commands.len(),
            next_ordinal: self.registry.next_ordinal(),
        }
    }

    /// Routes one inbound frame to its handler.
    pub fn handle(&mut self, frame: Frame, now: DateTime<Utc>) -> Vec<Effect> {
        if frame.gateway_sn != self.gateway_sn {
            warn!(
                "Gateway {} dropping frame addressed to {}",
                self.gateway_sn, frame.gateway_sn
            );
            return Vec::new();
        }

        debug!("Handling frame {}", frame);
        let id = frame.id;
        match frame.body {
            FrameBody::BindGateway(data) => self.on_bind_gateway(id, data, now),
            FrameBody::GatewayStatus(data) => self.on_gateway_status(id, data, now),
            FrameBody::BindDevice(data) => self.on_bind_device(data, now),
            FrameBody::DeviceControl(data) => self.on_control_result(data, now),
            FrameBody::DeviceStatus(data) => self.on_device_status(data, now),
        }
    }

    fn on_bind_gateway(&mut self, id: u64, data: BindGateway, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        match data.errcode {
            Some(code) if code != 0 => {
                warn!("Gateway {} bind failed with errcode {}", self.gateway_sn, code);
                let was_bound = self.pairing.is_bound();
                self.pairing.unbind();
                self.last_seen = Some(now);
                self.go_offline(OfflineReason::BindFailed, &mut effects);
                if was_bound {
                    effects.push(Effect::Persist);
                }
                return effects;
            }
            Some(_) => {
                debug!("Gateway {} confirmed bind", self.gateway_sn);
            }
            None => {
                info!(
                    "Gateway {} bind request (version {}, model {})",
                    self.gateway_sn,
                    data.version.as_deref().unwrap_or("-"),
                    data.model.as_deref().unwrap_or("-")
                );
                effects.push(Effect::Publish(Frame::bind_gateway_reply(
                    &self.gateway_sn,
                    id,
                    &self.settings.client_uuid,
                )));
            }
        }

        let was_bound = self.pairing.is_bound();
        let was_online = self.online;
        if self.pairing.bind_gateway().is_some() {
            effects.push(Effect::Notify(BridgeEvent::PairingEnded {
                gateway_sn: self.gateway_sn.clone(),
                reason: PairingEndReason::GatewayBound,
            }));
        }
        self.touch(now, &mut effects);

        if !was_bound {
            info!("Gateway {} bound", self.gateway_sn);
            effects.push(Effect::Persist);
            if was_online {
                effects.push(Effect::Notify(BridgeEvent::GatewayOnline {
                    gateway_sn: self.gateway_sn.clone(),
                    bound: true,
                }));
            }
        }
        effects
    }

    fn on_gateway_status(&mut self, id: u64, data: GatewayStatus, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.touch(now, &mut effects);

        for report in data.devices {
            let travel = report.r_travel.as_ref().and_then(Numeric::as_travel);
            let battery = report.battery.as_ref().and_then(Numeric::as_f64);
            self.apply_device_report(&report.sn, travel, battery, true, now, &mut effects);
        }

        match data.errcode {
            None => effects.push(Effect::Publish(Frame::gateway_status_reply(
                &self.gateway_sn,
                id,
            ))),
            Some(0) => {}
            Some(code) => warn!(
                "Gateway {} status reply carried errcode {}",
                self.gateway_sn, code
            ),
        }
        effects
    }

    fn on_bind_device(&mut self, data: BindDevice, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        if !self.pairing.window_open(now) {
            debug!(
                "{}, ignoring bind frame for {:?}",
                RegistryError::PairingWindowClosed(self.gateway_sn.clone()),
                data.device_sn
            );
            return effects;
        }
        self.touch(now, &mut effects);

        if data.bind == Some(0) {
            debug!(
                "Gateway {} acknowledged unbind of {:?}",
                self.gateway_sn, data.device_sn
            );
            return effects;
        }

        match data.errcode {
            Some(0) => {}
            Some(errcode) => {
                warn!(
                    "Gateway {} failed to bind {:?}: errcode {}",
                    self.gateway_sn, data.device_sn, errcode
                );
                return effects;
            }
            None => {
                debug!(
                    "Gateway {} bind frame for {:?} carries no result",
                    self.gateway_sn, data.device_sn
                );
                return effects;
            }
        }

        let device_sn = match data.device_sn.as_deref() {
            Some(sn) if !sn.is_empty() && sn != PAIRING_BROADCAST_SN => sn,
            _ => {
                debug!("Gateway {} bind frame without device sn", self.gateway_sn);
                return effects;
            }
        };

        match self.registry.add_device(device_sn, true, now) {
            Ok(Registration::Added(device)) => {
                info!(
                    "Gateway {} added device {} as {}",
                    self.gateway_sn,
                    device.device_id,
                    device.display_name()
                );
                effects.push(Effect::Notify(BridgeEvent::DeviceAdded {
                    gateway_sn: self.gateway_sn.clone(),
                    device_id: device.device_id.clone(),
                    ordinal: device.ordinal,
                    name: device.display_name(),
                }));
                effects.push(Effect::Persist);
            }
            Ok(Registration::Existing(device)) => {
                debug!(
                    "Device {} already bound as {}",
                    device.device_id,
                    device.display_name()
                );
            }
            Err(e) => warn!("Could not add device {}: {}", device_sn, e),
        }
        effects
    }

    fn on_control_result(&mut self, data: DeviceControl, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.touch(now, &mut effects);

        let device_sn = match data.device_sn {
            Some(sn) => sn,
            None => return effects,
        };

        match data.errcode {
            Some(code) if code != 0 => {
                warn!(
                    "Gateway {} rejected control of {}: errcode {}",
                    self.gateway_sn, device_sn, code
                );
                if let Some(resolution) = self.commands.reject(&device_sn, code) {
                    self.push_resolution(resolution, &mut effects);
                }
            }
            _ => debug!("Gateway {} accepted control of {}", self.gateway_sn, device_sn),
        }
        effects
    }

    fn on_device_status(&mut self, data: DeviceStatus, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.touch(now, &mut effects);

        let online = !matches!(data.status.as_deref(), Some("offline"));
        self.apply_device_report(
            &data.device_sn,
            data.travel(),
            data.battery_raw(),
            online,
            now,
            &mut effects,
        );
        effects
    }

    fn apply_device_report(
        &mut self,
        device_id: &str,
        travel: Option<u16>,
        battery_raw: Option<f64>,
        online: bool,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let device = match self.registry.get_mut(device_id) {
            Some(device) => device,
            None => {
                debug!(
                    "Gateway {} report for unknown device {}",
                    self.gateway_sn, device_id
                );
                return;
            }
        };

        if travel.is_some() {
            device.travel = travel;
        }
        if let Some(raw) = battery_raw {
            device.battery_voltage = Some(raw / BATTERY_SCALE);
        }
        device.online = online;
        device.last_report = Some(now);

        let event = device_updated(&self.gateway_sn, device);
        if let Some(resolution) = self.commands.on_report(device_id, travel) {
            self.push_resolution(resolution, effects);
        }
        effects.push(Effect::Notify(event));
    }

    /// Opens the pairing window and asks the gateway to listen for new openers.
    pub fn begin_pairing(&mut self, now: DateTime<Utc>) -> (PairingStart, Vec<Effect>) {
        let start = self.pairing.start(now);
        match start {
            PairingStart::Started(deadline) => {
                info!("Gateway {} pairing until {}", self.gateway_sn, deadline)
            }
            PairingStart::Extended(deadline) => info!(
                "Gateway {} pairing extended until {}",
                self.gateway_sn, deadline
            ),
        }

        let frame_id = self.next_frame_id();
        let effects = vec![
            Effect::Publish(Frame::pairing_request(&self.gateway_sn, frame_id)),
            Effect::Notify(BridgeEvent::PairingStarted {
                gateway_sn: self.gateway_sn.clone(),
                deadline: start.deadline(),
            }),
        ];
        (start, effects)
    }

    pub fn stop_pairing(&mut self) -> (bool, Vec<Effect>) {
        match self.pairing.stop() {
            Some(_) => {
                info!("Gateway {} pairing stopped", self.gateway_sn);
                (
                    true,
                    vec![Effect::Notify(BridgeEvent::PairingEnded {
                        gateway_sn: self.gateway_sn.clone(),
                        reason: PairingEndReason::Stopped,
                    })],
                )
            }
            None => (false, Vec::new()),
        }
    }

    /// Publishes a 004 and tracks it until a matching report arrives.
    pub fn send_control(
        &mut self,
        device_id: &str,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<(CommandId, Vec<Effect>), BridgeError> {
        if let ControlAction::SetPosition(position) = action {
            if position > 100 {
                return Err(BridgeError::InvalidPosition(position));
            }
        }
        if !self.registry.contains(device_id) {
            return Err(BridgeError::DeviceNotFound(device_id.to_string()));
        }

        let mut effects = Vec::new();
        let frame_id = self.next_frame_id();
        let (command_id, superseded) = self.commands.issue(device_id, action, frame_id, now);
        if let Some(resolution) = superseded {
            debug!(
                "Command {} for {} superseded by {}",
                resolution.command.command_id, device_id, command_id
            );
            self.push_resolution(resolution, &mut effects);
        }

        info!(
            "Gateway {} sending {} to {} (command {})",
            self.gateway_sn, action, device_id, command_id
        );
        effects.push(Effect::Publish(Frame::device_control(
            &self.gateway_sn,
            frame_id,
            device_id,
            action,
        )));
        Ok((command_id, effects))
    }

    /// Removes a device and unbinds it on the gateway. Unknown ids return `false`.
    pub fn delete_device(&mut self, device_id: &str) -> (bool, Vec<Effect>) {
        let device = match self.registry.remove_device(device_id) {
            Some(device) => device,
            None => {
                debug!("Delete of unknown device {} ignored", device_id);
                return (false, Vec::new());
            }
        };

        let mut effects = Vec::new();
        if let Some(resolution) = self.commands.cancel(device_id) {
            self.push_resolution(resolution, &mut effects);
        }

        info!(
            "Gateway {} removed {} ({})",
            self.gateway_sn,
            device.device_id,
            device.display_name()
        );
        let frame_id = self.next_frame_id();
        effects.push(Effect::Publish(Frame::unbind_device(
            &self.gateway_sn,
            frame_id,
            device_id,
        )));
        effects.push(Effect::Notify(BridgeEvent::DeviceRemoved {
            gateway_sn: self.gateway_sn.clone(),
            device_id: device.device_id.clone(),
            name: device.display_name(),
        }));
        effects.push(Effect::Persist);
        (true, effects)
    }

    /// Forgets every device of a replaced gateway. The ordinal counter is kept.
    pub fn rebind(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let (_, stopped) = self.stop_pairing();
        effects.extend(stopped);

        for resolution in self.commands.cancel_all() {
            self.push_resolution(resolution, &mut effects);
        }
        for device in self.registry.clear() {
            effects.push(Effect::Notify(BridgeEvent::DeviceRemoved {
                gateway_sn: self.gateway_sn.clone(),
                device_id: device.device_id.clone(),
                name: device.display_name(),
            }));
        }
        self.pairing.unbind();

        info!(
            "Gateway {} reset for rebind, next ordinal {}",
            self.gateway_sn,
            self.registry.next_ordinal()
        );
        effects.push(Effect::Persist);
        effects
    }

    pub fn request_status(&mut self) -> Vec<Effect> {
        let frame_id = self.next_frame_id();
        vec![Effect::Publish(Frame::status_request(
            &self.gateway_sn,
            frame_id,
        ))]
    }

    pub fn transport_down(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.go_offline(OfflineReason::TransportDown, &mut effects);
        effects
    }

    /// Broker connection is back: ask the gateway for a fresh report.
    pub fn transport_up(&mut self) -> Vec<Effect> {
        debug!("Transport up, requesting status from {}", self.gateway_sn);
        self.request_status()
    }

    /// A frame could not be handed to the broker.
    ///
    /// Control frames are republished immediately while the retry budget lasts,
    /// then resolved as [`CommandOutcome::PublishFailed`].
    pub fn publish_failed(&mut self, frame_id: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let command = match self.commands.find_by_frame(frame_id) {
            Some(command) => command.clone(),
            None => {
                warn!(
                    "Gateway {} failed to publish frame {}",
                    self.gateway_sn, frame_id
                );
                return effects;
            }
        };

        if command.retry_count < self.settings.publish_retries {
            let new_frame_id = self.next_frame_id();
            if self.commands.rearm(frame_id, new_frame_id).is_some() {
                warn!(
                    "Republishing {} for {} (attempt {})",
                    command.action,
                    command.device_id,
                    command.retry_count + 2
                );
                effects.push(Effect::Publish(Frame::device_control(
                    &self.gateway_sn,
                    new_frame_id,
                    &command.device_id,
                    command.action,
                )));
            }
        } else if let Some(resolution) = self.commands.fail_publish(frame_id) {
            warn!(
                "Command {} for {} could not be published",
                resolution.command.command_id, resolution.command.device_id
            );
            self.push_resolution(resolution, &mut effects);
        }
        effects
    }

    /// Expires the pairing window, the gateway heartbeat and pending commands.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.pairing.expire(now).is_some() {
            info!("Gateway {} pairing window expired", self.gateway_sn);
            effects.push(Effect::Notify(BridgeEvent::PairingEnded {
                gateway_sn: self.gateway_sn.clone(),
                reason: PairingEndReason::Expired,
            }));
        }

        if self.online {
            let silent = self
                .last_seen
                .map(|seen| now - seen > self.settings.liveness_timeout)
                .unwrap_or(true);
            if silent {
                warn!(
                    "Gateway {} silent for more than {}s",
                    self.gateway_sn,
                    self.settings.liveness_timeout.num_seconds()
                );
                self.go_offline(OfflineReason::HeartbeatLost, &mut effects);
            }
        }

        effects.extend(self.discover(now));

        for resolution in self.commands.sweep(now) {
            warn!(
                "Command {} ({}) for {} timed out",
                resolution.command.command_id, resolution.command.action, resolution.command.device_id
            );
            self.push_resolution(resolution, &mut effects);
        }
        effects
    }

    /// Starts the discovery period at `now`. No-op when discovery is disabled.
    pub fn schedule_discovery(&mut self, now: DateTime<Utc>) {
        self.next_discovery = self.settings.discovery_interval.map(|interval| now + interval);
    }

    fn discover(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let interval = match self.settings.discovery_interval {
            Some(interval) => interval,
            None => return Vec::new(),
        };

        match self.next_discovery {
            Some(due) if due <= now => {
                debug!("Gateway {} periodic discovery", self.gateway_sn);
                self.next_discovery = Some(now + interval);
                self.request_status()
            }
            Some(_) => Vec::new(),
            None => {
                self.next_discovery = Some(now + interval);
                Vec::new()
            }
        }
    }

    /// Cancels everything still pending. Used when the owning task stops.
    pub fn cancel_pending(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        for resolution in self.commands.cancel_all() {
            self.push_resolution(resolution, &mut effects);
        }
        effects
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            gateway_sn: self.gateway_sn.clone(),
            name: self.name.clone(),
            bound: self.pairing.is_bound(),
            next_ordinal: self.registry.next_ordinal(),
            devices: self
                .registry
                .list_devices()
                .into_iter()
                .map(|device| DeviceRecord {
                    device_id: device.device_id,
                    ordinal: device.ordinal,
                    travel: device.travel,
                })
                .collect(),
        }
    }

    pub fn restore(&mut self, snapshot: GatewaySnapshot) {
        if self.name.is_none() {
            self.name = snapshot.name;
        }
        self.pairing.restore(snapshot.bound);
        self.registry.restore(
            snapshot.next_ordinal,
            snapshot
                .devices
                .into_iter()
                .map(|record| (record.device_id, record.ordinal, record.travel)),
        );
        info!(
            "Gateway {} restored with {} devices, next ordinal {}",
            self.gateway_sn,
            self.registry.len(),
            self.registry.next_ordinal()
        );
    }

    fn touch(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        self.last_seen = Some(now);
        if !self.online {
            self.online = true;
            info!("Gateway {} online", self.gateway_sn);
            effects.push(Effect::Notify(BridgeEvent::GatewayOnline {
                gateway_sn: self.gateway_sn.clone(),
                bound: self.pairing.is_bound(),
            }));
        }
    }

    fn go_offline(&mut self, reason: OfflineReason, effects: &mut Vec<Effect>) {
        if !self.online && reason != OfflineReason::BindFailed {
            return;
        }
        self.online = false;
        warn!("Gateway {} offline: {:?}", self.gateway_sn, reason);
        effects.push(Effect::Notify(BridgeEvent::GatewayOffline {
            gateway_sn: self.gateway_sn.clone(),
            reason,
        }));

        for device_id in self.registry.mark_all_offline() {
            if let Ok(device) = self.registry.get(&device_id) {
                effects.push(Effect::Notify(device_updated(&self.gateway_sn, device)));
            }
        }
    }

    fn push_resolution(&self, resolution: Resolution, effects: &mut Vec<Effect>) {
        let command = resolution.command;
        effects.push(Effect::Resolve {
            command_id: command.command_id,
            outcome: resolution.outcome,
        });
        effects.push(Effect::Notify(BridgeEvent::CommandResolved {
            gateway_sn: self.gateway_sn.clone(),
            device_id: command.device_id,
            command_id: command.command_id,
            action: command.action,
            outcome: resolution.outcome,
        }));
    }

    fn next_frame_id(&mut self) -> u64 {
        let id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.checked_add(1).unwrap_or(1);
        id
    }
}

fn device_updated(gateway_sn: &str, device: &Device) -> BridgeEvent {
    BridgeEvent::DeviceUpdated {
        gateway_sn: gateway_sn.to_string(),
        device_id: device.device_id.clone(),
        travel: device.travel,
        position: device.position_state(),
        battery_voltage: device.battery_voltage,
        online: device.online,
    }
}
