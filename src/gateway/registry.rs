//! Per-gateway device table with stable ordinal naming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::RegistryError;
use crate::protocol::action::{TRAVEL_CLOSED, TRAVEL_CUSTOM, TRAVEL_OPEN};

/// Most openers a single gateway can bind.
pub const MAX_DEVICES_PER_GATEWAY: usize = 32;

pub const DISPLAY_NAME_PREFIX: &str = "Opener";

/// Position derived from the last reported travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Unknown,
    Closed,
    Open,
    Stopped,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PositionState::Unknown => write!(f, "unknown"),
            PositionState::Closed => write!(f, "closed"),
            PositionState::Open => write!(f, "open"),
            PositionState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub ordinal: u32,
    /// 0 closed .. 100 open, 200 extended
    pub travel: Option<u16>,
    pub battery_voltage: Option<f64>,
    pub last_report: Option<DateTime<Utc>>,
    pub online: bool,
}

impl Device {
    fn new(device_id: String, ordinal: u32) -> Self {
        Self {
            device_id,
            ordinal,
            travel: None,
            battery_voltage: None,
            last_report: None,
            online: false,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {:02}", DISPLAY_NAME_PREFIX, self.ordinal)
    }

    pub fn position_state(&self) -> PositionState {
        match self.travel {
            None => PositionState::Unknown,
            Some(TRAVEL_CLOSED) => PositionState::Closed,
            Some(TRAVEL_OPEN) | Some(TRAVEL_CUSTOM) => PositionState::Open,
            Some(_) => PositionState::Stopped,
        }
    }
}

/// Result of [`DeviceRegistry::add_device`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Added(Device),
    /// Retransmitted bind for a device that is already known
    Existing(Device),
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    gateway_sn: String,
    next_ordinal: u32,
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new(gateway_sn: impl Into<String>) -> Self {
        Self {
            gateway_sn: gateway_sn.into(),
            next_ordinal: 1,
            devices: HashMap::new(),
        }
    }

    pub fn gateway_sn(&self) -> &str {
        &self.gateway_sn
    }

    pub fn next_ordinal(&self) -> u32 {
        self.next_ordinal
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Binds a device and hands out the next ordinal.
    ///
    /// Requires an open pairing window. A device that is already registered keeps
    /// its ordinal and is returned as [`Registration::Existing`].
    pub fn add_device(
        &mut self,
        device_id: &str,
        window_open: bool,
        now: DateTime<Utc>,
    ) -> Result<Registration, RegistryError> {
        if !window_open {
            return Err(RegistryError::PairingWindowClosed(self.gateway_sn.clone()));
        }

        if let Some(existing) = self.devices.get_mut(device_id) {
            existing.last_report = Some(now);
            existing.online = true;
            return Ok(Registration::Existing(existing.clone()));
        }

        if self.devices.len() >= MAX_DEVICES_PER_GATEWAY {
            return Err(RegistryError::RegistryFull {
                gateway_sn: self.gateway_sn.clone(),
                capacity: MAX_DEVICES_PER_GATEWAY,
            });
        }

        let mut device = Device::new(device_id.to_string(), self.next_ordinal);
        device.last_report = Some(now);
        device.online = true;
        self.next_ordinal = self.next_ordinal.saturating_add(1);

        self.devices.insert(device.device_id.clone(), device.clone());
        Ok(Registration::Added(device))
    }

    /// Removes a device. Absent ids are a no-op.
    pub fn remove_device(&mut self, device_id: &str) -> Option<Device> {
        self.devices.remove(device_id)
    }

    /// All devices ordered by ordinal.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by_key(|device| device.ordinal);
        devices
    }

    pub fn get(&self, device_id: &str) -> Result<&Device, RegistryError> {
        self.devices
            .get(device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.to_string()))
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        self.devices.get_mut(device_id)
    }

    /// Drops every device. The ordinal counter is left untouched.
    pub fn clear(&mut self) -> Vec<Device> {
        let mut removed: Vec<Device> = self.devices.drain().map(|(_, device)| device).collect();
        removed.sort_by_key(|device| device.ordinal);
        removed
    }

    /// Rebuilds the table from persisted records.
    ///
    /// The counter never goes below one past the highest restored ordinal, so a
    /// stale snapshot cannot cause an ordinal to be handed out twice.
    pub fn restore(&mut self, next_ordinal: u32, devices: impl IntoIterator<Item = (String, u32, Option<u16>)>) {
        self.devices.clear();
        let mut floor = 1;
        for (device_id, ordinal, travel) in devices {
            floor = floor.max(ordinal.saturating_add(1));
            let mut device = Device::new(device_id, ordinal);
            device.travel = travel;
            self.devices.insert(device.device_id.clone(), device);
        }
        self.next_ordinal = next_ordinal.max(floor);
    }

    /// Marks every device offline and returns the ids that changed.
    pub fn mark_all_offline(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for device in self.devices.values_mut() {
            if device.online {
                device.online = false;
                changed.push(device.device_id.clone());
            }
        }
        changed.sort();
        changed
    }
}
