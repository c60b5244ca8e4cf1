use serde::{Deserialize, Serialize};
use std::fmt;

use super::action::{ControlAction, TRAVEL_ATTRIBUTE};

/// Fixed envelope head of every frame.
pub const FRAME_HEAD: &str = "$SH";

/// Device type announced in pairing requests.
pub const PAIRING_DEVICE_TYPE: &str = "curtain_ctr";

/// Device serial used while the gateway listens for any new opener.
pub const PAIRING_BROADCAST_SN: &str = "FFFFFFFFFFFF";

/// The five protocol types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    BindGateway,
    GatewayStatus,
    BindDevice,
    DeviceControl,
    DeviceStatus,
}

impl ProtocolType {
    pub fn code(self) -> &'static str {
        match self {
            ProtocolType::BindGateway => "001",
            ProtocolType::GatewayStatus => "002",
            ProtocolType::BindDevice => "003",
            ProtocolType::DeviceControl => "004",
            ProtocolType::DeviceStatus => "005",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "001" => Some(ProtocolType::BindGateway),
            "002" => Some(ProtocolType::GatewayStatus),
            "003" => Some(ProtocolType::BindDevice),
            "004" => Some(ProtocolType::DeviceControl),
            "005" => Some(ProtocolType::DeviceStatus),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A number as the gateway sends it: integer, float, or a numeric string.
///
/// The original representation is kept so frames re-encode unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Numeric::Int(value) => Some(*value as f64),
            Numeric::Float(value) => Some(*value),
            Numeric::Text(text) => text.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Numeric::Int(value) => Some(*value),
            Numeric::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            Numeric::Float(_) => None,
            Numeric::Text(text) => text.trim().parse().ok(),
        }
    }

    /// Travel values are 0..=200; anything that does not fit a `u16` is rejected.
    pub fn as_travel(&self) -> Option<u16> {
        self.as_i64().and_then(|value| u16::try_from(value).ok())
    }
}

impl From<&str> for Numeric {
    fn from(value: &str) -> Self {
        Numeric::Text(value.to_string())
    }
}

/// 001 data: gateway info / bind request, or a bind reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindGateway {
    #[serde(rename = "vesion", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "userid", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// One entry of the device list carried by a 002 report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub sn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_travel: Option<Numeric>,
}

/// 002 data: periodic gateway report or its reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceReport>,
}

/// 003 data: pairing / unbind request, or the bind result for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindDevice {
    /// Top-level `bind` flag of the envelope (1 bind, 0 unbind)
    #[serde(skip)]
    pub bind: Option<u8>,
    #[serde(rename = "bind", default, skip_serializing_if = "Option::is_none")]
    pub data_bind: Option<u8>,
    #[serde(rename = "devtype", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(rename = "sn", default, skip_serializing_if = "Option::is_none")]
    pub device_sn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<i64>,
}

/// 004 data: a control request or the gateway's control result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceControl {
    #[serde(rename = "sn", default, skip_serializing_if = "Option::is_none")]
    pub device_sn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub attribute: String,
    pub value: Numeric,
}

/// 005 data: status report of a single opener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "sn")]
    pub device_sn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<Attribute>,
}

impl DeviceStatus {
    /// Reported travel. `r_travel` in `attrs` wins over the legacy `position` field.
    pub fn travel(&self) -> Option<u16> {
        self.attrs
            .iter()
            .rev()
            .find(|attr| attr.attribute == "r_travel")
            .and_then(|attr| attr.value.as_travel())
            .or_else(|| self.position.as_ref().and_then(Numeric::as_travel))
    }

    /// Raw battery reading in tenths of a volt (105 means 10.5 V).
    pub fn battery_raw(&self) -> Option<f64> {
        self.attrs
            .iter()
            .rev()
            .find(|attr| attr.attribute == "voltage")
            .and_then(|attr| attr.value.as_f64())
            .or_else(|| self.battery.as_ref().and_then(Numeric::as_f64))
    }
}

/// Closed set of frame bodies, one per protocol type.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    BindGateway(BindGateway),
    GatewayStatus(GatewayStatus),
    BindDevice(BindDevice),
    DeviceControl(DeviceControl),
    DeviceStatus(DeviceStatus),
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u64,
    pub gateway_sn: String,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(gateway_sn: impl Into<String>, id: u64, body: FrameBody) -> Self {
        Self {
            id,
            gateway_sn: gateway_sn.into(),
            body,
        }
    }

    pub fn protocol_type(&self) -> ProtocolType {
        match &self.body {
            FrameBody::BindGateway(_) => ProtocolType::BindGateway,
            FrameBody::GatewayStatus(_) => ProtocolType::GatewayStatus,
            FrameBody::BindDevice(_) => ProtocolType::BindDevice,
            FrameBody::DeviceControl(_) => ProtocolType::DeviceControl,
            FrameBody::DeviceStatus(_) => ProtocolType::DeviceStatus,
        }
    }

    /// Child device the frame is about, if any.
    pub fn device_id(&self) -> Option<&str> {
        match &self.body {
            FrameBody::BindGateway(_) | FrameBody::GatewayStatus(_) => None,
            FrameBody::BindDevice(data) => data.device_sn.as_deref(),
            FrameBody::DeviceControl(data) => data.device_sn.as_deref(),
            FrameBody::DeviceStatus(data) => Some(data.device_sn.as_str()),
        }
    }

    /// 001 reply accepting a gateway's bind request.
    pub fn bind_gateway_reply(gateway_sn: &str, id: u64, uuid: &str) -> Self {
        Self::new(
            gateway_sn,
            id,
            FrameBody::BindGateway(BindGateway {
                errcode: Some(0),
                uuid: Some(uuid.to_string()),
                ..Default::default()
            }),
        )
    }

    /// 002 reply acknowledging a status report.
    pub fn gateway_status_reply(gateway_sn: &str, id: u64) -> Self {
        Self::new(
            gateway_sn,
            id,
            FrameBody::GatewayStatus(GatewayStatus {
                errcode: Some(0),
                ..Default::default()
            }),
        )
    }

    /// 002 request asking the gateway to report its status and devices.
    pub fn status_request(gateway_sn: &str, id: u64) -> Self {
        Self::new(
            gateway_sn,
            id,
            FrameBody::GatewayStatus(GatewayStatus::default()),
        )
    }

    /// 003 request opening the gateway's pairing window.
    pub fn pairing_request(gateway_sn: &str, id: u64) -> Self {
        Self::new(
            gateway_sn,
            id,
            FrameBody::BindDevice(BindDevice {
                bind: Some(1),
                data_bind: Some(1),
                device_type: Some(PAIRING_DEVICE_TYPE.to_string()),
                device_sn: Some(PAIRING_BROADCAST_SN.to_string()),
                errcode: None,
            }),
        )
    }

    /// 003 request unbinding one device from the gateway.
    pub fn unbind_device(gateway_sn: &str, id: u64, device_sn: &str) -> Self {
        Self::new(
            gateway_sn,
            id,
            FrameBody::BindDevice(BindDevice {
                bind: Some(0),
                data_bind: Some(1),
                device_type: Some(PAIRING_DEVICE_TYPE.to_string()),
                device_sn: Some(device_sn.to_string()),
                errcode: None,
            }),
        )
    }

    /// 004 control request.
    pub fn device_control(gateway_sn: &str, id: u64, device_sn: &str, action: ControlAction) -> Self {
        Self::new(
            gateway_sn,
            id,
            FrameBody::DeviceControl(DeviceControl {
                device_sn: Some(device_sn.to_string()),
                attribute: Some(TRAVEL_ATTRIBUTE.to_string()),
                value: Some(Numeric::Text(action.wire_value())),
                errcode: None,
            }),
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.device_id() {
            Some(device) => write!(
                f,
                "{} #{} gateway={} device={}",
                self.protocol_type(),
                self.id,
                self.gateway_sn,
                device
            ),
            None => write!(
                f,
                "{} #{} gateway={}",
                self.protocol_type(),
                self.id,
                self.gateway_sn
            ),
        }
    }
}
