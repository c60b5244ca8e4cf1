use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DecodeError;
use super::frame::{Frame, FrameBody, ProtocolType, FRAME_HEAD};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    head: String,
    ctype: String,
    #[serde(default)]
    id: u64,
    sn: String,
    #[serde(default = "empty_object")]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bind: Option<u8>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn typed<T: DeserializeOwned>(ctype: ProtocolType, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data)
        .map_err(|e| DecodeError::MalformedFrame(format!("{} data: {}", ctype, e)))
}

/// Parses one inbound payload into a frame.
pub fn decode(payload: &[u8]) -> Result<Frame, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::MalformedFrame(e.to_string()))?;

    if envelope.head != FRAME_HEAD {
        return Err(DecodeError::MalformedFrame(format!(
            "unexpected head {:?}",
            envelope.head
        )));
    }

    let ctype = ProtocolType::from_code(&envelope.ctype)
        .ok_or_else(|| DecodeError::UnknownProtocolType(envelope.ctype.clone()))?;

    if envelope.sn.trim().is_empty() {
        return Err(DecodeError::MalformedFrame("empty gateway sn".to_string()));
    }

    if !envelope.data.is_object() {
        return Err(DecodeError::MalformedFrame(format!(
            "{} data is not an object",
            ctype
        )));
    }

    let data = envelope.data;
    let body = match ctype {
        ProtocolType::BindGateway => FrameBody::BindGateway(typed(ctype, data)?),
        ProtocolType::GatewayStatus => FrameBody::GatewayStatus(typed(ctype, data)?),
        ProtocolType::BindDevice => {
            let mut body: super::frame::BindDevice = typed(ctype, data)?;
            body.bind = envelope.bind;
            FrameBody::BindDevice(body)
        }
        ProtocolType::DeviceControl => FrameBody::DeviceControl(typed(ctype, data)?),
        ProtocolType::DeviceStatus => FrameBody::DeviceStatus(typed(ctype, data)?),
    };

    Ok(Frame {
        id: envelope.id,
        gateway_sn: envelope.sn,
        body,
    })
}

/// Serializes a frame into the JSON envelope the gateway expects.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let (data, bind) = match &frame.body {
        FrameBody::BindGateway(data) => (serde_json::to_value(data)?, None),
        FrameBody::GatewayStatus(data) => (serde_json::to_value(data)?, None),
        FrameBody::BindDevice(data) => (serde_json::to_value(data)?, data.bind),
        FrameBody::DeviceControl(data) => (serde_json::to_value(data)?, None),
        FrameBody::DeviceStatus(data) => (serde_json::to_value(data)?, None),
    };

    let envelope = Envelope {
        head: FRAME_HEAD.to_string(),
        ctype: frame.protocol_type().code().to_string(),
        id: frame.id,
        sn: frame.gateway_sn.clone(),
        data,
        bind,
    };
    serde_json::to_vec(&envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{BindDevice, Numeric};
    use crate::protocol::ControlAction;
    use serde_json::json;

    fn to_json(frame: &Frame) -> Value {
        serde_json::from_slice(&encode(frame).unwrap()).unwrap()
    }

    #[test]
    fn decodes_gateway_bind_request() {
        let payload = br#"{"head":"$SH","ctype":"001","id":3,"sn":"GW01",
            "data":{"vesion":"1.0.2","model":"SH-GW","userid":"u-9"}}"#;
        let frame = decode(payload).unwrap();

        assert_eq!(frame.id, 3);
        assert_eq!(frame.gateway_sn, "GW01");
        match frame.body {
            FrameBody::BindGateway(data) => {
                assert_eq!(data.version.as_deref(), Some("1.0.2"));
                assert_eq!(data.model.as_deref(), Some("SH-GW"));
                assert_eq!(data.user_id.as_deref(), Some("u-9"));
                assert_eq!(data.errcode, None);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn decodes_gateway_status_with_devices() {
        let payload = br#"{"head":"$SH","ctype":"002","id":4,"sn":"GW01",
            "data":{"status":"online","devices":[{"sn":"D1","battery":118,"r_travel":"40"}]}}"#;
        let frame = decode(payload).unwrap();

        match frame.body {
            FrameBody::GatewayStatus(data) => {
                assert_eq!(data.status.as_deref(), Some("online"));
                assert_eq!(data.devices.len(), 1);
                assert_eq!(data.devices[0].sn, "D1");
                assert_eq!(data.devices[0].battery, Some(Numeric::Int(118)));
                assert_eq!(
                    data.devices[0].r_travel.as_ref().and_then(Numeric::as_travel),
                    Some(40)
                );
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn decodes_bind_result_with_top_level_flag() {
        let payload =
            br#"{"head":"$SH","ctype":"003","id":9,"sn":"GW01","bind":1,"data":{"errcode":0,"sn":"SN123"}}"#;
        let frame = decode(payload).unwrap();

        assert_eq!(frame.device_id(), Some("SN123"));
        match frame.body {
            FrameBody::BindDevice(data) => {
                assert_eq!(data.bind, Some(1));
                assert_eq!(data.errcode, Some(0));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn decodes_control_result() {
        let payload =
            br#"{"head":"$SH","ctype":"004","id":12,"sn":"GW01","data":{"sn":"SN123","errcode":2}}"#;
        let frame = decode(payload).unwrap();

        match frame.body {
            FrameBody::DeviceControl(data) => {
                assert_eq!(data.device_sn.as_deref(), Some("SN123"));
                assert_eq!(data.errcode, Some(2));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn decodes_device_status_attrs() {
        let payload = br#"{"head":"$SH","ctype":"005","id":20,"sn":"GW01",
            "data":{"sn":"SN123","status":"online","attrs":[
                {"attribute":"voltage","value":105},
                {"attribute":"r_travel","value":"100"}]}}"#;
        let frame = decode(payload).unwrap();

        match frame.body {
            FrameBody::DeviceStatus(data) => {
                assert_eq!(data.device_sn, "SN123");
                assert_eq!(data.travel(), Some(100));
                assert_eq!(data.battery_raw(), Some(105.0));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn device_status_falls_back_to_position_field() {
        let payload = br#"{"head":"$SH","ctype":"005","id":21,"sn":"GW01",
            "data":{"sn":"SN123","position":0,"battery":"98"}}"#;
        let frame = decode(payload).unwrap();

        match frame.body {
            FrameBody::DeviceStatus(data) => {
                assert_eq!(data.travel(), Some(0));
                assert_eq!(data.battery_raw(), Some(98.0));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_protocol_type() {
        let payload = br#"{"head":"$SH","ctype":"009","id":1,"sn":"GW01","data":{}}"#;
        assert_eq!(
            decode(payload),
            Err(DecodeError::UnknownProtocolType("009".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        let cases: [&[u8]; 6] = [
            b"not json at all",
            br#"{"head":"$XX","ctype":"001","id":1,"sn":"GW01","data":{}}"#,
            br#"{"head":"$SH","ctype":"001","id":1,"data":{}}"#,
            br#"{"head":"$SH","ctype":"001","id":1,"sn":"","data":{}}"#,
            br#"{"head":"$SH","ctype":"005","id":1,"sn":"GW01","data":{"status":"online"}}"#,
            br#"{"head":"$SH","ctype":"002","id":1,"sn":"GW01","data":[1,2]}"#,
        ];

        for payload in cases {
            assert!(
                matches!(decode(payload), Err(DecodeError::MalformedFrame(_))),
                "payload accepted: {}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn encodes_pairing_request() {
        let frame = Frame::pairing_request("GW01", 7);
        assert_eq!(
            to_json(&frame),
            json!({
                "head": "$SH",
                "ctype": "003",
                "id": 7,
                "sn": "GW01",
                "bind": 1,
                "data": {"bind": 1, "devtype": "curtain_ctr", "sn": "FFFFFFFFFFFF"}
            })
        );
    }

    #[test]
    fn encodes_unbind_with_zero_bind_flag() {
        let frame = Frame::unbind_device("GW01", 8, "SN123");
        let value = to_json(&frame);
        assert_eq!(value["bind"], json!(0));
        assert_eq!(value["data"]["sn"], json!("SN123"));
    }

    #[test]
    fn encodes_control_request() {
        let frame = Frame::device_control("GW01", 11, "SN123", ControlAction::Stop);
        assert_eq!(
            to_json(&frame),
            json!({
                "head": "$SH",
                "ctype": "004",
                "id": 11,
                "sn": "GW01",
                "data": {"sn": "SN123", "attribute": "w_travel", "value": "101"}
            })
        );
    }

    #[test]
    fn encodes_replies_without_empty_fields() {
        let bind = to_json(&Frame::bind_gateway_reply("GW01", 2, "abc"));
        assert_eq!(bind["data"], json!({"errcode": 0, "uuid": "abc"}));
        assert!(bind.get("bind").is_none());

        let status = to_json(&Frame::gateway_status_reply("GW01", 3));
        assert_eq!(status["data"], json!({"errcode": 0}));
    }

    #[test]
    fn every_protocol_type_survives_decode_and_encode() {
        let payloads = [
            json!({"head": "$SH", "ctype": "001", "id": 3, "sn": "GW01",
                   "data": {"vesion": "1.0.2", "model": "SH-GW", "userid": "u-9"}}),
            json!({"head": "$SH", "ctype": "002", "id": 4, "sn": "GW01",
                   "data": {"status": "online", "devices": [
                       {"sn": "D1", "battery": 118, "r_travel": "40"},
                       {"sn": "D2", "battery": 10.5}
                   ]}}),
            json!({"head": "$SH", "ctype": "003", "id": 5, "sn": "GW01", "bind": 1,
                   "data": {"bind": 1, "devtype": "curtain_ctr", "sn": "DEV-X", "errcode": 0}}),
            json!({"head": "$SH", "ctype": "004", "id": 6, "sn": "GW01",
                   "data": {"sn": "D1", "attribute": "w_travel", "value": "101", "errcode": 0}}),
            json!({"head": "$SH", "ctype": "005", "id": 7, "sn": "GW01",
                   "data": {"sn": "D1", "status": "online", "position": "35", "attrs": [
                       {"attribute": "r_travel", "value": 35},
                       {"attribute": "voltage", "value": 11.8}
                   ]}}),
        ];

        for payload in payloads {
            let frame = decode(&serde_json::to_vec(&payload).unwrap()).unwrap();
            assert_eq!(frame.protocol_type().code(), payload["ctype"]);
            assert_eq!(to_json(&frame), payload);
        }
    }

    #[test]
    fn decoded_bind_frame_encodes_back() {
        let frame = Frame::new(
            "GW01",
            5,
            FrameBody::BindDevice(BindDevice {
                bind: Some(1),
                errcode: Some(0),
                device_sn: Some("SN9".to_string()),
                ..Default::default()
            }),
        );
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
