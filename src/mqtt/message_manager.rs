use chrono::NaiveDateTime;
use std::fmt;

use crate::protocol::{encode, request_topic, Frame};

const PREVIEW_CHARS: usize = 48;

/// One MQTT payload in either direction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
    /// Set on outbound messages so publish failures can be reported back
    pub gateway_sn: Option<String>,
    pub frame_id: Option<u64>,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        write!(f, "{} - {} {}", self.timestamp, self.topic, preview)
    }
}

impl MqttMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MqttMessage {
            topic,
            content,
            timestamp: chrono::Local::now().naive_local(),
            gateway_sn: None,
            frame_id: None,
        }
    }

    /// Encodes a frame for the gateway's request topic.
    pub fn for_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        let payload = encode(frame)?;
        Ok(MqttMessage {
            topic: request_topic(&frame.gateway_sn),
            content: String::from_utf8_lossy(&payload).into_owned(),
            timestamp: chrono::Local::now().naive_local(),
            gateway_sn: Some(frame.gateway_sn.clone()),
            frame_id: Some(frame.id),
        })
    }
}
