use crate::mqtt_serde::properties::Properties;
use crate::mqtt_serde::publish::MqttPublish;

/// Application view of a PUBLISH, handed to [`MqttCallback::message_arrived`]
/// and to per-subscription listeners.
///
/// [`MqttCallback::message_arrived`]: super::MqttCallback::message_arrived
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    /// Set when the broker may already have delivered this message.
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: Properties,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: u8) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: None,
            properties: Vec::new(),
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub(crate) fn to_publish(&self) -> MqttPublish {
        MqttPublish::new(self.qos, self.topic.clone(), self.payload.clone())
            .with_retain(self.retain)
            .with_properties(self.properties.clone())
    }
}

impl From<&MqttPublish> for MqttMessage {
    fn from(publish: &MqttPublish) -> Self {
        MqttMessage {
            topic: publish.topic_name.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: publish.properties.clone(),
        }
    }
}
