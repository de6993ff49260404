use serde::{Deserialize, Serialize};

use super::base_data::{TwoByteInteger, Utf8String};
use super::control_packet::{is_v5, ControlPacketType, MqttControlPacket};
use super::parser::{Cursor, ParseError};
use super::properties::{decode_properties_hdr, encode_properties_hdr, Properties};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub topic_filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl TopicSubscription {
    pub fn new(topic_filter: impl Into<String>, qos: u8) -> Self {
        TopicSubscription {
            topic_filter: topic_filter.into(),
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
        }
    }

    // MQTT 5.0: 3.8.3.1
    fn options(&self, mqtt_version: u8) -> u8 {
        let mut options = self.qos & 0x03;
        if is_v5(mqtt_version) {
            options |= (self.no_local as u8) << 2
                | (self.retain_as_published as u8) << 3
                | (self.retain_handling & 0x03) << 4;
        }
        options
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct MqttSubscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<TopicSubscription>,
    pub properties: Properties,
}

impl MqttSubscribe {
    pub fn new(subscriptions: Vec<TopicSubscription>) -> Self {
        MqttSubscribe {
            packet_id: 0,
            subscriptions,
            properties: Vec::new(),
        }
    }
}

impl MqttControlPacket for MqttSubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = TwoByteInteger::encode(self.packet_id).to_vec();
        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn payload(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        if self.subscriptions.is_empty() {
            return Err(ParseError::ParseError(
                "SUBSCRIBE without topic filters".to_string(),
            ));
        }
        let mut bytes = Vec::new();
        for sub in &self.subscriptions {
            bytes.extend(Utf8String::encode(&sub.topic_filter)?);
            bytes.push(sub.options(mqtt_version));
        }
        Ok(bytes)
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let packet_id = cur.u16()?;
        let properties = if is_v5(mqtt_version) {
            decode_properties_hdr(&mut cur)?
        } else {
            Vec::new()
        };
        let mut subscriptions = Vec::new();
        while !cur.is_empty() {
            let topic_filter = cur.utf8()?;
            let options = cur.u8()?;
            subscriptions.push(TopicSubscription {
                topic_filter,
                qos: options & 0x03,
                no_local: options & 0x04 != 0,
                retain_as_published: options & 0x08 != 0,
                retain_handling: (options >> 4) & 0x03,
            });
        }
        Ok(MqttSubscribe {
            packet_id,
            subscriptions,
            properties,
        })
    }
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct MqttSubAck {
    pub packet_id: u16,
    /// One granted QoS (or failure code 0x80+) per requested filter.
    pub reason_codes: Vec<u8>,
    pub properties: Properties,
}

impl MqttControlPacket for MqttSubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBACK as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = TwoByteInteger::encode(self.packet_id).to_vec();
        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn payload(&self, _mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        Ok(self.reason_codes.clone())
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let packet_id = cur.u16()?;
        let properties = if is_v5(mqtt_version) {
            decode_properties_hdr(&mut cur)?
        } else {
            Vec::new()
        };
        Ok(MqttSubAck {
            packet_id,
            reason_codes: cur.take_rest().to_vec(),
            properties,
        })
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct MqttUnsubscribe {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
    pub properties: Properties,
}

impl MqttUnsubscribe {
    pub fn new(topic_filters: Vec<String>) -> Self {
        MqttUnsubscribe {
            packet_id: 0,
            topic_filters,
            properties: Vec::new(),
        }
    }
}

impl MqttControlPacket for MqttUnsubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = TwoByteInteger::encode(self.packet_id).to_vec();
        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn payload(&self, _mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = Vec::new();
        for filter in &self.topic_filters {
            bytes.extend(Utf8String::encode(filter)?);
        }
        Ok(bytes)
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let packet_id = cur.u16()?;
        let properties = if is_v5(mqtt_version) {
            decode_properties_hdr(&mut cur)?
        } else {
            Vec::new()
        };
        let mut topic_filters = Vec::new();
        while !cur.is_empty() {
            topic_filters.push(cur.utf8()?);
        }
        Ok(MqttUnsubscribe {
            packet_id,
            topic_filters,
            properties,
        })
    }
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct MqttUnsubAck {
    pub packet_id: u16,
    /// Empty on v3.1.1, which has no UNSUBACK payload.
    pub reason_codes: Vec<u8>,
    pub properties: Properties,
}

impl MqttControlPacket for MqttUnsubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBACK as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = TwoByteInteger::encode(self.packet_id).to_vec();
        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn payload(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        if is_v5(mqtt_version) {
            Ok(self.reason_codes.clone())
        } else {
            Ok(Vec::new())
        }
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let packet_id = cur.u16()?;
        if !is_v5(mqtt_version) {
            return Ok(MqttUnsubAck {
                packet_id,
                ..Default::default()
            });
        }
        let properties = decode_properties_hdr(&mut cur)?;
        Ok(MqttUnsubAck {
            packet_id,
            reason_codes: cur.take_rest().to_vec(),
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_serde::control_packet::MqttPacket;
    use crate::mqtt_serde::parser::ParseOk;

    #[test]
    fn test_subscribe_v3_wire() {
        let mut sub = MqttSubscribe::new(vec![TopicSubscription::new("a/#", 1)]);
        sub.packet_id = 1;
        let bytes = MqttPacket::Subscribe(sub).to_bytes(4).unwrap();
        assert_eq!(hex::encode(bytes), "820800010003612f2301");
    }

    #[test]
    fn test_subscribe_v5_options_roundtrip() {
        let mut sub = MqttSubscribe::new(vec![
            TopicSubscription {
                topic_filter: "$share/g/jobs/+".into(),
                qos: 2,
                no_local: true,
                retain_as_published: true,
                retain_handling: 2,
            },
            TopicSubscription::new("status", 0),
        ]);
        sub.packet_id = 77;
        let packet = MqttPacket::Subscribe(sub);
        let bytes = packet.to_bytes(5).unwrap();
        match MqttPacket::from_bytes_with_version(&bytes, 5).unwrap() {
            ParseOk::Packet(decoded, _) => assert_eq!(decoded, packet),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_suback_codes() {
        let bytes = hex::decode("9004000a0180").unwrap();
        match MqttPacket::from_bytes_with_version(&bytes, 4).unwrap() {
            ParseOk::Packet(MqttPacket::SubAck(ack), _) => {
                assert_eq!(ack.packet_id, 10);
                assert_eq!(ack.reason_codes, vec![0x01, 0x80]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsuback_v3_has_no_codes() {
        let ack = MqttUnsubAck {
            packet_id: 3,
            reason_codes: vec![0x11],
            properties: Vec::new(),
        };
        assert_eq!(ack.to_bytes(4).unwrap(), vec![0xB0, 0x02, 0x00, 0x03]);
    }
}
