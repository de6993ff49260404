// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::base_data::{TwoByteInteger, Utf8String};
use super::control_packet::{
    is_v5, with_fixed_header, ControlPacketType, MqttControlPacket,
};
use super::parser::{Cursor, ParseError};
use super::properties::{decode_properties_hdr, encode_properties_hdr, Properties};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct MqttPublish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic_name: String,
    pub packet_id: Option<u16>,
    pub properties: Properties,
    pub payload: Vec<u8>,
}

impl MqttPublish {
    pub fn new(qos: u8, topic_name: impl Into<String>, payload: Vec<u8>) -> Self {
        MqttPublish {
            dup: false,
            qos,
            retain: false,
            topic_name: topic_name.into(),
            packet_id: None,
            properties: Vec::new(),
            payload,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

impl MqttControlPacket for MqttPublish {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBLISH as u8
    }

    fn flags(&self) -> u8 {
        (self.dup as u8) << 3 | (self.qos & 0x03) << 1 | self.retain as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        if self.qos > 2 {
            return Err(ParseError::ParseError(format!("invalid QoS {}", self.qos)));
        }
        let mut bytes = Utf8String::encode(&self.topic_name)?;
        if self.qos > 0 {
            let id = self.packet_id.ok_or_else(|| {
                ParseError::ParseError("QoS > 0 PUBLISH without packet id".to_string())
            })?;
            bytes.extend(TwoByteInteger::encode(id));
        }
        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn payload(&self, _mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        Ok(self.payload.clone())
    }

    fn decode(flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let qos = (flags >> 1) & 0x03;
        if qos == 3 {
            return Err(ParseError::ParseError("PUBLISH with QoS 3".to_string()));
        }
        let mut cur = Cursor::new(body);
        let topic_name = cur.utf8()?;
        let packet_id = if qos > 0 {
            let id = cur.u16()?;
            if id == 0 {
                return Err(ParseError::ParseError("PUBLISH with packet id 0".to_string()));
            }
            Some(id)
        } else {
            None
        };
        let properties = if is_v5(mqtt_version) {
            decode_properties_hdr(&mut cur)?
        } else {
            Vec::new()
        };
        Ok(MqttPublish {
            dup: flags & 0x08 != 0,
            qos,
            retain: flags & 0x01 != 0,
            topic_name,
            packet_id,
            properties,
            payload: cur.take_rest().to_vec(),
        })
    }
}

/// Body shared by PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct MqttPubResponse {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Properties,
}

impl MqttPubResponse {
    pub fn new(packet_id: u16, reason_code: u8) -> Self {
        MqttPubResponse {
            packet_id,
            reason_code,
            properties: Vec::new(),
        }
    }

    /// Reason codes of 0x80 and above report failure (MQTT 5.0: 2.4).
    pub fn is_failure(&self) -> bool {
        self.reason_code >= 0x80
    }

    pub fn to_bytes_as(
        &self,
        kind: ControlPacketType,
        mqtt_version: u8,
    ) -> Result<Vec<u8>, ParseError> {
        let mut body = TwoByteInteger::encode(self.packet_id).to_vec();
        // the reason code and property length may be omitted when there is nothing to say
        if is_v5(mqtt_version) && (self.reason_code != 0 || !self.properties.is_empty()) {
            body.push(self.reason_code);
            if !self.properties.is_empty() {
                body.extend(encode_properties_hdr(&self.properties)?);
            }
        }
        let flags = if kind == ControlPacketType::PUBREL { 0x02 } else { 0 };
        with_fixed_header((kind as u8) << 4 | flags, body)
    }

    pub fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let packet_id = cur.u16()?;
        let mut response = MqttPubResponse::new(packet_id, 0);
        if is_v5(mqtt_version) {
            if !cur.is_empty() {
                response.reason_code = cur.u8()?;
            }
            if !cur.is_empty() {
                response.properties = decode_properties_hdr(&mut cur)?;
            }
        }
        Ok(response)
    }
}
