use serde::{Deserialize, Serialize};

use super::control_packet::{is_v5, ControlPacketType, MqttControlPacket};
use super::parser::{Cursor, ParseError};
use super::properties::{decode_properties_hdr, encode_properties_hdr, Properties};

/// DISCONNECT. On v3.1.1 the packet has no body and both fields are ignored.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct MqttDisconnect {
    pub reason_code: u8,
    pub properties: Properties,
}

impl MqttDisconnect {
    pub fn new(reason_code: u8) -> Self {
        MqttDisconnect {
            reason_code,
            properties: Vec::new(),
        }
    }
}

impl MqttControlPacket for MqttDisconnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::DISCONNECT as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        reason_and_properties(self.reason_code, &self.properties, mqtt_version)
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let (reason_code, properties) = decode_reason_and_properties(body, mqtt_version)?;
        Ok(MqttDisconnect {
            reason_code,
            properties,
        })
    }
}

/// AUTH (MQTT 5.0 only).
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct MqttAuth {
    pub reason_code: u8,
    pub properties: Properties,
}

impl MqttControlPacket for MqttAuth {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::AUTH as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        reason_and_properties(self.reason_code, &self.properties, mqtt_version)
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let (reason_code, properties) = decode_reason_and_properties(body, mqtt_version)?;
        Ok(MqttAuth {
            reason_code,
            properties,
        })
    }
}

fn reason_and_properties(
    reason_code: u8,
    properties: &[super::properties::Property],
    mqtt_version: u8,
) -> Result<Vec<u8>, ParseError> {
    if !is_v5(mqtt_version) || (reason_code == 0 && properties.is_empty()) {
        return Ok(Vec::new());
    }
    let mut bytes = vec![reason_code];
    if !properties.is_empty() {
        bytes.extend(encode_properties_hdr(properties)?);
    }
    Ok(bytes)
}

fn decode_reason_and_properties(
    body: &[u8],
    mqtt_version: u8,
) -> Result<(u8, Properties), ParseError> {
    if !is_v5(mqtt_version) {
        return Ok((0, Vec::new()));
    }
    let mut cur = Cursor::new(body);
    let reason_code = if cur.is_empty() { 0 } else { cur.u8()? };
    let properties = if cur.is_empty() {
        Vec::new()
    } else {
        decode_properties_hdr(&mut cur)?
    };
    Ok((reason_code, properties))
}
