use serde::{Deserialize, Serialize};

use super::base_data::{BinaryData, TwoByteInteger, Utf8String};
use super::control_packet::{is_v5, ControlPacketType, MqttControlPacket};
use super::parser::{Cursor, ParseError};
use super::properties::{decode_properties_hdr, encode_properties_hdr, Properties};

const PROTOCOL_NAME: &str = "MQTT";

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct MqttConnect {
    pub protocol_version: u8,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub properties: Properties,
}

impl MqttConnect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16, clean_start: bool) -> Self {
        MqttConnect {
            protocol_version: 4,
            client_id: client_id.into(),
            keep_alive,
            clean_start,
            username: None,
            password: None,
            will: None,
            properties: Vec::new(),
        }
    }
}

impl MqttControlPacket for MqttConnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNECT as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = Utf8String::encode(PROTOCOL_NAME)?;
        bytes.push(mqtt_version);

        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= 0x80;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | (will.qos & 0x03) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.clean_start {
            flags |= 0x02;
        }
        bytes.push(flags);
        bytes.extend(TwoByteInteger::encode(self.keep_alive));

        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn payload(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = Utf8String::encode(&self.client_id)?;
        if let Some(will) = &self.will {
            if is_v5(mqtt_version) {
                bytes.extend(encode_properties_hdr(&will.properties)?);
            }
            bytes.extend(Utf8String::encode(&will.topic)?);
            bytes.extend(BinaryData::encode(&will.payload)?);
        }
        if let Some(username) = &self.username {
            bytes.extend(Utf8String::encode(username)?);
        }
        if let Some(password) = &self.password {
            bytes.extend(BinaryData::encode(password)?);
        }
        Ok(bytes)
    }

    fn decode(_flags: u8, body: &[u8], _mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let name = cur.utf8()?;
        if name != PROTOCOL_NAME && name != "MQIsdp" {
            return Err(ParseError::ParseError(format!(
                "unknown protocol name {}",
                name
            )));
        }
        // the level inside CONNECT wins over the stream's configured version
        let protocol_version = cur.u8()?;
        let flags = cur.u8()?;
        if flags & 0x01 != 0 {
            return Err(ParseError::ParseError(
                "reserved CONNECT flag set".to_string(),
            ));
        }
        let keep_alive = cur.u16()?;
        let properties = if is_v5(protocol_version) {
            decode_properties_hdr(&mut cur)?
        } else {
            Vec::new()
        };

        let client_id = cur.utf8()?;
        let will = if flags & 0x04 != 0 {
            let will_properties = if is_v5(protocol_version) {
                decode_properties_hdr(&mut cur)?
            } else {
                Vec::new()
            };
            Some(Will {
                topic: cur.utf8()?,
                payload: cur.binary()?,
                qos: (flags >> 3) & 0x03,
                retain: flags & 0x20 != 0,
                properties: will_properties,
            })
        } else {
            None
        };
        let username = if flags & 0x80 != 0 {
            Some(cur.utf8()?)
        } else {
            None
        };
        let password = if flags & 0x40 != 0 {
            Some(cur.binary()?)
        } else {
            None
        };

        Ok(MqttConnect {
            protocol_version,
            client_id,
            keep_alive,
            clean_start: flags & 0x02 != 0,
            username,
            password,
            will,
            properties,
        })
    }
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct MqttConnAck {
    pub session_present: bool,
    /// v3.1.1 return code or v5 reason code; 0 means accepted.
    pub reason_code: u8,
    pub properties: Properties,
}

impl MqttConnAck {
    pub fn new(session_present: bool, reason_code: u8) -> Self {
        MqttConnAck {
            session_present,
            reason_code,
            properties: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason_code == 0
    }
}

impl MqttControlPacket for MqttConnAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNACK as u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut bytes = vec![self.session_present as u8, self.reason_code];
        if is_v5(mqtt_version) {
            bytes.extend(encode_properties_hdr(&self.properties)?);
        }
        Ok(bytes)
    }

    fn decode(_flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError> {
        let mut cur = Cursor::new(body);
        let ack_flags = cur.u8()?;
        let reason_code = cur.u8()?;
        let properties = if is_v5(mqtt_version) && !cur.is_empty() {
            decode_properties_hdr(&mut cur)?
        } else {
            Vec::new()
        };
        Ok(MqttConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        })
    }
}
