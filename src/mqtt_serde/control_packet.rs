use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use super::base_data::VariableByteInteger;
use super::connect::{MqttConnAck, MqttConnect};
use super::disconnect::{MqttAuth, MqttDisconnect};
use super::parser::{frame, packet_type, ParseError, ParseOk};
use super::publish::{MqttPubResponse, MqttPublish};
use super::subscribe::{MqttSubAck, MqttSubscribe, MqttUnsubAck, MqttUnsubscribe};

/// Every control packet of both protocol levels. Version specific fields
/// (reason codes, properties) are simply left empty on v3.1.1.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum MqttPacket {
    Connect(MqttConnect),
    ConnAck(MqttConnAck),
    Publish(MqttPublish),
    PubAck(MqttPubResponse),
    PubRec(MqttPubResponse),
    PubRel(MqttPubResponse),
    PubComp(MqttPubResponse),
    Subscribe(MqttSubscribe),
    SubAck(MqttSubAck),
    Unsubscribe(MqttUnsubscribe),
    UnsubAck(MqttUnsubAck),
    PingReq,
    PingResp,
    Disconnect(MqttDisconnect),
    Auth(MqttAuth),
}

impl MqttPacket {
    pub fn to_bytes(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        match self {
            MqttPacket::Connect(p) => p.to_bytes(mqtt_version),
            MqttPacket::ConnAck(p) => p.to_bytes(mqtt_version),
            MqttPacket::Publish(p) => p.to_bytes(mqtt_version),
            MqttPacket::PubAck(p) => p.to_bytes_as(ControlPacketType::PUBACK, mqtt_version),
            MqttPacket::PubRec(p) => p.to_bytes_as(ControlPacketType::PUBREC, mqtt_version),
            MqttPacket::PubRel(p) => p.to_bytes_as(ControlPacketType::PUBREL, mqtt_version),
            MqttPacket::PubComp(p) => p.to_bytes_as(ControlPacketType::PUBCOMP, mqtt_version),
            MqttPacket::Subscribe(p) => p.to_bytes(mqtt_version),
            MqttPacket::SubAck(p) => p.to_bytes(mqtt_version),
            MqttPacket::Unsubscribe(p) => p.to_bytes(mqtt_version),
            MqttPacket::UnsubAck(p) => p.to_bytes(mqtt_version),
            MqttPacket::PingReq => Ok(vec![(ControlPacketType::PINGREQ as u8) << 4, 0]),
            MqttPacket::PingResp => Ok(vec![(ControlPacketType::PINGRESP as u8) << 4, 0]),
            MqttPacket::Disconnect(p) => p.to_bytes(mqtt_version),
            MqttPacket::Auth(p) => {
                if !is_v5(mqtt_version) {
                    return Err(ParseError::UnSuppProtoVsn);
                }
                p.to_bytes(mqtt_version)
            }
        }
    }

    pub fn from_bytes_with_version(buffer: &[u8], mqtt_version: u8) -> Result<ParseOk, ParseError> {
        if !matches!(mqtt_version, 3..=5) {
            return Err(ParseError::UnSuppProtoVsn);
        }
        let (body_start, total) = match frame(buffer)? {
            Some(found) => found,
            None => return Ok(ParseOk::Continue(1, 0)),
        };
        let flags = buffer[0] & 0x0F;
        let body = &buffer[body_start..total];
        let kind = ControlPacketType::try_from(packet_type(buffer)?)?;

        let packet = match kind {
            ControlPacketType::CONNECT => {
                MqttPacket::Connect(MqttConnect::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::CONNACK => {
                MqttPacket::ConnAck(MqttConnAck::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::PUBLISH => {
                MqttPacket::Publish(MqttPublish::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::PUBACK => {
                MqttPacket::PubAck(MqttPubResponse::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::PUBREC => {
                MqttPacket::PubRec(MqttPubResponse::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::PUBREL => {
                MqttPacket::PubRel(MqttPubResponse::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::PUBCOMP => {
                MqttPacket::PubComp(MqttPubResponse::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::SUBSCRIBE => {
                MqttPacket::Subscribe(MqttSubscribe::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::SUBACK => {
                MqttPacket::SubAck(MqttSubAck::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::UNSUBSCRIBE => {
                MqttPacket::Unsubscribe(MqttUnsubscribe::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::UNSUBACK => {
                MqttPacket::UnsubAck(MqttUnsubAck::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::PINGREQ => MqttPacket::PingReq,
            ControlPacketType::PINGRESP => MqttPacket::PingResp,
            ControlPacketType::DISCONNECT => {
                MqttPacket::Disconnect(MqttDisconnect::decode(flags, body, mqtt_version)?)
            }
            ControlPacketType::AUTH => {
                if !is_v5(mqtt_version) {
                    return Err(ParseError::InvalidPacketType);
                }
                MqttPacket::Auth(MqttAuth::decode(flags, body, mqtt_version)?)
            }
        };
        Ok(ParseOk::Packet(packet, total))
    }

    pub fn packet_type(&self) -> ControlPacketType {
        match self {
            MqttPacket::Connect(_) => ControlPacketType::CONNECT,
            MqttPacket::ConnAck(_) => ControlPacketType::CONNACK,
            MqttPacket::Publish(_) => ControlPacketType::PUBLISH,
            MqttPacket::PubAck(_) => ControlPacketType::PUBACK,
            MqttPacket::PubRec(_) => ControlPacketType::PUBREC,
            MqttPacket::PubRel(_) => ControlPacketType::PUBREL,
            MqttPacket::PubComp(_) => ControlPacketType::PUBCOMP,
            MqttPacket::Subscribe(_) => ControlPacketType::SUBSCRIBE,
            MqttPacket::SubAck(_) => ControlPacketType::SUBACK,
            MqttPacket::Unsubscribe(_) => ControlPacketType::UNSUBSCRIBE,
            MqttPacket::UnsubAck(_) => ControlPacketType::UNSUBACK,
            MqttPacket::PingReq => ControlPacketType::PINGREQ,
            MqttPacket::PingResp => ControlPacketType::PINGRESP,
            MqttPacket::Disconnect(_) => ControlPacketType::DISCONNECT,
            MqttPacket::Auth(_) => ControlPacketType::AUTH,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MqttPacket::Connect(_) => "CONNECT",
            MqttPacket::ConnAck(_) => "CONNACK",
            MqttPacket::Publish(_) => "PUBLISH",
            MqttPacket::PubAck(_) => "PUBACK",
            MqttPacket::PubRec(_) => "PUBREC",
            MqttPacket::PubRel(_) => "PUBREL",
            MqttPacket::PubComp(_) => "PUBCOMP",
            MqttPacket::Subscribe(_) => "SUBSCRIBE",
            MqttPacket::SubAck(_) => "SUBACK",
            MqttPacket::Unsubscribe(_) => "UNSUBSCRIBE",
            MqttPacket::UnsubAck(_) => "UNSUBACK",
            MqttPacket::PingReq => "PINGREQ",
            MqttPacket::PingResp => "PINGRESP",
            MqttPacket::Disconnect(_) => "DISCONNECT",
            MqttPacket::Auth(_) => "AUTH",
        }
    }

    /// Packet identifier, if this kind carries one. A QoS 0 PUBLISH has none.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            MqttPacket::Publish(p) => p.packet_id,
            MqttPacket::PubAck(p)
            | MqttPacket::PubRec(p)
            | MqttPacket::PubRel(p)
            | MqttPacket::PubComp(p) => Some(p.packet_id),
            MqttPacket::Subscribe(p) => Some(p.packet_id),
            MqttPacket::SubAck(p) => Some(p.packet_id),
            MqttPacket::Unsubscribe(p) => Some(p.packet_id),
            MqttPacket::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    pub fn set_packet_id(&mut self, id: u16) {
        match self {
            MqttPacket::Publish(p) => p.packet_id = Some(id),
            MqttPacket::PubAck(p)
            | MqttPacket::PubRec(p)
            | MqttPacket::PubRel(p)
            | MqttPacket::PubComp(p) => p.packet_id = id,
            MqttPacket::Subscribe(p) => p.packet_id = id,
            MqttPacket::SubAck(p) => p.packet_id = id,
            MqttPacket::Unsubscribe(p) => p.packet_id = id,
            MqttPacket::UnsubAck(p) => p.packet_id = id,
            _ => {}
        }
    }

    /// Whether an identifier has to be allocated before this packet is sent.
    /// QoS 0 publishes get one as well: it keys their token while queued but
    /// is never written to the wire.
    pub fn needs_packet_id(&self) -> bool {
        match self {
            MqttPacket::Publish(_) => true,
            MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => true,
            _ => false,
        }
    }

    pub fn set_dup(&mut self, dup: bool) {
        if let MqttPacket::Publish(p) = self {
            p.dup = dup;
        }
    }

    /// Packets that answer an earlier outbound packet.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            MqttPacket::ConnAck(_)
                | MqttPacket::PubAck(_)
                | MqttPacket::PubRec(_)
                | MqttPacket::PubComp(_)
                | MqttPacket::SubAck(_)
                | MqttPacket::UnsubAck(_)
                | MqttPacket::PingResp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacketType {
    CONNECT = 1,
    CONNACK = 2,
    PUBLISH = 3,
    PUBACK = 4,
    PUBREC = 5,
    PUBREL = 6,
    PUBCOMP = 7,
    SUBSCRIBE = 8,
    SUBACK = 9,
    UNSUBSCRIBE = 10,
    UNSUBACK = 11,
    PINGREQ = 12,
    PINGRESP = 13,
    DISCONNECT = 14,
    AUTH = 15,
}

impl TryFrom<u8> for ControlPacketType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlPacketType::CONNECT),
            2 => Ok(ControlPacketType::CONNACK),
            3 => Ok(ControlPacketType::PUBLISH),
            4 => Ok(ControlPacketType::PUBACK),
            5 => Ok(ControlPacketType::PUBREC),
            6 => Ok(ControlPacketType::PUBREL),
            7 => Ok(ControlPacketType::PUBCOMP),
            8 => Ok(ControlPacketType::SUBSCRIBE),
            9 => Ok(ControlPacketType::SUBACK),
            10 => Ok(ControlPacketType::UNSUBSCRIBE),
            11 => Ok(ControlPacketType::UNSUBACK),
            12 => Ok(ControlPacketType::PINGREQ),
            13 => Ok(ControlPacketType::PINGRESP),
            14 => Ok(ControlPacketType::DISCONNECT),
            15 => Ok(ControlPacketType::AUTH),
            _ => Err(ParseError::InvalidPacketType),
        }
    }
}

pub(crate) fn is_v5(mqtt_version: u8) -> bool {
    mqtt_version >= 5
}

/// Prepends the fixed header (MQTT 5.0: 2.1.1) to an encoded body.
pub(crate) fn with_fixed_header(first_byte: u8, body: Vec<u8>) -> Result<Vec<u8>, ParseError> {
    let len = VariableByteInteger::encode(body.len())?;
    let mut bytes = Vec::with_capacity(1 + len.len() + body.len());
    bytes.push(first_byte);
    bytes.extend(len);
    bytes.extend(body);
    Ok(bytes)
}

pub trait MqttControlPacket: Sized {
    // MQTT 5.0: 2.1.2, MQTT control packet type
    fn control_packet_type(&self) -> u8;

    // MQTT 5.0: 2.1.3, Flags in the fixed header
    fn flags(&self) -> u8 {
        0u8
    }

    fn variable_header(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError>;

    fn payload(&self, _mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    /// Decodes the packet from its fixed header flags and body.
    fn decode(flags: u8, body: &[u8], mqtt_version: u8) -> Result<Self, ParseError>;

    fn to_bytes(&self, mqtt_version: u8) -> Result<Vec<u8>, ParseError> {
        let mut body = self.variable_header(mqtt_version)?;
        body.extend(self.payload(mqtt_version)?);
        with_fixed_header(self.control_packet_type() << 4 | self.flags(), body)
    }
}
