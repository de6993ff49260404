//! Behaviour that differs between MQTT 3.1.1 and MQTT 5.0 sessions.
//!
//! The session engine is written once; everything version specific that is
//! not pure encoding goes through [`ProtocolDialect`].

use std::sync::Arc;

use super::error::MqttClientError;
use crate::mqtt_serde::connect::MqttConnAck;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::disconnect::MqttDisconnect;
use crate::mqtt_serde::properties::{reason_string, receive_maximum};
use crate::mqtt_serde::publish::MqttPubResponse;
use crate::mqtt_serde::{MQTT_V311, MQTT_V5};

/// MQTT 5.0: 2.4, "Packet Identifier not found"
pub const PACKET_ID_NOT_FOUND: u8 = 0x92;

pub trait ProtocolDialect: Send + Sync {
    fn version(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Reply to a PUBREC whose packet id has no outstanding publish.
    fn orphaned_pubrec_reply(&self, packet_id: u16) -> Option<MqttPacket>;

    /// Reply to a PUBREL whose packet id has no inbound QoS 2 record.
    fn orphaned_pubrel_reply(&self, packet_id: u16) -> MqttPacket;

    /// Failure carried by a publish acknowledgement, if the dialect has
    /// reason codes.
    fn ack_failure(&self, ack: &MqttPubResponse) -> Option<MqttClientError>;

    /// Upper bound the server puts on our in-flight window.
    fn receive_maximum(&self, connack: &MqttConnAck) -> Option<u16>;

    fn disconnect(&self, reason_code: u8) -> MqttPacket;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MqttV311;

impl ProtocolDialect for MqttV311 {
    fn version(&self) -> u8 {
        MQTT_V311
    }

    fn name(&self) -> &'static str {
        "MQTT 3.1.1"
    }

    // already completed, most likely a retransmission
    fn orphaned_pubrec_reply(&self, _packet_id: u16) -> Option<MqttPacket> {
        None
    }

    fn orphaned_pubrel_reply(&self, packet_id: u16) -> MqttPacket {
        MqttPacket::PubComp(MqttPubResponse::new(packet_id, 0))
    }

    fn ack_failure(&self, _ack: &MqttPubResponse) -> Option<MqttClientError> {
        None
    }

    fn receive_maximum(&self, _connack: &MqttConnAck) -> Option<u16> {
        None
    }

    fn disconnect(&self, _reason_code: u8) -> MqttPacket {
        MqttPacket::Disconnect(MqttDisconnect::default())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MqttV5;

impl ProtocolDialect for MqttV5 {
    fn version(&self) -> u8 {
        MQTT_V5
    }

    fn name(&self) -> &'static str {
        "MQTT 5.0"
    }

    fn orphaned_pubrec_reply(&self, packet_id: u16) -> Option<MqttPacket> {
        Some(MqttPacket::PubRel(MqttPubResponse::new(
            packet_id,
            PACKET_ID_NOT_FOUND,
        )))
    }

    fn orphaned_pubrel_reply(&self, packet_id: u16) -> MqttPacket {
        MqttPacket::PubComp(MqttPubResponse::new(packet_id, PACKET_ID_NOT_FOUND))
    }

    fn ack_failure(&self, ack: &MqttPubResponse) -> Option<MqttClientError> {
        ack.is_failure().then(|| MqttClientError::PublishFailed {
            packet_id: Some(ack.packet_id),
            reason_code: ack.reason_code,
            reason_string: reason_string(&ack.properties).map(str::to_string),
        })
    }

    fn receive_maximum(&self, connack: &MqttConnAck) -> Option<u16> {
        receive_maximum(&connack.properties)
    }

    fn disconnect(&self, reason_code: u8) -> MqttPacket {
        MqttPacket::Disconnect(MqttDisconnect::new(reason_code))
    }
}

pub fn dialect_for(mqtt_version: u8) -> Arc<dyn ProtocolDialect> {
    if mqtt_version == MQTT_V5 {
        Arc::new(MqttV5)
    } else {
        Arc::new(MqttV311)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_serde::properties::Property;

    #[test]
    fn test_orphaned_ack_replies() {
        let v3 = dialect_for(4);
        assert_eq!(v3.version(), 4);
        assert!(v3.orphaned_pubrec_reply(7).is_none());
        assert_eq!(
            v3.orphaned_pubrel_reply(7),
            MqttPacket::PubComp(MqttPubResponse::new(7, 0))
        );

        let v5 = dialect_for(5);
        assert_eq!(
            v5.orphaned_pubrec_reply(7),
            Some(MqttPacket::PubRel(MqttPubResponse::new(7, 0x92)))
        );
        assert_eq!(
            v5.orphaned_pubrel_reply(7),
            MqttPacket::PubComp(MqttPubResponse::new(7, 0x92))
        );
    }

    #[test]
    fn test_ack_failure_and_receive_maximum() {
        let ack = MqttPubResponse {
            packet_id: 4,
            reason_code: 0x87,
            properties: vec![Property::ReasonString("denied".into())],
        };
        assert!(MqttV311.ack_failure(&ack).is_none());
        match MqttV5.ack_failure(&ack) {
            Some(MqttClientError::PublishFailed {
                packet_id,
                reason_code,
                reason_string,
            }) => {
                assert_eq!(packet_id, Some(4));
                assert_eq!(reason_code, 0x87);
                assert_eq!(reason_string.as_deref(), Some("denied"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(MqttV5.ack_failure(&MqttPubResponse::new(4, 0x10)).is_none());

        let mut connack = MqttConnAck::new(false, 0);
        connack.properties.push(Property::ReceiveMaximum(3));
        assert_eq!(MqttV5.receive_maximum(&connack), Some(3));
        assert_eq!(MqttV311.receive_maximum(&connack), None);
    }
}
