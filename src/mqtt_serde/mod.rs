// SPDX-License-Identifier: MPL-2.0

pub mod base_data;
pub mod connect;
pub mod control_packet;
pub mod disconnect;
pub mod parser;
pub mod properties;
pub mod publish;
pub mod subscribe;
pub mod topic;

//re export
pub use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
pub use crate::mqtt_serde::parser::stream::{MqttParser, MqttStream};
pub use crate::mqtt_serde::parser::ParseError;

/// Protocol level of MQTT v3.1.1 as carried in CONNECT.
pub const MQTT_V311: u8 = 4;
/// Protocol level of MQTT v5.0.
pub const MQTT_V5: u8 = 5;
