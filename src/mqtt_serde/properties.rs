// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::{BinaryData, Utf8String, VariableByteInteger};
use crate::mqtt_serde::parser::{Cursor, ParseError};

pub type Properties = Vec<Property>;

// MQTT 5.0: 2.2.2.2
mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0b;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1a;
    pub const SERVER_REFERENCE: u8 = 0x1c;
    pub const REASON_STRING: u8 = 0x1f;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2a;
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Vec<u8>),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Vec<u8>),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        match self {
            Property::PayloadFormatIndicator(v) => byte(out, id::PAYLOAD_FORMAT_INDICATOR, *v),
            Property::MessageExpiryInterval(v) => four(out, id::MESSAGE_EXPIRY_INTERVAL, *v),
            Property::ContentType(v) => string(out, id::CONTENT_TYPE, v)?,
            Property::ResponseTopic(v) => string(out, id::RESPONSE_TOPIC, v)?,
            Property::CorrelationData(v) => binary(out, id::CORRELATION_DATA, v)?,
            Property::SubscriptionIdentifier(v) => {
                out.push(id::SUBSCRIPTION_IDENTIFIER);
                out.extend(VariableByteInteger::encode(*v)?);
            }
            Property::SessionExpiryInterval(v) => four(out, id::SESSION_EXPIRY_INTERVAL, *v),
            Property::AssignedClientIdentifier(v) => {
                string(out, id::ASSIGNED_CLIENT_IDENTIFIER, v)?
            }
            Property::ServerKeepAlive(v) => two(out, id::SERVER_KEEP_ALIVE, *v),
            Property::AuthenticationMethod(v) => string(out, id::AUTHENTICATION_METHOD, v)?,
            Property::AuthenticationData(v) => binary(out, id::AUTHENTICATION_DATA, v)?,
            Property::RequestProblemInformation(v) => {
                byte(out, id::REQUEST_PROBLEM_INFORMATION, *v)
            }
            Property::WillDelayInterval(v) => four(out, id::WILL_DELAY_INTERVAL, *v),
            Property::RequestResponseInformation(v) => {
                byte(out, id::REQUEST_RESPONSE_INFORMATION, *v)
            }
            Property::ResponseInformation(v) => string(out, id::RESPONSE_INFORMATION, v)?,
            Property::ServerReference(v) => string(out, id::SERVER_REFERENCE, v)?,
            Property::ReasonString(v) => string(out, id::REASON_STRING, v)?,
            Property::ReceiveMaximum(v) => two(out, id::RECEIVE_MAXIMUM, *v),
            Property::TopicAliasMaximum(v) => two(out, id::TOPIC_ALIAS_MAXIMUM, *v),
            Property::TopicAlias(v) => two(out, id::TOPIC_ALIAS, *v),
            Property::MaximumQoS(v) => byte(out, id::MAXIMUM_QOS, *v),
            Property::RetainAvailable(v) => byte(out, id::RETAIN_AVAILABLE, *v),
            Property::UserProperty(k, v) => {
                out.push(id::USER_PROPERTY);
                out.extend(Utf8String::encode(k)?);
                out.extend(Utf8String::encode(v)?);
            }
            Property::MaximumPacketSize(v) => four(out, id::MAXIMUM_PACKET_SIZE, *v),
            Property::WildcardSubscriptionAvailable(v) => {
                byte(out, id::WILDCARD_SUBSCRIPTION_AVAILABLE, *v)
            }
            Property::SubscriptionIdentifierAvailable(v) => {
                byte(out, id::SUBSCRIPTION_IDENTIFIER_AVAILABLE, *v)
            }
            Property::SharedSubscriptionAvailable(v) => {
                byte(out, id::SHARED_SUBSCRIPTION_AVAILABLE, *v)
            }
        }
        Ok(())
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Property, ParseError> {
        let prop_id = cur.vbi()?;
        let prop_id = u8::try_from(prop_id).map_err(|_| ParseError::InvalidPropertyId)?;
        let prop = match prop_id {
            id::PAYLOAD_FORMAT_INDICATOR => Property::PayloadFormatIndicator(cur.u8()?),
            id::MESSAGE_EXPIRY_INTERVAL => Property::MessageExpiryInterval(cur.u32()?),
            id::CONTENT_TYPE => Property::ContentType(cur.utf8()?),
            id::RESPONSE_TOPIC => Property::ResponseTopic(cur.utf8()?),
            id::CORRELATION_DATA => Property::CorrelationData(cur.binary()?),
            id::SUBSCRIPTION_IDENTIFIER => Property::SubscriptionIdentifier(cur.vbi()? as u32),
            id::SESSION_EXPIRY_INTERVAL => Property::SessionExpiryInterval(cur.u32()?),
            id::ASSIGNED_CLIENT_IDENTIFIER => Property::AssignedClientIdentifier(cur.utf8()?),
            id::SERVER_KEEP_ALIVE => Property::ServerKeepAlive(cur.u16()?),
            id::AUTHENTICATION_METHOD => Property::AuthenticationMethod(cur.utf8()?),
            id::AUTHENTICATION_DATA => Property::AuthenticationData(cur.binary()?),
            id::REQUEST_PROBLEM_INFORMATION => Property::RequestProblemInformation(cur.u8()?),
            id::WILL_DELAY_INTERVAL => Property::WillDelayInterval(cur.u32()?),
            id::REQUEST_RESPONSE_INFORMATION => Property::RequestResponseInformation(cur.u8()?),
            id::RESPONSE_INFORMATION => Property::ResponseInformation(cur.utf8()?),
            id::SERVER_REFERENCE => Property::ServerReference(cur.utf8()?),
            id::REASON_STRING => Property::ReasonString(cur.utf8()?),
            id::RECEIVE_MAXIMUM => Property::ReceiveMaximum(cur.u16()?),
            id::TOPIC_ALIAS_MAXIMUM => Property::TopicAliasMaximum(cur.u16()?),
            id::TOPIC_ALIAS => Property::TopicAlias(cur.u16()?),
            id::MAXIMUM_QOS => Property::MaximumQoS(cur.u8()?),
            id::RETAIN_AVAILABLE => Property::RetainAvailable(cur.u8()?),
            id::USER_PROPERTY => {
                let key = cur.utf8()?;
                let value = cur.utf8()?;
                Property::UserProperty(key, value)
            }
            id::MAXIMUM_PACKET_SIZE => Property::MaximumPacketSize(cur.u32()?),
            id::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                Property::WildcardSubscriptionAvailable(cur.u8()?)
            }
            id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                Property::SubscriptionIdentifierAvailable(cur.u8()?)
            }
            id::SHARED_SUBSCRIPTION_AVAILABLE => Property::SharedSubscriptionAvailable(cur.u8()?),
            _ => return Err(ParseError::InvalidPropertyId),
        };
        Ok(prop)
    }
}

fn byte(out: &mut Vec<u8>, prop_id: u8, v: u8) {
    out.push(prop_id);
    out.push(v);
}

fn two(out: &mut Vec<u8>, prop_id: u8, v: u16) {
    out.push(prop_id);
    out.extend_from_slice(&v.to_be_bytes());
}

fn four(out: &mut Vec<u8>, prop_id: u8, v: u32) {
    out.push(prop_id);
    out.extend_from_slice(&v.to_be_bytes());
}

fn string(out: &mut Vec<u8>, prop_id: u8, v: &str) -> Result<(), ParseError> {
    out.push(prop_id);
    out.extend(Utf8String::encode(v)?);
    Ok(())
}

fn binary(out: &mut Vec<u8>, prop_id: u8, v: &[u8]) -> Result<(), ParseError> {
    out.push(prop_id);
    out.extend(BinaryData::encode(v)?);
    Ok(())
}

/// Encodes a property block: length as VBI followed by each property.
pub fn encode_properties_hdr(properties: &[Property]) -> Result<Vec<u8>, ParseError> {
    let mut props = Vec::new();
    for p in properties {
        p.encode(&mut props)?;
    }
    let mut bytes = VariableByteInteger::encode(props.len())?;
    bytes.extend(props);
    Ok(bytes)
}

pub(crate) fn decode_properties_hdr(cur: &mut Cursor<'_>) -> Result<Properties, ParseError> {
    let len = cur.vbi()?;
    if cur.remaining() < len {
        return Err(ParseError::IncompleteProperty);
    }
    let mut block = Cursor::new(cur.take(len)?);
    let mut properties = Vec::new();
    while !block.is_empty() {
        properties.push(Property::decode(&mut block)?);
    }
    Ok(properties)
}

pub fn receive_maximum(properties: &[Property]) -> Option<u16> {
    properties.iter().find_map(|p| match p {
        Property::ReceiveMaximum(v) => Some(*v),
        _ => None,
    })
}

pub fn reason_string(properties: &[Property]) -> Option<&str> {
    properties.iter().find_map(|p| match p {
        Property::ReasonString(v) => Some(v.as_str()),
        _ => None,
    })
}

pub fn assigned_client_identifier(properties: &[Property]) -> Option<&str> {
    properties.iter().find_map(|p| match p {
        Property::AssignedClientIdentifier(v) => Some(v.as_str()),
        _ => None,
    })
}
