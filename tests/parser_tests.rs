// SPDX-License-Identifier: MPL-2.0

// Integration tests for the MQTT codec: framing, the base data types and
// the incremental parser, run against captured wire bytes.

use std::io::Cursor;

use flowlink::mqtt_serde::base_data::{Utf8String, VariableByteInteger, VBI_MAX};
use flowlink::mqtt_serde::connect::MqttConnect;
use flowlink::mqtt_serde::control_packet::MqttPacket;
use flowlink::mqtt_serde::disconnect::MqttDisconnect;
use flowlink::mqtt_serde::parser::stream::{MqttParser, MqttStream};
use flowlink::mqtt_serde::parser::{packet_type, parse_remaining_length, ParseError};
use flowlink::mqtt_serde::properties::Property;
use flowlink::mqtt_serde::publish::MqttPublish;

// v5 CONNECT, clean start, keep alive 300, session expiry 0,
// client id "quic_bench_pub_1"
const V5_CONNECT: &str = "102200044d5154540502012c05110000000000107175\
                          69635f62656e63685f7075625f31";

fn v3_connect() -> Vec<u8> {
    MqttPacket::Connect(MqttConnect::new("tester", 60, true))
        .to_bytes(4)
        .unwrap()
}

#[test]
fn test_packet_type() {
    assert_eq!(packet_type(&[0x10, 0x00]).unwrap(), 1);
    assert_eq!(packet_type(&[0x32]).unwrap(), 3);
    assert_eq!(packet_type(&[0xc0, 0x00]).unwrap(), 12);
    assert_eq!(packet_type(&[0xe0, 0x00]).unwrap(), 14);
    assert!(matches!(packet_type(&[]), Err(ParseError::BufferTooShort)));
}

#[test]
fn test_parse_remaining_length() {
    assert_eq!(parse_remaining_length(&[0x00]).unwrap(), (0, 1));
    assert_eq!(parse_remaining_length(&[0x7f]).unwrap(), (127, 1));
    assert_eq!(parse_remaining_length(&[0x80, 0x01]).unwrap(), (128, 2));
    assert_eq!(
        parse_remaining_length(&[0xff, 0xff, 0xff, 0x7f]).unwrap(),
        (VBI_MAX as usize, 4)
    );
    // continuation bit set with nothing after it
    assert!(matches!(
        parse_remaining_length(&[0x80]),
        Err(ParseError::More(_, _))
    ));
    // a fifth length byte is never valid
    assert!(parse_remaining_length(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
}

#[test]
fn test_variable_byte_integer_bounds() {
    for value in [0u32, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, VBI_MAX] {
        let encoded = VariableByteInteger::encode(value).unwrap();
        assert_eq!(encoded.len(), VariableByteInteger::encoded_len(value));
        assert_eq!(
            VariableByteInteger::decode(&encoded).unwrap(),
            (value as usize, encoded.len())
        );
    }

    assert!(matches!(
        VariableByteInteger::encode(-1i64),
        Err(ParseError::InvalidVariableByteInteger)
    ));
    assert!(matches!(
        VariableByteInteger::encode(268_435_456u32),
        Err(ParseError::InvalidVariableByteInteger)
    ));
}

#[test]
fn test_utf8_string_multibyte() {
    // two, three and four byte sequences
    for s in ["", "caf\u{e9}", "\u{6e29}\u{5ea6}/\u{2103}", "\u{1f321}/sensor"] {
        let encoded = Utf8String::encode(s).unwrap();
        assert_eq!(encoded[..2], (s.len() as u16).to_be_bytes());
        let (decoded, consumed) = Utf8String::decode(&encoded).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(consumed, s.len() + 2);
    }
}

#[test]
fn test_utf8_string_from_utf16() {
    // U+1F321 as a surrogate pair
    let units = [0xd83c, 0xdf21, 0x002f, 0x0061];
    let s = Utf8String::from_utf16(&units).unwrap();
    assert_eq!(s, "\u{1f321}/a");
    let (decoded, _) = Utf8String::decode(&Utf8String::encode(&s).unwrap()).unwrap();
    assert_eq!(decoded, s);

    // lone high surrogate, lone low surrogate
    assert!(Utf8String::from_utf16(&[0x0061, 0xd83c]).is_err());
    assert!(Utf8String::from_utf16(&[0xdf21, 0x0061]).is_err());
    assert!(Utf8String::from_utf16(&[0x0061, 0x0000]).is_err());
}

#[test]
fn test_utf8_string_rejects_control_characters() {
    assert!(Utf8String::encode("a\u{0}b").is_err());
    assert!(Utf8String::encode("line\nbreak").is_err());
    assert!(Utf8String::encode("del\u{7f}").is_err());
    assert!(Utf8String::encode("c1\u{85}").is_err());

    // the same checks apply on the way in
    let wire = [0x00, 0x03, b'a', 0x07, b'b'];
    assert!(Utf8String::decode(&wire).is_err());
    // overlong encoding of '/' is not valid UTF-8
    let wire = [0x00, 0x02, 0xc0, 0xaf];
    assert!(matches!(
        Utf8String::decode(&wire),
        Err(ParseError::FromUtf8Error(_))
    ));
}

#[test]
fn test_parse_v5_connect_capture() {
    let bytes = hex::decode(V5_CONNECT).unwrap();
    let mut parser = MqttParser::new(1024, 5);
    parser.feed(&bytes);
    let (packet, consumed) = parser.next_packet().unwrap().unwrap();
    assert_eq!(consumed, bytes.len());

    let MqttPacket::Connect(connect) = packet else {
        panic!("expected CONNECT, got {:?}", packet);
    };
    assert_eq!(connect.protocol_version, 5);
    assert_eq!(connect.client_id, "quic_bench_pub_1");
    assert_eq!(connect.keep_alive, 300);
    assert!(connect.clean_start);
    assert_eq!(connect.properties, vec![Property::SessionExpiryInterval(0)]);
}

#[test]
fn test_parser_partial_feed() {
    for (version, bytes) in [(4, v3_connect()), (5, hex::decode(V5_CONNECT).unwrap())] {
        let mut parser = MqttParser::new(1024, version);
        let split = bytes.len() / 2;

        parser.feed(&bytes[..split]);
        assert!(parser.next_packet().unwrap().is_none());
        assert_eq!(parser.buffered(), split);

        parser.feed(&bytes[split..]);
        let (packet, consumed) = parser.next_packet().unwrap().unwrap();
        assert!(matches!(packet, MqttPacket::Connect(_)));
        assert_eq!(consumed, bytes.len());
        assert_eq!(parser.buffered(), 0);
        assert!(parser.next_packet().unwrap().is_none());
    }
}

#[test]
fn test_parser_multiple_packets() {
    for version in [4u8, 5] {
        let mut publish = MqttPublish::new(1, "sensors/1/temp", b"21.5".to_vec());
        publish.packet_id = Some(42);

        let mut bytes = MqttPacket::Connect(MqttConnect::new("tester", 60, true))
            .to_bytes(version)
            .unwrap();
        bytes.extend(MqttPacket::PingReq.to_bytes(version).unwrap());
        bytes.extend(MqttPacket::Publish(publish.clone()).to_bytes(version).unwrap());
        bytes.extend(
            MqttPacket::Disconnect(MqttDisconnect::new(0))
                .to_bytes(version)
                .unwrap(),
        );

        let mut parser = MqttParser::new(1024, version);
        parser.feed(&bytes);

        let mut packets = Vec::new();
        while let Some((packet, _)) = parser.next_packet().unwrap() {
            packets.push(packet);
        }
        assert_eq!(packets.len(), 4, "version {}", version);
        assert!(matches!(packets[0], MqttPacket::Connect(_)));
        assert_eq!(packets[1], MqttPacket::PingReq);
        assert_eq!(packets[2], MqttPacket::Publish(publish));
        assert!(matches!(packets[3], MqttPacket::Disconnect(_)));
        assert_eq!(parser.buffered(), 0);
    }
}

#[test]
fn test_parser_rejects_malformed() {
    // packet type 0 is reserved
    let mut parser = MqttParser::new(64, 4);
    parser.feed(&[0x00, 0x00]);
    assert!(parser.next_packet().is_err());

    // five byte remaining length
    let mut parser = MqttParser::new(64, 4);
    parser.feed(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x01]);
    assert!(parser.next_packet().is_err());

    let mut parser = MqttParser::new(64, 9);
    parser.feed(&[0xc0, 0x00]);
    assert!(matches!(
        parser.next_packet(),
        Err(ParseError::UnSuppProtoVsn)
    ));
}

#[test]
fn test_stream_over_reader() {
    let mut bytes = v3_connect();
    // PUBACK 7, PINGRESP
    bytes.extend(hex::decode("40020007d000").unwrap());

    let stream = MqttStream::new(Cursor::new(bytes), 16, 4);
    let packets: Vec<MqttPacket> = stream.map(|p| p.unwrap()).collect();
    assert_eq!(packets.len(), 3);
    assert!(matches!(&packets[0], MqttPacket::Connect(c) if c.client_id == "tester"));
    assert_eq!(packets[1].packet_id(), Some(7));
    assert_eq!(packets[2], MqttPacket::PingResp);
}

#[test]
fn test_stream_truncated_packet_is_eof() {
    let bytes = v3_connect();
    let mut stream = MqttStream::new(Cursor::new(bytes[..bytes.len() - 1].to_vec()), 16, 4);
    assert!(stream.read_packet().unwrap().is_none());
}
