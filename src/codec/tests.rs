//! MQTT Codec Tests
//!
//! Round-trips for each packet type across v3.1.1 and v5 wire shapes, plus
//! malformed-input rejection.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck,
    Unsubscribe, Will,
};

fn encode_packet(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let encoder = Encoder::new(version);
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8], version: Option<ProtocolVersion>) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    if let Some(v) = version {
        decoder.set_protocol_version(v);
    }
    match decoder.decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

#[test]
fn test_connect_v311_minimal() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: String::new(),
        clean_start: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, None).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_connect_v311_full() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "test-client-123".to_string(),
        clean_start: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from("password")),
        will: Some(Will {
            topic: "last/will/topic".to_string(),
            payload: Bytes::from("goodbye"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, None).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_connect_v5_variant_byte_only() {
    // v5 only changes the protocol version byte; the rest of the wire shape
    // is identical to v3.1.1.
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "client-v5".to_string(),
        clean_start: true,
        keep_alive: 30,
        username: Some("alice".to_string()),
        password: None,
        will: None,
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V5);
    let decoded = decode_packet(&encoded, None).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_connect_rejects_bad_protocol_name() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x09]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQXX");
    buf.extend_from_slice(&[0x04, 0x02, 0x00, 0x00]);

    let err = decode_packet(&buf, None).unwrap_err();
    assert_eq!(err, DecodeError::InvalidProtocolName);
}

#[test]
fn test_connect_rejects_unknown_protocol_version() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x09]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQTT");
    buf.extend_from_slice(&[0x07, 0x02, 0x00, 0x00]);

    let err = decode_packet(&buf, None).unwrap_err();
    assert_eq!(err, DecodeError::InvalidProtocolVersion(7));
}

#[test]
fn test_connect_username_without_password_flag_rejected() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0B]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQTT");
    // password flag set (0x40) while username flag is clear
    buf.extend_from_slice(&[0x04, 0x40, 0x00, 0x00, 0x00, 0x00]);

    let err = decode_packet(&buf, None).unwrap_err();
    assert_eq!(err, DecodeError::InvalidFlags);
}

#[test]
fn test_connack_accepted() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_connack_refused() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: false,
        return_code: ConnectReturnCode::NotAuthorized,
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_publish_qos0_no_packet_id() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: std::sync::Arc::from("sensors/temp"),
        packet_id: None,
        payload: Bytes::from("21.5"),
    });

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_publish_qos1_round_trip() {
    let packet = Packet::Publish(Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: std::sync::Arc::from("sensors/humidity"),
        packet_id: Some(42),
        payload: Bytes::from("55"),
    });

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_publish_rejects_wildcard_topic() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: std::sync::Arc::from("sensors/+"),
        packet_id: None,
        payload: Bytes::new(),
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let err = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap_err();
    assert!(matches!(err, DecodeError::MalformedPacket(_)));
}

#[test]
fn test_publish_qos0_dup_rejected() {
    // DUP flag set with QoS 0 bits (invalid per MQTT-3.3.1-2)
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x38, 0x06]); // PUBLISH, dup=1, qos=0
    buf.extend_from_slice(&[0x00, 0x02]);
    buf.extend_from_slice(b"ab");

    let err = decode_packet(&buf, Some(ProtocolVersion::V311)).unwrap_err();
    assert!(matches!(err, DecodeError::MalformedPacket(_)));
}

#[test]
fn test_puback_round_trip() {
    let packet = Packet::PubAck(PubAck::new(7));
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_pubrec_pubrel_pubcomp_round_trip() {
    let pubrec = Packet::PubRec(PubRec::new(3));
    let pubrel = Packet::PubRel(PubRel::new(3));
    let pubcomp = Packet::PubComp(PubComp::new(3));

    for packet in [pubrec, pubrel, pubcomp] {
        let encoded = encode_packet(&packet, ProtocolVersion::V311);
        let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
        assert_eq!(packet, decoded);
    }
}

#[test]
fn test_pubrel_requires_reserved_flags() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x60, 0x02]); // PUBREL with flags 0000, should be 0010
    buf.extend_from_slice(&[0x00, 0x01]);

    let err = decode_packet(&buf, Some(ProtocolVersion::V311)).unwrap_err();
    assert_eq!(err, DecodeError::InvalidFlags);
}

#[test]
fn test_subscribe_multi_filter_round_trip() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 10,
        subscriptions: vec![
            Subscription {
                filter: "a/b".to_string(),
                qos: QoS::AtMostOnce,
            },
            Subscription {
                filter: "a/+/c".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    });

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_subscribe_requires_at_least_one_filter() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x82, 0x02]);
    buf.extend_from_slice(&[0x00, 0x01]);

    let err = decode_packet(&buf, Some(ProtocolVersion::V311)).unwrap_err();
    assert!(matches!(err, DecodeError::MalformedPacket(_)));
}

#[test]
fn test_suback_round_trip() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubscribeReturnCode::GrantedQoS0,
            SubscribeReturnCode::GrantedQoS2,
            SubscribeReturnCode::Failure,
        ],
    });

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_unsubscribe_unsuback_round_trip() {
    let packet = Packet::Unsubscribe(Unsubscribe {
        packet_id: 22,
        filters: vec!["a/b".to_string(), "c/d".to_string()],
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);

    let unsuback = Packet::UnsubAck(UnsubAck { packet_id: 22 });
    let encoded = encode_packet(&unsuback, ProtocolVersion::V311);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(unsuback, decoded);
}

#[test]
fn test_pingreq_pingresp_round_trip() {
    let req = Packet::PingReq;
    let resp = Packet::PingResp;
    for packet in [req, resp] {
        let encoded = encode_packet(&packet, ProtocolVersion::V311);
        let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
        assert_eq!(packet, decoded);
    }
}

#[test]
fn test_disconnect_round_trip() {
    let packet = Packet::Disconnect;
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(&encoded[..], &[0xE0, 0x00]);
    let decoded = decode_packet(&encoded, Some(ProtocolVersion::V311)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_decode_returns_none_on_partial_packet() {
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    // Fixed header declares 10 remaining bytes but buffer only has 3.
    let buf = [0x30u8, 0x0A, 0x00];
    assert_eq!(decoder.decode(&buf).unwrap(), None);
}

#[test]
fn test_decode_rejects_oversized_packet() {
    let mut decoder = Decoder::new().with_max_packet_size(4);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x30, 0x0A]);
    buf.extend_from_slice(&[0; 10]);

    let err = decoder.decode(&buf).unwrap_err();
    assert_eq!(err, DecodeError::PacketTooLarge);
}

#[test]
fn test_variable_length_encoding_boundaries() {
    use crate::codec::{read_variable_int, write_variable_int};
    use bytes::BytesMut;

    for &value in &[0u32, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152] {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
    }
}
