//! MQTT Packet Decoder
//!
//! Decodes MQTT packets for v3.1, v3.1.1 and v5.0. No Properties parsing:
//! v5 only changes the CONNECT protocol version byte.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
    /// Current protocol version (set after CONNECT)
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed) or error
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        // Read remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = 1 + len_bytes + remaining_length as usize;

        // Check packet size limit
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload_start = 1 + len_bytes;
        let payload = &buf[payload_start..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(payload)?,
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => self.decode_puback(flags, payload)?,
            5 => self.decode_pubrec(flags, payload)?,
            6 => self.decode_pubrel(flags, payload)?,
            7 => self.decode_pubcomp(flags, payload)?,
            8 => self.decode_subscribe(flags, payload)?,
            9 => self.decode_suback(flags, payload)?,
            10 => self.decode_unsubscribe(flags, payload)?,
            11 => self.decode_unsuback(flags, payload)?,
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingReq
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, payload)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&mut self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        // Protocol name
        let (protocol_name, len) = read_string(&payload[pos..])?;
        pos += len;

        if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        // Protocol version
        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let version_byte = payload[pos];
        pos += 1;

        let protocol_version = ProtocolVersion::from_u8(version_byte)
            .ok_or(DecodeError::InvalidProtocolVersion(version_byte))?;

        self.protocol_version = Some(protocol_version);

        // Connect flags
        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let connect_flags = payload[pos];
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        // Validate will QoS
        if will_qos > 2 {
            return Err(DecodeError::InvalidQoS(will_qos));
        }

        // If will flag is 0, will QoS and will retain must be 0
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        // Keep alive
        if pos + 2 > payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;

        // Client ID
        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        // Will message
        let will = if will_flag {
            let (will_topic, len) = read_string(&payload[pos..])?;
            pos += len;

            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: will_topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: QoS::from_u8(will_qos).unwrap(),
                retain: will_retain,
            })
        } else {
            None
        };

        // Username
        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        // Password
        let password = if password_flag {
            let (data, _len) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_start,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        // Only bit 0 is valid (session present), rest must be 0
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let session_present = (acknowledge_flags & 0x01) != 0;
        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::MalformedPacket("invalid CONNACK return code"))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        // Topic name
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        // Validate topic (no wildcards allowed in PUBLISH)
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        // Packet ID (only for QoS > 0)
        let packet_id = if qos != QoS::AtMostOnce {
            if pos + 2 > payload.len() {
                return Err(DecodeError::InsufficientData);
            }
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        // Payload (remainder)
        let message_payload = Bytes::copy_from_slice(&payload[pos..]);

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: message_payload,
        }))
    }

    fn decode_puback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(Packet::PubAck(PubAck::new(packet_id)))
    }

    fn decode_pubrec(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(Packet::PubRec(PubRec::new(packet_id)))
    }

    fn decode_pubrel(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // PUBREL must have flags 0010
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(Packet::PubRel(PubRel::new(packet_id)))
    }

    fn decode_pubcomp(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(Packet::PubComp(PubComp::new(packet_id)))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // SUBSCRIBE must have flags 0010
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let mut pos = 2;

        // Subscriptions
        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            // [MQTT-4.7.0-1] Topic filter cannot be empty
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            if pos >= payload.len() {
                return Err(DecodeError::InsufficientData);
            }

            let options_byte = payload[pos];
            pos += 1;

            let qos = QoS::from_u8(options_byte & 0x03)
                .ok_or(DecodeError::InvalidQoS(options_byte & 0x03))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        // SUBSCRIBE must have at least one topic filter
        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() < 3 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        let mut pos = 2;

        let mut return_codes = Vec::new();
        while pos < payload.len() {
            let code = payload[pos];
            pos += 1;

            let return_code = match code {
                0x00 => SubscribeReturnCode::GrantedQoS0,
                0x01 => SubscribeReturnCode::GrantedQoS1,
                0x02 => SubscribeReturnCode::GrantedQoS2,
                0x80 => SubscribeReturnCode::Failure,
                _ => return Err(DecodeError::MalformedPacket("invalid SUBACK return code")),
            };
            return_codes.push(return_code);
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // UNSUBSCRIBE must have flags 0010
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let mut pos = 2;

        // Topic filters
        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            // [MQTT-4.7.0-1] Topic filter cannot be empty
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            filters.push(filter.to_string());
        }

        // UNSUBSCRIBE must have at least one topic filter
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }

    fn decode_unsuback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(Packet::UnsubAck(UnsubAck { packet_id }))
    }

    fn decode_disconnect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !payload.is_empty() {
            return Err(DecodeError::MalformedPacket("DISCONNECT has no payload"));
        }
        Ok(Packet::Disconnect)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
