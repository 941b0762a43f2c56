//! MQTT Packet Encoder
//!
//! Encodes MQTT packets for v3.1, v3.1.1 and v5.0. No Properties: v5 only
//! changes the CONNECT protocol version byte.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_puback(p, buf),
            Packet::PubRec(p) => self.encode_pubrec(p, buf),
            Packet::PubRel(p) => self.encode_pubrel(p, buf),
            Packet::PubComp(p) => self.encode_pubcomp(p, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_unsuback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0); // PINGRESP type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0); // DISCONNECT type
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 0;

        // Protocol name (4 bytes for "MQTT") + length prefix (2 bytes)
        remaining_length += 6;
        // Protocol version (1 byte)
        remaining_length += 1;
        // Connect flags (1 byte)
        remaining_length += 1;
        // Keep alive (2 bytes)
        remaining_length += 2;

        // Client ID
        remaining_length += 2 + packet.client_id.len();

        // Will message
        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }

        // Username
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }

        // Password
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        // Fixed header
        buf.put_u8(0x10); // CONNECT type + flags (0001 0000)
        write_variable_int(buf, remaining_length as u32)?;

        // Protocol name
        write_string(buf, "MQTT")?;

        // Protocol version
        buf.put_u8(packet.protocol_version as u8);

        // Connect flags
        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        // Keep alive
        buf.put_u16(packet.keep_alive);

        // Client ID
        write_string(buf, &packet.client_id)?;

        // Will message
        if let Some(ref will) = packet.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }

        // Username
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }

        // Password
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Fixed header
        buf.put_u8(0x20); // CONNACK type + flags (0010 0000)
        buf.put_u8(0x02); // remaining length: flags + return code

        // Session present flag
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });

        // Return code
        buf.put_u8(packet.return_code as u8);

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 2 + packet.topic.len(); // topic length prefix + topic

        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2; // packet identifier
        }

        remaining_length += packet.payload.len();

        // Fixed header
        let mut first_byte: u8 = 0x30; // PUBLISH type (0011)
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        // Topic name
        write_string(buf, &packet.topic)?;

        // Packet identifier (only for QoS > 0)
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }

        // Payload
        buf.put_slice(&packet.payload);

        Ok(())
    }

    fn encode_puback(&self, packet: &PubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x40);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        Ok(())
    }

    fn encode_pubrec(&self, packet: &PubRec, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x50);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        Ok(())
    }

    fn encode_pubrel(&self, packet: &PubRel, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x62); // PUBREL with flags 0010
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        Ok(())
    }

    fn encode_pubcomp(&self, packet: &PubComp, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x70);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 2; // packet identifier

        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1; // string + options byte
        }

        // Fixed header
        buf.put_u8(0x82); // SUBSCRIBE type with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        // Subscriptions
        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Calculate remaining length
        let remaining_length = 2 + packet.return_codes.len();

        // Fixed header
        buf.put_u8(0x90); // SUBACK type
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        // Return codes
        for code in &packet.return_codes {
            buf.put_u8(*code as u8);
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 2; // packet identifier

        for filter in &packet.filters {
            remaining_length += 2 + filter.len();
        }

        // Fixed header
        buf.put_u8(0xA2); // UNSUBSCRIBE type with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        // Topic filters
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }

    fn encode_unsuback(&self, packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // v3.1.1-shaped UNSUBACK has no payload
        buf.put_u8(0xB0);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V5)
    }
}
