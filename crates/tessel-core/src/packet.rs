//! Handshake packets and post-handshake transport packets.
//!
//! The three handshake packets travel raw and have fixed sizes. Everything
//! after the handshake is a packet sealed with the transport keys and sent
//! as a frame:
//!
//! ```text
//! [2 bytes: ciphertext length, LE] [ciphertext]
//! ```
//!
//! A decrypted transport packet starts with a one-byte [`PacketType`].
//! Message packets carry this header before the end-to-end ciphertext:
//!
//! ```text
//! +------+--------+-----------+----+------+-------+----------+---------+-------+
//! | type | sender | recipient | id | time | flags | reserved | pubnick | nonce |
//! |  1   |   8    |     8     | 8  |  4   |   1   |    3     |   32    |  24   |
//! +------+--------+-----------+----+------+-------+----------+---------+-------+
//! ```

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::identity::{IdString, PubNick, IDENTITY_LEN};
use crate::message::{from_unix_seconds, unix_seconds, MessageHeader};
use crate::wire::Reader;
use crate::{CodecError, BOX_TAG_LEN, KEY_LEN, NONCE_LEN, NONCE_PREFIX_LEN};

pub const CLIENT_HELLO_SIZE: usize = KEY_LEN + NONCE_PREFIX_LEN;
pub const SERVER_HELLO_BOX_SIZE: usize = SERVER_HELLO_BODY_SIZE + BOX_TAG_LEN;
pub const SERVER_HELLO_SIZE: usize = NONCE_PREFIX_LEN + SERVER_HELLO_BOX_SIZE;
pub const SERVER_HELLO_BODY_SIZE: usize = KEY_LEN + NONCE_PREFIX_LEN;

/// Sealed client ephemeral key inside the auth payload.
pub const AUTH_INNER_SIZE: usize = KEY_LEN + BOX_TAG_LEN;
pub const AUTH_PAYLOAD_SIZE: usize =
    IDENTITY_LEN + SYSTEM_DATA_LEN + NONCE_PREFIX_LEN + NONCE_LEN + AUTH_INNER_SIZE;
/// The sealed auth payload as sent on the wire.
pub const AUTH_SIZE: usize = AUTH_PAYLOAD_SIZE + BOX_TAG_LEN;

/// Reserved system data in the auth payload, sent as zeros.
pub const SYSTEM_DATA_LEN: usize = 32;

pub const ACK_SIZE: usize = 17;
pub const ECHO_SIZE: usize = 9;
pub const MESSAGE_HEADER_SIZE: usize = 89;

pub const FRAME_HEADER_SIZE: usize = 2;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Transport packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    EchoRequest = 0x00,
    OutgoingMessage = 0x01,
    IncomingMessage = 0x02,
    EchoReply = 0x80,
    /// Server confirming it accepted an outgoing message.
    ServerAck = 0x81,
    /// Client confirming it received an incoming message.
    ClientAck = 0x82,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::EchoRequest),
            0x01 => Ok(Self::OutgoingMessage),
            0x02 => Ok(Self::IncomingMessage),
            0x80 => Ok(Self::EchoReply),
            0x81 => Ok(Self::ServerAck),
            0x82 => Ok(Self::ClientAck),
            _ => Err(CodecError::UnknownPacketType(value)),
        }
    }
}

bitflags! {
    /// Delivery flags carried in a message packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MsgFlags: u8 {
        /// Recipient should get a push notification.
        const PUSH = 0x01;
        /// Drop instead of queuing when the recipient is offline.
        const NO_QUEUING = 0x02;
        /// Recipient will not send a delivery receipt.
        const NO_ACK_EXPECTED = 0x04;
        const ALREADY_DELIVERED = 0x08;
        const GROUP = 0x10;
    }
}

/// First handshake packet, client to server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    pub ephemeral_pk: [u8; KEY_LEN],
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl ClientHello {
    pub fn encode(&self) -> [u8; CLIENT_HELLO_SIZE] {
        let mut out = [0u8; CLIENT_HELLO_SIZE];
        out[..KEY_LEN].copy_from_slice(&self.ephemeral_pk);
        out[KEY_LEN..].copy_from_slice(&self.nonce_prefix);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("client hello", data, CLIENT_HELLO_SIZE)?;
        let mut reader = Reader::new(data, "client hello");
        Ok(Self {
            ephemeral_pk: reader.array()?,
            nonce_prefix: reader.array()?,
        })
    }
}

/// Server reply to the client hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHello {
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
    /// Sealed [`ServerHelloBody`].
    pub sealed: [u8; SERVER_HELLO_BOX_SIZE],
}

impl ServerHello {
    pub fn encode(&self) -> [u8; SERVER_HELLO_SIZE] {
        let mut out = [0u8; SERVER_HELLO_SIZE];
        out[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        out[NONCE_PREFIX_LEN..].copy_from_slice(&self.sealed);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("server hello", data, SERVER_HELLO_SIZE)?;
        let mut reader = Reader::new(data, "server hello");
        Ok(Self {
            nonce_prefix: reader.array()?,
            sealed: reader.array()?,
        })
    }
}

/// Plaintext inside the server hello box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHelloBody {
    pub ephemeral_pk: [u8; KEY_LEN],
    /// Must equal the prefix from the client hello.
    pub client_prefix: [u8; NONCE_PREFIX_LEN],
}

impl ServerHelloBody {
    pub fn encode(&self) -> [u8; SERVER_HELLO_BODY_SIZE] {
        let mut out = [0u8; SERVER_HELLO_BODY_SIZE];
        out[..KEY_LEN].copy_from_slice(&self.ephemeral_pk);
        out[KEY_LEN..].copy_from_slice(&self.client_prefix);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("server hello body", data, SERVER_HELLO_BODY_SIZE)?;
        let mut reader = Reader::new(data, "server hello body");
        Ok(Self {
            ephemeral_pk: reader.array()?,
            client_prefix: reader.array()?,
        })
    }
}

/// Plaintext of the auth packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPayload {
    pub identity: IdString,
    pub system_data: [u8; SYSTEM_DATA_LEN],
    /// Echo of the server nonce prefix.
    pub server_prefix: [u8; NONCE_PREFIX_LEN],
    /// Random nonce the inner box was sealed with.
    pub nonce: [u8; NONCE_LEN],
    /// Client ephemeral key sealed with the long-term keys.
    pub sealed_ephemeral: [u8; AUTH_INNER_SIZE],
}

impl AuthPayload {
    pub fn encode(&self) -> [u8; AUTH_PAYLOAD_SIZE] {
        let mut buf = BytesMut::with_capacity(AUTH_PAYLOAD_SIZE);
        buf.put_slice(self.identity.as_bytes());
        buf.put_slice(&self.system_data);
        buf.put_slice(&self.server_prefix);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.sealed_ephemeral);

        let mut out = [0u8; AUTH_PAYLOAD_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("auth payload", data, AUTH_PAYLOAD_SIZE)?;
        let mut reader = Reader::new(data, "auth payload");
        Ok(Self {
            identity: reader.identity()?,
            system_data: reader.array()?,
            server_prefix: reader.array()?,
            nonce: reader.array()?,
            sealed_ephemeral: reader.array()?,
        })
    }
}

/// Sealed auth payload as sent on the wire, unframed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPacket {
    pub ciphertext: [u8; AUTH_SIZE],
}

impl AuthPacket {
    pub fn from_ciphertext(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("auth packet", data, AUTH_SIZE)?;
        let mut ciphertext = [0u8; AUTH_SIZE];
        ciphertext.copy_from_slice(data);
        Ok(Self { ciphertext })
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_SIZE] {
        &self.ciphertext
    }
}

/// Acknowledgement of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket {
    /// [`PacketType::ServerAck`] or [`PacketType::ClientAck`].
    pub packet_type: PacketType,
    /// Sender of the acknowledged message (recipient for server acks).
    pub identity: IdString,
    pub message_id: u64,
}

impl AckPacket {
    pub fn client(sender: IdString, message_id: u64) -> Self {
        Self {
            packet_type: PacketType::ClientAck,
            identity: sender,
            message_id,
        }
    }

    pub fn server(recipient: IdString, message_id: u64) -> Self {
        Self {
            packet_type: PacketType::ServerAck,
            identity: recipient,
            message_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ACK_SIZE);
        buf.put_u8(self.packet_type as u8);
        buf.put_slice(self.identity.as_bytes());
        buf.put_u64_le(self.message_id);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("ack packet", data, ACK_SIZE)?;
        let mut reader = Reader::new(data, "ack packet");
        let packet_type = PacketType::try_from(reader.u8()?)?;
        if !matches!(packet_type, PacketType::ServerAck | PacketType::ClientAck) {
            return Err(CodecError::UnexpectedPacketType(packet_type as u8));
        }
        Ok(Self {
            packet_type,
            identity: reader.identity()?,
            message_id: reader.u64_le()?,
        })
    }
}

/// Keep-alive probe carrying a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoPacket {
    /// [`PacketType::EchoRequest`] or [`PacketType::EchoReply`].
    pub packet_type: PacketType,
    pub counter: u64,
}

impl EchoPacket {
    pub fn request(counter: u64) -> Self {
        Self {
            packet_type: PacketType::EchoRequest,
            counter,
        }
    }

    /// Reply to this request, echoing its counter.
    pub fn reply(&self) -> Self {
        Self {
            packet_type: PacketType::EchoReply,
            counter: self.counter,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ECHO_SIZE);
        buf.put_u8(self.packet_type as u8);
        buf.put_u64_le(self.counter);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("echo packet", data, ECHO_SIZE)?;
        let mut reader = Reader::new(data, "echo packet");
        let packet_type = PacketType::try_from(reader.u8()?)?;
        if !matches!(packet_type, PacketType::EchoRequest | PacketType::EchoReply) {
            return Err(CodecError::UnexpectedPacketType(packet_type as u8));
        }
        Ok(Self {
            packet_type,
            counter: reader.u64_le()?,
        })
    }
}

/// Message delivery packet wrapping an end-to-end ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePacket {
    /// [`PacketType::OutgoingMessage`] or [`PacketType::IncomingMessage`].
    pub packet_type: PacketType,
    pub sender: IdString,
    pub recipient: IdString,
    pub id: u64,
    /// Unix seconds.
    pub time: u32,
    pub flags: MsgFlags,
    pub pub_nick: PubNick,
    /// Nonce the end-to-end ciphertext was sealed with.
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl MessagePacket {
    /// Outgoing packet for a message header and its sealed body.
    pub fn outgoing(
        header: &MessageHeader,
        flags: MsgFlags,
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            packet_type: PacketType::OutgoingMessage,
            sender: header.sender,
            recipient: header.recipient,
            id: header.id,
            time: unix_seconds(&header.time),
            flags,
            pub_nick: header.pub_nick,
            nonce,
            ciphertext,
        }
    }

    /// The same packet as the server delivers it to the recipient.
    pub fn into_incoming(self) -> Self {
        Self {
            packet_type: PacketType::IncomingMessage,
            ..self
        }
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            sender: self.sender,
            recipient: self.recipient,
            id: self.id,
            time: from_unix_seconds(self.time),
            pub_nick: self.pub_nick,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + self.ciphertext.len());
        buf.put_u8(self.packet_type as u8);
        buf.put_slice(self.sender.as_bytes());
        buf.put_slice(self.recipient.as_bytes());
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.time);
        buf.put_u8(self.flags.bits());
        buf.put_bytes(0, 3);
        buf.put_slice(self.pub_nick.as_bytes());
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.ciphertext);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data, "message packet");
        let packet_type = PacketType::try_from(reader.u8()?)?;
        if !matches!(
            packet_type,
            PacketType::OutgoingMessage | PacketType::IncomingMessage
        ) {
            return Err(CodecError::UnexpectedPacketType(packet_type as u8));
        }
        let sender = reader.identity()?;
        let recipient = reader.identity()?;
        let id = reader.u64_le()?;
        let time = reader.u32_le()?;
        let flags = MsgFlags::from_bits_retain(reader.u8()?);
        reader.take(3)?;
        let pub_nick = PubNick::from_wire(reader.array()?);
        let nonce = reader.array()?;

        let ciphertext = reader.rest();
        if ciphertext.len() < BOX_TAG_LEN {
            return Err(CodecError::TooShort {
                what: "message packet",
                needed: MESSAGE_HEADER_SIZE + BOX_TAG_LEN,
                actual: data.len(),
            });
        }

        Ok(Self {
            packet_type,
            sender,
            recipient,
            id,
            time,
            flags,
            pub_nick,
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Any post-handshake transport packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Echo(EchoPacket),
    Ack(AckPacket),
    Message(MessagePacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Echo(p) => p.packet_type,
            Self::Ack(p) => p.packet_type,
            Self::Message(p) => p.packet_type,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Echo(p) => p.encode(),
            Self::Ack(p) => p.encode(),
            Self::Message(p) => p.encode(),
        }
    }

    /// Decode a decrypted transport packet, dispatching on its type tag.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let tag = *data.first().ok_or(CodecError::TooShort {
            what: "packet",
            needed: 1,
            actual: 0,
        })?;

        match PacketType::try_from(tag)? {
            PacketType::EchoRequest | PacketType::EchoReply => {
                Ok(Self::Echo(EchoPacket::decode(data)?))
            }
            PacketType::ServerAck | PacketType::ClientAck => {
                Ok(Self::Ack(AckPacket::decode(data)?))
            }
            PacketType::OutgoingMessage | PacketType::IncomingMessage => {
                Ok(Self::Message(MessagePacket::decode(data)?))
            }
        }
    }
}

/// Prefix a transport ciphertext with its 16-bit length.
pub fn encode_frame(ciphertext: &[u8]) -> Result<Bytes, CodecError> {
    let len = u16::try_from(ciphertext.len())
        .map_err(|_| CodecError::FrameTooLarge(ciphertext.len()))?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
    buf.put_u16_le(len);
    buf.put_slice(ciphertext);
    Ok(buf.freeze())
}

/// Ciphertext length announced by a frame header.
pub fn frame_len(header: [u8; FRAME_HEADER_SIZE]) -> usize {
    u16::from_le_bytes(header) as usize
}

/// Split one complete frame off the front of `data`.
///
/// Returns the ciphertext and the number of bytes consumed.
pub fn decode_frame(data: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let mut reader = Reader::new(data, "frame");
    let len = reader.u16_le()? as usize;
    let ciphertext = reader.take(len)?;
    Ok((ciphertext, FRAME_HEADER_SIZE + len))
}

fn expect_len(what: &'static str, data: &[u8], expected: usize) -> Result<(), CodecError> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidLength {
            what,
            expected,
            actual: data.len(),
        })
    }
}
