//! Core Tessel protocol types, framing, and constants.
//!
//! This crate provides:
//! - Identity types (`IdString`, `PubNick`, `GroupId`, `Group`)
//! - The end-to-end message codec with its random padding scheme
//! - Handshake packets and the length-prefixed transport frames
//!
//! Nothing in here touches key material. Sealing and opening live in
//! `tessel-crypto`; this crate only knows byte layouts.

#![forbid(unsafe_code)]

pub mod identity;
pub mod message;
pub mod packet;
pub mod padding;

mod wire;

pub use identity::{Group, GroupId, IdString, PubNick};
pub use message::{
    AudioBlob, BlobId, GroupHeader, ImageBlob, Message, MessageBody, MessageHeader, MessageType,
    MsgStatus, SymmetricBlob,
};
pub use packet::{
    AckPacket, AuthPacket, AuthPayload, ClientHello, EchoPacket, MessagePacket, MsgFlags, Packet,
    PacketType, ServerHello, ServerHelloBody,
};

/// Length of a Curve25519 public or secret key.
pub const KEY_LEN: usize = 32;

/// Length of a box nonce.
pub const NONCE_LEN: usize = 24;

/// Length of the random per-direction nonce prefix.
pub const NONCE_PREFIX_LEN: usize = 16;

/// Poly1305 tag appended by every box seal.
pub const BOX_TAG_LEN: usize = 16;

/// Length of a blob identifier.
pub const BLOB_ID_LEN: usize = 16;

/// Audio duration written for every outgoing audio message.
///
/// The duration of a clip is never probed; receivers treat this value as
/// "unknown".
pub const AUDIO_DURATION_UNKNOWN: u16 = 0xFFFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{what} too short: need {needed} bytes, got {actual}")]
    TooShort {
        what: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("{what} has invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("unexpected packet type: 0x{0:02x}")]
    UnexpectedPacketType(u8),
    #[error("unknown delivery status: 0x{0:02x}")]
    UnknownStatus(u8),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("malformed padding")]
    InvalidPadding,
    #[error("text is not valid UTF-8")]
    InvalidUtf8,
    #[error("member list length {0} is not a multiple of 8")]
    InvalidMemberList(usize),
    #[error("frame of {0} bytes exceeds the 16-bit length prefix")]
    FrameTooLarge(usize),
}
