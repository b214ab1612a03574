//! End-to-end message types and their canonical byte layout.
//!
//! A message is a [`MessageHeader`] (carried in the clear part of the
//! message packet) plus a [`MessageBody`] (sealed end-to-end). The body
//! always serializes as:
//!
//! ```text
//! [1 byte: type] [fixed fields, variant specific] [padding]
//! ```
//!
//! Typing notifications are the one exception and carry no padding.

use bytes::BufMut;
use chrono::{DateTime, Utc};
use rand::{CryptoRng, RngCore};
use std::fmt;

use crate::identity::{GroupId, IdString, PubNick, IDENTITY_LEN};
use crate::packet::MsgFlags;
use crate::padding::{append_padding, check_padding, strip_padding};
use crate::wire::Reader;
use crate::{CodecError, AUDIO_DURATION_UNKNOWN, BLOB_ID_LEN, KEY_LEN, NONCE_LEN};

pub type BlobId = [u8; BLOB_ID_LEN];

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Text = 0x01,
    Image = 0x02,
    Audio = 0x14,
    GroupText = 0x41,
    GroupImage = 0x43,
    GroupSetMembers = 0x4A,
    GroupSetName = 0x4B,
    GroupMemberLeft = 0x4C,
    GroupSetImage = 0x50,
    DeliveryReceipt = 0x80,
    TypingNotification = 0x90,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Text),
            0x02 => Ok(Self::Image),
            0x14 => Ok(Self::Audio),
            0x41 => Ok(Self::GroupText),
            0x43 => Ok(Self::GroupImage),
            0x4A => Ok(Self::GroupSetMembers),
            0x4B => Ok(Self::GroupSetName),
            0x4C => Ok(Self::GroupMemberLeft),
            0x50 => Ok(Self::GroupSetImage),
            0x80 => Ok(Self::DeliveryReceipt),
            0x90 => Ok(Self::TypingNotification),
            _ => Err(CodecError::UnknownMessageType(value)),
        }
    }
}

/// Delivery receipt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgStatus {
    /// Message was received by the peer.
    Delivered = 0x01,
    /// Message was read by the peer.
    Read = 0x02,
    /// Peer approved (thumbs up).
    Approved = 0x03,
    /// Peer disapproved (thumbs down).
    Disapproved = 0x04,
}

impl TryFrom<u8> for MsgStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Delivered),
            0x02 => Ok(Self::Read),
            0x03 => Ok(Self::Approved),
            0x04 => Ok(Self::Disapproved),
            _ => Err(CodecError::UnknownStatus(value)),
        }
    }
}

/// Fields common to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub sender: IdString,
    pub recipient: IdString,
    pub id: u64,
    /// Send time, second precision.
    pub time: DateTime<Utc>,
    pub pub_nick: PubNick,
}

impl MessageHeader {
    /// New header with a random message id, stamped now.
    pub fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        sender: IdString,
        recipient: IdString,
        pub_nick: PubNick,
    ) -> Self {
        Self {
            sender,
            recipient,
            id: rng.next_u64(),
            time: from_unix_seconds(unix_seconds(&Utc::now())),
            pub_nick,
        }
    }
}

/// Seconds since the epoch as carried on the wire.
pub fn unix_seconds(time: &DateTime<Utc>) -> u32 {
    u32::try_from(time.timestamp().max(0)).unwrap_or(u32::MAX)
}

pub fn from_unix_seconds(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
}

/// Creator and id of the group a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHeader {
    pub creator: IdString,
    pub group_id: GroupId,
}

/// Blob reference of a direct image, sealed to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBlob {
    pub blob_id: BlobId,
    pub server_shard: u8,
    pub size: u32,
    /// Nonce the blob (not the message) was sealed with.
    pub nonce: [u8; NONCE_LEN],
}

/// Blob reference sealed with a single-use symmetric key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SymmetricBlob {
    pub blob_id: BlobId,
    pub size: u32,
    pub key: [u8; KEY_LEN],
}

impl fmt::Debug for SymmetricBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricBlob")
            .field("blob_id", &hex::encode(self.blob_id))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioBlob {
    /// Clip length in seconds, normally [`AUDIO_DURATION_UNKNOWN`].
    pub duration: u16,
    pub blob: SymmetricBlob,
}

impl AudioBlob {
    pub fn new(blob: SymmetricBlob) -> Self {
        Self {
            duration: AUDIO_DURATION_UNKNOWN,
            blob,
        }
    }
}

/// Variant-specific message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text {
        text: String,
    },
    Image(ImageBlob),
    Audio(AudioBlob),
    GroupText {
        group: GroupHeader,
        text: String,
    },
    GroupImage {
        group: GroupHeader,
        blob: SymmetricBlob,
    },
    GroupMemberLeft {
        group: GroupHeader,
    },
    GroupSetMembers {
        group_id: GroupId,
        members: Vec<IdString>,
    },
    GroupSetName {
        group_id: GroupId,
        name: String,
    },
    GroupSetImage {
        group_id: GroupId,
        blob: SymmetricBlob,
    },
    DeliveryReceipt {
        status: MsgStatus,
        message_id: u64,
    },
    TypingNotification {
        typing: bool,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Image(_) => MessageType::Image,
            Self::Audio(_) => MessageType::Audio,
            Self::GroupText { .. } => MessageType::GroupText,
            Self::GroupImage { .. } => MessageType::GroupImage,
            Self::GroupMemberLeft { .. } => MessageType::GroupMemberLeft,
            Self::GroupSetMembers { .. } => MessageType::GroupSetMembers,
            Self::GroupSetName { .. } => MessageType::GroupSetName,
            Self::GroupSetImage { .. } => MessageType::GroupSetImage,
            Self::DeliveryReceipt { .. } => MessageType::DeliveryReceipt,
            Self::TypingNotification { .. } => MessageType::TypingNotification,
        }
    }

    pub fn is_group(&self) -> bool {
        match self {
            Self::GroupText { .. }
            | Self::GroupImage { .. }
            | Self::GroupMemberLeft { .. }
            | Self::GroupSetMembers { .. }
            | Self::GroupSetName { .. }
            | Self::GroupSetImage { .. } => true,
            Self::Text { .. }
            | Self::Image(_)
            | Self::Audio(_)
            | Self::DeliveryReceipt { .. }
            | Self::TypingNotification { .. } => false,
        }
    }

    /// Flags the message packet should carry for this body.
    pub fn default_flags(&self) -> MsgFlags {
        match self {
            Self::TypingNotification { .. } => MsgFlags::NO_QUEUING | MsgFlags::NO_ACK_EXPECTED,
            body if body.is_group() => MsgFlags::PUSH | MsgFlags::GROUP,
            _ => MsgFlags::PUSH,
        }
    }

    /// Serialize with fresh random padding.
    ///
    /// Two encodings of the same body are expected to differ.
    pub fn encode<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(self.message_type() as u8);

        match self {
            Self::Text { text } => buf.put_slice(text.as_bytes()),
            Self::Image(image) => {
                buf.put_slice(&image.blob_id);
                buf.put_u8(image.server_shard);
                buf.put_u32_le(image.size);
                buf.put_slice(&image.nonce);
            }
            Self::Audio(audio) => {
                buf.put_u16_le(audio.duration);
                put_symmetric_blob(&mut buf, &audio.blob);
            }
            Self::GroupText { group, text } => {
                put_group_header(&mut buf, group);
                buf.put_slice(text.as_bytes());
            }
            Self::GroupImage { group, blob } => {
                put_group_header(&mut buf, group);
                put_symmetric_blob(&mut buf, blob);
            }
            Self::GroupMemberLeft { group } => put_group_header(&mut buf, group),
            Self::GroupSetMembers { group_id, members } => {
                buf.put_slice(group_id.as_bytes());
                for member in members {
                    buf.put_slice(member.as_bytes());
                }
            }
            Self::GroupSetName { group_id, name } => {
                buf.put_slice(group_id.as_bytes());
                buf.put_slice(name.as_bytes());
            }
            Self::GroupSetImage { group_id, blob } => {
                buf.put_slice(group_id.as_bytes());
                put_symmetric_blob(&mut buf, blob);
            }
            Self::DeliveryReceipt { status, message_id } => {
                buf.put_u8(*status as u8);
                buf.put_u64_le(*message_id);
            }
            Self::TypingNotification { typing } => {
                // Tag then flag, unpadded. The tag is kept so typing bodies
                // dispatch like every other type; a bare flag byte without
                // the tag is not read as a typing notification.
                buf.put_u8(u8::from(*typing));
                return buf;
            }
        }

        append_padding(rng, &mut buf);
        buf
    }

    /// Parse a decrypted body.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data, "message body");
        let message_type = MessageType::try_from(reader.u8()?)?;

        let body = match message_type {
            MessageType::Text => Self::Text {
                text: utf8(strip_padding(reader.rest()))?,
            },
            MessageType::Image => {
                let image = ImageBlob {
                    blob_id: reader.array()?,
                    server_shard: reader.u8()?,
                    size: reader.u32_le()?,
                    nonce: reader.array()?,
                };
                check_padding(reader.rest())?;
                Self::Image(image)
            }
            MessageType::Audio => {
                let duration = reader.u16_le()?;
                let blob = read_symmetric_blob(&mut reader)?;
                check_padding(reader.rest())?;
                Self::Audio(AudioBlob { duration, blob })
            }
            MessageType::GroupText => {
                let group = read_group_header(&mut reader)?;
                Self::GroupText {
                    group,
                    text: utf8(strip_padding(reader.rest()))?,
                }
            }
            MessageType::GroupImage => {
                let group = read_group_header(&mut reader)?;
                let blob = read_symmetric_blob(&mut reader)?;
                check_padding(reader.rest())?;
                Self::GroupImage { group, blob }
            }
            MessageType::GroupMemberLeft => {
                let group = read_group_header(&mut reader)?;
                check_padding(reader.rest())?;
                Self::GroupMemberLeft { group }
            }
            MessageType::GroupSetMembers => {
                let group_id = GroupId(reader.array()?);
                let raw = strip_padding(reader.rest());
                if raw.len() % IDENTITY_LEN != 0 {
                    return Err(CodecError::InvalidMemberList(raw.len()));
                }
                let members = raw
                    .chunks_exact(IDENTITY_LEN)
                    .map(|chunk| {
                        let mut id = [0u8; IDENTITY_LEN];
                        id.copy_from_slice(chunk);
                        IdString::from_wire(id)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::GroupSetMembers { group_id, members }
            }
            MessageType::GroupSetName => {
                let group_id = GroupId(reader.array()?);
                Self::GroupSetName {
                    group_id,
                    name: utf8(strip_padding(reader.rest()))?,
                }
            }
            MessageType::GroupSetImage => {
                let group_id = GroupId(reader.array()?);
                let blob = read_symmetric_blob(&mut reader)?;
                check_padding(reader.rest())?;
                Self::GroupSetImage { group_id, blob }
            }
            MessageType::DeliveryReceipt => {
                let status = MsgStatus::try_from(reader.u8()?)?;
                let message_id = reader.u64_le()?;
                check_padding(reader.rest())?;
                Self::DeliveryReceipt { status, message_id }
            }
            MessageType::TypingNotification => Self::TypingNotification {
                typing: reader.u8()? != 0,
            },
        };

        Ok(body)
    }
}

fn put_group_header(buf: &mut Vec<u8>, group: &GroupHeader) {
    buf.put_slice(group.creator.as_bytes());
    buf.put_slice(group.group_id.as_bytes());
}

fn put_symmetric_blob(buf: &mut Vec<u8>, blob: &SymmetricBlob) {
    buf.put_slice(&blob.blob_id);
    buf.put_u32_le(blob.size);
    buf.put_slice(&blob.key);
}

fn read_group_header(reader: &mut Reader<'_>) -> Result<GroupHeader, CodecError> {
    Ok(GroupHeader {
        creator: reader.identity()?,
        group_id: GroupId(reader.array()?),
    })
}

fn read_symmetric_blob(reader: &mut Reader<'_>) -> Result<SymmetricBlob, CodecError> {
    Ok(SymmetricBlob {
        blob_id: reader.array()?,
        size: reader.u32_le()?,
        key: reader.array()?,
    })
}

fn utf8(bytes: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

impl fmt::Display for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { text } => write!(f, "{text}"),
            Self::Image(image) => write!(
                f,
                "image blob {} (shard {:02x}, {} bytes)",
                hex::encode(image.blob_id),
                image.server_shard,
                image.size
            ),
            Self::Audio(audio) => write!(
                f,
                "audio blob {} ({} bytes)",
                hex::encode(audio.blob.blob_id),
                audio.blob.size
            ),
            Self::GroupText { group, text } => write!(f, "[{}] {text}", group.group_id),
            Self::GroupImage { group, blob } => write!(
                f,
                "[{}] image blob {} ({} bytes)",
                group.group_id,
                hex::encode(blob.blob_id),
                blob.size
            ),
            Self::GroupMemberLeft { group } => write!(f, "[{}] member left", group.group_id),
            Self::GroupSetMembers { group_id, members } => {
                write!(f, "[{group_id}] members:")?;
                for member in members {
                    write!(f, " {member}")?;
                }
                Ok(())
            }
            Self::GroupSetName { group_id, name } => write!(f, "[{group_id}] renamed to {name}"),
            Self::GroupSetImage { group_id, blob } => write!(
                f,
                "[{group_id}] group image blob {}",
                hex::encode(blob.blob_id)
            ),
            Self::DeliveryReceipt { status, message_id } => {
                write!(f, "{status:?}: {message_id:016x}")
            }
            Self::TypingNotification { typing } => {
                f.write_str(if *typing { "typing" } else { "stopped typing" })
            }
        }
    }
}

/// A complete message: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    pub fn sender(&self) -> IdString {
        self.header.sender
    }

    pub fn recipient(&self) -> IdString {
        self.header.recipient
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Serialize the body; the header travels in the message packet.
    pub fn encode<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Vec<u8> {
        self.body.encode(rng)
    }

    /// Rebuild a message from its packet header and decrypted body.
    pub fn decode(header: MessageHeader, body: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            header,
            body: MessageBody::decode(body)?,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.header.sender, self.header.recipient, self.body)
    }
}
