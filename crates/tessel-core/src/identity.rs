//! Identity strings, public nicknames and groups.
//!
//! An **IdString** is the 8-character protocol handle of a user, e.g.
//! `ECHOECHO`. It is always carried on the wire as exactly 8 ASCII bytes.
//!
//! # Example
//!
//! ```
//! use tessel_core::identity::{IdString, PubNick};
//!
//! let id = IdString::parse("echoecho").unwrap();
//! assert_eq!(id.as_str(), "ECHOECHO");
//!
//! let nick = PubNick::new("Alice");
//! assert_eq!(nick.as_str(), "Alice");
//! ```

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CodecError;

/// Length of an identity on the wire.
pub const IDENTITY_LEN: usize = 8;

/// Length of a public nickname on the wire.
pub const PUB_NICK_LEN: usize = 32;

/// Length of a group identifier.
pub const GROUP_ID_LEN: usize = 8;

/// Protocol-level user handle.
///
/// Uppercase ASCII letters and digits; gateway identities additionally start
/// with `*`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdString([u8; IDENTITY_LEN]);

impl IdString {
    /// Parse an identity, upper-casing ASCII letters.
    pub fn parse(s: &str) -> Result<Self, CodecError> {
        let upper = s.to_ascii_uppercase();
        let bytes: [u8; IDENTITY_LEN] = upper.as_bytes().try_into().map_err(|_| {
            CodecError::InvalidIdentity(format!(
                "expected {} characters, got {}",
                IDENTITY_LEN,
                s.chars().count()
            ))
        })?;
        Self::from_wire(bytes)
    }

    /// Validate raw identity bytes as read from a packet.
    pub fn from_wire(bytes: [u8; IDENTITY_LEN]) -> Result<Self, CodecError> {
        let valid = bytes.iter().enumerate().all(|(i, &b)| {
            b.is_ascii_uppercase() || b.is_ascii_digit() || (i == 0 && b == b'*')
        });
        if !valid {
            return Err(CodecError::InvalidIdentity(format!(
                "invalid characters in {}",
                hex::encode(bytes)
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Validated ASCII on construction.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for IdString {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdString {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdString> for String {
    fn from(id: IdString) -> Self {
        id.as_str().to_string()
    }
}

impl fmt::Display for IdString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for IdString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdString({})", self.as_str())
    }
}

/// Sender display name, zero padded to 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubNick([u8; PUB_NICK_LEN]);

impl PubNick {
    /// Build a nickname, truncating on a character boundary if needed.
    pub fn new(nick: &str) -> Self {
        let mut end = nick.len().min(PUB_NICK_LEN);
        while !nick.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; PUB_NICK_LEN];
        bytes[..end].copy_from_slice(&nick.as_bytes()[..end]);
        Self(bytes)
    }

    pub fn from_wire(bytes: [u8; PUB_NICK_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUB_NICK_LEN] {
        &self.0
    }

    /// The nickname without trailing padding.
    ///
    /// Peers may pad with spaces instead of zero bytes; both are trimmed.
    /// Invalid UTF-8 from a peer yields the longest valid prefix.
    pub fn as_str(&self) -> &str {
        let trimmed = match self.0.iter().rposition(|&b| b != 0 && b != b' ') {
            Some(last) => &self.0[..=last],
            None => &[],
        };
        match std::str::from_utf8(trimmed) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&trimmed[..e.valid_up_to()]).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl Default for PubNick {
    fn default() -> Self {
        Self([0u8; PUB_NICK_LEN])
    }
}

impl fmt::Display for PubNick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PubNick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubNick({:?})", self.as_str())
    }
}

/// 8-byte group identifier chosen by the group creator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub [u8; GROUP_ID_LEN]);

impl GroupId {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut id = [0u8; GROUP_ID_LEN];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(self.0))
    }
}

/// A group as known to its members.
///
/// The protocol has no multicast: every group message is sent once per
/// member, each sealed to that member's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub creator: IdString,
    pub id: GroupId,
    pub name: String,
    pub members: Vec<IdString>,
}

impl Group {
    /// Start a new group owned by `creator` with a random id.
    pub fn create<R: RngCore + CryptoRng>(
        rng: &mut R,
        creator: IdString,
        name: impl Into<String>,
        members: Vec<IdString>,
    ) -> Self {
        Self {
            creator,
            id: GroupId::random(rng),
            name: name.into(),
            members,
        }
    }
}
