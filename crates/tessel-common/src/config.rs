//! Client configuration file.
//!
//! ```json
//! {
//!   "identity": "TESTTEST",
//!   "secret_key": "<64 hex digits>",
//!   "server_addr": "127.0.0.1:5222",
//!   "server_public_key": "<64 hex digits>",
//!   "nickname": "test",
//!   "contacts": [{ "identity": "ECHOECHO", "public_key": "<64 hex digits>" }]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tessel_core::{IdString, KEY_LEN};
use tracing::debug;

use crate::error::{Error, Result};
use crate::helpers::decode_key_hex;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactConfig {
    pub identity: IdString,
    /// Hex-encoded long-term public key.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub identity: IdString,
    /// Hex-encoded long-term secret key.
    pub secret_key: String,
    pub server_addr: String,
    /// Hex-encoded server long-term public key, pinned for the handshake.
    pub server_public_key: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl ClientConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_json(&raw)?;
        debug!(path = %path.display(), identity = %config.identity, "loaded client config");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Check that every key decodes and the server address is present.
    pub fn validate(&self) -> Result<()> {
        self.secret_key_bytes()
            .map_err(|e| Error::config(format!("secret_key: {e}")))?;
        self.server_public_key_bytes()
            .map_err(|e| Error::config(format!("server_public_key: {e}")))?;
        if self.server_addr.trim().is_empty() {
            return Err(Error::config("server_addr must not be empty"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::config("connect_timeout_secs must be positive"));
        }
        for contact in &self.contacts {
            decode_key_hex(&contact.public_key)
                .map_err(|e| Error::config(format!("contact {}: {e}", contact.identity)))?;
        }
        Ok(())
    }

    pub fn secret_key_bytes(&self) -> Result<[u8; KEY_LEN]> {
        decode_key_hex(&self.secret_key)
    }

    pub fn server_public_key_bytes(&self) -> Result<[u8; KEY_LEN]> {
        decode_key_hex(&self.server_public_key)
    }

    /// Contacts with decoded public keys.
    pub fn contact_keys(&self) -> Result<Vec<(IdString, [u8; KEY_LEN])>> {
        self.contacts
            .iter()
            .map(|c| Ok((c.identity, decode_key_hex(&c.public_key)?)))
            .collect()
    }
}
