//! Curve25519 key pairs and the local identity.
//!
//! The same [`KeyPair`] type serves as long-term identity key and as the
//! per-connection ephemeral key. Secret keys are zeroized on drop.
//!
//! # Example
//!
//! ```
//! use rand::rngs::OsRng;
//! use tessel_crypto::keys::KeyPair;
//!
//! let keys = KeyPair::generate(&mut OsRng);
//! let restored = KeyPair::from_secret_bytes(keys.secret_bytes());
//! assert_eq!(restored.public_bytes(), keys.public_bytes());
//! ```

use anyhow::{Context, Result};
use crypto_box::{PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use std::fmt;
use std::fs;
use std::path::Path;
use tessel_core::{IdString, PubNick, KEY_LEN};
use zeroize::Zeroize;

#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = SecretKey::generate(rng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Raw secret key bytes.
    ///
    /// # Security
    /// Anyone holding these bytes can impersonate the identity.
    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// Save the key pair as raw bytes.
    ///
    /// The secret key file is restricted to 0600 on Unix.
    pub fn save(&self, secret_path: &Path, public_path: &Path) -> Result<()> {
        let mut secret_bytes = self.secret_bytes();
        let written = fs::write(secret_path, secret_bytes);
        secret_bytes.zeroize();
        written.with_context(|| format!("failed to write {}", secret_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(secret_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(secret_path, perms)?;
        }

        fs::write(public_path, self.public_bytes())
            .with_context(|| format!("failed to write {}", public_path.display()))?;
        Ok(())
    }

    /// Load a key pair from a raw secret key file.
    pub fn load(secret_path: &Path) -> Result<Self> {
        let mut bytes = fs::read(secret_path)
            .with_context(|| format!("failed to read {}", secret_path.display()))?;

        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            anyhow::bail!("invalid secret key length: expected {KEY_LEN} bytes, got {len}");
        }

        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(&bytes);
        bytes.zeroize();

        let keys = Self::from_secret_bytes(key_bytes);
        key_bytes.zeroize();
        Ok(keys)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Our own identity: handle, long-term keys and the advertised nickname.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub id: IdString,
    pub keys: KeyPair,
    pub pub_nick: PubNick,
}

impl LocalIdentity {
    pub fn new(id: IdString, keys: KeyPair, pub_nick: PubNick) -> Self {
        Self { id, keys, pub_nick }
    }
}
