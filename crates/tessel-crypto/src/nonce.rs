//! Nonce construction and per-direction counters.
//!
//! A transport nonce is the direction's 16-byte random prefix followed by a
//! 64-bit little-endian counter:
//!
//! ```text
//! [16 bytes: prefix] [8 bytes: counter, LE]
//! ```
//!
//! The counter starts at 1 and advances by exactly one per sealed or opened
//! packet. A key pair never sees the same nonce twice because the prefix is
//! fresh per connection and the counter never wraps: once `u64::MAX` has been
//! issued the counter is exhausted.

use rand::{CryptoRng, RngCore};
use std::fmt;
use tessel_core::{NONCE_LEN, NONCE_PREFIX_LEN};

use crate::envelope::CryptoError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Fully random nonce, used for end-to-end and inner handshake boxes.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_parts(prefix: &[u8; NONCE_PREFIX_LEN], counter: u64) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
        bytes[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_le_bytes());
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; NONCE_LEN] {
        self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

/// Counter nonce generator for one direction of a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct NonceCounter {
    prefix: [u8; NONCE_PREFIX_LEN],
    next: u64,
    exhausted: bool,
}

impl NonceCounter {
    /// Counter with a fresh random prefix, for our own sending direction.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rng.fill_bytes(&mut prefix);
        Self::new(prefix)
    }

    /// Counter for a prefix announced by the peer.
    pub fn new(prefix: [u8; NONCE_PREFIX_LEN]) -> Self {
        Self {
            prefix,
            next: 1,
            exhausted: false,
        }
    }

    pub fn prefix(&self) -> &[u8; NONCE_PREFIX_LEN] {
        &self.prefix
    }

    /// Counter value the next nonce will carry, or `None` once exhausted.
    pub fn counter(&self) -> Option<u64> {
        (!self.exhausted).then_some(self.next)
    }

    /// Issue the next nonce and advance the counter.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Nonce, CryptoError> {
        if self.exhausted {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = Nonce::from_parts(&self.prefix, self.next);
        match self.next.checked_add(1) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Ok(nonce)
    }

    /// Reposition the counter. Only the auth packet needs this.
    pub fn set_counter(&mut self, counter: u64) {
        self.next = counter;
        self.exhausted = false;
    }
}

impl fmt::Debug for NonceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceCounter")
            .field("prefix", &hex::encode(self.prefix))
            .field("next", &self.counter())
            .finish()
    }
}
