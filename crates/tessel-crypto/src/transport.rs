//! Transport encryption after the handshake.
//!
//! Both directions share one box (our ephemeral secret, the peer's ephemeral
//! public key) and differ only in their nonce counters. The cipher can be
//! split so the sending and receiving sides are owned independently.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use crate::envelope::CryptoError;
use crate::nonce::NonceCounter;

/// Sending half: seals with the local counter.
pub struct TransportSealer {
    cipher: SalsaBox,
    nonce: NonceCounter,
}

impl TransportSealer {
    /// Seal one packet, consuming exactly one nonce.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce.next()?;
        self.cipher
            .encrypt(GenericArray::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| CryptoError::Seal)
    }

    pub fn counter(&self) -> &NonceCounter {
        &self.nonce
    }
}

/// Receiving half: opens with the peer's counter.
pub struct TransportOpener {
    cipher: SalsaBox,
    nonce: NonceCounter,
}

impl TransportOpener {
    /// Open one packet, consuming exactly one nonce whether or not it
    /// authenticates.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce.next()?;
        self.cipher
            .decrypt(GenericArray::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }

    pub fn counter(&self) -> &NonceCounter {
        &self.nonce
    }
}

pub struct TransportCipher {
    sealer: TransportSealer,
    opener: TransportOpener,
}

impl TransportCipher {
    pub fn new(
        peer_ephemeral: &PublicKey,
        own_ephemeral: &SecretKey,
        send: NonceCounter,
        recv: NonceCounter,
    ) -> Self {
        Self {
            sealer: TransportSealer {
                cipher: SalsaBox::new(peer_ephemeral, own_ephemeral),
                nonce: send,
            },
            opener: TransportOpener {
                cipher: SalsaBox::new(peer_ephemeral, own_ephemeral),
                nonce: recv,
            },
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.sealer.seal(plaintext)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.opener.open(ciphertext)
    }

    pub fn send_counter(&self) -> &NonceCounter {
        self.sealer.counter()
    }

    pub fn recv_counter(&self) -> &NonceCounter {
        self.opener.counter()
    }

    pub fn split(self) -> (TransportSealer, TransportOpener) {
        (self.sealer, self.opener)
    }
}
