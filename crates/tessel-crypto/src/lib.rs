//! Cryptography for Tessel.
//!
//! This crate provides:
//! - Curve25519 key pairs and the local identity
//! - Per-direction nonce counters for the transport
//! - NaCl box and secretbox envelopes for transport, end-to-end and blob data
//! - The client and server handshake state machines
//!
//! # Design
//!
//! Everything here is sans-IO. The handshake produces and consumes byte
//! arrays; the caller moves them over whatever stream it has. Once the
//! handshake is established it yields a [`TransportCipher`] that seals and
//! opens frames with strictly increasing counter nonces.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod handshake;
pub mod keys;
pub mod nonce;
pub mod transport;

pub use envelope::{CryptoError, BLOB_NONCE};
pub use handshake::{
    ClientHandshake, HandshakeError, HandshakeState, ServerHandshake, ServerHandshakeState,
};
pub use keys::{KeyPair, LocalIdentity};
pub use nonce::{Nonce, NonceCounter};
pub use transport::{TransportCipher, TransportOpener, TransportSealer};

/// Curve25519 public key as used by every box operation.
pub use crypto_box::PublicKey;
/// Curve25519 secret key, zeroized on drop.
pub use crypto_box::SecretKey;
