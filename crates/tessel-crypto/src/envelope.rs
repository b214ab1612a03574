//! Seal and open wrappers over NaCl box and secretbox.
//!
//! Three regimes use these primitives:
//!
//! | Regime     | Keys                                    | Nonce                  |
//! |------------|-----------------------------------------|------------------------|
//! | transport  | our ephemeral sk, peer ephemeral pk     | direction counter      |
//! | end-to-end | sender long-term sk, recipient long-term pk | random per message |
//! | blob       | end-to-end keys, or a single-use key    | random, or [`BLOB_NONCE`] |
//!
//! Every ciphertext includes the 16-byte Poly1305 tag.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use crypto_secretbox::aead::KeyInit;
use crypto_secretbox::XSalsa20Poly1305;
use rand::{CryptoRng, RngCore};
use tessel_core::KEY_LEN;
use thiserror::Error;

use crate::nonce::Nonce;

/// Nonce for symmetric blob boxes.
///
/// Blob keys are generated per blob and used for exactly one seal, so a
/// fixed nonce is safe.
pub const BLOB_NONCE: Nonce = Nonce::from_bytes([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
]);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,

    #[error("decryption failed: authentication tag mismatch")]
    Authentication,

    #[error("{what} has unexpected length: expected {expected} bytes, got {actual}")]
    UnexpectedLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// Box `plaintext` from `sender_sk` to `recipient_pk`.
pub fn seal_asymmetric(
    plaintext: &[u8],
    recipient_pk: &PublicKey,
    sender_sk: &SecretKey,
    nonce: &Nonce,
) -> Result<Vec<u8>, CryptoError> {
    SalsaBox::new(recipient_pk, sender_sk)
        .encrypt(GenericArray::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CryptoError::Seal)
}

/// Open a box sent by `sender_pk` to the holder of `recipient_sk`.
pub fn open_asymmetric(
    ciphertext: &[u8],
    sender_pk: &PublicKey,
    recipient_sk: &SecretKey,
    nonce: &Nonce,
) -> Result<Vec<u8>, CryptoError> {
    SalsaBox::new(sender_pk, recipient_sk)
        .decrypt(GenericArray::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

pub fn seal_symmetric(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &Nonce,
) -> Result<Vec<u8>, CryptoError> {
    XSalsa20Poly1305::new(GenericArray::from_slice(key))
        .encrypt(GenericArray::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CryptoError::Seal)
}

pub fn open_symmetric(
    ciphertext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &Nonce,
) -> Result<Vec<u8>, CryptoError> {
    XSalsa20Poly1305::new(GenericArray::from_slice(key))
        .decrypt(GenericArray::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Seal an end-to-end payload under a fresh random nonce.
pub fn seal_end_to_end<R: RngCore + CryptoRng>(
    rng: &mut R,
    plaintext: &[u8],
    recipient_pk: &PublicKey,
    sender_sk: &SecretKey,
) -> Result<(Nonce, Vec<u8>), CryptoError> {
    let nonce = Nonce::random(rng);
    let ciphertext = seal_asymmetric(plaintext, recipient_pk, sender_sk, &nonce)?;
    Ok((nonce, ciphertext))
}

/// Seal blob data under a single-use random key and [`BLOB_NONCE`].
///
/// Returns the key the recipient needs to open the blob.
pub fn seal_blob_symmetric<R: RngCore + CryptoRng>(
    rng: &mut R,
    data: &[u8],
) -> Result<([u8; KEY_LEN], Vec<u8>), CryptoError> {
    let mut key = [0u8; KEY_LEN];
    rng.fill_bytes(&mut key);
    let ciphertext = seal_symmetric(data, &key, &BLOB_NONCE)?;
    Ok((key, ciphertext))
}

pub fn open_blob_symmetric(
    ciphertext: &[u8],
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, CryptoError> {
    open_symmetric(ciphertext, key, &BLOB_NONCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tessel_core::BOX_TAG_LEN;

    fn pair(seed: u64) -> KeyPair {
        KeyPair::generate(&mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn asymmetric_round_trip() {
        let alice = pair(1);
        let bob = pair(2);
        let nonce = Nonce::random(&mut StdRng::seed_from_u64(3));

        let ct = seal_asymmetric(b"hello bob", bob.public(), alice.secret(), &nonce).unwrap();
        assert_eq!(ct.len(), 9 + 16);

        let pt = open_asymmetric(&ct, alice.public(), bob.secret(), &nonce).unwrap();
        assert_eq!(pt, b"hello bob");
    }

    #[test]
    fn ten_byte_plaintext_under_new_nonce() {
        let alice = pair(1);
        let bob = pair(2);
        let mut rng = StdRng::seed_from_u64(4);
        let sealed_with = Nonce::random(&mut rng);
        let different = Nonce::random(&mut rng);
        assert_ne!(sealed_with.as_bytes(), different.as_bytes());

        let ct = seal_asymmetric(b"0123456789", bob.public(), alice.secret(), &sealed_with).unwrap();
        assert_eq!(ct.len(), 10 + BOX_TAG_LEN);
        assert!(matches!(
            open_asymmetric(&ct, alice.public(), bob.secret(), &different),
            Err(CryptoError::Authentication)
        ));
        assert_eq!(
            open_asymmetric(&ct, alice.public(), bob.secret(), &sealed_with).unwrap(),
            b"0123456789"
        );
    }

    #[test]
    fn open_fails_with_wrong_nonce_key_or_flip() {
        let alice = pair(1);
        let bob = pair(2);
        let eve = pair(3);
        let mut rng = StdRng::seed_from_u64(5);
        let nonce = Nonce::random(&mut rng);
        let ct = seal_asymmetric(b"secret", bob.public(), alice.secret(), &nonce).unwrap();

        let other = Nonce::random(&mut rng);
        assert!(matches!(
            open_asymmetric(&ct, alice.public(), bob.secret(), &other),
            Err(CryptoError::Authentication)
        ));
        assert!(matches!(
            open_asymmetric(&ct, alice.public(), eve.secret(), &nonce),
            Err(CryptoError::Authentication)
        ));

        let mut flipped = ct.clone();
        flipped[3] ^= 0x01;
        assert!(matches!(
            open_asymmetric(&flipped, alice.public(), bob.secret(), &nonce),
            Err(CryptoError::Authentication)
        ));
        assert!(open_asymmetric(&ct[..10], alice.public(), bob.secret(), &nonce).is_err());
    }

    #[test]
    fn blob_nonce_layout() {
        let bytes = BLOB_NONCE.as_bytes();
        assert!(bytes[..23].iter().all(|&b| b == 0));
        assert_eq!(bytes[23], 0x01);
    }

    #[test]
    fn symmetric_blob_round_trip() {
        let mut rng = StdRng::seed_from_u64(6);
        let data = vec![0xA5u8; 1000];
        let (key, ct) = seal_blob_symmetric(&mut rng, &data).unwrap();
        assert_eq!(ct.len(), 1016);
        assert_eq!(open_blob_symmetric(&ct, &key).unwrap(), data);

        let mut wrong = key;
        wrong[0] ^= 1;
        assert!(matches!(
            open_blob_symmetric(&ct, &wrong),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn end_to_end_nonces_are_fresh() {
        let alice = pair(1);
        let bob = pair(2);
        let mut rng = StdRng::seed_from_u64(7);
        let (n1, c1) = seal_end_to_end(&mut rng, b"x", bob.public(), alice.secret()).unwrap();
        let (n2, c2) = seal_end_to_end(&mut rng, b"x", bob.public(), alice.secret()).unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
        assert_eq!(open_asymmetric(&c2, alice.public(), bob.secret(), &n2).unwrap(), b"x");
    }
}
