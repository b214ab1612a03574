//! Random message padding.
//!
//! Every message body (except typing notifications) ends in `p` bytes of
//! value `p`, with `p` drawn uniformly from `[0, 255)`. This hides the exact
//! body length from anyone who only sees ciphertext sizes.
//!
//! A padding length of zero is legal, which makes the trailing bytes of a
//! body ambiguous when they happen to look like padding themselves. The
//! encoder therefore never pairs `p = 0` with such a body; see
//! [`append_padding`].

use rand::{CryptoRng, Rng, RngCore};

use crate::CodecError;

/// Exclusive upper bound for the padding length.
pub const PADDING_BOUND: u8 = 255;

/// Padding of length `p`, each byte equal to `p`.
pub fn padding(p: u8) -> Vec<u8> {
    vec![p; p as usize]
}

/// Draw a padding length in `[0, 255)`.
pub fn random_padding_len<R: RngCore + CryptoRng>(rng: &mut R) -> u8 {
    rng.gen_range(0..PADDING_BOUND)
}

/// Append random padding to `body` and return the chosen length.
///
/// A zero length is redrawn when the body's own tail would otherwise be
/// mistaken for padding on decode.
pub fn append_padding<R: RngCore + CryptoRng>(rng: &mut R, body: &mut Vec<u8>) -> u8 {
    let ambiguous = trailing_padding_len(body) > 0;
    let p = loop {
        let p = random_padding_len(rng);
        if p != 0 || !ambiguous {
            break p;
        }
    };
    body.extend_from_slice(&padding(p));
    p
}

/// Length of the well-formed padding at the end of `data`, or 0.
pub fn trailing_padding_len(data: &[u8]) -> usize {
    let Some(&p) = data.last() else {
        return 0;
    };
    let p = p as usize;
    if p == 0 || p > data.len() {
        return 0;
    }
    if data[data.len() - p..].iter().all(|&b| b as usize == p) {
        p
    } else {
        0
    }
}

/// `data` with its trailing padding removed.
pub fn strip_padding(data: &[u8]) -> &[u8] {
    &data[..data.len() - trailing_padding_len(data)]
}

/// Require `rest` to be exactly one well-formed padding run (possibly empty).
pub fn check_padding(rest: &[u8]) -> Result<(), CodecError> {
    if rest.is_empty() || trailing_padding_len(rest) == rest.len() {
        Ok(())
    } else {
        Err(CodecError::InvalidPadding)
    }
}
