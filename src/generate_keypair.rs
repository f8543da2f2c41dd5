//! RSA private key generation.
//!
//! Keys are always RSA-2048 with the F4 public exponent (65537). Every
//! intermediate OpenSSL object is owned by a Rust value, so an error at any
//! step frees what was already allocated exactly once.

use openssl::bn::BigNum;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;

use crate::error::CryptoError;

/// Modulus length of generated keys.
pub const RSA_KEY_BITS: u32 = 2048;

/// Public exponent of generated keys (RSA_F4).
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// Generate a fresh RSA private key.
///
/// # Errors
/// Each failing OpenSSL step maps to its own [`CryptoError`] variant:
/// exponent allocation, exponent assignment, RSA generation and wrapping the
/// RSA key into a `PKey`.
pub fn generate_keypair() -> Result<PKey<Private>, CryptoError> {
    let mut exponent = BigNum::new().map_err(|source| CryptoError::Allocation {
        what: "RSA exponent",
        source,
    })?;
    exponent
        .add_word(RSA_PUBLIC_EXPONENT)
        .map_err(CryptoError::ExponentSetup)?;

    let rsa = Rsa::generate_with_e(RSA_KEY_BITS, &exponent).map_err(CryptoError::KeyGeneration)?;

    PKey::from_rsa(rsa).map_err(CryptoError::KeyAssign)
}
