//! Key pair and serial number generation.

use rcgen::{KeyPair, SerialNumber};
use ring::rand::{SecureRandom, SystemRandom};

use crate::config::KeyAlgorithm;
use crate::error::CryptoError;

const SERIAL_LEN: usize = 16;

/// Generate a fresh key pair for the configured algorithm.
pub(crate) fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair, CryptoError> {
    KeyPair::generate_for(algorithm.signature_algorithm()).map_err(CryptoError::from)
}

/// Generate a random, positive 128-bit serial number.
pub(crate) fn random_serial() -> Result<SerialNumber, CryptoError> {
    let mut bytes = [0u8; SERIAL_LEN];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CryptoError::new("system randomness unavailable"))?;
    // Positive and without a leading zero octet.
    bytes[0] = (bytes[0] & 0x3f) | 0x40;
    Ok(SerialNumber::from_slice(&bytes))
}

/// Compute the SHA-256 fingerprint of DER-encoded certificate bytes.
pub(crate) fn sha256_fingerprint(der: &[u8]) -> String {
    use std::fmt::Write;
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    let mut fingerprint = String::from("SHA256:");
    for (i, byte) in digest.as_ref().iter().enumerate() {
        if i > 0 {
            fingerprint.push(':');
        }
        let _ = write!(fingerprint, "{byte:02x}");
    }
    fingerprint
}
