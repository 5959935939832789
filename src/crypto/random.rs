//! CSPRNG helpers
//!
//! All randomness in the messaging core comes through here, backed by the
//! operating system RNG.

use rand::rngs::OsRng;
use rand::RngCore;

/// Fill a buffer with cryptographically secure random bytes
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Fresh 32-byte random value (message ids, key material)
pub fn random_32() -> [u8; 32] {
    let mut out = [0u8; 32];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fresh 24-byte nonce for the outer message layer
pub fn random_nonce_24() -> [u8; 24] {
    let mut out = [0u8; 24];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fresh 12-byte nonce for AES-GCM
pub fn random_nonce_12() -> [u8; 12] {
    let mut out = [0u8; 12];
    OsRng.fill_bytes(&mut out);
    out
}

/// Uniform value in `[0, 1)` for scheduling decisions
pub fn random_unit_f64() -> f64 {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Uniform signed jitter in `[-range, +range]` milliseconds
pub fn random_jitter_ms(range: i64) -> i64 {
    if range <= 0 {
        return 0;
    }
    let span = (range as u128) * 2 + 1;
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let sample = (u128::from_be_bytes(bytes) % span) as i64;
    sample - range
}
