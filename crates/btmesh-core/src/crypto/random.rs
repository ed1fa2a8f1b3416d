//! CSPRNG-backed randomness for provisioning randoms and key material.

use rand_core::{OsRng, RngCore};

/// Fills `buf` with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Returns a fresh random 128-bit value, used for provisioning randoms.
pub fn random_128() -> [u8; 16] {
    let mut buf = [0u8; 16];
    fill_random(&mut buf);
    buf
}
