//! Cryptographic primitives: AES-CMAC, AES-CCM, single-block AES, P-256
//! ECDH, mesh key derivation (s1/k1/k2/k3/k4), and randomness.
//!
//! Every function here is pure and stateless; callers may invoke them
//! freely from the single-threaded core without synchronization.

pub mod block;
pub mod ccm;
pub mod cmac;
pub mod ecdh;
pub mod kdf;
pub mod random;

pub use block::e;
pub use cmac::aes_cmac;
pub use ecdh::KeyPair as EcdhKeyPair;
pub use kdf::{k1, k2, k3, k4, s1, K2Output};
