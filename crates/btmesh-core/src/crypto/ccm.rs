//! AES-CCM authenticated encryption, parameterized on MIC size.
//!
//! The mesh profile uses two MIC widths: 32 bits for access-layer traffic
//! and network PDUs carrying access payloads, and 64 bits for control PDUs
//! and provisioning data. Both use a 13-byte nonce.

use aes::Aes128;
use ccm::aead::generic_array::typenum::{U13, U4, U8};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::Ccm;

use crate::error::CryptoError;

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// Encrypts `data` in place and appends the MIC, using a 32-bit tag.
pub fn encrypt_32(key: &[u8; 16], nonce: &[u8; 13], aad: &[u8], data: &mut Vec<u8>) -> Result<(), CryptoError> {
    let cipher = Ccm32::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, data)
        .map_err(|_| CryptoError::EncryptFailed)?;
    data.extend_from_slice(&tag);
    Ok(())
}

/// Decrypts `data` (ciphertext, MIC appended) in place, using a 32-bit tag.
pub fn decrypt_32(key: &[u8; 16], nonce: &[u8; 13], aad: &[u8], data: &mut Vec<u8>) -> Result<(), CryptoError> {
    const TAG_LEN: usize = 4;
    if data.len() < TAG_LEN {
        return Err(CryptoError::MicMismatch);
    }
    let split_at = data.len() - TAG_LEN;
    let tag_bytes = data.split_off(split_at);
    let cipher = Ccm32::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            data,
            GenericArray::from_slice(&tag_bytes),
        )
        .map_err(|_| CryptoError::MicMismatch)
}

/// Encrypts `data` in place and appends the MIC, using a 64-bit tag.
pub fn encrypt_64(key: &[u8; 16], nonce: &[u8; 13], aad: &[u8], data: &mut Vec<u8>) -> Result<(), CryptoError> {
    let cipher = Ccm64::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, data)
        .map_err(|_| CryptoError::EncryptFailed)?;
    data.extend_from_slice(&tag);
    Ok(())
}

/// Decrypts `data` (ciphertext, MIC appended) in place, using a 64-bit tag.
pub fn decrypt_64(key: &[u8; 16], nonce: &[u8; 13], aad: &[u8], data: &mut Vec<u8>) -> Result<(), CryptoError> {
    const TAG_LEN: usize = 8;
    if data.len() < TAG_LEN {
        return Err(CryptoError::MicMismatch);
    }
    let split_at = data.len() - TAG_LEN;
    let tag_bytes = data.split_off(split_at);
    let cipher = Ccm64::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            data,
            GenericArray::from_slice(&tag_bytes),
        )
        .map_err(|_| CryptoError::MicMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_32_bit_mic() {
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 13];
        let aad = b"dst-and-aad";
        let mut data = b"hello mesh".to_vec();
        encrypt_32(&key, &nonce, aad, &mut data).unwrap();
        assert_eq!(data.len(), "hello mesh".len() + 4);

        let mut roundtrip = data.clone();
        decrypt_32(&key, &nonce, aad, &mut roundtrip).unwrap();
        assert_eq!(roundtrip, b"hello mesh".to_vec());
    }

    #[test]
    fn round_trip_64_bit_mic() {
        let key = [0x33u8; 16];
        let nonce = [0x44u8; 13];
        let aad = b"";
        let mut data = b"control-pdu-payload".to_vec();
        encrypt_64(&key, &nonce, aad, &mut data).unwrap();
        assert_eq!(data.len(), "control-pdu-payload".len() + 8);

        let mut roundtrip = data.clone();
        decrypt_64(&key, &nonce, aad, &mut roundtrip).unwrap();
        assert_eq!(roundtrip, b"control-pdu-payload".to_vec());
    }

    #[test]
    fn tampered_ciphertext_fails_mic() {
        let key = [0x55u8; 16];
        let nonce = [0x66u8; 13];
        let mut data = b"tamper me".to_vec();
        encrypt_32(&key, &nonce, b"", &mut data).unwrap();
        data[0] ^= 0xFF;
        assert!(decrypt_32(&key, &nonce, b"", &mut data).is_err());
    }
}
