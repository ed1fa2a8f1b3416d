//! Single AES-128 block encryption, used directly by the network layer's
//! obfuscation step (it is not an AEAD operation, just `e(key, plaintext)`).

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

/// `e(key, plaintext)`: one AES-128 ECB block encryption.
pub fn e(key: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new_from_slice(key).expect("AES-128 key is always 16 bytes");
    let mut block = (*plaintext).into();
    cipher.encrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypting_twice_with_same_key_is_deterministic() {
        let key = [0x42u8; 16];
        let pt = [0x01u8; 16];
        assert_eq!(e(&key, &pt), e(&key, &pt));
    }

    #[test]
    fn different_keys_give_different_ciphertext() {
        let pt = [0x01u8; 16];
        assert_ne!(e(&[0x00; 16], &pt), e(&[0x01; 16], &pt));
    }
}
