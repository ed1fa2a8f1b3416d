//! P-256 ECDH key agreement used by the provisioning handshake and the
//! (legacy, OOB-free) device-key derivation path.

use p256::ecdh::diffie_hellman;
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand_core::OsRng;

use crate::error::CryptoError;

/// A provisioning ECDH key pair: the private scalar plus its uncompressed
/// public point, exposed in the 64-byte X||Y wire form used by the
/// Provisioning Public Key PDU.
pub struct KeyPair {
    secret: SecretKey,
    public_xy: [u8; 64],
}

impl KeyPair {
    /// Generates a fresh P-256 key pair using the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        let public_xy = encode_public_xy(&public);
        Self { secret, public_xy }
    }

    pub fn public_xy(&self) -> [u8; 64] {
        self.public_xy
    }

    /// Computes the ECDH shared secret's X-coordinate against a peer's
    /// public key given in the 64-byte X||Y wire form.
    pub fn shared_secret(&self, peer_public_xy: &[u8; 64]) -> Result<[u8; 32], CryptoError> {
        let peer_public = decode_public_xy(peer_public_xy)?;
        let scalar = self.secret.to_nonzero_scalar();
        let shared = diffie_hellman(&scalar, peer_public.as_affine());
        let bytes = shared.raw_secret_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes.as_slice());
        Ok(out)
    }
}

fn encode_public_xy(public: &PublicKey) -> [u8; 64] {
    let encoded = public.to_encoded_point(false);
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(encoded.x().expect("uncompressed point has an x coordinate"));
    out[32..].copy_from_slice(encoded.y().expect("uncompressed point has a y coordinate"));
    out
}

fn decode_public_xy(xy: &[u8; 64]) -> Result<PublicKey, CryptoError> {
    let encoded = EncodedPoint::from_affine_coordinates(
        (&xy[..32]).into(),
        (&xy[32..]).into(),
        false,
    );
    PublicKey::from_encoded_point(&encoded)
        .into_option()
        .ok_or(CryptoError::EcdhFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let sa = a.shared_secret(&b.public_xy()).unwrap();
        let sb = b.shared_secret(&a.public_xy()).unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn rejects_invalid_peer_point() {
        let a = KeyPair::generate();
        let bogus = [0xFFu8; 64];
        assert!(a.shared_secret(&bogus).is_err());
    }
}
