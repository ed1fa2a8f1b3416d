//! Provisioning FSM: the ECDH handshake, confirmation/random exchange, and
//! provisioning-data delivery that bring an unprovisioned device into the
//! network.

use crate::crypto::{aes_cmac, ccm, k1, random::random_128, s1, EcdhKeyPair};
use crate::error::ProvisioningError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    Invited,
    CapabilitiesReceived,
    Started,
    PublicKeysExchanged,
    Authenticating,
    Confirmed,
    RandomExchanged,
    DataSent,
    Complete,
    Failed,
}

/// Provisioning PDU opcode byte, per the provisioning-PDU type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningOpcode {
    Invite = 0x00,
    Capabilities = 0x01,
    Start = 0x02,
    PublicKey = 0x03,
    InputComplete = 0x04,
    Confirmation = 0x05,
    Random = 0x06,
    Data = 0x07,
    Complete = 0x08,
    Failed = 0x09,
}

impl ProvisioningOpcode {
    pub fn from_byte(b: u8) -> Result<Self, ProvisioningError> {
        use ProvisioningOpcode::*;
        Ok(match b {
            0x00 => Invite,
            0x01 => Capabilities,
            0x02 => Start,
            0x03 => PublicKey,
            0x04 => InputComplete,
            0x05 => Confirmation,
            0x06 => Random,
            0x07 => Data,
            0x08 => Complete,
            0x09 => Failed,
            _ => return Err(ProvisioningError::InvalidPdu),
        })
    }
}

/// Data carried in the final Provisioning Data PDU: everything a
/// newly-provisioned device needs to join the network.
#[derive(Debug, Clone)]
pub struct ProvisioningData {
    pub network_key: [u8; 16],
    pub key_index: u16,
    pub flags: u8,
    pub iv_index: u32,
    pub unicast_address: u16,
}

impl ProvisioningData {
    fn encode(&self) -> [u8; 25] {
        let mut out = [0u8; 25];
        out[0..16].copy_from_slice(&self.network_key);
        out[16..18].copy_from_slice(&self.key_index.to_be_bytes());
        out[18] = self.flags;
        out[19..23].copy_from_slice(&self.iv_index.to_be_bytes());
        out[23..25].copy_from_slice(&self.unicast_address.to_be_bytes());
        out
    }

    fn decode(data: &[u8; 25]) -> Self {
        Self {
            network_key: data[0..16].try_into().unwrap(),
            key_index: u16::from_be_bytes([data[16], data[17]]),
            flags: data[18],
            iv_index: u32::from_be_bytes([data[19], data[20], data[21], data[22]]),
            unicast_address: u16::from_be_bytes([data[23], data[24]]),
        }
    }
}

/// Session-derived keys computed once the confirmation/random exchange
/// completes.
struct SessionKeys {
    session_key: [u8; 16],
    session_nonce: [u8; 13],
    device_key: [u8; 16],
}

fn derive_session_keys(shared_secret: &[u8; 32], provisioning_salt: &[u8; 16]) -> SessionKeys {
    let session_key = k1(shared_secret, provisioning_salt, b"prsk");
    let nonce_full = k1(shared_secret, provisioning_salt, b"prsn");
    let mut session_nonce = [0u8; 13];
    session_nonce.copy_from_slice(&nonce_full[3..16]);
    let device_key = k1(shared_secret, provisioning_salt, b"prdk");
    SessionKeys { session_key, session_nonce, device_key }
}

/// One side (provisioner or device) of an in-progress provisioning
/// handshake. The two roles drive the same state machine from opposite
/// ends; which PDUs a caller sends versus receives depends on `is_provisioner`.
pub struct ProvisioningSession {
    pub state: ProvisioningState,
    is_provisioner: bool,
    confirmation_inputs: Vec<u8>,
    key_pair: Option<EcdhKeyPair>,
    local_public_xy: Option<[u8; 64]>,
    peer_public_xy: Option<[u8; 64]>,
    shared_secret: Option<[u8; 32]>,
    confirmation_key: Option<[u8; 16]>,
    confirmation_salt: Option<[u8; 16]>,
    auth_value: [u8; 16],
    local_random: Option<[u8; 16]>,
    peer_random: Option<[u8; 16]>,
    peer_confirmation: Option<[u8; 16]>,
    session_keys: Option<SessionKeys>,
}

impl ProvisioningSession {
    pub fn new(is_provisioner: bool) -> Self {
        Self {
            state: ProvisioningState::Idle,
            is_provisioner,
            confirmation_inputs: Vec::new(),
            key_pair: None,
            local_public_xy: None,
            peer_public_xy: None,
            shared_secret: None,
            confirmation_key: None,
            confirmation_salt: None,
            auth_value: [0u8; 16],
            local_random: None,
            peer_random: None,
            peer_confirmation: None,
            session_keys: None,
        }
    }

    fn fail(&mut self, err: ProvisioningError) -> ProvisioningError {
        self.state = ProvisioningState::Failed;
        err
    }

    /// Step 1: accumulate an Invite PDU (sent by the provisioner).
    pub fn accumulate_invite(&mut self, attention_sec: u8) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Idle {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        self.confirmation_inputs.push(attention_sec);
        self.state = ProvisioningState::Invited;
        Ok(())
    }

    /// Step 2: accumulate a Capabilities PDU (sent by the device).
    pub fn accumulate_capabilities(&mut self, raw: &[u8]) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Invited {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        self.confirmation_inputs.extend_from_slice(raw);
        self.state = ProvisioningState::CapabilitiesReceived;
        Ok(())
    }

    /// Step 3: accumulate a Start PDU; only the FIPS P-256 algorithm is
    /// supported.
    pub fn accumulate_start(&mut self, raw: &[u8], algorithm: u8) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::CapabilitiesReceived {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        if algorithm != 0x00 {
            return Err(self.fail(ProvisioningError::UnsupportedAlgorithm));
        }
        self.confirmation_inputs.extend_from_slice(raw);
        self.state = ProvisioningState::Started;
        Ok(())
    }

    /// Step 4a: generate our own ECDH key pair and accumulate our public
    /// key into the confirmation inputs.
    pub fn generate_key_pair(&mut self) -> Result<[u8; 64], ProvisioningError> {
        if self.state != ProvisioningState::Started {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        let key_pair = EcdhKeyPair::generate();
        let public_xy = key_pair.public_xy();
        self.key_pair = Some(key_pair);
        self.local_public_xy = Some(public_xy);
        if self.is_provisioner {
            self.confirmation_inputs.extend_from_slice(&public_xy);
        }
        Ok(public_xy)
    }

    /// Step 4b: receive the peer's public key, accumulate it, and derive
    /// the ECDH shared secret.
    pub fn receive_peer_public_key(&mut self, peer_public_xy: [u8; 64]) -> Result<(), ProvisioningError> {
        let key_pair = self.key_pair.as_ref().ok_or_else(|| ProvisioningError::InvalidState)?;
        // ConfirmationInputs always accumulates ProvisionerPublicKey then
        // DevicePublicKey, regardless of which side is computing it.
        if self.is_provisioner {
            self.confirmation_inputs.extend_from_slice(&peer_public_xy);
        } else {
            self.confirmation_inputs.extend_from_slice(&peer_public_xy);
            self.confirmation_inputs.extend_from_slice(&self.local_public_xy.unwrap());
        }
        self.peer_public_xy = Some(peer_public_xy);
        let shared = key_pair
            .shared_secret(&peer_public_xy)
            .map_err(|_| self.fail(ProvisioningError::KeyGenerationFailed))?;
        self.shared_secret = Some(shared);
        self.state = ProvisioningState::PublicKeysExchanged;
        Ok(())
    }

    /// Step 5: set the authentication value (all-zero for no-OOB).
    pub fn set_auth_value(&mut self, auth_value: [u8; 16]) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::PublicKeysExchanged {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        self.auth_value = auth_value;
        self.state = ProvisioningState::Authenticating;
        Ok(())
    }

    /// Step 6: compute our own confirmation value to send to the peer.
    pub fn compute_confirmation(&mut self) -> Result<[u8; 16], ProvisioningError> {
        if self.state != ProvisioningState::Authenticating {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        let shared_secret = self.shared_secret.ok_or_else(|| ProvisioningError::InvalidState)?;
        let confirmation_salt = s1(&self.confirmation_inputs);
        let confirmation_key = k1(&shared_secret, &confirmation_salt, b"prck");
        self.confirmation_salt = Some(confirmation_salt);
        self.confirmation_key = Some(confirmation_key);

        let random = random_128();
        self.local_random = Some(random);

        let mut input = Vec::with_capacity(32);
        input.extend_from_slice(&random);
        input.extend_from_slice(&self.auth_value);
        Ok(aes_cmac(&confirmation_key, &input))
    }

    /// Receives the peer's confirmation value (to be checked once randoms
    /// are exchanged).
    pub fn receive_peer_confirmation(&mut self, confirmation: [u8; 16]) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Authenticating {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        self.peer_confirmation = Some(confirmation);
        self.state = ProvisioningState::Confirmed;
        Ok(())
    }

    pub fn local_random(&self) -> Option<[u8; 16]> {
        self.local_random
    }

    /// Step 7: receive the peer's random, verify their confirmation, and
    /// derive the provisioning salt and session keys.
    pub fn receive_peer_random(&mut self, peer_random: [u8; 16]) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Confirmed {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        let confirmation_key = self.confirmation_key.ok_or_else(|| ProvisioningError::InvalidState)?;
        let peer_confirmation = self.peer_confirmation.ok_or_else(|| ProvisioningError::InvalidState)?;

        let mut input = Vec::with_capacity(32);
        input.extend_from_slice(&peer_random);
        input.extend_from_slice(&self.auth_value);
        let recomputed = aes_cmac(&confirmation_key, &input);
        if recomputed != peer_confirmation {
            return Err(self.fail(ProvisioningError::ConfirmationFailed));
        }

        self.peer_random = Some(peer_random);
        let confirmation_salt = self.confirmation_salt.ok_or_else(|| ProvisioningError::InvalidState)?;
        let local_random = self.local_random.ok_or_else(|| ProvisioningError::InvalidState)?;
        let shared_secret = self.shared_secret.ok_or_else(|| ProvisioningError::InvalidState)?;

        let (provisioner_random, device_random) = if self.is_provisioner {
            (local_random, peer_random)
        } else {
            (peer_random, local_random)
        };
        let mut salt_input = Vec::with_capacity(48);
        salt_input.extend_from_slice(&confirmation_salt);
        salt_input.extend_from_slice(&provisioner_random);
        salt_input.extend_from_slice(&device_random);
        let provisioning_salt = s1(&salt_input);

        self.session_keys = Some(derive_session_keys(&shared_secret, &provisioning_salt));
        self.state = ProvisioningState::RandomExchanged;
        Ok(())
    }

    /// Step 9 (provisioner side): encrypts the provisioning data under the
    /// derived session key/nonce.
    pub fn encrypt_provisioning_data(&mut self, data: &ProvisioningData) -> Result<Vec<u8>, ProvisioningError> {
        if self.state != ProvisioningState::RandomExchanged {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        let keys = self.session_keys.as_ref().ok_or_else(|| ProvisioningError::InvalidState)?;
        let mut plaintext = data.encode().to_vec();
        ccm::encrypt_64(&keys.session_key, &keys.session_nonce, &[], &mut plaintext)
            .map_err(|_| self.fail(ProvisioningError::InvalidPdu))?;
        self.state = ProvisioningState::DataSent;
        Ok(plaintext)
    }

    /// Step 9 (device side): decrypts the provisioning data PDU.
    pub fn decrypt_provisioning_data(&mut self, ciphertext: &[u8]) -> Result<ProvisioningData, ProvisioningError> {
        if self.state != ProvisioningState::RandomExchanged {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        if ciphertext.len() != 33 {
            return Err(self.fail(ProvisioningError::InvalidPdu));
        }
        let keys = self.session_keys.as_ref().ok_or_else(|| ProvisioningError::InvalidState)?;
        let mut buf = ciphertext.to_vec();
        ccm::decrypt_64(&keys.session_key, &keys.session_nonce, &[], &mut buf)
            .map_err(|_| self.fail(ProvisioningError::ConfirmationFailed))?;
        let data_bytes: [u8; 25] = buf.try_into().map_err(|_| ProvisioningError::InvalidPdu)?;
        self.state = ProvisioningState::DataSent;
        Ok(ProvisioningData::decode(&data_bytes))
    }

    pub fn device_key(&self) -> Option<[u8; 16]> {
        self.session_keys.as_ref().map(|k| k.device_key)
    }

    pub fn is_provisioner(&self) -> bool {
        self.is_provisioner
    }

    pub fn complete(&mut self) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::DataSent {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        self.state = ProvisioningState::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_derives_matching_keys_on_both_sides() {
        let mut provisioner = ProvisioningSession::new(true);
        let mut device = ProvisioningSession::new(false);

        provisioner.accumulate_invite(5).unwrap();
        device.accumulate_invite(5).unwrap();

        let capabilities = [0u8; 11];
        provisioner.accumulate_capabilities(&capabilities).unwrap();
        device.accumulate_capabilities(&capabilities).unwrap();

        let start = [0u8; 5];
        provisioner.accumulate_start(&start, 0x00).unwrap();
        device.accumulate_start(&start, 0x00).unwrap();

        let provisioner_pub = provisioner.generate_key_pair().unwrap();
        let device_pub = device.generate_key_pair().unwrap();

        provisioner.receive_peer_public_key(device_pub).unwrap();
        device.receive_peer_public_key(provisioner_pub).unwrap();

        let auth_value = [0u8; 16];
        provisioner.set_auth_value(auth_value).unwrap();
        device.set_auth_value(auth_value).unwrap();

        let provisioner_confirmation = provisioner.compute_confirmation().unwrap();
        let device_confirmation = device.compute_confirmation().unwrap();

        provisioner.receive_peer_confirmation(device_confirmation).unwrap();
        device.receive_peer_confirmation(provisioner_confirmation).unwrap();

        let provisioner_random = provisioner.local_random().unwrap();
        let device_random = device.local_random().unwrap();

        provisioner.receive_peer_random(device_random).unwrap();
        device.receive_peer_random(provisioner_random).unwrap();

        assert_eq!(provisioner.device_key(), device.device_key());

        let data = ProvisioningData {
            network_key: [0x01; 16],
            key_index: 0,
            flags: 0,
            iv_index: 0,
            unicast_address: 0x0003,
        };
        let ciphertext = provisioner.encrypt_provisioning_data(&data).unwrap();
        let decoded = device.decrypt_provisioning_data(&ciphertext).unwrap();
        assert_eq!(decoded.network_key, data.network_key);
        assert_eq!(decoded.unicast_address, data.unicast_address);

        provisioner.complete().unwrap();
        device.complete().unwrap();
    }

    #[test]
    fn mismatched_confirmation_is_rejected() {
        let mut provisioner = ProvisioningSession::new(true);
        provisioner.accumulate_invite(0).unwrap();
        provisioner.accumulate_capabilities(&[0u8; 11]).unwrap();
        provisioner.accumulate_start(&[0u8; 5], 0x00).unwrap();
        let device_pair = EcdhKeyPair::generate();
        provisioner.generate_key_pair().unwrap();
        provisioner.receive_peer_public_key(device_pair.public_xy()).unwrap();
        provisioner.set_auth_value([0u8; 16]).unwrap();
        provisioner.compute_confirmation().unwrap();
        provisioner.receive_peer_confirmation([0xFFu8; 16]).unwrap();

        let result = provisioner.receive_peer_random([0x11u8; 16]);
        assert!(result.is_err());
        assert_eq!(provisioner.state, ProvisioningState::Failed);
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let mut session = ProvisioningSession::new(true);
        session.accumulate_invite(0).unwrap();
        session.accumulate_capabilities(&[0u8; 11]).unwrap();
        assert!(session.accumulate_start(&[0u8; 5], 0x01).is_err());
    }
}
