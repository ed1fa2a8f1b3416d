//! Network, application and device keys, and the store that derives and
//! caches their dependent material.

use crate::crypto::{k1, k2, k3, k4, s1, K2Output};

/// Where a network key sits in the key-refresh procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefreshPhase {
    NormalOperation,
    DistributingKeys,
    Finalizing,
}

/// Derived material for one network key generation (current or old).
#[derive(Debug, Clone)]
pub struct NetworkKeyMaterial {
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
    pub beacon_key: [u8; 16],
    pub identity_key: [u8; 16],
    pub network_id: u64,
}

impl NetworkKeyMaterial {
    fn derive(key: &[u8; 16]) -> Self {
        let K2Output {
            nid,
            encryption_key,
            privacy_key,
        } = k2(key, &[0x00]);
        let beacon_salt = s1(b"nkbk");
        let beacon_key = k1(key, &beacon_salt, b"id128\x01");
        let identity_salt = s1(b"nkik");
        let identity_key = k1(key, &identity_salt, b"id128\x01");
        let network_id = k3(key);
        Self {
            nid,
            encryption_key,
            privacy_key,
            beacon_key,
            identity_key,
            network_id,
        }
    }
}

/// A network key, its refresh-phase state, and its derived material.
pub struct NetworkKey {
    index: u16,
    key: [u8; 16],
    material: NetworkKeyMaterial,
    old_key: Option<[u8; 16]>,
    old_material: Option<NetworkKeyMaterial>,
    phase: KeyRefreshPhase,
    phase_changed_at: Option<u64>,
}

impl NetworkKey {
    pub fn new(index: u16, key: [u8; 16]) -> Self {
        let material = NetworkKeyMaterial::derive(&key);
        Self {
            index,
            key,
            material,
            old_key: None,
            old_material: None,
            phase: KeyRefreshPhase::NormalOperation,
            phase_changed_at: None,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// When the key-refresh phase last changed, in the same time base the
    /// caller uses for `IvIndexState::hours_in_state`. `None` before the
    /// first phase transition.
    pub fn phase_changed_at(&self) -> Option<u64> {
        self.phase_changed_at
    }

    pub fn current(&self) -> &NetworkKeyMaterial {
        &self.material
    }

    pub fn old(&self) -> Option<&NetworkKeyMaterial> {
        self.old_material.as_ref()
    }

    pub fn raw_current(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn raw_old(&self) -> Option<&[u8; 16]> {
        self.old_key.as_ref()
    }

    /// Begins key-refresh distribution: the new key becomes "current" for
    /// receive, while outbound traffic keeps using the old key until
    /// `finalize` is called.
    pub fn begin_refresh(&mut self, new_key: [u8; 16], now: u64) {
        self.old_key = Some(self.key);
        self.old_material = Some(self.material.clone());
        self.key = new_key;
        self.material = NetworkKeyMaterial::derive(&new_key);
        self.phase = KeyRefreshPhase::DistributingKeys;
        self.phase_changed_at = Some(now);
    }

    /// Completes key-refresh: the old key generation is discarded and the
    /// node transmits with the new key.
    pub fn finalize_refresh(&mut self, now: u64) {
        self.old_key = None;
        self.old_material = None;
        self.phase = KeyRefreshPhase::NormalOperation;
        self.phase_changed_at = Some(now);
    }

    /// Which key generation outbound PDUs must be transmitted under, per
    /// the refresh-phase invariant: old keys during distribution, new
    /// keys once finalizing or in normal operation.
    pub fn transmit_material(&self) -> &NetworkKeyMaterial {
        match self.phase {
            KeyRefreshPhase::DistributingKeys => self.old_material.as_ref().unwrap_or(&self.material),
            _ => &self.material,
        }
    }

    pub fn transmit_raw_key(&self) -> &[u8; 16] {
        match self.phase {
            KeyRefreshPhase::DistributingKeys => self.old_key.as_ref().unwrap_or(&self.key),
            _ => &self.key,
        }
    }

    /// Returns `(raw key, material)` pairs to try when decoding an inbound
    /// PDU whose NID matches, trying current then old.
    pub fn candidates_for_nid(&self, nid: u8) -> Vec<(&[u8; 16], &NetworkKeyMaterial)> {
        let mut out = Vec::new();
        if self.material.nid == nid {
            out.push((&self.key, &self.material));
        }
        if let (Some(old_key), Some(old_material)) = (&self.old_key, &self.old_material) {
            if old_material.nid == nid {
                out.push((old_key, old_material));
            }
        }
        out
    }
}

/// An application key bound to exactly one network key.
pub struct ApplicationKey {
    index: u16,
    bound_net_key_index: u16,
    key: [u8; 16],
    aid: u8,
    old_key: Option<[u8; 16]>,
    old_aid: Option<u8>,
}

impl ApplicationKey {
    pub fn new(index: u16, bound_net_key_index: u16, key: [u8; 16]) -> Self {
        let aid = k4(&key);
        Self {
            index,
            bound_net_key_index,
            key,
            aid,
            old_key: None,
            old_aid: None,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn bound_net_key_index(&self) -> u16 {
        self.bound_net_key_index
    }

    pub fn aid(&self) -> u8 {
        self.aid
    }

    pub fn raw_key(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn begin_refresh(&mut self, new_key: [u8; 16]) {
        self.old_key = Some(self.key);
        self.old_aid = Some(self.aid);
        self.key = new_key;
        self.aid = k4(&new_key);
    }

    pub fn finalize_refresh(&mut self) {
        self.old_key = None;
        self.old_aid = None;
    }

    /// Returns `(key, aid)` pairs to try for a given AID on decode.
    pub fn candidates_for_aid(&self, aid: u8) -> Vec<(&[u8; 16], u8)> {
        let mut out = Vec::new();
        if self.aid == aid {
            out.push((&self.key, self.aid));
        }
        if let (Some(old_key), Some(old_aid)) = (&self.old_key, self.old_aid) {
            if old_aid == aid {
                out.push((old_key, old_aid));
            }
        }
        out
    }
}

/// A per-node device key, derived once during provisioning.
#[derive(Debug, Clone, Copy)]
pub struct DeviceKey(pub [u8; 16]);

/// Owns all key material for the local node: the set of network keys it
/// participates in, application keys, and device keys of peer nodes it has
/// provisioned (as a provisioner) or its own device key (as a device).
#[derive(Default)]
pub struct KeyStore {
    network_keys: Vec<NetworkKey>,
    application_keys: Vec<ApplicationKey>,
    device_keys: std::collections::HashMap<u16, DeviceKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_network_key(&mut self, key: NetworkKey) {
        self.network_keys.retain(|k| k.index() != key.index());
        self.network_keys.push(key);
    }

    pub fn insert_application_key(&mut self, key: ApplicationKey) {
        self.application_keys.retain(|k| k.index() != key.index());
        self.application_keys.push(key);
    }

    pub fn insert_device_key(&mut self, unicast_address: u16, key: DeviceKey) {
        self.device_keys.insert(unicast_address, key);
    }

    pub fn device_key(&self, unicast_address: u16) -> Option<&DeviceKey> {
        self.device_keys.get(&unicast_address)
    }

    pub fn network_key(&self, index: u16) -> Option<&NetworkKey> {
        self.network_keys.iter().find(|k| k.index() == index)
    }

    pub fn network_key_mut(&mut self, index: u16) -> Option<&mut NetworkKey> {
        self.network_keys.iter_mut().find(|k| k.index() == index)
    }

    pub fn network_keys(&self) -> impl Iterator<Item = &NetworkKey> {
        self.network_keys.iter()
    }

    pub fn application_keys(&self) -> impl Iterator<Item = &ApplicationKey> {
        self.application_keys.iter()
    }

    pub fn application_keys_for_net_key(&self, net_key_index: u16) -> impl Iterator<Item = &ApplicationKey> {
        self.application_keys
            .iter()
            .filter(move |k| k.bound_net_key_index() == net_key_index)
    }

    /// Network keys whose current or old NID matches, across every known
    /// network key, used when the inbound PDU's bound key is not yet known.
    pub fn network_keys_by_nid(&self, nid: u8) -> impl Iterator<Item = &NetworkKey> {
        self.network_keys
            .iter()
            .filter(move |k| k.current().nid == nid || k.old().map(|m| m.nid) == Some(nid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_key_derivation_matches_vector() {
        let key = [
            0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84,
            0xc3, 0xd6,
        ];
        let nk = NetworkKey::new(0, key);
        assert_eq!(nk.current().nid, 0x68);
    }

    #[test]
    fn refresh_distribution_transmits_old_key() {
        let mut nk = NetworkKey::new(0, [0x11; 16]);
        let original_key = *nk.raw_current();
        nk.begin_refresh([0x22; 16], 10);
        assert_eq!(nk.phase(), KeyRefreshPhase::DistributingKeys);
        assert_eq!(nk.phase_changed_at(), Some(10));
        assert_eq!(*nk.transmit_raw_key(), original_key);
        nk.finalize_refresh(20);
        assert_eq!(nk.phase(), KeyRefreshPhase::NormalOperation);
        assert_eq!(nk.phase_changed_at(), Some(20));
        assert_eq!(*nk.transmit_raw_key(), [0x22; 16]);
    }

    #[test]
    fn application_key_aid_under_six_bits() {
        let ak = ApplicationKey::new(0, 0, [0x33; 16]);
        assert!(ak.aid() <= 0x3F);
    }
}
