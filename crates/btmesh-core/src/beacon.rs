//! Secure Network Beacon authentication and the IV-Index acceptance FSM.

use crate::crypto::aes_cmac;
use crate::error::BeaconError;
use crate::keys::KeyStore;

/// The 22-byte Secure Network Beacon PDU, minus its leading beacon-type
/// octet (which the bearer layer already stripped to route it here).
#[derive(Debug, Clone, Copy)]
pub struct SecureNetworkBeacon {
    pub key_refresh_flag: bool,
    pub iv_update_flag: bool,
    pub network_id: u64,
    pub iv_index: u32,
    pub auth_value: [u8; 8],
}

impl SecureNetworkBeacon {
    pub fn decode(data: &[u8]) -> Result<Self, BeaconError> {
        if data.len() < 21 {
            return Err(BeaconError::Truncated);
        }
        let flags = data[0];
        let network_id = u64::from_be_bytes(data[1..9].try_into().unwrap());
        let iv_index = u32::from_be_bytes(data[9..13].try_into().unwrap());
        let mut auth_value = [0u8; 8];
        auth_value.copy_from_slice(&data[13..21]);
        Ok(Self {
            key_refresh_flag: flags & 0x01 != 0,
            iv_update_flag: flags & 0x02 != 0,
            network_id,
            iv_index,
            auth_value,
        })
    }

    fn flags(&self) -> u8 {
        (self.key_refresh_flag as u8) | ((self.iv_update_flag as u8) << 1)
    }

    /// Authenticates this beacon against every known network key's
    /// current and old beacon key, returning the network key index that
    /// authenticated it.
    pub fn authenticate(&self, keys: &KeyStore) -> Result<u16, BeaconError> {
        for net_key in keys.network_keys() {
            for material in [Some(net_key.current()), net_key.old()].into_iter().flatten() {
                if material.network_id != self.network_id {
                    continue;
                }
                let mut input = Vec::with_capacity(13);
                input.push(self.flags());
                input.extend_from_slice(&self.network_id.to_be_bytes());
                input.extend_from_slice(&self.iv_index.to_be_bytes());
                let tag = aes_cmac(&material.beacon_key, &input);
                if tag[..8] == self.auth_value {
                    return Ok(net_key.index());
                }
            }
        }
        Err(BeaconError::AuthFailed)
    }
}

/// IV-Index FSM state: the accepted index, whether an IV-Update is in
/// progress, and when the current state was entered (as hours since some
/// epoch the caller chooses consistently; `None` means "never observed a
/// beacon yet").
#[derive(Debug, Clone, Copy)]
pub struct IvIndexState {
    pub index: u32,
    pub update_active: bool,
    pub hours_in_state: Option<u64>,
    pub recovery_used: bool,
}

impl IvIndexState {
    pub fn new(index: u32, update_active: bool) -> Self {
        Self {
            index,
            update_active,
            hours_in_state: Some(0),
            recovery_used: false,
        }
    }

    /// The IV index a receiving node should use to authenticate inbound
    /// traffic carrying the given IVI bit, per the dual-acceptance window
    /// while an update is in progress.
    pub fn accepted_iv_index(&self, ivi_bit: u8) -> u32 {
        let expected_bit = (self.index & 0x1) as u8;
        if !self.update_active || ivi_bit == expected_bit {
            self.index
        } else {
            self.index.wrapping_sub(1)
        }
    }

    pub fn transmission_iv_index(&self) -> u32 {
        self.index
    }

    /// Applies the acceptance algorithm for a newly authenticated beacon,
    /// mutating `self` in place on acceptance. `allow_unlimited_recovery`
    /// relaxes the `new <= cur + 42` bound.
    pub fn accept_beacon(
        &mut self,
        new_index: u32,
        new_active: bool,
        allow_unlimited_recovery: bool,
    ) -> Result<(), BeaconError> {
        let cur = self.index;
        let cur_active = self.update_active;

        if new_index < cur {
            return Err(BeaconError::Regressed);
        }
        if new_index == cur && cur_active == new_active {
            // No-op beacon repeating current state; nothing to do.
            return Ok(());
        }

        if !allow_unlimited_recovery && new_index > cur.saturating_add(42) {
            return Err(BeaconError::OutOfRecoveryWindow);
        }

        let state_diff: i64 = 2 * (new_index as i64 - cur as i64) - 1 + (cur_active as i64)
            + if new_active { 0 } else { 1 };
        let is_recovery = state_diff > 1;

        // Every accepted transition out of the current state — normal to
        // update, update to normal, or a multi-cycle jump during recovery —
        // must not occur before the current state has held for 96 hours.
        let hours = self.hours_in_state.unwrap_or(u64::MAX);
        if self.hours_in_state.is_some() && hours < 96 {
            return Err(BeaconError::TooSoon);
        }
        if self.recovery_used && hours < 192 {
            return Err(BeaconError::RecoveryCooldown);
        }

        self.index = new_index;
        self.update_active = new_active;
        self.hours_in_state = Some(0);
        self.recovery_used = is_recovery;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_decode_roundtrip_fields() {
        let mut data = vec![0x03u8];
        data.extend_from_slice(&0x1122334455667788u64.to_be_bytes());
        data.extend_from_slice(&0x12345678u32.to_be_bytes());
        data.extend_from_slice(&[0xAAu8; 8]);
        let beacon = SecureNetworkBeacon::decode(&data).unwrap();
        assert!(beacon.key_refresh_flag);
        assert!(beacon.iv_update_flag);
        assert_eq!(beacon.network_id, 0x1122334455667788);
        assert_eq!(beacon.iv_index, 0x12345678);
    }

    #[test]
    fn iv_index_accepts_normal_to_update_after_96_hours() {
        let mut state = IvIndexState { index: 5, update_active: false, hours_in_state: Some(100), recovery_used: false };
        state.accept_beacon(5, true, false).unwrap();
        assert_eq!(state.index, 5);
        assert!(state.update_active);
    }

    #[test]
    fn iv_index_rejects_update_to_update_before_96_hours() {
        let mut state = IvIndexState { index: 5, update_active: false, hours_in_state: Some(100), recovery_used: false };
        state.accept_beacon(5, true, false).unwrap();

        // Reopen distinct from the s1 -> s2 transition: try to jump straight
        // to a new index while update_active, too soon.
        state.hours_in_state = Some(1);
        let result = state.accept_beacon(6, true, false);
        assert!(result.is_err());
    }

    #[test]
    fn iv_update_scenario_five_from_spec() {
        // Start state: (index=5, active=false), entered 100h ago.
        let mut state = IvIndexState { index: 5, update_active: false, hours_in_state: Some(100), recovery_used: false };

        // 100h >= 96h floor: normal -> update accepted.
        state.accept_beacon(5, true, false).unwrap();
        assert_eq!(state.index, 5);
        assert!(state.update_active);

        // Immediately (1h later): update -> normal is still too soon.
        state.hours_in_state = Some(1);
        assert!(state.accept_beacon(5, false, false).is_err());
        assert!(state.update_active);

        // 97h after entering the update state: now accepted.
        state.hours_in_state = Some(97);
        state.accept_beacon(5, false, false).unwrap();
        assert_eq!(state.index, 5);
        assert!(!state.update_active);
    }

    #[test]
    fn iv_index_rejects_regression() {
        let mut state = IvIndexState::new(10, false);
        assert!(state.accept_beacon(9, false, false).is_err());
    }

    #[test]
    fn iv_index_rejects_out_of_recovery_window() {
        let mut state = IvIndexState { index: 0, update_active: false, hours_in_state: Some(u64::MAX), recovery_used: false };
        assert!(state.accept_beacon(100, false, false).is_err());
    }
}
