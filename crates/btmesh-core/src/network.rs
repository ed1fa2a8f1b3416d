//! Network layer: obfuscation, CCM over the Network PDU, NID-keyed key
//! selection, sequence-number allocation, and the replay protection cache.

use std::collections::HashMap;

use crate::crypto::{ccm, e};
use crate::error::NetworkError;
use crate::keys::{KeyStore, NetworkKeyMaterial};

/// Network-PDU-level Control/Access indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctl {
    Access,
    Control,
}

impl Ctl {
    fn bit(self) -> u8 {
        match self {
            Ctl::Access => 0,
            Ctl::Control => 1,
        }
    }
}

/// A decrypted, deobfuscated Network PDU ready to be handed to the lower
/// transport layer.
#[derive(Debug, Clone)]
pub struct CleartextNetworkPdu {
    pub ivi: u8,
    pub nid: u8,
    pub ctl: Ctl,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub transport_pdu: Vec<u8>,
    /// Index of the network key whose material authenticated this PDU, so
    /// a reply can be sent back under the same key.
    pub net_key_index: u16,
}

/// Builds the 13-byte CCM nonce used for network-layer encryption:
/// `0x00 || CTL<<7|TTL || SEQ(3) || SRC(2) || 0x0000 || IVIndex(4)`.
fn network_nonce(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> [u8; 13] {
    let seq_bytes = seq.to_be_bytes();
    let mut nonce = [0u8; 13];
    nonce[0] = 0x00;
    nonce[1] = ctl_ttl;
    nonce[2] = seq_bytes[1];
    nonce[3] = seq_bytes[2];
    nonce[4] = seq_bytes[3];
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7] = 0x00;
    nonce[8] = 0x00;
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// Obfuscates (or deobfuscates, being its own inverse via XOR) the
/// `CTL|TTL || SEQ || SRC` header fields of a Network PDU.
fn pecb_xor(privacy_key: &[u8; 16], iv_index: u32, encrypted_and_mic: &[u8], header: &[u8; 6]) -> [u8; 6] {
    let mut privacy_random = [0u8; 7];
    let take = encrypted_and_mic.len().min(7);
    privacy_random[..take].copy_from_slice(&encrypted_and_mic[..take]);

    let mut plaintext = [0u8; 16];
    plaintext[5..9].copy_from_slice(&iv_index.to_be_bytes());
    plaintext[9..16].copy_from_slice(&privacy_random);

    let pecb = e(privacy_key, &plaintext);
    let mut out = [0u8; 6];
    for i in 0..6 {
        out[i] = header[i] ^ pecb[i];
    }
    out
}

/// Encrypts and obfuscates a cleartext Network PDU, producing the bytes
/// ready to hand to the bearer (minus the leading IVI/NID octet, which the
/// caller prepends since it is not itself obfuscated or encrypted).
pub fn encrypt_network_pdu(
    material: &NetworkKeyMaterial,
    ivi: u8,
    ctl: Ctl,
    ttl: u8,
    seq: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
    transport_pdu: &[u8],
) -> Result<Vec<u8>, NetworkError> {
    let ctl_ttl = (ctl.bit() << 7) | (ttl & 0x7F);
    let nonce = network_nonce(ctl_ttl, seq, src, iv_index);

    let mut encrypted_and_mic = Vec::with_capacity(2 + transport_pdu.len() + 8);
    encrypted_and_mic.extend_from_slice(&dst.to_be_bytes());
    encrypted_and_mic.extend_from_slice(transport_pdu);

    match ctl {
        Ctl::Access => ccm::encrypt_32(&material.encryption_key, &nonce, &[], &mut encrypted_and_mic)
            .map_err(NetworkError::Mic)?,
        Ctl::Control => ccm::encrypt_64(&material.encryption_key, &nonce, &[], &mut encrypted_and_mic)
            .map_err(NetworkError::Mic)?,
    }

    let seq_bytes = seq.to_be_bytes();
    let header = [
        ctl_ttl,
        seq_bytes[1],
        seq_bytes[2],
        seq_bytes[3],
        src.to_be_bytes()[0],
        src.to_be_bytes()[1],
    ];
    let obfuscated = pecb_xor(&material.privacy_key, iv_index, &encrypted_and_mic, &header);

    let mut out = Vec::with_capacity(1 + 6 + encrypted_and_mic.len());
    out.push((ivi << 7) | (material.nid & 0x7F));
    out.extend_from_slice(&obfuscated);
    out.extend_from_slice(&encrypted_and_mic);
    Ok(out)
}

/// Deobfuscates and decrypts a raw Network PDU, trying every key material
/// candidate whose NID matches. Returns `None` if no candidate
/// authenticates (the caller should silently drop the PDU, not propagate
/// an error, per the error-handling policy).
pub fn try_decrypt_network_pdu(
    keys: &KeyStore,
    pdu: &[u8],
    iv_index: u32,
) -> Option<CleartextNetworkPdu> {
    if pdu.len() < 7 {
        return None;
    }
    let ivi_nid = pdu[0];
    let ivi = (ivi_nid & 0x80) >> 7;
    let nid = ivi_nid & 0x7F;
    let obfuscated = &pdu[1..7];
    let encrypted_and_mic = &pdu[7..];

    for net_key in keys.network_keys_by_nid(nid) {
        for (_, material) in net_key.candidates_for_nid(nid) {
            if material.nid != nid {
                continue;
            }
            let mut header = [0u8; 6];
            header.copy_from_slice(obfuscated);
            let deobfuscated = pecb_xor(&material.privacy_key, iv_index, encrypted_and_mic, &header);

            let ctl_ttl = deobfuscated[0];
            let ctl = if ctl_ttl & 0x80 != 0 { Ctl::Control } else { Ctl::Access };
            let ttl = ctl_ttl & 0x7F;
            let seq = u32::from_be_bytes([0, deobfuscated[1], deobfuscated[2], deobfuscated[3]]);
            let src = u16::from_be_bytes([deobfuscated[4], deobfuscated[5]]);

            let nonce = network_nonce(ctl_ttl, seq, src, iv_index);
            let mut payload = encrypted_and_mic.to_vec();
            let result = match ctl {
                Ctl::Access => ccm::decrypt_32(&material.encryption_key, &nonce, &[], &mut payload),
                Ctl::Control => ccm::decrypt_64(&material.encryption_key, &nonce, &[], &mut payload),
            };
            if result.is_err() || payload.len() < 2 {
                continue;
            }
            let dst = u16::from_be_bytes([payload[0], payload[1]]);
            let transport_pdu = payload[2..].to_vec();
            return Some(CleartextNetworkPdu {
                ivi,
                nid,
                ctl,
                ttl,
                seq,
                src,
                dst,
                transport_pdu,
                net_key_index: net_key.index(),
            });
        }
    }
    None
}

/// Per-source-address replay protection: only a strictly larger
/// `(iv_index, seq)` pair is ever accepted.
#[derive(Default)]
pub struct ReplayCache {
    entries: HashMap<u16, (u32, u32)>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records the new high-water mark if `(seq,
    /// iv_index)` is strictly greater than anything previously seen from
    /// `src`; returns `false` (reject) otherwise.
    pub fn accept(&mut self, src: u16, seq: u32, iv_index: u32) -> bool {
        match self.entries.get(&src) {
            Some(&(last_seq, last_iv)) => {
                if iv_index > last_iv || (iv_index == last_iv && seq > last_seq) {
                    self.entries.insert(src, (seq, iv_index));
                    true
                } else {
                    false
                }
            }
            None => {
                self.entries.insert(src, (seq, iv_index));
                true
            }
        }
    }
}

/// Monotonic per-element sequence number allocator, bounded to 24 bits.
pub struct SequenceAllocator {
    next: u32,
    threshold: u32,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self {
            next: 0,
            threshold: 0x7F_FFFF,
        }
    }

    /// Allocates the next sequence number. Returns `None` once the
    /// configured threshold is reached; the caller should then request an
    /// IV-Update rather than wrap seq back to zero under the same index.
    pub fn allocate(&mut self) -> Result<u32, NetworkError> {
        if self.next > self.threshold {
            return Err(NetworkError::SequenceExhausted);
        }
        let seq = self.next;
        self.next += 1;
        Ok(seq)
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NetworkKey;

    fn test_net_key() -> NetworkKey {
        let key = [
            0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84,
            0xc3, 0xd6,
        ];
        NetworkKey::new(0, key)
    }

    #[test]
    fn network_pdu_round_trips() {
        let net_key = test_net_key();
        let mut store = KeyStore::new();
        let material = net_key.current().clone();
        store.insert_network_key(net_key);

        let transport_pdu = hex::decode("034b50057e400000010000").unwrap();
        let encoded = encrypt_network_pdu(
            &material,
            0,
            Ctl::Access,
            0,
            0x000006,
            0x1201,
            0xFFFD,
            0x12345678,
            &transport_pdu,
        )
        .unwrap();

        let decoded = try_decrypt_network_pdu(&store, &encoded, 0x12345678).unwrap();
        assert_eq!(decoded.src, 0x1201);
        assert_eq!(decoded.dst, 0xFFFD);
        assert_eq!(decoded.seq, 0x000006);
        assert_eq!(decoded.transport_pdu, transport_pdu);
    }

    #[test]
    fn replay_cache_rejects_non_increasing_seq() {
        let mut cache = ReplayCache::new();
        assert!(cache.accept(0x0001, 5, 1));
        assert!(!cache.accept(0x0001, 5, 1));
        assert!(!cache.accept(0x0001, 4, 1));
        assert!(cache.accept(0x0001, 6, 1));
        assert!(cache.accept(0x0001, 0, 2));
    }

    #[test]
    fn sequence_allocator_is_monotonic() {
        let mut alloc = SequenceAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert!(b > a);
    }
}
