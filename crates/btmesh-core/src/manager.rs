//! The top-level orchestrator gluing network, lower transport, upper
//! transport and access layers together, plus the manager delegate
//! interface exposed to the host application.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::access::{self, Element, MessageHandle, Opcode, OutboundQueue, SendFailure};
use crate::address::Address;
use crate::beacon::{IvIndexState, SecureNetworkBeacon};
use crate::error::{MeshError, NetworkError, ProvisioningError};
use crate::keys::{DeviceKey, KeyStore, NetworkKey};
use crate::lower::{self, LowerPdu, Reassembly};
use crate::network::{self, Ctl, ReplayCache, SequenceAllocator};
use crate::provisioning::{ProvisioningData, ProvisioningSession};
use crate::upper::{self, NonceType};

/// Segment count a retransmission attempt is allowed before the outbound
/// queue gives up and reports failure to the caller.
const MAX_SEGMENT_RETRIES: u8 = 4;

/// Callbacks the host registers to learn about delivery outcomes and
/// inbound messages that were not claimed by any local model (e.g. ones a
/// higher-level configuration client wants to see directly).
pub trait MeshManagerDelegate: Send {
    fn on_message_delivered(&mut self, handle: MessageHandle);
    fn on_message_failed(&mut self, handle: MessageHandle, reason: SendFailure);
}

#[derive(Hash, PartialEq, Eq, Clone, Copy)]
struct ReassemblyKey {
    src: u16,
    dst: u16,
    seq_auth: u32,
}

/// Bookkeeping for one outbound segmented message awaiting BlockAck,
/// keyed by `(peer unicast address, SeqZero)`.
struct OutboundSarEntry {
    handle: MessageHandle,
    sar: lower::OutboundSegmented,
}

/// The local node's live protocol state: keys, replay cache, sequence
/// allocator, IV-Index FSM, elements/models, and in-flight SAR/outbound
/// bookkeeping. Owns no bearer or timer; the host drives it by feeding
/// inbound bytes and polling for outbound bytes/deadlines.
pub struct MeshManager {
    pub local_unicast: Address,
    pub keys: KeyStore,
    pub local_device_key: Option<DeviceKey>,
    replay_cache: ReplayCache,
    sequence: SequenceAllocator,
    pub iv_index: IvIndexState,
    elements: Vec<Element>,
    outbound: OutboundQueue,
    outbound_sar: HashMap<(u16, u16), OutboundSarEntry>,
    reassembly: HashMap<ReassemblyKey, Reassembly>,
    delegate: Option<Box<dyn MeshManagerDelegate>>,
    /// The §4.F acknowledged-message deadline floor/override; always
    /// clamped to at least 30 seconds by [`access::ack_timeout`].
    pub access_ack_timeout: Duration,
}

impl MeshManager {
    pub fn new(local_unicast: Address) -> Self {
        Self {
            local_unicast,
            keys: KeyStore::new(),
            local_device_key: None,
            replay_cache: ReplayCache::new(),
            sequence: SequenceAllocator::new(),
            iv_index: IvIndexState::new(0, false),
            elements: Vec::new(),
            outbound: OutboundQueue::new(),
            outbound_sar: HashMap::new(),
            reassembly: HashMap::new(),
            delegate: None,
            access_ack_timeout: Duration::from_secs(30),
        }
    }

    pub fn set_delegate(&mut self, delegate: Box<dyn MeshManagerDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn add_element(&mut self, element: Element) {
        self.elements.push(element);
    }

    fn element_for_dst(&mut self, dst: Address) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.address == dst)
    }

    /// Processes a raw Network PDU received from the bearer, returning any
    /// Network PDUs this PDU caused to be sent back (an automatic
    /// acknowledged-message reply). Decode, decrypt, and replay failures
    /// are silently dropped per the error-handling policy; only a
    /// successfully-authenticated PDU that still fails further up (e.g. an
    /// unhandled opcode) surfaces an error.
    pub fn process_inbound_network_pdu(&mut self, raw: &[u8]) -> Result<Vec<Vec<u8>>, MeshError> {
        let ivi_bit = if raw.is_empty() { 0 } else { (raw[0] & 0x80) >> 7 };
        let iv_index = self.iv_index.accepted_iv_index(ivi_bit);

        let cleartext = match network::try_decrypt_network_pdu(&self.keys, raw, iv_index) {
            Some(pdu) => pdu,
            None => {
                trace!("network PDU did not authenticate under any known key, dropping");
                return Ok(Vec::new());
            }
        };

        if !self.replay_cache.accept(cleartext.src, cleartext.seq, iv_index) {
            debug!("replay cache rejected seq={} src={:#06x}", cleartext.seq, cleartext.src);
            return Ok(Vec::new());
        }

        let is_control = cleartext.ctl == Ctl::Control;
        let lower_pdu = match LowerPdu::decode(&cleartext.transport_pdu, is_control) {
            Ok(pdu) => pdu,
            Err(_) => return Ok(Vec::new()),
        };

        if let LowerPdu::UnsegmentedControl { opcode, payload } = &lower_pdu {
            match *opcode {
                lower::OPCODE_SEGMENT_ACK => {
                    self.handle_block_ack(payload, Address(cleartext.src));
                    return Ok(Vec::new());
                }
                lower::Heartbeat::OPCODE => {
                    self.handle_heartbeat(payload, Address(cleartext.src));
                    return Ok(Vec::new());
                }
                _ => {}
            }
        }

        let Some((access_payload, akf, aid, seq_zero)) = self.reassemble(&lower_pdu, &cleartext, iv_index) else {
            return Ok(Vec::new());
        };

        let Some((plaintext, app_key_index)) = self.decrypt_upper(&access_payload, akf, aid, &cleartext, iv_index, seq_zero) else {
            warn!("upper transport authentication failed for src={:#06x}", cleartext.src);
            return Ok(Vec::new());
        };

        let dst = Address(cleartext.dst);
        let src = Address(cleartext.src);

        let Ok((opcode, _)) = access::parse_access_pdu(&plaintext) else {
            return Ok(Vec::new());
        };

        if let Some(request) = self.outbound.resolve_response(opcode, src, dst) {
            if let Some(element) = self.element_for_dst(dst) {
                let _ = access::dispatch_response(element, &plaintext, &request, src);
            }
            if let Some(delegate) = self.delegate.as_mut() {
                delegate.on_message_delivered(request.handle);
            }
            return Ok(Vec::new());
        }

        let Some(element) = self.element_for_dst(dst) else {
            return Ok(Vec::new());
        };
        let response = access::dispatch_acknowledged(element, &plaintext, src, dst).ok().flatten();
        match response {
            Some(response_payload) => {
                self.build_reply_pdus(src, cleartext.net_key_index, app_key_index, cleartext.ttl, response_payload)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Applies an inbound Segment Acknowledgment to the matching outbound
    /// SAR entry: marks acked segments, settles delivery on completion, or
    /// settles failure immediately on BusyAck.
    fn handle_block_ack(&mut self, payload: &[u8], peer: Address) {
        if payload.len() != 6 {
            return;
        }
        let mut buf = [0u8; 6];
        buf.copy_from_slice(payload);
        let ack = lower::BlockAck::decode(&buf);
        let key = (peer.0, ack.seq_zero);

        if ack.is_busy() {
            if let Some(entry) = self.outbound_sar.remove(&key) {
                self.outbound.fail_now(entry.handle);
                if let Some(delegate) = self.delegate.as_mut() {
                    delegate.on_message_failed(entry.handle, SendFailure::Busy);
                }
            }
            return;
        }

        let Some(entry) = self.outbound_sar.get_mut(&key) else {
            return;
        };
        entry.sar.apply_block_ack(ack.block_ack);
        if entry.sar.is_complete() {
            let entry = self.outbound_sar.remove(&key).expect("just looked up");
            self.outbound.resolve_delivered(entry.handle);
            if let Some(delegate) = self.delegate.as_mut() {
                delegate.on_message_delivered(entry.handle);
            }
        }
    }

    fn handle_heartbeat(&mut self, payload: &[u8], src: Address) {
        if let Ok(heartbeat) = lower::Heartbeat::decode(payload) {
            debug!(
                "heartbeat from src={:#06x} init_ttl={} features={:#06x}",
                src.0, heartbeat.init_ttl, heartbeat.features
            );
        }
    }

    /// Drives the lower transport's segmentation/reassembly state for one
    /// inbound PDU, returning the reassembled (or single-segment) upper
    /// transport payload once complete, together with its AKF/AID/SeqZero.
    fn reassemble(
        &mut self,
        lower_pdu: &LowerPdu,
        cleartext: &network::CleartextNetworkPdu,
        iv_index: u32,
    ) -> Option<(Vec<u8>, bool, u8, u32)> {
        match lower_pdu {
            LowerPdu::UnsegmentedAccess { akf, aid, payload } => {
                Some((payload.clone(), *akf, *aid, cleartext.seq & 0x1FFF))
            }
            LowerPdu::SegmentedAccess { akf, aid, header, payload } => {
                let seq_auth = (iv_index << 13) | header.seq_zero as u32;
                let key = ReassemblyKey { src: cleartext.src, dst: cleartext.dst, seq_auth };
                let entry = self.reassembly.entry(key).or_insert_with(|| Reassembly::new(header.seg_n));
                if entry.insert(header.seg_o, payload.clone()).is_err() {
                    return None;
                }
                if entry.is_complete() {
                    let assembled = entry.assemble()?;
                    self.reassembly.remove(&key);
                    Some((assembled, *akf, *aid, header.seq_zero as u32))
                } else {
                    None
                }
            }
            LowerPdu::UnsegmentedControl { .. } | LowerPdu::SegmentedControl { .. } => None,
        }
    }

    /// Decrypts an inbound access payload, returning the plaintext along
    /// with which application key index authenticated it (`None` meaning
    /// the device key), so a reply can be sent back under the same key.
    fn decrypt_upper(
        &self,
        access_payload: &[u8],
        akf: bool,
        aid: u8,
        cleartext: &network::CleartextNetworkPdu,
        iv_index: u32,
        seq_zero: u32,
    ) -> Option<(Vec<u8>, Option<u16>)> {
        let szmic_long = access_payload.len() > 11 + 4;
        let seq = (cleartext.seq & !0x1FFF) | seq_zero;

        if akf {
            for app_key in self.keys.application_keys() {
                for (raw_key, candidate_aid) in app_key.candidates_for_aid(aid) {
                    if candidate_aid != aid {
                        continue;
                    }
                    if let Ok(plaintext) = upper::decrypt_access_payload(
                        raw_key,
                        NonceType::Application,
                        szmic_long,
                        seq,
                        cleartext.src,
                        cleartext.dst,
                        iv_index,
                        None,
                        access_payload,
                    ) {
                        return Some((plaintext, Some(app_key.index())));
                    }
                }
            }
            None
        } else {
            let device_key = self.keys.device_key(cleartext.src).map(|k| k.0)?;
            upper::decrypt_access_payload(
                &device_key,
                NonceType::Device,
                szmic_long,
                seq,
                cleartext.src,
                cleartext.dst,
                iv_index,
                None,
                access_payload,
            )
            .ok()
            .map(|plaintext| (plaintext, None))
        }
    }

    /// Encrypts and frames an outbound access message as one or more
    /// Network PDUs ready for the bearer, using the given network and
    /// application keys. Returns the handle immediately; delivery/timeout
    /// is reported later through the outbound queue's `expire`/`resolve`.
    pub fn send_access_message(
        &mut self,
        dst: Address,
        net_key_index: u16,
        app_key_index: u16,
        opcode: Opcode,
        payload: &[u8],
        ttl: u8,
        now: Duration,
    ) -> Result<(Vec<Vec<u8>>, MessageHandle), MeshError> {
        let access_pdu = access::build_access_pdu(opcode, payload);
        let szmic_long = upper::choose_szmic(access_pdu.len());
        let seq = self.sequence.allocate().map_err(MeshError::Network)?;
        let iv_index = self.iv_index.transmission_iv_index();

        let app_key = self
            .keys
            .application_keys()
            .find(|k| k.index() == app_key_index)
            .ok_or(NetworkError::NoMatchingKey)?;
        let raw_key = *app_key.raw_key();
        let aid = app_key.aid();

        let network_pdus =
            self.encrypt_and_segment(dst, net_key_index, &raw_key, true, aid, seq, iv_index, ttl, szmic_long, &access_pdu)?;

        let ack_timeout = access::ack_timeout(self.access_ack_timeout);
        let handle = self.outbound.enqueue(dst, opcode, self.local_unicast, now, ack_timeout);

        if network_pdus.len() > 1 {
            let seq_zero = (seq & 0x1FFF) as u16;
            let sar = lower::OutboundSegmented::new(network_pdus.clone(), MAX_SEGMENT_RETRIES);
            self.outbound_sar.insert((dst.0, seq_zero), OutboundSarEntry { handle, sar });
        }

        Ok((network_pdus, handle))
    }

    /// Builds an automatic acknowledged-message reply under the same
    /// network key the inbound request authenticated under, and either the
    /// application key (if `app_key_index` is `Some`) or the peer's device
    /// key that decrypted the request.
    fn build_reply_pdus(
        &mut self,
        dst: Address,
        net_key_index: u16,
        app_key_index: Option<u16>,
        ttl: u8,
        access_pdu: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, MeshError> {
        let szmic_long = upper::choose_szmic(access_pdu.len());
        let seq = self.sequence.allocate().map_err(MeshError::Network)?;
        let iv_index = self.iv_index.transmission_iv_index();

        let (raw_key, akf, aid) = match app_key_index {
            Some(index) => {
                let app_key = self
                    .keys
                    .application_keys()
                    .find(|k| k.index() == index)
                    .ok_or(NetworkError::NoMatchingKey)?;
                (*app_key.raw_key(), true, app_key.aid())
            }
            None => {
                let device_key = self.keys.device_key(dst.0).ok_or(NetworkError::NoMatchingKey)?;
                (device_key.0, false, 0u8)
            }
        };

        self.encrypt_and_segment(dst, net_key_index, &raw_key, akf, aid, seq, iv_index, ttl, szmic_long, &access_pdu)
    }

    /// Encrypts an access PDU under the given key and network key, and
    /// frames it as one or more Network PDUs, segmenting as needed.
    #[allow(clippy::too_many_arguments)]
    fn encrypt_and_segment(
        &self,
        dst: Address,
        net_key_index: u16,
        raw_key: &[u8; 16],
        akf: bool,
        aid: u8,
        seq: u32,
        iv_index: u32,
        ttl: u8,
        szmic_long: bool,
        access_pdu: &[u8],
    ) -> Result<Vec<Vec<u8>>, MeshError> {
        let kind = if akf { NonceType::Application } else { NonceType::Device };
        let ciphertext = upper::encrypt_access_payload(
            raw_key, kind, szmic_long, seq, self.local_unicast.0, dst.0, iv_index, None, access_pdu,
        )?;

        let net_key = self.keys.network_key(net_key_index).ok_or(NetworkError::NoMatchingKey)?;
        let material = net_key.transmit_material();
        let ivi = (iv_index & 1) as u8;

        let segments = lower::segment_payload(&ciphertext);
        let seg_n = (segments.len() - 1) as u8;
        let mut network_pdus = Vec::with_capacity(segments.len());
        for (seg_o, segment) in segments.iter().enumerate() {
            let transport_bytes = if segments.len() == 1 {
                LowerPdu::UnsegmentedAccess { akf, aid, payload: segment.clone() }.encode()
            } else {
                let header = lower::SegmentHeader {
                    szmic: szmic_long,
                    seq_zero: (seq & 0x1FFF) as u16,
                    seg_o: seg_o as u8,
                    seg_n,
                };
                LowerPdu::SegmentedAccess { akf, aid, header, payload: segment.clone() }.encode()
            };
            let encoded = network::encrypt_network_pdu(
                material, ivi, Ctl::Access, ttl, seq, self.local_unicast.0, dst.0, iv_index, &transport_bytes,
            )?;
            network_pdus.push(encoded);
        }
        Ok(network_pdus)
    }

    /// Sends a Heartbeat control PDU to `dst`, e.g. per a configured
    /// heartbeat publication.
    pub fn send_heartbeat(
        &mut self,
        dst: Address,
        net_key_index: u16,
        init_ttl: u8,
        features: u16,
        ttl: u8,
    ) -> Result<Vec<u8>, MeshError> {
        let heartbeat = lower::Heartbeat { init_ttl, features };
        let transport_bytes =
            LowerPdu::UnsegmentedControl { opcode: lower::Heartbeat::OPCODE, payload: heartbeat.encode().to_vec() }.encode();

        let seq = self.sequence.allocate().map_err(MeshError::Network)?;
        let iv_index = self.iv_index.transmission_iv_index();
        let net_key = self.keys.network_key(net_key_index).ok_or(NetworkError::NoMatchingKey)?;
        let material = net_key.transmit_material();
        let ivi = (iv_index & 1) as u8;

        network::encrypt_network_pdu(
            material, ivi, Ctl::Control, ttl, seq, self.local_unicast.0, dst.0, iv_index, &transport_bytes,
        )
        .map_err(MeshError::Network)
    }

    /// Applies the outcome of a completed provisioning session. As the
    /// provisioner, records the new node's device key; as the device,
    /// joins the network with the key material and address the
    /// provisioner assigned.
    pub fn complete_provisioning(
        &mut self,
        session: &ProvisioningSession,
        data: &ProvisioningData,
    ) -> Result<(), MeshError> {
        let device_key = session.device_key().ok_or(ProvisioningError::InvalidState)?;

        if session.is_provisioner() {
            self.keys.insert_device_key(data.unicast_address, DeviceKey(device_key));
        } else {
            self.keys.insert_network_key(NetworkKey::new(data.key_index, data.network_key));
            self.local_device_key = Some(DeviceKey(device_key));
            self.local_unicast = Address(data.unicast_address);
            self.iv_index = IvIndexState::new(data.iv_index, data.flags & 0x02 != 0);
        }
        Ok(())
    }

    pub fn cancel_send(&mut self, handle: MessageHandle) -> bool {
        self.outbound.cancel(handle)
    }

    /// Polls for sends that have exceeded their deadline, reporting them
    /// to the delegate.
    pub fn poll_timeouts(&mut self, now: Duration) {
        for (handle, reason) in self.outbound.expire(now) {
            if let Some(delegate) = self.delegate.as_mut() {
                delegate.on_message_failed(handle, reason);
            }
        }
    }

    /// Authenticates and applies a Secure Network Beacon.
    pub fn process_beacon(&mut self, raw: &[u8]) -> Result<(), MeshError> {
        let beacon = SecureNetworkBeacon::decode(raw)?;
        beacon.authenticate(&self.keys)?;
        self.iv_index.accept_beacon(beacon.iv_index, beacon.iv_update_flag, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ApplicationKey, NetworkKey};

    fn make_manager() -> MeshManager {
        let mut manager = MeshManager::new(Address(0x0001));
        let net_key = NetworkKey::new(0, [0x11; 16]);
        manager.keys.insert_network_key(net_key);
        let app_key = ApplicationKey::new(0, 0, [0x22; 16]);
        manager.keys.insert_application_key(app_key);
        manager
    }

    #[test]
    fn outbound_single_segment_message_produces_one_pdu() {
        let mut manager = make_manager();
        let (pdus, _handle) = manager
            .send_access_message(Address(0x0002), 0, 0, Opcode(0x01), b"hi", 0, Duration::ZERO)
            .unwrap();
        assert_eq!(pdus.len(), 1);
    }

    #[test]
    fn outbound_long_message_segments() {
        let mut manager = make_manager();
        let payload = vec![0x42u8; 40];
        let (pdus, _handle) = manager
            .send_access_message(Address(0x0002), 0, 0, Opcode(0x01), &payload, 0, Duration::ZERO)
            .unwrap();
        assert!(pdus.len() > 1);
    }

    #[test]
    fn unknown_app_key_index_is_rejected() {
        let mut manager = make_manager();
        let result = manager.send_access_message(Address(0x0002), 0, 99, Opcode(0x01), b"hi", 0, Duration::ZERO);
        assert!(result.is_err());
    }
}
