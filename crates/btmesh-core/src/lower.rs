//! Lower transport: segmentation and reassembly (SAR) of upper transport
//! PDUs into 12-byte segments, plus the single-segment fast path and
//! control-PDU framing (segment acknowledgement, heartbeat).

use std::time::Duration;

use crate::error::LowerTransportError;

const SEGMENT_PAYLOAD_LEN: usize = 12;

/// Control PDU opcode for a Segment Acknowledgment (BlockAck) message.
pub const OPCODE_SEGMENT_ACK: u8 = 0x00;

/// Acknowledgement timer for an outbound segmented message:
/// `max(200ms, 200 + 50*TTL ms)`.
pub fn outbound_ack_timer(ttl: u8) -> Duration {
    Duration::from_millis(200u64.max(200 + 50 * ttl as u64))
}

/// Acknowledgement timer scheduled on receipt of the first segment of an
/// inbound message: `max(150ms, 150 + 50*TTL ms)`.
pub fn inbound_ack_timer(ttl: u8) -> Duration {
    Duration::from_millis(150u64.max(150 + 50 * ttl as u64))
}

/// Incomplete-reassembly timer: `max(10s, configured)`.
pub fn incomplete_timer(configured: Duration) -> Duration {
    configured.max(Duration::from_secs(10))
}

/// Header shared by both access and control segmented PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub szmic: bool,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
}

#[derive(Debug, Clone)]
pub enum LowerPdu {
    UnsegmentedAccess { akf: bool, aid: u8, payload: Vec<u8> },
    UnsegmentedControl { opcode: u8, payload: Vec<u8> },
    SegmentedAccess { akf: bool, aid: u8, header: SegmentHeader, payload: Vec<u8> },
    SegmentedControl { opcode: u8, header: SegmentHeader, payload: Vec<u8> },
}

impl LowerPdu {
    /// Decodes a lower transport PDU; `is_control` is supplied by the
    /// network layer from the Network PDU's CTL bit.
    pub fn decode(data: &[u8], is_control: bool) -> Result<Self, LowerTransportError> {
        if data.is_empty() {
            return Err(LowerTransportError::Truncated);
        }
        let seg = data[0] & 0x80 != 0;

        if is_control {
            let opcode = data[0] & 0x7F;
            if !seg {
                return Ok(LowerPdu::UnsegmentedControl {
                    opcode,
                    payload: data[1..].to_vec(),
                });
            }
            if data.len() < 4 {
                return Err(LowerTransportError::Truncated);
            }
            let header = decode_segment_header(&data[1..4]);
            Ok(LowerPdu::SegmentedControl {
                opcode,
                header,
                payload: data[4..].to_vec(),
            })
        } else {
            let akf = data[0] & 0x40 != 0;
            let aid = data[0] & 0x3F;
            if !seg {
                return Ok(LowerPdu::UnsegmentedAccess {
                    akf,
                    aid,
                    payload: data[1..].to_vec(),
                });
            }
            if data.len() < 4 {
                return Err(LowerTransportError::Truncated);
            }
            let header = decode_segment_header(&data[1..4]);
            Ok(LowerPdu::SegmentedAccess {
                akf,
                aid,
                header,
                payload: data[4..].to_vec(),
            })
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LowerPdu::UnsegmentedAccess { akf, aid, payload } => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push((*akf as u8) << 6 | (aid & 0x3F));
                out.extend_from_slice(payload);
                out
            }
            LowerPdu::UnsegmentedControl { opcode, payload } => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(opcode & 0x7F);
                out.extend_from_slice(payload);
                out
            }
            LowerPdu::SegmentedAccess { akf, aid, header, payload } => {
                let mut out = Vec::with_capacity(4 + payload.len());
                out.push(0x80 | (*akf as u8) << 6 | (aid & 0x3F));
                out.extend_from_slice(&encode_segment_header(header));
                out.extend_from_slice(payload);
                out
            }
            LowerPdu::SegmentedControl { opcode, header, payload } => {
                let mut out = Vec::with_capacity(4 + payload.len());
                out.push(0x80 | (opcode & 0x7F));
                out.extend_from_slice(&encode_segment_header(header));
                out.extend_from_slice(payload);
                out
            }
        }
    }
}

fn decode_segment_header(b: &[u8]) -> SegmentHeader {
    let szmic = b[0] & 0x80 != 0;
    let seq_zero = (((b[0] as u16) & 0x7F) << 6) | ((b[1] as u16) >> 2);
    let seg_o = ((b[1] & 0x03) << 3) | (b[2] >> 5);
    let seg_n = b[2] & 0x1F;
    SegmentHeader { szmic, seq_zero, seg_o, seg_n }
}

fn encode_segment_header(h: &SegmentHeader) -> [u8; 3] {
    let szmic_bit = (h.szmic as u8) << 7;
    let b0 = szmic_bit | ((h.seq_zero >> 6) as u8 & 0x7F);
    let b1 = (((h.seq_zero & 0x3F) << 2) as u8) | (h.seg_o >> 3);
    let b2 = ((h.seg_o & 0x07) << 5) | (h.seg_n & 0x1F);
    [b0, b1, b2]
}

/// Splits an upper transport PDU into 12-byte segments.
pub fn segment_payload(payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload.chunks(SEGMENT_PAYLOAD_LEN).map(|c| c.to_vec()).collect()
}

/// Block acknowledgement control PDU state: which segments of a SeqZero
/// group have been received.
#[derive(Debug, Clone, Copy)]
pub struct BlockAck {
    pub seq_zero: u16,
    pub obo: bool,
    pub block_ack: u32,
}

impl BlockAck {
    /// `((SeqZero & 0x1FFF) << 2) | OBO` as the first two bytes, followed
    /// by the 32-bit block-ack bitfield, per the segment-acknowledgement
    /// control PDU layout.
    pub fn encode(&self) -> [u8; 6] {
        let seq_zero_obo = ((self.seq_zero & 0x1FFF) << 2) | (self.obo as u16);
        let mut out = [0u8; 6];
        out[0..2].copy_from_slice(&seq_zero_obo.to_be_bytes());
        out[2..6].copy_from_slice(&self.block_ack.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8; 6]) -> Self {
        let seq_zero_obo = u16::from_be_bytes([data[0], data[1]]);
        let seq_zero = seq_zero_obo >> 2;
        let obo = seq_zero_obo & 0x01 != 0;
        let block_ack = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        BlockAck { seq_zero, obo, block_ack }
    }

    pub fn is_busy(&self) -> bool {
        self.block_ack == 0 && self.obo
    }
}

/// Heartbeat control PDU: a node's liveness and feature flags, sent
/// unsegmented to a heartbeat publication destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub init_ttl: u8,
    pub features: u16,
}

impl Heartbeat {
    pub const OPCODE: u8 = 0x0A;

    pub fn encode(&self) -> [u8; 3] {
        let mut out = [0u8; 3];
        out[0] = self.init_ttl & 0x7F;
        out[1..3].copy_from_slice(&self.features.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, LowerTransportError> {
        if data.len() < 3 {
            return Err(LowerTransportError::Truncated);
        }
        Ok(Self {
            init_ttl: data[0] & 0x7F,
            features: u16::from_be_bytes([data[1], data[2]]),
        })
    }
}

/// Tracks an inbound segmented message's reassembly state.
pub struct Reassembly {
    pub seg_n: u8,
    received: Vec<Option<Vec<u8>>>,
}

impl Reassembly {
    pub fn new(seg_n: u8) -> Self {
        Self {
            seg_n,
            received: vec![None; seg_n as usize + 1],
        }
    }

    pub fn insert(&mut self, seg_o: u8, payload: Vec<u8>) -> Result<(), LowerTransportError> {
        if seg_o > self.seg_n {
            return Err(LowerTransportError::SegmentOutOfRange);
        }
        self.received[seg_o as usize] = Some(payload);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(Option::is_some)
    }

    pub fn block_ack_bitmap(&self) -> u32 {
        let mut bitmap = 0u32;
        for (i, segment) in self.received.iter().enumerate() {
            if segment.is_some() {
                bitmap |= 1 << i;
            }
        }
        bitmap
    }

    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::new();
        for segment in &self.received {
            out.extend_from_slice(segment.as_ref().unwrap());
        }
        Some(out)
    }
}

/// Tracks an outbound segmented message's acknowledgement and
/// retransmission state.
pub struct OutboundSegmented {
    segments: Vec<Vec<u8>>,
    acked: Vec<bool>,
    retries_remaining: u8,
}

impl OutboundSegmented {
    pub fn new(segments: Vec<Vec<u8>>, max_retries: u8) -> Self {
        let len = segments.len();
        Self {
            segments,
            acked: vec![false; len],
            retries_remaining: max_retries,
        }
    }

    pub fn seg_n(&self) -> u8 {
        (self.segments.len() - 1) as u8
    }

    pub fn apply_block_ack(&mut self, block_ack: u32) {
        for (i, acked) in self.acked.iter_mut().enumerate() {
            if block_ack & (1 << i) != 0 {
                *acked = true;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.acked.iter().all(|&a| a)
    }

    /// Segments still awaiting acknowledgement, to be retransmitted.
    pub fn outstanding(&self) -> Vec<(u8, &[u8])> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.acked[*i])
            .map(|(i, s)| (i as u8, s.as_slice()))
            .collect()
    }

    /// Consumes one retry attempt; returns `false` once exhausted.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_header_round_trips() {
        let header = SegmentHeader { szmic: true, seq_zero: 0x1234 & 0x1FFF, seg_o: 3, seg_n: 7 };
        let encoded = encode_segment_header(&header);
        let decoded = decode_segment_header(&encoded);
        assert_eq!(decoded, header);
    }

    #[test]
    fn two_segment_reassembly_out_of_order() {
        let mut reassembly = Reassembly::new(1);
        reassembly.insert(1, b"B".to_vec()).unwrap();
        assert!(!reassembly.is_complete());
        reassembly.insert(0, b"A".to_vec()).unwrap();
        assert!(reassembly.is_complete());
        assert_eq!(reassembly.assemble().unwrap(), b"AB".to_vec());
        assert_eq!(reassembly.block_ack_bitmap(), 0b11);
    }

    #[test]
    fn outbound_segmented_retransmits_only_unacked() {
        let mut outbound = OutboundSegmented::new(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()], 2);
        outbound.apply_block_ack(0b101);
        assert!(!outbound.is_complete());
        let outstanding = outbound.outstanding();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].0, 1);
    }

    #[test]
    fn block_ack_round_trips() {
        let ack = BlockAck { seq_zero: 0x0ABC, obo: true, block_ack: 0xDEAD_BEEF };
        let encoded = ack.encode();
        let decoded = BlockAck::decode(&encoded);
        assert_eq!(decoded.seq_zero, ack.seq_zero);
        assert_eq!(decoded.obo, ack.obo);
        assert_eq!(decoded.block_ack, ack.block_ack);
    }

    #[test]
    fn ack_timers_respect_floor() {
        assert_eq!(outbound_ack_timer(0), Duration::from_millis(200));
        assert_eq!(inbound_ack_timer(0), Duration::from_millis(150));
        assert!(outbound_ack_timer(10) > Duration::from_millis(200));
    }

    #[test]
    fn heartbeat_round_trips() {
        let heartbeat = Heartbeat { init_ttl: 5, features: 0x000F };
        let encoded = heartbeat.encode();
        let decoded = Heartbeat::decode(&encoded).unwrap();
        assert_eq!(decoded, heartbeat);
    }

    #[test]
    fn heartbeat_decode_rejects_truncated_payload() {
        assert!(Heartbeat::decode(&[0x05, 0x00]).is_err());
    }
}
