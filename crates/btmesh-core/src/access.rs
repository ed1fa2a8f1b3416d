//! Access layer: opcode parsing/emission, model dispatch per element, the
//! outbound send queue with cancellation, and response correlation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::address::Address;
use crate::error::AccessError;
use crate::model::ModelDelegate;

/// A parsed access-layer opcode: 1, 2 or 3 bytes on the wire depending on
/// its top bits (`0xxxxxxx`, `10xxxxxx`, `11xxxxxx`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

impl Opcode {
    pub fn parse(data: &[u8]) -> Result<(Self, usize), AccessError> {
        if data.is_empty() {
            return Err(AccessError::Truncated);
        }
        let first = data[0];
        if first & 0x80 == 0 {
            Ok((Opcode(first as u32), 1))
        } else if first & 0xC0 == 0x80 {
            if first == 0x7F {
                return Err(AccessError::InvalidOpcode);
            }
            if data.len() < 2 {
                return Err(AccessError::Truncated);
            }
            Ok((Opcode(((first as u32) << 8) | data[1] as u32), 2))
        } else {
            if data.len() < 3 {
                return Err(AccessError::Truncated);
            }
            Ok((
                Opcode(((first as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32),
                3,
            ))
        }
    }

    pub fn encode(self) -> Vec<u8> {
        let v = self.0;
        if v <= 0x7F {
            vec![v as u8]
        } else if v <= 0xFFFF {
            vec![(v >> 8) as u8, v as u8]
        } else {
            vec![(v >> 16) as u8, (v >> 8) as u8, v as u8]
        }
    }
}

/// Splits an access PDU into its opcode and remaining payload.
pub fn parse_access_pdu(data: &[u8]) -> Result<(Opcode, &[u8]), AccessError> {
    let (opcode, len) = Opcode::parse(data)?;
    Ok((opcode, &data[len..]))
}

/// Builds an access PDU from an opcode and payload.
pub fn build_access_pdu(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = opcode.encode();
    out.extend_from_slice(payload);
    out
}

/// One addressable element: a unicast address offset plus the models
/// bound to it.
pub struct Element {
    pub address: Address,
    pub models: Vec<Box<dyn ModelDelegate>>,
}

impl Element {
    pub fn new(address: Address) -> Self {
        Self { address, models: Vec::new() }
    }

    pub fn add_model(&mut self, model: Box<dyn ModelDelegate>) {
        self.models.push(model);
    }

    fn model_for_opcode_mut(&mut self, opcode: Opcode) -> Option<&mut Box<dyn ModelDelegate>> {
        self.models.iter_mut().find(|m| m.opcodes().contains(&opcode))
    }
}

/// Dispatches an inbound access PDU to whichever model on `element`
/// declares the opcode, distinguishing acknowledged from unacknowledged
/// delivery by whether the caller expects a response back to `src`.
pub fn dispatch_unacknowledged(
    element: &mut Element,
    data: &[u8],
    src: Address,
    dst: Address,
) -> Result<(), AccessError> {
    let (opcode, payload) = parse_access_pdu(data)?;
    let model = element.model_for_opcode_mut(opcode).ok_or(AccessError::Unhandled)?;
    model.on_unacknowledged(opcode, payload, src, dst);
    Ok(())
}

/// As [`dispatch_unacknowledged`], but returns the response payload (still
/// needing its own opcode prefix chosen by the model/caller) if the model
/// produced one.
pub fn dispatch_acknowledged(
    element: &mut Element,
    data: &[u8],
    src: Address,
    dst: Address,
) -> Result<Option<Vec<u8>>, AccessError> {
    let (opcode, payload) = parse_access_pdu(data)?;
    let model = element.model_for_opcode_mut(opcode).ok_or(AccessError::Unhandled)?;
    Ok(model.on_acknowledged(opcode, payload, src, dst))
}

/// Delivers an inbound PDU that [`OutboundQueue::resolve_response`] matched
/// against a previously-sent request, to the model that owns that
/// request's opcode.
pub fn dispatch_response(
    element: &mut Element,
    data: &[u8],
    request: &PendingRequest,
    src: Address,
) -> Result<(), AccessError> {
    let (opcode, payload) = parse_access_pdu(data)?;
    let model = element.model_for_opcode_mut(opcode).ok_or(AccessError::Unhandled)?;
    model.on_response(opcode, payload, request, src);
    Ok(())
}

/// Opaque handle to a send in flight, returned synchronously so the host
/// can cancel before delivery or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed(SendFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Timeout,
    Cancelled,
    LowerTransport,
    /// The peer reported BusyAck: it cannot accept a new segmented message
    /// right now.
    Busy,
}

/// The previously-sent request an inbound response was correlated
/// against, handed to [`crate::model::ModelDelegate::on_response`] so a
/// model can tell which of its outstanding requests completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub handle: MessageHandle,
    pub opcode: Opcode,
    pub dst: Address,
}

struct PendingSend {
    handle: MessageHandle,
    dst: Address,
    key: (Opcode, Address, Address),
    deadline: Duration,
    cancelled: bool,
}

/// Per-destination FIFO outbound queue plus the acknowledged-message
/// correlation table keyed by `(opcode, src, dst)`.
pub struct OutboundQueue {
    next_handle: u64,
    queues: HashMap<Address, VecDeque<MessageHandle>>,
    pending: HashMap<MessageHandle, PendingSend>,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self {
            next_handle: 0,
            queues: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a send and returns its handle immediately.
    pub fn enqueue(
        &mut self,
        dst: Address,
        opcode: Opcode,
        src: Address,
        now: Duration,
        ack_timeout: Duration,
    ) -> MessageHandle {
        let handle = MessageHandle(self.next_handle);
        self.next_handle += 1;
        self.queues.entry(dst).or_default().push_back(handle);
        self.pending.insert(
            handle,
            PendingSend {
                handle,
                dst,
                key: (opcode, src, dst),
                deadline: now + ack_timeout,
                cancelled: false,
            },
        );
        handle
    }

    /// Cancels a pending send; returns `true` if it was still pending.
    pub fn cancel(&mut self, handle: MessageHandle) -> bool {
        if let Some(send) = self.pending.get_mut(&handle) {
            send.cancelled = true;
            true
        } else {
            false
        }
    }

    /// Resolves a pending acknowledged send when a matching response
    /// arrives, returning the correlated request if one was pending.
    pub fn resolve_response(&mut self, opcode: Opcode, src: Address, dst: Address) -> Option<PendingRequest> {
        let key = (opcode, dst, src);
        let handle = self
            .pending
            .iter()
            .find(|(_, send)| send.key == key && !send.cancelled)
            .map(|(h, _)| *h)?;
        let send = self.remove(handle)?;
        Some(PendingRequest { handle, opcode, dst: send.dst })
    }

    /// Settles a pending send as delivered outside the normal ack/timeout
    /// path, e.g. once outbound segmentation finishes acknowledging.
    pub fn resolve_delivered(&mut self, handle: MessageHandle) -> bool {
        self.remove(handle).is_some()
    }

    /// Settles a pending send as failed immediately, without waiting for
    /// its deadline, e.g. on a BusyAck.
    pub fn fail_now(&mut self, handle: MessageHandle) -> bool {
        self.remove(handle).is_some()
    }

    fn remove(&mut self, handle: MessageHandle) -> Option<PendingSend> {
        let send = self.pending.remove(&handle)?;
        if let Some(queue) = self.queues.get_mut(&send.dst) {
            queue.retain(|h| *h != handle);
        }
        Some(send)
    }

    /// Returns handles whose deadline has passed and removes them from
    /// the queue, to be reported to the caller as timeouts (unless they
    /// were already cancelled, in which case they report as cancelled).
    pub fn expire(&mut self, now: Duration) -> Vec<(MessageHandle, SendFailure)> {
        let expired: Vec<MessageHandle> = self
            .pending
            .iter()
            .filter(|(_, send)| send.deadline <= now)
            .map(|(h, _)| *h)
            .collect();

        let mut out = Vec::new();
        for handle in expired {
            if let Some(send) = self.remove(handle) {
                out.push((handle, if send.cancelled { SendFailure::Cancelled } else { SendFailure::Timeout }));
            }
        }
        out
    }
}

/// The §4.F access-layer acknowledged-message deadline: at least 30
/// seconds, longer if the host configures a larger timeout.
pub fn ack_timeout(configured: Duration) -> Duration {
    configured.max(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_one_byte_round_trips() {
        let data = [0x01, 0xAA, 0xBB];
        let (opcode, rest) = parse_access_pdu(&data).unwrap();
        assert_eq!(opcode, Opcode(0x01));
        assert_eq!(rest, &[0xAA, 0xBB]);
        assert_eq!(build_access_pdu(opcode, rest), data);
    }

    #[test]
    fn opcode_two_byte_round_trips() {
        let data = [0x82, 0x01, 0xFF];
        let (opcode, rest) = parse_access_pdu(&data).unwrap();
        assert_eq!(opcode, Opcode(0x8201));
        assert_eq!(rest, &[0xFF]);
        assert_eq!(build_access_pdu(opcode, rest), data);
    }

    #[test]
    fn opcode_three_byte_round_trips() {
        let data = [0xC0, 0x12, 0x34, 0x56];
        let (opcode, rest) = parse_access_pdu(&data).unwrap();
        assert_eq!(opcode, Opcode(0xC01234));
        assert_eq!(rest, &[0x56]);
        assert_eq!(build_access_pdu(opcode, rest), data);
    }

    #[test]
    fn reserved_opcode_0x7f_is_rejected() {
        assert!(Opcode::parse(&[0x7F, 0x00]).is_err());
    }

    #[test]
    fn outbound_queue_cancel_reports_cancelled() {
        let mut queue = OutboundQueue::new();
        let handle = queue.enqueue(Address(0x0002), Opcode(0x01), Address(0x0001), Duration::ZERO, Duration::from_secs(30));
        queue.cancel(handle);
        let expired = queue.expire(Duration::from_secs(31));
        assert_eq!(expired, vec![(handle, SendFailure::Cancelled)]);
    }

    #[test]
    fn outbound_queue_resolves_matching_response() {
        let mut queue = OutboundQueue::new();
        let handle = queue.enqueue(Address(0x0002), Opcode(0x01), Address(0x0001), Duration::ZERO, Duration::from_secs(30));
        let resolved = queue.resolve_response(Opcode(0x01), Address(0x0002), Address(0x0001));
        assert_eq!(resolved, Some(PendingRequest { handle, opcode: Opcode(0x01), dst: Address(0x0002) }));
        assert!(queue.expire(Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn access_ack_timeout_floors_at_30_seconds() {
        assert_eq!(ack_timeout(Duration::from_secs(5)), Duration::from_secs(30));
        assert_eq!(ack_timeout(Duration::from_secs(60)), Duration::from_secs(60));
    }
}
