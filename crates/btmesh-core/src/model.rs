//! The model delegate interface: the seam between the access layer and
//! application-level message handling (lighting, scenes, generic on/off,
//! configuration...). The core treats every model as an opcode table plus
//! three callbacks; it never interprets message payloads itself.

use std::collections::HashSet;

use crate::access::{Opcode, PendingRequest};
use crate::address::Address;

/// One application-level model bound to an element.
pub trait ModelDelegate: Send {
    /// Opcodes this model handles.
    fn opcodes(&self) -> HashSet<Opcode>;

    /// Whether this model supports subscription addresses (as opposed to
    /// being addressable only via unicast or the zero-index element).
    fn is_subscription_supported(&self) -> bool {
        true
    }

    /// Handles an acknowledged request, returning the response payload to
    /// send back (still opcode-prefixed) to `src`.
    fn on_acknowledged(&mut self, opcode: Opcode, payload: &[u8], src: Address, dst: Address) -> Option<Vec<u8>>;

    /// Handles an unacknowledged message; no reply is expected.
    fn on_unacknowledged(&mut self, opcode: Opcode, payload: &[u8], src: Address, dst: Address);

    /// Handles a response to `request`, a request this model previously
    /// sent.
    fn on_response(&mut self, opcode: Opcode, payload: &[u8], request: &PendingRequest, src: Address);
}
