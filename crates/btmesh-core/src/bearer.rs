//! The bearer interface: the host-supplied transport (advertising bearer
//! or GATT proxy connection) this core sends PDUs over and receives them
//! from. Bearer I/O itself is out of scope; only whole PDUs cross this
//! seam.

/// Which kind of PDU a bearer frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    NetworkPdu,
    MeshBeacon,
    ProxyConfiguration,
    ProvisioningPdu,
}

/// A host-supplied bearer. The host owns advertising/scanning or the GATT
/// proxy connection and hands whole, already-defragmented PDUs to the
/// core via the manager's inbound entry point; this trait is only the
/// outbound half.
pub trait Bearer: Send {
    fn send(&mut self, pdu: &[u8], pdu_type: PduType);
}
