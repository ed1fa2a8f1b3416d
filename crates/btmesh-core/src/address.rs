//! Mesh addresses: unicast, group, virtual and the label-UUID hash.

use crate::crypto::kdf::s1;

/// A 16-bit Bluetooth Mesh address as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u16);

impl Address {
    pub const UNASSIGNED: Address = Address(0x0000);
    pub const ALL_NODES: Address = Address(0xFFFF);

    pub fn is_unassigned(self) -> bool {
        self.0 == 0x0000
    }

    pub fn is_unicast(self) -> bool {
        (0x0001..=0x7FFF).contains(&self.0)
    }

    pub fn is_virtual(self) -> bool {
        (0x8000..=0xBFFF).contains(&self.0)
    }

    pub fn is_group(self) -> bool {
        (0xC000..=0xFFFF).contains(&self.0)
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Address(u16::from_be_bytes(bytes))
    }
}

/// A destination address that may carry a 128-bit virtual label alongside
/// its 16-bit hashed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshAddress {
    Unassigned,
    Unicast(Address),
    Group(Address),
    Virtual { hashed: Address, label: [u8; 16] },
}

impl MeshAddress {
    pub fn address(self) -> Address {
        match self {
            MeshAddress::Unassigned => Address::UNASSIGNED,
            MeshAddress::Unicast(a) | MeshAddress::Group(a) => a,
            MeshAddress::Virtual { hashed, .. } => hashed,
        }
    }

    /// Builds a virtual address from a 128-bit label UUID, computing the
    /// hashed 16-bit form via `s1("vtad")` per the derivation in the spec.
    pub fn from_label(label: [u8; 16]) -> Self {
        let hashed = virtual_address_hash(label);
        MeshAddress::Virtual { hashed, label }
    }

    pub fn from_raw(addr: Address) -> Self {
        if addr.is_unassigned() {
            MeshAddress::Unassigned
        } else if addr.is_unicast() {
            MeshAddress::Unicast(addr)
        } else {
            MeshAddress::Group(addr)
        }
    }
}

/// `(AES-CMAC(s1("vtad"), labelUUID)[14..16] | 0x8000) & 0xBFFF`
pub fn virtual_address_hash(label: [u8; 16]) -> Address {
    let salt = s1(b"vtad");
    let mac = crate::crypto::cmac::aes_cmac(&salt, &label);
    let hi = u16::from_be_bytes([mac[14], mac[15]]);
    Address((hi | 0x8000) & 0xBFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_is_in_range() {
        let label = [0x01; 16];
        let hashed = virtual_address_hash(label);
        assert!(hashed.0 >= 0x8000 && hashed.0 <= 0xBFFF);
    }

    #[test]
    fn address_classification() {
        assert!(Address(0x0000).is_unassigned());
        assert!(Address(0x0001).is_unicast());
        assert!(Address(0x8000).is_virtual());
        assert!(Address(0xC000).is_group());
        assert!(Address(0xFFFF).is_group());
    }
}
