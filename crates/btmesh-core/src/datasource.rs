//! The mesh-network configuration data source: persisted network/app keys,
//! provisioners, nodes, groups and scenes, shaped after the Bluetooth SIG
//! Mesh Configuration Database Profile JSON document.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetKeyEntry {
    pub index: u16,
    pub name: String,
    #[serde(with = "hex_key")]
    pub key: [u8; 16],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_key: Option<String>,
    pub phase: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppKeyEntry {
    pub index: u16,
    pub bound_net_key: u16,
    pub name: String,
    #[serde(with = "hex_key")]
    pub key: [u8; 16],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRange {
    pub low_address: u16,
    pub high_address: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerEntry {
    pub uuid: String,
    pub name: String,
    pub allocated_unicast_range: Vec<AddressRange>,
    pub allocated_group_range: Vec<AddressRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub uuid: String,
    pub unicast_address: u16,
    pub element_count: u8,
    pub security: String,
    pub net_keys: Vec<u16>,
    pub app_keys: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
    pub configuration_complete: bool,
    /// Composition Data Page 0, hex-encoded verbatim as received from
    /// Config Composition Data Status. `None` until it arrives.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub composition_data_page0: Option<String>,
    /// Feature bits from Composition Data Page 0: relay (bit 0), proxy
    /// (bit 1), friend (bit 2), low power (bit 3).
    #[serde(default)]
    pub features: u8,
    #[serde(default = "default_ttl_value")]
    pub default_ttl: u8,
}

fn default_ttl_value() -> u8 {
    7
}

/// One IV-Index-scoped entry of the network exclusion list: unicast
/// addresses excluded from Friendship and IV-Index-recovery participation,
/// per the node(s) that were removed from the network under this IV index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkExclusion {
    pub iv_index: u32,
    pub addresses: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub address: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneEntry {
    pub number: u16,
    pub addresses: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshNetworkDocument {
    pub schema: String,
    pub id: String,
    pub version: String,
    pub mesh_uuid: String,
    #[serde(default)]
    pub mesh_name: String,
    pub net_keys: Vec<NetKeyEntry>,
    pub app_keys: Vec<AppKeyEntry>,
    pub provisioners: Vec<ProvisionerEntry>,
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub scenes: Vec<SceneEntry>,
    #[serde(default)]
    pub network_exclusions: Vec<NetworkExclusion>,
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 16-byte hex key"))
    }
}

/// The persistence seam: the host provides a concrete implementation
/// backed by whatever storage it likes; the core only ever imports or
/// exports the whole document.
pub trait MeshConfigurationDataSource {
    fn load(&self) -> Result<MeshNetworkDocument, ConfigError>;
    fn save(&self, document: &MeshNetworkDocument) -> Result<(), ConfigError>;
}

/// A `MeshConfigurationDataSource` backed by an in-memory JSON string,
/// matching the Mesh Configuration Database Profile schema.
pub struct JsonConfigurationStore {
    contents: std::cell::RefCell<String>,
}

impl JsonConfigurationStore {
    pub fn new(contents: String) -> Self {
        Self { contents: std::cell::RefCell::new(contents) }
    }
}

impl MeshConfigurationDataSource for JsonConfigurationStore {
    fn load(&self) -> Result<MeshNetworkDocument, ConfigError> {
        let document: MeshNetworkDocument = serde_json::from_str(&self.contents.borrow())?;
        Ok(document)
    }

    fn save(&self, document: &MeshNetworkDocument) -> Result<(), ConfigError> {
        let serialized = serde_json::to_string_pretty(document)?;
        *self.contents.borrow_mut() = serialized;
        Ok(())
    }
}

/// Finds the first unicast address range with at least `count` contiguous
/// free addresses given the already-assigned unicast addresses of known
/// nodes, per the provisioner's allocation responsibility.
pub fn allocate_unicast_address(
    provisioner: &ProvisionerEntry,
    taken: &[u16],
    element_count: u8,
) -> Result<u16, ConfigError> {
    let count = element_count as u32;
    for range in &provisioner.allocated_unicast_range {
        let mut candidate = range.low_address as u32;
        while candidate + count - 1 <= range.high_address as u32 {
            let span: Vec<u16> = (candidate..candidate + count).map(|a| a as u16).collect();
            if !span.iter().any(|a| taken.contains(a)) {
                return Ok(candidate as u16);
            }
            candidate += 1;
        }
    }
    Err(ConfigError::NoAddressAvailable)
}

/// Mesh key indices are a 12-bit field throughout the profile.
const MAX_KEY_INDEX: u16 = 0x0FFF;

fn validate_key_index(index: u16) -> Result<(), ConfigError> {
    if index > MAX_KEY_INDEX {
        return Err(ConfigError::KeyIndexOutOfRange(index));
    }
    Ok(())
}

fn validate_range(range: &AddressRange) -> Result<(), ConfigError> {
    if range.low_address == 0 || range.low_address > range.high_address {
        return Err(ConfigError::InvalidRange);
    }
    Ok(())
}

fn ranges_overlap(a: &AddressRange, b: &AddressRange) -> bool {
    a.low_address <= b.high_address && b.low_address <= a.high_address
}

/// Adds a network key, rejecting an out-of-range index.
pub fn add_net_key(document: &mut MeshNetworkDocument, entry: NetKeyEntry) -> Result<(), ConfigError> {
    validate_key_index(entry.index)?;
    document.net_keys.push(entry);
    Ok(())
}

/// Adds an application key, rejecting an out-of-range index.
pub fn add_app_key(document: &mut MeshNetworkDocument, entry: AppKeyEntry) -> Result<(), ConfigError> {
    validate_key_index(entry.index)?;
    document.app_keys.push(entry);
    Ok(())
}

/// Adds a provisioner, rejecting a malformed address range, a UUID already
/// present in the network, or unicast/group ranges that overlap an
/// existing provisioner's.
pub fn add_provisioner(document: &mut MeshNetworkDocument, provisioner: ProvisionerEntry) -> Result<(), ConfigError> {
    for range in provisioner.allocated_unicast_range.iter().chain(&provisioner.allocated_group_range) {
        validate_range(range)?;
    }
    for existing in &document.provisioners {
        if existing.uuid == provisioner.uuid {
            return Err(ConfigError::ProvisionerUsedInAnotherNetwork);
        }
        let overlaps = provisioner
            .allocated_unicast_range
            .iter()
            .any(|r| existing.allocated_unicast_range.iter().any(|er| ranges_overlap(r, er)))
            || provisioner
                .allocated_group_range
                .iter()
                .any(|r| existing.allocated_group_range.iter().any(|er| ranges_overlap(r, er)));
        if overlaps {
            return Err(ConfigError::OverlappingProvisionerRanges);
        }
    }
    document.provisioners.push(provisioner);
    Ok(())
}

/// Removes a provisioner by UUID, rejecting an unknown UUID.
pub fn remove_provisioner(document: &mut MeshNetworkDocument, uuid: &str) -> Result<(), ConfigError> {
    let before = document.provisioners.len();
    document.provisioners.retain(|p| p.uuid != uuid);
    if document.provisioners.len() == before {
        return Err(ConfigError::ProvisionerNotInNetwork);
    }
    Ok(())
}

/// Adds a newly-provisioned node, rejecting a duplicate UUID or a bound key
/// index out of range.
pub fn add_node(document: &mut MeshNetworkDocument, node: NodeEntry) -> Result<(), ConfigError> {
    if document.nodes.iter().any(|n| n.uuid == node.uuid) {
        return Err(ConfigError::NodeAlreadyExists);
    }
    for &index in node.net_keys.iter().chain(&node.app_keys) {
        validate_key_index(index)?;
    }
    document.nodes.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> MeshNetworkDocument {
        MeshNetworkDocument {
            schema: "http://json-schema.org/draft-04/schema#".into(),
            id: "http://www.bluetooth.com/specifications/assigned-numbers/mesh-profile/cdb-schema.json#".into(),
            version: "1.0.0".into(),
            mesh_uuid: "1234".into(),
            mesh_name: "test-network".into(),
            net_keys: vec![NetKeyEntry {
                index: 0,
                name: "primary".into(),
                key: [0x11; 16],
                old_key: None,
                phase: 0,
            }],
            app_keys: vec![],
            provisioners: vec![ProvisionerEntry {
                uuid: "abcd".into(),
                name: "provisioner".into(),
                allocated_unicast_range: vec![AddressRange { low_address: 0x0001, high_address: 0x00FF }],
                allocated_group_range: vec![],
            }],
            nodes: vec![],
            groups: vec![],
            scenes: vec![],
            network_exclusions: vec![],
        }
    }

    #[test]
    fn json_round_trip_preserves_hex_keys() {
        let document = sample_document();
        let store = JsonConfigurationStore::new(String::new());
        store.save(&document).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.net_keys[0].key, document.net_keys[0].key);
    }

    #[test]
    fn unicast_allocation_skips_taken_addresses() {
        let document = sample_document();
        let provisioner = &document.provisioners[0];
        let taken = vec![0x0001, 0x0002];
        let address = allocate_unicast_address(provisioner, &taken, 1).unwrap();
        assert_eq!(address, 0x0003);
    }

    #[test]
    fn unicast_allocation_fails_when_exhausted() {
        let provisioner = ProvisionerEntry {
            uuid: "abcd".into(),
            name: "p".into(),
            allocated_unicast_range: vec![AddressRange { low_address: 0x0001, high_address: 0x0002 }],
            allocated_group_range: vec![],
        };
        let taken = vec![0x0001, 0x0002];
        assert!(allocate_unicast_address(&provisioner, &taken, 1).is_err());
    }

    #[test]
    fn add_net_key_rejects_out_of_range_index() {
        let mut document = sample_document();
        let result = add_net_key(
            &mut document,
            NetKeyEntry { index: 0x1000, name: "bad".into(), key: [0x22; 16], old_key: None, phase: 0 },
        );
        assert!(matches!(result, Err(ConfigError::KeyIndexOutOfRange(0x1000))));
    }

    #[test]
    fn add_provisioner_rejects_duplicate_uuid() {
        let mut document = sample_document();
        let duplicate = ProvisionerEntry {
            uuid: "abcd".into(),
            name: "second".into(),
            allocated_unicast_range: vec![AddressRange { low_address: 0x0100, high_address: 0x01FF }],
            allocated_group_range: vec![],
        };
        assert!(matches!(add_provisioner(&mut document, duplicate), Err(ConfigError::ProvisionerUsedInAnotherNetwork)));
    }

    #[test]
    fn add_provisioner_rejects_overlapping_unicast_range() {
        let mut document = sample_document();
        let overlapping = ProvisionerEntry {
            uuid: "efgh".into(),
            name: "second".into(),
            allocated_unicast_range: vec![AddressRange { low_address: 0x0080, high_address: 0x0180 }],
            allocated_group_range: vec![],
        };
        assert!(matches!(add_provisioner(&mut document, overlapping), Err(ConfigError::OverlappingProvisionerRanges)));
    }

    #[test]
    fn add_provisioner_rejects_invalid_range() {
        let mut document = sample_document();
        let invalid = ProvisionerEntry {
            uuid: "efgh".into(),
            name: "second".into(),
            allocated_unicast_range: vec![AddressRange { low_address: 0x0200, high_address: 0x0100 }],
            allocated_group_range: vec![],
        };
        assert!(matches!(add_provisioner(&mut document, invalid), Err(ConfigError::InvalidRange)));
    }

    #[test]
    fn remove_provisioner_rejects_unknown_uuid() {
        let mut document = sample_document();
        assert!(matches!(remove_provisioner(&mut document, "not-there"), Err(ConfigError::ProvisionerNotInNetwork)));
    }

    #[test]
    fn add_node_rejects_duplicate_uuid() {
        let mut document = sample_document();
        let node = NodeEntry {
            uuid: "node-1".into(),
            unicast_address: 0x0003,
            element_count: 1,
            security: "secure".into(),
            net_keys: vec![0],
            app_keys: vec![],
            device_key: None,
            configuration_complete: false,
            composition_data_page0: None,
            features: 0,
            default_ttl: 7,
        };
        add_node(&mut document, node.clone()).unwrap();
        assert!(matches!(add_node(&mut document, node), Err(ConfigError::NodeAlreadyExists)));
    }
}
