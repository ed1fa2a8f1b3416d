//! A Bluetooth Mesh protocol engine: the layered PDU pipeline (network,
//! lower transport, upper transport, access) plus the Secure Network
//! Beacon / IV-Index FSM and the ECDH-based provisioning handshake.
//!
//! Bearer I/O, persistent configuration storage, and the catalogue of
//! application-level model message types are host concerns; this crate
//! exposes trait seams for them ([`bearer::Bearer`],
//! [`datasource::MeshConfigurationDataSource`], [`model::ModelDelegate`])
//! and otherwise owns every byte on the wire between them.

pub mod access;
pub mod address;
pub mod bearer;
pub mod beacon;
pub mod crypto;
pub mod datasource;
pub mod error;
pub mod keys;
pub mod lower;
pub mod manager;
pub mod model;
pub mod network;
pub mod provisioning;
pub mod upper;

pub use address::{Address, MeshAddress};
pub use error::MeshError;
pub use manager::{MeshManager, MeshManagerDelegate};
