//! Error types for the btmesh-core library
//!
//! This module defines the per-layer error types and the top-level error
//! that composes them, mirroring the layering of the protocol engine itself.

use thiserror::Error;

/// Errors raised by the crypto primitives layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("CCM authentication tag mismatch")]
    MicMismatch,

    #[error("ECDH key agreement failed")]
    EcdhFailed,

    #[error("CCM encryption failed")]
    EncryptFailed,
}

/// Errors raised while encoding/decoding and processing Network PDUs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network PDU too short")]
    Truncated,

    #[error("no network key matches the PDU's NID")]
    NoMatchingKey,

    #[error("network MIC authentication failed: {0}")]
    Mic(#[from] CryptoError),

    #[error("sequence number or IV index did not advance the replay cache")]
    ReplayRejected,

    #[error("sequence number space for this IV index is exhausted")]
    SequenceExhausted,
}

/// Errors raised by the lower transport (segmentation/reassembly) layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransportError {
    #[error("lower transport PDU too short")]
    Truncated,

    #[error("segment index out of range for declared SegN")]
    SegmentOutOfRange,

    #[error("reassembly timed out waiting for missing segments")]
    Timeout,

    #[error("peer reported busy, not retrying")]
    Busy,

    #[error("retransmission limit exceeded")]
    RetriesExhausted,

    #[error("message was cancelled")]
    Cancelled,
}

/// Errors raised by the upper transport (access/control payload encryption) layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpperTransportError {
    #[error("upper transport PDU too short")]
    Truncated,

    #[error("no application or device key matches the PDU's AID")]
    NoMatchingKey,

    #[error("upper transport MIC authentication failed: {0}")]
    Mic(#[from] CryptoError),
}

/// Errors raised by the access layer (opcode dispatch, model delegates).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    #[error("access PDU too short to contain an opcode")]
    Truncated,

    #[error("opcode encoding is reserved or malformed")]
    InvalidOpcode,

    #[error("no model on the destination element handles this opcode")]
    Unhandled,

    #[error("acknowledged message timed out waiting for a response")]
    Timeout,
}

/// Errors raised by the Secure Network Beacon / IV-Index FSM.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconError {
    #[error("beacon PDU too short")]
    Truncated,

    #[error("beacon authentication value did not match any known network key")]
    AuthFailed,

    #[error("beacon-carried IV index regressed relative to current state")]
    Regressed,

    #[error("beacon-carried IV index jumped further than the recovery window allows")]
    OutOfRecoveryWindow,

    #[error("96-hour minimum state duration has not elapsed")]
    TooSoon,

    #[error("192-hour recovery cooldown has not elapsed")]
    RecoveryCooldown,
}

/// Errors raised by the provisioning FSM.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("provisioning PDU was received out of the expected state sequence")]
    InvalidState,

    #[error("provisioning PDU was malformed")]
    InvalidPdu,

    #[error("only the FIPS P-256 algorithm is supported")]
    UnsupportedAlgorithm,

    #[error("key pair generation failed")]
    KeyGenerationFailed,

    #[error("device confirmation value did not match")]
    ConfirmationFailed,

    #[error("peer reported a provisioning failure: {0}")]
    PeerFailed(u8),

    #[error("provisioning session timed out")]
    Timeout,
}

/// Errors raised while reading or writing the mesh configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("key index {0} is out of range")]
    KeyIndexOutOfRange(u16),

    #[error("requested address is not available")]
    AddressNotAvailable,

    #[error("provisioner address ranges overlap an existing provisioner")]
    OverlappingProvisionerRanges,

    #[error("no unicast address range has enough free addresses")]
    NoAddressAvailable,

    #[error("address or scene number range is invalid")]
    InvalidRange,

    #[error("provisioner UUID is already used by another network")]
    ProvisionerUsedInAnotherNetwork,

    #[error("provisioner is not a member of this network")]
    ProvisionerNotInNetwork,

    #[error("a node with this UUID already exists")]
    NodeAlreadyExists,

    #[error("key material field is not valid hex: {0}")]
    InvalidKeyHex(#[from] hex::FromHexError),

    #[error("configuration document JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The top-level error returned at the crate's public surface, composing
/// each layer's error type via `#[from]`.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("network layer error: {0}")]
    Network(#[from] NetworkError),

    #[error("lower transport error: {0}")]
    LowerTransport(#[from] LowerTransportError),

    #[error("upper transport error: {0}")]
    UpperTransport(#[from] UpperTransportError),

    #[error("access layer error: {0}")]
    Access(#[from] AccessError),

    #[error("beacon error: {0}")]
    Beacon(#[from] BeaconError),

    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
