//! The job-level interface to a remote host.
//!
//! The wire framing, encryption handshake, and payment plumbing all live
//! outside this crate; a host is just something that answers job requests.
//! The three request kinds map one-to-one onto the worker's job queues.

use crate::hash::Hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifies a host for the lifetime of its contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPublicKey(pub [u8; 32]);

impl fmt::Display for HostPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ed25519:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for HostPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

/// A contract with a host, as reported by the contract source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contract {
    pub host_public_key: HostPublicKey, // identity of the host
    pub end_height: u64,                // block height at which the contract expires
    pub price_per_byte: u64,            // download cost, base units per byte
}

/// Supplies the current set of active contracts. The worker pool diffs this
/// on every update.
pub trait ContractSource: Send + Sync {
    fn contracts(&self) -> Vec<Contract>;
}

/// Key of a registry entry on a host.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RegistryKey(pub [u8; 32]);

/// A mutable registry entry stored on a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub key: RegistryKey,
    pub revision: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out")]
    Timeout,
    #[error("host rejected request: {0}")]
    Rejected(String),
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: u64, got: u64 },
    #[error("host sent an unexpected response kind")]
    UnexpectedResponse,
    #[error("no contract with host")]
    NoContract,
}

/// A single job-level request to a host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HostRequest {
    /// Which of these sector roots does the host hold?
    HasSector { roots: Vec<Hash> },
    /// Read a byte range of a sector, with a range proof against its root.
    ReadSector { root: Hash, offset: u64, length: u64 },
    /// Read a registry entry.
    ReadRegistry { key: RegistryKey },
}

/// The host's answer, positionally matching the request kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HostResponse {
    HasSector { present: Vec<bool> },
    ReadSector { data: Vec<u8>, proof: Vec<Hash> },
    ReadRegistry { entry: Option<RegistryEntry> },
}

/// One established session with one host. Implementations serialize their
/// own framing; the core only sees request/response pairs.
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn round_trip(&self, request: HostRequest) -> Result<HostResponse, TransportError>;
}

/// Produces a transport for a host the pool has a contract with.
pub trait HostDialer: Send + Sync {
    fn dial(&self, host: &HostPublicKey) -> Result<Arc<dyn HostTransport>, TransportError>;
}
