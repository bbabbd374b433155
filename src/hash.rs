//! Hashing primitives shared by the whole client: the 32-byte sector hash,
//! the sector and segment size constants, and the domain-separated leaf and
//! node hashes the Merkle engine is built on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Size of a sector stored on a host, in bytes.
pub const SECTOR_SIZE: u64 = 1 << 22; // 4 MiB

/// Size of a Merkle leaf within a sector, in bytes.
pub const SEGMENT_SIZE: u64 = 64;

/// Number of leaves in a full sector.
pub const SEGMENTS_PER_SECTOR: u64 = SECTOR_SIZE / SEGMENT_SIZE;

/// Size of a hash in bytes.
pub const HASH_SIZE: usize = 32;

// Domain separation prefixes. A leaf must never be confusable with an
// interior node.
const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// A 32-byte hash identifying a sector, a subtree, or a Merkle root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    /// Parses a hash out of an arbitrary byte slice. Returns `None` if the
    /// slice is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hashes drown log lines; eight hex chars identify a sector
        // well enough for debugging.
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

/// Hashes a single leaf. The leaf may be shorter than `SEGMENT_SIZE` when it
/// is the final, partial leaf of a stream.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Hashes two child subtree roots into their parent.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_node_hashes_are_domain_separated() {
        let left = leaf_hash(b"left");
        let right = leaf_hash(b"right");
        let parent = node_hash(&left, &right);
        assert_ne!(parent, left);
        assert_ne!(parent, right);

        // A node hash over leaf bytes must differ from the leaf hash of the
        // same bytes.
        let mut concat = Vec::new();
        concat.extend_from_slice(left.as_bytes());
        concat.extend_from_slice(right.as_bytes());
        assert_ne!(parent, leaf_hash(&concat));
    }

    #[test]
    fn hash_roundtrips_through_slice() {
        let h = leaf_hash(b"roundtrip");
        assert_eq!(Hash::from_slice(h.as_bytes()), Some(h));
        assert_eq!(Hash::from_slice(&h.as_bytes()[..31]), None);
    }
}
