//! The file link: a self-authenticating 34-byte identifier.
//!
//! A link is a 2-byte bitfield followed by the Merkle root of the file's
//! base sector. The bitfield packs the version, an alignment class, and the
//! offset and fetch-size of the region inside the base sector that holds the
//! file's layout, metadata, and leading bytes:
//!
//! ```text
//! bits 0..2    version - 1 (only version 1 is defined)
//! bits 2..     a unary run of 1s, length m in 0..=7, terminated by a 0;
//!              selects the alignment class: align = 4096 << m
//! next 3 bits  fetch size index f: fetch_size = (f + 1) * align
//! remainder    offset index: offset = index * align
//! ```
//!
//! The text form is the 46-character unpadded url-safe base64 of the raw 34
//! bytes.

use crate::hash::{Hash, HASH_SIZE, SECTOR_SIZE};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raw size of a link in bytes.
pub const LINK_SIZE: usize = 2 + HASH_SIZE;

/// Length of the base64 text form.
pub const LINK_STR_LEN: usize = 46;

const VERSION_BITS: u16 = 0b11;
const MAX_MODE: u32 = 7;
const BASE_ALIGN: u64 = 4096;
const FETCH_INDEX_BITS: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The version bits name a version this client does not understand.
    #[error("invalid link version")]
    InvalidVersion,

    /// The bitfield is internally inconsistent, or names a region outside
    /// the base sector.
    #[error("malformed link")]
    Malformed,

    /// The raw or text form has the wrong length or encoding.
    #[error("invalid link encoding")]
    InvalidEncoding,
}

/// A parsed link. The bitfield is kept verbatim so encoding round-trips
/// bit-exactly.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    bitfield: u16,
    root: Hash,
}

impl Link {
    /// Builds a version-1 link naming `fetch_size` bytes at `offset` within
    /// the base sector identified by `root`. The smallest alignment class
    /// that can represent the pair is chosen.
    pub fn new(root: Hash, offset: u64, fetch_size: u64) -> Result<Link, LinkError> {
        if fetch_size == 0 || offset + fetch_size > SECTOR_SIZE {
            return Err(LinkError::Malformed);
        }
        for mode in 0..=MAX_MODE {
            let align = BASE_ALIGN << mode;
            if offset % align != 0 {
                continue;
            }
            let fetch_index = fetch_size.div_ceil(align) - 1;
            if fetch_index >= 1 << FETCH_INDEX_BITS {
                continue;
            }
            let offset_index = offset / align;
            let offset_bits = 16 - 2 - (mode + 1) - FETCH_INDEX_BITS;
            if offset_index >= 1u64 << offset_bits {
                continue;
            }

            let mut bitfield: u16 = 0; // version 1
            let mut shift = 2;
            // The unary mode run and its terminating zero.
            bitfield |= (((1u16 << mode) - 1) & 0x7F) << shift;
            shift += mode + 1;
            bitfield |= (fetch_index as u16) << shift;
            shift += FETCH_INDEX_BITS;
            bitfield |= (offset_index as u16) << shift;
            return Ok(Link { bitfield, root });
        }
        Err(LinkError::Malformed)
    }

    /// Reassembles a link from its raw 34 bytes. The bitfield is not
    /// validated here; `offset_and_fetch_size` is where inconsistencies
    /// surface.
    pub fn from_bytes(bytes: &[u8]) -> Result<Link, LinkError> {
        if bytes.len() != LINK_SIZE {
            return Err(LinkError::InvalidEncoding);
        }
        let bitfield = u16::from_le_bytes([bytes[0], bytes[1]]);
        let root = Hash::from_slice(&bytes[2..]).ok_or(LinkError::InvalidEncoding)?;
        Ok(Link { bitfield, root })
    }

    pub fn to_bytes(&self) -> [u8; LINK_SIZE] {
        let mut out = [0u8; LINK_SIZE];
        out[..2].copy_from_slice(&self.bitfield.to_le_bytes());
        out[2..].copy_from_slice(self.root.as_bytes());
        out
    }

    /// The link format version, 1-based.
    pub fn version(&self) -> u8 {
        (self.bitfield & VERSION_BITS) as u8 + 1
    }

    /// The root of the base sector this link names.
    pub fn merkle_root(&self) -> Hash {
        self.root
    }

    /// Decodes the offset and fetch size of the named region, validating
    /// the bitfield.
    pub fn offset_and_fetch_size(&self) -> Result<(u64, u64), LinkError> {
        if self.version() != 1 {
            return Err(LinkError::InvalidVersion);
        }
        let mut bits = self.bitfield >> 2;

        let mut mode = 0u32;
        while mode < MAX_MODE && bits & 1 == 1 {
            mode += 1;
            bits >>= 1;
        }
        if bits & 1 == 1 {
            // An eighth run bit: no alignment class this long exists.
            return Err(LinkError::Malformed);
        }
        bits >>= 1; // the terminating zero

        let align = BASE_ALIGN << mode;
        let fetch_index = (bits & ((1 << FETCH_INDEX_BITS) - 1) as u16) as u64;
        bits >>= FETCH_INDEX_BITS;
        let offset_index = bits as u64;

        let offset = offset_index * align;
        let fetch_size = (fetch_index + 1) * align;
        if offset + fetch_size > SECTOR_SIZE {
            return Err(LinkError::Malformed);
        }
        Ok((offset, fetch_size))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.to_bytes()))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({self})")
    }
}

impl FromStr for Link {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != LINK_STR_LEN {
            return Err(LinkError::InvalidEncoding);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| LinkError::InvalidEncoding)?;
        Link::from_bytes(&bytes)
    }
}
