//! Base sector layout, file metadata, and the fanout.
//!
//! The first bytes of a base sector are a fixed 60-byte layout prefix,
//! followed by `metadata_size` bytes of JSON metadata, `fanout_size` bytes of
//! tightly packed piece roots, and finally the leading bytes of the file
//! itself. The layout byte format is shared with the (out of scope) upload
//! path and must not drift.

use crate::hash::{Hash, HASH_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Size of the fixed layout prefix in bytes.
pub const LAYOUT_SIZE: usize = 60;

/// Current layout version.
pub const LAYOUT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum LayoutError {
    /// The base sector is shorter than its declared layout regions.
    #[error("base sector too short for its declared layout")]
    Truncated,

    /// The layout prefix carries an unknown version.
    #[error("unknown layout version {0}")]
    UnknownVersion(u8),

    /// The metadata region is not the JSON document the format requires.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(#[from] serde_json::Error),

    /// The fanout region does not divide into whole chunks.
    #[error("fanout does not contain a whole number of chunks")]
    MalformedFanout,

    /// The layout declares a cipher this client cannot decrypt.
    #[error("unsupported cipher type {0}")]
    UnsupportedCipher(u8),

    /// The fanout declares an impossible erasure configuration.
    #[error("invalid erasure configuration: {data} data / {parity} parity")]
    InvalidErasureConfig { data: u8, parity: u8 },
}

/// The ciphers a layout may declare. Only `Plain` content is decryptable by
/// this core; key management for the others lives with the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherType {
    /// No encryption.
    Plain,
    /// Stream cipher, no per-block overhead.
    XChaCha20,
    /// Authenticated blocks; each carries a tag, so partial-chunk reads are
    /// impossible.
    TwofishGcm,
}

impl CipherType {
    pub fn from_u8(value: u8) -> Result<CipherType, LayoutError> {
        match value {
            0 => Ok(CipherType::Plain),
            1 => Ok(CipherType::XChaCha20),
            2 => Ok(CipherType::TwofishGcm),
            other => Err(LayoutError::UnsupportedCipher(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CipherType::Plain => 0,
            CipherType::XChaCha20 => 1,
            CipherType::TwofishGcm => 2,
        }
    }

    /// Per-block ciphertext overhead in bytes. Nonzero overhead forces
    /// full-chunk downloads.
    pub fn overhead(&self) -> u64 {
        match self {
            CipherType::Plain | CipherType::XChaCha20 => 0,
            CipherType::TwofishGcm => 28,
        }
    }
}

/// The fixed prefix of a base sector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub version: u8,
    pub filesize: u64,
    pub metadata_size: u64,
    pub fanout_size: u64,
    pub fanout_data_pieces: u8,
    pub fanout_parity_pieces: u8,
    pub cipher_type: CipherType,
    pub cipher_key: [u8; 32],
}

impl Layout {
    pub fn encode(&self) -> [u8; LAYOUT_SIZE] {
        let mut out = [0u8; LAYOUT_SIZE];
        out[0] = self.version;
        out[1..9].copy_from_slice(&self.filesize.to_le_bytes());
        out[9..17].copy_from_slice(&self.metadata_size.to_le_bytes());
        out[17..25].copy_from_slice(&self.fanout_size.to_le_bytes());
        out[25] = self.fanout_data_pieces;
        out[26] = self.fanout_parity_pieces;
        out[27] = self.cipher_type.as_u8();
        out[28..60].copy_from_slice(&self.cipher_key);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Layout, LayoutError> {
        if bytes.len() < LAYOUT_SIZE {
            return Err(LayoutError::Truncated);
        }
        let version = bytes[0];
        if version != LAYOUT_VERSION {
            return Err(LayoutError::UnknownVersion(version));
        }
        Ok(Layout {
            version,
            filesize: u64::from_le_bytes(bytes[1..9].try_into().unwrap()),
            metadata_size: u64::from_le_bytes(bytes[9..17].try_into().unwrap()),
            fanout_size: u64::from_le_bytes(bytes[17..25].try_into().unwrap()),
            fanout_data_pieces: bytes[25],
            fanout_parity_pieces: bytes[26],
            cipher_type: CipherType::from_u8(bytes[27])?,
            cipher_key: bytes[28..60].try_into().unwrap(),
        })
    }
}

/// A named span within a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubfileMetadata {
    pub filename: String,
    pub offset: u64,
    pub len: u64,
}

/// The JSON metadata stored behind the layout prefix. The schema is mostly
/// opaque to the core, but a file always has a name and a length, and may
/// pack subfiles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub filename: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subfiles: BTreeMap<String, SubfileMetadata>,
}

/// Everything parsed out of a base sector.
pub struct BaseSector {
    pub layout: Layout,
    pub metadata: Metadata,
    pub fanout: Vec<u8>,
    pub first_chunk: Vec<u8>,
}

/// Splits a base sector into its regions and parses the structured ones.
pub fn parse_base_sector(base: &[u8]) -> Result<BaseSector, LayoutError> {
    let layout = Layout::decode(base)?;
    let metadata_end = LAYOUT_SIZE as u64 + layout.metadata_size;
    let fanout_end = metadata_end + layout.fanout_size;
    if fanout_end > base.len() as u64 {
        return Err(LayoutError::Truncated);
    }
    let metadata: Metadata =
        serde_json::from_slice(&base[LAYOUT_SIZE..metadata_end as usize])?;
    let fanout = base[metadata_end as usize..fanout_end as usize].to_vec();

    // A file with a fanout keeps all of its bytes in the fanout chunks; one
    // without keeps the whole file behind the fanout region. Anything past
    // that is sector padding.
    let first_chunk = if layout.fanout_size > 0 {
        Vec::new()
    } else {
        let chunk_end = fanout_end + layout.filesize;
        if chunk_end > base.len() as u64 {
            return Err(LayoutError::Truncated);
        }
        base[fanout_end as usize..chunk_end as usize].to_vec()
    };
    Ok(BaseSector {
        layout,
        metadata,
        fanout,
        first_chunk,
    })
}

/// Assembles the byte regions of a base sector. The inverse of
/// `parse_base_sector`; the upload path proper is out of scope, but the
/// format has two sides.
pub fn build_base_sector(
    layout: &Layout,
    metadata_json: &[u8],
    fanout: &[u8],
    first_chunk: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(LAYOUT_SIZE + metadata_json.len() + fanout.len() + first_chunk.len());
    out.extend_from_slice(&layout.encode());
    out.extend_from_slice(metadata_json);
    out.extend_from_slice(fanout);
    out.extend_from_slice(first_chunk);
    out
}

/// Number of roots stored per chunk in the fanout. 1-of-N plain chunks have
/// identical pieces, so a single root covers all of them.
pub fn fanout_pieces_per_chunk(layout: &Layout) -> Result<u64, LayoutError> {
    if layout.fanout_data_pieces == 0 {
        return Err(LayoutError::InvalidErasureConfig {
            data: layout.fanout_data_pieces,
            parity: layout.fanout_parity_pieces,
        });
    }
    if layout.fanout_data_pieces == 1 && layout.cipher_type == CipherType::Plain {
        Ok(1)
    } else {
        Ok(layout.fanout_data_pieces as u64 + layout.fanout_parity_pieces as u64)
    }
}

/// Decodes the fanout region into per-chunk piece root arrays.
pub fn decode_fanout(layout: &Layout, fanout: &[u8]) -> Result<Vec<Vec<Hash>>, LayoutError> {
    if fanout.is_empty() {
        return Ok(Vec::new());
    }
    let pieces_per_chunk = fanout_pieces_per_chunk(layout)?;
    let chunk_roots_size = (HASH_SIZE as u64) * pieces_per_chunk;
    if fanout.len() as u64 % chunk_roots_size != 0 {
        return Err(LayoutError::MalformedFanout);
    }
    let num_chunks = fanout.len() as u64 / chunk_roots_size;

    let mut chunks = Vec::with_capacity(num_chunks as usize);
    for i in 0..num_chunks {
        let mut roots = Vec::with_capacity(pieces_per_chunk as usize);
        for j in 0..pieces_per_chunk {
            let from = (i * chunk_roots_size + j * HASH_SIZE as u64) as usize;
            // from..from+32 is in bounds by the modulus check above.
            roots.push(Hash::from_slice(&fanout[from..from + HASH_SIZE]).unwrap());
        }
        chunks.push(roots);
    }
    Ok(chunks)
}

/// Packs per-chunk piece roots back into fanout bytes.
pub fn encode_fanout(chunks: &[Vec<Hash>]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        for root in chunk {
            out.extend_from_slice(root.as_bytes());
        }
    }
    out
}
