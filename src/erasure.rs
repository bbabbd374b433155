//! Erasure coding for chunk data.
//!
//! Chunks are striped segment-by-segment: every `SEGMENT_SIZE` row of each
//! piece lines up with the matching row of every other piece, so a byte range
//! of the chunk maps onto the same aligned range of every piece. Decoding a
//! partial chunk therefore only requires the matching partial pieces.

use crate::hash::SEGMENT_SIZE;
use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErasureError {
    /// Fewer than `data_pieces` pieces were supplied to `recover`.
    #[error("not enough pieces to recover chunk data")]
    NotEnoughPieces,

    /// The supplied pieces disagree on length or are not segment aligned.
    #[error("piece shape mismatch: {0}")]
    PieceShape(String),

    /// The underlying codec rejected the parameters or data.
    #[error("reed-solomon codec: {0}")]
    Codec(String),
}

impl From<reed_solomon_erasure::Error> for ErasureError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        ErasureError::Codec(err.to_string())
    }
}

/// A maximum-distance-separable coder splitting chunk data into
/// `data_pieces + parity_pieces` pieces, any `data_pieces` of which suffice
/// to reconstruct.
pub trait ErasureCoder: Send + Sync {
    /// Number of pieces required to reconstruct the chunk.
    fn data_pieces(&self) -> usize;

    /// Number of redundant pieces.
    fn parity_pieces(&self) -> usize;

    /// Total number of pieces per chunk.
    fn num_pieces(&self) -> usize {
        self.data_pieces() + self.parity_pieces()
    }

    /// Alignment unit for partial-piece decoding, or `None` if the coder can
    /// only decode whole pieces.
    fn segment_size(&self) -> Option<u64>;

    /// Splits `data` into `num_pieces` equally sized pieces, padding the tail
    /// with zeros.
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError>;

    /// Reconstructs chunk data from at least `data_pieces` pieces. Every
    /// present piece must hold the same aligned byte range; the returned
    /// buffer is the chunk data for that range, `piece_len × data_pieces`
    /// bytes long.
    fn recover(&self, pieces: &mut [Option<Vec<u8>>]) -> Result<Vec<u8>, ErasureError>;
}

/// Segment-interleaved Reed-Solomon over GF(2^8).
pub struct RsSubCode {
    data: usize,
    parity: usize,
    inner: ReedSolomon,
}

impl RsSubCode {
    pub fn new(data_pieces: usize, parity_pieces: usize) -> Result<Self, ErasureError> {
        let inner = ReedSolomon::new(data_pieces, parity_pieces)?;
        Ok(RsSubCode {
            data: data_pieces,
            parity: parity_pieces,
            inner,
        })
    }
}

impl ErasureCoder for RsSubCode {
    fn data_pieces(&self) -> usize {
        self.data
    }

    fn parity_pieces(&self) -> usize {
        self.parity
    }

    fn segment_size(&self) -> Option<u64> {
        Some(SEGMENT_SIZE)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        let seg = SEGMENT_SIZE as usize;
        let row_size = seg * self.data;
        let rows = data.len().div_ceil(row_size).max(1);

        let mut pieces = vec![vec![0u8; rows * seg]; self.num_pieces()];
        for row in 0..rows {
            let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.num_pieces());
            for i in 0..self.data {
                let from = row * row_size + i * seg;
                let mut shard = vec![0u8; seg];
                if from < data.len() {
                    let take = seg.min(data.len() - from);
                    shard[..take].copy_from_slice(&data[from..from + take]);
                }
                shards.push(shard);
            }
            shards.resize(self.num_pieces(), vec![0u8; seg]);
            self.inner.encode(&mut shards)?;
            for (i, shard) in shards.iter().enumerate() {
                pieces[i][row * seg..(row + 1) * seg].copy_from_slice(shard);
            }
        }
        Ok(pieces)
    }

    fn recover(&self, pieces: &mut [Option<Vec<u8>>]) -> Result<Vec<u8>, ErasureError> {
        let seg = SEGMENT_SIZE as usize;
        if pieces.len() < self.num_pieces() {
            return Err(ErasureError::PieceShape(format!(
                "expected {} piece slots, got {}",
                self.num_pieces(),
                pieces.len()
            )));
        }
        let present = pieces.iter().filter(|p| p.is_some()).count();
        if present < self.data {
            return Err(ErasureError::NotEnoughPieces);
        }

        // All present pieces must agree on a segment-aligned length.
        let piece_len = pieces
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .ok_or(ErasureError::NotEnoughPieces)?;
        if piece_len == 0 || piece_len % seg != 0 {
            return Err(ErasureError::PieceShape(format!(
                "piece length {piece_len} not segment aligned"
            )));
        }
        for piece in pieces.iter().flatten() {
            if piece.len() != piece_len {
                return Err(ErasureError::PieceShape(format!(
                    "piece lengths disagree: {} vs {}",
                    piece.len(),
                    piece_len
                )));
            }
        }

        let rows = piece_len / seg;
        let mut out = Vec::with_capacity(rows * seg * self.data);
        for row in 0..rows {
            let mut shards: Vec<Option<Vec<u8>>> = pieces
                .iter()
                .take(self.num_pieces())
                .map(|p| {
                    p.as_ref()
                        .map(|piece| piece[row * seg..(row + 1) * seg].to_vec())
                })
                .collect();
            self.inner.reconstruct_data(&mut shards)?;
            for shard in shards.iter().take(self.data) {
                out.extend_from_slice(shard.as_ref().ok_or(ErasureError::NotEnoughPieces)?);
            }
        }
        Ok(out)
    }
}

/// The identity coder: one piece that is the chunk data itself. Used for base
/// sectors, which are stored unencoded.
pub struct Passthrough;

impl ErasureCoder for Passthrough {
    fn data_pieces(&self) -> usize {
        1
    }

    fn parity_pieces(&self) -> usize {
        0
    }

    fn segment_size(&self) -> Option<u64> {
        Some(SEGMENT_SIZE)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        Ok(vec![data.to_vec()])
    }

    fn recover(&self, pieces: &mut [Option<Vec<u8>>]) -> Result<Vec<u8>, ErasureError> {
        pieces
            .iter_mut()
            .find_map(Option::take)
            .ok_or(ErasureError::NotEnoughPieces)
    }
}
