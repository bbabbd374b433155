//! The crate-level error surface.
//!
//! Every failure class keeps its own enum next to the code that produces
//! it; this type composes them for callers of the top-level API. The
//! taxonomy is closed: callers match on kinds, never on message text.

use crate::download::DownloadError;
use crate::erasure::ErasureError;
use crate::layout::LayoutError;
use crate::link::LinkError;
use crate::merkle::MerkleError;
use crate::refcounter::RefCounterError;
use crate::transport::TransportError;
use crate::wal::WalError;
use crate::worker::{JobError, QueueError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Erasure(#[from] ErasureError),
    #[error(transparent)]
    RefCounter(#[from] RefCounterError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
