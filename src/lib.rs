//! stratus: the client core for retrieving erasure-coded files striped
//! across untrusted storage hosts.
//!
//! A file is named by a [`Link`]: a fixed-size identifier carrying the
//! Merkle root of the file's base sector. Resolving a link downloads and
//! parses that base sector into a layout, metadata, and a fanout of
//! per-chunk piece roots; reads then fetch erasure-coded pieces from hosts
//! through per-host [`worker`]s, authenticate every piece against its root
//! with [`merkle`] range proofs, and decode chunks as soon as enough pieces
//! return. The [`download`] orchestrator decides which hosts to ask, when to
//! launch redundant (overdrive) reads, and how to trade money for latency.
//!
//! The chain tracker, wallet, wire transport, and HTTP surface all live
//! outside this crate, behind the traits in [`transport`].

pub mod cancel;
pub mod client;
pub mod config;
pub mod distribution;
pub mod download;
pub mod erasure;
pub mod error;
pub mod hash;
pub mod layout;
pub mod link;
pub mod memory;
pub mod merkle;
pub mod pcws;
pub mod pool;
pub mod refcounter;
pub mod source;
pub mod transport;
pub mod wal;
pub mod worker;

pub use client::Client;
pub use config::ClientConfig;
pub use error::Error;
pub use hash::{Hash, SECTOR_SIZE, SEGMENT_SIZE};
pub use link::Link;
pub use source::DataSource;
