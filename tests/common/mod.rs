//! In-memory host network for integration tests: a set of simulated hosts
//! behind the real `HostTransport`/`HostDialer`/`ContractSource` traits,
//! plus the upload half of the file format so tests can mint links.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratus::erasure::{ErasureCoder, RsSubCode};
use stratus::hash::{Hash, SECTOR_SIZE, SEGMENT_SIZE};
use stratus::layout::{
    build_base_sector, encode_fanout, CipherType, Layout, Metadata, LAYOUT_VERSION,
};
use stratus::link::Link;
use stratus::merkle::{build_range_proof, sector_root, SliceSubtreeHasher};
use stratus::transport::{
    Contract, ContractSource, HostDialer, HostPublicKey, HostRequest, HostResponse,
    HostTransport, TransportError,
};

/// One simulated host: a sector store with injectable latency and faults.
pub struct SimHost {
    pub key: HostPublicKey,
    sectors: Mutex<HashMap<Hash, Vec<u8>>>,
    probe_latency: Mutex<Duration>,
    read_latency: Mutex<Duration>,
    corrupt_reads: AtomicBool,
    fail_reads: AtomicBool,
    probe_requests: AtomicUsize,
    read_requests: AtomicUsize,
}

impl SimHost {
    fn new(key: HostPublicKey) -> Self {
        SimHost {
            key,
            sectors: Mutex::new(HashMap::new()),
            probe_latency: Mutex::new(Duration::ZERO),
            read_latency: Mutex::new(Duration::ZERO),
            corrupt_reads: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            probe_requests: AtomicUsize::new(0),
            read_requests: AtomicUsize::new(0),
        }
    }

    pub fn store(&self, root: Hash, data: Vec<u8>) {
        self.sectors.lock().unwrap().insert(root, data);
    }

    pub fn set_probe_latency(&self, latency: Duration) {
        *self.probe_latency.lock().unwrap() = latency;
    }

    pub fn set_read_latency(&self, latency: Duration) {
        *self.read_latency.lock().unwrap() = latency;
    }

    /// Served read data is flipped in one byte, so range proofs stop
    /// verifying.
    pub fn set_corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn read_requests(&self) -> usize {
        self.read_requests.load(Ordering::SeqCst)
    }

    pub fn probe_requests(&self) -> usize {
        self.probe_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostTransport for SimHost {
    async fn round_trip(&self, request: HostRequest) -> Result<HostResponse, TransportError> {
        match request {
            HostRequest::HasSector { roots } => {
                self.probe_requests.fetch_add(1, Ordering::SeqCst);
                let latency = *self.probe_latency.lock().unwrap();
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let sectors = self.sectors.lock().unwrap();
                Ok(HostResponse::HasSector {
                    present: roots.iter().map(|root| sectors.contains_key(root)).collect(),
                })
            }
            HostRequest::ReadSector {
                root,
                offset,
                length,
            } => {
                self.read_requests.fetch_add(1, Ordering::SeqCst);
                let latency = *self.read_latency.lock().unwrap();
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                if self.fail_reads.load(Ordering::SeqCst) {
                    return Err(TransportError::Connection("injected fault".into()));
                }
                let sectors = self.sectors.lock().unwrap();
                let sector = sectors
                    .get(&root)
                    .ok_or_else(|| TransportError::Rejected("no such sector".into()))?;
                let end = (offset + length) as usize;
                if end > sector.len() {
                    return Err(TransportError::Rejected(format!(
                        "read [{offset}, {end}) outside sector of {} bytes",
                        sector.len()
                    )));
                }
                let mut data = sector[offset as usize..end].to_vec();
                let mut hasher = SliceSubtreeHasher::new(sector);
                let proof = build_range_proof(
                    offset / SEGMENT_SIZE,
                    (offset + length) / SEGMENT_SIZE,
                    &mut hasher,
                )
                .expect("proof range is validated by the worker");
                if self.corrupt_reads.load(Ordering::SeqCst) {
                    data[0] ^= 0xFF;
                }
                Ok(HostResponse::ReadSector { data, proof })
            }
            HostRequest::ReadRegistry { .. } => Ok(HostResponse::ReadRegistry { entry: None }),
        }
    }
}

/// A set of simulated hosts acting as dialer and contract source at once.
pub struct SimNet {
    hosts: Mutex<Vec<Arc<SimHost>>>,
}

impl SimNet {
    pub fn new() -> Arc<SimNet> {
        Arc::new(SimNet {
            hosts: Mutex::new(Vec::new()),
        })
    }

    pub fn add_host(&self, id: u8) -> Arc<SimHost> {
        let host = Arc::new(SimHost::new(HostPublicKey([id; 32])));
        self.hosts.lock().unwrap().push(Arc::clone(&host));
        host
    }

    pub fn add_hosts(&self, count: u8) -> Vec<Arc<SimHost>> {
        (0..count).map(|i| self.add_host(i + 1)).collect()
    }

    /// Drops a host from the contract set. Takes effect at the next pool
    /// update.
    pub fn remove_host(&self, key: HostPublicKey) {
        self.hosts.lock().unwrap().retain(|host| host.key != key);
    }

    pub fn total_read_requests(&self) -> usize {
        self.hosts
            .lock()
            .unwrap()
            .iter()
            .map(|host| host.read_requests())
            .sum()
    }

    pub fn total_requests(&self) -> usize {
        self.hosts
            .lock()
            .unwrap()
            .iter()
            .map(|host| host.read_requests() + host.probe_requests())
            .sum()
    }
}

impl HostDialer for SimNet {
    fn dial(&self, host: &HostPublicKey) -> Result<Arc<dyn HostTransport>, TransportError> {
        self.hosts
            .lock()
            .unwrap()
            .iter()
            .find(|candidate| candidate.key == *host)
            .map(|candidate| Arc::clone(candidate) as Arc<dyn HostTransport>)
            .ok_or(TransportError::NoContract)
    }
}

impl ContractSource for SimNet {
    fn contracts(&self) -> Vec<Contract> {
        self.hosts
            .lock()
            .unwrap()
            .iter()
            .map(|host| Contract {
                host_public_key: host.key,
                end_height: 100_000,
                // Free hosts keep the price penalty out of latency-focused
                // scenarios.
                price_per_byte: 0,
            })
            .collect()
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Uploads `data` as a fanout file: the base sector carries only layout,
/// metadata, and fanout; the file bytes are erasure-coded across `hosts`,
/// piece `i` of every chunk landing on host `i % hosts.len()`.
pub fn upload_file(
    hosts: &[Arc<SimHost>],
    data: &[u8],
    data_pieces: usize,
    parity_pieces: usize,
    filename: &str,
) -> Link {
    let coder = RsSubCode::new(data_pieces, parity_pieces).expect("valid coder");
    let chunk_size = (data_pieces as u64 * SECTOR_SIZE) as usize;

    let single_root = data_pieces == 1; // 1-of-N plain stores one root per chunk
    let mut fanout_chunks: Vec<Vec<Hash>> = Vec::new();
    for chunk_data in data.chunks(chunk_size) {
        let pieces = coder.encode(chunk_data).expect("encode chunk");
        let roots: Vec<Hash> = pieces.iter().map(|piece| sector_root(piece)).collect();
        if single_root {
            // Every piece is interchangeable; replicate the data piece so
            // any host can serve it.
            for host in hosts {
                host.store(roots[0], pieces[0].clone());
            }
            fanout_chunks.push(vec![roots[0]]);
        } else {
            for (i, piece) in pieces.into_iter().enumerate() {
                hosts[i % hosts.len()].store(roots[i], piece);
            }
            fanout_chunks.push(roots);
        }
    }

    publish_base(
        hosts,
        &fanout_chunks,
        data.len() as u64,
        data_pieces as u8,
        parity_pieces as u8,
        filename,
    )
}

/// Builds and stores a base sector for an already-distributed fanout,
/// returning its link. Lets tests control piece placement themselves.
pub fn publish_base(
    base_hosts: &[Arc<SimHost>],
    fanout_chunks: &[Vec<Hash>],
    filesize: u64,
    data_pieces: u8,
    parity_pieces: u8,
    filename: &str,
) -> Link {
    let metadata = Metadata {
        filename: filename.to_string(),
        length: filesize,
        subfiles: Default::default(),
    };
    let metadata_json = serde_json::to_vec(&metadata).expect("metadata json");
    let fanout = encode_fanout(fanout_chunks);
    let layout = Layout {
        version: LAYOUT_VERSION,
        filesize,
        metadata_size: metadata_json.len() as u64,
        fanout_size: fanout.len() as u64,
        fanout_data_pieces: data_pieces,
        fanout_parity_pieces: parity_pieces,
        cipher_type: CipherType::Plain,
        cipher_key: [0; 32],
    };
    let mut base = build_base_sector(&layout, &metadata_json, &fanout, &[]);

    // Hosts serve whole aligned ranges, so the stored base sector is padded
    // out to the link's fetch size.
    let fetch_size = round_up(base.len() as u64, 4096);
    base.resize(fetch_size as usize, 0);
    let base_root = sector_root(&base);
    for host in base_hosts {
        host.store(base_root, base.clone());
    }
    Link::new(base_root, 0, fetch_size).expect("link for base sector")
}

/// Uploads `data` as a small file living entirely inside its base sector.
pub fn upload_small_file(hosts: &[Arc<SimHost>], data: &[u8], filename: &str) -> Link {
    let metadata = Metadata {
        filename: filename.to_string(),
        length: data.len() as u64,
        subfiles: Default::default(),
    };
    let metadata_json = serde_json::to_vec(&metadata).expect("metadata json");
    let layout = Layout {
        version: LAYOUT_VERSION,
        filesize: data.len() as u64,
        metadata_size: metadata_json.len() as u64,
        fanout_size: 0,
        fanout_data_pieces: 1,
        fanout_parity_pieces: 0,
        cipher_type: CipherType::Plain,
        cipher_key: [0; 32],
    };
    let mut base = build_base_sector(&layout, &metadata_json, &[], data);
    let fetch_size = round_up(base.len() as u64, 4096);
    base.resize(fetch_size as usize, 0);
    let base_root = sector_root(&base);
    for host in hosts {
        host.store(base_root, base.clone());
    }
    Link::new(base_root, 0, fetch_size).expect("link for base sector")
}

/// Deterministic pseudo-random bytes for payloads.
pub fn pattern_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
