//! The per-chunk worker set.
//!
//! For one chunk, tracks which workers claim to hold which piece. Every
//! worker in the pool gets a single existence probe carrying all of the
//! chunk's piece roots; until its reply lands the worker is *unresolved*
//! and carries the probe's expected completion time. Replies move workers to
//! the resolved set, firing any single-shot update registrations so a
//! waiting orchestrator can re-evaluate its options.
//!
//! Worker sets are built eagerly, well before the first download against
//! them, so the probes are already in flight while the consumer is still
//! seeking.

use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::distribution::ResolveTime;
use crate::erasure::ErasureCoder;
use crate::hash::Hash;
use crate::layout::CipherType;
use crate::memory::MemoryManager;
use crate::pool::WorkerPool;
use crate::transport::HostPublicKey;
use crate::worker::{HasSectorJob, HasSectorResponse};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// A worker whose probe has not returned yet.
pub(crate) struct UnresolvedWorker {
    pub resolve_time: ResolveTime,
}

/// A worker whose probe has returned. An empty piece list means the host
/// holds nothing usable for this chunk.
#[derive(Clone)]
pub(crate) struct ResolvedWorker {
    pub host: HostPublicKey,
    pub pieces: Vec<usize>,
}

struct WorkerSetState {
    unresolved: HashMap<HostPublicKey, UnresolvedWorker>,
    resolved: Vec<ResolvedWorker>,
    // Single-shot wake registrations, drained on every resolution change.
    waiters: Vec<oneshot::Sender<()>>,
}

/// The roster of workers for one chunk.
pub struct ChunkWorkerSet {
    pub(crate) piece_roots: Vec<Hash>,
    pub(crate) coder: Arc<dyn ErasureCoder>,
    pub(crate) cipher: CipherType,
    pub(crate) chunk_index: u64,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) config: Arc<ClientConfig>,
    state: Mutex<WorkerSetState>,
}

impl ChunkWorkerSet {
    /// Builds the set and submits one probe per pool worker. Probes carry
    /// `cancel`, so cancelling the parent download context abandons them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<WorkerPool>,
        memory: Arc<MemoryManager>,
        config: Arc<ClientConfig>,
        piece_roots: Vec<Hash>,
        coder: Arc<dyn ErasureCoder>,
        cipher: CipherType,
        chunk_index: u64,
        cancel: CancelToken,
    ) -> Arc<ChunkWorkerSet> {
        let set = Arc::new(ChunkWorkerSet {
            piece_roots,
            coder,
            cipher,
            chunk_index,
            pool,
            memory,
            config,
            state: Mutex::new(WorkerSetState {
                unresolved: HashMap::new(),
                resolved: Vec::new(),
                waiters: Vec::new(),
            }),
        });
        set.launch_probes(cancel);
        set
    }

    fn launch_probes(self: &Arc<Self>, cancel: CancelToken) {
        let workers = self.pool.workers();
        let (tx, rx) = mpsc::channel(workers.len().max(1));
        {
            let mut state = self.state.lock().unwrap();
            for worker in workers {
                let job = HasSectorJob {
                    roots: self.piece_roots.clone(),
                    response_tx: tx.clone(),
                    cancel: cancel.clone(),
                };
                match worker
                    .has_sector_queue
                    .add_with_estimate(job, self.config.probe_estimate_ceiling())
                {
                    Ok(resolve_time) => {
                        state
                            .unresolved
                            .insert(worker.host_key(), UnresolvedWorker { resolve_time });
                    }
                    Err(err) => {
                        // Too slow, cooling down, or killed: not worth
                        // waiting on for this chunk.
                        trace!(
                            "chunk {}: probe for worker {} rejected: {}",
                            self.chunk_index,
                            worker.host_key(),
                            err
                        );
                        state.resolved.push(ResolvedWorker {
                            host: worker.host_key(),
                            pieces: Vec::new(),
                        });
                    }
                }
            }
            debug!(
                "chunk {}: probing {} worker(s) for {} piece root(s)",
                self.chunk_index,
                state.unresolved.len(),
                self.piece_roots.len()
            );
        }

        let set = Arc::clone(self);
        tokio::spawn(async move {
            // rx closes once every probe has responded or been discarded.
            let mut rx = rx;
            loop {
                tokio::select! {
                    response = rx.recv() => match response {
                        Some(response) => set.integrate_response(response),
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn integrate_response(&self, response: HasSectorResponse) {
        let pieces: Vec<usize> = match response.result {
            Ok(present) => self
                .piece_roots
                .iter()
                .enumerate()
                .filter(|(i, _)| present.get(*i).copied().unwrap_or(false))
                .map(|(i, _)| i)
                .collect(),
            Err(err) => {
                debug!(
                    "chunk {}: probe for worker {} failed: {}",
                    self.chunk_index, response.worker, err
                );
                Vec::new()
            }
        };
        trace!(
            "chunk {}: worker {} resolved with {} piece(s)",
            self.chunk_index,
            response.worker,
            pieces.len()
        );

        let mut state = self.state.lock().unwrap();
        state.unresolved.remove(&response.worker);
        state.resolved.push(ResolvedWorker {
            host: response.worker,
            pieces,
        });
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Registers interest in the next resolution change. The registration is
    /// single-shot: it fires once and is discarded.
    pub(crate) fn register_for_worker_update(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().waiters.push(tx);
        rx
    }

    pub(crate) fn snapshot_unresolved(&self) -> Vec<(HostPublicKey, ResolveTime)> {
        self.state
            .lock()
            .unwrap()
            .unresolved
            .iter()
            .map(|(host, uw)| (*host, uw.resolve_time.clone()))
            .collect()
    }

    pub(crate) fn snapshot_resolved(&self) -> Vec<ResolvedWorker> {
        self.state.lock().unwrap().resolved.clone()
    }

    pub(crate) fn unresolved_count(&self) -> usize {
        self.state.lock().unwrap().unresolved.len()
    }

    pub fn piece_roots(&self) -> &[Hash] {
        &self.piece_roots
    }

    pub fn chunk_index(&self) -> u64 {
        self.chunk_index
    }
}
