//! The worker pool: one worker per active contract.
//!
//! `update` diffs the contract source against the running workers, spawning
//! a loop for every new contract and killing the worker of every contract
//! that disappeared. Chunk downloads never hold worker references across
//! suspension points; they re-resolve by host key through the pool instead.

use crate::config::ClientConfig;
use crate::transport::{ContractSource, HostDialer, HostPublicKey};
use crate::worker::{Worker, WorkerStatus};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregated snapshot of the pool, for introspection only.
#[derive(Clone, Debug)]
pub struct PoolStatus {
    pub num_workers: usize,
    pub total_read_cooldown: usize,
    pub total_probe_cooldown: usize,
    pub workers: Vec<WorkerStatus>,
}

pub struct WorkerPool {
    workers: DashMap<HostPublicKey, Arc<Worker>>,
    dialer: Arc<dyn HostDialer>,
    contracts: Arc<dyn ContractSource>,
    config: Arc<ClientConfig>,
}

impl WorkerPool {
    /// Builds the pool and spawns a worker for every current contract. Must
    /// be called from within a tokio runtime.
    pub fn new(
        dialer: Arc<dyn HostDialer>,
        contracts: Arc<dyn ContractSource>,
        config: Arc<ClientConfig>,
    ) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool {
            workers: DashMap::new(),
            dialer,
            contracts,
            config,
        });
        pool.update();
        pool
    }

    /// Synchronizes the worker set with the current contract set.
    pub fn update(&self) {
        let contracts: HashMap<HostPublicKey, _> = self
            .contracts
            .contracts()
            .into_iter()
            .map(|c| (c.host_public_key, c))
            .collect();

        // Spawn a worker for every contract that does not have one yet.
        for (host_key, contract) in &contracts {
            if self.workers.contains_key(host_key) {
                continue;
            }
            let transport = match self.dialer.dial(host_key) {
                Ok(transport) => transport,
                Err(err) => {
                    warn!("could not dial host {}: {}", host_key, err);
                    continue;
                }
            };
            let worker = Worker::new(
                *host_key,
                contract.price_per_byte,
                transport,
                &self.config,
            );
            self.workers.insert(*host_key, Arc::clone(&worker));
            tokio::spawn(worker.run());
            debug!("added worker for host {}", host_key);
        }

        // Kill the worker of every contract that disappeared, draining its
        // queues with a cancellation error.
        let mut removed = 0;
        self.workers.retain(|host_key, worker| {
            if contracts.contains_key(host_key) {
                return true;
            }
            worker.kill();
            removed += 1;
            false
        });
        if removed > 0 {
            info!("removed {removed} worker(s) for expired contracts");
        }
    }

    /// Resolves a worker by host key.
    pub fn worker(&self, host_key: &HostPublicKey) -> Option<Arc<Worker>> {
        self.workers.get(host_key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every live worker.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Aggregates per-worker status. Not on any hot path.
    pub fn status(&self) -> PoolStatus {
        let workers: Vec<WorkerStatus> = self
            .workers
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        PoolStatus {
            num_workers: workers.len(),
            total_read_cooldown: workers.iter().filter(|w| w.read_queue.on_cooldown).count(),
            total_probe_cooldown: workers
                .iter()
                .filter(|w| w.has_sector_queue.on_cooldown)
                .count(),
            workers,
        }
    }

    /// Kills every worker. Called on client shutdown.
    pub fn shutdown(&self) {
        self.workers.retain(|_, worker| {
            worker.kill();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        Contract, HostRequest, HostResponse, HostTransport, TransportError,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NullTransport;

    #[async_trait]
    impl HostTransport for NullTransport {
        async fn round_trip(&self, _request: HostRequest) -> Result<HostResponse, TransportError> {
            Ok(HostResponse::HasSector { present: vec![] })
        }
    }

    struct NullDialer;

    impl HostDialer for NullDialer {
        fn dial(&self, _host: &HostPublicKey) -> Result<Arc<dyn HostTransport>, TransportError> {
            Ok(Arc::new(NullTransport))
        }
    }

    struct MutableContracts(Mutex<Vec<Contract>>);

    impl ContractSource for MutableContracts {
        fn contracts(&self) -> Vec<Contract> {
            self.0.lock().unwrap().clone()
        }
    }

    fn contract(byte: u8) -> Contract {
        Contract {
            host_public_key: HostPublicKey([byte; 32]),
            end_height: 1000,
            price_per_byte: 1,
        }
    }

    #[tokio::test]
    async fn update_tracks_the_contract_set() {
        let contracts = Arc::new(MutableContracts(Mutex::new(vec![contract(1), contract(2)])));
        let pool = WorkerPool::new(
            Arc::new(NullDialer),
            Arc::clone(&contracts) as Arc<dyn ContractSource>,
            Arc::new(ClientConfig::default()),
        );
        assert_eq!(pool.num_workers(), 2);
        assert!(pool.worker(&HostPublicKey([1; 32])).is_some());

        // Contract 1 vanishes, contract 3 appears.
        *contracts.0.lock().unwrap() = vec![contract(2), contract(3)];
        pool.update();
        assert_eq!(pool.num_workers(), 2);
        assert!(pool.worker(&HostPublicKey([1; 32])).is_none());
        assert!(pool.worker(&HostPublicKey([3; 32])).is_some());

        let status = pool.status();
        assert_eq!(status.num_workers, 2);
    }

    #[tokio::test]
    async fn removed_worker_rejects_new_jobs() {
        let contracts = Arc::new(MutableContracts(Mutex::new(vec![contract(7)])));
        let pool = WorkerPool::new(
            Arc::new(NullDialer),
            Arc::clone(&contracts) as Arc<dyn ContractSource>,
            Arc::new(ClientConfig::default()),
        );
        let worker = pool.worker(&HostPublicKey([7; 32])).unwrap();

        *contracts.0.lock().unwrap() = vec![];
        pool.update();
        assert_eq!(pool.num_workers(), 0);

        // The old handle is drained and closed.
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let err = worker
            .has_sector_queue
            .add(crate::worker::HasSectorJob {
                roots: vec![crate::hash::Hash([0; 32])],
                response_tx: tx,
                cancel: crate::cancel::CancelToken::never(),
            })
            .unwrap_err();
        assert_eq!(err, crate::worker::QueueError::Killed);
    }
}
