//! The client façade.
//!
//! Wires the worker pool, memory manager, and configuration together and
//! turns links into data sources. Embedders construct one `Client` per
//! identity and keep it alive for the life of the process.

use crate::cancel::CancelSource;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::link::Link;
use crate::memory::MemoryManager;
use crate::pool::{PoolStatus, WorkerPool};
use crate::source::DataSource;
use crate::transport::{ContractSource, HostDialer};
use log::info;
use std::sync::Arc;

pub struct Client {
    pool: Arc<WorkerPool>,
    memory: Arc<MemoryManager>,
    config: Arc<ClientConfig>,
    cancel: CancelSource,
}

impl Client {
    /// Builds a client and spawns a worker per current contract. Must be
    /// called from within a tokio runtime.
    pub fn new(
        dialer: Arc<dyn HostDialer>,
        contracts: Arc<dyn ContractSource>,
        config: ClientConfig,
    ) -> Client {
        let config = Arc::new(config);
        let memory = Arc::new(MemoryManager::new(config.memory_budget));
        let pool = WorkerPool::new(dialer, contracts, Arc::clone(&config));
        info!("client started with {} worker(s)", pool.num_workers());
        Client {
            pool,
            memory,
            config,
            cancel: CancelSource::new(),
        }
    }

    /// Opens a link with the configured default price preference.
    pub async fn open(&self, link: Link) -> Result<DataSource, Error> {
        self.open_with_price(link, self.config.price_per_ms).await
    }

    /// Opens a link with an explicit latency/price trade-off.
    pub async fn open_with_price(
        &self,
        link: Link,
        price_per_ms: u64,
    ) -> Result<DataSource, Error> {
        DataSource::open(
            Arc::clone(&self.pool),
            Arc::clone(&self.memory),
            Arc::clone(&self.config),
            &self.cancel,
            link,
            price_per_ms,
        )
        .await
    }

    /// Re-synchronizes workers with the contract set.
    pub fn update_workers(&self) {
        self.pool.update();
    }

    /// Worker pool introspection.
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cancels every open data source, fails queued memory requests, and
    /// kills every worker.
    pub fn shutdown(&self) {
        info!("client shutting down");
        self.cancel.cancel();
        self.memory.shutdown();
        self.pool.shutdown();
    }
}
