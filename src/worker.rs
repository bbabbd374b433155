//! Per-host workers.
//!
//! A worker owns all interaction with one remote host. Each job kind has its
//! own FIFO queue; the worker's loop drains them one job at a time per kind,
//! batching existence probes, verifying every sector read against its Merkle
//! root, and recording job durations into the queue's distribution tracker.
//! Repeated failures put a queue on cooldown; the cooldown ends by time, not
//! by retry.

use crate::cancel::{CancelSource, CancelToken};
use crate::config::ClientConfig;
use crate::distribution::{DistributionTracker, JobTime, ResolveTime};
use crate::hash::{Hash, SEGMENT_SIZE};
use crate::merkle;
use crate::transport::{
    HostPublicKey, HostRequest, HostResponse, HostTransport, RegistryEntry, RegistryKey,
    TransportError,
};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Number of existence probes folded into a single host request. Empirical:
/// more than this stops fitting the host's reply in one packet.
pub const HAS_SECTOR_BATCH_SIZE: usize = 13;

/// Failure of a single job, delivered on the job's response channel.
#[derive(Clone, Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The host's range proof did not verify against the requested root.
    #[error("sector range proof mismatch")]
    ProofMismatch,

    /// The job never ran: {0}.
    #[error("job discarded: {0}")]
    Discarded(&'static str),

    /// The worker was removed from the pool before the job ran.
    #[error("worker killed")]
    WorkerKilled,
}

/// Failure to enqueue a job.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is on cooldown")]
    OnCooldown,
    #[error("estimated completion exceeds the caller's maximum")]
    EstimateAboveMax,
    #[error("job queue has been killed")]
    Killed,
}

/// Existence probe: which of these roots does the host hold?
pub struct HasSectorJob {
    pub roots: Vec<Hash>,
    pub response_tx: mpsc::Sender<HasSectorResponse>,
    pub cancel: CancelToken,
}

pub struct HasSectorResponse {
    pub worker: HostPublicKey,
    pub result: Result<Vec<bool>, JobError>, // one bool per requested root
    pub job_time: Duration,
}

/// Ranged, authenticated sector read.
pub struct ReadSectorJob {
    pub root: Hash,
    pub offset: u64,
    pub length: u64,
    pub response_tx: mpsc::Sender<ReadSectorResponse>,
    pub cancel: CancelToken,
}

pub struct ReadSectorResponse {
    pub worker: HostPublicKey,
    pub root: Hash, // echoed so the receiver can locate the piece index
    pub result: Result<Vec<u8>, JobError>,
    pub job_time: Duration,
}

/// Registry entry lookup.
pub struct ReadRegistryJob {
    pub key: RegistryKey,
    pub response_tx: mpsc::Sender<ReadRegistryResponse>,
    pub cancel: CancelToken,
}

pub struct ReadRegistryResponse {
    pub worker: HostPublicKey,
    pub result: Result<Option<RegistryEntry>, JobError>,
    pub job_time: Duration,
}

/// Behavior every queued job shares: cancellation checks and error delivery
/// for jobs that never execute.
pub(crate) trait WorkerJob: Send + 'static {
    fn is_cancelled(&self) -> bool;
    fn discard(self, worker: HostPublicKey, err: JobError);
}

impl WorkerJob for HasSectorJob {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
    fn discard(self, worker: HostPublicKey, err: JobError) {
        let _ = self.response_tx.try_send(HasSectorResponse {
            worker,
            result: Err(err),
            job_time: Duration::ZERO,
        });
    }
}

impl WorkerJob for ReadSectorJob {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
    fn discard(self, worker: HostPublicKey, err: JobError) {
        let _ = self.response_tx.try_send(ReadSectorResponse {
            worker,
            root: self.root,
            result: Err(err),
            job_time: Duration::ZERO,
        });
    }
}

impl WorkerJob for ReadRegistryJob {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
    fn discard(self, worker: HostPublicKey, err: JobError) {
        let _ = self.response_tx.try_send(ReadRegistryResponse {
            worker,
            result: Err(err),
            job_time: Duration::ZERO,
        });
    }
}

struct QueueState<J> {
    jobs: VecDeque<J>,
    killed: bool,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// One FIFO of pending jobs for one (worker, kind) pair, with its own
/// latency distribution and failure cooldown.
pub(crate) struct JobQueue<J> {
    kind: &'static str,
    state: Mutex<QueueState<J>>,
    tracker: Mutex<DistributionTracker>,
    wake: Arc<Notify>,
    cooldown_base: Duration,
    cooldown_max_exponent: u32,
}

impl<J: WorkerJob> JobQueue<J> {
    fn new(kind: &'static str, wake: Arc<Notify>, config: &ClientConfig) -> Self {
        JobQueue {
            kind,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                killed: false,
                consecutive_failures: 0,
                cooldown_until: None,
            }),
            tracker: Mutex::new(DistributionTracker::new()),
            wake,
            cooldown_base: config.cooldown_base(),
            cooldown_max_exponent: config.cooldown_max_exponent,
        }
    }

    pub(crate) fn add(&self, job: J) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.killed {
                return Err(QueueError::Killed);
            }
            if cooling(&state) {
                return Err(QueueError::OnCooldown);
            }
            state.jobs.push_back(job);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Adds a job and returns the distribution estimate anchored to now, so
    /// the caller can later ask when the job should resolve. Rejects the job
    /// outright if even the most pessimistic percentile exceeds
    /// `max_estimate`.
    pub(crate) fn add_with_estimate(
        &self,
        job: J,
        max_estimate: Duration,
    ) -> Result<ResolveTime, QueueError> {
        let estimate = self.job_time();
        if estimate.max() > max_estimate {
            return Err(QueueError::EstimateAboveMax);
        }
        let start = Instant::now();
        self.add(job)?;
        Ok(estimate.resolve_from(start))
    }

    pub(crate) fn job_time(&self) -> JobTime {
        self.tracker.lock().unwrap().job_time()
    }

    pub(crate) fn on_cooldown(&self) -> bool {
        cooling(&self.state.lock().unwrap())
    }

    fn next(&self, worker: HostPublicKey) -> Option<J> {
        let mut state = self.state.lock().unwrap();
        while let Some(job) = state.jobs.pop_front() {
            if job.is_cancelled() {
                drop(state);
                job.discard(worker, JobError::Discarded("cancelled while queued"));
                state = self.state.lock().unwrap();
                continue;
            }
            return Some(job);
        }
        None
    }

    fn next_batch(&self, worker: HostPublicKey, max: usize) -> Vec<J> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.next(worker) {
                Some(job) => batch.push(job),
                None => break,
            }
        }
        batch
    }

    fn record_success(&self, job_time: Duration) {
        self.tracker.lock().unwrap().add_sample(job_time);
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.cooldown_until = None;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        let exponent = (state.consecutive_failures - 1).min(self.cooldown_max_exponent);
        let cooldown = self.cooldown_base * 2u32.pow(exponent);
        state.cooldown_until = Some(Instant::now() + cooldown);
        debug!(
            "queue {}: {} consecutive failure(s), cooling down {:?}",
            self.kind, state.consecutive_failures, cooldown
        );
    }

    fn kill(&self) -> Vec<J> {
        let mut state = self.state.lock().unwrap();
        state.killed = true;
        state.jobs.drain(..).collect()
    }

    fn status(&self) -> QueueStatus {
        let state = self.state.lock().unwrap();
        QueueStatus {
            jobs_queued: state.jobs.len(),
            on_cooldown: cooling(&state),
            consecutive_failures: state.consecutive_failures,
        }
    }
}

fn cooling<J>(state: &QueueState<J>) -> bool {
    state
        .cooldown_until
        .map_or(false, |until| until > Instant::now())
}

/// Introspection snapshot of one job queue.
#[derive(Clone, Debug)]
pub struct QueueStatus {
    pub jobs_queued: usize,
    pub on_cooldown: bool,
    pub consecutive_failures: u32,
}

/// Introspection snapshot of one worker.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub host: HostPublicKey,
    pub has_sector_queue: QueueStatus,
    pub read_queue: QueueStatus,
    pub registry_queue: QueueStatus,
}

/// A worker serializes all jobs against a single host.
pub struct Worker {
    host_key: HostPublicKey,
    price_per_byte: u64,
    transport: Arc<dyn HostTransport>,
    wake: Arc<Notify>,
    kill: CancelSource,

    pub(crate) has_sector_queue: JobQueue<HasSectorJob>,
    pub(crate) read_queue: JobQueue<ReadSectorJob>,
    pub(crate) registry_queue: JobQueue<ReadRegistryJob>,
}

impl Worker {
    pub(crate) fn new(
        host_key: HostPublicKey,
        price_per_byte: u64,
        transport: Arc<dyn HostTransport>,
        config: &ClientConfig,
    ) -> Arc<Worker> {
        let wake = Arc::new(Notify::new());
        Arc::new(Worker {
            host_key,
            price_per_byte,
            transport,
            wake: Arc::clone(&wake),
            kill: CancelSource::new(),
            has_sector_queue: JobQueue::new("has_sector", Arc::clone(&wake), config),
            read_queue: JobQueue::new("read_sector", Arc::clone(&wake), config),
            registry_queue: JobQueue::new("read_registry", wake, config),
        })
    }

    pub fn host_key(&self) -> HostPublicKey {
        self.host_key
    }

    /// Expected cost of a ranged read, in base currency units. Feeds the
    /// orchestrator's price penalty.
    pub fn expected_read_cost(&self, length: u64) -> u64 {
        length.saturating_mul(self.price_per_byte)
    }

    /// Current percentile estimates for ranged reads on this host.
    pub fn read_estimate(&self) -> JobTime {
        self.read_queue.job_time()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            host: self.host_key,
            has_sector_queue: self.has_sector_queue.status(),
            read_queue: self.read_queue.status(),
            registry_queue: self.registry_queue.status(),
        }
    }

    /// Stops the worker's loop and drains every queue with a
    /// `WorkerKilled` response.
    pub(crate) fn kill(&self) {
        self.kill.cancel();
        for job in self.has_sector_queue.kill() {
            job.discard(self.host_key, JobError::WorkerKilled);
        }
        for job in self.read_queue.kill() {
            job.discard(self.host_key, JobError::WorkerKilled);
        }
        for job in self.registry_queue.kill() {
            job.discard(self.host_key, JobError::WorkerKilled);
        }
    }

    /// The worker's main loop: drain queues, one job (or probe batch) at a
    /// time, until killed.
    pub(crate) async fn run(self: Arc<Self>) {
        let killed = self.kill.token();
        info!("worker {} starting", self.host_key);
        loop {
            if killed.is_cancelled() {
                break;
            }

            let probes = self
                .has_sector_queue
                .next_batch(self.host_key, HAS_SECTOR_BATCH_SIZE);
            if !probes.is_empty() {
                self.execute_has_sector_batch(probes).await;
                continue;
            }
            if let Some(job) = self.read_queue.next(self.host_key) {
                self.execute_read(job).await;
                continue;
            }
            if let Some(job) = self.registry_queue.next(self.host_key) {
                self.execute_registry(job).await;
                continue;
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = killed.cancelled() => break,
            }
        }
        info!("worker {} stopped", self.host_key);
    }

    /// Runs one batch of probes as a single host request and unslices the
    /// reply positionally, so batching never changes per-job semantics.
    async fn execute_has_sector_batch(&self, jobs: Vec<HasSectorJob>) {
        let total: usize = jobs.iter().map(|j| j.roots.len()).sum();
        let mut roots = Vec::with_capacity(total);
        for job in &jobs {
            roots.extend_from_slice(&job.roots);
        }
        trace!(
            "worker {}: probing {} root(s) across {} job(s)",
            self.host_key,
            total,
            jobs.len()
        );

        let start = Instant::now();
        let outcome = self
            .transport
            .round_trip(HostRequest::HasSector { roots })
            .await;
        let job_time = start.elapsed();

        let present = match outcome {
            Ok(HostResponse::HasSector { present }) if present.len() == total => present,
            Ok(_) => {
                warn!("worker {}: malformed probe reply", self.host_key);
                self.has_sector_queue.record_failure();
                for job in jobs {
                    job.discard(self.host_key, TransportError::UnexpectedResponse.into());
                }
                return;
            }
            Err(err) => {
                debug!("worker {}: probe failed: {}", self.host_key, err);
                self.has_sector_queue.record_failure();
                for job in jobs {
                    job.discard(self.host_key, err.clone().into());
                }
                return;
            }
        };

        self.has_sector_queue.record_success(job_time);
        let mut cursor = 0;
        for job in jobs {
            let slice = present[cursor..cursor + job.roots.len()].to_vec();
            cursor += job.roots.len();
            self.send_response(
                &job.response_tx,
                HasSectorResponse {
                    worker: self.host_key,
                    result: Ok(slice),
                    job_time,
                },
            );
        }
    }

    async fn execute_read(&self, job: ReadSectorJob) {
        let start = Instant::now();
        let result = self.fetch_and_verify(&job).await;
        let job_time = start.elapsed();
        match &result {
            Ok(data) => {
                trace!(
                    "worker {}: read {} bytes of {:?} in {:?}",
                    self.host_key,
                    data.len(),
                    job.root,
                    job_time
                );
                self.read_queue.record_success(job_time);
            }
            Err(err) => {
                debug!(
                    "worker {}: read of {:?} failed: {}",
                    self.host_key, job.root, err
                );
                self.read_queue.record_failure();
            }
        }
        self.send_response(
            &job.response_tx,
            ReadSectorResponse {
                worker: self.host_key,
                root: job.root,
                result,
                job_time,
            },
        );
    }

    async fn fetch_and_verify(&self, job: &ReadSectorJob) -> Result<Vec<u8>, JobError> {
        if job.offset % SEGMENT_SIZE != 0 || job.length % SEGMENT_SIZE != 0 || job.length == 0 {
            return Err(JobError::Discarded("read range not segment aligned"));
        }
        let response = self
            .transport
            .round_trip(HostRequest::ReadSector {
                root: job.root,
                offset: job.offset,
                length: job.length,
            })
            .await?;
        let (data, proof) = match response {
            HostResponse::ReadSector { data, proof } => (data, proof),
            _ => return Err(TransportError::UnexpectedResponse.into()),
        };
        if data.len() as u64 != job.length {
            return Err(TransportError::ShortRead {
                expected: job.length,
                got: data.len() as u64,
            }
            .into());
        }

        // Authenticate before anything downstream touches the bytes.
        let proof_start = job.offset / SEGMENT_SIZE;
        let proof_end = (job.offset + job.length) / SEGMENT_SIZE;
        merkle::verify_range_proof(&data, proof_start, proof_end, &proof, &job.root)
            .map_err(|_| JobError::ProofMismatch)?;
        Ok(data)
    }

    async fn execute_registry(&self, job: ReadRegistryJob) {
        let start = Instant::now();
        let outcome = self
            .transport
            .round_trip(HostRequest::ReadRegistry { key: job.key })
            .await;
        let job_time = start.elapsed();
        let result = match outcome {
            Ok(HostResponse::ReadRegistry { entry }) => {
                self.registry_queue.record_success(job_time);
                Ok(entry)
            }
            Ok(_) => {
                self.registry_queue.record_failure();
                Err(TransportError::UnexpectedResponse.into())
            }
            Err(err) => {
                self.registry_queue.record_failure();
                Err(err.into())
            }
        };
        self.send_response(
            &job.response_tx,
            ReadRegistryResponse {
                worker: self.host_key,
                result,
                job_time,
            },
        );
    }

    // Responses must never block the worker loop. The channels are buffered
    // generously; a full one means the consumer is gone or wedged, and the
    // chunk's cancellation will clean up.
    fn send_response<T>(&self, tx: &mpsc::Sender<T>, response: T) {
        match tx.try_send(response) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "worker {}: dropping response, consumer not keeping up",
                    self.host_key
                );
            }
        }
    }
}
