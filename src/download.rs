//! The chunk download orchestrator.
//!
//! One `ChunkDownload` exists per in-flight chunk read. It pulls resolved
//! workers out of the chunk's worker set, ranks them, launches ranged reads
//! against the cheapest acceptable candidates, and watches the outstanding
//! jobs: when a launched set falls behind its own estimates the orchestrator
//! launches an overdrive worker, trading bandwidth for latency. As soon as
//! `data_pieces` pieces are in, the chunk is erasure-decoded and the caller's
//! byte range is delivered. A chunk emits exactly one terminal response on
//! its channel, no matter how it ends.

use crate::cancel::CancelToken;
use crate::erasure::{ErasureCoder, ErasureError};
use crate::hash::SECTOR_SIZE;
use crate::memory::Priority;
use crate::pcws::ChunkWorkerSet;
use crate::transport::HostPublicKey;
use crate::worker::{ReadSectorJob, ReadSectorResponse};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// Slack added to the latest expected completion before re-checking whether
// overdrive is needed.
const OVERDRIVE_SLACK: Duration = Duration::from_millis(50);

// Fallback poll interval when workers exist but none can be launched right
// now, and when a late unresolved worker is the only prospect.
const LAUNCH_RETRY: Duration = Duration::from_millis(50);

/// Terminal failure of a chunk download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Not enough workers remain to ever assemble `data_pieces` pieces.
    #[error("not enough workers to complete the download")]
    InsufficientWorkers,

    /// Too many pieces failed; decoding can no longer succeed.
    #[error("not enough pieces to complete the download")]
    InsufficientPieces,

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,

    /// The client is shutting down.
    #[error("client shutting down")]
    ShuttingDown,

    /// The requested range lies outside the chunk.
    #[error("requested range is outside the chunk")]
    InvalidRange,

    /// The chunk's cipher carries per-block overhead, so only whole-chunk
    /// downloads can be authenticated.
    #[error("chunk has encryption overhead and must be downloaded whole")]
    EncryptionOverheadRequiresFullChunk,

    /// Erasure decoding failed despite enough pieces being reported in.
    #[error("chunk decode failed: {0}")]
    Decode(#[from] ErasureError),
}

/// What a chunk download delivers on its response channel.
pub type DownloadResult = Result<Vec<u8>, DownloadError>;

/// Ranking of worker candidates, best first. Unresolved workers are ranked
/// optimistically: they are assumed to land in the best role still open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum WorkerRank {
    /// Can fetch a piece no unfailed worker has launched for.
    UnlaunchedPiece,
    /// Can fetch a piece whose launched workers have all failed or gone
    /// late.
    LaunchedPiece,
    /// Can fetch a piece another in-time worker is already fetching.
    ActivePiece,
    /// This worker's own prior job is overdue.
    Late,
}

/// One worker's attempt (or standing offer) to fetch one piece.
///
/// `completed` and `failed` are mutually exclusive, and neither may be set
/// before `launched`.
struct PieceDownload {
    host: HostPublicKey,
    launched: bool,
    completed: bool,
    failed: bool,
    expected_completion: Option<crate::distribution::ResolveTime>,
}

impl PieceDownload {
    fn new(host: HostPublicKey) -> Self {
        PieceDownload {
            host,
            launched: false,
            completed: false,
            failed: false,
            expected_completion: None,
        }
    }

    // Whether the launched job has blown past its expected completion.
    fn late(&self, now: Instant) -> bool {
        match &self.expected_completion {
            Some(rt) => rt.expected() <= now,
            None => true,
        }
    }
}

enum BestWorker {
    /// Launch this worker for this piece now.
    Resolved {
        host: HostPublicKey,
        piece_index: usize,
    },
    /// The best candidate is still unresolved; wait for a resolution event
    /// or until `wait` elapses, then look again.
    Unresolved {
        wait: Duration,
        wake: oneshot::Receiver<()>,
    },
    /// Every launchable worker has been launched. The download can still
    /// finish from what is in flight, but nothing new can start.
    Exhausted,
}

enum LaunchOutcome {
    Launched,
    NoWorkers,
    Cancelled,
}

/// State machine for one chunk read. Owned by its collection task; never
/// shared.
struct ChunkDownload {
    chunk_offset: u64,
    chunk_length: u64,
    price_per_ms: u64,

    // Host-facing range, segment aligned.
    piece_offset: u64,
    piece_length: u64,

    // One slot per piece root; multiple workers may offer the same piece.
    available_pieces: Vec<Vec<PieceDownload>>,
    workers_considered: HashSet<HostPublicKey>,
    data_pieces: Vec<Option<Vec<u8>>>,

    workerset: Arc<ChunkWorkerSet>,
    response_tx: mpsc::Sender<ReadSectorResponse>,
    response_rx: mpsc::Receiver<ReadSectorResponse>,
    terminal: Option<oneshot::Sender<DownloadResult>>,
    cancel: CancelToken,
    memory_reserved: u64,
}

impl ChunkWorkerSet {
    /// Starts a download of `[offset, offset + length)` within this chunk.
    ///
    /// Returns once enough read jobs have been queued onto workers to
    /// complete the download; collection and overdrive continue on a
    /// background task. The receiver yields exactly one terminal result.
    ///
    /// `price_per_ms` expresses the caller's latency/price trade-off: a
    /// worker's expected job cost is converted into milliseconds at this
    /// rate and added to its expected duration, so expensive hosts are
    /// picked as though they were slower.
    pub async fn download(
        self: Arc<Self>,
        cancel: CancelToken,
        price_per_ms: u64,
        offset: u64,
        length: u64,
    ) -> Result<oneshot::Receiver<DownloadResult>, DownloadError> {
        let data_pieces = self.coder.data_pieces() as u64;
        let chunk_size = SECTOR_SIZE * data_pieces;
        if length == 0 || offset.checked_add(length).map_or(true, |end| end > chunk_size) {
            return Err(DownloadError::InvalidRange);
        }
        // Ciphers with per-block overhead authenticate whole pieces only.
        if self.cipher.overhead() != 0 && (offset != 0 || length != chunk_size) {
            return Err(DownloadError::EncryptionOverheadRequiresFullChunk);
        }

        let (piece_offset, piece_length) =
            piece_offset_and_length(self.coder.as_ref(), offset, length);

        // Admit the decode buffers before anything reaches a worker. The
        // margin covers the overdrive workers a struggling chunk tends to
        // launch.
        let reserve = (data_pieces + self.config.overdrive_margin) * piece_length;
        if !self.memory.request(reserve, Priority::High).await {
            return Err(DownloadError::ShuttingDown);
        }

        // Workers must never block sending a response, so the channel is
        // sized for every worker of every piece responding, overdrive
        // included.
        let buffer = self.piece_roots.len().max(1) * self.config.response_buffer_multiplier;
        let (response_tx, response_rx) = mpsc::channel(buffer);
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let mut download = ChunkDownload {
            chunk_offset: offset,
            chunk_length: length,
            price_per_ms,
            piece_offset,
            piece_length,
            available_pieces: (0..self.piece_roots.len()).map(|_| Vec::new()).collect(),
            workers_considered: HashSet::new(),
            data_pieces: vec![None; self.piece_roots.len()],
            workerset: Arc::clone(&self),
            response_tx,
            response_rx,
            terminal: Some(terminal_tx),
            cancel,
            memory_reserved: reserve,
        };
        trace!(
            "chunk {}: download [{}, {}) -> piece range [{}, {})",
            self.chunk_index,
            offset,
            offset + length,
            piece_offset,
            piece_offset + piece_length
        );

        // Launch the initial complement. Overdrive handles the rest.
        for _ in 0..data_pieces {
            match download.launch_worker().await {
                LaunchOutcome::Launched => {}
                LaunchOutcome::Cancelled => return Err(DownloadError::Cancelled),
                LaunchOutcome::NoWorkers => return Err(DownloadError::InsufficientWorkers),
            }
        }

        tokio::spawn(download.run());
        Ok(terminal_rx)
    }
}

impl ChunkDownload {
    /// The collection loop: integrate responses, finish or fail, and launch
    /// overdrive workers when the outstanding set falls behind.
    async fn run(mut self) {
        loop {
            self.integrate_resolved_workers();
            match self.finished() {
                Ok(true) => {
                    self.finalize();
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    self.terminate(Err(err));
                    return;
                }
            }

            let (mut delay, overdrive_now) = self.needs_overdrive();
            if overdrive_now {
                match self.launch_worker().await {
                    LaunchOutcome::Launched => continue,
                    LaunchOutcome::Cancelled => {
                        self.terminate(Err(DownloadError::Cancelled));
                        return;
                    }
                    // Nothing launchable right now; fall through to the
                    // select so in-flight responses can still finish the
                    // chunk.
                    LaunchOutcome::NoWorkers => delay = LAUNCH_RETRY,
                }
            }

            tokio::select! {
                response = self.response_rx.recv() => {
                    if let Some(response) = response {
                        self.handle_read_response(response);
                    }
                }
                _ = self.cancel.cancelled() => {
                    self.terminate(Err(DownloadError::Cancelled));
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Moves newly resolved workers from the worker set into the piece
    /// table. Idempotent per worker.
    fn integrate_resolved_workers(&mut self) {
        for worker in self.workerset.snapshot_resolved() {
            if !self.workers_considered.insert(worker.host) {
                continue;
            }
            for &piece_index in &worker.pieces {
                if piece_index < self.available_pieces.len() {
                    self.available_pieces[piece_index].push(PieceDownload::new(worker.host));
                }
            }
        }
    }

    /// Whether the download is complete, or can no longer complete.
    fn finished(&self) -> Result<bool, DownloadError> {
        let min_pieces = self.workerset.coder.data_pieces();
        let mut completed = 0usize;
        let mut hopeful = 0usize;
        for piece in &self.available_pieces {
            let mut piece_hopeful = false;
            for pd in piece {
                if pd.completed {
                    completed += 1;
                    piece_hopeful = true;
                    break;
                }
                if !pd.failed {
                    piece_hopeful = true;
                }
            }
            if piece_hopeful {
                hopeful += 1;
            }
        }
        if completed >= min_pieces {
            return Ok(true);
        }
        hopeful += self.workerset.unresolved_count();
        if hopeful < min_pieces {
            return Err(DownloadError::InsufficientPieces);
        }
        Ok(false)
    }

    /// Decides whether an extra worker should be launched now, and if not,
    /// when to check again.
    fn needs_overdrive(&self) -> (Duration, bool) {
        let min_pieces = self.workerset.coder.data_pieces();
        let now = Instant::now();

        let mut launched_without_fail = 0usize;
        let mut latest_return: Option<Instant> = None;
        for piece in &self.available_pieces {
            let mut piece_launched = false;
            for pd in piece {
                if pd.launched && !pd.failed {
                    piece_launched = true;
                    if !pd.completed {
                        if let Some(rt) = &pd.expected_completion {
                            let expected = rt.expected();
                            if latest_return.map_or(true, |latest| expected > latest) {
                                latest_return = Some(expected);
                            }
                        }
                    }
                }
            }
            if piece_launched {
                launched_without_fail += 1;
            }
        }

        // Fewer healthy launches than required pieces: replace the failures
        // immediately.
        if launched_without_fail < min_pieces {
            return (Duration::ZERO, true);
        }
        let latest = match latest_return {
            Some(latest) => latest,
            None => return (LAUNCH_RETRY, false),
        };
        let until_latest = latest.saturating_duration_since(now);
        // The slowest outstanding worker is overdue: overdrive now.
        if until_latest.is_zero() {
            return (Duration::ZERO, true);
        }
        // Everything is on schedule; look again shortly after the slowest
        // worker's deadline. Each overdrive launch pushes that deadline out,
        // so overdrive workers are launched one return-period apart.
        (until_latest + OVERDRIVE_SLACK, false)
    }

    /// Repeatedly picks the best worker until a read job is accepted or no
    /// candidates remain. Failed submissions mark the candidate failed so it
    /// is never picked twice.
    async fn launch_worker(&mut self) -> LaunchOutcome {
        loop {
            let (host, piece_index) = match self.find_best_worker() {
                Err(_) => return LaunchOutcome::NoWorkers,
                Ok(BestWorker::Exhausted) => return LaunchOutcome::NoWorkers,
                Ok(BestWorker::Resolved { host, piece_index }) => (host, piece_index),
                Ok(BestWorker::Unresolved { wait, wake }) => {
                    // A late probe gets a short poll instead of a zero-time
                    // spin; resolution events cut either wait short.
                    let wait = if wait.is_zero() { LAUNCH_RETRY } else { wait };
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = wake => {}
                        _ = self.cancel.cancelled() => return LaunchOutcome::Cancelled,
                    }
                    continue;
                }
            };

            let worker = match self.workerset.pool.worker(&host) {
                Some(worker) => worker,
                None => {
                    // Contract vanished between snapshot and launch.
                    self.mark_launch_failed(piece_index, &host);
                    continue;
                }
            };
            let job = ReadSectorJob {
                root: self.workerset.piece_roots[piece_index],
                offset: self.piece_offset,
                length: self.piece_length,
                response_tx: self.response_tx.clone(),
                cancel: self.cancel.clone(),
            };
            match worker.read_queue.add_with_estimate(job, Duration::MAX) {
                Ok(resolve_time) => {
                    trace!(
                        "chunk {}: launched worker {} for piece {}",
                        self.workerset.chunk_index,
                        host,
                        piece_index
                    );
                    for pd in &mut self.available_pieces[piece_index] {
                        if pd.host == host {
                            pd.launched = true;
                            pd.expected_completion = Some(resolve_time.clone());
                        }
                    }
                    return LaunchOutcome::Launched;
                }
                Err(err) => {
                    debug!(
                        "chunk {}: worker {} rejected read job: {}",
                        self.workerset.chunk_index, host, err
                    );
                    self.mark_launch_failed(piece_index, &host);
                }
            }
        }
    }

    fn mark_launch_failed(&mut self, piece_index: usize, host: &HostPublicKey) {
        for pd in &mut self.available_pieces[piece_index] {
            if pd.host == *host {
                pd.launched = true;
                pd.failed = true;
            }
        }
    }

    /// Selects the most promising launchable worker.
    ///
    /// Pure with respect to its input snapshot: two calls over identical
    /// piece tables and worker-set snapshots pick the same worker. Pieces
    /// that already completed are always skipped; candidates are compared
    /// first by rank, then by cost-adjusted duration.
    fn find_best_worker(&mut self) -> Result<BestWorker, DownloadError> {
        let min_pieces = self.workerset.coder.data_pieces();
        // The pessimistic assumption: going faster means paying every
        // worker of the chunk to go faster.
        let price_per_ms_per_worker = self
            .price_per_ms
            .saturating_mul(min_pieces as u64)
            .max(1);

        self.integrate_resolved_workers();
        let unresolved = self.workerset.snapshot_unresolved();

        // Best adjusted duration any unresolved worker could achieve, and
        // how long it is worth waiting to find out.
        let mut best_unresolved_duration = Duration::MAX;
        let mut best_unresolved_wait = Duration::ZERO;
        let mut best_worker_late = true;
        for (host, resolve_time) in &unresolved {
            let probe_remaining = resolve_time.remaining();
            let read_time = match self.adjusted_read_duration(host, price_per_ms_per_worker) {
                Some(read_time) => read_time,
                None => continue,
            };
            let adjusted = probe_remaining.saturating_add(read_time);
            let better_late = best_worker_late && !probe_remaining.is_zero();
            let better_duration = adjusted < best_unresolved_duration;
            if better_late || better_duration {
                best_unresolved_duration = adjusted;
            }
            if !probe_remaining.is_zero() && better_duration {
                best_unresolved_wait = probe_remaining;
            }
            if !probe_remaining.is_zero() {
                best_worker_late = false;
            }
        }

        // Walk the piece table once, collecting the aggregates that drive
        // both the abort checks and the optimistic rank of unresolved
        // workers.
        let now = Instant::now();
        let mut pieces_available_to_launch = 0usize;
        let mut unlaunched_workers_available = false;
        let mut unlaunched_pieces = false;
        let mut inactive_pieces = false;
        let mut late_workers: HashSet<HostPublicKey> = HashSet::new();
        for piece in &self.available_pieces {
            let mut unlaunched_worker = false;
            let mut launched_without_fail = false;
            let mut piece_unlaunched = true;
            let mut piece_has_late = false;
            let mut piece_has_active = false;
            for pd in piece {
                debug_assert!(
                    !(pd.completed && pd.failed) && (pd.launched || (!pd.completed && !pd.failed)),
                    "piece download state is incoherent"
                );
                if !pd.launched {
                    unlaunched_worker = true;
                    unlaunched_workers_available = true;
                }
                if pd.launched && !pd.failed {
                    piece_unlaunched = false;
                    launched_without_fail = true;
                }
                if pd.launched && (pd.failed || pd.late(now)) {
                    late_workers.insert(pd.host);
                    piece_has_late = true;
                } else if pd.launched {
                    piece_has_active = true;
                }
            }
            if launched_without_fail || unlaunched_worker {
                pieces_available_to_launch += 1;
            }
            if piece_unlaunched {
                unlaunched_pieces = true;
            }
            if piece_has_late && !piece_has_active {
                inactive_pieces = true;
            }
        }

        // Can the download still complete at all?
        let potential = pieces_available_to_launch + unresolved.len();
        if potential < min_pieces {
            return Err(DownloadError::InsufficientWorkers);
        }
        // Can anything new be launched?
        if !unlaunched_workers_available && unresolved.is_empty() {
            return Ok(BestWorker::Exhausted);
        }

        // Seed the competition with the unresolved workers, ranked
        // optimistically: they are assumed to resolve into the most
        // convenient role still open.
        let mut best_rank = WorkerRank::Late;
        let mut best_duration = Duration::MAX;
        let mut best_resolved: Option<(HostPublicKey, usize)> = None;
        let mut best_is_resolved = true;
        if !unresolved.is_empty() {
            best_rank = if unlaunched_pieces {
                WorkerRank::UnlaunchedPiece
            } else if inactive_pieces {
                WorkerRank::LaunchedPiece
            } else {
                WorkerRank::ActivePiece
            };
            best_duration = best_unresolved_duration;
            best_is_resolved = false;
        }

        // Now the resolved workers: only candidates at least as good as the
        // best seen so far survive.
        for (piece_index, piece) in self.available_pieces.iter().enumerate() {
            if piece.iter().any(|pd| pd.completed) {
                continue;
            }
            // A failed launch still marks the piece launched (its rank is
            // LaunchedPiece, not UnlaunchedPiece), but only an unfailed,
            // in-time worker makes it active.
            let piece_launched = piece.iter().any(|pd| pd.launched);
            let piece_active = piece
                .iter()
                .any(|pd| pd.launched && !pd.failed && !pd.late(now));
            if best_rank < WorkerRank::LaunchedPiece && piece_launched {
                continue;
            }
            if best_rank < WorkerRank::ActivePiece && piece_active {
                continue;
            }

            for pd in piece {
                if pd.launched {
                    continue;
                }
                let is_late = late_workers.contains(&pd.host);
                if best_rank < WorkerRank::Late && is_late {
                    continue;
                }
                let read_time =
                    match self.adjusted_read_duration(&pd.host, price_per_ms_per_worker) {
                        Some(read_time) => read_time,
                        None => continue,
                    };
                if best_duration < read_time {
                    continue;
                }

                best_rank = if is_late {
                    WorkerRank::Late
                } else if piece_active {
                    WorkerRank::ActivePiece
                } else if piece_launched {
                    WorkerRank::LaunchedPiece
                } else {
                    WorkerRank::UnlaunchedPiece
                };
                best_duration = read_time;
                best_resolved = Some((pd.host, piece_index));
                best_is_resolved = true;
            }
        }

        if !best_is_resolved {
            let wake = self.workerset.register_for_worker_update();
            let wait = if best_worker_late {
                Duration::ZERO
            } else {
                best_unresolved_wait
            };
            return Ok(BestWorker::Unresolved { wait, wake });
        }
        match best_resolved {
            Some((host, piece_index)) => Ok(BestWorker::Resolved { host, piece_index }),
            // Every surviving candidate lost on duration; treat as
            // exhausted and let in-flight work finish.
            None => Ok(BestWorker::Exhausted),
        }
    }

    /// A worker's expected read duration with the price penalty applied:
    /// `read_time + cost / (price_per_ms × data_pieces)`, saturating. `None`
    /// if the worker is gone or its read queue is cooling down.
    fn adjusted_read_duration(
        &self,
        host: &HostPublicKey,
        price_per_ms_per_worker: u64,
    ) -> Option<Duration> {
        let worker = self.workerset.pool.worker(host)?;
        if worker.read_queue.on_cooldown() {
            return None;
        }
        let read_time = worker.read_estimate().median();
        let cost = worker.expected_read_cost(self.piece_length);
        let penalty = Duration::from_millis(cost / price_per_ms_per_worker);
        Some(read_time.saturating_add(penalty))
    }

    /// Folds a worker's read response into the piece table.
    fn handle_read_response(&mut self, response: ReadSectorResponse) {
        let piece_index = match self
            .workerset
            .piece_roots
            .iter()
            .position(|root| *root == response.root)
        {
            Some(piece_index) => piece_index,
            None => {
                warn!(
                    "chunk {}: response for unknown root {:?}",
                    self.workerset.chunk_index, response.root
                );
                return;
            }
        };
        match response.result {
            Ok(data) => {
                trace!(
                    "chunk {}: piece {} completed by {}",
                    self.workerset.chunk_index,
                    piece_index,
                    response.worker
                );
                self.data_pieces[piece_index] = Some(data);
                for pd in &mut self.available_pieces[piece_index] {
                    if pd.host == response.worker {
                        pd.completed = true;
                    }
                }
            }
            Err(err) => {
                debug!(
                    "chunk {}: piece {} failed on {}: {}",
                    self.workerset.chunk_index, piece_index, response.worker, err
                );
                for pd in &mut self.available_pieces[piece_index] {
                    if pd.host == response.worker {
                        pd.failed = true;
                    }
                }
            }
        }
    }

    /// Decodes the completed pieces and delivers the caller's byte range.
    fn finalize(&mut self) {
        let coder = Arc::clone(&self.workerset.coder);
        let data_pieces = coder.data_pieces() as u64;

        let mut pieces: Vec<Option<Vec<u8>>> =
            self.data_pieces.iter_mut().map(Option::take).collect();
        // 1-of-N chunks enumerate a single root; pad out the parity slots.
        if pieces.len() < coder.num_pieces() {
            pieces.resize_with(coder.num_pieces(), || None);
        }
        let decoded = match coder.recover(&mut pieces) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.terminate(Err(DownloadError::Decode(err)));
                return;
            }
        };

        // The decoded buffer covers the chunk range
        // [piece_offset * k, (piece_offset + piece_length) * k); the
        // caller's range sits inside it.
        let window_start = self.piece_offset * data_pieces;
        let start = (self.chunk_offset - window_start) as usize;
        let end = start + self.chunk_length as usize;
        if end > decoded.len() {
            self.terminate(Err(DownloadError::Decode(ErasureError::PieceShape(
                format!("decoded window holds {} bytes, need {}", decoded.len(), end),
            ))));
            return;
        }
        self.terminate(Ok(decoded[start..end].to_vec()));
    }

    /// Sends the single terminal response and returns the reserved memory.
    /// Safe to call more than once; later calls are no-ops.
    fn terminate(&mut self, result: DownloadResult) {
        if let Some(terminal) = self.terminal.take() {
            match &result {
                Ok(data) => debug!(
                    "chunk {}: delivering {} byte(s)",
                    self.workerset.chunk_index,
                    data.len()
                ),
                Err(err) => debug!("chunk {}: failed: {}", self.workerset.chunk_index, err),
            }
            let _ = terminal.send(result);
        }
        if self.memory_reserved > 0 {
            self.workerset.memory.release(self.memory_reserved);
            self.memory_reserved = 0;
        }
    }
}

impl Drop for ChunkDownload {
    // The terminal response is guaranteed under every exit path, including
    // task teardown.
    fn drop(&mut self) {
        self.terminate(Err(DownloadError::Cancelled));
    }
}

/// Derives the segment-aligned host-facing range for a chunk-relative
/// request.
pub(crate) fn piece_offset_and_length(
    coder: &dyn ErasureCoder,
    offset: u64,
    length: u64,
) -> (u64, u64) {
    let data_pieces = coder.data_pieces() as u64;
    let segment = match coder.segment_size() {
        // A coder that cannot decode partial pieces forces whole-piece
        // reads.
        Some(segment) if segment > 0 => segment,
        _ => SECTOR_SIZE,
    };

    let piece_offset = offset / data_pieces / segment * segment;

    let chunk_segment = segment * data_pieces;
    let mut chunk_end = offset + length;
    let overflow = chunk_end % chunk_segment;
    if overflow != 0 {
        chunk_end += chunk_segment - overflow;
    }
    let piece_end = chunk_end / data_pieces;
    (piece_offset, piece_end - piece_offset)
}
