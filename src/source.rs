//! The stream data source: link in, bytes out.
//!
//! Opening a source resolves the link's base sector through a one-root
//! passthrough download, parses the layout, metadata, and fanout out of it,
//! and builds one chunk worker set per fanout chunk *eagerly*: their
//! existence probes are already in flight while the consumer is still
//! seeking, cutting the probe latency out of the first read.

use crate::cancel::CancelSource;
use crate::config::ClientConfig;
use crate::download::DownloadError;
use crate::erasure::{ErasureCoder, Passthrough, RsSubCode};
use crate::error::Error;
use crate::hash::SECTOR_SIZE;
use crate::layout::{self, CipherType, Layout, LayoutError, Metadata};
use crate::link::Link;
use crate::memory::MemoryManager;
use crate::pcws::ChunkWorkerSet;
use crate::pool::WorkerPool;
use log::{debug, info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A readable view of one file, resolved from its link.
pub struct DataSource {
    link: Link,
    layout: Layout,
    metadata: Metadata,
    first_chunk: Vec<u8>,
    chunk_fetchers: Vec<Arc<ChunkWorkerSet>>,
    price_per_ms: u64,
    cancel: CancelSource,
    closed: AtomicBool,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource").finish_non_exhaustive()
    }
}

impl DataSource {
    /// Resolves `link` into a data source. Does not return until the base
    /// sector and all metadata have been retrieved and every fanout chunk
    /// has its worker set probing.
    pub(crate) async fn open(
        pool: Arc<WorkerPool>,
        memory: Arc<MemoryManager>,
        config: Arc<ClientConfig>,
        parent: &CancelSource,
        link: Link,
        price_per_ms: u64,
    ) -> Result<DataSource, Error> {
        // Validate the link before generating any network traffic.
        let (offset, fetch_size) = link.offset_and_fetch_size()?;

        let cancel = parent.child();
        let token = cancel.token();

        // The base sector is a single unencoded root with no encryption at
        // the coding layer.
        let base_set = ChunkWorkerSet::new(
            Arc::clone(&pool),
            Arc::clone(&memory),
            Arc::clone(&config),
            vec![link.merkle_root()],
            Arc::new(Passthrough),
            CipherType::Plain,
            0,
            token.clone(),
        );
        trace!("link {}: fetching base sector range [{offset}, +{fetch_size})", link);
        let response = base_set
            .download(token.clone(), price_per_ms, offset, fetch_size)
            .await?;
        let base = response
            .await
            .map_err(|_| DownloadError::Cancelled)?
            .map_err(Error::Download)?;

        let parsed = layout::parse_base_sector(&base)?;
        // Key management lives with the embedder; this core only streams
        // plaintext content.
        if parsed.layout.cipher_type != CipherType::Plain {
            return Err(Error::Layout(LayoutError::UnsupportedCipher(
                parsed.layout.cipher_type.as_u8(),
            )));
        }

        let chunks = layout::decode_fanout(&parsed.layout, &parsed.fanout)?;
        let mut chunk_fetchers = Vec::with_capacity(chunks.len());
        for (index, roots) in chunks.into_iter().enumerate() {
            let coder = fanout_coder(&parsed.layout)?;
            chunk_fetchers.push(ChunkWorkerSet::new(
                Arc::clone(&pool),
                Arc::clone(&memory),
                Arc::clone(&config),
                roots,
                coder,
                parsed.layout.cipher_type,
                index as u64 + 1,
                token.clone(),
            ));
        }
        info!(
            "opened data source for {}: {} byte(s), {} fanout chunk(s)",
            link,
            parsed.layout.filesize,
            chunk_fetchers.len()
        );

        Ok(DataSource {
            link,
            layout: parsed.layout,
            metadata: parsed.metadata,
            first_chunk: parsed.first_chunk,
            chunk_fetchers,
            price_per_ms,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn filesize(&self) -> u64 {
        self.layout.filesize
    }

    /// Reads into `buf` starting at file offset `offset`, serving from the
    /// base sector's leading bytes first and then from fanout chunks in
    /// order. Returns the number of bytes read; short only at end of file.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Download(DownloadError::Cancelled));
        }
        let token = self.cancel.token();
        let mut n = 0usize;
        let mut off = offset;

        // Leading bytes live in the base sector.
        let first_len = self.first_chunk.len() as u64;
        if off < first_len {
            let from = off as usize;
            let take = ((first_len - off) as usize).min(buf.len());
            buf[..take].copy_from_slice(&self.first_chunk[from..from + take]);
            n += take;
            off += take as u64;
        }

        // Everything else is striped across the fanout chunks.
        let chunk_size = self.layout.fanout_data_pieces as u64 * SECTOR_SIZE;
        let mut fanout_off = off.saturating_sub(first_len);
        while n < buf.len() && fanout_off < self.layout.filesize {
            if self.chunk_fetchers.is_empty() || chunk_size == 0 {
                break;
            }
            let chunk_index = (fanout_off / chunk_size) as usize;
            if chunk_index >= self.chunk_fetchers.len() {
                break;
            }
            let offset_in_chunk = fanout_off % chunk_size;
            let remaining_in_chunk = chunk_size - offset_in_chunk;
            let remaining_in_file = self.layout.filesize - fanout_off;
            let download_size = (remaining_in_chunk)
                .min((buf.len() - n) as u64)
                .min(remaining_in_file);

            trace!(
                "read_at: chunk {} range [{}, +{})",
                chunk_index,
                offset_in_chunk,
                download_size
            );
            let response = Arc::clone(&self.chunk_fetchers[chunk_index])
                .download(token.clone(), self.price_per_ms, offset_in_chunk, download_size)
                .await?;
            let data = response
                .await
                .map_err(|_| DownloadError::Cancelled)?
                .map_err(Error::Download)?;

            buf[n..n + data.len()].copy_from_slice(&data);
            n += data.len();
            fanout_off += data.len() as u64;
        }
        Ok(n)
    }

    /// Cancels every in-flight and future download of this source.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing data source for {}", self.link);
        self.cancel.cancel();
    }
}

fn fanout_coder(layout: &Layout) -> Result<Arc<dyn ErasureCoder>, Error> {
    let data = layout.fanout_data_pieces;
    let parity = layout.fanout_parity_pieces;
    let invalid = || {
        Error::Layout(LayoutError::InvalidErasureConfig {
            data,
            parity,
        })
    };
    match (data, parity) {
        (0, _) => Err(invalid()),
        (1, 0) => Ok(Arc::new(Passthrough)),
        _ if parity == 0 => Err(invalid()),
        _ => RsSubCode::new(data as usize, parity as usize)
            .map(|coder| Arc::new(coder) as Arc<dyn ErasureCoder>)
            .map_err(|_| invalid()),
    }
}
