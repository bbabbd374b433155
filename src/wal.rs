//! A transactional write-ahead log.
//!
//! The log records intents before they touch their target files: a
//! transaction is `begin`-logged (and fsynced) with its full update list,
//! the caller applies the updates to the target files, and finally the
//! transaction is marked applied. A crash between those steps leaves the
//! transaction in the log; `open` returns every unapplied transaction so the
//! caller can replay it before trusting the target files.
//!
//! Records are length-prefixed and CRC32-framed. A record that fails its
//! checksum, or is cut short by a crash mid-append, terminates recovery at
//! the last intact record.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const WAL_MAGIC: [u8; 8] = *b"strtswal";
const WAL_VERSION: u64 = 1;
const WAL_HEADER_SIZE: u64 = 16;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io: {0}")]
    Io(#[from] io::Error),
    #[error("wal encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("wal header does not match this log format")]
    InvalidHeader,
}

/// A single deferred file mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Update {
    /// Write `data` into the file at `path`, starting at `offset`.
    WriteAt {
        path: PathBuf,
        offset: u64,
        data: Vec<u8>,
    },
    /// Truncate (or extend) the file at `path` to exactly `size` bytes.
    TruncateTo { path: PathBuf, size: u64 },
}

#[derive(Serialize, Deserialize)]
enum Record {
    Begin { id: u64, updates: Vec<Update> },
    Applied { id: u64 },
}

struct WalInner {
    path: PathBuf,
    file: Mutex<File>,
    next_id: AtomicU64,
}

/// Handle to an open write-ahead log.
#[derive(Clone)]
pub struct Wal {
    inner: Arc<WalInner>,
}

/// A logged transaction. Durable once obtained from [`Wal::begin`]; call
/// [`Transaction::signal_updates_applied`] after its updates have reached
/// their target files.
pub struct Transaction {
    inner: Arc<WalInner>,
    id: u64,
    updates: Vec<Update>,
}

impl Wal {
    /// Opens (or creates) the log at `path` and returns it along with every
    /// transaction that was logged but never marked applied, in log order.
    pub fn open(path: &Path) -> Result<(Wal, Vec<Transaction>), WalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&WAL_MAGIC)?;
            file.write_all(&WAL_VERSION.to_le_bytes())?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; WAL_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if header[..8] != WAL_MAGIC
                || u64::from_le_bytes(header[8..16].try_into().unwrap()) != WAL_VERSION
            {
                return Err(WalError::InvalidHeader);
            }
        }

        let (pending, max_id, good_end) = scan_records(&mut file)?;

        // Anything past the last intact record is a torn append; drop it so
        // future appends start from a clean boundary.
        file.set_len(good_end)?;
        file.seek(SeekFrom::End(0))?;

        let inner = Arc::new(WalInner {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            next_id: AtomicU64::new(max_id + 1),
        });

        let recovered: Vec<Transaction> = pending
            .into_iter()
            .map(|(id, updates)| Transaction {
                inner: Arc::clone(&inner),
                id,
                updates,
            })
            .collect();
        if recovered.is_empty() {
            // Nothing outstanding: compact the log down to its header.
            let mut f = inner.file.lock().unwrap();
            f.set_len(WAL_HEADER_SIZE)?;
            f.seek(SeekFrom::End(0))?;
            f.sync_all()?;
        } else {
            info!(
                "wal {} recovered {} unapplied transaction(s)",
                path.display(),
                recovered.len()
            );
        }
        Ok((Wal { inner }, recovered))
    }

    /// Logs a transaction. When this returns, the intent is durable.
    pub fn begin(&self, updates: Vec<Update>) -> Result<Transaction, WalError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.append(&Record::Begin {
            id,
            updates: updates.clone(),
        })?;
        debug!("wal transaction {} begun with {} update(s)", id, updates.len());
        Ok(Transaction {
            inner: Arc::clone(&self.inner),
            id,
            updates,
        })
    }
}

impl WalInner {
    fn append(&self, record: &Record) -> Result<(), WalError> {
        let payload = serde_json::to_vec(record)?;
        let crc = crc32fast::hash(&payload);
        let mut file = self.file.lock().unwrap();
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    /// Marks the transaction applied. Until this is called the transaction
    /// will be handed back by the next `open`.
    pub fn signal_updates_applied(self) -> Result<(), WalError> {
        self.inner.append(&Record::Applied { id: self.id })?;
        debug!("wal transaction {} applied", self.id);
        Ok(())
    }
}

/// Applies updates to their target files, syncing each touched file.
pub fn apply_updates(updates: &[Update]) -> Result<(), WalError> {
    for update in updates {
        match update {
            Update::WriteAt { path, offset, data } => {
                let mut file = OpenOptions::new().write(true).create(true).open(path)?;
                file.seek(SeekFrom::Start(*offset))?;
                file.write_all(data)?;
                file.sync_all()?;
            }
            Update::TruncateTo { path, size } => {
                let file = OpenOptions::new().write(true).create(true).open(path)?;
                file.set_len(*size)?;
                file.sync_all()?;
            }
        }
    }
    Ok(())
}

/// Reads records from the header onward. Returns the unapplied transactions
/// in log order, the highest transaction id seen, and the offset of the end
/// of the last intact record.
fn scan_records(file: &mut File) -> Result<(Vec<(u64, Vec<Update>)>, u64, u64), WalError> {
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;

    let mut pending: Vec<(u64, Vec<Update>)> = Vec::new();
    let mut max_id = 0u64;
    let mut pos = WAL_HEADER_SIZE;
    loop {
        if pos + 8 > len {
            break;
        }
        let mut frame = [0u8; 8];
        file.read_exact(&mut frame)?;
        let payload_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as u64;
        let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        if pos + 8 + payload_len > len {
            warn!("wal record at offset {pos} truncated, ending recovery");
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            warn!("wal record at offset {pos} failed checksum, ending recovery");
            break;
        }
        match serde_json::from_slice::<Record>(&payload) {
            Ok(Record::Begin { id, updates }) => {
                max_id = max_id.max(id);
                pending.push((id, updates));
            }
            Ok(Record::Applied { id }) => {
                max_id = max_id.max(id);
                pending.retain(|(pid, _)| *pid != id);
            }
            Err(err) => {
                warn!("wal record at offset {pos} undecodable ({err}), ending recovery");
                break;
            }
        }
        pos += 8 + payload_len;
    }
    Ok((pending, max_id, pos))
}
