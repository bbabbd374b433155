//! Durable per-sector reference counting.
//!
//! Each host contract owns one counter file: a 16-byte header followed by one
//! little-endian `u16` per sector. The counter decides when a sector on a
//! host may be discarded, so it must survive crashes mid-mutation. All
//! mutations flow through an update session: the session accumulates WAL
//! updates and an in-memory override map, the updates commit as one WAL
//! transaction, and the override map is only dropped once the WAL has the
//! transaction recorded as applied.

use crate::wal::{self, Transaction, Update, Wal, WalError};
use log::{debug, info};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Magic bytes identifying a reference counter file.
pub const REFCOUNTER_MAGIC: [u8; 8] = *b"SiaRefCt";

/// Current version of the counter file format.
pub const REFCOUNTER_VERSION: u64 = 1;

/// Size of the header: magic plus version.
pub const REFCOUNTER_HEADER_SIZE: u64 = 16;

/// Recommended extension for counter files.
pub const REFCOUNTER_EXTENSION: &str = "refct";

#[derive(Debug, Error)]
pub enum RefCounterError {
    /// The sector index is outside the counter file.
    #[error("invalid sector number")]
    InvalidSectorNumber,

    /// The file carries a version this implementation does not understand.
    #[error("invalid reference counter version")]
    InvalidVersion,

    /// The file is too short for its header or its body has an odd length.
    #[error("reference counter file is corrupt")]
    Corrupt,

    /// An update was requested outside an update session.
    #[error("update requested without an open update session")]
    UpdateWithoutUpdateSession,

    /// An update was requested after the counter was marked deleted.
    #[error("update requested after delete")]
    UpdateAfterDelete,

    /// An update session is already open.
    #[error("update session already in progress")]
    UpdateInProgress,

    /// The caller expected a different number of sectors than the file holds.
    #[error("expected {expected} sectors, file holds {actual}")]
    SectorCountMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A crash-safe array of per-sector reference counts.
pub struct RefCounter {
    filepath: PathBuf,
    wal: Wal,
    num_sectors: u64,

    // Pending mutations of the open session. Reads consult this map before
    // falling back to the file, so a session observes its own writes.
    new_sector_counts: HashMap<u64, u16>,
    update_in_progress: bool,
    deleted: bool,
}

impl RefCounter {
    /// Creates a new counter file with `num_sectors` counters, each starting
    /// at one reference.
    pub fn create(path: &Path, num_sectors: u64, wal: Wal) -> Result<Self, RefCounterError> {
        let mut body = Vec::with_capacity((REFCOUNTER_HEADER_SIZE + 2 * num_sectors) as usize);
        body.extend_from_slice(&REFCOUNTER_MAGIC);
        body.extend_from_slice(&REFCOUNTER_VERSION.to_le_bytes());
        for _ in 0..num_sectors {
            body.extend_from_slice(&1u16.to_le_bytes());
        }
        std::fs::write(path, &body)?;
        File::open(path)?.sync_all()?;
        info!(
            "created reference counter {} with {} sector(s)",
            path.display(),
            num_sectors
        );
        Ok(RefCounter {
            filepath: path.to_path_buf(),
            wal,
            num_sectors,
            new_sector_counts: HashMap::new(),
            update_in_progress: false,
            deleted: false,
        })
    }

    /// Loads an existing counter file. The caller must have replayed any
    /// recovered WAL transactions first, otherwise the file may be behind
    /// committed state.
    pub fn load(path: &Path, wal: Wal) -> Result<Self, RefCounterError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            // A zero-length file is the remnant of an interrupted delete:
            // the truncate landed but the unlink did not.
            drop(file);
            std::fs::remove_file(path)?;
            return Err(RefCounterError::Io(io::Error::from(
                io::ErrorKind::NotFound,
            )));
        }
        if len < REFCOUNTER_HEADER_SIZE {
            return Err(RefCounterError::Corrupt);
        }
        let mut header = [0u8; REFCOUNTER_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if header[..8] != REFCOUNTER_MAGIC {
            return Err(RefCounterError::Corrupt);
        }
        if u64::from_le_bytes(header[8..16].try_into().unwrap()) != REFCOUNTER_VERSION {
            return Err(RefCounterError::InvalidVersion);
        }
        let body = len - REFCOUNTER_HEADER_SIZE;
        if body % 2 != 0 {
            return Err(RefCounterError::Corrupt);
        }
        Ok(RefCounter {
            filepath: path.to_path_buf(),
            wal,
            num_sectors: body / 2,
            new_sector_counts: HashMap::new(),
            update_in_progress: false,
            deleted: false,
        })
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    /// Opens an update session. If `expected_sectors` is given, the counter
    /// must currently hold exactly that many sectors.
    pub fn start_update(&mut self, expected_sectors: Option<u64>) -> Result<(), RefCounterError> {
        if self.deleted {
            return Err(RefCounterError::UpdateAfterDelete);
        }
        if self.update_in_progress {
            return Err(RefCounterError::UpdateInProgress);
        }
        if let Some(expected) = expected_sectors {
            if expected != self.num_sectors {
                return Err(RefCounterError::SectorCountMismatch {
                    expected,
                    actual: self.num_sectors,
                });
            }
        }
        self.update_in_progress = true;
        Ok(())
    }

    /// Returns the count for a sector: pending session value first, the file
    /// second.
    pub fn count(&self, sector: u64) -> Result<u16, RefCounterError> {
        if sector >= self.num_sectors {
            return Err(RefCounterError::InvalidSectorNumber);
        }
        if let Some(&count) = self.new_sector_counts.get(&sector) {
            return Ok(count);
        }
        self.read_count_from_file(sector)
    }

    /// Whether an increment would stay within `u16::MAX`.
    pub fn is_increment_valid(&self, sector: u64) -> Result<bool, RefCounterError> {
        Ok(self.count(sector)? < u16::MAX)
    }

    /// Whether a decrement would stay at or above zero.
    pub fn is_decrement_valid(&self, sector: u64) -> Result<bool, RefCounterError> {
        Ok(self.count(sector)? > 0)
    }

    /// Adds one reference to a sector. Overflow is the caller's
    /// responsibility; see [`RefCounter::is_increment_valid`].
    pub fn increment(&mut self, sector: u64) -> Result<Update, RefCounterError> {
        let count = self.session_count(sector)?.wrapping_add(1);
        self.stage_count(sector, count)
    }

    /// Removes one reference from a sector. Underflow is the caller's
    /// responsibility; see [`RefCounter::is_decrement_valid`].
    pub fn decrement(&mut self, sector: u64) -> Result<Update, RefCounterError> {
        let count = self.session_count(sector)?.wrapping_sub(1);
        self.stage_count(sector, count)
    }

    /// Grows the counter by one sector initialized to a single reference.
    pub fn append(&mut self) -> Result<Update, RefCounterError> {
        self.check_session()?;
        let sector = self.num_sectors;
        self.num_sectors += 1;
        self.new_sector_counts.insert(sector, 1);
        Ok(Update::WriteAt {
            path: self.filepath.clone(),
            offset: REFCOUNTER_HEADER_SIZE + 2 * sector,
            data: 1u16.to_le_bytes().to_vec(),
        })
    }

    /// Shrinks the counter by the last `n` sectors.
    pub fn drop_sectors(&mut self, n: u64) -> Result<Update, RefCounterError> {
        self.check_session()?;
        if n > self.num_sectors {
            return Err(RefCounterError::InvalidSectorNumber);
        }
        self.num_sectors -= n;
        for sector in self.num_sectors..self.num_sectors + n {
            self.new_sector_counts.remove(&sector);
        }
        Ok(Update::TruncateTo {
            path: self.filepath.clone(),
            size: REFCOUNTER_HEADER_SIZE + 2 * self.num_sectors,
        })
    }

    /// Atomically swaps the counts of two sectors.
    pub fn swap(&mut self, first: u64, second: u64) -> Result<Vec<Update>, RefCounterError> {
        let first_count = self.session_count(first)?;
        let second_count = self.session_count(second)?;
        let a = self.stage_count(first, second_count)?;
        let b = self.stage_count(second, first_count)?;
        Ok(vec![a, b])
    }

    /// Marks the counter for deletion. No further updates may be created in
    /// this or any future session. The file itself is removed once the
    /// session's transaction is applied.
    pub fn delete(&mut self) -> Result<Update, RefCounterError> {
        self.check_session()?;
        self.deleted = true;
        self.new_sector_counts.clear();
        self.num_sectors = 0;
        Ok(Update::TruncateTo {
            path: self.filepath.clone(),
            size: 0,
        })
    }

    /// Commits the collected updates as one WAL transaction and applies them
    /// to the file.
    pub fn create_and_apply_transaction(
        &mut self,
        updates: Vec<Update>,
    ) -> Result<(), RefCounterError> {
        if !self.update_in_progress {
            return Err(RefCounterError::UpdateWithoutUpdateSession);
        }
        let txn: Transaction = self.wal.begin(updates)?;
        wal::apply_updates(txn.updates())?;
        txn.signal_updates_applied()?;
        debug!("reference counter {} committed transaction", self.filepath.display());
        Ok(())
    }

    /// Closes the update session and drops the in-memory overrides; the file
    /// is now authoritative again.
    pub fn update_applied(&mut self) -> Result<(), RefCounterError> {
        if !self.update_in_progress {
            return Err(RefCounterError::UpdateWithoutUpdateSession);
        }
        self.new_sector_counts.clear();
        self.update_in_progress = false;
        if self.deleted {
            match std::fs::remove_file(&self.filepath) {
                Ok(()) => info!("reference counter {} deleted", self.filepath.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // Count as visible inside an open session, with session preconditions
    // checked.
    fn session_count(&mut self, sector: u64) -> Result<u16, RefCounterError> {
        self.check_session()?;
        if sector >= self.num_sectors {
            return Err(RefCounterError::InvalidSectorNumber);
        }
        match self.new_sector_counts.get(&sector) {
            Some(&count) => Ok(count),
            None => self.read_count_from_file(sector),
        }
    }

    fn stage_count(&mut self, sector: u64, count: u16) -> Result<Update, RefCounterError> {
        self.new_sector_counts.insert(sector, count);
        Ok(Update::WriteAt {
            path: self.filepath.clone(),
            offset: REFCOUNTER_HEADER_SIZE + 2 * sector,
            data: count.to_le_bytes().to_vec(),
        })
    }

    fn check_session(&self) -> Result<(), RefCounterError> {
        if self.deleted {
            return Err(RefCounterError::UpdateAfterDelete);
        }
        if !self.update_in_progress {
            return Err(RefCounterError::UpdateWithoutUpdateSession);
        }
        Ok(())
    }

    fn read_count_from_file(&self, sector: u64) -> Result<u16, RefCounterError> {
        let mut file = File::open(&self.filepath)?;
        file.seek(SeekFrom::Start(REFCOUNTER_HEADER_SIZE + 2 * sector))?;
        let mut buf = [0u8; 2];
        file.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
}

/// Writes a count directly into a counter file, bypassing the session
/// machinery. Only used by tests and recovery tooling.
#[cfg(test)]
pub(crate) fn write_count(path: &Path, sector: u64, count: u16) -> io::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(REFCOUNTER_HEADER_SIZE + 2 * sector))?;
    file.write_all(&count.to_le_bytes())?;
    file.sync_all()
}
