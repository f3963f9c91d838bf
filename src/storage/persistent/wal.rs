//! Write-ahead log.
//!
//! Every mutation is appended here (and optionally fsynced) before it is
//! applied to the in-memory indexes. On open the log is replayed on top of
//! the last snapshot.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [frame: WalEntry]
//! [frame: WalEntry]
//! ...
//! ```
//!
//! Sequence numbers keep increasing across compactions, so entries already
//! contained in a snapshot can be recognized and skipped.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::customer::{Customer, CustomerId};
use crate::identifier::{Identifier, IdentifierKey};
use crate::interaction::Interaction;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The operation being logged.
    pub kind: WalEntryKind,
}

/// The logged mutation. Entries carry full post-images so replay never
/// re-runs business logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// New customer row.
    CustomerInsert(Customer),
    /// Customer post-image after `modify`.
    CustomerUpdate(Customer),
    /// Customer row removed.
    CustomerDelete {
        /// Removed customer.
        id: CustomerId,
    },

    /// New identifier claim.
    IdentifierInsert(Identifier),
    /// Claim post-image after verification.
    IdentifierUpdate(Identifier),
    /// One claim released.
    IdentifierDelete(IdentifierKey),
    /// Every claim of a customer removed.
    IdentifiersDeleted {
        /// Former owner.
        customer_id: CustomerId,
    },

    /// New interaction row.
    InteractionInsert(Interaction),
    /// Every interaction of a customer removed.
    InteractionsDeleted {
        /// Former owner.
        customer_id: CustomerId,
    },
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Append-only log shared by all persistent stores.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// A torn or corrupt tail (from a crash mid-append) is cut off so new
    /// entries are never written behind unreadable bytes.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let sequence = if len < codec::HEADER_LEN {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        } else {
            Self::recover(path, len, sync_on_write)?
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Scan the log; truncate anything after the last intact entry.
    fn recover(path: &Path, len: u64, sync_on_write: bool) -> IoResult<u64> {
        let mut iter = WalIterator::new(path)?;
        let mut last = 0;
        for entry in iter.by_ref() {
            match entry {
                Ok(entry) => last = entry.sequence,
                Err(e) => {
                    warn!(after_sequence = last, error = %e, "WAL corruption detected");
                    break;
                }
            }
        }

        let valid = iter.valid_len();
        if valid < len {
            warn!(
                path = %path.display(),
                dropped_bytes = len - valid,
                "truncating torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid)?;
            if sync_on_write {
                file.sync_all()?;
            }
        }
        Ok(last)
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalState>> {
        self.state
            .lock()
            .map_err(|_| IoError::new(ErrorKind::Other, "poisoned lock: wal"))
    }

    /// Append an entry. Returns the sequence number assigned to it.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.lock()?;

        let sequence = state.sequence + 1;
        let entry = WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        };
        let frame = codec::encode(&entry)?;

        state.writer.write_all(&frame)?;
        state.writer.flush()?;
        if self.sync_on_write {
            state.writer.get_ref().sync_data()?;
        }

        state.sequence = sequence;
        Ok(sequence)
    }

    /// Iterate over all entries, oldest first.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Make sure the next entry is numbered above `sequence`.
    pub fn advance_to(&self, sequence: u64) -> IoResult<()> {
        let mut state = self.lock()?;
        state.sequence = state.sequence.max(sequence);
        Ok(())
    }

    /// WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drop every entry. Only call once their effects are in a snapshot.
    /// The sequence counter is kept.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        codec::write_header(&mut file)?;
        file.sync_all()?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        Ok(())
    }
}

/// Iterator over WAL entries.
///
/// Stops quietly at a frame cut short by a crash; yields an error for a
/// frame that is complete but corrupt.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    valid_len: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;

        Ok(Self {
            reader,
            file_size,
            valid_len: codec::HEADER_LEN,
        })
    }

    /// Byte offset just past the last entry decoded successfully.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.valid_len >= self.file_size {
            return None;
        }

        match codec::decode::<WalEntry>(&mut self.reader) {
            Ok(entry) => match self.reader.stream_position() {
                Ok(pos) => {
                    self.valid_len = pos;
                    Some(Ok(entry))
                }
                Err(e) => Some(Err(e)),
            },
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
