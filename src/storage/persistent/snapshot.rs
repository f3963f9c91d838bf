//! Snapshot files written by compaction.
//!
//! A snapshot holds the full state as of a WAL sequence number:
//!
//! ```text
//! [MAGIC][VERSION][frame: SnapshotHeader][frame: SnapshotData]
//! ```
//!
//! It is written to a temporary file, fsynced, then renamed over the
//! previous snapshot, so the directory always holds either the old or the
//! new one in full.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::customer::Customer;
use crate::identifier::Identifier;
use crate::interaction::Interaction;

use super::codec;

/// Snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "leadgraph.snap";

/// First frame of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Last WAL sequence whose effects are included.
    pub sequence: u64,
    /// When compaction ran.
    pub created_at: DateTime<Utc>,
    /// Customer rows.
    pub customers: u64,
    /// Identifier rows.
    pub identifiers: u64,
    /// Interaction rows.
    pub interactions: u64,
}

/// Every stored row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    /// All customers.
    pub customers: Vec<Customer>,
    /// All identifier claims.
    pub identifiers: Vec<Identifier>,
    /// All interactions.
    pub interactions: Vec<Interaction>,
}

impl SnapshotData {
    /// Total rows across all three tables.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        (self.customers.len() + self.identifiers.len() + self.interactions.len()) as u64
    }
}

/// Load the snapshot in `dir`, if there is one.
pub fn load(dir: &Path) -> IoResult<Option<(SnapshotHeader, SnapshotData)>> {
    let file = match File::open(dir.join(SNAPSHOT_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;
    let header: SnapshotHeader = codec::decode(&mut reader)?;
    let data: SnapshotData = codec::decode(&mut reader)?;
    Ok(Some((header, data)))
}

/// Remove temporary files left behind by an interrupted compaction.
pub fn remove_stale(dir: &Path) -> IoResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stale = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(SNAPSHOT_FILE) && n.ends_with(".tmp"));
        if stale {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Writes a snapshot atomically.
pub struct SnapshotWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl SnapshotWriter {
    /// A writer targeting `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            temp_path: dir.join(format!("{SNAPSHOT_FILE}.{}.tmp", Uuid::new_v4())),
            final_path: dir.join(SNAPSHOT_FILE),
            committed: false,
        }
    }

    /// Write, fsync and rename. After this returns the snapshot is durable.
    pub fn commit(mut self, sequence: u64, data: &SnapshotData) -> IoResult<SnapshotHeader> {
        let header = SnapshotHeader {
            sequence,
            created_at: Utc::now(),
            customers: data.customers.len() as u64,
            identifiers: data.identifiers.len() as u64,
            interactions: data.interactions.len() as u64,
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.temp_path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(data)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&self.temp_path, &self.final_path)?;
        self.committed = true;

        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir)?;
        }
        Ok(header)
    }
}

/// Persist a rename in `dir`.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::customer::CustomerId;
    use crate::identifier::IdentifierType;

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_commit_replaces_previous() {
        let dir = tempdir().unwrap();
        let now = Utc::now();

        let first = SnapshotData {
            customers: vec![Customer::new(now)],
            ..SnapshotData::default()
        };
        SnapshotWriter::new(dir.path()).commit(3, &first).unwrap();

        let owner = CustomerId::new();
        let second = SnapshotData {
            customers: vec![Customer::with_id(owner, now), Customer::new(now)],
            identifiers: vec![Identifier::new(
                owner,
                IdentifierType::Email,
                "a@x.com",
                true,
                false,
                now,
            )],
            interactions: Vec::new(),
        };
        SnapshotWriter::new(dir.path()).commit(9, &second).unwrap();

        let (header, data) = load(dir.path()).unwrap().unwrap();
        assert_eq!(header.sequence, 9);
        assert_eq!(header.customers, 2);
        assert_eq!(data.row_count(), 3);
        assert_eq!(data.identifiers[0].customer_id, owner);
        assert_eq!(remove_stale(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_uncommitted_writer_leaves_nothing() {
        let dir = tempdir().unwrap();
        drop(SnapshotWriter::new(dir.path()));
        fs::write(dir.path().join(format!("{SNAPSHOT_FILE}.abc.tmp")), b"partial").unwrap();

        assert_eq!(remove_stale(dir.path()).unwrap(), 1);
        assert!(load(dir.path()).unwrap().is_none());
    }
}
