//! Persistent storage backend.
//!
//! Durable, crash-safe storage for a single process:
//! - write-ahead logging for crash recovery
//! - an exclusive file lock on the data directory
//! - CRC32 checksums on every record
//! - snapshot compaction to bound replay time
//!
//! # Layout
//!
//! ```text
//! <data_dir>/
//!   .lock            exclusive lock while open
//!   leadgraph.wal    entries since the last snapshot
//!   leadgraph.snap   full state as of a WAL sequence number
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use snapshot::{SnapshotData, SnapshotHeader};
pub use stores::{
    CompactionResult, PersistentCustomerStore, PersistentIdentifierStore,
    PersistentInteractionStore, PersistentStores,
};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::config::{ConfigError, StorageConfig};
use crate::error::LeadGraphResult;

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size (bytes) after which compaction is due.
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        let storage = StorageConfig::default();
        Self::from(&storage)
    }
}

impl From<&StorageConfig> for PersistentConfig {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            max_wal_size: storage.max_wal_size,
            sync_on_write: storage.sync_on_write,
        }
    }
}

impl PersistentConfig {
    /// # Errors
    /// `InvalidValue` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < StorageConfig::MIN_WAL_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_wal_size",
                reason: format!(
                    "must be at least {} bytes (got {})",
                    StorageConfig::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create a persistent leadgraph database at `path`.
///
/// # Errors
/// - invalid configuration
/// - the path cannot be created, or another process holds the lock
/// - the snapshot or WAL is unreadable
///
/// # Example
/// ```rust,ignore
/// use leadgraph::storage::persistent::open_database;
/// use leadgraph::config::ResolverConfig;
///
/// let stores = open_database("./leadgraph.db", None)?;
/// let service = stores.service(ResolverConfig::default());
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> LeadGraphResult<PersistentStores> {
    let config = config.unwrap_or_default().validate()?;
    PersistentStores::open(path.as_ref(), config)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::error::LeadGraphError;

    #[test]
    fn test_rejects_tiny_wal_limit() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 100,
            sync_on_write: false,
        };
        let err = open_database(dir.path(), Some(config)).err().unwrap();
        assert!(matches!(err, LeadGraphError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_needs_compaction_tracks_limit() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: StorageConfig::MIN_WAL_SIZE,
            sync_on_write: false,
        };
        let stores = open_database(dir.path(), Some(config)).unwrap();
        assert!(!stores.needs_compaction());

        let service = stores.service(crate::config::ResolverConfig::default());
        for i in 0..20 {
            service
                .capture_lead(crate::ingest::LeadInput {
                    identifiers: crate::bundle::IdentifierBundle::new().email(format!("u{i}@x.com")),
                    ..crate::ingest::LeadInput::default()
                })
                .unwrap();
        }
        assert!(stores.needs_compaction());
        stores.compact().unwrap();
        assert!(!stores.needs_compaction());
    }
}
