//! Persistent store implementations.
//!
//! Each store wraps:
//! - the same in-memory index the in-memory backend uses, for reads
//! - the shared WAL, for durable writes
//!
//! A write takes the store's index lock, validates, appends to the WAL and
//! only then applies the change. Compaction writes a snapshot of all three
//! indexes and truncates the WAL.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::ResolverConfig;
use crate::customer::{Customer, CustomerId};
use crate::error::LeadGraphResult;
use crate::identifier::{Identifier, IdentifierType};
use crate::ingest::IngestService;
use crate::interaction::{Interaction, InteractionId};
use crate::storage::index::{CustomerIndex, IdentifierIndex, InteractionIndex};
use crate::storage::memory::lock_err;
use crate::storage::traits::{CustomerStore, IdentifierStore, InteractionStore, StorageError};

use super::file_lock::FileLock;
use super::snapshot::{self, SnapshotData, SnapshotWriter};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "leadgraph.wal";

fn backend(context: &str, e: impl Display) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

fn log(wal: &WriteAheadLog, kind: WalEntryKind) -> Result<u64, StorageError> {
    wal.append(kind).map_err(|e| backend("WAL write failed", e))
}

/// The three persistent stores over one data directory.
///
/// This is the primary entry point for persistent storage.
pub struct PersistentStores {
    dir: PathBuf,
    _lock: FileLock,
    wal: Arc<WriteAheadLog>,
    config: PersistentConfig,

    /// Customer rows.
    pub customers: Arc<PersistentCustomerStore>,
    /// Identifier claims.
    pub identifiers: Arc<PersistentIdentifierStore>,
    /// Interaction rows.
    pub interactions: Arc<PersistentInteractionStore>,
}

impl PersistentStores {
    /// Open or create a data directory: lock it, load the snapshot, replay
    /// the WAL on top.
    ///
    /// # Errors
    /// - the directory cannot be created or another process holds the lock
    /// - the snapshot or WAL is unreadable
    pub fn open(dir: &Path, config: PersistentConfig) -> LeadGraphResult<Self> {
        fs::create_dir_all(dir).map_err(|e| backend("failed to create data directory", e))?;
        let lock = FileLock::acquire(dir).map_err(|e| backend("failed to acquire lock", e))?;

        let stale = snapshot::remove_stale(dir).map_err(|e| backend("failed to scan data directory", e))?;
        if stale > 0 {
            debug!(files = stale, "removed stale snapshot files");
        }

        let wal = Arc::new(
            WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
                .map_err(|e| backend("failed to open WAL", e))?,
        );

        let mut customers = CustomerIndex::default();
        let mut identifiers = IdentifierIndex::default();
        let mut interactions = InteractionIndex::default();

        let mut base = 0;
        if let Some((header, data)) =
            snapshot::load(dir).map_err(|e| backend("failed to load snapshot", e))?
        {
            base = header.sequence;
            for customer in data.customers {
                customers.apply_insert(customer);
            }
            for identifier in data.identifiers {
                identifiers.apply_insert(identifier);
            }
            for interaction in data.interactions {
                interactions.apply_insert(interaction);
            }
            wal.advance_to(base).map_err(|e| backend("failed to open WAL", e))?;
            debug!(sequence = base, rows = header.customers + header.identifiers + header.interactions, "loaded snapshot");
        }

        let mut replayed = 0u64;
        for entry in wal.iter().map_err(|e| backend("failed to iterate WAL", e))? {
            let entry = entry.map_err(|e| backend("corrupted WAL entry", e))?;
            // Already contained in the snapshot.
            if entry.sequence <= base {
                continue;
            }
            replay(entry.kind, &mut customers, &mut identifiers, &mut interactions);
            replayed += 1;
        }
        if replayed > 0 {
            info!(entries = replayed, dir = %dir.display(), "replayed WAL");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            customers: Arc::new(PersistentCustomerStore {
                wal: wal.clone(),
                index: RwLock::new(customers),
            }),
            identifiers: Arc::new(PersistentIdentifierStore {
                wal: wal.clone(),
                index: RwLock::new(identifiers),
            }),
            interactions: Arc::new(PersistentInteractionStore {
                wal: wal.clone(),
                index: RwLock::new(interactions),
            }),
            wal,
            config,
        })
    }

    /// Ingestion service over these stores.
    #[must_use]
    pub fn service(&self, config: ResolverConfig) -> IngestService {
        IngestService::new(
            self.customers.clone(),
            self.identifiers.clone(),
            self.interactions.clone(),
            config,
        )
    }

    /// Write a snapshot of the current state and truncate the WAL.
    ///
    /// Writers are blocked for the duration. If this fails partway the WAL
    /// still holds everything and is replayed on the next open.
    ///
    /// # Errors
    /// Any I/O failure writing the snapshot or truncating the WAL.
    pub fn compact(&self) -> LeadGraphResult<CompactionResult> {
        let customers = self.customers.index.read().map_err(|_| lock_err("compact.customers"))?;
        let identifiers = self
            .identifiers
            .index
            .read()
            .map_err(|_| lock_err("compact.identifiers"))?;
        let interactions = self
            .interactions
            .index
            .read()
            .map_err(|_| lock_err("compact.interactions"))?;

        let wal_size_before = self.wal.size_bytes().map_err(|e| backend("failed to stat WAL", e))?;
        let sequence = self
            .wal
            .current_sequence()
            .map_err(|e| backend("failed to read WAL sequence", e))?;

        if self.wal.iter().map_err(|e| backend("failed to iterate WAL", e))?.next().is_none() {
            return Ok(CompactionResult {
                sequence,
                rows: 0,
                snapshot: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SnapshotData {
            customers: customers.values().cloned().collect(),
            identifiers: identifiers.values().cloned().collect(),
            interactions: interactions.values().cloned().collect(),
        };
        SnapshotWriter::new(&self.dir)
            .commit(sequence, &data)
            .map_err(|e| backend("failed to write snapshot", e))?;
        self.wal.truncate().map_err(|e| backend("failed to truncate WAL", e))?;

        let wal_size_after = self.wal.size_bytes().map_err(|e| backend("failed to stat WAL", e))?;
        info!(
            sequence,
            rows = data.row_count(),
            wal_size_before,
            wal_size_after,
            "compacted WAL into snapshot"
        );

        Ok(CompactionResult {
            sequence,
            rows: data.row_count(),
            snapshot: Some(self.dir.join(snapshot::SNAPSHOT_FILE)),
            wal_size_before,
            wal_size_after,
        })
    }

    /// True once the WAL has grown past `max_wal_size`.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.wal_size() >= self.config.max_wal_size
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// The data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Last WAL sequence contained in the snapshot.
    pub sequence: u64,
    /// Rows written to the snapshot.
    pub rows: u64,
    /// Snapshot path, `None` if there was nothing to compact.
    pub snapshot: Option<PathBuf>,
    /// WAL bytes before compaction.
    pub wal_size_before: u64,
    /// WAL bytes after compaction.
    pub wal_size_after: u64,
}

fn replay(
    kind: WalEntryKind,
    customers: &mut CustomerIndex,
    identifiers: &mut IdentifierIndex,
    interactions: &mut InteractionIndex,
) {
    match kind {
        WalEntryKind::CustomerInsert(customer) | WalEntryKind::CustomerUpdate(customer) => {
            customers.apply_put(customer);
        }
        WalEntryKind::CustomerDelete { id } => {
            customers.apply_delete(id);
        }
        WalEntryKind::IdentifierInsert(identifier) => identifiers.apply_insert(identifier),
        WalEntryKind::IdentifierUpdate(identifier) => identifiers.apply_put(identifier),
        WalEntryKind::IdentifierDelete(key) => {
            identifiers.apply_delete(&key);
        }
        WalEntryKind::IdentifiersDeleted { customer_id } => {
            identifiers.apply_delete_for_customer(customer_id);
        }
        WalEntryKind::InteractionInsert(interaction) => interactions.apply_insert(interaction),
        WalEntryKind::InteractionsDeleted { customer_id } => {
            interactions.apply_delete_for_customer(customer_id);
        }
    }
}

// --- Customer Store ---

/// WAL-backed `CustomerStore`.
pub struct PersistentCustomerStore {
    wal: Arc<WriteAheadLog>,
    index: RwLock<CustomerIndex>,
}

impl CustomerStore for PersistentCustomerStore {
    fn insert(&self, customer: Customer) -> Result<(), StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("customer.insert"))?;
        index.check_insert(&customer)?;
        log(&self.wal, WalEntryKind::CustomerInsert(customer.clone()))?;
        index.apply_insert(customer);
        Ok(())
    }

    fn get(&self, id: CustomerId) -> Result<Option<Customer>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("customer.get"))?;
        Ok(index.get(id).cloned())
    }

    fn delete(&self, id: CustomerId) -> Result<Customer, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("customer.delete"))?;
        if index.get(id).is_none() {
            return Err(StorageError::CustomerNotFound(id));
        }
        log(&self.wal, WalEntryKind::CustomerDelete { id })?;
        index.apply_delete(id).ok_or(StorageError::CustomerNotFound(id))
    }

    fn find_by_master(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<CustomerId>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("customer.find_by_master"))?;
        Ok(index.find_by_master(identifier_type, value))
    }

    fn modify(
        &self,
        id: CustomerId,
        apply: &mut dyn FnMut(&mut Customer),
    ) -> Result<Customer, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("customer.modify"))?;
        let next = index.prepare_modify(id, apply, Utc::now())?;
        log(&self.wal, WalEntryKind::CustomerUpdate(next.clone()))?;
        index.apply_put(next.clone());
        Ok(next)
    }

    fn count(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("customer.count"))?;
        Ok(index.len())
    }
}

// --- Identifier Store ---

/// WAL-backed `IdentifierStore`.
pub struct PersistentIdentifierStore {
    wal: Arc<WriteAheadLog>,
    index: RwLock<IdentifierIndex>,
}

impl IdentifierStore for PersistentIdentifierStore {
    fn find_owner(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<CustomerId>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("identifier.find_owner"))?;
        Ok(index.owner(identifier_type, value))
    }

    fn find_owner_by_any(
        &self,
        keys: &[(IdentifierType, String)],
    ) -> Result<Option<CustomerId>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("identifier.find_owner_by_any"))?;
        Ok(index.first_owner(keys))
    }

    fn insert(&self, identifier: Identifier) -> Result<Identifier, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("identifier.insert"))?;
        index.check_insert(&identifier)?;
        log(&self.wal, WalEntryKind::IdentifierInsert(identifier.clone()))?;
        index.apply_insert(identifier.clone());
        Ok(identifier)
    }

    fn exists(
        &self,
        customer_id: CustomerId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<bool, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("identifier.exists"))?;
        Ok(index.owner(identifier_type, value) == Some(customer_id))
    }

    fn get(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<Identifier>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("identifier.get"))?;
        Ok(index.get(identifier_type, value).cloned())
    }

    fn list_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Identifier>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("identifier.list_for_customer"))?;
        Ok(index.list_for_customer(customer_id))
    }

    fn set_verified(
        &self,
        identifier_type: IdentifierType,
        value: &str,
        at: DateTime<Utc>,
    ) -> Result<Identifier, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("identifier.set_verified"))?;
        let verified = index.prepare_verify(identifier_type, value, at)?;
        log(&self.wal, WalEntryKind::IdentifierUpdate(verified.clone()))?;
        index.apply_put(verified.clone());
        Ok(verified)
    }

    fn delete(
        &self,
        customer_id: CustomerId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Identifier, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("identifier.delete"))?;
        let identifier = index.check_delete(customer_id, identifier_type, value)?;
        log(&self.wal, WalEntryKind::IdentifierDelete(identifier.key()))?;
        index.apply_delete(&identifier.key());
        Ok(identifier)
    }

    fn delete_for_customer(&self, customer_id: CustomerId) -> Result<usize, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("identifier.delete_for_customer"))?;
        if index.list_for_customer(customer_id).is_empty() {
            return Ok(0);
        }
        log(&self.wal, WalEntryKind::IdentifiersDeleted { customer_id })?;
        Ok(index.apply_delete_for_customer(customer_id))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("identifier.count"))?;
        Ok(index.len())
    }
}

// --- Interaction Store ---

/// WAL-backed `InteractionStore`.
pub struct PersistentInteractionStore {
    wal: Arc<WriteAheadLog>,
    index: RwLock<InteractionIndex>,
}

impl InteractionStore for PersistentInteractionStore {
    fn insert(&self, interaction: Interaction) -> Result<(), StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("interaction.insert"))?;
        index.check_insert(&interaction)?;
        log(&self.wal, WalEntryKind::InteractionInsert(interaction.clone()))?;
        index.apply_insert(interaction);
        Ok(())
    }

    fn get(&self, id: InteractionId) -> Result<Option<Interaction>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("interaction.get"))?;
        Ok(index.get(id).cloned())
    }

    fn find_by_customer(&self, customer_id: CustomerId) -> Result<Vec<Interaction>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("interaction.find_by_customer"))?;
        Ok(index.find_by_customer(customer_id))
    }

    fn delete_for_customer(&self, customer_id: CustomerId) -> Result<usize, StorageError> {
        let mut index = self
            .index
            .write()
            .map_err(|_| lock_err("interaction.delete_for_customer"))?;
        if index.find_by_customer(customer_id).is_empty() {
            return Ok(0);
        }
        log(&self.wal, WalEntryKind::InteractionsDeleted { customer_id })?;
        Ok(index.apply_delete_for_customer(customer_id))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("interaction.count"))?;
        Ok(index.len())
    }
}
