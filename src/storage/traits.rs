//! Abstract storage traits for leadgraph.
//!
//! These traits define the contract that storage backends must implement.
//! The resolver and ingestion service only ever see `Arc<dyn ...>`, so the
//! in-memory and persistent backends are interchangeable.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::customer::{Customer, CustomerId};
use crate::identifier::{Identifier, IdentifierType};
use crate::interaction::{Interaction, InteractionId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Customer not found.
    #[error("Customer not found: {0}")]
    CustomerNotFound(CustomerId),

    /// Identifier not found.
    #[error("Identifier not found: {identifier_type}:{value}")]
    IdentifierNotFound {
        // Identifier type.
        identifier_type: IdentifierType,
        /// Identifier value.
        value: String,
    },

    /// Interaction not found.
    #[error("Interaction not found: {0}")]
    InteractionNotFound(InteractionId),

    /// The `(type, value)` pair is already claimed by another customer.
    #[error("Identifier {identifier_type}:{value} already owned by customer {owner}")]
    DuplicateIdentifier {
        // Identifier type.
        identifier_type: IdentifierType,
        /// Identifier value.
        value: String,
        /// Current owner.
        owner: CustomerId,
    },

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Storage trait for Customer records.
pub trait CustomerStore: Send + Sync {
    /// Insert a new customer. Returns error if ID already exists.
    fn insert(&self, customer: Customer) -> Result<(), StorageError>;

    /// Get a customer by ID.
    fn get(&self, id: CustomerId) -> Result<Option<Customer>, StorageError>;

    /// Delete a customer by ID. Returns error if not found.
    ///
    /// Identifier and interaction rows are cascaded by the caller.
    fn delete(&self, id: CustomerId) -> Result<Customer, StorageError>;

    /// Find the customer whose master email or phone equals `value`.
    ///
    /// Only `Email` and `Phone` have master fields; other types return `None`.
    fn find_by_master(
        &self,
        // Identifier type.
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<CustomerId>, StorageError>;

    /// Atomically apply `apply` to the stored customer and persist the result.
    ///
    /// The store bumps `version` and `updated_at`. Concurrent modifications of
    /// the same customer are serialized, so counter increments are never lost.
    fn modify(
        &self,
        id: CustomerId,
        apply: &mut dyn FnMut(&mut Customer),
    ) -> Result<Customer, StorageError>;

    /// Number of stored customers.
    fn count(&self) -> Result<usize, StorageError>;
}

/// Storage trait for Identifier claims.
///
/// # Invariant
/// `(identifier_type, value)` is unique across the whole store. The check
/// and the insert happen in one critical section, so of two racing inserts
/// for the same pair exactly one succeeds.
pub trait IdentifierStore: Send + Sync {
    /// Owner of `(type, value)`, if claimed.
    fn find_owner(
        &self,
        // Identifier type.
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<CustomerId>, StorageError>;

    /// First owner found scanning `keys` in order.
    fn find_owner_by_any(
        &self,
        keys: &[(IdentifierType, String)],
    ) -> Result<Option<CustomerId>, StorageError>;

    /// Insert a new claim.
    ///
    /// # Errors
    /// - `DuplicateIdentifier` if the pair is owned by a different customer
    /// - `DuplicateKey` if this customer already owns the pair
    fn insert(&self, identifier: Identifier) -> Result<Identifier, StorageError>;

    /// True if `customer_id` owns `(type, value)`.
    fn exists(
        &self,
        customer_id: CustomerId,
        // Identifier type.
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<bool, StorageError>;

    /// Get the full claim for `(type, value)`.
    fn get(
        &self,
        // Identifier type.
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<Identifier>, StorageError>;

    /// All claims owned by a customer, oldest first.
    fn list_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Identifier>, StorageError>;

    /// Mark a claim verified. Returns the updated claim.
    fn set_verified(
        &self,
        // Identifier type.
        identifier_type: IdentifierType,
        value: &str,
        at: DateTime<Utc>,
    ) -> Result<Identifier, StorageError>;

    /// Remove one claim, provided `customer_id` still owns it.
    ///
    /// # Errors
    /// `IdentifierNotFound` if the pair is unclaimed or owned by someone else.
    fn delete(
        &self,
        customer_id: CustomerId,
        // Identifier type.
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Identifier, StorageError>;

    /// Remove every claim owned by a customer. Returns how many were removed.
    fn delete_for_customer(&self, customer_id: CustomerId) -> Result<usize, StorageError>;

    /// Number of stored claims.
    fn count(&self) -> Result<usize, StorageError>;
}

/// Storage trait for Click / Lead / Event rows.
pub trait InteractionStore: Send + Sync {
    /// Insert a new interaction. Returns error if ID already exists.
    fn insert(&self, interaction: Interaction) -> Result<(), StorageError>;

    /// Get an interaction by ID.
    fn get(&self, id: InteractionId) -> Result<Option<Interaction>, StorageError>;

    /// All interactions of a customer, ascending by `occurred_at`.
    fn find_by_customer(&self, customer_id: CustomerId) -> Result<Vec<Interaction>, StorageError>;

    /// Remove every interaction of a customer. Returns how many were removed.
    fn delete_for_customer(&self, customer_id: CustomerId) -> Result<usize, StorageError>;

    /// Number of stored interactions.
    fn count(&self) -> Result<usize, StorageError>;
}
