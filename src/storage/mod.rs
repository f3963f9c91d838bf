//! Storage for customers, identifier claims and interactions.
//!
//! The traits in this module are the only thing the resolver and the
//! ingestion service depend on. Two backends implement them:
//!
//! - [`memory`]: process-local maps behind `RwLock`s
//! - `persistent` (feature `persistent`): the same indexes, made durable
//!   with a write-ahead log and snapshot compaction

mod index;
pub mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
mod traits;

pub use memory::{InMemoryCustomerStore, InMemoryIdentifierStore, InMemoryInteractionStore};
pub use traits::{CustomerStore, IdentifierStore, InteractionStore, StorageError};
