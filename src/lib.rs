//! # leadgraph - identity resolution for marketing attribution
//!
//! leadgraph decides which customer an inbound click, lead or event belongs
//! to. Each interaction arrives with a bundle of identity signals (email,
//! phone, ad click id, device id, session id, browser fingerprint); the
//! resolver matches it to an existing customer or creates one, records any
//! identifiers it had not seen before and fills empty profile fields.
//!
//! ## Core Concepts
//!
//! - **Customer**: the resolved person, with master email/phone and counters
//! - **Identifier**: a `(type, value)` claim owned by exactly one customer
//! - **IdentifierBundle**: the signals observed on one interaction
//! - **IdentityResolver**: bundle in, customer out
//! - **IngestService**: resolve, persist the interaction, bump counters
//!
//! ## Usage
//!
//! ```rust
//! use leadgraph::{IdentifierBundle, IngestService};
//! use leadgraph::config::ResolverConfig;
//! use leadgraph::ingest::{ClickInput, LeadInput};
//!
//! let service = IngestService::in_memory(ResolverConfig::default());
//!
//! // Anonymous ad click.
//! let click = service.track_click(ClickInput {
//!     identifiers: IdentifierBundle::new().click_id("gclid-123").device_id("dev-9"),
//!     ..ClickInput::default()
//! })?;
//!
//! // Same device submits a form: the email lands on the same customer.
//! let lead = service.capture_lead(LeadInput {
//!     identifiers: IdentifierBundle::new().device_id("dev-9").email("ada@example.com"),
//!     ..LeadInput::default()
//! })?;
//!
//! assert_eq!(click.customer.id, lead.customer.id);
//! assert_eq!(lead.customer.master_email.as_deref(), Some("ada@example.com"));
//! # Ok::<(), leadgraph::LeadGraphError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod bundle;
pub mod config;
pub mod customer;
pub mod error;
pub mod identifier;
pub mod interaction;
pub mod value;

// Resolution, storage and ingestion
pub mod ingest;
pub mod resolver;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use bundle::{fingerprint_hash, IdentifierBundle, ResolveContext, TechnicalContext};
pub use config::Config;
pub use customer::{Customer, CustomerId};
pub use error::{LeadGraphError, LeadGraphResult, ValidationError};
pub use identifier::{Identifier, IdentifierId, IdentifierKey, IdentifierType};
pub use ingest::{IngestPayload, IngestService, Ingested};
pub use interaction::{Attribution, Interaction, InteractionId, InteractionKind};
pub use resolver::{IdentityResolver, Resolution};
pub use storage::{
    CustomerStore, IdentifierStore, InMemoryCustomerStore, InMemoryIdentifierStore,
    InMemoryInteractionStore, InteractionStore, StorageError,
};
pub use value::Value;
