//! Identity resolution.
//!
//! Maps an identifier bundle onto an existing customer or a new one, then
//! records any identifiers the customer did not own yet.
//!
//! Matching is ordered and first-match-wins, strongest signal first:
//!
//! 1. email (master email or `EMAIL` claim)
//! 2. phone (master phone or `PHONE` claim)
//! 3. click id, device id, session id, scanned in that order
//! 4. fingerprint (only when enabled in [`ResolverConfig`])
//!
//! A step that finds nothing falls through to the next; if every step comes
//! up empty a new customer is created. Two existing customers are never
//! merged: an identifier owned by someone else is a [`LeadGraphError::Conflict`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bundle::{Claims, IdentifierBundle, ResolveContext};
use crate::config::ResolverConfig;
use crate::customer::{Customer, CustomerId};
use crate::error::{LeadGraphError, LeadGraphResult};
use crate::identifier::{Identifier, IdentifierKey, IdentifierType};
use crate::storage::{CustomerStore, IdentifierStore, StorageError};

/// Weak identifiers, in tie-break order.
const WEAK_PRIORITY: [IdentifierType; 3] = [
    IdentifierType::ClickId,
    IdentifierType::DeviceId,
    IdentifierType::SessionId,
];

/// Outcome of a resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The customer after side effects were applied.
    pub customer: Customer,
    /// True if the customer was created by this call.
    pub created: bool,
    /// Which identifier type matched, `None` for a new customer.
    pub matched_by: Option<IdentifierType>,
    /// Identifier rows inserted by this call.
    pub new_identifiers: Vec<Identifier>,
}

/// How a single resolution attempt failed.
enum AttemptError {
    /// Another customer claimed an identifier first; the attempt can be re-run.
    Lost {
        key: IdentifierKey,
        owner: CustomerId,
        customer_id: CustomerId,
    },
    Fatal(LeadGraphError),
}

impl From<StorageError> for AttemptError {
    fn from(e: StorageError) -> Self {
        Self::Fatal(e.into())
    }
}

/// Resolves identifier bundles to customers.
#[derive(Clone)]
pub struct IdentityResolver {
    customers: Arc<dyn CustomerStore>,
    identifiers: Arc<dyn IdentifierStore>,
    config: ResolverConfig,
}

impl IdentityResolver {
    /// Create a resolver with default settings.
    #[must_use]
    pub fn new(customers: Arc<dyn CustomerStore>, identifiers: Arc<dyn IdentifierStore>) -> Self {
        Self::with_config(customers, identifiers, ResolverConfig::default())
    }

    /// Create a resolver with explicit settings.
    #[must_use]
    pub fn with_config(
        customers: Arc<dyn CustomerStore>,
        identifiers: Arc<dyn IdentifierStore>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            customers,
            identifiers,
            config,
        }
    }

    /// Resolver settings in effect.
    #[must_use]
    pub const fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `bundle` to a customer, creating one if nothing matches.
    ///
    /// Always moves `last_seen` forward, fills empty master email/phone,
    /// records unseen identifiers and fills empty context fields.
    ///
    /// # Errors
    ///
    /// - `Validation(EmptyBundle)` if the bundle has no usable identifier
    /// - `Conflict` if an identifier is owned by a different customer than the
    ///   matched one, or a race persists past `max_conflict_retries`. Nothing
    ///   from the rejected bundle is left behind.
    /// - `Storage` for backend failures (not retried)
    pub fn resolve(
        &self,
        bundle: &IdentifierBundle,
        context: Option<&ResolveContext>,
    ) -> LeadGraphResult<Resolution> {
        let claims = bundle.claims(self.config.max_identifier_length)?;

        let mut retries = 0;
        loop {
            match self.attempt(&claims, context) {
                Ok(resolution) => return Ok(resolution),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Lost {
                    key,
                    owner,
                    customer_id,
                }) => {
                    if retries < self.config.max_conflict_retries {
                        retries += 1;
                        warn!(
                            identifier = %key,
                            owner = %owner,
                            retry = retries,
                            "identifier claimed concurrently, re-resolving"
                        );
                        continue;
                    }
                    warn!(identifier = %key, owner = %owner, "identifier race persisted");
                    return Err(LeadGraphError::Conflict {
                        identifier_type: key.identifier_type,
                        value: key.value,
                        owner,
                        expected: customer_id,
                    });
                }
            }
        }
    }

    fn attempt(
        &self,
        claims: &Claims,
        context: Option<&ResolveContext>,
    ) -> Result<Resolution, AttemptError> {
        let now = Utc::now();

        let (customer_id, matched_by) = match self.find_match(claims)? {
            Some((id, t)) => (id, Some(t)),
            None => {
                // Masters are filled after the claims commit, so nobody can
                // match this row through a master field before then.
                let customer = Customer::new(now);
                let id = customer.id;
                self.customers.insert(customer)?;
                info!(customer_id = %id, identifiers = claims.len(), "created customer");
                (id, None)
            }
        };
        let created = matched_by.is_none();

        let new_identifiers = match self.attach(customer_id, claims, now, created) {
            Ok(inserted) => inserted,
            Err(e) => {
                if created {
                    self.rollback(customer_id);
                }
                return Err(e);
            }
        };

        let customer = self.customers.modify(customer_id, &mut |c: &mut Customer| {
            c.observe(now);
            if let Some(email) = claims.get(IdentifierType::Email) {
                c.fill_master_email(email);
            }
            if let Some(phone) = claims.get(IdentifierType::Phone) {
                c.fill_master_phone(phone);
            }
            if let Some(ctx) = context {
                c.enrich(ctx);
            }
        })?;

        Ok(Resolution {
            customer,
            created,
            matched_by,
            new_identifiers,
        })
    }

    /// Finds the existing customer for `claims`, strongest signal first.
    fn find_match(
        &self,
        claims: &Claims,
    ) -> Result<Option<(CustomerId, IdentifierType)>, StorageError> {
        for t in [IdentifierType::Email, IdentifierType::Phone] {
            let Some(value) = claims.get(t) else {
                continue;
            };
            let owner = match self.customers.find_by_master(t, value)? {
                Some(id) => Some(id),
                None => self.identifiers.find_owner(t, value)?,
            };
            if let Some(id) = owner {
                debug!(customer_id = %id, matched_by = %t, "matched customer");
                return Ok(Some((id, t)));
            }
        }

        let weak = claims.select(&WEAK_PRIORITY);
        if !weak.is_empty() {
            if let Some(id) = self.identifiers.find_owner_by_any(&weak)? {
                let t = self.weak_match_type(id, &weak)?;
                debug!(customer_id = %id, matched_by = %t, "matched customer");
                return Ok(Some((id, t)));
            }
        }

        if self.config.fingerprint_fallback {
            if let Some(fp) = claims.get(IdentifierType::Fingerprint) {
                if let Some(id) = self.identifiers.find_owner(IdentifierType::Fingerprint, fp)? {
                    debug!(customer_id = %id, matched_by = %IdentifierType::Fingerprint, "matched customer");
                    return Ok(Some((id, IdentifierType::Fingerprint)));
                }
            }
        }

        Ok(None)
    }

    fn weak_match_type(
        &self,
        id: CustomerId,
        weak: &[(IdentifierType, String)],
    ) -> Result<IdentifierType, StorageError> {
        for (t, v) in weak {
            if self.identifiers.exists(id, *t, v)? {
                return Ok(*t);
            }
        }
        // The owner was found through one of `weak`; fall back to the first.
        Ok(weak.first().map_or(IdentifierType::ClickId, |(t, _)| *t))
    }

    /// Inserts every claim `customer_id` does not already own.
    ///
    /// Ownership of every claim is checked before the first insert. A claim
    /// held by another customer is a `Conflict` for a matched customer, but a
    /// lost race for one `created` by this attempt: the racer that got there
    /// first is found again on the retry. If an insert loses a race part way
    /// through, a matched customer's claims from this call are released; a
    /// created customer is rolled back whole by the caller.
    fn attach(
        &self,
        customer_id: CustomerId,
        claims: &Claims,
        now: DateTime<Utc>,
        created: bool,
    ) -> Result<Vec<Identifier>, AttemptError> {
        let owned = self.identifiers.list_for_customer(customer_id)?;
        let owns_type = |t: IdentifierType| owned.iter().any(|i| i.identifier_type == t);
        let has_email = owns_type(IdentifierType::Email);
        let has_phone = owns_type(IdentifierType::Phone);
        let bundle_has_email = claims.contains(IdentifierType::Email);

        let mut pending = Vec::new();
        for key in claims.iter() {
            if owned.iter().any(|i| i.key() == *key) {
                continue;
            }
            match self.identifiers.find_owner(key.identifier_type, &key.value)? {
                Some(owner) if owner == customer_id => {}
                Some(owner) if created => {
                    return Err(AttemptError::Lost {
                        key: key.clone(),
                        owner,
                        customer_id,
                    });
                }
                Some(owner) => {
                    warn!(
                        identifier = %key,
                        owner = %owner,
                        customer_id = %customer_id,
                        "identifier owned by another customer"
                    );
                    return Err(AttemptError::Fatal(LeadGraphError::Conflict {
                        identifier_type: key.identifier_type,
                        value: key.value.clone(),
                        owner,
                        expected: customer_id,
                    }));
                }
                None => pending.push(key),
            }
        }

        let mut inserted = Vec::new();
        for key in pending {
            let t = key.identifier_type;
            let is_primary = match t {
                IdentifierType::Email => !has_email,
                IdentifierType::Phone => !has_phone && !bundle_has_email,
                _ => false,
            };
            let identifier = Identifier::new(
                customer_id,
                t,
                key.value.clone(),
                is_primary,
                t.is_self_verified(),
                now,
            );

            let failure = match self.identifiers.insert(identifier) {
                Ok(identifier) => {
                    debug!(customer_id = %customer_id, identifier = %key, "recorded identifier");
                    inserted.push(identifier);
                    continue;
                }
                // A concurrent request for the same customer got there first.
                Err(StorageError::DuplicateKey(_)) => continue,
                Err(StorageError::DuplicateIdentifier { owner, .. }) => AttemptError::Lost {
                    key: key.clone(),
                    owner,
                    customer_id,
                },
                Err(e) => e.into(),
            };
            if !created {
                self.release(customer_id, &inserted);
            }
            return Err(failure);
        }
        Ok(inserted)
    }

    /// Releases claims this attempt inserted for a matched customer.
    fn release(&self, customer_id: CustomerId, inserted: &[Identifier]) {
        for identifier in inserted {
            if let Err(e) =
                self.identifiers
                    .delete(customer_id, identifier.identifier_type, &identifier.value)
            {
                warn!(
                    customer_id = %customer_id,
                    identifier = %identifier.key(),
                    error = %e,
                    "release: failed to delete identifier"
                );
            }
        }
    }

    /// Removes a customer this attempt created. Failures are logged only;
    /// the caller is already returning the error that caused the rollback.
    fn rollback(&self, customer_id: CustomerId) {
        if let Err(e) = self.identifiers.delete_for_customer(customer_id) {
            warn!(customer_id = %customer_id, error = %e, "rollback: failed to delete identifiers");
        }
        if let Err(e) = self.customers.delete(customer_id) {
            warn!(customer_id = %customer_id, error = %e, "rollback: failed to delete customer");
        }
        debug!(customer_id = %customer_id, "rolled back new customer");
    }
}
