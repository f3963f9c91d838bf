//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::customer::{Customer, CustomerId};
use crate::identifier::{Identifier, IdentifierType};
use crate::interaction::{Interaction, InteractionId};
use crate::storage::index::{CustomerIndex, IdentifierIndex, InteractionIndex};
use crate::storage::traits::{CustomerStore, IdentifierStore, InteractionStore, StorageError};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory customer store.
#[derive(Debug, Default)]
pub struct InMemoryCustomerStore {
    state: RwLock<CustomerIndex>,
}

impl InMemoryCustomerStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored customer (unordered).
    pub fn all(&self) -> Result<Vec<Customer>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("customer.all"))?;
        Ok(state.values().cloned().collect())
    }
}

impl CustomerStore for InMemoryCustomerStore {
    fn insert(&self, customer: Customer) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("customer.insert"))?;
        state.check_insert(&customer)?;
        state.apply_insert(customer);
        Ok(())
    }

    fn get(&self, id: CustomerId) -> Result<Option<Customer>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("customer.get"))?;
        Ok(state.get(id).cloned())
    }

    fn delete(&self, id: CustomerId) -> Result<Customer, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("customer.delete"))?;
        state.apply_delete(id).ok_or(StorageError::CustomerNotFound(id))
    }

    fn find_by_master(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<CustomerId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("customer.find_by_master"))?;
        Ok(state.find_by_master(identifier_type, value))
    }

    fn modify(
        &self,
        id: CustomerId,
        apply: &mut dyn FnMut(&mut Customer),
    ) -> Result<Customer, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("customer.modify"))?;
        let next = state.prepare_modify(id, apply, Utc::now())?;
        state.apply_put(next.clone());
        Ok(next)
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("customer.count"))?;
        Ok(state.len())
    }
}

/// Thread-safe in-memory identifier store.
#[derive(Debug, Default)]
pub struct InMemoryIdentifierStore {
    state: RwLock<IdentifierIndex>,
}

impl InMemoryIdentifierStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentifierStore for InMemoryIdentifierStore {
    fn find_owner(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<CustomerId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identifier.find_owner"))?;
        Ok(state.owner(identifier_type, value))
    }

    fn find_owner_by_any(
        &self,
        keys: &[(IdentifierType, String)],
    ) -> Result<Option<CustomerId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identifier.find_owner_by_any"))?;
        Ok(state.first_owner(keys))
    }

    fn insert(&self, identifier: Identifier) -> Result<Identifier, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identifier.insert"))?;
        state.check_insert(&identifier)?;
        state.apply_insert(identifier.clone());
        Ok(identifier)
    }

    fn exists(
        &self,
        customer_id: CustomerId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identifier.exists"))?;
        Ok(state.owner(identifier_type, value) == Some(customer_id))
    }

    fn get(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Option<Identifier>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identifier.get"))?;
        Ok(state.get(identifier_type, value).cloned())
    }

    fn list_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Identifier>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identifier.list_for_customer"))?;
        Ok(state.list_for_customer(customer_id))
    }

    fn set_verified(
        &self,
        identifier_type: IdentifierType,
        value: &str,
        at: DateTime<Utc>,
    ) -> Result<Identifier, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identifier.set_verified"))?;
        let verified = state.prepare_verify(identifier_type, value, at)?;
        state.apply_put(verified.clone());
        Ok(verified)
    }

    fn delete(
        &self,
        customer_id: CustomerId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Identifier, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identifier.delete"))?;
        let identifier = state.check_delete(customer_id, identifier_type, value)?;
        state.apply_delete(&identifier.key());
        Ok(identifier)
    }

    fn delete_for_customer(&self, customer_id: CustomerId) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identifier.delete_for_customer"))?;
        Ok(state.apply_delete_for_customer(customer_id))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identifier.count"))?;
        Ok(state.len())
    }
}

/// Thread-safe in-memory interaction store.
#[derive(Debug, Default)]
pub struct InMemoryInteractionStore {
    state: RwLock<InteractionIndex>,
}

impl InMemoryInteractionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InteractionStore for InMemoryInteractionStore {
    fn insert(&self, interaction: Interaction) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("interaction.insert"))?;
        state.check_insert(&interaction)?;
        state.apply_insert(interaction);
        Ok(())
    }

    fn get(&self, id: InteractionId) -> Result<Option<Interaction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("interaction.get"))?;
        Ok(state.get(id).cloned())
    }

    fn find_by_customer(&self, customer_id: CustomerId) -> Result<Vec<Interaction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("interaction.find_by_customer"))?;
        Ok(state.find_by_customer(customer_id))
    }

    fn delete_for_customer(&self, customer_id: CustomerId) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("interaction.delete_for_customer"))?;
        Ok(state.apply_delete_for_customer(customer_id))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("interaction.count"))?;
        Ok(state.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::bundle::TechnicalContext;
    use crate::interaction::{Attribution, InteractionKind};

    #[test]
    fn test_customer_insert_get_delete() {
        let store = InMemoryCustomerStore::new();
        let customer = Customer::new(Utc::now());
        let id = customer.id;

        store.insert(customer.clone()).unwrap();
        assert!(matches!(store.insert(customer), Err(StorageError::DuplicateKey(_))));
        assert_eq!(store.get(id).unwrap().unwrap().id, id);
        assert_eq!(store.count().unwrap(), 1);

        store.delete(id).unwrap();
        assert!(store.get(id).unwrap().is_none());
        assert!(matches!(store.delete(id), Err(StorageError::CustomerNotFound(_))));
    }

    #[test]
    fn test_modify_bumps_version_and_indexes_master() {
        let store = InMemoryCustomerStore::new();
        let customer = Customer::new(Utc::now());
        let id = customer.id;
        store.insert(customer).unwrap();

        let updated = store
            .modify(id, &mut |c: &mut Customer| {
                c.fill_master_phone("+15550100");
            })
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(
            store.find_by_master(IdentifierType::Phone, "+15550100").unwrap(),
            Some(id)
        );
        assert!(store.find_by_master(IdentifierType::DeviceId, "+15550100").unwrap().is_none());
    }

    #[test]
    fn test_modify_missing_customer() {
        let store = InMemoryCustomerStore::new();
        let err = store.modify(CustomerId::new(), &mut |_: &mut Customer| {}).unwrap_err();
        assert!(matches!(err, StorageError::CustomerNotFound(_)));
    }

    #[test]
    fn test_concurrent_modify_loses_no_increments() {
        let store = Arc::new(InMemoryCustomerStore::new());
        let customer = Customer::new(Utc::now());
        let id = customer.id;
        store.insert(customer).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.modify(id, &mut |c: &mut Customer| c.record_click()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let customer = store.get(id).unwrap().unwrap();
        assert_eq!(customer.total_clicks, 800);
        assert_eq!(customer.version, 801);
    }

    #[test]
    fn test_identifier_uniqueness() {
        let store = InMemoryIdentifierStore::new();
        let now = Utc::now();
        let a = CustomerId::new();
        let b = CustomerId::new();

        store
            .insert(Identifier::new(a, IdentifierType::Email, "a@x.com", true, false, now))
            .unwrap();
        let err = store
            .insert(Identifier::new(b, IdentifierType::Email, "a@x.com", true, false, now))
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateIdentifier { owner, .. } if owner == a));

        assert!(store.exists(a, IdentifierType::Email, "a@x.com").unwrap());
        assert!(!store.exists(b, IdentifierType::Email, "a@x.com").unwrap());
        assert_eq!(store.find_owner(IdentifierType::Email, "a@x.com").unwrap(), Some(a));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_identifier_insert_single_winner() {
        let store = Arc::new(InMemoryIdentifierStore::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .insert(Identifier::new(
                            CustomerId::new(),
                            IdentifierType::Email,
                            "race@x.com",
                            true,
                            false,
                            Utc::now(),
                        ))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_set_verified_and_delete_for_customer() {
        let store = InMemoryIdentifierStore::new();
        let now = Utc::now();
        let a = CustomerId::new();
        store
            .insert(Identifier::new(a, IdentifierType::Email, "a@x.com", true, false, now))
            .unwrap();
        store
            .insert(Identifier::new(a, IdentifierType::DeviceId, "d1", false, true, now))
            .unwrap();

        let verified = store.set_verified(IdentifierType::Email, "a@x.com", now).unwrap();
        assert!(verified.is_verified);
        assert!(store.get(IdentifierType::Email, "a@x.com").unwrap().unwrap().is_verified);

        let listed = store.list_for_customer(a).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identifier_type, IdentifierType::Email);

        assert_eq!(store.delete_for_customer(a).unwrap(), 2);
        assert!(store.find_owner(IdentifierType::DeviceId, "d1").unwrap().is_none());
        assert!(matches!(
            store.set_verified(IdentifierType::Email, "a@x.com", now),
            Err(StorageError::IdentifierNotFound { .. })
        ));
    }

    #[test]
    fn test_delete_single_claim_checks_owner() {
        let store = InMemoryIdentifierStore::new();
        let now = Utc::now();
        let a = CustomerId::new();
        store
            .insert(Identifier::new(a, IdentifierType::Email, "a@x.com", true, false, now))
            .unwrap();
        store
            .insert(Identifier::new(a, IdentifierType::ClickId, "c1", false, true, now))
            .unwrap();

        assert!(matches!(
            store.delete(CustomerId::new(), IdentifierType::ClickId, "c1"),
            Err(StorageError::IdentifierNotFound { .. })
        ));

        let removed = store.delete(a, IdentifierType::ClickId, "c1").unwrap();
        assert_eq!(removed.value, "c1");
        assert!(store.find_owner(IdentifierType::ClickId, "c1").unwrap().is_none());
        assert_eq!(store.list_for_customer(a).unwrap().len(), 1);

        // The value is free to claim again.
        store
            .insert(Identifier::new(CustomerId::new(), IdentifierType::ClickId, "c1", false, true, now))
            .unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_interactions_ordered_by_time() {
        let store = InMemoryInteractionStore::new();
        let customer_id = CustomerId::new();
        let now = Utc::now();
        let click = |at| {
            Interaction::new(
                customer_id,
                InteractionKind::Click {
                    click_id: None,
                    landing_url: None,
                    referrer: None,
                },
                Attribution::default(),
                TechnicalContext::default(),
                at,
            )
        };

        let later = click(now + chrono::Duration::minutes(1));
        let earlier = click(now);
        store.insert(later.clone()).unwrap();
        store.insert(earlier.clone()).unwrap();
        assert!(matches!(store.insert(earlier.clone()), Err(StorageError::DuplicateKey(_))));

        let journey = store.find_by_customer(customer_id).unwrap();
        assert_eq!(journey.iter().map(|i| i.id).collect::<Vec<_>>(), vec![earlier.id, later.id]);

        assert_eq!(store.delete_for_customer(customer_id).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 0);
    }
}
