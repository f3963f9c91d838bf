//! In-memory indexes shared by the storage backends.
//!
//! Each index splits mutations into a fallible `check_*` / `prepare_*` step
//! and an infallible `apply_*` step. The persistent backend logs to the WAL
//! between the two, so a failed check never reaches the log and a logged
//! entry always applies cleanly on replay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::customer::{Customer, CustomerId};
use crate::identifier::{Identifier, IdentifierKey, IdentifierType};
use crate::interaction::{Interaction, InteractionId};
use crate::storage::traits::StorageError;

#[derive(Debug, Default, Clone)]
pub(crate) struct CustomerIndex {
    by_id: HashMap<CustomerId, Customer>,
    by_email: HashMap<String, CustomerId>,
    by_phone: HashMap<String, CustomerId>,
}

impl CustomerIndex {
    pub(crate) fn check_insert(&self, customer: &Customer) -> Result<(), StorageError> {
        if self.by_id.contains_key(&customer.id) {
            return Err(StorageError::DuplicateKey(customer.id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn apply_insert(&mut self, customer: Customer) {
        self.index_masters(&customer);
        self.by_id.insert(customer.id, customer);
    }

    pub(crate) fn get(&self, id: CustomerId) -> Option<&Customer> {
        self.by_id.get(&id)
    }

    /// Clone of the stored customer with `apply` run and bookkeeping bumped.
    pub(crate) fn prepare_modify(
        &self,
        id: CustomerId,
        apply: &mut dyn FnMut(&mut Customer),
        now: DateTime<Utc>,
    ) -> Result<Customer, StorageError> {
        let prev = self.by_id.get(&id).ok_or(StorageError::CustomerNotFound(id))?;
        let mut next = prev.clone();
        apply(&mut next);
        next.id = id;
        next.created_at = prev.created_at;
        next.version = prev.version + 1;
        if now > next.updated_at {
            next.updated_at = now;
        }
        Ok(next)
    }

    /// Replace a stored customer, keeping the master indexes in sync.
    pub(crate) fn apply_put(&mut self, customer: Customer) {
        if let Some(prev) = self.by_id.remove(&customer.id) {
            self.unindex_masters(&prev);
        }
        self.apply_insert(customer);
    }

    pub(crate) fn apply_delete(&mut self, id: CustomerId) -> Option<Customer> {
        let prev = self.by_id.remove(&id)?;
        self.unindex_masters(&prev);
        Some(prev)
    }

    pub(crate) fn find_by_master(&self, identifier_type: IdentifierType, value: &str) -> Option<CustomerId> {
        match identifier_type {
            IdentifierType::Email => self.by_email.get(value).copied(),
            IdentifierType::Phone => self.by_phone.get(value).copied(),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Customer> {
        self.by_id.values()
    }

    // First holder keeps a master value; the identifier store is what
    // guarantees there is only ever one.
    fn index_masters(&mut self, customer: &Customer) {
        if let Some(email) = customer.master_email.as_ref() {
            self.by_email.entry(email.clone()).or_insert(customer.id);
        }
        if let Some(phone) = customer.master_phone.as_ref() {
            self.by_phone.entry(phone.clone()).or_insert(customer.id);
        }
    }

    fn unindex_masters(&mut self, customer: &Customer) {
        if let Some(email) = customer.master_email.as_ref() {
            if self.by_email.get(email) == Some(&customer.id) {
                self.by_email.remove(email);
            }
        }
        if let Some(phone) = customer.master_phone.as_ref() {
            if self.by_phone.get(phone) == Some(&customer.id) {
                self.by_phone.remove(phone);
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct IdentifierIndex {
    by_key: HashMap<IdentifierKey, Identifier>,
    by_customer: HashMap<CustomerId, Vec<IdentifierKey>>,
}

impl IdentifierIndex {
    pub(crate) fn check_insert(&self, identifier: &Identifier) -> Result<(), StorageError> {
        let key = identifier.key();
        match self.by_key.get(&key) {
            None => Ok(()),
            Some(existing) if existing.customer_id == identifier.customer_id => {
                Err(StorageError::DuplicateKey(key.to_string()))
            }
            Some(existing) => Err(StorageError::DuplicateIdentifier {
                identifier_type: key.identifier_type,
                value: key.value,
                owner: existing.customer_id,
            }),
        }
    }

    pub(crate) fn apply_insert(&mut self, identifier: Identifier) {
        let key = identifier.key();
        self.by_customer
            .entry(identifier.customer_id)
            .or_default()
            .push(key.clone());
        self.by_key.insert(key, identifier);
    }

    pub(crate) fn get(&self, identifier_type: IdentifierType, value: &str) -> Option<&Identifier> {
        self.by_key.get(&IdentifierKey::new(identifier_type, value))
    }

    pub(crate) fn owner(&self, identifier_type: IdentifierType, value: &str) -> Option<CustomerId> {
        self.get(identifier_type, value).map(|i| i.customer_id)
    }

    pub(crate) fn first_owner(&self, keys: &[(IdentifierType, String)]) -> Option<CustomerId> {
        keys.iter().find_map(|(t, v)| self.owner(*t, v))
    }

    pub(crate) fn list_for_customer(&self, customer_id: CustomerId) -> Vec<Identifier> {
        self.by_customer
            .get(&customer_id)
            .map(|keys| keys.iter().filter_map(|k| self.by_key.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    /// Verified clone of a stored claim.
    pub(crate) fn prepare_verify(
        &self,
        identifier_type: IdentifierType,
        value: &str,
        at: DateTime<Utc>,
    ) -> Result<Identifier, StorageError> {
        let mut identifier = self
            .get(identifier_type, value)
            .cloned()
            .ok_or_else(|| StorageError::IdentifierNotFound {
                identifier_type,
                value: value.to_string(),
            })?;
        identifier.verify(at);
        Ok(identifier)
    }

    /// Replace a stored claim in place (verification only; owner never changes).
    pub(crate) fn apply_put(&mut self, identifier: Identifier) {
        if let Some(slot) = self.by_key.get_mut(&identifier.key()) {
            if slot.customer_id == identifier.customer_id {
                *slot = identifier;
            }
        }
    }

    /// The claim `customer_id` owns under `(type, value)`.
    pub(crate) fn check_delete(
        &self,
        customer_id: CustomerId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<Identifier, StorageError> {
        self.get(identifier_type, value)
            .filter(|i| i.customer_id == customer_id)
            .cloned()
            .ok_or_else(|| StorageError::IdentifierNotFound {
                identifier_type,
                value: value.to_string(),
            })
    }

    pub(crate) fn apply_delete(&mut self, key: &IdentifierKey) -> Option<Identifier> {
        let removed = self.by_key.remove(key)?;
        if let Some(keys) = self.by_customer.get_mut(&removed.customer_id) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_customer.remove(&removed.customer_id);
            }
        }
        Some(removed)
    }

    pub(crate) fn apply_delete_for_customer(&mut self, customer_id: CustomerId) -> usize {
        let Some(keys) = self.by_customer.remove(&customer_id) else {
            return 0;
        };
        keys.iter().filter(|k| self.by_key.remove(*k).is_some()).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Identifier> {
        self.by_key.values()
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct InteractionIndex {
    by_id: HashMap<InteractionId, Interaction>,
    by_customer: HashMap<CustomerId, Vec<InteractionId>>,
}

impl InteractionIndex {
    pub(crate) fn check_insert(&self, interaction: &Interaction) -> Result<(), StorageError> {
        if self.by_id.contains_key(&interaction.id) {
            return Err(StorageError::DuplicateKey(interaction.id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn apply_insert(&mut self, interaction: Interaction) {
        self.by_customer
            .entry(interaction.customer_id)
            .or_default()
            .push(interaction.id);
        self.by_id.insert(interaction.id, interaction);
    }

    pub(crate) fn get(&self, id: InteractionId) -> Option<&Interaction> {
        self.by_id.get(&id)
    }

    pub(crate) fn find_by_customer(&self, customer_id: CustomerId) -> Vec<Interaction> {
        let mut out: Vec<Interaction> = self
            .by_customer
            .get(&customer_id)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
            .unwrap_or_default();
        // Stable sort: ties keep insertion order.
        out.sort_by_key(|i| i.occurred_at);
        out
    }

    pub(crate) fn apply_delete_for_customer(&mut self, customer_id: CustomerId) -> usize {
        let Some(ids) = self.by_customer.remove(&customer_id) else {
            return 0;
        };
        ids.iter().filter(|id| self.by_id.remove(*id).is_some()).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Interaction> {
        self.by_id.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_check_distinguishes_owner() {
        let now = Utc::now();
        let a = CustomerId::new();
        let b = CustomerId::new();
        let mut index = IdentifierIndex::default();
        index.apply_insert(Identifier::new(a, IdentifierType::Email, "a@x.com", true, false, now));

        let same = Identifier::new(a, IdentifierType::Email, "a@x.com", false, false, now);
        assert!(matches!(index.check_insert(&same), Err(StorageError::DuplicateKey(_))));

        let other = Identifier::new(b, IdentifierType::Email, "a@x.com", true, false, now);
        match index.check_insert(&other) {
            Err(StorageError::DuplicateIdentifier { owner, .. }) => assert_eq!(owner, a),
            other => panic!("expected DuplicateIdentifier, got {other:?}"),
        }

        let different_type = Identifier::new(b, IdentifierType::DeviceId, "a@x.com", false, true, now);
        assert!(index.check_insert(&different_type).is_ok());
    }

    #[test]
    fn test_master_index_follows_put_and_delete() {
        let now = Utc::now();
        let mut index = CustomerIndex::default();
        let customer = Customer::new(now);
        let id = customer.id;
        index.apply_insert(customer);
        assert!(index.find_by_master(IdentifierType::Email, "a@x.com").is_none());

        let updated = index
            .prepare_modify(
                id,
                &mut |c: &mut Customer| {
                    c.fill_master_email("a@x.com");
                },
                now,
            )
            .unwrap();
        assert_eq!(updated.version, 2);
        index.apply_put(updated);
        assert_eq!(index.find_by_master(IdentifierType::Email, "a@x.com"), Some(id));

        index.apply_delete(id);
        assert!(index.find_by_master(IdentifierType::Email, "a@x.com").is_none());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_first_owner_scans_in_order() {
        let now = Utc::now();
        let a = CustomerId::new();
        let b = CustomerId::new();
        let mut index = IdentifierIndex::default();
        index.apply_insert(Identifier::new(a, IdentifierType::SessionId, "s1", false, true, now));
        index.apply_insert(Identifier::new(b, IdentifierType::DeviceId, "d1", false, true, now));

        let keys = vec![
            (IdentifierType::ClickId, "c-unknown".to_string()),
            (IdentifierType::DeviceId, "d1".to_string()),
            (IdentifierType::SessionId, "s1".to_string()),
        ];
        assert_eq!(index.first_owner(&keys), Some(b));
    }
}
