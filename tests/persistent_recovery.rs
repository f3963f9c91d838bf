//! Crash recovery tests for persistent storage.
//!
//! These tests verify that the storage layer correctly handles:
//! - a WAL cut off mid-entry
//! - a crash between writing a snapshot and truncating the WAL
//! - writes continuing after recovery

#![cfg(feature = "persistent")]

use std::fs;

use leadgraph::config::ResolverConfig;
use leadgraph::ingest::LeadInput;
use leadgraph::storage::persistent::{open_database, PersistentConfig, PersistentStores};
use leadgraph::{CustomerStore, IdentifierBundle, IdentifierStore, IdentifierType, InteractionStore};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> PersistentStores {
    let config = PersistentConfig {
        sync_on_write: false,
        ..PersistentConfig::default()
    };
    open_database(dir, Some(config)).unwrap()
}

fn lead(stores: &PersistentStores, email: &str) {
    stores
        .service(ResolverConfig::default())
        .capture_lead(LeadInput {
            identifiers: IdentifierBundle::new().email(email),
            ..LeadInput::default()
        })
        .unwrap();
}

#[test]
fn torn_wal_tail_is_dropped_and_writes_continue() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("leadgraph.wal");

    {
        let stores = open(dir.path());
        for i in 0..5 {
            lead(&stores, &format!("u{i}@x.com"));
        }
    }

    // The last entry is the counter update of the fifth lead.
    let size = fs::metadata(&wal_path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(size - 3).unwrap();
    drop(file);

    {
        let stores = open(dir.path());
        assert_eq!(stores.customers.count().unwrap(), 5);
        assert_eq!(stores.identifiers.count().unwrap(), 5);
        assert_eq!(stores.interactions.count().unwrap(), 5);

        let svc = stores.service(ResolverConfig::default());
        let total: u64 = (0..5)
            .map(|i| {
                svc.find_customer(IdentifierType::Email, &format!("u{i}@x.com"))
                    .unwrap()
                    .unwrap()
                    .total_leads
            })
            .sum();
        assert_eq!(total, 4);

        lead(&stores, "u5@x.com");
    }

    let stores = open(dir.path());
    assert_eq!(stores.customers.count().unwrap(), 6);
    assert!(stores
        .identifiers
        .find_owner(IdentifierType::Email, "u5@x.com")
        .unwrap()
        .is_some());
}

#[test]
fn crash_before_wal_truncation_does_not_double_apply() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("leadgraph.wal");
    let backup = dir.path().join("wal.bak");

    {
        let stores = open(dir.path());
        for i in 0..3 {
            lead(&stores, &format!("u{i}@x.com"));
        }
    }
    fs::copy(&wal_path, &backup).unwrap();

    {
        let stores = open(dir.path());
        let result = stores.compact().unwrap();
        assert_eq!(result.rows, 9);
    }

    // Put the pre-compaction WAL back, as if truncation never happened.
    fs::copy(&backup, &wal_path).unwrap();

    let stores = open(dir.path());
    assert_eq!(stores.customers.count().unwrap(), 3);
    assert_eq!(stores.identifiers.count().unwrap(), 3);
    assert_eq!(stores.interactions.count().unwrap(), 3);

    let svc = stores.service(ResolverConfig::default());
    let customer = svc
        .find_customer(IdentifierType::Email, "u0@x.com")
        .unwrap()
        .unwrap();
    assert_eq!(customer.total_leads, 1);
    assert_eq!(svc.journey(customer.id).unwrap().len(), 1);
}

#[test]
fn state_survives_repeated_compaction() {
    let dir = tempdir().unwrap();

    for round in 0..3 {
        let stores = open(dir.path());
        lead(&stores, "same@x.com");
        lead(&stores, &format!("round{round}@x.com"));
        stores.compact().unwrap();
    }

    let stores = open(dir.path());
    assert_eq!(stores.customers.count().unwrap(), 4);
    let svc = stores.service(ResolverConfig::default());
    let same = svc
        .find_customer(IdentifierType::Email, "same@x.com")
        .unwrap()
        .unwrap();
    assert_eq!(same.total_leads, 3);
    assert_eq!(svc.journey(same.id).unwrap().len(), 3);

    // Sequence numbers keep increasing across compactions.
    let before = stores.wal_size();
    lead(&stores, "after@x.com");
    assert!(stores.wal_size() > before);
    drop(stores);

    let stores = open(dir.path());
    assert_eq!(stores.customers.count().unwrap(), 5);
}

#[test]
fn deletes_are_durable() {
    let dir = tempdir().unwrap();
    let id;
    {
        let stores = open(dir.path());
        lead(&stores, "gone@x.com");
        let svc = stores.service(ResolverConfig::default());
        id = svc
            .find_customer(IdentifierType::Email, "gone@x.com")
            .unwrap()
            .unwrap()
            .id;
        svc.delete_customer(id).unwrap();
    }

    let stores = open(dir.path());
    assert!(stores.customers.get(id).unwrap().is_none());
    assert_eq!(stores.identifiers.count().unwrap(), 0);
    assert_eq!(stores.interactions.count().unwrap(), 0);
    assert!(stores
        .customers
        .find_by_master(IdentifierType::Email, "gone@x.com")
        .unwrap()
        .is_none());
}
