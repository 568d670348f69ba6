//! Object index leases seen through the public file API.

use std::sync::Arc;

use proptest::prelude::*;
use uuid::Uuid;
use weft_comm::SoloComm;
use weft_connector::{Connector, ConnectorConfig, File, FIRST_USER_INDEX, OIDX_BATCH};
use weft_store::{InMemoryKvStore, StoreOp};
use weft_types::{ObjectClass, ObjectKind};

fn open(config: ConnectorConfig) -> (Arc<InMemoryKvStore>, File) {
    let pool = Uuid::new_v4();
    let store = Arc::new(InMemoryKvStore::with_pool(pool));
    let connector = Connector::new(ConnectorConfig { pool, ..config }, store.clone(), Arc::new(SoloComm)).unwrap();
    let file = connector.open_file("leases", true).unwrap();
    (store, file)
}

#[test]
fn first_index_skips_reserved_range() {
    let (_, file) = open(ConnectorConfig::default());
    assert_eq!(file.allocate_index(false).unwrap(), FIRST_USER_INDEX);
}

#[test]
fn store_is_asked_once_per_batch() {
    let (store, file) = open(ConnectorConfig::default());
    let per_lease = OIDX_BATCH - FIRST_USER_INDEX;
    for _ in 0..per_lease {
        file.allocate_index(false).unwrap();
    }
    assert_eq!(store.issued(StoreOp::AllocOids), 1);
    assert_eq!(file.allocate_index(false).unwrap(), OIDX_BATCH);
    assert_eq!(store.issued(StoreOp::AllocOids), 2);
}

#[test]
fn leases_are_kept_per_collectiveness() {
    let (store, file) = open(ConnectorConfig::default());
    let independent = file.allocate_index(false).unwrap();
    let collective = file.allocate_index(true).unwrap();
    assert_eq!(independent, FIRST_USER_INDEX);
    assert_eq!(collective, OIDX_BATCH);
    assert_eq!(store.issued(StoreOp::AllocOids), 2);
}

#[test]
fn generated_identifiers_carry_kind_and_class() {
    let config = ConnectorConfig {
        default_object_class: Some(ObjectClass::S2),
        ..ConnectorConfig::default()
    };
    let (_, file) = open(config);

    let oid = file.generate_oid(ObjectKind::Dataset, None, false).unwrap();
    assert_eq!(oid.kind(), ObjectKind::Dataset);
    assert_eq!(oid.class_id(), ObjectClass::S2.id());
    assert_eq!(oid.index(), FIRST_USER_INDEX);

    let oid = file.generate_oid(ObjectKind::Map, Some(ObjectClass::SX), false).unwrap();
    assert_eq!(oid.class_id(), ObjectClass::SX.id());
    assert_eq!(oid.index(), FIRST_USER_INDEX + 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn indices_strictly_increase(pattern in proptest::collection::vec(any::<bool>(), 1..40)) {
        let (_, file) = open(ConnectorConfig::default());
        let mut last = [None::<u64>; 2];
        for collective in pattern {
            let index = file.allocate_index(collective).unwrap();
            let slot = &mut last[usize::from(collective)];
            prop_assert!(index >= FIRST_USER_INDEX);
            prop_assert!(slot.map_or(true, |l| index > l));
            *slot = Some(index);
        }
    }
}
