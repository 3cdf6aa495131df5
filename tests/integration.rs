//! Integration tests for the versioned record store.

use std::sync::Arc;
use timetravel::{
    CancelToken, FieldMap, Mutations, RecordInput, SnapshotStore, StoreConfig, StoreError,
    VersionedRecordService,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    }
}

fn test_service(dir: &TempDir) -> VersionedRecordService {
    let store = SnapshotStore::create(test_config(dir)).unwrap();
    VersionedRecordService::new(Arc::new(store))
}

fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn version_numbers(service: &VersionedRecordService, id: i64) -> Vec<u64> {
    service
        .list_versions(&CancelToken::new(), id)
        .unwrap()
        .iter()
        .map(|v| v.version.0)
        .collect()
}

// --- Walkthrough of a record's life ---

#[test]
fn test_alice_walkthrough() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    // Create
    service
        .create_record(&cx, RecordInput::from_pairs(1, [("name", "alice")]))
        .unwrap();
    assert_eq!(service.get_record(&cx, 1).unwrap().data, fields(&[("name", "alice")]));

    // Set one field, add another
    let record = service
        .update_record(&cx, 1, &Mutations::new().set("name", "alicia").set("age", "30"))
        .unwrap();
    assert_eq!(record.data, fields(&[("name", "alicia"), ("age", "30")]));
    assert_eq!(version_numbers(&service, 1), vec![2, 1]);
    assert_eq!(
        service.get_record_version(&cx, 1, 1).unwrap().data,
        fields(&[("name", "alice")])
    );

    // Delete a field
    let record = service
        .update_record(&cx, 1, &Mutations::new().delete("age"))
        .unwrap();
    assert_eq!(record.data, fields(&[("name", "alicia")]));
    assert_eq!(version_numbers(&service, 1), vec![3, 2, 1]);
}

#[test]
fn test_unknown_record() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);

    let result = service.get_record(&CancelToken::new(), 999);
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[test]
fn test_create_twice_keeps_history() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    service
        .create_record(&cx, RecordInput::from_pairs(1, [("name", "alice")]))
        .unwrap();
    service
        .update_record(&cx, 1, &Mutations::new().set("name", "alicia"))
        .unwrap();

    let result = service.create_record(&cx, RecordInput::from_pairs(1, [("name", "mallory")]));
    assert!(matches!(result, Err(StoreError::AlreadyExists(_))));

    assert_eq!(service.get_record(&cx, 1).unwrap().data, fields(&[("name", "alicia")]));
    assert_eq!(version_numbers(&service, 1), vec![2, 1]);
    assert_eq!(
        service.get_record_version(&cx, 1, 1).unwrap().data,
        fields(&[("name", "alice")])
    );
}

// --- Invariants ---

#[test]
fn test_create_produces_single_version() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();
    let data = fields(&[("a", "1"), ("b", "2")]);

    service
        .create_record(&cx, RecordInput::new(17, data.clone()))
        .unwrap();

    assert_eq!(service.get_record(&cx, 17).unwrap().data, data);
    assert_eq!(service.get_record_version(&cx, 17, 1).unwrap().data, data);
    assert_eq!(version_numbers(&service, 17), vec![1]);
}

#[test]
fn test_latest_version_matches_current_state() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    service
        .create_record(&cx, RecordInput::from_pairs(4, [("step", "0")]))
        .unwrap();

    for step in 1..=20 {
        let mut mutations = Mutations::new().set("step", step.to_string());
        if step % 3 == 0 {
            mutations = mutations.delete(format!("extra{}", step - 1));
        } else {
            mutations = mutations.set(format!("extra{}", step), "x");
        }
        let record = service.update_record(&cx, 4, &mutations).unwrap();

        let versions = service.list_versions(&cx, 4).unwrap();
        let newest = versions[0].version.0 as i64;
        assert_eq!(newest, step + 1);
        assert_eq!(service.get_record(&cx, 4).unwrap(), record);
        assert_eq!(service.get_record_version(&cx, 4, newest).unwrap(), record);
    }
}

#[test]
fn test_repeated_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    service
        .create_record(&cx, RecordInput::from_pairs(2, [("a", "1"), ("b", "2")]))
        .unwrap();

    let once = service
        .update_record(&cx, 2, &Mutations::new().delete("b"))
        .unwrap();
    let twice = service
        .update_record(&cx, 2, &Mutations::new().delete("b"))
        .unwrap();

    assert_eq!(once.data, twice.data);
    assert_eq!(twice.data, fields(&[("a", "1")]));
    // Each update still commits a version.
    assert_eq!(version_numbers(&service, 2), vec![3, 2, 1]);
}

#[test]
fn test_history_is_not_rewritten() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    let mut expected = vec![fields(&[("n", "0")])];
    service
        .create_record(&cx, RecordInput::new(9, expected[0].clone()))
        .unwrap();

    for n in 1..10 {
        let record = service
            .update_record(&cx, 9, &Mutations::new().set("n", n.to_string()))
            .unwrap();
        expected.push(record.data);
    }

    for (i, data) in expected.iter().enumerate() {
        let version = i as i64 + 1;
        assert_eq!(&service.get_record_version(&cx, 9, version).unwrap().data, data);
    }
}

#[test]
fn test_records_are_independent() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    service
        .create_record(&cx, RecordInput::from_pairs(1, [("who", "one")]))
        .unwrap();
    service
        .create_record(&cx, RecordInput::from_pairs(2, [("who", "two")]))
        .unwrap();
    service
        .update_record(&cx, 1, &Mutations::new().set("who", "uno"))
        .unwrap();

    assert_eq!(version_numbers(&service, 1), vec![2, 1]);
    assert_eq!(version_numbers(&service, 2), vec![1]);
    assert_eq!(service.get_record(&cx, 2).unwrap().data["who"], "two");
}

#[test]
fn test_empty_record() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    service
        .create_record(&cx, RecordInput::new(5, FieldMap::new()))
        .unwrap();
    assert!(service.get_record(&cx, 5).unwrap().data.is_empty());

    let record = service
        .update_record(&cx, 5, &Mutations::new())
        .unwrap();
    assert!(record.data.is_empty());
    assert_eq!(version_numbers(&service, 5), vec![2, 1]);
}

// --- Persistence ---

#[test]
fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let cx = CancelToken::new();

    {
        let service = test_service(&dir);
        service
            .create_record(&cx, RecordInput::from_pairs(1, [("name", "alice")]))
            .unwrap();
        service
            .update_record(&cx, 1, &Mutations::new().set("name", "alicia").set("age", "30"))
            .unwrap();
        service
            .update_record(&cx, 1, &Mutations::new().delete("age"))
            .unwrap();
    }

    let store = SnapshotStore::open(test_config(&dir)).unwrap();
    let service = VersionedRecordService::new(Arc::new(store));

    assert_eq!(service.get_record(&cx, 1).unwrap().data, fields(&[("name", "alicia")]));
    assert_eq!(version_numbers(&service, 1), vec![3, 2, 1]);
    assert_eq!(
        service.get_record_version(&cx, 1, 2).unwrap().data,
        fields(&[("name", "alicia"), ("age", "30")])
    );

    let record = service
        .update_record(&cx, 1, &Mutations::new().set("city", "oslo"))
        .unwrap();
    assert_eq!(record.data, fields(&[("name", "alicia"), ("city", "oslo")]));
    assert_eq!(version_numbers(&service, 1), vec![4, 3, 2, 1]);
}

#[test]
fn test_row_timestamps() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    service
        .create_record(&cx, RecordInput::from_pairs(1, [("a", "1")]))
        .unwrap();
    let created = service.store().read_row(timetravel::RecordId(1)).unwrap();
    assert_eq!(created.created_at, created.updated_at);

    service
        .update_record(&cx, 1, &Mutations::new().set("a", "2"))
        .unwrap();
    let updated = service.store().read_row(timetravel::RecordId(1)).unwrap();
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.updated_at >= created.updated_at);
    assert_eq!(updated.latest, timetravel::Version(2));
}

#[test]
fn test_stats() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let cx = CancelToken::new();

    for id in 1..=3 {
        service
            .create_record(&cx, RecordInput::from_pairs(id, [("id", id.to_string())]))
            .unwrap();
    }
    service
        .update_record(&cx, 2, &Mutations::new().set("x", "y"))
        .unwrap();

    let stats = service.store().stats();
    assert_eq!(stats.record_count, 3);
    assert_eq!(stats.version_count, 4);
    assert!(stats.log_size_bytes > 0);
}
