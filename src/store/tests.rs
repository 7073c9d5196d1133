use super::*;
use tempfile::TempDir;

fn record(namespace: &str, name: &str) -> Record {
    let mut record = Record::new(namespace, name);
    record.set_field("user-id", "u-1");
    record.labels.insert("kind".to_string(), "token".to_string());
    record
}

#[test]
fn create_assigns_identity_and_rejects_duplicates() {
    let store = SqliteRecordStore::in_memory().unwrap();

    let created = store.create(record("tokens", "t1")).unwrap();
    assert!(!created.uid.is_empty());
    assert_eq!(created.resource_version, 1);

    let err = store.create(record("tokens", "t1")).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));

    // Same name in another namespace is a different record.
    assert!(store.create(record("passwords", "t1")).is_ok());
}

#[test]
fn get_reads_back_every_field() {
    let store = SqliteRecordStore::in_memory().unwrap();
    let mut input = record("tokens", "t1");
    input.annotations.insert("note".to_string(), "x".to_string());
    input.owner = Some(OwnerReference {
        kind: "User".to_string(),
        name: "u-1".to_string(),
        uid: "abc".to_string(),
    });
    let created = store.create(input).unwrap();

    for mode in [ReadMode::Cached, ReadMode::Consistent] {
        let fetched = store.get("tokens", "t1", mode).unwrap();
        assert_eq!(fetched, created);
    }

    let err = store.get("tokens", "missing", ReadMode::Consistent).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn update_with_stale_version_conflicts() {
    let store = SqliteRecordStore::in_memory().unwrap();
    let created = store.create(record("tokens", "t1")).unwrap();

    let mut first = created.clone();
    first.set_field("enabled", "false");
    let updated = store.update(first).unwrap();
    assert_eq!(updated.resource_version, 2);
    assert_eq!(updated.uid, created.uid);

    let mut stale = created;
    stale.set_field("enabled", "true");
    let err = store.update(stale).unwrap_err();
    assert!(err.is_conflict());

    let current = store.get("tokens", "t1", ReadMode::Consistent).unwrap();
    assert_eq!(current.field("enabled"), Some("false"));
}

#[test]
fn patch_replaces_data_and_annotations_together() {
    let store = SqliteRecordStore::in_memory().unwrap();
    store.create(record("tokens", "t1")).unwrap();

    let patched = store
        .patch(
            "tokens",
            "t1",
            &RecordPatch::default()
                .data("hash", "$3:1:a:b")
                .annotation("algorithm", "sha3"),
        )
        .unwrap();

    assert_eq!(patched.field("hash"), Some("$3:1:a:b"));
    assert_eq!(patched.field("user-id"), Some("u-1"));
    assert_eq!(patched.annotations.get("algorithm").map(String::as_str), Some("sha3"));
    assert_eq!(patched.resource_version, 2);

    let err = store
        .patch("tokens", "missing", &RecordPatch::default())
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn delete_removes_record_from_both_read_paths() {
    let store = SqliteRecordStore::in_memory().unwrap();
    store.create(record("tokens", "t1")).unwrap();

    store.delete("tokens", "t1").unwrap();
    assert!(store.get("tokens", "t1", ReadMode::Cached).unwrap_err().is_not_found());
    assert!(store.get("tokens", "t1", ReadMode::Consistent).unwrap_err().is_not_found());
    assert!(store.delete("tokens", "t1").unwrap_err().is_not_found());
}

#[test]
fn list_filters_by_namespace_and_labels() {
    let store = SqliteRecordStore::in_memory().unwrap();
    store.create(record("tokens", "b")).unwrap();
    store.create(record("tokens", "a")).unwrap();
    let mut other = record("tokens", "c");
    other.labels.insert("kind".to_string(), "session".to_string());
    store.create(other).unwrap();
    store.create(record("elsewhere", "d")).unwrap();

    for mode in [ReadMode::Cached, ReadMode::Consistent] {
        let all = store.list("tokens", &LabelSelector::everything(), mode).unwrap();
        let names: Vec<_> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let tokens = store
            .list("tokens", &LabelSelector::eq("kind", "token"), mode)
            .unwrap();
        assert_eq!(tokens.len(), 2);
    }
}

#[test]
fn second_instance_cache_lags_until_reloaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("records.db");

    let writer = SqliteRecordStore::open(&path).unwrap();
    let reader = SqliteRecordStore::open(&path).unwrap();

    writer.create(record("tokens", "t1")).unwrap();

    assert!(reader.get("tokens", "t1", ReadMode::Cached).unwrap_err().is_not_found());
    assert!(reader.get("tokens", "t1", ReadMode::Consistent).is_ok());

    reader.reload_cache().unwrap();
    assert!(reader.get("tokens", "t1", ReadMode::Cached).is_ok());
}

#[tokio::test]
async fn refresh_replays_writes_from_another_instance() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("records.db");

    let writer = SqliteRecordStore::open(&path).unwrap();
    let reader = SqliteRecordStore::open(&path).unwrap();
    let mut watch = reader.watch("tokens");

    writer.create(record("tokens", "t1")).unwrap();
    assert_eq!(reader.refresh().unwrap(), 1);
    assert!(reader.get("tokens", "t1", ReadMode::Cached).is_ok());
    let added = watch.next().await.unwrap().unwrap();
    assert!(matches!(added, RecordEvent::Added(ref r) if r.name == "t1"));

    writer
        .patch("tokens", "t1", &RecordPatch::default().data("enabled", "false"))
        .unwrap();
    assert_eq!(reader.refresh().unwrap(), 1);
    let modified = watch.next().await.unwrap().unwrap();
    assert!(matches!(modified, RecordEvent::Modified(ref r) if r.field("enabled") == Some("false")));

    writer.delete("tokens", "t1").unwrap();
    assert_eq!(reader.refresh().unwrap(), 1);
    assert!(reader.get("tokens", "t1", ReadMode::Cached).unwrap_err().is_not_found());
    let deleted = watch.next().await.unwrap().unwrap();
    assert!(matches!(deleted, RecordEvent::Deleted(_)));

    // Nothing new, and the instance's own writes are already cached.
    assert_eq!(reader.refresh().unwrap(), 0);
    reader.create(record("tokens", "t2")).unwrap();
    assert_eq!(reader.refresh().unwrap(), 0);
}

#[tokio::test]
async fn watch_delivers_events_for_its_namespace_only() {
    let store = SqliteRecordStore::in_memory().unwrap();
    let mut watch = store.watch("tokens");

    store.create(record("elsewhere", "x")).unwrap();
    store.create(record("tokens", "t1")).unwrap();
    store
        .patch("tokens", "t1", &RecordPatch::default().data("enabled", "false"))
        .unwrap();
    store.delete("tokens", "t1").unwrap();

    let added = watch.next().await.unwrap().unwrap();
    assert!(matches!(added, RecordEvent::Added(ref r) if r.name == "t1"));
    let modified = watch.next().await.unwrap().unwrap();
    assert!(matches!(modified, RecordEvent::Modified(ref r) if r.field("enabled") == Some("false")));
    let deleted = watch.next().await.unwrap().unwrap();
    assert!(matches!(deleted, RecordEvent::Deleted(_)));
}

#[tokio::test]
async fn watch_ends_when_store_is_dropped() {
    let store = SqliteRecordStore::in_memory().unwrap();
    let mut watch = store.watch("tokens");
    drop(store);
    assert!(watch.next().await.is_none());
}

#[test]
fn selector_matches_subset_of_labels() {
    let mut labels = BTreeMap::new();
    labels.insert("a".to_string(), "1".to_string());
    labels.insert("b".to_string(), "2".to_string());

    assert!(LabelSelector::everything().matches(&labels));
    assert!(LabelSelector::eq("a", "1").matches(&labels));
    assert!(LabelSelector::eq("a", "1").and("b", "2").matches(&labels));
    assert!(!LabelSelector::eq("a", "2").matches(&labels));
    assert!(!LabelSelector::eq("c", "1").matches(&labels));
}
