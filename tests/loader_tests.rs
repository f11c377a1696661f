use std::fs;
use memquery_engine::{
    store::{fixture, loader, RowStore},
    utils::{
        error::{EngineError, LoadError, StoreError},
        types::{RowId, Value},
    },
};

fn store() -> RowStore {
    let store = RowStore::new();
    fixture::create_tables(&store).unwrap();
    store
}

#[test]
fn test_load_json_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    fs::write(
        &path,
        r#"{
            "Member": [
                {"id": 1, "username": "member1", "age": 10, "team_id": 1},
                {"username": "guest", "age": 5}
            ],
            "Team": [{"id": 1, "name": "teamA"}],
            "Club": [{"id": 1}]
        }"#,
    )
    .unwrap();

    let store = store();
    assert_eq!(loader::load_json(&store, &path).unwrap(), 3);

    let guest = store.get(fixture::MEMBER, RowId(2)).unwrap().unwrap();
    assert_eq!(guest.values[1], Value::from("guest"));
    assert_eq!(guest.values[3], Value::Null);
    assert_eq!(store.row_count(fixture::TEAM).unwrap(), 1);
}

#[test]
fn test_load_json_rejects_malformed_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    fs::write(&path, r#"["not", "tables"]"#).unwrap();

    match loader::load_json(&store(), &path) {
        Err(EngineError::Load(LoadError::Parse { message, .. })) => assert!(message.contains("top level")),
        other => panic!("Expected Parse error, got {:?}", other),
    }
}

#[test]
fn test_load_json_unknown_column() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    fs::write(&path, r#"{"Team": [{"name": "teamA", "city": "Seoul"}]}"#).unwrap();

    match loader::load_json(&store(), &path) {
        Err(EngineError::Store(StoreError::UnknownColumn { column, .. })) => assert_eq!(column, "city"),
        other => panic!("Expected UnknownColumn error, got {:?}", other),
    }
}

#[test]
fn test_load_csv_dir() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("Member.csv"),
        "id,username,age,team_id\n1,member1,10,2\n2,,20,\n",
    )
    .unwrap();
    fs::write(dir.path().join("Team.csv"), "id,name\n2,teamB\n").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let store = store();
    assert_eq!(loader::load_path(&store, dir.path()).unwrap(), 3);

    let first = store.get(fixture::MEMBER, RowId(1)).unwrap().unwrap();
    assert_eq!(first.values[3], Value::Integer(2));
    let second = store.get(fixture::MEMBER, RowId(2)).unwrap().unwrap();
    assert_eq!(second.values[1], Value::Null);
    assert_eq!(second.values[3], Value::Null);
}

#[test]
fn test_load_csv_bad_integer() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Member.csv"), "username,age\nmember1,ten\n").unwrap();

    match loader::load_csv_dir(&store(), dir.path()) {
        Err(EngineError::Load(LoadError::Parse { message, .. })) => {
            assert!(message.contains("Member.age"));
            assert!(message.contains("not an integer"));
        }
        other => panic!("Expected Parse error, got {:?}", other),
    }
}

#[test]
fn test_load_path_rejects_unknown_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.xml");
    fs::write(&path, "<data/>").unwrap();

    match loader::load_path(&store(), &path) {
        Err(EngineError::Load(LoadError::UnsupportedSource(source))) => assert!(source.ends_with("data.xml")),
        other => panic!("Expected UnsupportedSource error, got {:?}", other),
    }
}

#[test]
fn test_load_missing_file() {
    match loader::load_json(&store(), "/nonexistent/data.json") {
        Err(EngineError::Load(LoadError::Io { path, .. })) => assert!(path.contains("nonexistent")),
        other => panic!("Expected Io error, got {:?}", other),
    }
}
