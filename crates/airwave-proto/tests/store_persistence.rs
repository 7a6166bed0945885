//! End-to-end startup path: legacy storage document on disk → migrations →
//! store load over the bundled catalog → mutations → reopen.
use std::sync::Arc;

use airwave_proto::catalog::{parse_catalog, BUNDLED_CATALOG};
use airwave_proto::migrate;
use airwave_proto::station::{StationFields, StreamsInput};
use airwave_proto::storage::{JsonFileStorage, Storage};
use airwave_proto::store::StationStore;
use serde_json::json;

async fn open_store(path: &std::path::Path) -> StationStore {
    let storage = Arc::new(JsonFileStorage::open(path).await.unwrap());
    migrate::run(&*storage).await.unwrap();
    let catalog = parse_catalog(BUNDLED_CATALOG).unwrap();
    StationStore::load(storage, catalog, 80).await.unwrap()
}

#[tokio::test]
async fn legacy_document_is_migrated_and_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");
    std::fs::write(
        &path,
        json!({
            "hidden": {"dronezone": 1},
            "volume": 42,
            "favorites": ["fip", "ghost"],
            "last": "groovesalad",
            "stations": {
                "1700000000000": {"title": "Pirate", "streams": ["http://pirate/a", "http://pirate/b"]}
            }
        })
        .to_string(),
    )
    .unwrap();

    let store = open_store(&path).await;

    assert!(store.get_by_name("dronezone").unwrap().hidden);
    assert_eq!(store.volume(), 42);
    assert_eq!(store.favorites(), ["fip".to_string()]);
    assert_eq!(store.get_last().map(|s| s.name.as_str()), Some("groovesalad"));
    let pirate = store.get_by_name("1700000000000").unwrap();
    assert!(pirate.is_user());
    assert_eq!(pirate.stream_key(), Some("0"));

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["hidden"], json!(["dronezone"]));
    assert_eq!(on_disk["schema_version"], json!(migrate::SCHEMA_VERSION));
}

#[tokio::test]
async fn mutations_are_durable_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let added = {
        let mut store = open_store(&path).await;
        store.like("radioparadise").await.unwrap();
        store.set_last("fip").await.unwrap();
        store.set_volume(0).await.unwrap();
        store.delete_station("nts1").await.unwrap();
        store
            .add_user_station(StationFields {
                name: None,
                title: "Kitchen radio".into(),
                url: None,
                image: None,
                streams: StreamsInput::List(vec!["http://kitchen/stream".into()]),
            })
            .await
            .unwrap()
    };

    let store = open_store(&path).await;
    assert!(store.is_favorite("radioparadise"));
    assert_eq!(store.last_name(), Some("fip"));
    assert_eq!(store.volume(), 0);
    assert_eq!(store.previous_volume(), 80);
    assert!(store.get_by_name("nts1").unwrap().hidden);
    assert_eq!(
        store.get_by_name(&added.name).map(|s| s.title.as_str()),
        Some("Kitchen radio")
    );

    // A second pass over migrations must not touch an up-to-date document.
    let storage = JsonFileStorage::open(&path).await.unwrap();
    assert_eq!(
        migrate::run(&storage).await.unwrap(),
        migrate::SCHEMA_VERSION
    );
    assert!(storage.get("stations").await.unwrap().is_some());
}
