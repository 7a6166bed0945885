//! Storage schema migrations, run once at startup before the store loads.
use anyhow::Context as _;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::storage::Storage;
use crate::store::{DEFAULT_VOLUME, KEY_FAVORITES, KEY_HIDDEN, KEY_STATIONS, KEY_VOLUME};

pub const KEY_SCHEMA_VERSION: &str = "schema_version";

/// Version written after all migrations ran.
pub const SCHEMA_VERSION: u64 = 2;

/// Bring storage up to `SCHEMA_VERSION`.  Returns the version found.
pub async fn run(storage: &dyn Storage) -> anyhow::Result<u64> {
    let found = storage
        .get(KEY_SCHEMA_VERSION)
        .await?
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    if found >= SCHEMA_VERSION {
        return Ok(found);
    }

    if found < 1 {
        normalize_legacy_shapes(storage)
            .await
            .context("migration to v1 failed")?;
        info!("migrate: storage upgraded to v1");
    }
    if found < 2 {
        index_user_stream_lists(storage)
            .await
            .context("migration to v2 failed")?;
        info!("migrate: storage upgraded to v2");
    }

    storage.set(KEY_SCHEMA_VERSION, json!(SCHEMA_VERSION)).await?;
    Ok(found)
}

/// v1: hidden `{name: 1}` → `[name]`, scalar volume → `{current, previous}`,
/// non-list favorites → `[]`.
async fn normalize_legacy_shapes(storage: &dyn Storage) -> anyhow::Result<()> {
    if let Some(Value::Object(map)) = storage.get(KEY_HIDDEN).await? {
        let names: Vec<String> = map.keys().cloned().collect();
        storage.set(KEY_HIDDEN, json!(names)).await?;
    }

    match storage.get(KEY_VOLUME).await? {
        Some(Value::Number(n)) => {
            let v = n.as_f64().unwrap_or(DEFAULT_VOLUME as f64).clamp(0.0, 100.0).round() as u8;
            storage
                .set(KEY_VOLUME, json!({ "current": v, "previous": v }))
                .await?;
        }
        Some(Value::Object(map)) if map.contains_key("last") => {
            // `{current, last}` from older installs
            let current = map.get("current").and_then(Value::as_u64).unwrap_or(DEFAULT_VOLUME as u64);
            let previous = map.get("last").and_then(Value::as_u64).unwrap_or(DEFAULT_VOLUME as u64);
            storage
                .set(
                    KEY_VOLUME,
                    json!({ "current": current.min(100), "previous": previous.min(100) }),
                )
                .await?;
        }
        _ => {}
    }

    match storage.get(KEY_FAVORITES).await? {
        None | Some(Value::Array(_)) => {}
        Some(_) => storage.set(KEY_FAVORITES, json!([])).await?,
    }
    Ok(())
}

/// v2: user stations whose `streams` is a list get index-keyed maps.
async fn index_user_stream_lists(storage: &dyn Storage) -> anyhow::Result<()> {
    let Some(Value::Object(mut stations)) = storage.get(KEY_STATIONS).await? else {
        return Ok(());
    };

    let mut changed = false;
    for record in stations.values_mut() {
        if let Some(Value::Array(list)) = record.get("streams") {
            let indexed: Map<String, Value> = list
                .iter()
                .enumerate()
                .map(|(i, url)| (i.to_string(), url.clone()))
                .collect();
            record["streams"] = Value::Object(indexed);
            changed = true;
        }
    }

    if changed {
        storage.set(KEY_STATIONS, Value::Object(stations)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_legacy_shapes_are_normalized() {
        let storage = MemoryStorage::new();
        storage.set(KEY_HIDDEN, json!({"fip": 1, "nts1": 1})).await.unwrap();
        storage.set(KEY_VOLUME, json!({"current": 35, "last": 60})).await.unwrap();
        storage.set(KEY_FAVORITES, json!("broken")).await.unwrap();
        storage
            .set(
                KEY_STATIONS,
                json!({"mine": {"title": "Mine", "streams": ["http://a", "http://b"]}}),
            )
            .await
            .unwrap();

        assert_eq!(run(&storage).await.unwrap(), 0);

        let hidden = storage.get(KEY_HIDDEN).await.unwrap().unwrap();
        assert_eq!(hidden, json!(["fip", "nts1"]));
        let volume = storage.get(KEY_VOLUME).await.unwrap().unwrap();
        assert_eq!(volume, json!({"current": 35, "previous": 60}));
        assert_eq!(storage.get(KEY_FAVORITES).await.unwrap(), Some(json!([])));
        let stations = storage.get(KEY_STATIONS).await.unwrap().unwrap();
        assert_eq!(stations["mine"]["streams"], json!({"0": "http://a", "1": "http://b"}));
        assert_eq!(
            storage.get(KEY_SCHEMA_VERSION).await.unwrap(),
            Some(json!(SCHEMA_VERSION))
        );
    }

    #[tokio::test]
    async fn test_current_schema_is_left_alone() {
        let storage = MemoryStorage::new();
        storage.set(KEY_SCHEMA_VERSION, json!(SCHEMA_VERSION)).await.unwrap();
        storage.set(KEY_VOLUME, json!(12)).await.unwrap();

        assert_eq!(run(&storage).await.unwrap(), SCHEMA_VERSION);
        assert_eq!(storage.get(KEY_VOLUME).await.unwrap(), Some(json!(12)));
    }

    #[tokio::test]
    async fn test_scalar_volume_becomes_pair() {
        let storage = MemoryStorage::new();
        storage.set(KEY_VOLUME, json!(55)).await.unwrap();
        run(&storage).await.unwrap();
        assert_eq!(
            storage.get(KEY_VOLUME).await.unwrap(),
            Some(json!({"current": 55, "previous": 55}))
        );
    }
}
