//! Station store: core catalog + user stations, favorites, hidden set,
//! last-played pointer and the volume pair.
//!
//! One `StationStore` is built per daemon lifetime and owned by the playback
//! coordinator.  Every mutating call awaits its `Storage::set` before
//! returning, so a completed call is durable.  New values are written first
//! and only then committed in memory: a failed write changes nothing.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::station::{Origin, Station, StationFields, StationView};
use crate::storage::Storage;

pub const KEY_FAVORITES: &str = "favorites";
pub const KEY_LAST: &str = "last";
pub const KEY_HIDDEN: &str = "hidden";
pub const KEY_VOLUME: &str = "volume";
pub const KEY_STATIONS: &str = "stations";

/// Volume used when nothing usable was persisted.
pub const DEFAULT_VOLUME: u8 = 80;

/// Per-process counter appended to synthesized user-station names.
static NEXT_STATION_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePair {
    pub current: u8,
    /// Value before the most recent change (mute/unmute).
    pub previous: u8,
}

impl VolumePair {
    pub fn new(volume: u8) -> Self {
        let v = volume.min(100);
        Self {
            current: v,
            previous: v,
        }
    }
}

/// Export/import document: `{"stations": {name: fields}}`.
#[derive(Debug, Serialize, Deserialize)]
struct ExportDocument {
    stations: IndexMap<String, StationFields>,
}

pub struct StationStore {
    storage: Arc<dyn Storage>,
    core: IndexMap<String, Station>,
    user: IndexMap<String, Station>,
    favorites: Vec<String>,
    last: Option<String>,
    volume: VolumePair,
    hidden: BTreeSet<String>,
}

impl StationStore {
    /// Merge the bundled/fetched core catalog with whatever the user persisted.
    pub async fn load(
        storage: Arc<dyn Storage>,
        catalog: Vec<Station>,
        default_volume: u8,
    ) -> StoreResult<Self> {
        let hidden: BTreeSet<String> = read_or(storage.as_ref(), KEY_HIDDEN, BTreeSet::new()).await?;

        let mut core = IndexMap::new();
        for mut station in catalog {
            station.origin = Origin::Core;
            station.hidden = hidden.contains(&station.name);
            core.insert(station.name.clone(), station);
        }

        let records: IndexMap<String, StationFields> =
            read_or(storage.as_ref(), KEY_STATIONS, IndexMap::new()).await?;
        let mut user = IndexMap::new();
        for (name, fields) in records {
            if core.contains_key(&name) {
                warn!("store: user station '{}' shadows a core station, skipped", name);
                continue;
            }
            if fields.streams.is_empty() {
                warn!("store: user station '{}' has no streams, skipped", name);
                continue;
            }
            user.insert(name.clone(), Station::from_fields(name, fields, Origin::User));
        }

        let volume = read_or(
            storage.as_ref(),
            KEY_VOLUME,
            VolumePair::new(default_volume),
        )
        .await?;
        let volume = VolumePair {
            current: volume.current.min(100),
            previous: volume.previous.min(100),
        };

        let last: Option<String> = read_or(storage.as_ref(), KEY_LAST, None).await?;
        let stored_favorites: Vec<String> = read_or(storage.as_ref(), KEY_FAVORITES, Vec::new()).await?;

        let mut store = Self {
            storage,
            core,
            user,
            favorites: Vec::new(),
            last,
            volume,
            hidden,
        };
        store.favorites = store.sanitize_favorites(stored_favorites);

        info!(
            "store: loaded {} core ({} hidden), {} user stations, {} favorites",
            store.core.len(),
            store.hidden.len(),
            store.user.len(),
            store.favorites.len()
        );
        Ok(store)
    }

    // ── lookup ────────────────────────────────────────────────────────────────

    /// Every station in iteration order: core catalog order, then user
    /// stations in insertion order.  Hidden core stations are included and
    /// tagged via `Station::hidden`.
    pub fn stations(&self) -> impl Iterator<Item = &Station> + '_ {
        self.core.values().chain(self.user.values())
    }

    /// Stations shown in listings (hidden core stations suppressed).
    pub fn visible(&self) -> impl Iterator<Item = &Station> + '_ {
        self.stations().filter(|s| !s.hidden)
    }

    pub fn get_all(&self) -> IndexMap<String, StationView> {
        self.stations()
            .map(|s| (s.name.clone(), s.view(self.is_favorite(&s.name))))
            .collect()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Station> {
        self.core.get(name).or_else(|| self.user.get(name))
    }

    fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Station> {
        match self.core.get_mut(name) {
            Some(s) => Some(s),
            None => self.user.get_mut(name),
        }
    }

    pub fn view(&self, name: &str) -> Option<StationView> {
        self.get_by_name(name)
            .map(|s| s.view(self.is_favorite(&s.name)))
    }

    // ── user stations ─────────────────────────────────────────────────────────

    pub async fn add_user_station(&mut self, fields: StationFields) -> StoreResult<Station> {
        let name = match fields.name.clone().filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => self.synthesize_name(),
        };
        if self.core.contains_key(&name) {
            return Err(StoreError::NameTaken(name));
        }
        if fields.streams.is_empty() {
            return Err(StoreError::NoStreams(name));
        }

        let station = Station::from_fields(name.clone(), fields, Origin::User);
        info!("store: saving user station '{}'", name);
        let mut user = self.user.clone();
        user.insert(name, station.clone());
        self.persist_user_stations(&user).await?;
        self.user = user;
        Ok(station)
    }

    /// Timestamp + process-wide counter; loops until the name is free.
    fn synthesize_name(&self) -> String {
        loop {
            let seq = NEXT_STATION_SEQ.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}{}", chrono::Utc::now().timestamp_millis(), seq);
            if self.get_by_name(&name).is_none() {
                return name;
            }
        }
    }

    /// User station → removed; core station → hidden.  Returns whether
    /// anything changed.
    pub async fn delete_station(&mut self, name: &str) -> StoreResult<bool> {
        if self.user.contains_key(name) {
            let mut user = self.user.clone();
            user.shift_remove(name);
            self.persist_user_stations(&user).await?;
            self.user = user;
            info!("store: deleted user station '{}'", name);
        } else if let Some(station) = self.core.get(name) {
            if station.hidden {
                return Ok(false);
            }
            let mut hidden = self.hidden.clone();
            hidden.insert(name.to_string());
            self.persist_hidden(&hidden).await?;
            self.hidden = hidden;
            if let Some(station) = self.core.get_mut(name) {
                station.hidden = true;
            }
            info!("store: hid core station '{}'", name);
        } else {
            return Ok(false);
        }

        if self.is_favorite(name) {
            let favorites = self.favorites.iter().filter(|f| *f != name).cloned().collect();
            self.commit_favorites(favorites).await?;
        }
        Ok(true)
    }

    pub async fn restore_station(&mut self, name: &str) -> StoreResult<bool> {
        if !self.hidden.contains(name) {
            return Ok(false);
        }
        let mut hidden = self.hidden.clone();
        hidden.remove(name);
        self.persist_hidden(&hidden).await?;
        self.hidden = hidden;
        if let Some(station) = self.core.get_mut(name) {
            station.hidden = false;
        }
        info!("store: restored core station '{}'", name);
        Ok(true)
    }

    // ── favorites ─────────────────────────────────────────────────────────────

    pub async fn like(&mut self, name: &str) -> StoreResult<bool> {
        if self.is_favorite(name) {
            return Ok(false);
        }
        match self.get_by_name(name) {
            Some(s) if !s.hidden => {}
            _ => {
                debug!("store: like ignored for unknown or hidden '{}'", name);
                return Ok(false);
            }
        }
        let mut favorites = self.favorites.clone();
        favorites.push(name.to_string());
        self.commit_favorites(favorites).await?;
        Ok(true)
    }

    pub async fn dislike(&mut self, name: &str) -> StoreResult<bool> {
        if !self.is_favorite(name) {
            return Ok(false);
        }
        let favorites = self.favorites.iter().filter(|f| *f != name).cloned().collect();
        self.commit_favorites(favorites).await?;
        Ok(true)
    }

    pub fn is_favorite(&self, name: &str) -> bool {
        self.favorites.iter().any(|f| f == name)
    }

    pub fn favorites(&self) -> &[String] {
        &self.favorites
    }

    /// Replace the favorites order.  Unknown, hidden and duplicate names are dropped.
    pub async fn set_favorites(&mut self, names: Vec<String>) -> StoreResult<()> {
        let favorites = self.sanitize_favorites(names);
        self.commit_favorites(favorites).await
    }

    fn sanitize_favorites(&self, names: Vec<String>) -> Vec<String> {
        let mut seen = BTreeSet::new();
        names
            .into_iter()
            .filter(|n| matches!(self.get_by_name(n), Some(s) if !s.hidden))
            .filter(|n| seen.insert(n.clone()))
            .collect()
    }

    // ── last played ───────────────────────────────────────────────────────────

    pub async fn set_last(&mut self, name: &str) -> StoreResult<()> {
        if self.get_by_name(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if self.last.as_deref() == Some(name) {
            return Ok(());
        }
        self.storage.set(KEY_LAST, Value::from(name)).await?;
        self.last = Some(name.to_string());
        Ok(())
    }

    pub fn last_name(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// The last-played station, if the pointer still resolves.
    pub fn get_last(&self) -> Option<&Station> {
        self.last.as_deref().and_then(|n| self.get_by_name(n))
    }

    /// Select a stream quality on the last-played station and return its URL.
    pub fn select_stream(&mut self, key: Option<&str>) -> Option<String> {
        let name = self.last.clone()?;
        self.get_by_name_mut(&name)?.select_stream(key)
    }

    /// Rotate the last-played station to its next stream quality.
    pub fn next_stream(&mut self) -> Option<String> {
        let name = self.last.clone()?;
        self.get_by_name_mut(&name)?.next_stream()
    }

    // ── volume ────────────────────────────────────────────────────────────────

    /// Clamp to `[0, 100]` and shift the old current value into `previous`.
    pub async fn set_volume(&mut self, volume: i64) -> StoreResult<u8> {
        let clamped = volume.clamp(0, 100) as u8;
        let pair = VolumePair {
            current: clamped,
            previous: self.volume.current,
        };
        self.storage
            .set(KEY_VOLUME, serde_json::to_value(pair)?)
            .await?;
        self.volume = pair;
        Ok(clamped)
    }

    pub fn volume(&self) -> u8 {
        self.volume.current
    }

    /// Volume before the last change; a muted previous value reads as the default.
    pub fn previous_volume(&self) -> u8 {
        match self.volume.previous {
            0 => DEFAULT_VOLUME,
            v => v,
        }
    }

    // ── export / import ───────────────────────────────────────────────────────

    pub fn export_user_stations(&self) -> StoreResult<String> {
        let doc = ExportDocument {
            stations: self
                .user
                .iter()
                .map(|(name, s)| (name.clone(), s.to_fields()))
                .collect(),
        };
        Ok(serde_json::to_string(&doc)?)
    }

    /// Fails closed: any malformed or conflicting entry rejects the whole
    /// snapshot and leaves the store untouched.
    pub async fn import_user_stations(&mut self, snapshot: &str) -> StoreResult<bool> {
        let doc: ExportDocument = match serde_json::from_str(snapshot) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("store: import rejected: {}", e);
                return Ok(false);
            }
        };

        let mut incoming = Vec::with_capacity(doc.stations.len());
        for (key, fields) in doc.stations {
            let name = fields.name.clone().filter(|n| !n.is_empty()).unwrap_or(key);
            if self.core.contains_key(&name) {
                warn!("store: import rejected: '{}' is a core station", name);
                return Ok(false);
            }
            if fields.streams.is_empty() {
                warn!("store: import rejected: '{}' has no streams", name);
                return Ok(false);
            }
            incoming.push(Station::from_fields(name, fields, Origin::User));
        }

        info!("store: importing {} user stations", incoming.len());
        let mut user = self.user.clone();
        for station in incoming {
            user.insert(station.name.clone(), station);
        }
        self.persist_user_stations(&user).await?;
        self.user = user;
        Ok(true)
    }

    // ── persistence ───────────────────────────────────────────────────────────

    async fn persist_user_stations(&self, user: &IndexMap<String, Station>) -> StoreResult<()> {
        let records: IndexMap<&str, StationFields> = user
            .iter()
            .map(|(name, s)| (name.as_str(), s.to_fields()))
            .collect();
        self.storage
            .set(KEY_STATIONS, serde_json::to_value(records)?)
            .await?;
        Ok(())
    }

    async fn commit_favorites(&mut self, favorites: Vec<String>) -> StoreResult<()> {
        self.storage
            .set(KEY_FAVORITES, serde_json::to_value(&favorites)?)
            .await?;
        self.favorites = favorites;
        Ok(())
    }

    async fn persist_hidden(&self, hidden: &BTreeSet<String>) -> StoreResult<()> {
        self.storage
            .set(KEY_HIDDEN, serde_json::to_value(hidden)?)
            .await?;
        Ok(())
    }
}

/// Read and decode `key`; a missing key or a value of the wrong shape yields `default`.
async fn read_or<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
    default: T,
) -> StoreResult<T> {
    match storage.get(key).await? {
        None | Some(Value::Null) => Ok(default),
        Some(value) => match serde_json::from_value(value) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("store: ignoring malformed '{}': {}", key, e);
                Ok(default)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{Streams, StreamsInput};
    use crate::storage::MemoryStorage;

    fn core_station(name: &str) -> Station {
        let mut streams = Streams::new();
        streams.insert("low".into(), format!("http://{}/low", name));
        streams.insert("high".into(), format!("http://{}/high", name));
        Station {
            name: name.into(),
            title: name.to_uppercase(),
            url: None,
            image: None,
            streams,
            current_stream_key: None,
            origin: Origin::Core,
            hidden: false,
        }
    }

    fn user_fields(name: Option<&str>) -> StationFields {
        StationFields {
            name: name.map(str::to_string),
            title: "Mine".into(),
            url: Some("http://home".into()),
            image: None,
            streams: StreamsInput::List(vec!["http://mine/stream".into()]),
        }
    }

    /// Storage whose writes start failing once `broken` is set.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        broken: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Storage for FlakyStorage {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.set(key, value).await
        }
    }

    async fn store_with(storage: Arc<dyn Storage>) -> StationStore {
        StationStore::load(
            storage,
            vec![core_station("a"), core_station("b"), core_station("c")],
            DEFAULT_VOLUME,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_like_is_idempotent() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        assert!(store.like("a").await.unwrap());
        assert!(!store.like("a").await.unwrap());
        assert_eq!(store.favorites(), ["a".to_string()]);
        assert!(!store.dislike("b").await.unwrap());
        assert!(store.dislike("a").await.unwrap());
        assert!(store.favorites().is_empty());
    }

    #[tokio::test]
    async fn test_like_unknown_station_is_ignored() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        assert!(!store.like("nope").await.unwrap());
        assert!(!store.is_favorite("nope"));
    }

    #[tokio::test]
    async fn test_volume_clamps_and_shifts() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        assert_eq!(store.set_volume(250).await.unwrap(), 100);
        assert_eq!(store.volume(), 100);
        assert_eq!(store.previous_volume(), DEFAULT_VOLUME);
        assert_eq!(store.set_volume(-7).await.unwrap(), 0);
        assert_eq!(store.volume(), 0);
        assert_eq!(store.previous_volume(), 100);
    }

    #[tokio::test]
    async fn test_hide_and_restore_round_trip() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        let before = store.get_all();

        assert!(store.delete_station("b").await.unwrap());
        assert!(store.get_by_name("b").unwrap().hidden);
        assert_eq!(store.visible().count(), 2);
        assert!(store.restore_station("b").await.unwrap());

        assert_eq!(store.get_all(), before);
    }

    #[tokio::test]
    async fn test_user_station_hard_delete() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        let station = store.add_user_station(user_fields(Some("mine"))).await.unwrap();
        assert!(station.is_user());
        store.like("mine").await.unwrap();

        assert!(store.delete_station("mine").await.unwrap());
        assert!(store.get_by_name("mine").is_none());
        assert!(!store.is_favorite("mine"));
        assert!(!store.restore_station("mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_synthesized_names_are_unique() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        let one = store.add_user_station(user_fields(None)).await.unwrap();
        let two = store.add_user_station(user_fields(None)).await.unwrap();
        assert_ne!(one.name, two.name);
        assert_eq!(store.stations().filter(|s| s.is_user()).count(), 2);
    }

    #[tokio::test]
    async fn test_core_name_cannot_be_reused() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        let err = store.add_user_station(user_fields(Some("a"))).await.unwrap_err();
        assert!(matches!(err, StoreError::NameTaken(_)));
    }

    #[tokio::test]
    async fn test_import_failure_leaves_store_untouched() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        store.add_user_station(user_fields(Some("mine"))).await.unwrap();
        let before = store.export_user_stations().unwrap();

        assert!(!store.import_user_stations("{not json").await.unwrap());
        assert!(!store
            .import_user_stations(r#"{"stations": {"x": {"title": "X", "streams": []}}}"#)
            .await
            .unwrap());
        assert!(!store
            .import_user_stations(r#"{"stations": {"a": {"title": "A", "streams": ["http://a"]}}}"#)
            .await
            .unwrap());

        assert_eq!(store.export_user_stations().unwrap(), before);
    }

    #[tokio::test]
    async fn test_export_then_import_into_fresh_store() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        store.add_user_station(user_fields(Some("mine"))).await.unwrap();
        let snapshot = store.export_user_stations().unwrap();

        let mut fresh = store_with(Arc::new(MemoryStorage::new())).await;
        assert!(fresh.import_user_stations(&snapshot).await.unwrap());
        let imported = fresh.get_by_name("mine").unwrap();
        assert_eq!(imported.current_stream(), Some("http://mine/stream"));
        assert_eq!(imported.url.as_deref(), Some("http://home"));
    }

    #[tokio::test]
    async fn test_state_is_reloaded_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let mut store = store_with(storage.clone()).await;
            store.like("c").await.unwrap();
            store.like("a").await.unwrap();
            store.set_last("b").await.unwrap();
            store.set_volume(40).await.unwrap();
            store.delete_station("a").await.unwrap();
            store.add_user_station(user_fields(Some("mine"))).await.unwrap();
        }

        let store = store_with(storage).await;
        assert_eq!(store.favorites(), ["c".to_string()]);
        assert_eq!(store.last_name(), Some("b"));
        assert_eq!(store.volume(), 40);
        assert!(store.get_by_name("a").unwrap().hidden);
        assert!(store.get_by_name("mine").unwrap().is_user());
    }

    #[tokio::test]
    async fn test_set_last_requires_known_station() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        assert!(store.set_last("ghost").await.is_err());
        assert!(store.get_last().is_none());
        store.set_last("a").await.unwrap();
        assert_eq!(store.get_last().map(|s| s.name.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_unchanged() {
        let storage = Arc::new(FlakyStorage::default());
        let mut store = store_with(storage.clone()).await;
        store.like("c").await.unwrap();
        store.set_last("a").await.unwrap();
        store.set_volume(40).await.unwrap();
        store.add_user_station(user_fields(Some("mine"))).await.unwrap();
        let exported = store.export_user_stations().unwrap();
        storage.broken.store(true, Ordering::SeqCst);

        let snapshot = r#"{"stations": {"x": {"title": "X", "streams": ["http://x"]}}}"#;
        assert!(matches!(
            store.import_user_stations(snapshot).await,
            Err(StoreError::Storage(_))
        ));
        assert_eq!(store.export_user_stations().unwrap(), exported);
        assert!(store.get_by_name("x").is_none());

        assert!(store.set_volume(10).await.is_err());
        assert_eq!(store.volume(), 40);
        assert_eq!(store.previous_volume(), DEFAULT_VOLUME);

        assert!(store.add_user_station(user_fields(Some("other"))).await.is_err());
        assert!(store.get_by_name("other").is_none());
        assert!(store.delete_station("mine").await.is_err());
        assert!(store.get_by_name("mine").is_some());
        assert!(store.delete_station("b").await.is_err());
        assert!(!store.get_by_name("b").unwrap().hidden);
        assert_eq!(store.visible().count(), 4);

        assert!(store.like("a").await.is_err());
        assert!(store.dislike("c").await.is_err());
        assert!(store.set_favorites(vec!["a".into()]).await.is_err());
        assert_eq!(store.favorites(), ["c".to_string()]);

        assert!(store.set_last("b").await.is_err());
        assert_eq!(store.last_name(), Some("a"));
    }

    #[tokio::test]
    async fn test_set_favorites_filters_and_dedupes() {
        let mut store = store_with(Arc::new(MemoryStorage::new())).await;
        store.delete_station("c").await.unwrap();
        store
            .set_favorites(vec!["b".into(), "ghost".into(), "c".into(), "b".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(store.favorites(), ["b".to_string(), "a".to_string()]);
    }
}
