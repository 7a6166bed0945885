//! Asynchronous key/value persistence behind the station store.
//!
//! `JsonFileStorage` keeps every key in one JSON document on disk and
//! rewrites it on each `set`, so a completed `set` means the value is durable.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;
}

pub struct JsonFileStorage {
    path: PathBuf,
    doc: Mutex<Map<String, Value>>,
}

impl JsonFileStorage {
    /// Open (or lazily create) the storage document at `path`.  A corrupt
    /// document is logged and treated as empty; it is replaced on the next write.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("storage: {:?} is not a JSON object ({}), starting empty", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("storage: opened {:?} with {} keys", path, doc.len());
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, doc: &Map<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.doc.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut doc = self.doc.lock().await;
        let previous = doc.insert(key.to_string(), value);
        if let Err(e) = self.flush(&doc).await {
            // keep memory in step with what is on disk
            match previous {
                Some(old) => doc.insert(key.to_string(), old),
                None => doc.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Process-local storage, used by tests and as a scratch backend.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.values.lock().await.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}
