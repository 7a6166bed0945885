//! Core station catalog: a JSON object mapping station name to
//! `{title, url, streams, image}`.  Object order is catalog order.
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::CatalogConfig;
use crate::error::CatalogError;
use crate::station::{Origin, Station, StationFields, StreamsInput};

/// Catalog compiled into the binary; the last fallback.
pub const BUNDLED_CATALOG: &str = include_str!("../assets/stations.json");

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image: Option<String>,
    streams: StreamsInput,
}

pub fn parse_catalog(content: &str) -> Result<Vec<Station>, CatalogError> {
    let entries: IndexMap<String, CatalogEntry> = serde_json::from_str(content)?;
    let stations: Vec<Station> = entries
        .into_iter()
        .filter_map(|(name, entry)| {
            if entry.streams.is_empty() {
                warn!("catalog: '{}' has no streams, skipped", name);
                return None;
            }
            let title = if entry.title.is_empty() {
                name.clone()
            } else {
                entry.title
            };
            let fields = StationFields {
                name: None,
                title,
                url: entry.url,
                image: entry.image,
                streams: entry.streams,
            };
            Some(Station::from_fields(name, fields, Origin::Core))
        })
        .collect();

    if stations.is_empty() {
        return Err(CatalogError::Empty);
    }
    Ok(stations)
}

pub async fn fetch_catalog(url: &str, timeout: Duration) -> Result<Vec<Station>, CatalogError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_catalog(&body)
}

/// Remote catalog, then the configured local copy, then the compiled-in one.
pub async fn load_catalog(config: &CatalogConfig) -> Result<Vec<Station>, CatalogError> {
    if let Some(url) = config.url.as_deref() {
        let timeout = Duration::from_secs(config.fetch_timeout_secs.max(1));
        match fetch_catalog(url, timeout).await {
            Ok(stations) => {
                info!("catalog: {} stations from {}", stations.len(), url);
                return Ok(stations);
            }
            Err(e) => warn!("catalog: fetch from {} failed: {}", url, e),
        }
    }

    if let Some(path) = config.bundled_path.as_deref() {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match parse_catalog(&content) {
                Ok(stations) => {
                    info!("catalog: {} stations from {:?}", stations.len(), path);
                    return Ok(stations);
                }
                Err(e) => warn!("catalog: {:?} unusable: {}", path, e),
            },
            Err(e) => warn!("catalog: cannot read {:?}: {}", path, e),
        }
    }

    let stations = parse_catalog(BUNDLED_CATALOG)?;
    info!("catalog: {} stations from bundled copy", stations.len());
    Ok(stations)
}
