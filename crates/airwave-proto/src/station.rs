use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered mapping from a quality label ("low", "128k", "0", ...) to a stream URL.
pub type Streams = IndexMap<String, String>;

/// Where a station record comes from.  Only user stations can be destroyed;
/// core stations are hidden instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Core,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    pub title: String,
    /// Home page of the station
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    pub streams: Streams,
    /// Label last selected by the user or by failover.  Falls back to the
    /// first declared label when absent or no longer valid.
    #[serde(default)]
    pub current_stream_key: Option<String>,
    #[serde(default)]
    pub origin: Origin,
    /// Only meaningful for core stations.
    #[serde(default)]
    pub hidden: bool,
}

impl Station {
    pub fn from_fields(name: String, fields: StationFields, origin: Origin) -> Self {
        Self {
            name,
            title: fields.title,
            url: fields.url.filter(|u| !u.is_empty()),
            image: fields.image.filter(|i| !i.is_empty()),
            streams: fields.streams.into_streams(),
            current_stream_key: None,
            origin,
            hidden: false,
        }
    }

    pub fn is_user(&self) -> bool {
        self.origin == Origin::User
    }

    /// The effective stream label: the selected one if it still exists,
    /// otherwise the first declared label.
    pub fn stream_key(&self) -> Option<&str> {
        match self.current_stream_key.as_deref() {
            Some(key) if self.streams.contains_key(key) => Some(key),
            _ => self.streams.keys().next().map(String::as_str),
        }
    }

    pub fn current_stream(&self) -> Option<&str> {
        let key = self.stream_key()?;
        self.streams.get(key).map(String::as_str)
    }

    /// Select `key` (when given) and return the URL of the effective stream.
    /// An unknown key falls back to the first declared stream.
    pub fn select_stream(&mut self, key: Option<&str>) -> Option<String> {
        if let Some(key) = key {
            self.current_stream_key = Some(key.to_string());
        }
        let effective = self.stream_key()?.to_string();
        let url = self.streams.get(&effective).cloned();
        self.current_stream_key = Some(effective);
        url
    }

    /// Rotate to the next declared stream (wrapping) and return its URL.
    pub fn next_stream(&mut self) -> Option<String> {
        let len = self.streams.len();
        if len == 0 {
            return None;
        }
        let idx = self
            .stream_key()
            .and_then(|k| self.streams.get_index_of(k))
            .unwrap_or(0);
        let (key, url) = self.streams.get_index((idx + 1) % len)?;
        let url = url.clone();
        self.current_stream_key = Some(key.clone());
        Some(url)
    }

    pub fn to_fields(&self) -> StationFields {
        StationFields {
            name: Some(self.name.clone()),
            title: self.title.clone(),
            url: self.url.clone(),
            image: self.image.clone(),
            streams: StreamsInput::Map(self.streams.clone()),
        }
    }

    pub fn view(&self, is_favorite: bool) -> StationView {
        StationView {
            name: self.name.clone(),
            title: self.title.clone(),
            url: self.url.clone(),
            image: self.image.clone(),
            stream_name: self.stream_key().map(str::to_string),
            stream: self.current_stream().map(str::to_string),
            stream_keys: self.streams.keys().cloned().collect(),
            is_user: self.is_user(),
            is_hidden: self.hidden,
            is_favorite,
        }
    }
}

/// User-authored station input (`addStation`, import, persisted user records).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    pub streams: StreamsInput,
}

/// Streams arrive either as a label → URL object or as a bare list of URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamsInput {
    Map(Streams),
    List(Vec<String>),
}

impl StreamsInput {
    pub fn is_empty(&self) -> bool {
        match self {
            StreamsInput::Map(m) => m.is_empty(),
            StreamsInput::List(l) => l.is_empty(),
        }
    }

    pub fn into_streams(self) -> Streams {
        match self {
            StreamsInput::Map(m) => m,
            StreamsInput::List(l) => l
                .into_iter()
                .enumerate()
                .map(|(i, url)| (i.to_string(), url))
                .collect(),
        }
    }
}

/// Flat projection handed to UI surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationView {
    pub name: String,
    pub title: String,
    pub url: Option<String>,
    pub image: Option<String>,
    pub stream_name: Option<String>,
    pub stream: Option<String>,
    pub stream_keys: Vec<String>,
    pub is_user: bool,
    pub is_hidden: bool,
    pub is_favorite: bool,
}
