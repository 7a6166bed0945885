use thiserror::Error;

/// Errors raised when an incoming envelope cannot be turned into an `Action`.
///
/// Handlers answer both variants with `Response::Ignored`; they never
/// propagate past the bus boundary.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("malformed payload for action '{action}': {reason}")]
    MalformedPayload { action: String, reason: String },
    #[error("frame error: {0}")]
    Frame(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("station '{0}' not found")]
    NotFound(String),
    #[error("station name '{0}' belongs to a core station")]
    NameTaken(String),
    #[error("station '{0}' declares no streams")]
    NoStreams(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("catalog parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog is empty")]
    Empty,
}

pub type StoreResult<T> = Result<T, StoreError>;
