use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::station::{StationFields, StationView};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Sent in the hello frame so UI clients can refuse to talk to
/// an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// An isolated execution context.  Contexts never share memory; they only
/// exchange envelopes over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    /// Always running while the daemon is up; hosts the coordinator.
    Background,
    /// Audio host side of the coordinator pair.
    Offscreen,
    /// Exists only while a UI client is attached.
    Popup,
    Options,
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Context::Background => "background",
            Context::Offscreen => "offscreen",
            Context::Popup => "popup",
            Context::Options => "options",
        };
        f.write_str(name)
    }
}

/// Playback state owned by the coordinator.  UI contexts only observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Buffering,
    Playing,
    Error,
}

impl PlaybackState {
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Buffering | PlaybackState::Playing)
    }
}

/// Payload of the `stateChanged` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNotice {
    pub state: PlaybackState,
    /// Last-played station name, if any.
    pub station: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// The closed action vocabulary.  Every variant has exactly one payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum Action {
    // playback
    Play(String),
    #[serde(rename = "playpause")]
    PlayPause,
    Stop,
    Next,
    Prev,
    SetVolume(i64),
    VolumeUp,
    VolumeDown,
    ToggleMute,
    GetStream(Option<String>),
    GetNextStream,
    GetStatus,

    // store
    GetStations,
    GetStationByName(String),
    GetLastName,
    GetLastStation,
    SetLast(String),
    GetFavorites,
    SetFavorites(Vec<String>),
    IsFavorite(String),
    Like(String),
    Dislike(String),
    AddStation(StationFields),
    DeleteStation(String),
    RestoreStation(String),
    GetVolume,
    GetVolumeLast,
    ExportData,
    ImportData(String),

    // notifications
    StateChanged(StateNotice),
    Log(String),
}

impl Action {
    /// Wire name of this action (the `action` field of its envelope).
    pub fn name(&self) -> String {
        match serde_json::to_value(self) {
            Ok(v) => v
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Err(_) => String::new(),
        }
    }

    /// True for actions that start, stop or reshape audio output.
    pub fn affects_playback(&self) -> bool {
        matches!(
            self,
            Action::Play(_)
                | Action::PlayPause
                | Action::Stop
                | Action::Next
                | Action::Prev
                | Action::SetVolume(_)
                | Action::VolumeUp
                | Action::VolumeDown
                | Action::ToggleMute
                | Action::GetStream(_)
        )
    }

    /// Build an action from its wire parts.  This is the single place where
    /// loosely shaped input is normalized.
    pub fn from_parts(name: &str, data: Value) -> Result<Action, ProtocolError> {
        let raw = serde_json::json!({ "action": name, "data": data });
        serde_json::from_value::<Action>(raw).map_err(|e| {
            if is_known_action(name) {
                ProtocolError::MalformedPayload {
                    action: name.to_string(),
                    reason: e.to_string(),
                }
            } else {
                ProtocolError::UnknownAction(name.to_string())
            }
        })
    }
}

const ACTION_NAMES: &[&str] = &[
    "play",
    "playpause",
    "stop",
    "next",
    "prev",
    "setVolume",
    "volumeUp",
    "volumeDown",
    "toggleMute",
    "getStream",
    "getNextStream",
    "getStatus",
    "getStations",
    "getStationByName",
    "getLastName",
    "getLastStation",
    "setLast",
    "getFavorites",
    "setFavorites",
    "isFavorite",
    "like",
    "dislike",
    "addStation",
    "deleteStation",
    "restoreStation",
    "getVolume",
    "getVolumeLast",
    "exportData",
    "importData",
    "stateChanged",
    "log",
];

fn is_known_action(name: &str) -> bool {
    ACTION_NAMES.contains(&name)
}

/// Wire envelope: `{target, action, data}`.  `data` is opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub target: Context,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(target: Context, action: &Action) -> anyhow::Result<Self> {
        let mut raw = serde_json::to_value(action)?;
        let data = raw.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Ok(Self {
            target,
            action: action.name(),
            data,
        })
    }

    pub fn action(&self) -> Result<Action, ProtocolError> {
        Action::from_parts(&self.action, self.data.clone())
    }
}

/// What a context handler answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Response {
    Ack,
    /// Unknown action, malformed payload or nothing to do.
    Ignored,
    Rejected(String),
    Stations(Vec<StationView>),
    Station(Option<StationView>),
    Name(Option<String>),
    Names(Vec<String>),
    Flag(bool),
    Volume(u8),
    Stream(Option<String>),
    Status(PlaybackState),
    Exported(String),
}

/// Outcome of a bus send.  `Undeliverable` is a normal result: the target
/// context had no listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "response", rename_all = "camelCase")]
pub enum Reply {
    Delivered(Response),
    Undeliverable,
}

impl Reply {
    pub fn response(self) -> Option<Response> {
        match self {
            Reply::Delivered(r) => Some(r),
            Reply::Undeliverable => None,
        }
    }

    pub fn is_undeliverable(&self) -> bool {
        matches!(self, Reply::Undeliverable)
    }
}

/// Sent once to every UI client right after it attaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub state: PlaybackState,
}

/// Frame carried on the daemon socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Envelope(Envelope),
    Reply { reply: Reply },
    Hello { hello: Hello },
}

impl Message {
    /// 4-byte big-endian length prefix followed by the JSON body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`, returning it with the
    /// number of bytes consumed.  `Ok(None)` means more bytes are needed.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Ok(None);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])
            .map_err(|e| ProtocolError::Frame(e.to_string()))?;
        Ok(Some((msg, 4 + len)))
    }
}
