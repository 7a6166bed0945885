/// mpv-backed audio host.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → translate_events
///                                                                    └── AudioEvent → coordinator
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::audio::{AudioEvent, AudioHost, HostLauncher};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

pub const OBS_CORE_IDLE: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an `end-file` event: eof, stop, quit, error, redirect.
    pub fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: u8) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", volume.min(100)]))
            .await?;
        Ok(())
    }

    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        match self
            .send(json!(["observe_property", OBS_CORE_IDLE, "core-idle"]))
            .await
        {
            Ok(_) => debug!("mpv: observing core-idle"),
            Err(e) => warn!("mpv: observe_property core-idle failed: {}", e),
        }
    }
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: airwave_proto::platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self, volume: u8) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary = airwave_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(airwave_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(format!("--volume={}", volume.min(100)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
        volume: u8,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process(volume).await?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
        volume: u8,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process(volume).await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: PendingMap,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Per-connection flags shared with the translator task.
#[derive(Default)]
struct ConnectionFlags {
    alive: AtomicBool,
    playing: AtomicBool,
    /// A `loadfile replace` is in flight; its `end-file stop` is not an abort.
    replacing: AtomicBool,
}

/// Turns raw mpv events into `AudioEvent`s for the coordinator.
async fn translate_events(
    mut rx: mpsc::Receiver<MpvEvent>,
    out: mpsc::Sender<AudioEvent>,
    flags: Arc<ConnectionFlags>,
) {
    let mut announced = false;
    while let Some(event) = rx.recv().await {
        let translated = match event.event_name() {
            Some("start-file") => {
                flags.replacing.store(false, Ordering::SeqCst);
                announced = false;
                Some(AudioEvent::Starting)
            }
            Some("property-change") => match event.as_property_change() {
                Some((OBS_CORE_IDLE, Value::Bool(false))) if !announced => {
                    announced = true;
                    flags.playing.store(true, Ordering::SeqCst);
                    Some(AudioEvent::Playing)
                }
                _ => None,
            },
            Some("end-file") => match event.end_reason() {
                Some("error") => {
                    flags.playing.store(false, Ordering::SeqCst);
                    let detail = event.raw["file_error"].as_str().unwrap_or("error");
                    Some(AudioEvent::Error(format!("mpv: {}", detail)))
                }
                // a live stream reaching eof means the connection dropped
                Some("eof") => {
                    flags.playing.store(false, Ordering::SeqCst);
                    Some(AudioEvent::Error("stream ended".into()))
                }
                _ if flags.replacing.swap(false, Ordering::SeqCst) => None,
                _ => {
                    flags.playing.store(false, Ordering::SeqCst);
                    Some(AudioEvent::Aborted)
                }
            },
            _ => None,
        };

        if let Some(evt) = translated {
            debug!("mpv: {:?}", evt);
            if out.send(evt).await.is_err() {
                return;
            }
        }
    }

    flags.alive.store(false, Ordering::SeqCst);
    if flags.playing.swap(false, Ordering::SeqCst) {
        let _ = out
            .send(AudioEvent::Error("mpv connection closed".into()))
            .await;
    }
}

pub struct MpvAudioHost {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    flags: Arc<ConnectionFlags>,
    events: mpsc::Sender<AudioEvent>,
    volume: u8,
}

impl MpvAudioHost {
    /// Current handle, respawning mpv if the process or its socket died.
    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = &self.handle {
            if self.flags.alive.load(Ordering::SeqCst) && self.driver.process_alive() {
                return Ok(handle.clone());
            }
            warn!("mpv: process gone, respawning");
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let handle = self.driver.spawn_and_connect(event_tx, self.volume).await?;
        let flags = Arc::new(ConnectionFlags::default());
        flags.alive.store(true, Ordering::SeqCst);
        tokio::spawn(translate_events(event_rx, self.events.clone(), flags.clone()));
        handle.observe_properties().await;

        self.flags = flags;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl AudioHost for MpvAudioHost {
    async fn play(&mut self, url: &str) -> anyhow::Result<()> {
        let handle = self.ensure_handle().await?;
        self.flags.replacing.store(true, Ordering::SeqCst);
        if let Err(e) = handle.load_stream(url).await {
            self.flags.replacing.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.flags.playing.store(false, Ordering::SeqCst);
        match &self.handle {
            Some(handle) if self.flags.alive.load(Ordering::SeqCst) => handle.stop().await,
            _ => Ok(()),
        }
    }

    async fn set_volume(&mut self, volume: u8) -> anyhow::Result<()> {
        self.volume = volume.min(100);
        match &self.handle {
            Some(handle) if self.flags.alive.load(Ordering::SeqCst) => {
                handle.set_volume(self.volume).await
            }
            // applied on the next spawn
            _ => Ok(()),
        }
    }

    fn volume(&self) -> u8 {
        self.volume
    }

    fn is_playing(&self) -> bool {
        self.flags.playing.load(Ordering::SeqCst)
    }
}

/// Spawns mpv on the first playback action.
#[derive(Default)]
pub struct MpvLauncher;

#[async_trait]
impl HostLauncher for MpvLauncher {
    async fn launch(
        &mut self,
        events: mpsc::Sender<AudioEvent>,
        volume: u8,
    ) -> anyhow::Result<Box<dyn AudioHost>> {
        let mut host = MpvAudioHost {
            driver: MpvDriver::new(),
            handle: None,
            flags: Arc::new(ConnectionFlags::default()),
            events,
            volume: volume.min(100),
        };
        host.ensure_handle().await?;
        Ok(Box::new(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn translate(raw: Vec<Value>) -> (Vec<AudioEvent>, Arc<ConnectionFlags>) {
        let (tx, rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let flags = Arc::new(ConnectionFlags::default());
        flags.alive.store(true, Ordering::SeqCst);
        let task = tokio::spawn(translate_events(rx, out_tx, flags.clone()));
        for raw in raw {
            tx.send(MpvEvent { raw }).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();
        let mut events = Vec::new();
        while let Ok(evt) = out_rx.try_recv() {
            events.push(evt);
        }
        (events, flags)
    }

    #[tokio::test]
    async fn test_stream_lifecycle_events() {
        let (events, flags) = translate(vec![
            json!({"event": "start-file"}),
            json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false}),
            json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": true}),
            json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false}),
            json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}),
        ])
        .await;
        assert_eq!(
            events,
            [
                AudioEvent::Starting,
                AudioEvent::Playing,
                AudioEvent::Error("mpv: loading failed".into()),
            ]
        );
        assert!(!flags.alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_replaced_file_is_not_an_abort() {
        let (tx, rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let flags = Arc::new(ConnectionFlags::default());
        flags.replacing.store(true, Ordering::SeqCst);
        let task = tokio::spawn(translate_events(rx, out_tx, flags));
        tx.send(MpvEvent { raw: json!({"event": "end-file", "reason": "stop"}) })
            .await
            .unwrap();
        tx.send(MpvEvent { raw: json!({"event": "end-file", "reason": "stop"}) })
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(out_rx.try_recv().ok(), Some(AudioEvent::Aborted));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_connection_while_playing_is_an_error() {
        let (events, flags) = translate(vec![
            json!({"event": "start-file"}),
            json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false}),
        ])
        .await;
        assert_eq!(
            events.last(),
            Some(&AudioEvent::Error("mpv connection closed".into()))
        );
        assert!(!flags.playing.load(Ordering::SeqCst));
    }
}
