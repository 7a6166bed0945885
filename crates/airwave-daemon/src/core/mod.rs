/// Coordinator: single owner of the station store, the playback state and
/// the audio host.
///
/// Registered on the bus for both `background` and `offscreen`; the two
/// contexts share one mailbox so every playback request is handled in
/// arrival order.  Audio host events arrive on a second channel and are
/// folded into the same loop, together with a heartbeat tick that watches
/// for streams stuck in buffering.
///
/// Every state transition is announced to `popup` as a `stateChanged`
/// notification.  Notifications are best-effort: no popup, no delivery.
use std::time::Duration;

use airwave_proto::bus::{Mailbox, MessageBus};
use airwave_proto::config::{NavigationOrder, PlaybackConfig};
use airwave_proto::error::StoreError;
use airwave_proto::protocol::{Action, Context, PlaybackState, Response, StateNotice};
use airwave_proto::store::StationStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioEvent, AudioHost, HostLauncher};


const HEARTBEAT: Duration = Duration::from_secs(1);
const AUDIO_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Prev,
}

pub struct Coordinator {
    config: PlaybackConfig,
    store: StationStore,
    bus: MessageBus,
    launcher: Box<dyn HostLauncher>,
    /// Created on the first playback action.
    host: Option<Box<dyn AudioHost>>,
    audio_tx: mpsc::Sender<AudioEvent>,
    audio_rx: Option<mpsc::Receiver<AudioEvent>>,
    state: PlaybackState,
    /// Stream errors seen since the current station last played.
    attempts: u32,
    /// When the current play request was issued; drives the buffering timeout.
    buffering_since: Option<Instant>,
}

impl Coordinator {
    pub fn new(
        config: PlaybackConfig,
        store: StationStore,
        bus: MessageBus,
        launcher: Box<dyn HostLauncher>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_EVENT_CAPACITY);
        Self {
            config,
            store,
            bus,
            launcher,
            host: None,
            audio_tx,
            audio_rx: Some(audio_rx),
            state: PlaybackState::Stopped,
            attempts: 0,
            buffering_since: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Run until every sender of `mailbox` is gone.
    pub async fn run(mut self, mut mailbox: Mailbox) -> anyhow::Result<()> {
        info!("coordinator: starting event loop");
        let mut audio_rx = self
            .audio_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("coordinator already running"))?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                delivery = mailbox.recv() => {
                    let Some(delivery) = delivery else {
                        info!("coordinator: mailbox closed, shutting down");
                        break;
                    };
                    let response = self.dispatch(delivery.from, delivery.action).await;
                    delivery.responder.respond(response);
                }
                Some(event) = audio_rx.recv() => {
                    self.on_audio_event(event).await;
                }
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    pub async fn dispatch(&mut self, from: Context, action: Action) -> Response {
        if action.affects_playback() {
            info!("coordinator: {} from {}", action.name(), from);
        } else {
            debug!("coordinator: {} from {}", action.name(), from);
        }

        match action {
            Action::Play(name) => self.play(&name).await,
            Action::PlayPause => self.play_pause().await,
            Action::Stop => {
                self.stop().await;
                Response::Ack
            }
            Action::Next => self.step(Direction::Next).await,
            Action::Prev => self.step(Direction::Prev).await,
            Action::SetVolume(volume) => self.apply_volume(volume).await,
            Action::VolumeUp => self.nudge_volume(i64::from(self.config.volume_step)).await,
            Action::VolumeDown => self.nudge_volume(-i64::from(self.config.volume_step)).await,
            Action::ToggleMute => {
                let target = match self.store.volume() {
                    0 => self.store.previous_volume(),
                    _ => 0,
                };
                self.apply_volume(i64::from(target)).await
            }
            Action::GetStream(key) => {
                let url = self.store.select_stream(key.as_deref());
                if key.is_some() {
                    self.replay_if_active(url.as_deref()).await;
                }
                Response::Stream(url)
            }
            Action::GetNextStream => {
                let url = self.store.next_stream();
                self.replay_if_active(url.as_deref()).await;
                Response::Stream(url)
            }
            Action::GetStatus => Response::Status(self.state),

            Action::GetStations => Response::Stations(self.store.get_all().into_values().collect()),
            Action::GetStationByName(name) => Response::Station(self.store.view(&name)),
            Action::GetLastName => Response::Name(self.store.last_name().map(str::to_string)),
            Action::GetLastStation => {
                let view = self.store.last_name().and_then(|n| self.store.view(n));
                Response::Station(view)
            }
            Action::SetLast(name) => match self.store.set_last(&name).await {
                Ok(()) => Response::Station(self.store.view(&name)),
                Err(StoreError::NotFound(_)) => Response::Station(None),
                Err(e) => rejected(e),
            },
            Action::GetFavorites => Response::Names(self.store.favorites().to_vec()),
            Action::SetFavorites(names) => match self.store.set_favorites(names).await {
                Ok(()) => Response::Names(self.store.favorites().to_vec()),
                Err(e) => rejected(e),
            },
            Action::IsFavorite(name) => Response::Flag(self.store.is_favorite(&name)),
            Action::Like(name) => flag(self.store.like(&name).await),
            Action::Dislike(name) => flag(self.store.dislike(&name).await),
            Action::AddStation(fields) => match self.store.add_user_station(fields).await {
                Ok(station) => Response::Station(self.store.view(&station.name)),
                Err(e) => rejected(e),
            },
            Action::DeleteStation(name) => flag(self.store.delete_station(&name).await),
            Action::RestoreStation(name) => flag(self.store.restore_station(&name).await),
            Action::GetVolume => Response::Volume(self.store.volume()),
            Action::GetVolumeLast => Response::Volume(self.store.previous_volume()),
            Action::ExportData => match self.store.export_user_stations() {
                Ok(snapshot) => Response::Exported(snapshot),
                Err(e) => rejected(e),
            },
            Action::ImportData(snapshot) => flag(self.store.import_user_stations(&snapshot).await),

            // UI-bound notifications have no meaning here
            Action::StateChanged(_) | Action::Log(_) => Response::Ignored,
        }
    }

    // ── playback ──────────────────────────────────────────────────────────────

    /// Toggle: the station already playing stops, anything else starts.
    async fn play(&mut self, name: &str) -> Response {
        if self.store.get_by_name(name).is_none() {
            warn!("coordinator: play '{}': no such station", name);
            return Response::Ignored;
        }
        if self.store.last_name() == Some(name) && self.is_active() {
            self.stop().await;
            return Response::Ack;
        }
        self.start_station(name).await
    }

    async fn play_pause(&mut self) -> Response {
        if self.is_active() {
            self.stop().await;
            return Response::Ack;
        }
        let name = match self.store.get_last() {
            Some(station) => station.name.clone(),
            None => match self.store.stations().next() {
                Some(station) => station.name.clone(),
                None => return Response::Ignored,
            },
        };
        self.start_station(&name).await
    }

    async fn step(&mut self, direction: Direction) -> Response {
        let names = self.navigation_list();
        if names.is_empty() {
            return Response::Ignored;
        }
        let len = names.len();
        let pivot = self
            .store
            .last_name()
            .and_then(|last| names.iter().position(|n| n == last));
        let idx = match (direction, pivot) {
            (Direction::Next, Some(i)) => (i + 1) % len,
            (Direction::Prev, Some(i)) => (i + len - 1) % len,
            (Direction::Next, None) => 0,
            (Direction::Prev, None) => len - 1,
        };
        let name = names[idx].clone();
        self.start_station(&name).await
    }

    /// Stations `next`/`prev` walk through, in order.
    fn navigation_list(&self) -> Vec<String> {
        let all = self.store.stations().map(|s| s.name.clone());
        match self.config.navigation {
            NavigationOrder::Catalog => all.collect(),
            NavigationOrder::Visible => self.store.visible().map(|s| s.name.clone()).collect(),
            NavigationOrder::FavoritesFirst => {
                let mut names = self.store.favorites().to_vec();
                names.extend(all.filter(|n| !self.store.is_favorite(n)));
                names
            }
        }
    }

    /// Explicit switch to `name`: a fresh retry budget on its current stream.
    async fn start_station(&mut self, name: &str) -> Response {
        if let Err(e) = self.store.set_last(name).await {
            warn!("coordinator: cannot select '{}': {}", name, e);
            return rejected(e);
        }
        if self.state != PlaybackState::Stopped {
            self.set_state(PlaybackState::Stopped).await;
        }
        self.attempts = 0;

        let Some(url) = self.store.select_stream(None) else {
            warn!("coordinator: '{}' has no playable stream", name);
            self.set_state(PlaybackState::Error).await;
            return Response::Ignored;
        };
        info!("coordinator: playing '{}' → {}", name, url);
        self.issue_play(&url).await;
        Response::Ack
    }

    /// Hand `url` to the audio host and enter Buffering, or Error if the host
    /// cannot be reached.
    async fn issue_play(&mut self, url: &str) {
        let result = match self.ensure_host().await {
            Some(host) => host.play(url).await,
            None => Err(anyhow::anyhow!("audio host unavailable")),
        };
        match result {
            Ok(()) => {
                self.set_state(PlaybackState::Buffering).await;
                self.buffering_since = Some(Instant::now());
            }
            Err(e) => {
                warn!("coordinator: play {} failed: {}", url, e);
                self.attempts = 0;
                self.set_state(PlaybackState::Error).await;
            }
        }
    }

    async fn replay_if_active(&mut self, url: Option<&str>) {
        if let Some(url) = url {
            if self.is_active() {
                self.attempts = 0;
                self.issue_play(url).await;
            }
        }
    }

    async fn stop(&mut self) {
        self.attempts = 0;
        if let Some(host) = self.host.as_mut() {
            if let Err(e) = host.stop().await {
                warn!("coordinator: audio host stop failed: {}", e);
            }
        }
        self.set_state(PlaybackState::Stopped).await;
    }

    fn is_active(&self) -> bool {
        self.state.is_active() || self.host.as_ref().is_some_and(|h| h.is_playing())
    }

    async fn ensure_host(&mut self) -> Option<&mut Box<dyn AudioHost>> {
        if self.host.is_none() {
            match self
                .launcher
                .launch(self.audio_tx.clone(), self.store.volume())
                .await
            {
                Ok(host) => {
                    info!("coordinator: audio host ready");
                    self.host = Some(host);
                }
                Err(e) => {
                    warn!("coordinator: failed to start audio host: {}", e);
                    return None;
                }
            }
        }
        self.host.as_mut()
    }

    // ── volume ────────────────────────────────────────────────────────────────

    async fn apply_volume(&mut self, volume: i64) -> Response {
        let volume = match self.store.set_volume(volume).await {
            Ok(v) => v,
            Err(e) => return rejected(e),
        };
        if let Some(host) = self.host.as_mut() {
            if let Err(e) = host.set_volume(volume).await {
                warn!("coordinator: audio host volume failed: {}", e);
            }
        }
        Response::Volume(volume)
    }

    /// Step the volume; at either bound this changes nothing.
    async fn nudge_volume(&mut self, delta: i64) -> Response {
        let current = self
            .host
            .as_ref()
            .map_or(self.store.volume(), |h| h.volume());
        let target = (i64::from(current) + delta).clamp(0, 100);
        if target == i64::from(current) {
            return Response::Volume(current);
        }
        self.apply_volume(target).await
    }

    // ── audio host events ─────────────────────────────────────────────────────

    pub async fn on_audio_event(&mut self, event: AudioEvent) {
        debug!("coordinator: audio event {:?} in {:?}", event, self.state);
        match event {
            AudioEvent::Starting => {
                if self.state.is_active() {
                    self.set_state(PlaybackState::Buffering).await;
                }
            }
            AudioEvent::Playing => {
                if self.state.is_active() {
                    self.attempts = 0;
                    self.set_state(PlaybackState::Playing).await;
                }
            }
            AudioEvent::Aborted => {
                if self.state.is_active() {
                    self.set_state(PlaybackState::Stopped).await;
                }
            }
            AudioEvent::Error(reason) => self.on_stream_error(&reason).await,
        }
    }

    /// Rotate to the next stream of the same station, up to `max_attempts`
    /// errors; then give up in the Error state.
    async fn on_stream_error(&mut self, reason: &str) {
        if matches!(self.state, PlaybackState::Stopped | PlaybackState::Error) {
            debug!("coordinator: stream error '{}' ignored in {:?}", reason, self.state);
            return;
        }

        self.attempts += 1;
        let max = self.config.max_attempts.max(1);
        if self.attempts < max {
            match self.store.next_stream() {
                Some(url) => {
                    warn!(
                        "coordinator: stream error '{}', failover {}/{} → {}",
                        reason, self.attempts, max, url
                    );
                    self.issue_play(&url).await;
                }
                None => {
                    warn!("coordinator: stream error '{}' and nothing to fail over to", reason);
                    self.give_up().await;
                }
            }
        } else {
            warn!(
                "coordinator: stream error '{}', giving up after {} attempts",
                reason, self.attempts
            );
            self.give_up().await;
        }
    }

    async fn give_up(&mut self) {
        self.attempts = 0;
        if let Some(host) = self.host.as_mut() {
            if let Err(e) = host.stop().await {
                warn!("coordinator: audio host stop failed: {}", e);
            }
        }
        self.set_state(PlaybackState::Error).await;
    }

    pub async fn on_heartbeat(&mut self) {
        let timeout = self.config.buffering_timeout_secs;
        if timeout == 0 || self.state != PlaybackState::Buffering {
            return;
        }
        if let Some(since) = self.buffering_since {
            if since.elapsed() >= Duration::from_secs(timeout) {
                self.on_stream_error("buffering timeout").await;
            }
        }
    }

    // ── state ─────────────────────────────────────────────────────────────────

    async fn set_state(&mut self, state: PlaybackState) {
        if state != PlaybackState::Buffering {
            self.buffering_since = None;
        }
        if self.state == state {
            return;
        }
        info!("coordinator: {:?} → {:?}", self.state, state);
        self.state = state;

        let station = self.store.get_last();
        let notice = StateNotice {
            state,
            station: station.map(|s| s.name.clone()),
            title: station.map(|s| s.title.clone()),
        };
        let delivered = self
            .bus
            .notify(Context::Background, Context::Popup, Action::StateChanged(notice))
            .await;
        if !delivered {
            debug!("coordinator: no popup listening for state change");
        }
    }

    async fn cleanup(&mut self) {
        info!("coordinator: cleanup in {:?}, stopping audio host", self.state());
        if let Some(mut host) = self.host.take() {
            if let Err(e) = host.stop().await {
                warn!("coordinator: audio host stop on shutdown failed: {}", e);
            }
        }
    }
}

fn rejected(e: StoreError) -> Response {
    warn!("coordinator: {}", e);
    Response::Rejected(e.to_string())
}

fn flag(result: Result<bool, StoreError>) -> Response {
    match result {
        Ok(changed) => Response::Flag(changed),
        Err(e) => rejected(e),
    }
}
