//! Audio host capability consumed by the coordinator.
//!
//! Calls are fire-and-forget: `play` only hands the URL over.  Whether the
//! stream actually plays is reported later on the event channel the host
//! was launched with.
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Lifecycle events emitted by an audio host.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// A new stream was handed to the decoder.
    Starting,
    /// Audio is flowing.
    Playing,
    /// Playback was cut without an error (explicit stop, host quit).
    Aborted,
    /// The stream failed or stalled.
    Error(String),
}

#[async_trait]
pub trait AudioHost: Send {
    async fn play(&mut self, url: &str) -> anyhow::Result<()>;
    async fn stop(&mut self) -> anyhow::Result<()>;
    /// `volume` is 0-100.
    async fn set_volume(&mut self, volume: u8) -> anyhow::Result<()>;
    fn volume(&self) -> u8;
    fn is_playing(&self) -> bool;
}

/// Creates the audio host on first use.  The coordinator owns the launcher
/// and calls it lazily, once, on the first playback action.
#[async_trait]
pub trait HostLauncher: Send {
    async fn launch(
        &mut self,
        events: mpsc::Sender<AudioEvent>,
        volume: u8,
    ) -> anyhow::Result<Box<dyn AudioHost>>;
}
