mod audio;
mod core;
mod http;
mod mpv;
mod socket;

use std::sync::Arc;

use airwave_proto::bus::{MessageBus, MAILBOX_CAPACITY};
use airwave_proto::catalog::load_catalog;
use airwave_proto::config::Config;
use airwave_proto::protocol::{Action, Context};
use airwave_proto::storage::JsonFileStorage;
use airwave_proto::store::StationStore;
use airwave_proto::{migrate, platform};
use anyhow::Context as _;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Fan-out to every attached UI client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// Something delivered to the `popup` context.
    Notice(Action),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is OK
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,airwave_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let storage = Arc::new(
        JsonFileStorage::open(&config.daemon.storage_file)
            .await
            .with_context(|| format!("opening {:?}", config.daemon.storage_file))?,
    );
    let found = migrate::run(&*storage).await?;
    info!("Storage {:?} (schema v{})", storage.path(), found);

    let catalog = load_catalog(&config.catalog).await?;
    let store = StationStore::load(storage, catalog, config.playback.default_volume).await?;

    // background and offscreen share the coordinator's mailbox
    let bus = MessageBus::new();
    let (mailbox_tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
    bus.register_sender(Context::Background, mailbox_tx.clone()).await;
    bus.register_sender(Context::Offscreen, mailbox_tx).await;

    let coordinator = core::Coordinator::new(
        config.playback.clone(),
        store,
        bus.clone(),
        Box::new(mpv::MpvLauncher),
    );
    let core_handle = tokio::spawn(coordinator.run(mailbox));

    let _socket_handle = socket::start_server(
        platform::daemon_address(config.daemon.port),
        bus.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            bus.clone(),
        );
    }

    info!("Daemon initialised, waiting for requests");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    // dropping the routes closes the mailbox; the coordinator drains and exits
    bus.unregister(Context::Background).await;
    bus.unregister(Context::Offscreen).await;
    core_handle.await??;

    Ok(())
}
