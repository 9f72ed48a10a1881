mod audio;
mod core;
mod crossfade;
mod http;
mod mpv;
mod poller;
mod retry;
mod socket;

use std::sync::Arc;
use std::time::Duration;

use commons_proto::config::Config;
use commons_proto::icy::IcyProbe;
use commons_proto::protocol::NowPlaying;
use commons_proto::store::JsonFileStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    NowPlayingUpdated(Option<NowPlaying>),
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
        // Clients only see problems; the file log has everything.
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine.
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

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = commons_proto::platform::data_dir();
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
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,commons_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let stations = commons_proto::state::load_stations(&config).await?;
    let store = JsonFileStore::open(&config.daemon.prefs_file);

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = mpsc::channel::<core::DaemonEvent>(256);

    // Audio source events are forwarded into the same loop.
    let (source_tx, mut source_rx) = mpsc::channel::<audio::SourceEvent>(64);
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(evt) = source_rx.recv().await {
            if forward_tx.send(core::DaemonEvent::Source(evt)).await.is_err() {
                break;
            }
        }
    });

    let probe = Arc::new(IcyProbe::new(
        Duration::from_secs(config.now_playing.probe_timeout_secs),
        config.now_playing.read_ahead_bytes,
    )?);

    let daemon_core = core::DaemonCore::new(
        &config,
        mpv::MpvBackend::new(source_tx),
        Arc::clone(&probe),
        stations,
        Box::new(store),
        broadcast_tx.clone(),
        event_tx.clone(),
    )
    .await;

    let state_manager = daemon_core.state_manager();

    let clients = Arc::new(tokio::sync::RwLock::new(Vec::<socket::ClientHandle>::new()));

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        commons_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        clients,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: state_manager.clone(),
                event_tx: event_tx.clone(),
                probe,
            },
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    Ok(())
}
