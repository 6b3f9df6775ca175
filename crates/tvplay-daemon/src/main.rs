mod collaborators;
mod core;
mod host_cache;
mod mpv;
mod navigation;
mod orchestrator;
mod overlay;
mod socket;
mod timeshift;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tvplay_proto::channels::{load_directory_from_toml, ChannelDirectory};
use tvplay_proto::config::Config;
use tvplay_proto::state::JsonFileStore;

use crate::collaborators::{
    BroadcastNotifier, BroadcastWebSurface, PassthroughTimeShift, PatternClassifier,
    StaticDirectory, TokioTimer,
};
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Notice(String),
    WebSurface(String),
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
        // WARN and ERROR only
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

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

fn load_directory(config: &Config) -> ChannelDirectory {
    let path = &config.channels.channels_toml;
    match load_directory_from_toml(path) {
        Ok(directory) => {
            info!("Loaded {} channels from {:?}", directory.len(), path);
            directory
        }
        Err(e) => {
            warn!("Could not load channels from {:?}: {}", path, e);
            ChannelDirectory::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = tvplay_proto::platform::data_dir();
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
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tvplay_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let store = JsonFileStore::open(config.daemon.state_file.clone());
    let state_writer = store.writer();

    let io = Collaborators {
        player: Box::new(mpv::MpvPlayer::spawn(&config.player, event_tx.clone())),
        classifier: Box::new(PatternClassifier::new(
            config.web_surface.url_patterns.clone(),
        )),
        transformer: Box::new(PassthroughTimeShift),
        web_surface: Box::new(BroadcastWebSurface::new(broadcast_tx.clone())),
        store: Box::new(store),
        notifier: Box::new(BroadcastNotifier::new(broadcast_tx.clone())),
        directory: Box::new(StaticDirectory(Arc::new(load_directory(&config)))),
        timer: Box::new(TokioTimer::new(event_tx.clone())),
    };
    let orchestrator = Orchestrator::new(io, OrchestratorSettings::from(&config.playback));
    let daemon_core = core::DaemonCore::new(orchestrator, broadcast_tx.clone(), config.daemon.autoplay);

    let _socket_handle = socket::start_server(
        config.daemon.bind_address.clone(),
        config.daemon.port,
        daemon_core.snapshot(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await;
    state_writer.flush().await;
    info!("Daemon stopped");

    Ok(())
}
