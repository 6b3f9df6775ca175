/// DaemonCore: single-owner event loop for all orchestration state.
///
/// Every input (client commands, player lifecycle events, timer expiries) is a
/// `DaemonEvent` on one mpsc queue.  DaemonCore owns the `Orchestrator`
/// exclusively; no other task touches it.  After each event that changed the
/// orchestrator's revision, the shared snapshot is refreshed and a
/// `BroadcastMessage::StateUpdated` goes out to all listeners.
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use tvplay_proto::protocol::{Command, PlaybackSnapshot};

use crate::collaborators::{PlayerEvent, TimerDue};
use crate::orchestrator::Orchestrator;
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client.
    ClientCommand(Command),
    /// Lifecycle transition reported by the player engine for the load
    /// started with `generation`.
    Player { event: PlayerEvent, generation: u64 },
    /// A scheduled overlay hide or reconnect came due.
    TimerDue(TimerDue),
    /// Shutdown requested.
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    orchestrator: Orchestrator,
    snapshot: Arc<RwLock<PlaybackSnapshot>>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    autoplay: bool,
    /// Revision last published to `snapshot`.
    published_rev: u64,
}

impl DaemonCore {
    pub fn new(
        orchestrator: Orchestrator,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        autoplay: bool,
    ) -> Self {
        let snapshot = Arc::new(RwLock::new(orchestrator.snapshot()));
        let published_rev = orchestrator.rev();
        Self {
            orchestrator,
            snapshot,
            broadcast_tx,
            autoplay,
            published_rev,
        }
    }

    /// Shared read-only view for the socket server.
    pub fn snapshot(&self) -> Arc<RwLock<PlaybackSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Run the core event loop until a `Shutdown` event, then return the
    /// orchestrator.  The orchestrator's timer holds a sender to this queue,
    /// so the queue never closes on its own.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> Orchestrator {
        info!("DaemonCore: starting event loop");

        if self.autoplay {
            self.orchestrator.resume();
            self.publish().await;
        }

        while let Some(event) = event_rx.recv().await {
            match event {
                DaemonEvent::Shutdown => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }

                DaemonEvent::ClientCommand(cmd) => {
                    info!("DaemonCore: command {:?}", cmd);
                    self.handle_command(cmd);
                }

                DaemonEvent::Player { event, generation } => {
                    debug!("DaemonCore: player {:?} gen={}", event, generation);
                    self.orchestrator.on_player_event(event, generation);
                }

                DaemonEvent::TimerDue(due) => self.orchestrator.on_timer(due),
            }
            self.publish().await;
        }

        self.orchestrator.stop();
        self.publish().await;
        self.orchestrator
    }

    fn handle_command(&mut self, cmd: Command) {
        let orch = &mut self.orchestrator;
        match cmd {
            Command::SelectChannel {
                channel_idx,
                url_idx,
                programme,
            } => match orch.channel_at(channel_idx) {
                Some(channel) => orch.select_channel(&channel, url_idx, programme),
                None => warn!("DaemonCore: no channel at index {}", channel_idx),
            },
            Command::Next => orch.to_next(),
            Command::Prev => orch.to_previous(),
            Command::ToggleFavorite { channel_idx } => match orch.channel_at(channel_idx) {
                Some(channel) => orch.toggle_favorite(&channel),
                None => warn!("DaemonCore: no channel at index {}", channel_idx),
            },
            Command::ToggleReservation {
                channel_idx,
                programme,
            } => match orch.channel_at(channel_idx) {
                Some(channel) => orch.toggle_reservation(&channel, &programme),
                None => warn!("DaemonCore: no channel at index {}", channel_idx),
            },
            Command::SetFavoritesVisible { visible } => orch.set_favorites_visible(visible),
            Command::Stop => orch.stop(),
            Command::GetState => {
                // State will be broadcast automatically
            }
        }
    }

    async fn publish(&mut self) {
        let rev = self.orchestrator.rev();
        if rev == self.published_rev {
            return;
        }
        self.published_rev = rev;
        *self.snapshot.write().await = self.orchestrator.snapshot();
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        Notifier, PassthroughTimeShift, PatternClassifier, PlayerEngine, StaticDirectory,
        TokioTimer, WebSurface,
    };
    use crate::orchestrator::{Collaborators, OrchestratorSettings};
    use std::sync::Mutex;
    use std::time::Duration;
    use tvplay_proto::channels::ChannelDirectory;
    use tvplay_proto::config::PlaybackConfig;
    use tvplay_proto::protocol::{Channel, PlaybackStatus};
    use tvplay_proto::state::{MemoryStore, PersistentState};

    /// (url, generation) per load.
    type Prepared = Arc<Mutex<Vec<(String, u64)>>>;

    struct RecordingPlayer(Prepared);

    impl PlayerEngine for RecordingPlayer {
        fn prepare(&mut self, _channel: &Channel, _url_idx: usize, url: &str, generation: u64) {
            self.0.lock().unwrap().push((url.to_string(), generation));
        }

        fn stop(&mut self) {}
    }

    struct Silent;

    impl Notifier for Silent {
        fn show(&self, _message: &str) {}
    }

    impl WebSurface for Silent {
        fn show(&mut self, _url: &str) {}
    }

    fn channels() -> Vec<Channel> {
        ["One", "Two", "Three"]
            .iter()
            .map(|n| Channel {
                name: n.to_string(),
                urls: vec![
                    format!("http://a.example/{n}"),
                    format!("http://b.example/{n}"),
                ],
                group: "Test".to_string(),
            })
            .collect()
    }

    fn core(
        event_tx: mpsc::Sender<DaemonEvent>,
        prepared: Prepared,
        state: PersistentState,
        autoplay: bool,
    ) -> (DaemonCore, broadcast::Receiver<BroadcastMessage>) {
        let config = PlaybackConfig::default();
        let io = Collaborators {
            player: Box::new(RecordingPlayer(prepared)),
            classifier: Box::new(PatternClassifier::default()),
            transformer: Box::new(PassthroughTimeShift),
            web_surface: Box::new(Silent),
            store: Box::new(MemoryStore::new(state)),
            notifier: Box::new(Silent),
            directory: Box::new(StaticDirectory(Arc::new(ChannelDirectory::new(channels())))),
            timer: Box::new(TokioTimer::new(event_tx)),
        };
        let orchestrator = Orchestrator::new(io, OrchestratorSettings::from(&config));
        let (broadcast_tx, broadcast_rx) = broadcast::channel(64);
        (DaemonCore::new(orchestrator, broadcast_tx, autoplay), broadcast_rx)
    }

    fn urls(prepared: &Prepared) -> Vec<String> {
        prepared.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    fn last_generation(prepared: &Prepared) -> u64 {
        prepared.lock().unwrap().last().map(|(_, g)| *g).unwrap()
    }

    /// Let the spawned core drain its queue.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_and_player_events_flow_through_loop() {
        let (tx, rx) = mpsc::channel(64);
        let prepared = Prepared::default();
        let (core, mut broadcast_rx) =
            core(tx.clone(), prepared.clone(), PersistentState::default(), true);
        let snapshot = core.snapshot();
        let handle = tokio::spawn(core.run(rx));

        tx.send(DaemonEvent::ClientCommand(Command::Next)).await.unwrap();
        settle().await;
        let generation = last_generation(&prepared);
        tx.send(DaemonEvent::Player {
            event: PlayerEvent::Error,
            generation,
        })
        .await
        .unwrap();
        settle().await;
        let generation = last_generation(&prepared);
        tx.send(DaemonEvent::Player {
            event: PlayerEvent::Ready,
            generation,
        })
        .await
        .unwrap();
        tx.send(DaemonEvent::ClientCommand(Command::ToggleFavorite { channel_idx: 1 }))
            .await
            .unwrap();

        // let the overlay hide timers come due
        tokio::time::sleep(Duration::from_secs(10)).await;
        {
            let snap = snapshot.read().await;
            assert_eq!(snap.channel.as_deref(), Some("Two"));
            assert_eq!(snap.url_idx, 1);
            assert_eq!(snap.status, PlaybackStatus::Playing);
            assert_eq!(snap.favorites, vec!["Two"]);
            assert!(!snap.overlay_visible);
        }

        tx.send(DaemonEvent::Shutdown).await.unwrap();
        let orch = handle.await.unwrap();
        assert_eq!(orch.status(), PlaybackStatus::Idle);
        assert!(orch.playable_hosts().contains("b.example"));

        assert_eq!(
            urls(&prepared),
            vec![
                "http://a.example/One".to_string(),
                "http://a.example/Two".to_string(),
                "http://b.example/Two".to_string(),
            ]
        );
        assert!(matches!(
            broadcast_rx.try_recv(),
            Ok(BroadcastMessage::StateUpdated)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_queued_behind_channel_switch_is_dropped() {
        let (tx, rx) = mpsc::channel(64);
        let prepared = Prepared::default();
        let state = PersistentState {
            playable_hosts: ["a.example".to_string()].into_iter().collect(),
            ..PersistentState::default()
        };
        let (core, _broadcast_rx) = core(tx.clone(), prepared.clone(), state, true);
        let snapshot = core.snapshot();
        let handle = tokio::spawn(core.run(rx));

        settle().await;
        let one = last_generation(&prepared);
        tx.send(DaemonEvent::ClientCommand(Command::SelectChannel {
            channel_idx: 1,
            url_idx: None,
            programme: None,
        }))
        .await
        .unwrap();
        tx.send(DaemonEvent::Player {
            event: PlayerEvent::Error,
            generation: one,
        })
        .await
        .unwrap();
        settle().await;

        assert_eq!(snapshot.read().await.url_idx, 0);
        tx.send(DaemonEvent::Shutdown).await.unwrap();
        let orch = handle.await.unwrap();
        assert!(orch.playable_hosts().contains("a.example"));
        assert_eq!(
            urls(&prepared),
            vec![
                "http://a.example/One".to_string(),
                "http://a.example/Two".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_channel_index_is_ignored() {
        let (tx, rx) = mpsc::channel(8);
        let prepared = Prepared::default();
        let (core, _broadcast_rx) =
            core(tx.clone(), prepared.clone(), PersistentState::default(), false);
        let handle = tokio::spawn(core.run(rx));

        tx.send(DaemonEvent::ClientCommand(Command::SelectChannel {
            channel_idx: 99,
            url_idx: None,
            programme: None,
        }))
        .await
        .unwrap();
        tx.send(DaemonEvent::Shutdown).await.unwrap();

        let orch = handle.await.unwrap();
        assert_eq!(orch.current_channel().map(|c| c.name.as_str()), Some("One"));
        assert!(prepared.lock().unwrap().is_empty());
    }
}
