//! Narrow contracts between the orchestrator and everything it drives.
//!
//! The orchestrator only ever talks to these traits; `DaemonCore` wires the
//! concrete implementations below (mpv, broadcast channel, tokio timers).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use tvplay_proto::channels::ChannelDirectory;
use tvplay_proto::protocol::Channel;

use crate::core::DaemonEvent;
use crate::overlay::OverlayKey;
use crate::BroadcastMessage;

/// Lifecycle transitions reported by the player engine.  Each fires at most
/// once per load and comes back tagged with the generation passed to
/// `PlayerEngine::prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Ready,
    Error,
    Interrupted,
}

/// Native decode/render engine.
pub trait PlayerEngine: Send {
    fn prepare(&mut self, channel: &Channel, url_idx: usize, url: &str, generation: u64);
    fn stop(&mut self);
}

/// Decides whether a URL must be rendered by the embedded web surface.
pub trait UrlClassifier: Send {
    fn is_web_surface_url(&self, url: &str) -> bool;
}

/// Rewrites a URL carrying a seek window into whatever the upstream expects.
/// Must be idempotent.
pub trait TimeShiftTransformer: Send {
    fn to_seekable_url(&self, url: &str) -> String;
}

pub trait WebSurface: Send {
    fn show(&mut self, url: &str);
}

pub trait Notifier: Send {
    fn show(&self, message: &str);
}

/// Read-only view of the current channel list.  Queried again on every
/// navigation call.
pub trait ChannelDirectoryProvider: Send {
    fn snapshot(&self) -> Arc<ChannelDirectory>;
}

/// Deferred work posted back to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerDue {
    OverlayHide(OverlayKey),
    /// Reconnect after an interruption, valid only while the emission
    /// `generation` is still current.
    Reconnect { generation: u64 },
}

pub trait Timer: Send {
    fn schedule(&self, delay: Duration, due: TimerDue);
}

// ── default implementations ───────────────────────────────────────────────────

/// Substring match against configured patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternClassifier {
    patterns: Vec<String>,
}

impl PatternClassifier {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }
}

impl UrlClassifier for PatternClassifier {
    fn is_web_surface_url(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| url.contains(p.as_str()))
    }
}

/// Servers that understand the seek query directly need no rewriting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTimeShift;

impl TimeShiftTransformer for PassthroughTimeShift {
    fn to_seekable_url(&self, url: &str) -> String {
        url.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct StaticDirectory(pub Arc<ChannelDirectory>);

impl ChannelDirectoryProvider for StaticDirectory {
    fn snapshot(&self) -> Arc<ChannelDirectory> {
        Arc::clone(&self.0)
    }
}

/// Forwards notifications to connected clients.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { tx }
    }
}

impl Notifier for BroadcastNotifier {
    fn show(&self, message: &str) {
        info!("notice: {}", message);
        // no receivers is OK
        let _ = self.tx.send(BroadcastMessage::Notice(message.to_string()));
    }
}

/// Asks connected clients to render the URL in their web view.
pub struct BroadcastWebSurface {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastWebSurface {
    pub fn new(tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { tx }
    }
}

impl WebSurface for BroadcastWebSurface {
    fn show(&mut self, url: &str) {
        info!("web surface: {}", url);
        let _ = self.tx.send(BroadcastMessage::WebSurface(url.to_string()));
    }
}

/// Sleeps on the runtime and posts the due item into the core event queue.
pub struct TokioTimer {
    tx: mpsc::Sender<DaemonEvent>,
}

impl TokioTimer {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self { tx }
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, due: TimerDue) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(DaemonEvent::TimerDue(due)).await.is_err() {
                debug!("timer fired after core shutdown");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_classifier() {
        let classifier = PatternClassifier::new(vec![
            "youtube.com/".to_string(),
            String::new(),
            "/embed/".to_string(),
        ]);
        assert!(classifier.is_web_surface_url("https://www.youtube.com/watch?v=1"));
        assert!(classifier.is_web_surface_url("https://tv.example/embed/5"));
        assert!(!classifier.is_web_surface_url("http://a.example/live.m3u8"));
        assert!(!PatternClassifier::default().is_web_surface_url("https://youtube.com/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_posts_after_delay() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = TokioTimer::new(tx);
        let key = OverlayKey {
            channel: "CCTV-1".to_string(),
            url_idx: 0,
        };
        timer.schedule(Duration::from_secs(3), TimerDue::OverlayHide(key.clone()));

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(rx.try_recv().is_err());

        match rx.recv().await {
            Some(DaemonEvent::TimerDue(TimerDue::OverlayHide(k))) => assert_eq!(k, key),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_notifier_without_receivers() {
        let (tx, _) = broadcast::channel(4);
        BroadcastNotifier::new(tx.clone()).show("Added 'X' to favorites");

        let mut rx = tx.subscribe();
        BroadcastNotifier::new(tx).show("Removed 'X' from favorites");
        match rx.try_recv() {
            Ok(BroadcastMessage::Notice(msg)) => assert_eq!(msg, "Removed 'X' from favorites"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
