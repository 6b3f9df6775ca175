//! Channel playback orchestrator: the selection state machine.
//!
//! Owns which channel is showing, which of its candidate URLs is active and
//! whether a past programme is being replayed.  Every mutation happens on the
//! `DaemonCore` loop, so there is no locking here; deferred work (overlay
//! hides, paced reconnects) goes through the `Timer` collaborator and comes
//! back as `on_timer` calls that re-check the state they captured.
//!
//! Transitions:
//!   Idle -> Connecting | WebSurface          (select / resume)
//!   Connecting -> Playing                   (player ready)
//!   Connecting | Playing -> Connecting      (error with sources left, interrupt)
//!   Connecting | Playing -> Error           (last source failed)
//!   any -> Idle                             (stop)

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};
use tvplay_proto::config::{PlaybackConfig, ReconnectConfig};
use tvplay_proto::protocol::{
    Channel, EpgProgramme, EpgProgrammeReserve, PlaybackSnapshot, PlaybackStatus,
};
use tvplay_proto::state::SettingsStore;

use crate::collaborators::{
    ChannelDirectoryProvider, Notifier, PlayerEngine, PlayerEvent, TimeShiftTransformer, Timer,
    TimerDue, UrlClassifier, WebSurface,
};
use crate::host_cache::PlayableHostCache;
use crate::navigation::{self, Direction, NavContext, NavOutcome};
use crate::overlay::{OverlayKey, OverlayScheduler};
use crate::timeshift;

pub struct Collaborators {
    pub player: Box<dyn PlayerEngine>,
    pub classifier: Box<dyn UrlClassifier>,
    pub transformer: Box<dyn TimeShiftTransformer>,
    pub web_surface: Box<dyn WebSurface>,
    pub store: Box<dyn SettingsStore>,
    pub notifier: Box<dyn Notifier>,
    pub directory: Box<dyn ChannelDirectoryProvider>,
    pub timer: Box<dyn Timer>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub overlay_hide_delay: Duration,
    pub favorites_boundary_jump_out: bool,
    pub seek_param: String,
    pub reconnect: ReconnectConfig,
}

impl From<&PlaybackConfig> for OrchestratorSettings {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            overlay_hide_delay: config.overlay_hide_delay(),
            favorites_boundary_jump_out: config.favorites_boundary_jump_out,
            seek_param: config.seek_param.clone(),
            reconnect: config.reconnect.clone(),
        }
    }
}

pub struct Orchestrator {
    io: Collaborators,
    settings: OrchestratorSettings,
    hosts: PlayableHostCache,
    favorites: BTreeSet<String>,
    reservations: Vec<EpgProgrammeReserve>,
    channel: Option<Channel>,
    /// Always a valid index into `channel.urls`.
    url_idx: usize,
    /// Set only while replaying a past programme.
    timeshift: Option<EpgProgramme>,
    /// `channel`/`url_idx` were actually handed out this session, as opposed
    /// to restored from the store.
    source_applied: bool,
    /// The URL last handed to the player or web surface.
    current_url: Option<String>,
    overlay: OverlayScheduler,
    favorites_visible: bool,
    status: PlaybackStatus,
    /// Interrupt reconnects since the last ready event or user selection.
    reconnect_attempts: u32,
    /// Bumped on every emission and on stop; pending reconnects carry it.
    generation: u64,
    rev: u64,
}

impl Orchestrator {
    pub fn new(io: Collaborators, settings: OrchestratorSettings) -> Self {
        let hosts = PlayableHostCache::new(io.store.playable_hosts());
        let favorites = io.store.favorites();
        let reservations = io.store.reservations();

        let directory = io.directory.snapshot();
        let channel = io
            .store
            .last_channel_idx()
            .and_then(|idx| directory.get(idx))
            .or_else(|| directory.get(0))
            .cloned();

        Self {
            overlay: OverlayScheduler::new(settings.overlay_hide_delay),
            io,
            settings,
            hosts,
            favorites,
            reservations,
            channel,
            url_idx: 0,
            timeshift: None,
            source_applied: false,
            current_url: None,
            favorites_visible: false,
            status: PlaybackStatus::Idle,
            reconnect_attempts: 0,
            generation: 0,
            rev: 1,
        }
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn current_channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn url_idx(&self) -> usize {
        self.url_idx
    }

    pub fn timeshift(&self) -> Option<&EpgProgramme> {
        self.timeshift.as_ref()
    }

    pub fn is_overlay_visible(&self) -> bool {
        self.overlay.is_visible()
    }

    pub fn is_favorites_visible(&self) -> bool {
        self.favorites_visible
    }

    pub fn favorites(&self) -> &BTreeSet<String> {
        &self.favorites
    }

    pub fn reservations(&self) -> &[EpgProgrammeReserve] {
        &self.reservations
    }

    pub fn playable_hosts(&self) -> &BTreeSet<String> {
        self.hosts.hosts()
    }

    pub fn channel_at(&self, idx: usize) -> Option<Channel> {
        self.io.directory.snapshot().get(idx).cloned()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let directory = self.io.directory.snapshot();
        PlaybackSnapshot {
            rev: self.rev,
            channel_idx: self
                .channel
                .as_ref()
                .and_then(|c| directory.index_of(&c.name)),
            channel: self.channel.as_ref().map(|c| c.name.clone()),
            url_idx: self.url_idx,
            url: self.current_url.clone(),
            timeshift: self.timeshift.clone(),
            status: self.status,
            overlay_visible: self.overlay.is_visible(),
            favorites_visible: self.favorites_visible,
            favorites: self.favorites.iter().cloned().collect(),
            reservations: self.reservations.clone(),
        }
    }

    // ── selection ─────────────────────────────────────────────────────────────

    /// Start the remembered (or first) channel.
    pub fn resume(&mut self) {
        if let Some(channel) = self.channel.clone() {
            self.select_channel(&channel, None, None);
        }
    }

    /// Switch to `channel`.  An explicit `url_idx` is wrapped into range; without
    /// one the first URL on a trusted host wins.  Re-selecting what is already
    /// playing does nothing.
    pub fn select_channel(
        &mut self,
        channel: &Channel,
        url_idx: Option<i64>,
        programme: Option<EpgProgramme>,
    ) {
        if channel.urls.is_empty() {
            warn!("select: channel '{}' has no urls", channel.name);
            return;
        }

        let resolved = self.resolve_url_idx(channel, url_idx);
        if self.is_active() && self.is_current(channel, resolved, programme.as_ref()) {
            debug!("select: already on '{}' #{}", channel.name, resolved);
            return;
        }

        // Moving away from a source on purpose counts against its host, even
        // after a stop.
        if self.source_applied && resolved != self.url_idx {
            if let Some(previous) = self
                .channel
                .as_ref()
                .filter(|c| c.name == channel.name)
                .map(|c| c.urls[self.url_idx].clone())
            {
                if self.hosts.evict_url(&previous) {
                    self.persist_hosts();
                }
            }
        }

        self.reconnect_attempts = 0;
        self.apply(channel.clone(), resolved, programme);
    }

    fn resolve_url_idx(&self, channel: &Channel, url_idx: Option<i64>) -> usize {
        let len = channel.urls.len();
        let idx = match url_idx {
            Some(idx) => idx.rem_euclid(len as i64) as usize,
            None => self.hosts.first_playable(&channel.urls).unwrap_or(0),
        };
        idx.min(len - 1)
    }

    fn is_current(&self, channel: &Channel, url_idx: usize, programme: Option<&EpgProgramme>) -> bool {
        self.channel.as_ref().is_some_and(|c| c.name == channel.name)
            && self.url_idx == url_idx
            && self.timeshift.as_ref() == programme
    }

    fn is_active(&self) -> bool {
        self.status != PlaybackStatus::Idle
    }

    /// The player owns the current selection and its events still matter.
    fn awaits_player(&self) -> bool {
        matches!(
            self.status,
            PlaybackStatus::Connecting | PlaybackStatus::Playing
        )
    }

    /// Commit a resolved selection and hand it to the player.
    fn apply(&mut self, channel: Channel, url_idx: usize, programme: Option<EpgProgramme>) {
        info!(
            "select: '{}' url #{}/{}{}",
            channel.name,
            url_idx + 1,
            channel.urls.len(),
            if programme.is_some() { " (timeshift)" } else { "" }
        );

        if let Some(idx) = self.io.directory.snapshot().index_of(&channel.name) {
            if let Err(e) = self.io.store.set_last_channel_idx(idx) {
                warn!("select: failed to remember channel: {}", e);
            }
        }

        let key = OverlayKey {
            channel: channel.name.clone(),
            url_idx,
        };
        self.channel = Some(channel);
        self.url_idx = url_idx;
        self.timeshift = programme;
        self.source_applied = true;
        self.overlay.show(key, self.io.timer.as_ref());
        self.emit();
    }

    fn emit(&mut self) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let url = timeshift::playback_url(
            &channel.urls[self.url_idx],
            self.timeshift.as_ref(),
            &self.settings.seek_param,
            self.io.transformer.as_ref(),
        );

        self.generation += 1;
        if self.io.classifier.is_web_surface_url(&url) {
            self.io.player.stop();
            self.io.web_surface.show(&url);
            self.status = PlaybackStatus::WebSurface;
        } else {
            self.io.player.prepare(channel, self.url_idx, &url, self.generation);
            self.status = PlaybackStatus::Connecting;
        }
        self.current_url = Some(url);
        self.rev += 1;
    }

    fn base_url(&self) -> Option<&str> {
        self.channel
            .as_ref()
            .map(|c| c.urls[self.url_idx].as_str())
    }

    fn overlay_key(&self) -> Option<OverlayKey> {
        self.channel.as_ref().map(|c| OverlayKey {
            channel: c.name.clone(),
            url_idx: self.url_idx,
        })
    }

    fn persist_hosts(&mut self) {
        if let Err(e) = self.io.store.set_playable_hosts(self.hosts.hosts().clone()) {
            warn!("failed to persist playable hosts: {}", e);
        }
    }

    pub fn stop(&mut self) {
        info!("stop");
        self.io.player.stop();
        self.status = PlaybackStatus::Idle;
        self.timeshift = None;
        self.current_url = None;
        self.generation += 1;
        self.rev += 1;
    }

    // ── player events ─────────────────────────────────────────────────────────

    /// Entry point for engine events.  Only events for the most recent load
    /// count; anything older was queued before the selection changed.
    pub fn on_player_event(&mut self, event: PlayerEvent, generation: u64) {
        if generation != self.generation {
            debug!(
                "player: dropping {:?} from load gen={} (current {})",
                event, generation, self.generation
            );
            return;
        }
        match event {
            PlayerEvent::Ready => self.on_playback_ready(),
            PlayerEvent::Error => self.on_playback_error(),
            PlayerEvent::Interrupted => self.on_playback_interrupt(),
        }
    }

    fn on_playback_ready(&mut self) {
        if !self.awaits_player() {
            return;
        }
        let Some(url) = self.base_url().map(str::to_string) else {
            return;
        };
        info!("player: ready on {}", url);

        self.status = PlaybackStatus::Playing;
        self.reconnect_attempts = 0;
        if self.hosts.insert_url(&url) {
            self.persist_hosts();
        }
        if let Some(key) = self.overlay_key() {
            self.overlay.arm(key, self.io.timer.as_ref());
        }
        self.rev += 1;
    }

    /// Fail over to the next candidate URL of the same channel.
    fn on_playback_error(&mut self) {
        if !self.awaits_player() {
            return;
        }
        if self.timeshift.is_some() {
            debug!("player: error during timeshift, no failover");
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };

        let failed = &channel.urls[self.url_idx];
        warn!("player: '{}' failed on {}", channel.name, failed);
        if self.hosts.evict_url(failed) {
            self.persist_hosts();
        }

        let next = self.url_idx + 1;
        if next < channel.urls.len() {
            self.apply(channel, next, None);
        } else {
            warn!("player: no sources left for '{}'", channel.name);
            self.status = PlaybackStatus::Error;
            self.rev += 1;
            self.io
                .notifier
                .show(&format!("No working source left for '{}'", channel.name));
        }
    }

    /// Replay the exact same selection, paced by the reconnect policy.
    fn on_playback_interrupt(&mut self) {
        if !self.awaits_player() || self.channel.is_none() {
            return;
        }

        self.reconnect_attempts += 1;
        match self.settings.reconnect.delay_for(self.reconnect_attempts) {
            None => {
                warn!(
                    "player: giving up after {} reconnects",
                    self.reconnect_attempts - 1
                );
                self.status = PlaybackStatus::Error;
                self.rev += 1;
                if let Some(channel) = &self.channel {
                    self.io
                        .notifier
                        .show(&format!("Lost connection to '{}'", channel.name));
                }
            }
            Some(delay) if delay.is_zero() => {
                info!("player: interrupted, reconnecting");
                self.reconnect();
            }
            Some(delay) => {
                info!(
                    "player: interrupted, reconnect #{} in {:?}",
                    self.reconnect_attempts, delay
                );
                self.io.timer.schedule(
                    delay,
                    TimerDue::Reconnect {
                        generation: self.generation,
                    },
                );
            }
        }
    }

    fn reconnect(&mut self) {
        if let Some(channel) = self.channel.clone() {
            let programme = self.timeshift.clone();
            self.apply(channel, self.url_idx, programme);
        }
    }

    pub fn on_timer(&mut self, due: TimerDue) {
        match due {
            TimerDue::OverlayHide(key) => {
                if self.overlay.on_due(&key, self.overlay_key().as_ref()) {
                    self.rev += 1;
                }
            }
            TimerDue::Reconnect { generation } => {
                if generation == self.generation && self.awaits_player() {
                    self.reconnect();
                } else {
                    debug!("player: dropping stale reconnect gen={}", generation);
                }
            }
        }
    }

    // ── navigation ────────────────────────────────────────────────────────────

    pub fn to_next(&mut self) {
        self.navigate(Direction::Next);
    }

    pub fn to_previous(&mut self) {
        self.navigate(Direction::Prev);
    }

    fn navigate(&mut self, direction: Direction) {
        let directory = self.io.directory.snapshot();
        let current = self
            .channel
            .as_ref()
            .and_then(|c| directory.index_of(&c.name));
        let ctx = NavContext {
            favorites: &self.favorites,
            favorites_visible: self.favorites_visible,
            boundary_jump_out: self.settings.favorites_boundary_jump_out,
        };

        match navigation::resolve(&directory, current, direction, ctx) {
            NavOutcome::Stay => debug!("navigate {:?}: nowhere to go", direction),
            NavOutcome::Select {
                idx,
                leave_favorites,
            } => {
                if leave_favorites {
                    self.set_favorites_visible(false);
                }
                if let Some(channel) = directory.get(idx) {
                    self.select_channel(channel, None, None);
                }
            }
        }
    }

    pub fn set_favorites_visible(&mut self, visible: bool) {
        if self.favorites_visible != visible {
            self.favorites_visible = visible;
            self.rev += 1;
        }
    }

    // ── favorites & reservations ──────────────────────────────────────────────

    pub fn toggle_favorite(&mut self, channel: &Channel) {
        let message = if self.favorites.remove(&channel.name) {
            format!("Removed '{}' from favorites", channel.name)
        } else {
            self.favorites.insert(channel.name.clone());
            format!("Added '{}' to favorites", channel.name)
        };
        if let Err(e) = self.io.store.set_favorites(self.favorites.clone()) {
            warn!("failed to persist favorites: {}", e);
        }
        self.rev += 1;
        self.io.notifier.show(&message);
    }

    pub fn toggle_reservation(&mut self, channel: &Channel, programme: &EpgProgramme) {
        let existing = self
            .reservations
            .iter()
            .position(|r| r.matches(channel, programme));
        let message = match existing {
            Some(pos) => {
                self.reservations.remove(pos);
                format!("Cancelled reservation for '{}'", programme.title)
            }
            None => {
                self.reservations
                    .push(EpgProgrammeReserve::new(channel, programme));
                format!("Reserved '{}' on {}", programme.title, channel.name)
            }
        };
        if let Err(e) = self.io.store.set_reservations(self.reservations.clone()) {
            warn!("failed to persist reservations: {}", e);
        }
        self.rev += 1;
        self.io.notifier.show(&message);
    }
}
