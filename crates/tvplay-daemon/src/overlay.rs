//! Transient "now playing" overlay.
//!
//! Every show schedules its own hide carrying the (channel, url index) that
//! triggered it.  When the hide comes due it only takes effect if that pair is
//! still current, so a newer selection silently outlives older timers and
//! nothing is ever cancelled.

use std::time::Duration;

use tracing::debug;

use crate::collaborators::{Timer, TimerDue};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverlayKey {
    pub channel: String,
    pub url_idx: usize,
}

#[derive(Debug)]
pub struct OverlayScheduler {
    delay: Duration,
    visible: bool,
}

impl OverlayScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            visible: false,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn show(&mut self, key: OverlayKey, timer: &dyn Timer) {
        self.visible = true;
        self.arm(key, timer);
    }

    /// Schedule a hide without changing visibility.
    pub fn arm(&self, key: OverlayKey, timer: &dyn Timer) {
        timer.schedule(self.delay, TimerDue::OverlayHide(key));
    }

    /// Returns true if the overlay was hidden.
    pub fn on_due(&mut self, due: &OverlayKey, current: Option<&OverlayKey>) -> bool {
        if !self.visible {
            return false;
        }
        if current != Some(due) {
            debug!("overlay: stale hide for {:?}, keeping overlay", due);
            return false;
        }
        self.visible = false;
        true
    }
}
