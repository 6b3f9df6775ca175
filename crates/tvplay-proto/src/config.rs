use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub web_surface: WebSurfaceConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// JSON file holding favorites, reservations, playable hosts and the
    /// last channel index.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Resume the last channel as soon as the daemon starts.
    #[serde(default = "default_true")]
    pub autoplay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// A load that produces no frames within this window counts as a failure.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Explicit mpv binary; searched for when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_overlay_hide_delay_ms")]
    pub overlay_hide_delay_ms: u64,
    /// When navigating favorites past either end, leave the favorites list and
    /// keep going through the full directory instead of wrapping around.
    #[serde(default = "default_true")]
    pub favorites_boundary_jump_out: bool,
    /// Query parameter used to request a catch-up window from the server.
    #[serde(default = "default_seek_param")]
    pub seek_param: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Pacing for reconnects triggered by playback interruptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSurfaceConfig {
    /// URLs containing any of these substrings are rendered by the embedded
    /// web surface instead of mpv.
    #[serde(default)]
    pub url_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Defaults to `$XDG_CONFIG_HOME/tvplay/channels.toml`.
    #[serde(default = "default_channels_toml")]
    pub channels_toml: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            bind_address: default_bind_address(),
            port: default_port(),
            autoplay: true,
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            ready_timeout_secs: default_ready_timeout_secs(),
            mpv_path: None,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            overlay_hide_delay_ms: default_overlay_hide_delay_ms(),
            favorites_boundary_jump_out: true,
            seek_param: default_seek_param(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: 0,
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            channels_toml: default_channels_toml(),
        }
    }
}

impl PlaybackConfig {
    pub fn overlay_hide_delay(&self) -> Duration {
        Duration::from_millis(self.overlay_hide_delay_ms)
    }
}

impl ReconnectConfig {
    /// Delay before reconnect number `attempt` (1-based). The first reconnect
    /// is immediate, later ones double from `initial_delay_ms` up to
    /// `max_delay_ms`. Returns `None` once `max_attempts` is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return None;
        }
        if attempt <= 1 {
            return Some(Duration::ZERO);
        }
        let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(ms))
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    0.8
}

fn default_ready_timeout_secs() -> u64 {
    15
}

fn default_overlay_hide_delay_ms() -> u64 {
    3000
}

fn default_seek_param() -> String {
    "playseek".to_string()
}

fn default_reconnect_initial_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    8000
}

fn default_channels_toml() -> PathBuf {
    platform::config_dir().join("channels.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.daemon.autoplay);
        assert_eq!(config.daemon.port, platform::DAEMON_TCP_PORT);
        assert_eq!(config.daemon.bind_address, "127.0.0.1");
        assert_eq!(config.playback.seek_param, "playseek");
        assert!(config.playback.favorites_boundary_jump_out);
        assert!(config
            .channels
            .channels_toml
            .ends_with("tvplay/channels.toml"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [playback]
            favorites_boundary_jump_out = false

            [web_surface]
            url_patterns = ["youtube.com"]
            "#,
        )
        .unwrap();
        assert!(!config.playback.favorites_boundary_jump_out);
        assert_eq!(config.playback.overlay_hide_delay_ms, 3000);
        assert_eq!(config.web_surface.url_patterns, vec!["youtube.com"]);
        assert_eq!(config.player.ready_timeout_secs, 15);
    }

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectConfig {
            initial_delay_ms: 500,
            max_delay_ms: 3000,
            max_attempts: 0,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::ZERO));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(3000)));
        assert_eq!(policy.delay_for(200), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn test_reconnect_attempt_cap() {
        let policy = ReconnectConfig {
            max_attempts: 2,
            ..ReconnectConfig::default()
        };
        assert!(policy.delay_for(2).is_some());
        assert_eq!(policy.delay_for(3), None);
    }
}
