use std::path::{Path, PathBuf};

pub const DAEMON_TCP_PORT: u16 = 9877;

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    format!("{}/tvplay-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "tvplay-mpv".to_string()
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

/// State and logs: `~/.local/share/tvplay` on unix, `%LOCALAPPDATA%\tvplay`
/// on windows.
pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    let base = dirs::home_dir().map(|home| home.join(".local").join("share"));
    #[cfg(windows)]
    let base = dirs::data_local_dir();

    base.unwrap_or_else(std::env::temp_dir).join("tvplay")
}

/// `config.toml` and `channels.toml` live here.
pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    let base = dirs::home_dir().map(|home| home.join(".config"));
    #[cfg(windows)]
    let base = dirs::config_dir();

    base.unwrap_or_else(|| PathBuf::from(".")).join("tvplay")
}

#[cfg(unix)]
const MPV_BINARY: &str = "mpv";
#[cfg(windows)]
const MPV_BINARY: &str = "mpv.exe";

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Locate mpv: the configured path, then `MPV_PATH`, then next to the daemon
/// executable, then `PATH`.
pub fn find_mpv_binary(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!("configured mpv_path {:?} does not exist", path);
    }

    if let Some(path) = std::env::var_os("MPV_PATH").map(PathBuf::from) {
        if path.exists() {
            return Some(path);
        }
    }

    let bundled = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(MPV_BINARY)))
        .filter(|p| p.is_file());

    bundled.or_else(|| find_on_path(MPV_BINARY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_mpv_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = dir.path().join("my-mpv");
        std::fs::write(&mpv, b"").unwrap();
        assert_eq!(find_mpv_binary(Some(&mpv)), Some(mpv));
    }

    #[test]
    fn test_dirs_end_in_app_name() {
        assert!(data_dir().ends_with("tvplay"));
        assert!(config_dir().ends_with("tvplay"));
    }
}
