/// mpv-backed player engine.
///
/// Architecture:
///
/// ```text
///   MpvPlayer (PlayerEngine, called on the DaemonCore loop)
///         │  PlayerRequest via unbounded mpsc (never blocks the core)
///         ▼
///   engine_task ── owns MpvDriver + MpvHandle, tracks the current load
///         │            ├── writer_task  ← JSON IPC commands → socket
///         │            └── reader_task  ← JSON lines from socket
///         │                                 ├── response → matched oneshot
///         │                                 └── event    → engine_task
///         ▼
///   DaemonEvent::Player { Ready | Error | Interrupted, generation }, at most
///   once per load
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tvplay_proto::config::PlayerConfig;
use tvplay_proto::protocol::Channel;

use crate::collaborators::{PlayerEngine, PlayerEvent};
use crate::core::DaemonEvent;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `core-idle`.
const OBS_CORE_IDLE: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "playback-restart".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn observe_core_idle(&self) {
        if let Err(e) = self
            .send(json!(["observe_property", OBS_CORE_IDLE, "core-idle"]))
            .await
        {
            warn!("mpv: observe_property core-idle failed: {}", e);
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and its IPC connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
    mpv_path: Option<std::path::PathBuf>,
}

impl MpvDriver {
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            socket_name: tvplay_proto::platform::mpv_socket_name(),
            process: None,
            volume: config.default_volume,
            mpv_path: config.mpv_path.clone(),
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    /// Spawn a fresh mpv and connect to its IPC endpoint.
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        info!("mpv: spawning new process");
        let mpv_binary = tvplay_proto::platform::find_mpv_binary(self.mpv_path.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--keep-open=no")
            .arg("--quiet")
            .arg(tvplay_proto::platform::mpv_socket_arg())
            .arg(format!(
                "--volume={}",
                (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
            ))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(handle) = self.connect(event_tx.clone()).await {
                info!("mpv: connected to IPC endpoint");
                return Ok(handle);
            }
        }
        anyhow::bail!("mpv IPC endpoint did not appear")
    }

    #[cfg(unix)]
    async fn connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        let stream = tokio::net::UnixStream::connect(&self.socket_name).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    async fn connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        use tokio::net::windows::named_pipe::ClientOptions;
        let pipe = ClientOptions::new().open(format!(r"\\.\pipe\{}", self.socket_name))?;
        let (read_half, write_half) = tokio::io::split(pipe);
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

/// Dropping `event_tx` on exit is what tells the engine the connection is gone.
async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                match val.get("request_id").and_then(|v| v.as_u64()) {
                    Some(req_id) => {
                        let Some(tx) = pending.lock().await.remove(&req_id) else {
                            debug!("mpv reader: response for unknown req={}", req_id);
                            continue;
                        };
                        let result = match val["error"].as_str() {
                            Some("success") => Ok(val),
                            other => Err(anyhow::anyhow!(
                                "mpv error: {}",
                                other.unwrap_or("unknown error")
                            )),
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send {}", req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── load tracking ─────────────────────────────────────────────────────────────

/// Progress of the most recent `loadfile`.  Each load reports exactly one of
/// Ready/Error, and at most one Interrupted after Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Idle,
    /// loadfile sent; events from the previous file are still draining.
    Requested { deadline: Instant },
    /// mpv acknowledged the new file with start-file.
    Started { deadline: Instant },
    Ready,
}

impl LoadState {
    fn deadline(&self) -> Option<Instant> {
        match self {
            LoadState::Requested { deadline } | LoadState::Started { deadline } => Some(*deadline),
            _ => None,
        }
    }

    /// Apply one mpv event; returns the lifecycle transition to report.
    fn on_event(&mut self, evt: &MpvEvent) -> Option<PlayerEvent> {
        if let Some((OBS_CORE_IDLE, data)) = evt.as_property_change() {
            if data.as_bool() == Some(false) {
                return self.ready();
            }
            return None;
        }

        match (evt.event_name(), *self) {
            (Some("start-file"), LoadState::Requested { deadline }) => {
                *self = LoadState::Started { deadline };
                None
            }
            (Some("playback-restart"), _) => self.ready(),
            (Some("end-file"), LoadState::Started { .. }) => match evt.end_reason() {
                Some("error") | Some("eof") => {
                    *self = LoadState::Idle;
                    Some(PlayerEvent::Error)
                }
                _ => None,
            },
            (Some("end-file"), LoadState::Ready) => match evt.end_reason() {
                // live streams only end on their own when the connection drops
                Some("error") | Some("eof") => {
                    *self = LoadState::Idle;
                    Some(PlayerEvent::Interrupted)
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn ready(&mut self) -> Option<PlayerEvent> {
        if matches!(self, LoadState::Started { .. }) {
            *self = LoadState::Ready;
            Some(PlayerEvent::Ready)
        } else {
            None
        }
    }

    /// The IPC connection dropped or the process died.
    fn on_connection_lost(&mut self) -> Option<PlayerEvent> {
        let event = match self {
            LoadState::Idle => None,
            LoadState::Ready => Some(PlayerEvent::Interrupted),
            LoadState::Requested { .. } | LoadState::Started { .. } => Some(PlayerEvent::Error),
        };
        *self = LoadState::Idle;
        event
    }

    fn on_timeout(&mut self) -> Option<PlayerEvent> {
        self.deadline().map(|_| {
            *self = LoadState::Idle;
            PlayerEvent::Error
        })
    }
}

// ── engine ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum PlayerRequest {
    Load { url: String, generation: u64 },
    Stop,
}

/// `PlayerEngine` that forwards to the engine task.
pub struct MpvPlayer {
    tx: mpsc::UnboundedSender<PlayerRequest>,
}

impl MpvPlayer {
    pub fn spawn(config: &PlayerConfig, core_tx: mpsc::Sender<DaemonEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = MpvDriver::new(config);
        let ready_timeout = Duration::from_secs(config.ready_timeout_secs);
        tokio::spawn(engine_task(driver, rx, core_tx, ready_timeout));
        Self { tx }
    }

    fn request(&self, req: PlayerRequest) {
        if self.tx.send(req).is_err() {
            warn!("mpv: engine task gone");
        }
    }
}

impl PlayerEngine for MpvPlayer {
    fn prepare(&mut self, channel: &Channel, url_idx: usize, url: &str, generation: u64) {
        debug!(
            "mpv: prepare '{}' #{} {} gen={}",
            channel.name, url_idx, url, generation
        );
        self.request(PlayerRequest::Load {
            url: url.to_string(),
            generation,
        });
    }

    fn stop(&mut self) {
        self.request(PlayerRequest::Stop);
    }
}

struct Engine {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    events: Option<mpsc::Receiver<MpvEvent>>,
    load: LoadState,
    /// Tag of the load `load` tracks, echoed back with every event.
    generation: u64,
    core_tx: mpsc::Sender<DaemonEvent>,
}

impl Engine {
    async fn report(&self, event: Option<PlayerEvent>) {
        if let Some(event) = event {
            info!("mpv: reporting {:?} gen={}", event, self.generation);
            let _ = self
                .core_tx
                .send(DaemonEvent::Player {
                    event,
                    generation: self.generation,
                })
                .await;
        }
    }

    async fn ensure_handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            self.handle = None;
            self.events = None;
        }

        if self.handle.is_none() {
            let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
            match self.driver.spawn_and_connect(event_tx).await {
                Ok(handle) => {
                    handle.observe_core_idle().await;
                    self.handle = Some(handle);
                    self.events = Some(event_rx);
                }
                Err(e) => {
                    warn!("mpv: failed to start: {}", e);
                    return None;
                }
            }
        }

        self.handle.clone()
    }

    async fn handle_request(&mut self, req: PlayerRequest, ready_timeout: Duration) {
        match req {
            PlayerRequest::Load { url, generation } => {
                self.generation = generation;
                self.load = LoadState::Requested {
                    deadline: Instant::now() + ready_timeout,
                };
                let loaded = match self.ensure_handle().await {
                    Some(handle) => handle.load(&url).await,
                    None => Err(anyhow::anyhow!("mpv unavailable")),
                };
                if let Err(e) = loaded {
                    warn!("mpv: failed to load {}: {}", url, e);
                    self.load = LoadState::Idle;
                    self.report(Some(PlayerEvent::Error)).await;
                }
            }
            PlayerRequest::Stop => {
                self.load = LoadState::Idle;
                if let Some(handle) = &self.handle {
                    if let Err(e) = handle.stop().await {
                        debug!("mpv: stop failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn next_mpv_event(events: &mut Option<mpsc::Receiver<MpvEvent>>) -> Option<MpvEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn engine_task(
    driver: MpvDriver,
    mut requests: mpsc::UnboundedReceiver<PlayerRequest>,
    core_tx: mpsc::Sender<DaemonEvent>,
    ready_timeout: Duration,
) {
    let mut engine = Engine {
        driver,
        handle: None,
        events: None,
        load: LoadState::Idle,
        generation: 0,
        core_tx,
    };

    loop {
        tokio::select! {
            req = requests.recv() => match req {
                Some(req) => engine.handle_request(req, ready_timeout).await,
                None => break,
            },

            evt = next_mpv_event(&mut engine.events) => match evt {
                Some(evt) => {
                    debug!("mpv event: {:?}", evt.raw);
                    let transition = engine.load.on_event(&evt);
                    engine.report(transition).await;
                }
                None => {
                    warn!("mpv: IPC connection lost");
                    engine.handle = None;
                    engine.events = None;
                    let transition = engine.load.on_connection_lost();
                    engine.report(transition).await;
                }
            },

            _ = sleep_until_opt(engine.load.deadline()) => {
                warn!("mpv: no frames within {:?}", ready_timeout);
                let transition = engine.load.on_timeout();
                engine.report(transition).await;
            }
        }
    }

    engine.driver.kill().await;
    debug!("mpv: engine task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    fn requested() -> LoadState {
        LoadState::Requested {
            deadline: Instant::now() + Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn test_ready_needs_start_file_first() {
        let mut load = requested();
        // restart of the previous file must not count
        assert_eq!(load.on_event(&event(json!({"event": "playback-restart"}))), None);
        assert_eq!(load.on_event(&event(json!({"event": "start-file"}))), None);
        assert_eq!(
            load.on_event(&event(json!({"event": "playback-restart"}))),
            Some(PlayerEvent::Ready)
        );
        assert_eq!(load, LoadState::Ready);
        // fires once
        assert_eq!(
            load.on_event(&event(
                json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false})
            )),
            None
        );
    }

    #[tokio::test]
    async fn test_end_file_error_before_ready_is_error() {
        let mut load = requested();
        // the replaced file ends with reason=stop
        assert_eq!(
            load.on_event(&event(json!({"event": "end-file", "reason": "stop"}))),
            None
        );
        load.on_event(&event(json!({"event": "start-file"})));
        assert_eq!(
            load.on_event(&event(json!({"event": "end-file", "reason": "error"}))),
            Some(PlayerEvent::Error)
        );
        assert_eq!(load, LoadState::Idle);
    }

    #[tokio::test]
    async fn test_end_after_ready_is_interrupt() {
        let mut load = requested();
        load.on_event(&event(json!({"event": "start-file"})));
        load.on_event(&event(
            json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false}),
        ));
        assert_eq!(
            load.on_event(&event(json!({"event": "end-file", "reason": "eof"}))),
            Some(PlayerEvent::Interrupted)
        );
        assert_eq!(load.on_connection_lost(), None);
    }

    #[tokio::test]
    async fn test_connection_loss_and_timeout() {
        let mut load = requested();
        assert_eq!(load.on_connection_lost(), Some(PlayerEvent::Error));

        let mut load = LoadState::Ready;
        assert_eq!(load.on_connection_lost(), Some(PlayerEvent::Interrupted));

        let mut load = requested();
        assert_eq!(load.on_timeout(), Some(PlayerEvent::Error));
        assert_eq!(load.on_timeout(), None);
    }
}
