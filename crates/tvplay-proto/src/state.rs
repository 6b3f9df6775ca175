use crate::protocol::EpgProgrammeReserve;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state writer task has stopped")]
    WriterClosed,
}

/// Everything the orchestrator remembers between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub last_channel_idx: Option<usize>,
    #[serde(default)]
    pub favorites: BTreeSet<String>,
    #[serde(default)]
    pub reservations: Vec<EpgProgrammeReserve>,
    #[serde(default)]
    pub playable_hosts: BTreeSet<String>,
}

/// Best-effort key/value persistence used by the orchestrator.  Reads never
/// fail; writes report errors so callers can log them.
pub trait SettingsStore: Send {
    fn last_channel_idx(&self) -> Option<usize>;
    fn set_last_channel_idx(&mut self, idx: usize) -> Result<(), StoreError>;

    fn favorites(&self) -> BTreeSet<String>;
    fn set_favorites(&mut self, favorites: BTreeSet<String>) -> Result<(), StoreError>;

    fn reservations(&self) -> Vec<EpgProgrammeReserve>;
    fn set_reservations(&mut self, reservations: Vec<EpgProgrammeReserve>)
        -> Result<(), StoreError>;

    fn playable_hosts(&self) -> BTreeSet<String>;
    fn set_playable_hosts(&mut self, hosts: BTreeSet<String>) -> Result<(), StoreError>;
}

/// In-process store with no backing file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub state: PersistentState,
}

impl MemoryStore {
    pub fn new(state: PersistentState) -> Self {
        Self { state }
    }
}

impl SettingsStore for MemoryStore {
    fn last_channel_idx(&self) -> Option<usize> {
        self.state.last_channel_idx
    }

    fn set_last_channel_idx(&mut self, idx: usize) -> Result<(), StoreError> {
        self.state.last_channel_idx = Some(idx);
        Ok(())
    }

    fn favorites(&self) -> BTreeSet<String> {
        self.state.favorites.clone()
    }

    fn set_favorites(&mut self, favorites: BTreeSet<String>) -> Result<(), StoreError> {
        self.state.favorites = favorites;
        Ok(())
    }

    fn reservations(&self) -> Vec<EpgProgrammeReserve> {
        self.state.reservations.clone()
    }

    fn set_reservations(
        &mut self,
        reservations: Vec<EpgProgrammeReserve>,
    ) -> Result<(), StoreError> {
        self.state.reservations = reservations;
        Ok(())
    }

    fn playable_hosts(&self) -> BTreeSet<String> {
        self.state.playable_hosts.clone()
    }

    fn set_playable_hosts(&mut self, hosts: BTreeSet<String>) -> Result<(), StoreError> {
        self.state.playable_hosts = hosts;
        Ok(())
    }
}

/// Serialized saves and flush requests, handled strictly in order.
enum WriteOp {
    Save(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background task that owns the state file.
#[derive(Clone)]
pub struct StateWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl StateWriter {
    fn spawn(state_file: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(state_file, rx));
        Self { tx }
    }

    fn save(&self, json: String) -> Result<(), StoreError> {
        self.tx
            .send(WriteOp::Save(json))
            .map_err(|_| StoreError::WriterClosed)
    }

    /// Resolves once every save queued before this call is on disk (or
    /// failed and was logged).
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn writer_task(state_file: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(mut json) => {
                // only the newest queued snapshot matters
                let mut flushes = Vec::new();
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WriteOp::Save(newer) => json = newer,
                        WriteOp::Flush(done) => {
                            flushes.push(done);
                            break;
                        }
                    }
                }
                if let Err(e) = write_state_file(&state_file, &json).await {
                    tracing::warn!("failed to write state file {:?}: {}", state_file, e);
                }
                for done in flushes {
                    let _ = done.send(());
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn write_state_file(state_file: &Path, json: &str) -> std::io::Result<()> {
    if let Some(parent) = state_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(state_file, json).await
}

/// Keeps the whole `PersistentState` in memory.  Every mutation queues a JSON
/// snapshot for the background writer, so setters never touch the disk.
/// `open` must be called inside a tokio runtime.
pub struct JsonFileStore {
    state: PersistentState,
    writer: StateWriter,
}

impl JsonFileStore {
    pub fn open(state_file: PathBuf) -> Self {
        let state = Self::load_persistent(&state_file);
        Self {
            state,
            writer: StateWriter::spawn(state_file),
        }
    }

    pub fn snapshot(&self) -> &PersistentState {
        &self.state
    }

    pub fn writer(&self) -> StateWriter {
        self.writer.clone()
    }

    fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.state)?;
        self.writer.save(json)
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        let content = match std::fs::read_to_string(state_file) {
            Ok(content) => content,
            Err(_) => return PersistentState::default(),
        };
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(persistent) => persistent,
            Err(e) => {
                tracing::warn!("ignoring unreadable state file {:?}: {}", state_file, e);
                PersistentState::default()
            }
        }
    }
}

impl SettingsStore for JsonFileStore {
    fn last_channel_idx(&self) -> Option<usize> {
        self.state.last_channel_idx
    }

    fn set_last_channel_idx(&mut self, idx: usize) -> Result<(), StoreError> {
        if self.state.last_channel_idx == Some(idx) {
            return Ok(());
        }
        self.state.last_channel_idx = Some(idx);
        self.save()
    }

    fn favorites(&self) -> BTreeSet<String> {
        self.state.favorites.clone()
    }

    fn set_favorites(&mut self, favorites: BTreeSet<String>) -> Result<(), StoreError> {
        self.state.favorites = favorites;
        self.save()
    }

    fn reservations(&self) -> Vec<EpgProgrammeReserve> {
        self.state.reservations.clone()
    }

    fn set_reservations(
        &mut self,
        reservations: Vec<EpgProgrammeReserve>,
    ) -> Result<(), StoreError> {
        self.state.reservations = reservations;
        self.save()
    }

    fn playable_hosts(&self) -> BTreeSet<String> {
        self.state.playable_hosts.clone()
    }

    fn set_playable_hosts(&mut self, hosts: BTreeSet<String>) -> Result<(), StoreError> {
        if self.state.playable_hosts == hosts {
            return Ok(());
        }
        self.state.playable_hosts = hosts;
        self.save()
    }
}
