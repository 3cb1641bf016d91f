//! Durable store: the persisted, authoritative record of rooms and their
//! participants.
//!
//! Writes land in memory immediately and mark the store dirty. The bytes
//! reach the [`Persistence`] backend only on [`DurableStore::flush`], which
//! the session task calls after structural events and on a fixed interval.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::{Result, SessionError};

/// Whole-file byte storage behind the durable store
pub trait Persistence: Send {
    /// Returns `None` when nothing has been persisted yet
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Replaces the persisted bytes
    fn save(&self, bytes: &[u8]) -> Result<()>;
}

/// Persists to a single JSON file, replaced atomically on each save
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "rooms.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Persistence for FileSnapshot {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        blocking_io(|| match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::StoreRead(e)),
        })
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        blocking_io(|| -> Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(SessionError::StoreWrite)?;
                }
            }
            let temp = self.temp_path();
            fs::write(&temp, bytes).map_err(SessionError::StoreWrite)?;
            fs::rename(&temp, &self.path).map_err(SessionError::StoreWrite)
        })
    }
}

/// Run blocking file I/O from the session task. On a multi-threaded runtime
/// the worker hands its other tasks off first; the write itself stays
/// ordered with the store mutations around it.
fn blocking_io<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Volatile persistence backed by a shared buffer. Clones share the buffer,
/// so a clone kept outside the store observes every flush.
#[derive(Clone, Default)]
pub struct MemorySnapshot {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// Last saved bytes
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.bytes.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Persistence for MemorySnapshot {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self
            .bytes
            .lock()
            .map_err(|_| SessionError::internal("memory snapshot lock poisoned"))?;
        *guard = Some(bytes.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub master_name: String,
    pub session_name: String,
    /// Unix milliseconds
    pub created_at: u64,
    #[serde(default)]
    pub players: BTreeMap<String, ParticipantRecord>,
}

impl RoomRecord {
    pub fn new(master_name: String, session_name: String, created_at: u64) -> Self {
        Self {
            master_name,
            session_name,
            created_at,
            players: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub name: String,
    #[serde(default = "empty_payload")]
    pub ficha_data: Value,
}

impl ParticipantRecord {
    /// A fresh participant with an empty payload
    pub fn new(name: String) -> Self {
        Self {
            name,
            ficha_data: empty_payload(),
        }
    }
}

/// The payload a participant starts with
pub fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

pub struct DurableStore {
    rooms: HashMap<String, RoomRecord>,
    persistence: Box<dyn Persistence>,
    dirty: bool,
}

impl DurableStore {
    /// Load the store from `persistence`. A backend with nothing saved yields
    /// an empty store.
    pub fn load(persistence: Box<dyn Persistence>) -> Result<Self> {
        let rooms = match persistence.load()? {
            Some(bytes) if !bytes.is_empty() => {
                serde_json::from_slice(&bytes).map_err(SessionError::StoreDecode)?
            }
            _ => HashMap::new(),
        };

        Ok(Self {
            rooms,
            persistence,
            dirty: false,
        })
    }

    /// Like [`DurableStore::load`], but a read or decode failure is logged
    /// and the store starts empty.
    pub fn open(persistence: Box<dyn Persistence>) -> Self {
        match persistence.load() {
            Ok(Some(bytes)) if !bytes.is_empty() => match serde_json::from_slice(&bytes) {
                Ok(rooms) => Self::with_rooms(rooms, persistence),
                Err(e) => {
                    tracing::error!(error = %e, "Persisted state is corrupt, starting empty");
                    Self::with_rooms(HashMap::new(), persistence)
                }
            },
            Ok(_) => Self::with_rooms(HashMap::new(), persistence),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read persisted state, starting empty");
                Self::with_rooms(HashMap::new(), persistence)
            }
        }
    }

    /// An empty store that never had anything persisted
    pub fn in_memory() -> Self {
        Self::with_rooms(HashMap::new(), Box::new(MemorySnapshot::new()))
    }

    fn with_rooms(rooms: HashMap<String, RoomRecord>, persistence: Box<dyn Persistence>) -> Self {
        tracing::info!(room_count = rooms.len(), "Durable store loaded");
        Self {
            rooms,
            persistence,
            dirty: false,
        }
    }

    pub fn get(&self, code: &str) -> Option<&RoomRecord> {
        self.rooms.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    pub fn upsert_room(&mut self, code: &str, room: RoomRecord) {
        self.rooms.insert(code.to_string(), room);
        self.dirty = true;
    }

    /// Insert or replace a participant. Returns false if the room is unknown.
    pub fn upsert_participant(&mut self, code: &str, id: &str, participant: ParticipantRecord) -> bool {
        match self.rooms.get_mut(code) {
            Some(room) => {
                room.players.insert(id.to_string(), participant);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn delete_room(&mut self, code: &str) -> Option<RoomRecord> {
        let removed = self.rooms.remove(code);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn all_rooms(&self) -> impl Iterator<Item = (&String, &RoomRecord)> {
        self.rooms.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the whole store to the backend. The dirty flag is cleared only
    /// when the write succeeds.
    pub fn flush(&mut self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.rooms)?;
        self.persistence.save(&bytes)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush only when there are unsaved changes, logging any failure
    pub fn flush_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        match self.flush() {
            Ok(()) => tracing::debug!(room_count = self.rooms.len(), "Durable store flushed"),
            Err(e) => tracing::error!(error = %e, "Failed to flush durable store"),
        }
    }
}
