//! Live registry: which sockets are attached to which room right now.
//!
//! A room becomes live the first time a reconciliation touches it in this
//! process lifetime, seeded from its durable record with every participant
//! offline. Live rooms are never torn down because their sockets left; only
//! the retention sweep removes them.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::connection::{ConnectionHandle, ConnectionId};
use super::protocol::{Presence, PresenceEntry};
use super::store::RoomRecord;

#[derive(Debug, Clone)]
pub struct LiveParticipant {
    pub name: String,
    pub ficha_data: Value,
    pub connection: Option<ConnectionHandle>,
}

impl LiveParticipant {
    pub fn is_online(&self) -> bool {
        self.connection.as_ref().is_some_and(ConnectionHandle::is_open)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiveRoom {
    pub master: Option<ConnectionHandle>,
    pub participants: BTreeMap<String, LiveParticipant>,
}

impl LiveRoom {
    pub fn is_master(&self, id: ConnectionId) -> bool {
        self.master.as_ref().is_some_and(|conn| conn.id() == id)
    }
}

#[derive(Debug, Default)]
pub struct LiveRegistry {
    rooms: HashMap<String, LiveRoom>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialise the live entry for `code`, or merge into the existing one.
    ///
    /// Participants in `record` that the live entry does not know are added
    /// offline, so the live view is never a strict subset of the durable one.
    pub fn ensure_room_live(&mut self, code: &str, record: &RoomRecord) -> &mut LiveRoom {
        let room = self.rooms.entry(code.to_string()).or_insert_with(|| {
            tracing::debug!(
                room_code = %code,
                participant_count = record.players.len(),
                "Materialising live room from durable store"
            );
            LiveRoom::default()
        });

        for (id, participant) in &record.players {
            room.participants
                .entry(id.clone())
                .or_insert_with(|| LiveParticipant {
                    name: participant.name.clone(),
                    ficha_data: participant.ficha_data.clone(),
                    connection: None,
                });
        }

        room
    }

    pub fn room(&self, code: &str) -> Option<&LiveRoom> {
        self.rooms.get(code)
    }

    pub fn room_mut(&mut self, code: &str) -> Option<&mut LiveRoom> {
        self.rooms.get_mut(code)
    }

    pub fn is_live(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    /// Replace the room's master reference, returning the superseded one
    pub fn set_master_connection(
        &mut self,
        code: &str,
        conn: Option<ConnectionHandle>,
    ) -> Option<ConnectionHandle> {
        let room = self.rooms.get_mut(code)?;
        std::mem::replace(&mut room.master, conn)
    }

    /// Attach or detach a participant's socket, admitting the participant
    /// if the live entry does not have it yet. Returns the previous socket.
    pub fn set_participant_connection(
        &mut self,
        code: &str,
        id: &str,
        name: &str,
        ficha_data: Value,
        conn: Option<ConnectionHandle>,
    ) -> Option<ConnectionHandle> {
        let room = self.rooms.get_mut(code)?;
        match room.participants.get_mut(id) {
            Some(participant) => std::mem::replace(&mut participant.connection, conn),
            None => {
                room.participants.insert(
                    id.to_string(),
                    LiveParticipant {
                        name: name.to_string(),
                        ficha_data,
                        connection: conn,
                    },
                );
                None
            }
        }
    }

    /// Detach `id`'s socket only if `conn` is still the current one
    pub fn detach_participant(&mut self, code: &str, id: &str, conn: ConnectionId) -> bool {
        let Some(participant) = self
            .rooms
            .get_mut(code)
            .and_then(|room| room.participants.get_mut(id))
        else {
            return false;
        };

        if participant.connection.as_ref().is_some_and(|c| c.id() == conn) {
            participant.connection = None;
            true
        } else {
            false
        }
    }

    pub fn participant(&self, code: &str, id: &str) -> Option<&LiveParticipant> {
        self.rooms.get(code)?.participants.get(id)
    }

    /// Replace a participant's cached payload. Returns false if unknown.
    pub fn update_payload(&mut self, code: &str, id: &str, ficha_data: Value) -> bool {
        match self
            .rooms
            .get_mut(code)
            .and_then(|room| room.participants.get_mut(id))
        {
            Some(participant) => {
                participant.ficha_data = ficha_data;
                true
            }
            None => false,
        }
    }

    /// Presence of every known participant. Empty if the room is not live.
    pub fn snapshot(&self, code: &str) -> Presence {
        let Some(room) = self.rooms.get(code) else {
            return Presence::new();
        };

        room.participants
            .iter()
            .map(|(id, participant)| {
                (
                    id.clone(),
                    PresenceEntry {
                        id: id.clone(),
                        name: participant.name.clone(),
                        online: participant.is_online(),
                    },
                )
            })
            .collect()
    }

    pub fn remove_room(&mut self, code: &str) -> Option<LiveRoom> {
        self.rooms.remove(code)
    }

    pub(crate) fn len(&self) -> usize {
        self.rooms.len()
    }
}
