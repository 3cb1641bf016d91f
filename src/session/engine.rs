//! Session reconciler.
//!
//! The engine is the only code that reads both the durable store and the
//! live registry. The store decides whether a room or participant exists;
//! the registry decides whether it is online right now. All methods run to
//! completion on the session task and never surface errors to callers.

use serde_json::Value;

use super::connection::{ConnectionHandle, ConnectionId};
use super::fanout;
use super::ids;
use super::monitor::{Binding, ConnectionTable};
use super::protocol::{ClientMessage, Role, ServerMessage};
use super::registry::LiveRegistry;
use super::store::{empty_payload, DurableStore, ParticipantRecord, RoomRecord};
use super::sweeper::RetentionPolicy;

pub const ROOM_NOT_FOUND: &str = "Room not found";

pub struct SessionEngine {
    store: DurableStore,
    registry: LiveRegistry,
    connections: ConnectionTable,
    retention: RetentionPolicy,
}

impl SessionEngine {
    pub fn new(store: DurableStore, retention: RetentionPolicy) -> Self {
        Self {
            store,
            registry: LiveRegistry::new(),
            connections: ConnectionTable::new(),
            retention,
        }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn registry(&self) -> &LiveRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn open_connection(&mut self, handle: ConnectionHandle) {
        tracing::info!(connection = %handle.id(), "Connection opened");
        self.connections.register(handle);
    }

    /// Dispatch one inbound message. Commands that do not fit the
    /// connection's current state are ignored.
    pub fn handle_message(&mut self, id: ConnectionId, message: ClientMessage) {
        let Some(binding) = self.connections.binding(id).cloned() else {
            tracing::debug!(connection = %id, kind = message.kind(), "Message from unknown connection");
            return;
        };

        match (message, binding) {
            (
                ClientMessage::CreateRoom {
                    master_name,
                    session_name,
                },
                Binding::Anonymous,
            ) => self.create_room(id, master_name, session_name),

            (
                ClientMessage::JoinRoom {
                    player_name,
                    room_code,
                },
                Binding::Anonymous,
            ) => self.join_room(id, player_name, room_code),

            (
                ClientMessage::Reconnect {
                    role,
                    name,
                    room_code,
                    player_id,
                },
                Binding::Anonymous,
            ) => self.reconnect(id, role, name, room_code, player_id),

            (
                ClientMessage::FichaData { ficha_data },
                Binding::Player {
                    room_code,
                    player_id,
                },
            ) => self.update_payload(id, &room_code, &player_id, ficha_data),

            (ClientMessage::RequestFicha { player_id }, Binding::Master { room_code }) => {
                self.request_payload(id, &room_code, &player_id)
            }

            (ClientMessage::Ping, _) => {
                self.connections.mark_alive(id);
                self.reply(id, ServerMessage::Pong);
            }

            (message, binding) => {
                tracing::debug!(
                    connection = %id,
                    kind = message.kind(),
                    role = ?binding.role(),
                    "Ignoring message"
                );
            }
        }
    }

    /// Liveness acknowledgment from the transport
    pub fn mark_alive(&mut self, id: ConnectionId) {
        self.connections.mark_alive(id);
    }

    /// Tear down a connection. Closing an already removed connection is a no-op.
    pub fn close_connection(&mut self, id: ConnectionId) {
        let Some(session) = self.connections.remove(id) else {
            return;
        };

        match session.binding {
            Binding::Anonymous => {
                tracing::info!(connection = %id, "Anonymous connection closed");
            }
            Binding::Master { room_code } => {
                let Some(room) = self.registry.room_mut(&room_code) else {
                    return;
                };
                if !room.is_master(id) {
                    tracing::debug!(connection = %id, room_code = %room_code, "Superseded master connection closed");
                    return;
                }
                room.master = None;
                let notified = fanout::broadcast_to_players(room, &ServerMessage::MasterLeft);
                tracing::info!(connection = %id, room_code = %room_code, notified, "Master left room");
            }
            Binding::Player {
                room_code,
                player_id,
            } => {
                if self.registry.detach_participant(&room_code, &player_id, id) {
                    tracing::info!(
                        connection = %id,
                        room_code = %room_code,
                        player_id = %player_id,
                        "Player disconnected"
                    );
                    self.broadcast_presence(&room_code);
                }
            }
        }
    }

    /// One heartbeat round: probe live connections and close silent ones
    pub fn check_liveness(&mut self) {
        tracing::debug!(connections = self.connections.len(), "Heartbeat round");
        for id in self.connections.check_liveness() {
            tracing::warn!(connection = %id, "Heartbeat missed, closing connection");
            if let Some(session) = self.connections.get(id) {
                session.handle.close();
            }
            self.close_connection(id);
        }
    }

    /// Delete every room older than the retention ttl from both stores.
    /// Connections in those rooms are not notified.
    pub fn sweep_expired(&mut self, now: u64) -> Vec<String> {
        let expired = self.retention.expired_rooms(&self.store, now);
        for code in &expired {
            self.store.delete_room(code);
            self.registry.remove_room(code);
            tracing::info!(room_code = %code, "Expired room deleted");
        }
        if !expired.is_empty() {
            self.flush_now();
            tracing::info!(
                removed = expired.len(),
                remaining = self.store.len(),
                live_rooms = self.registry.len(),
                "Retention sweep completed"
            );
        }
        expired
    }

    /// Periodic persistence
    pub fn flush(&mut self) {
        self.store.flush_if_dirty();
    }

    fn create_room(&mut self, id: ConnectionId, master_name: Option<String>, session_name: Option<String>) {
        let (Some(master_name), Some(session_name)) = (required(master_name), required(session_name)) else {
            tracing::debug!(connection = %id, "create_room without master or session name");
            return;
        };
        let Some(handle) = self.handle_of(id) else {
            return;
        };

        let store = &self.store;
        let code = ids::generate_unique_room_code(|candidate| store.contains(candidate));
        let record = RoomRecord::new(master_name.clone(), session_name.clone(), ids::unix_millis());

        // an accepted collision replaces the old room outright
        self.registry.remove_room(&code);
        self.registry.ensure_room_live(&code, &record);
        self.store.upsert_room(&code, record);
        self.flush_now();

        self.registry.set_master_connection(&code, Some(handle.clone()));
        self.connections.bind(id, Binding::Master { room_code: code.clone() });

        tracing::info!(connection = %id, room_code = %code, master_name = %master_name, "Room created");
        handle.send(ServerMessage::RoomCreated {
            room_code: code,
            session_name,
            master_name,
        });
    }

    fn join_room(&mut self, id: ConnectionId, player_name: Option<String>, room_code: Option<String>) {
        let (Some(player_name), Some(room_code)) = (required(player_name), required(room_code)) else {
            tracing::debug!(connection = %id, "join_room without player name or room code");
            return;
        };
        let Some(handle) = self.handle_of(id) else {
            return;
        };
        let code = normalize_code(&room_code);

        let Some(record) = self.store.get(&code) else {
            tracing::info!(connection = %id, room_code = %code, "Join rejected, room not found");
            handle.send(ServerMessage::RoomError {
                message: ROOM_NOT_FOUND.to_string(),
            });
            return;
        };
        let session_name = record.session_name.clone();
        self.registry.ensure_room_live(&code, record);

        let player_id = self.admit_participant(&code, &player_name, handle.clone());
        self.connections.bind(
            id,
            Binding::Player {
                room_code: code.clone(),
                player_id: player_id.clone(),
            },
        );

        tracing::info!(connection = %id, room_code = %code, player_id = %player_id, "Player joined room");
        handle.send(ServerMessage::RoomJoined {
            room_code: code.clone(),
            session_name,
            player_id,
        });
        self.broadcast_presence(&code);
    }

    fn reconnect(
        &mut self,
        id: ConnectionId,
        role: Option<Role>,
        name: Option<String>,
        room_code: Option<String>,
        player_id: Option<String>,
    ) {
        let (Some(role), Some(name), Some(room_code)) = (role, required(name), required(room_code)) else {
            tracing::debug!(connection = %id, "reconnect without role, name or room code");
            return;
        };
        let Some(handle) = self.handle_of(id) else {
            return;
        };
        let code = normalize_code(&room_code);

        let Some(record) = self.store.get(&code) else {
            tracing::debug!(connection = %id, room_code = %code, "Reconnect to unknown room ignored");
            return;
        };
        let session_name = record.session_name.clone();
        self.registry.ensure_room_live(&code, record);

        match role {
            Role::Master => {
                if let Some(previous) = self.registry.set_master_connection(&code, Some(handle.clone())) {
                    tracing::debug!(room_code = %code, superseded = %previous.id(), "Master connection superseded");
                }
                self.connections.bind(id, Binding::Master { room_code: code.clone() });
                tracing::info!(connection = %id, room_code = %code, "Master reconnected");
                handle.send(ServerMessage::PlayersUpdate {
                    players: self.registry.snapshot(&code),
                });
            }
            Role::Player => {
                let resumed = player_id.filter(|pid| self.registry.participant(&code, pid).is_some());
                let player_id = match resumed {
                    Some(pid) => {
                        self.registry
                            .set_participant_connection(&code, &pid, &name, empty_payload(), Some(handle.clone()));
                        tracing::info!(connection = %id, room_code = %code, player_id = %pid, "Player resumed identity");
                        pid
                    }
                    None => {
                        let pid = self.admit_participant(&code, &name, handle.clone());
                        tracing::info!(connection = %id, room_code = %code, player_id = %pid, "Player reconnected as new participant");
                        pid
                    }
                };
                self.connections.bind(
                    id,
                    Binding::Player {
                        room_code: code.clone(),
                        player_id: player_id.clone(),
                    },
                );
                handle.send(ServerMessage::RoomJoined {
                    room_code: code.clone(),
                    session_name,
                    player_id,
                });
                self.broadcast_presence(&code);
            }
        }
    }

    fn update_payload(&mut self, id: ConnectionId, code: &str, player_id: &str, ficha_data: Value) {
        let Some(participant) = self.registry.participant(code, player_id) else {
            tracing::debug!(room_code = %code, player_id = %player_id, "Payload update for unknown participant");
            return;
        };
        if !participant.connection.as_ref().is_some_and(|conn| conn.id() == id) {
            tracing::debug!(connection = %id, player_id = %player_id, "Payload update from superseded connection");
            return;
        }
        let name = participant.name.clone();

        self.registry.update_payload(code, player_id, ficha_data.clone());
        self.store.upsert_participant(
            code,
            player_id,
            ParticipantRecord {
                name,
                ficha_data: ficha_data.clone(),
            },
        );

        if let Some(master) = self.registry.room(code).and_then(|room| room.master.as_ref()) {
            master.send(ServerMessage::FichaUpdate {
                player_id: player_id.to_string(),
                ficha_data,
            });
        }
    }

    /// The answer to a request for an online player arrives later as that
    /// player's own `ficha_data`; offline players are served from the store.
    fn request_payload(&mut self, id: ConnectionId, code: &str, player_id: &str) {
        let Some(handle) = self.handle_of(id) else {
            return;
        };
        let Some(record) = self.store.get(code) else {
            return;
        };
        self.registry.ensure_room_live(code, record);

        let Some(participant) = self.registry.participant(code, player_id) else {
            tracing::debug!(room_code = %code, player_id = %player_id, "Payload requested for unknown participant");
            return;
        };

        match participant.connection.as_ref().filter(|conn| conn.is_open()) {
            Some(conn) => {
                conn.send(ServerMessage::SendFicha);
            }
            None => {
                let ficha_data = self
                    .store
                    .get(code)
                    .and_then(|room| room.players.get(player_id))
                    .map(|p| p.ficha_data.clone())
                    .unwrap_or_else(empty_payload);
                handle.send(ServerMessage::FichaUpdate {
                    player_id: player_id.to_string(),
                    ficha_data,
                });
            }
        }
    }

    fn admit_participant(&mut self, code: &str, name: &str, handle: ConnectionHandle) -> String {
        let player_id = ids::generate_participant_id();
        self.store
            .upsert_participant(code, &player_id, ParticipantRecord::new(name.to_string()));
        self.flush_now();
        self.registry
            .set_participant_connection(code, &player_id, name, empty_payload(), Some(handle));
        player_id
    }

    fn broadcast_presence(&self, code: &str) {
        if let Some(room) = self.registry.room(code) {
            let players = self.registry.snapshot(code);
            fanout::broadcast(room, &ServerMessage::PlayersUpdate { players }, None);
        }
    }

    fn reply(&self, id: ConnectionId, message: ServerMessage) {
        if let Some(handle) = self.handle_of(id) {
            handle.send(message);
        }
    }

    fn handle_of(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|session| session.handle.clone())
    }

    fn flush_now(&mut self) {
        if let Err(e) = self.store.flush() {
            tracing::error!(error = %e, "Failed to persist structural change");
        }
    }
}

fn required(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::Outbound;
    use crate::session::ids::is_valid_room_code;
    use crate::session::store::MemorySnapshot;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn outbound(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn messages(&mut self) -> Vec<ServerMessage> {
            self.outbound()
                .into_iter()
                .filter_map(|frame| match frame {
                    Outbound::Message(message) => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    struct Harness {
        engine: SessionEngine,
        next_id: u64,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_store(DurableStore::in_memory())
        }

        fn with_store(store: DurableStore) -> Self {
            Self {
                engine: SessionEngine::new(store, RetentionPolicy::default()),
                next_id: 0,
            }
        }

        fn connect(&mut self) -> Client {
            self.next_id += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            let id = ConnectionId(self.next_id);
            self.engine.open_connection(ConnectionHandle::new(id, tx));
            Client { id, rx }
        }

        fn send(&mut self, client: &Client, message: ClientMessage) {
            self.engine.handle_message(client.id, message);
        }

        fn create_room(&mut self, master: &mut Client, master_name: &str, session_name: &str) -> String {
            self.send(
                master,
                ClientMessage::CreateRoom {
                    master_name: Some(master_name.to_string()),
                    session_name: Some(session_name.to_string()),
                },
            );
            match master.messages().as_slice() {
                [ServerMessage::RoomCreated { room_code, .. }] => room_code.clone(),
                other => panic!("expected room_created, got {:?}", other),
            }
        }

        fn join(&mut self, player: &mut Client, code: &str, name: &str) -> String {
            self.send(
                player,
                ClientMessage::JoinRoom {
                    player_name: Some(name.to_string()),
                    room_code: Some(code.to_string()),
                },
            );
            match player.messages().first() {
                Some(ServerMessage::RoomJoined { player_id, .. }) => player_id.clone(),
                other => panic!("expected room_joined, got {:?}", other),
            }
        }

        fn reconnect(&mut self, client: &Client, role: Role, name: &str, code: &str, player_id: Option<&str>) {
            self.send(
                client,
                ClientMessage::Reconnect {
                    role: Some(role),
                    name: Some(name.to_string()),
                    room_code: Some(code.to_string()),
                    player_id: player_id.map(str::to_string),
                },
            );
        }
    }

    fn last_presence(messages: &[ServerMessage]) -> crate::session::protocol::Presence {
        messages
            .iter()
            .rev()
            .find_map(|message| match message {
                ServerMessage::PlayersUpdate { players } => Some(players.clone()),
                _ => None,
            })
            .expect("players_update")
    }

    #[test]
    fn test_create_room_binds_master() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign 1");

        assert!(is_valid_room_code(&code));
        let record = h.engine.store().get(&code).unwrap();
        assert_eq!(record.master_name, "Ana");
        assert_eq!(record.session_name, "Campaign 1");
        assert!(record.players.is_empty());

        let room = h.engine.registry().room(&code).unwrap();
        assert!(room.is_master(master.id));
        assert!(room.participants.is_empty());
        assert!(!h.engine.store().is_dirty());
    }

    #[test]
    fn test_create_room_without_names_is_ignored() {
        let mut h = Harness::new();
        let mut master = h.connect();
        h.send(
            &master,
            ClientMessage::CreateRoom {
                master_name: Some("Ana".to_string()),
                session_name: Some("   ".to_string()),
            },
        );
        h.send(
            &master,
            ClientMessage::CreateRoom {
                master_name: None,
                session_name: Some("Campaign".to_string()),
            },
        );

        assert!(master.messages().is_empty());
        assert_eq!(h.engine.store().len(), 0);
        assert_eq!(h.engine.connections().binding(master.id), Some(&Binding::Anonymous));
    }

    #[test]
    fn test_twenty_rooms_get_distinct_codes() {
        let mut h = Harness::new();
        let mut codes = HashSet::new();
        for _ in 0..20 {
            let mut master = h.connect();
            codes.insert(h.create_room(&mut master, "Ana", "Campaign"));
        }
        assert_eq!(codes.len(), 20);
        assert_eq!(h.engine.store().len(), 20);
    }

    #[test]
    fn test_bound_connection_cannot_create_again() {
        let mut h = Harness::new();
        let mut master = h.connect();
        h.create_room(&mut master, "Ana", "Campaign");
        h.send(
            &master,
            ClientMessage::CreateRoom {
                master_name: Some("Ana".to_string()),
                session_name: Some("Another".to_string()),
            },
        );
        assert!(master.messages().is_empty());
        assert_eq!(h.engine.store().len(), 1);
    }

    #[test]
    fn test_join_unknown_room_yields_error() {
        let mut h = Harness::new();
        let mut player = h.connect();
        h.send(
            &player,
            ClientMessage::JoinRoom {
                player_name: Some("Bo".to_string()),
                room_code: Some("RPG-ZZZZ".to_string()),
            },
        );

        assert_eq!(
            player.messages(),
            vec![ServerMessage::RoomError {
                message: ROOM_NOT_FOUND.to_string()
            }]
        );
        assert_eq!(h.engine.connections().binding(player.id), Some(&Binding::Anonymous));
    }

    #[test]
    fn test_join_without_name_is_ignored() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        h.send(
            &player,
            ClientMessage::JoinRoom {
                player_name: None,
                room_code: Some(code),
            },
        );
        assert!(player.messages().is_empty());
        assert!(master.messages().is_empty());
    }

    #[test]
    fn test_same_name_joins_twice_as_distinct_participants() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");

        let mut first = h.connect();
        let mut second = h.connect();
        let first_id = h.join(&mut first, &code, "Bo");
        let second_id = h.join(&mut second, &code, "Bo");
        assert_ne!(first_id, second_id);

        let presence = last_presence(&master.messages());
        assert_eq!(presence.len(), 2);
        assert!(presence[&first_id].online);
        assert!(presence[&second_id].online);
        assert_eq!(h.engine.store().get(&code).unwrap().players.len(), 2);

        // the first joiner also sees the second arrive
        assert_eq!(last_presence(&first.messages()).len(), 2);
    }

    #[test]
    fn test_join_accepts_lowercase_code() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        h.join(&mut player, &format!("  {}  ", code.to_lowercase()), "Bo");
        assert_eq!(h.engine.store().get(&code).unwrap().players.len(), 1);
    }

    #[test]
    fn test_payload_update_is_forwarded_and_stored() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let player_id = h.join(&mut player, &code, "Bo");
        master.messages();

        h.send(&player, ClientMessage::FichaData { ficha_data: json!({"hp": 10}) });

        assert_eq!(
            master.messages(),
            vec![ServerMessage::FichaUpdate {
                player_id: player_id.clone(),
                ficha_data: json!({"hp": 10}),
            }]
        );
        assert!(player.messages().is_empty());
        assert_eq!(h.engine.store().get(&code).unwrap().players[&player_id].ficha_data, json!({"hp": 10}));
        assert!(h.engine.store().is_dirty());

        h.send(&player, ClientMessage::FichaData { ficha_data: json!({"mp": 2}) });
        assert_eq!(h.engine.store().get(&code).unwrap().players[&player_id].ficha_data, json!({"mp": 2}));
    }

    #[test]
    fn test_payload_update_from_non_player_is_ignored() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let stranger = h.connect();

        h.send(&master, ClientMessage::FichaData { ficha_data: json!({"hp": 1}) });
        h.send(&stranger, ClientMessage::FichaData { ficha_data: json!({"hp": 1}) });

        assert!(master.messages().is_empty());
        assert!(h.engine.store().get(&code).unwrap().players.is_empty());
    }

    #[test]
    fn test_request_for_offline_player_is_served_from_store() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let player_id = h.join(&mut player, &code, "Bo");
        h.send(&player, ClientMessage::FichaData { ficha_data: json!({"hp": 10}) });
        h.engine.close_connection(player.id);
        master.messages();

        h.send(&master, ClientMessage::RequestFicha { player_id: player_id.clone() });
        assert_eq!(
            master.messages(),
            vec![ServerMessage::FichaUpdate {
                player_id,
                ficha_data: json!({"hp": 10}),
            }]
        );
    }

    #[test]
    fn test_request_for_online_player_asks_the_player() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let player_id = h.join(&mut player, &code, "Bo");
        master.messages();
        player.messages();

        h.send(&master, ClientMessage::RequestFicha { player_id });
        assert_eq!(player.messages(), vec![ServerMessage::SendFicha]);
        assert!(master.messages().is_empty());
    }

    #[test]
    fn test_request_for_unknown_player_is_ignored() {
        let mut h = Harness::new();
        let mut master = h.connect();
        h.create_room(&mut master, "Ana", "Campaign");
        h.send(&master, ClientMessage::RequestFicha { player_id: "nobody".to_string() });
        assert!(master.messages().is_empty());
    }

    #[test]
    fn test_master_close_notifies_players_and_reconnect_restores_updates() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let player_id = h.join(&mut player, &code, "Bo");
        player.messages();

        h.engine.close_connection(master.id);
        assert_eq!(player.messages(), vec![ServerMessage::MasterLeft]);
        assert!(h.engine.registry().room(&code).unwrap().master.is_none());

        let mut returning = h.connect();
        h.reconnect(&returning, Role::Master, "Ana", &code, None);
        let presence = last_presence(&returning.messages());
        assert!(presence[&player_id].online);

        h.send(&player, ClientMessage::FichaData { ficha_data: json!({"hp": 7}) });
        assert_eq!(
            returning.messages(),
            vec![ServerMessage::FichaUpdate {
                player_id,
                ficha_data: json!({"hp": 7}),
            }]
        );
    }

    #[test]
    fn test_superseded_master_close_keeps_current_master() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        h.join(&mut player, &code, "Bo");
        player.messages();

        let newer = h.connect();
        h.reconnect(&newer, Role::Master, "Ana", &code, None);
        h.engine.close_connection(master.id);

        assert!(h.engine.registry().room(&code).unwrap().is_master(newer.id));
        assert!(player.messages().is_empty());
    }

    #[test]
    fn test_reconnect_to_unknown_room_is_silent() {
        let mut h = Harness::new();
        let mut client = h.connect();
        h.reconnect(&client, Role::Master, "Ana", "RPG-ZZZZ", None);
        assert!(client.messages().is_empty());
        assert_eq!(h.engine.connections().binding(client.id), Some(&Binding::Anonymous));
    }

    #[test]
    fn test_player_reconnect_without_id_mints_new_participant() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let original = h.join(&mut player, &code, "Bo");
        h.engine.close_connection(player.id);

        let mut again = h.connect();
        h.reconnect(&again, Role::Player, "Bo", &code, None);
        let messages = again.messages();
        let minted = match messages.first() {
            Some(ServerMessage::RoomJoined { player_id, .. }) => player_id.clone(),
            other => panic!("expected room_joined, got {:?}", other),
        };
        assert_ne!(minted, original);

        let presence = last_presence(&messages);
        assert_eq!(presence.len(), 2);
        assert!(!presence[&original].online);
        assert!(presence[&minted].online);
    }

    #[test]
    fn test_player_reconnect_with_known_id_resumes_identity() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let original = h.join(&mut player, &code, "Bo");
        h.send(&player, ClientMessage::FichaData { ficha_data: json!({"hp": 4}) });
        h.engine.close_connection(player.id);
        master.messages();

        let mut again = h.connect();
        h.reconnect(&again, Role::Player, "Bo", &code, Some(&original));
        match again.messages().first() {
            Some(ServerMessage::RoomJoined { player_id, .. }) => assert_eq!(player_id, &original),
            other => panic!("expected room_joined, got {:?}", other),
        }

        let presence = last_presence(&master.messages());
        assert_eq!(presence.len(), 1);
        assert!(presence[&original].online);
        assert_eq!(
            h.engine.registry().participant(&code, &original).unwrap().ficha_data,
            json!({"hp": 4})
        );
    }

    #[test]
    fn test_player_close_keeps_record_and_broadcasts_presence() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let player_id = h.join(&mut player, &code, "Bo");
        master.messages();

        h.engine.close_connection(player.id);
        let presence = last_presence(&master.messages());
        assert!(!presence[&player_id].online);
        assert!(h.engine.store().get(&code).unwrap().players.contains_key(&player_id));
        assert!(h.engine.registry().is_live(&code));

        // closing twice is harmless
        h.engine.close_connection(player.id);
        assert!(master.messages().is_empty());
    }

    #[test]
    fn test_room_stays_live_with_no_connections() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        h.engine.close_connection(master.id);
        let room = h.engine.registry().room(&code).unwrap();
        assert!(room.master.is_none());
        assert!(room.participants.values().all(|p| p.connection.is_none()));
    }

    #[test]
    fn test_silent_connection_is_evicted_after_two_rounds() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");
        let mut player = h.connect();
        let player_id = h.join(&mut player, &code, "Bo");
        master.messages();
        player.outbound();

        h.engine.check_liveness();
        assert_eq!(player.outbound(), vec![Outbound::Ping]);
        assert_eq!(master.outbound(), vec![Outbound::Ping]);

        h.engine.mark_alive(master.id);
        h.engine.check_liveness();

        assert_eq!(player.outbound(), vec![Outbound::Close]);
        assert!(h.engine.connections().get(player.id).is_none());
        let frames = master.outbound();
        assert_eq!(frames.first(), Some(&Outbound::Ping));
        let presence = last_presence(
            &frames
                .into_iter()
                .filter_map(|f| match f {
                    Outbound::Message(m) => Some(m),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        );
        assert!(!presence[&player_id].online);
    }

    #[test]
    fn test_ping_message_acknowledges_liveness() {
        let mut h = Harness::new();
        let mut client = h.connect();
        h.engine.check_liveness();
        h.send(&client, ClientMessage::Ping);
        assert_eq!(client.outbound(), vec![Outbound::Ping, Outbound::Message(ServerMessage::Pong)]);
        h.engine.check_liveness();
        assert!(h.engine.connections().get(client.id).is_some());
    }

    #[test]
    fn test_unknown_message_is_ignored() {
        let mut h = Harness::new();
        let mut client = h.connect();
        h.send(&client, ClientMessage::Unknown);
        assert!(client.messages().is_empty());
    }

    #[test]
    fn test_sweep_removes_expired_rooms_from_both_stores() {
        let mut store = DurableStore::in_memory();
        store.upsert_room("RPG-OLDD", RoomRecord::new("Ana".into(), "Old".into(), 0));
        let mut h = Harness::with_store(store);

        let mut master = h.connect();
        let fresh = h.create_room(&mut master, "Ana", "New");
        let mut player = h.connect();
        h.send(
            &player,
            ClientMessage::Reconnect {
                role: Some(Role::Player),
                name: Some("Bo".to_string()),
                room_code: Some("RPG-OLDD".to_string()),
                player_id: None,
            },
        );
        assert!(h.engine.registry().is_live("RPG-OLDD"));
        player.messages();

        let now = ids::unix_millis();
        assert_eq!(h.engine.sweep_expired(now), vec!["RPG-OLDD".to_string()]);
        assert!(h.engine.store().get("RPG-OLDD").is_none());
        assert!(!h.engine.registry().is_live("RPG-OLDD"));
        assert!(h.engine.store().get(&fresh).is_some());
        assert!(player.messages().is_empty());

        // the orphaned player connection can no longer write
        h.send(&player, ClientMessage::FichaData { ficha_data: json!({"hp": 1}) });
        assert!(h.engine.store().get("RPG-OLDD").is_none());

        let mut late = h.connect();
        h.send(
            &late,
            ClientMessage::JoinRoom {
                player_name: Some("Cy".to_string()),
                room_code: Some("RPG-OLDD".to_string()),
            },
        );
        assert!(matches!(late.messages().as_slice(), [ServerMessage::RoomError { .. }]));
    }

    #[test]
    fn test_sweep_after_simulated_48_hours() {
        let mut h = Harness::new();
        let mut master = h.connect();
        let code = h.create_room(&mut master, "Ana", "Campaign");

        assert!(h.engine.sweep_expired(ids::unix_millis() + 47 * HOUR_MS).is_empty());
        assert_eq!(h.engine.sweep_expired(ids::unix_millis() + 49 * HOUR_MS), vec![code.clone()]);
        assert_eq!(h.engine.store().len(), 0);
        assert!(!h.engine.registry().is_live(&code));
    }

    #[test]
    fn test_state_survives_restart() {
        let snapshot = MemorySnapshot::new();
        let (code, player_id) = {
            let mut h = Harness::with_store(DurableStore::open(Box::new(snapshot.clone())));
            let mut master = h.connect();
            let code = h.create_room(&mut master, "Ana", "Campaign");
            let mut player = h.connect();
            let player_id = h.join(&mut player, &code, "Bo");
            h.send(&player, ClientMessage::FichaData { ficha_data: json!({"hp": 10}) });
            h.engine.flush();
            assert!(!h.engine.store().is_dirty());
            (code, player_id)
        };

        let mut h = Harness::with_store(DurableStore::open(Box::new(snapshot)));
        assert!(!h.engine.registry().is_live(&code));

        let mut master = h.connect();
        h.reconnect(&master, Role::Master, "Ana", &code, None);
        let presence = last_presence(&master.messages());
        assert_eq!(presence[&player_id].name, "Bo");
        assert!(!presence[&player_id].online);

        h.send(&master, ClientMessage::RequestFicha { player_id: player_id.clone() });
        assert_eq!(
            master.messages(),
            vec![ServerMessage::FichaUpdate {
                player_id,
                ficha_data: json!({"hp": 10}),
            }]
        );
    }

    #[test]
    fn test_scenario_create_join_update_reconnect() {
        let mut h = Harness::new();
        let mut ana = h.connect();
        let code = h.create_room(&mut ana, "Ana", "Campaign 1");
        assert!(code.starts_with("RPG-") && code.len() == 8);

        let mut bo = h.connect();
        let bo_id = h.join(&mut bo, &code, "Bo");
        ana.messages();

        h.send(&bo, ClientMessage::FichaData { ficha_data: json!({"hp": 10}) });
        assert_eq!(
            ana.messages(),
            vec![ServerMessage::FichaUpdate {
                player_id: bo_id.clone(),
                ficha_data: json!({"hp": 10}),
            }]
        );

        h.engine.close_connection(ana.id);
        h.engine.close_connection(bo.id);

        let mut ana_again = h.connect();
        h.reconnect(&ana_again, Role::Master, "Ana", &code, None);
        let presence = last_presence(&ana_again.messages());
        assert_eq!(presence[&bo_id].name, "Bo");
        assert!(!presence[&bo_id].online);
    }
}
