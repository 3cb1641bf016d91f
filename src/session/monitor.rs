//! Connection table and heartbeat tracking.
//!
//! Every tick, a connection that has not acknowledged since the previous
//! tick is reported stale; every other connection has its flag cleared and
//! receives a fresh probe.

use std::collections::HashMap;

use super::connection::{ConnectionHandle, ConnectionId};
use super::protocol::Role;

/// Which room a connection speaks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Anonymous,
    Master { room_code: String },
    Player { room_code: String, player_id: String },
}

impl Binding {
    pub fn role(&self) -> Option<Role> {
        match self {
            Binding::Anonymous => None,
            Binding::Master { .. } => Some(Role::Master),
            Binding::Player { .. } => Some(Role::Player),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub handle: ConnectionHandle,
    pub binding: Binding,
    pub alive: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    sessions: HashMap<ConnectionId, ConnectionSession>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened, anonymous connection
    pub fn register(&mut self, handle: ConnectionHandle) {
        self.sessions.insert(
            handle.id(),
            ConnectionSession {
                handle,
                binding: Binding::Anonymous,
                alive: true,
            },
        );
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionSession> {
        self.sessions.get(&id)
    }

    pub fn binding(&self, id: ConnectionId) -> Option<&Binding> {
        self.sessions.get(&id).map(|session| &session.binding)
    }

    pub fn bind(&mut self, id: ConnectionId, binding: Binding) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.binding = binding;
        }
    }

    /// Record a liveness acknowledgment
    pub fn mark_alive(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.alive = true;
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionSession> {
        self.sessions.remove(&id)
    }

    /// Run one heartbeat round. Returns the ids of connections that missed
    /// the previous probe; they are left in the table for the caller to close.
    pub fn check_liveness(&mut self) -> Vec<ConnectionId> {
        let mut stale = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.alive {
                session.alive = false;
                session.handle.ping();
            } else {
                stale.push(*id);
            }
        }
        stale.sort();
        stale
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::Outbound;
    use tokio::sync::mpsc;

    fn register(table: &mut ConnectionTable, id: u64) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        table.register(ConnectionHandle::new(ConnectionId(id), tx));
        rx
    }

    #[test]
    fn test_new_connection_is_anonymous_and_alive() {
        let mut table = ConnectionTable::new();
        let _rx = register(&mut table, 1);
        let session = table.get(ConnectionId(1)).unwrap();
        assert_eq!(session.binding, Binding::Anonymous);
        assert!(session.alive);
    }

    #[test]
    fn test_first_round_probes_second_round_evicts() {
        let mut table = ConnectionTable::new();
        let mut rx = register(&mut table, 1);

        assert!(table.check_liveness().is_empty());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);

        assert_eq!(table.check_liveness(), vec![ConnectionId(1)]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_acknowledged_connection_survives() {
        let mut table = ConnectionTable::new();
        let _rx = register(&mut table, 1);

        table.check_liveness();
        table.mark_alive(ConnectionId(1));
        assert!(table.check_liveness().is_empty());
        assert!(!table.get(ConnectionId(1)).unwrap().alive);
    }

    #[test]
    fn test_only_silent_connections_are_stale() {
        let mut table = ConnectionTable::new();
        let _rx1 = register(&mut table, 1);
        let _rx2 = register(&mut table, 2);

        table.check_liveness();
        table.mark_alive(ConnectionId(2));
        assert_eq!(table.check_liveness(), vec![ConnectionId(1)]);
    }

    #[test]
    fn test_binding_role() {
        let player = Binding::Player {
            room_code: "RPG-ABCD".to_string(),
            player_id: "p1".to_string(),
        };
        assert_eq!(player.role(), Some(Role::Player));
        assert_eq!(Binding::Anonymous.role(), None);
    }
}
