use std::fmt;

use tokio::sync::mpsc;

use super::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the session task asks a socket writer to do
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Liveness probe
    Ping,
    /// Close the socket
    Close,
}

/// Cheap, cloneable address of one socket. Holding a handle does not keep
/// the socket open.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Best-effort delivery; returns false if the socket is already gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.push(Outbound::Message(message))
    }

    pub fn ping(&self) -> bool {
        self.push(Outbound::Ping)
    }

    pub fn close(&self) -> bool {
        self.push(Outbound::Close)
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn push(&self, outbound: Outbound) -> bool {
        match self.sender.send(outbound) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(connection = %self.id, "Dropping frame for closed connection");
                false
            }
        }
    }
}
