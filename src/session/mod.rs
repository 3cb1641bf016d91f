//! Session synchronisation engine: rooms, participants, and the live
//! sockets attached to them.

pub mod connection;
pub mod engine;
pub mod fanout;
pub mod hub;
pub mod ids;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod sweeper;

pub use connection::{ConnectionHandle, ConnectionId, Outbound};
pub use engine::SessionEngine;
pub use hub::{HubTimers, SessionEvent, SessionHub};
pub use protocol::{ClientMessage, Role, ServerMessage};
pub use store::{DurableStore, FileSnapshot, MemorySnapshot, Persistence};
pub use sweeper::RetentionPolicy;
