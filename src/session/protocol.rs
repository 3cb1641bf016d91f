use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Player,
}

/// Messages sent by clients. Required fields are optional here so that an
/// incomplete command decodes and can be ignored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(default)]
        master_name: Option<String>,
        #[serde(default)]
        session_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoom {
        #[serde(default)]
        player_name: Option<String>,
        #[serde(default)]
        room_code: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Reconnect {
        #[serde(default)]
        role: Option<Role>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        room_code: Option<String>,
        /// Participant identity to resume; a new one is minted when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    FichaData { ficha_data: Value },

    #[serde(rename_all = "camelCase")]
    RequestFicha { player_id: String },

    /// Application-level heartbeat
    Ping,

    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SessionError::InvalidMessage(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create_room",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::Reconnect { .. } => "reconnect",
            ClientMessage::FichaData { .. } => "ficha_data",
            ClientMessage::RequestFicha { .. } => "request_ficha",
            ClientMessage::Ping => "ping",
            ClientMessage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
    pub name: String,
    pub online: bool,
}

/// Presence snapshot keyed by participant id
pub type Presence = BTreeMap<String, PresenceEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_code: String,
        session_name: String,
        master_name: String,
    },

    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_code: String,
        session_name: String,
        player_id: String,
    },

    RoomError {
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    FichaUpdate {
        player_id: String,
        ficha_data: Value,
    },

    /// Asks a player to push its current payload
    SendFicha,

    PlayersUpdate {
        players: Presence,
    },

    MasterLeft,

    Pong,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
