// WebSocket message types for the formsync-live.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::EditRequest;

/// All message types in the formsync-live.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Server -> Client: sent once after the transport upgrade.
    ConnectionAck,

    /// Client -> Server: subscribe to live updates for one document.
    Subscribe {
        operation_id: String,
        resource_id: Uuid,
        token: String,
    },

    /// Client -> Server: submit an incremental edit.
    Edit {
        resource_id: Uuid,
        token: String,
        update: EditRequest,
    },

    /// Server -> Client: a live payload for one subscription.
    Data {
        operation_id: String,
        payload: serde_json::Value,
    },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

/// The optimistic delta broadcast to subscribers when an edit is
/// accepted, before the next flush commits it.
///
/// Carries only the fields that changed plus the editor's connection
/// id, so clients can recognize their own echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveUpdate {
    pub resource_id: Uuid,
    pub connection_id: Uuid,
    pub delta: EditRequest,
}

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
