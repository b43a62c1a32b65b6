//! JSON wire protocol between a collaboration client and the central server.
//!
//! Every frame is a flat JSON object: a common header plus an `action`
//! discriminator and the action's fields.
//! ```text
//! {
//!   "notification_type": "collaboration",
//!   "scriptID": "<share id>",
//!   "sender":   "<lower-cased user>",
//!   "action":   "edit",
//!   "ID": "k3j2h1g0f9", "state": 17, "editData": { "action": "insert", … }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::Operation;

/// Value of `notification_type` on every collaboration frame.
pub const NOTIFICATION_TYPE: &str = "collaboration";

/// Header shared by all frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "scriptID", default)]
    pub script_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub notification_type: String,
}

impl Header {
    pub fn new(script_id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            sender: sender.into(),
            notification_type: NOTIFICATION_TYPE.to_string(),
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientAction {
    JoinSession {
        state: u64,
    },
    RejoinSession {
        state: u64,
        tutoring: bool,
        #[serde(rename = "requestID")]
        request_id: String,
    },
    LeaveSession,
    Edit {
        #[serde(rename = "ID")]
        id: String,
        state: u64,
        edit_data: Operation,
    },
    RequestSync {
        state: u64,
    },
    CheckSessionStatus {
        state: u64,
    },
    CursorPosition {
        position: usize,
        state: u64,
    },
    Select {
        start: usize,
        end: usize,
        state: u64,
    },
    AddCollaborators {
        collaborators: Vec<String>,
    },
    RemoveCollaborators {
        collaborators: Vec<String>,
    },
    LeaveCollaboration,
    SaveScript,
    RenameScript {
        script_name: String,
    },
    GetScriptText {
        #[serde(rename = "requestID")]
        request_id: String,
    },
    JoinTutoring,
    LeaveTutoring,
    Chat {
        cai_message: Value,
        cai_message_type: String,
    },
    Compile {
        text: String,
    },
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerAction {
    JoinedSession {
        script_text: String,
        state: u64,
        #[serde(default)]
        active_members: Vec<String>,
        #[serde(rename = "requestID", default)]
        request_id: Option<String>,
    },
    SessionStatus {
        active: bool,
        #[serde(default)]
        state: Option<u64>,
    },
    SessionClosed,
    SessionClosedForInactivity,
    SessionsFull,
    Edit {
        #[serde(rename = "ID")]
        id: String,
        state: u64,
        edit_data: Operation,
    },
    SyncToSession {
        state: u64,
        script_text: String,
    },
    SyncError {
        state: u64,
        script_text: String,
    },
    MemberJoinedSession,
    MemberLeftSession,
    CursorPosition {
        position: usize,
    },
    Select {
        start: usize,
        end: usize,
    },
    ScriptText {
        script_text: String,
        #[serde(rename = "requestID", default)]
        request_id: Option<String>,
    },
    UserAddedToCollaboration {
        #[serde(default)]
        added_members: Vec<String>,
    },
    UserRemovedFromCollaboration {
        #[serde(default)]
        removed_members: Vec<String>,
    },
    UserLeftCollaboration,
    ScriptRenamed {
        #[serde(default)]
        script_name: Option<String>,
    },
    ScriptSaved,
    MiscMessage {
        #[serde(default)]
        text: String,
    },
    WriteAccess {
        can_edit: bool,
    },
    Chat {
        #[serde(default)]
        cai_message: Value,
        #[serde(default)]
        cai_message_type: String,
    },
    JoinedTutoring,
    /// Any action this client does not understand.
    #[serde(other)]
    Unknown,
}

impl ServerAction {
    /// Whether the action only applies to the session currently joined.
    /// Such frames are dropped unless they name the active script.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            Self::Edit { .. }
                | Self::SyncToSession { .. }
                | Self::SyncError { .. }
                | Self::ScriptSaved
                | Self::CursorPosition { .. }
                | Self::Select { .. }
                | Self::MemberJoinedSession
                | Self::MemberLeftSession
                | Self::MiscMessage { .. }
                | Self::WriteAccess { .. }
                | Self::Chat { .. }
                | Self::SessionClosedForInactivity
        )
    }
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(flatten)]
    pub header: Header,
    #[serde(flatten)]
    pub action: ClientAction,
}

impl ClientMessage {
    pub fn new(header: Header, action: ClientAction) -> Self {
        Self { header, action }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub header: Header,
    #[serde(flatten)]
    pub action: ServerAction,
}

impl ServerMessage {
    pub fn new(header: Header, action: ServerAction) -> Self {
        Self { header, action }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
