// WebSocket frame types for the consulta-chat.v1 protocol.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, Role, UserProfile};

/// All frame types in the consulta-chat.v1 WebSocket protocol.
///
/// One JSON object per frame, tagged on `type`. `new_message` is
/// bidirectional: inbound it carries a client draft, outbound it carries
/// the stamped message as relayed to session members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    /// Client -> Server: bind an identity to this connection.
    Identify { user_id: i64, role: Role },

    /// Client -> Server: enter a consultation session.
    JoinSession { session_id: i64, user_id: i64 },

    /// Client -> Server: leave a consultation session.
    LeaveSession { session_id: i64, user_id: i64 },

    /// Bidirectional: a chat message (draft inbound, stamped outbound).
    NewMessage { message: ChatMessage },

    /// Server -> Client: identify acknowledgement.
    Identified { user: UserProfile },

    /// Server -> Client: persisted history, sent only to the joiner.
    SessionHistory { messages: Vec<ChatMessage> },

    /// Server -> Client: error.
    Error { message: String },
}
