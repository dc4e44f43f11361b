// Core chat domain types shared by the relay server and its clients.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which side of a consultation a participant is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Clinician,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Clinician => "clinician",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "patient" => Ok(Self::Patient),
            "clinician" => Ok(Self::Clinician),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A participant identity as acknowledged by the relay after `identify`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: i64,
    pub display_name: String,
    pub role: Role,
}

/// One chat message within a consultation session.
///
/// Client drafts omit `id` and `created_at`; the relay stamps both before
/// persisting or broadcasting. `id` comes from the message store when the
/// append succeeds and is synthesized from the server timestamp when it
/// does not, so delivered messages always carry one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: i64,
    pub session_id: i64,
    pub text: String,
    pub sender_role: Role,
    pub sender_user_id: i64,
    pub sender_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
}
