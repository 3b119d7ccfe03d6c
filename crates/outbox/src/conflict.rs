//! Edit conflict detection and resolution.
//!
//! Everything here is a pure function of the local edit and the server's
//! state; the coordinator performs the queries and applies the outcome.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{LocalMessage, MessageId, ServerVersion},
    protocol::RemoteMessage,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    ServerWins,
    LocalWins,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "last-write-wins",
            Self::ServerWins => "server-wins",
            Self::LocalWins => "local-wins",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "last-write-wins" | "lww" => Ok(Self::LastWriteWins),
            "server-wins" => Ok(Self::ServerWins),
            "local-wins" => Ok(Self::LocalWins),
            other => Err(format!("unknown conflict strategy '{other}'")),
        }
    }
}

/// The server holds different text for a message we tried to edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditConflict {
    pub message_id: MessageId,
    pub server_text: String,
    pub server_updated_at: DateTime<Utc>,
    pub server_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AcceptServer,
    KeepLocal,
}

/// A message missing from the window is not a conflict: it may have been
/// deleted server-side or scrolled out of the window.
pub fn find_conflict(
    messages: &[RemoteMessage],
    message_id: &MessageId,
    local_text: &str,
) -> Option<EditConflict> {
    let server = messages.iter().find(|m| &m.id == message_id)?;
    if server.text == local_text {
        return None;
    }
    Some(EditConflict {
        message_id: server.id.clone(),
        server_text: server.text.clone(),
        server_updated_at: server.last_modified().unwrap_or(DateTime::<Utc>::MIN_UTC),
        server_version: server.version,
    })
}

pub fn decide(
    strategy: ConflictStrategy,
    local: &LocalMessage,
    baseline: Option<&ServerVersion>,
    conflict: &EditConflict,
) -> Resolution {
    match strategy {
        ConflictStrategy::ServerWins => Resolution::AcceptServer,
        ConflictStrategy::LocalWins => Resolution::KeepLocal,
        ConflictStrategy::LastWriteWins => last_write_wins(local, baseline, conflict),
    }
}

fn last_write_wins(
    local: &LocalMessage,
    baseline: Option<&ServerVersion>,
    conflict: &EditConflict,
) -> Resolution {
    // Version counters are immune to clock skew; timestamps only break ties.
    if let (Some(server_version), Some(baseline)) = (conflict.server_version, baseline) {
        if server_version > baseline.version {
            return Resolution::AcceptServer;
        }
        if server_version < baseline.version {
            return Resolution::KeepLocal;
        }
    }

    if conflict.server_updated_at > local.last_mutation_at() {
        Resolution::AcceptServer
    } else {
        Resolution::KeepLocal
    }
}

#[cfg(test)]
#[path = "tests/conflict_tests.rs"]
mod tests;
