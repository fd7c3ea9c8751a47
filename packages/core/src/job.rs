//! Background job kinds and outcomes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of background job, used for routing to handlers.
///
/// Adding a variant forces every executor to register a handler for it,
/// see `JobHandlerRegistry::validate` in the actors crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    CreateBackup,
    RestoreBackup,
    ExportNotes,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::CreateBackup,
        JobKind::RestoreBackup,
        JobKind::ExportNotes,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::CreateBackup => "createBackup",
            JobKind::RestoreBackup => "restoreBackup",
            JobKind::ExportNotes => "exportNotes",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a job name matches no [`JobKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job type: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// How a job attempt settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The handler returned successfully without being cancelled.
    Completed,
    /// The handler returned after its cancellation token was signalled.
    Cancelled,
    /// The handler returned an error or panicked.
    Failed { error: String },
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Failed { .. } => "failed",
        }
    }
}
