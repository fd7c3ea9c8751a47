//! Service identity and lifecycle types.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of an addressable service on the bus.
///
/// The set is closed: every envelope destination is checked at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    /// Persistence collaborator.
    Database,
    /// Realtime socket gateway.
    Realtime,
    /// Background job processor.
    Jobs,
    /// Periodic scheduler.
    Scheduler,
}

impl ServiceName {
    /// Every service name, in startup order.
    pub const ALL: [ServiceName; 4] = [
        ServiceName::Database,
        ServiceName::Jobs,
        ServiceName::Scheduler,
        ServiceName::Realtime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceName::Database => "database",
            ServiceName::Realtime => "realtime",
            ServiceName::Jobs => "jobs",
            ServiceName::Scheduler => "scheduler",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service name: {0}")]
pub struct ParseServiceNameError(pub String);

impl FromStr for ServiceName {
    type Err = ParseServiceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ParseServiceNameError(s.to_string()))
    }
}

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// No context exists.
    #[default]
    Stopped,
    /// A context is being created and has not signalled readiness yet.
    Starting,
    /// The context is ready and accepting messages.
    Running,
    /// The context crashed and is being recreated.
    Restarting,
    /// The restart budget ran out. Only an explicit stop clears this.
    Failed,
}

impl ServiceState {
    /// Whether a context is live (or about to be live again after a crash).
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Restarting)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Restarting => write!(f, "restarting"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time health of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: ServiceName,
    pub state: ServiceState,
    pub remaining_restarts: u32,
}

impl ServiceStatus {
    /// Whether an operator needs to intervene.
    pub fn needs_attention(&self) -> bool {
        self.state == ServiceState::Failed
    }
}
