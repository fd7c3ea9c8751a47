//! Lifecycle events published on the bus for observers and operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobOutcome, ServiceName};

/// Events emitted by supervisors, the router and the job executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    // Service lifecycle
    /// A service context signalled readiness after `start()`.
    ServiceStarted {
        service: ServiceName,
        timestamp: DateTime<Utc>,
    },
    /// A crashed context was recreated.
    ServiceRestarted {
        service: ServiceName,
        error: String,
        remaining_restarts: u32,
        timestamp: DateTime<Utc>,
    },
    /// The restart budget is exhausted; the service stays down.
    ServiceFailed {
        service: ServiceName,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A service was stopped on request.
    ServiceStopped {
        service: ServiceName,
        timestamp: DateTime<Utc>,
    },

    // Routing
    /// An envelope could not be delivered.
    EnvelopeDropped {
        from: ServiceName,
        to: ServiceName,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A serialized message could not be decoded and was discarded.
    MessageDropped {
        service: ServiceName,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Jobs
    /// A job handler was started.
    JobStarted {
        job_id: String,
        job_name: String,
        timestamp: DateTime<Utc>,
    },
    /// A job handler settled.
    JobFinished {
        job_id: String,
        job_name: String,
        outcome: JobOutcome,
        timestamp: DateTime<Utc>,
    },
    /// A job command was refused before any handler ran.
    JobRejected {
        job_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServiceEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ServiceEvent::ServiceStarted { timestamp, .. }
            | ServiceEvent::ServiceRestarted { timestamp, .. }
            | ServiceEvent::ServiceFailed { timestamp, .. }
            | ServiceEvent::ServiceStopped { timestamp, .. }
            | ServiceEvent::EnvelopeDropped { timestamp, .. }
            | ServiceEvent::MessageDropped { timestamp, .. }
            | ServiceEvent::JobStarted { timestamp, .. }
            | ServiceEvent::JobFinished { timestamp, .. }
            | ServiceEvent::JobRejected { timestamp, .. } => *timestamp,
        }
    }

    /// Get the service this event is about, if any.
    pub fn service(&self) -> Option<ServiceName> {
        match self {
            ServiceEvent::ServiceStarted { service, .. }
            | ServiceEvent::ServiceRestarted { service, .. }
            | ServiceEvent::ServiceFailed { service, .. }
            | ServiceEvent::ServiceStopped { service, .. }
            | ServiceEvent::MessageDropped { service, .. } => Some(*service),
            ServiceEvent::EnvelopeDropped { to, .. } => Some(*to),
            ServiceEvent::JobStarted { .. }
            | ServiceEvent::JobFinished { .. }
            | ServiceEvent::JobRejected { .. } => None,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ServiceEvent::JobStarted { job_id, .. }
            | ServiceEvent::JobFinished { job_id, .. }
            | ServiceEvent::JobRejected { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            ServiceEvent::ServiceStarted { service, .. } => format!("Service {} started", service),
            ServiceEvent::ServiceRestarted {
                service,
                error,
                remaining_restarts,
                ..
            } => format!(
                "Service {} restarted after: {} ({} restarts left)",
                service, error, remaining_restarts
            ),
            ServiceEvent::ServiceFailed { service, error, .. } => {
                format!("Service {} permanently failed: {}", service, error)
            }
            ServiceEvent::ServiceStopped { service, .. } => format!("Service {} stopped", service),
            ServiceEvent::EnvelopeDropped {
                from, to, reason, ..
            } => format!("Envelope {} -> {} dropped: {}", from, to, reason),
            ServiceEvent::MessageDropped { service, error, .. } => {
                format!("Message for {} dropped: {}", service, error)
            }
            ServiceEvent::JobStarted {
                job_id, job_name, ..
            } => format!("Job {} ({}) started", job_id, job_name),
            ServiceEvent::JobFinished {
                job_id, outcome, ..
            } => format!("Job {} {}", job_id, outcome.as_str()),
            ServiceEvent::JobRejected { job_id, reason, .. } => {
                format!("Job {} rejected: {}", job_id, reason)
            }
        }
    }
}
