//! Error types for services, the bus and the job executor.

use std::time::Duration;

use bus_core::{JobKind, RequestId, ServiceName};

/// Lifecycle and delivery errors of a single supervised service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service {0} is not running")]
    NotRunning(ServiceName),

    #[error("service {0} exhausted its restart budget")]
    PermanentlyFailed(ServiceName),

    #[error("service {service} failed to start: {reason}")]
    StartFailed { service: ServiceName, reason: String },

    #[error("service {service} was not ready within {timeout:?}")]
    ReadyTimeout {
        service: ServiceName,
        timeout: Duration,
    },

    #[error("service {service} could not accept a message: {reason}")]
    Send { service: ServiceName, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Handler(String),
}

impl ServiceError {
    /// A failure raised by service code; returning it from a handler crashes the context.
    pub fn handler(message: impl Into<String>) -> Self {
        ServiceError::Handler(message.into())
    }
}

/// Routing and request/response errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no service named {0} is registered")]
    UnknownService(ServiceName),

    #[error("service {0} registered twice")]
    DuplicateService(ServiceName),

    #[error("outbound channel of {0} is closed")]
    Disconnected(ServiceName),

    #[error("request {request_id} to {to} timed out after {timeout:?}")]
    Timeout {
        request_id: RequestId,
        to: ServiceName,
        timeout: Duration,
    },

    #[error("request {0} was abandoned before a response arrived")]
    Cancelled(RequestId),

    #[error("{from} answered with an error: {message}")]
    Remote { from: ServiceName, message: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job executor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("no handler registered for: {0:?}")]
    MissingHandlers(Vec<JobKind>),
}
