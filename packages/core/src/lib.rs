//! Core types shared by every service on the bus.
//!
//! This crate contains plain data only:
//! - Service names, lifecycle states and health snapshots
//! - Envelopes and the bus message set (requests, responses, job commands)
//! - Job kinds and outcomes
//! - Lifecycle events for observers

mod events;
mod job;
mod message;
mod service;

pub use events::ServiceEvent;
pub use job::{JobKind, JobOutcome, UnknownJobKind};
pub use message::{BusMessage, Envelope, JobCommand, Request, RequestId, Response};
pub use service::{ParseServiceNameError, ServiceName, ServiceState, ServiceStatus};
