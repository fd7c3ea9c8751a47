//! Supervised services on a named message bus.
//!
//! This crate provides the Ractor-based runtime the notes server is built
//! on: isolated service contexts that only talk through serialized
//! envelopes, supervised with a restart budget, and addressed by name.
//!
//! # Architecture
//!
//! - `ServiceSupervisor` - Owns one context, restarts it on crash
//! - `Bus` - Routes envelopes between supervisors by service name
//! - `JobService` - Runs cancellable background jobs by id
//! - `SchedulerService` - Fires periodic handlers on a shared tick
//! - `RealtimeService` - Turns client frames into bus traffic
//!
//! # Usage
//!
//! ```ignore
//! use actors::{Bus, RuntimeConfig, ServiceSpec};
//! use bus_core::ServiceName;
//!
//! let bus = Bus::builder(RuntimeConfig::from_env()?)
//!     .service(ServiceSpec::new(ServiceName::Database, || MyDatabase::default()))
//!     .build()?;
//! bus.start_all().await?;
//! ```

mod bus;
mod config;
mod error;
mod executor;
mod gateway;
mod handler;
mod messages;
mod pending;
mod scheduler;
mod service;
mod supervisor;

pub use bus::{Bus, BusBuilder};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{BusError, JobError, ServiceError};
pub use executor::{JobExecutor, JobService};
pub use gateway::{FrameIngress, InboundFrame, RealtimeService};
pub use handler::{FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry};
pub use messages::{ServiceMessage, SupervisorMessage};
pub use pending::{PendingRequests, PendingResponse};
pub use scheduler::{
    PeriodicFn, PeriodicHandler, PeriodicScheduler, SchedulerBuilder, SchedulerService,
    TriggerFuture, TriggerResult,
};
pub use service::{Service, ServiceContext, ServiceFactory, ServiceSpec, WorkerPort};
pub use supervisor::{ListenerId, MessageListener, ServiceSupervisor};

/// Re-exports used by [`job_handler!`].
pub use serde_json::Value as JsonValue;
pub use tokio_util::sync::CancellationToken;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
