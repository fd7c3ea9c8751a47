//! Job handler trait and registry.

use bus_core::JobKind;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Result type for job handlers.
pub type HandlerResult = Result<(), String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Cancellation is cooperative: a handler that never looks at `cancel`
/// runs to completion regardless of `abort`.
pub trait JobHandler: Send + Sync + 'static {
    /// The job kind this handler processes.
    fn job_kind(&self) -> JobKind;

    /// Run one job.
    fn handle(&self, payload: Value, cancel: CancellationToken) -> HandlerFuture;
}

/// Registry for job handlers.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        self.handlers.insert(handler.job_kind(), Arc::new(handler));
    }

    /// Builder-style [`JobHandlerRegistry::register`].
    pub fn with<H: JobHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    /// Get the handler for a job kind.
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Check if a handler exists for a job kind.
    pub fn has_handler(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// List all registered job kinds.
    pub fn job_kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Fail unless every [`JobKind`] has a handler.
    pub fn validate(&self) -> Result<(), JobError> {
        let missing: Vec<JobKind> = JobKind::ALL
            .into_iter()
            .filter(|kind| !self.has_handler(*kind))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(JobError::MissingHandlers(missing))
        }
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> HandlerFuture + Send + Sync + 'static,
{
    kind: JobKind,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(kind: JobKind, handler: F) -> Self {
        Self { kind, handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_kind(&self) -> JobKind {
        self.kind
    }

    fn handle(&self, payload: Value, cancel: CancellationToken) -> HandlerFuture {
        (self.handler)(payload, cancel)
    }
}

/// Helper macro for creating job handlers from async blocks.
///
/// ```ignore
/// let handler = job_handler!(JobKind::ExportNotes, |payload, cancel| {
///     cancel.cancelled().await;
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! job_handler {
    ($kind:expr, |$payload:ident, $cancel:ident| $body:expr) => {
        $crate::FnHandler::new(
            $kind,
            |$payload: $crate::JsonValue, $cancel: $crate::CancellationToken| {
                Box::pin(async move { $body })
            },
        )
    };
}
