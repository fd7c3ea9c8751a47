//! Tick-based periodic scheduler.
//!
//! One loop drives every registered handler. Due handlers fire one after
//! another in registration order, so a pass never runs two triggers at once
//! and the next tick's delay starts only after the whole pass has finished.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bus_core::BusMessage;
use futures_util::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::executor::panic_message;
use crate::service::{Service, ServiceContext};

/// Result type for periodic triggers.
pub type TriggerResult = Result<(), String>;

/// Future type for periodic triggers.
pub type TriggerFuture = Pin<Box<dyn Future<Output = TriggerResult> + Send>>;

/// A recurring handler.
pub trait PeriodicHandler: Send + Sync + 'static {
    /// Name used in logs and status reports.
    fn name(&self) -> &str;

    /// Ticks between firings.
    fn cadence(&self) -> u32;

    fn trigger(&self) -> TriggerFuture;
}

/// A simple function-based periodic handler.
pub struct PeriodicFn<F>
where
    F: Fn() -> TriggerFuture + Send + Sync + 'static,
{
    name: String,
    cadence: u32,
    trigger: F,
}

impl<F> PeriodicFn<F>
where
    F: Fn() -> TriggerFuture + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, cadence: u32, trigger: F) -> Self {
        Self {
            name: name.into(),
            cadence,
            trigger,
        }
    }
}

impl<F> PeriodicHandler for PeriodicFn<F>
where
    F: Fn() -> TriggerFuture + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn cadence(&self) -> u32 {
        self.cadence
    }

    fn trigger(&self) -> TriggerFuture {
        (self.trigger)()
    }
}

/// A handler with its countdown.
struct RegisteredTimingHandler {
    remaining_ticks: u32,
    cadence: u32,
    handler: Arc<dyn PeriodicHandler>,
}

const MIN_TICK: Duration = Duration::from_millis(1);

/// Fires registered handlers on a shared fixed tick.
pub struct PeriodicScheduler {
    tick: Duration,
    trigger_timeout: Option<Duration>,
    handlers: Vec<RegisteredTimingHandler>,
}

impl PeriodicScheduler {
    /// Create a scheduler. A zero tick is raised to one millisecond.
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(MIN_TICK),
            trigger_timeout: None,
            handlers: Vec::new(),
        }
    }

    /// Abandon a trigger that runs longer than `timeout`.
    pub fn with_trigger_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Add a handler. A cadence of zero behaves like one.
    pub fn register_handler<H: PeriodicHandler>(&mut self, handler: H) {
        let cadence = handler.cadence().max(1);
        tracing::debug!("Registered periodic handler {} every {} ticks", handler.name(), cadence);
        self.handlers.push(RegisteredTimingHandler {
            remaining_ticks: cadence,
            cadence,
            handler: Arc::new(handler),
        });
    }

    /// Builder-style [`PeriodicScheduler::register_handler`].
    pub fn with_handler<H: PeriodicHandler>(mut self, handler: H) -> Self {
        self.register_handler(handler);
        self
    }

    /// Registered handler names, in firing order.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|h| h.handler.name().to_string())
            .collect()
    }

    /// Run one pass and return the names of the handlers that fired.
    pub async fn tick_once(&mut self) -> Vec<String> {
        let mut fired = Vec::new();
        for entry in &mut self.handlers {
            entry.remaining_ticks = entry.remaining_ticks.saturating_sub(1);
            if entry.remaining_ticks > 0 {
                continue;
            }

            let name = entry.handler.name().to_string();
            fire(&name, entry.handler.trigger(), self.trigger_timeout).await;
            entry.remaining_ticks = entry.cadence;
            fired.push(name);
        }
        fired
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            "Scheduler running {} handlers every {:?}",
            self.handlers.len(),
            self.tick
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {
                    self.tick_once().await;
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Await one trigger. Errors, panics and timeouts are logged and swallowed.
async fn fire(name: &str, trigger: TriggerFuture, timeout: Option<Duration>) {
    let guarded = AssertUnwindSafe(trigger).catch_unwind();
    let settled = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(settled) => settled,
            Err(_) => {
                tracing::warn!("Periodic handler {} timed out after {:?}", name, limit);
                return;
            }
        },
        None => guarded.await,
    };

    match settled {
        Ok(Ok(())) => tracing::debug!("Periodic handler {} fired", name),
        Ok(Err(e)) => tracing::warn!("Periodic handler {} failed: {}", name, e),
        Err(panic) => tracing::error!(
            "Periodic handler {} {}",
            name,
            panic_message(panic.as_ref())
        ),
    }
}

/// Builds the scheduler for one context incarnation.
pub type SchedulerBuilder = Arc<dyn Fn(&ServiceContext) -> PeriodicScheduler + Send + Sync>;

/// The scheduler service: runs a [`PeriodicScheduler`] for as long as its
/// context lives.
pub struct SchedulerService {
    builder: SchedulerBuilder,
    handler_names: Vec<String>,
    tick: Duration,
}

impl SchedulerService {
    pub fn new(builder: SchedulerBuilder) -> Self {
        Self {
            builder,
            handler_names: Vec::new(),
            tick: Duration::ZERO,
        }
    }
}

impl Service for SchedulerService {
    async fn on_start(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let scheduler = (self.builder)(ctx);
        self.handler_names = scheduler.handler_names();
        self.tick = scheduler.tick();
        tokio::spawn(scheduler.run(ctx.shutdown_token().clone()));
        Ok(())
    }

    async fn handle(&mut self, ctx: &ServiceContext, message: BusMessage) -> Result<(), ServiceError> {
        match message {
            BusMessage::Request(request) => {
                let result = match request.name.as_str() {
                    "status" => Ok(json!({
                        "handlers": self.handler_names,
                        "tickMs": u64::try_from(self.tick.as_millis()).unwrap_or(u64::MAX),
                    })),
                    other => Err(format!("scheduler does not support request {other}")),
                };
                if let Err(e) = ctx.reply(&request, result) {
                    tracing::warn!("Scheduler could not answer {}: {}", request.request_id, e);
                }
            }
            other => tracing::debug!("Scheduler ignoring {}", other.label()),
        }
        Ok(())
    }
}
