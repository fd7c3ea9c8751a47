//! Job executor: runs jobs by id with per-job cancellation.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bus_core::{BusMessage, JobCommand, JobKind, JobOutcome, Request, ServiceEvent};
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::error::{JobError, ServiceError};
use crate::handler::{HandlerFuture, HandlerResult, JobHandlerRegistry};
use crate::service::{Service, ServiceContext};

/// A job between `process` and settlement.
struct RunningJob {
    kind: JobKind,
    cancel: CancellationToken,
    generation: u64,
}

/// Runs registered job handlers, at most one job per id.
///
/// Every job gets its own cancellation token. [`JobExecutor::abort`] only
/// signals that token; the job stays registered until its handler settles.
pub struct JobExecutor {
    handlers: Arc<JobHandlerRegistry>,
    running: Arc<Mutex<HashMap<String, RunningJob>>>,
    generation: AtomicU64,
    job_timeout: Option<Duration>,
    /// Parent of every job token.
    shutdown: CancellationToken,
    event_tx: Option<broadcast::Sender<ServiceEvent>>,
}

impl JobExecutor {
    /// Create an executor. Fails unless every [`JobKind`] has a handler.
    pub fn new(handlers: Arc<JobHandlerRegistry>) -> Result<Self, JobError> {
        handlers.validate()?;
        Ok(Self {
            handlers,
            running: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            job_timeout: None,
            shutdown: CancellationToken::new(),
            event_tx: None,
        })
    }

    /// Signal a job's token once it has run this long.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<ServiceEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Derive job tokens from `token`, so cancelling it cancels every job.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Start a job by its wire name.
    pub fn process_named(
        &self,
        job_name: &str,
        job_id: impl Into<String>,
        payload: Value,
    ) -> Result<JoinHandle<JobOutcome>, JobError> {
        let kind = job_name
            .parse::<JobKind>()
            .map_err(|_| JobError::UnknownJobType(job_name.to_string()))?;
        self.process(kind, job_id, payload)
    }

    /// Start a job. Returns once the handler has been spawned; the handle
    /// resolves with the outcome.
    pub fn process(
        &self,
        kind: JobKind,
        job_id: impl Into<String>,
        payload: Value,
    ) -> Result<JoinHandle<JobOutcome>, JobError> {
        let job_id = job_id.into();
        let handler = self
            .handlers
            .get(kind)
            .ok_or_else(|| JobError::UnknownJobType(kind.to_string()))?;

        let cancel = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut running = self.running.lock();
            if running.contains_key(&job_id) {
                return Err(JobError::AlreadyRunning(job_id));
            }
            running.insert(
                job_id.clone(),
                RunningJob {
                    kind,
                    cancel: cancel.clone(),
                    generation,
                },
            );
        }

        tracing::info!("Processing job {} ({})", job_id, kind);
        self.publish(ServiceEvent::JobStarted {
            job_id: job_id.clone(),
            job_name: kind.to_string(),
            timestamp: Utc::now(),
        });

        let future = handler.handle(payload, cancel.clone());
        let running = Arc::clone(&self.running);
        let event_tx = self.event_tx.clone();
        let job_timeout = self.job_timeout;

        Ok(tokio::spawn(async move {
            let result = run_guarded(&job_id, future, &cancel, job_timeout).await;
            let outcome = match result {
                Ok(()) if cancel.is_cancelled() => JobOutcome::Cancelled,
                Ok(()) => JobOutcome::Completed,
                Err(error) => JobOutcome::Failed { error },
            };

            {
                let mut running = running.lock();
                if running
                    .get(&job_id)
                    .is_some_and(|job| job.generation == generation)
                {
                    running.remove(&job_id);
                }
            }

            match &outcome {
                JobOutcome::Failed { error } => {
                    tracing::warn!("Job {} ({}) failed: {}", job_id, kind, error)
                }
                other => tracing::info!("Job {} ({}) {}", job_id, kind, other.as_str()),
            }
            if let Some(tx) = event_tx {
                let _ = tx.send(ServiceEvent::JobFinished {
                    job_id,
                    job_name: kind.to_string(),
                    outcome: outcome.clone(),
                    timestamp: Utc::now(),
                });
            }
            outcome
        }))
    }

    /// Signal the cancellation token of a running job.
    ///
    /// Returns `false` when no job with that id is running.
    pub fn abort(&self, job_id: &str) -> bool {
        let running = self.running.lock();
        match running.get(job_id) {
            Some(job) => {
                tracing::info!("Aborting job {} ({})", job_id, job.kind);
                job.cancel.cancel();
                true
            }
            None => {
                tracing::debug!("Abort requested for unknown job {}", job_id);
                false
            }
        }
    }

    /// Check if a job with this id has not settled yet.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.lock().contains_key(job_id)
    }

    /// Ids of all unsettled jobs, sorted.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Signal every running job.
    pub fn cancel_all(&self) {
        for job in self.running.lock().values() {
            job.cancel.cancel();
        }
    }

    fn publish(&self, event: ServiceEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// Drive a handler to completion, turning panics into failures.
///
/// A timed-out job has its token signalled and is then awaited as usual.
async fn run_guarded(
    job_id: &str,
    future: HandlerFuture,
    cancel: &CancellationToken,
    job_timeout: Option<Duration>,
) -> HandlerResult {
    let mut guarded = AssertUnwindSafe(future).catch_unwind();
    let settled = match job_timeout {
        None => guarded.await,
        Some(limit) => {
            tokio::select! {
                settled = &mut guarded => settled,
                _ = tokio::time::sleep(limit) => {
                    tracing::warn!("Job {} exceeded {:?}, cancelling", job_id, limit);
                    cancel.cancel();
                    guarded.await
                }
            }
        }
    };
    settled.unwrap_or_else(|panic| Err(panic_message(panic.as_ref())))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// The jobs service: feeds [`JobCommand`]s from the bus into a [`JobExecutor`].
///
/// Jobs of one incarnation are cancelled when the context is torn down.
pub struct JobService {
    handlers: Arc<JobHandlerRegistry>,
    job_timeout: Option<Duration>,
    executor: Option<JobExecutor>,
}

impl JobService {
    pub fn new(handlers: Arc<JobHandlerRegistry>, config: &RuntimeConfig) -> Self {
        Self {
            handlers,
            job_timeout: config.job_timeout,
            executor: None,
        }
    }

    fn reject(ctx: &ServiceContext, job_id: String, error: JobError) {
        tracing::warn!("Rejected job {}: {}", job_id, error);
        ctx.publish(ServiceEvent::JobRejected {
            job_id,
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Apply one command. `Process` answers with the job id, `Abort` also
    /// says whether a running job was signalled.
    fn apply(executor: &JobExecutor, ctx: &ServiceContext, command: JobCommand) -> Result<Value, JobError> {
        match command {
            JobCommand::Process {
                job_name,
                job_id,
                payload,
            } => match executor.process_named(&job_name, job_id.clone(), payload) {
                Ok(_) => Ok(json!({ "jobId": job_id })),
                Err(e) => {
                    Self::reject(ctx, job_id, e.clone());
                    Err(e)
                }
            },
            JobCommand::Abort { job_id } => {
                let aborted = executor.abort(&job_id);
                Ok(json!({ "jobId": job_id, "aborted": aborted }))
            }
        }
    }

    fn answer(executor: &JobExecutor, ctx: &ServiceContext, request: &Request) {
        let result = match request.name.as_str() {
            "running" => Ok(json!({ "jobs": executor.running_jobs() })),
            JobCommand::REQUEST => match serde_json::from_value::<JobCommand>(request.data.clone()) {
                Ok(command) => Self::apply(executor, ctx, command).map_err(|e| e.to_string()),
                Err(e) => Err(format!("invalid job command: {e}")),
            },
            name => Err(format!("jobs does not support request {name}")),
        };
        if let Err(e) = ctx.reply(request, result) {
            tracing::warn!("Jobs could not answer {}: {}", request.request_id, e);
        }
    }
}

impl Service for JobService {
    async fn on_start(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let executor = JobExecutor::new(Arc::clone(&self.handlers))
            .map_err(|e| ServiceError::handler(e.to_string()))?
            .with_job_timeout(self.job_timeout)
            .with_event_tx(ctx.event_sender())
            .with_shutdown(ctx.shutdown_token().clone());
        tracing::info!("Job executor ready with {} handlers", self.handlers.job_kinds().len());
        self.executor = Some(executor);
        Ok(())
    }

    async fn handle(&mut self, ctx: &ServiceContext, message: BusMessage) -> Result<(), ServiceError> {
        let Some(executor) = &self.executor else {
            return Err(ServiceError::handler("job executor is not initialised"));
        };

        match message {
            BusMessage::Job(command) => {
                // Fire-and-forget commands have nobody to answer; rejections
                // are still published.
                let _ = Self::apply(executor, ctx, command);
            }
            BusMessage::Request(request) => Self::answer(executor, ctx, &request),
            BusMessage::Response(response) => {
                tracing::debug!("Jobs ignoring stray response {}", response.request_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;

    fn registry_with(kind: JobKind, handler: impl crate::handler::JobHandler) -> Arc<JobHandlerRegistry> {
        let registry = JobKind::ALL
            .into_iter()
            .filter(|k| *k != kind)
            .fold(JobHandlerRegistry::new(), |r, k| {
                r.with(FnHandler::new(k, |_payload, _cancel| Box::pin(async { Ok(()) })))
            })
            .with(handler);
        Arc::new(registry)
    }

    fn waits_for_cancel(kind: JobKind) -> impl crate::handler::JobHandler {
        FnHandler::new(kind, |_payload, cancel: CancellationToken| {
            Box::pin(async move {
                cancel.cancelled().await;
                Ok(())
            })
        })
    }

    #[test]
    fn incomplete_registry_is_rejected() {
        let registry = Arc::new(JobHandlerRegistry::new());
        assert!(matches!(
            JobExecutor::new(registry),
            Err(JobError::MissingHandlers(kinds)) if kinds.len() == JobKind::ALL.len()
        ));
    }

    #[tokio::test]
    async fn abort_unknown_job_is_harmless() {
        let executor =
            JobExecutor::new(registry_with(JobKind::ExportNotes, waits_for_cancel(JobKind::ExportNotes)))
                .unwrap();
        assert!(!executor.abort("never-started"));
        assert!(executor.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn aborted_job_stays_registered_until_it_settles() {
        let executor =
            JobExecutor::new(registry_with(JobKind::ExportNotes, waits_for_cancel(JobKind::ExportNotes)))
                .unwrap();

        let handle = executor
            .process(JobKind::ExportNotes, "job-1", Value::Null)
            .unwrap();
        assert!(executor.is_running("job-1"));

        assert!(executor.abort("job-1"));
        assert_eq!(handle.await.unwrap(), JobOutcome::Cancelled);
        assert!(!executor.is_running("job-1"));
    }

    #[tokio::test]
    async fn abort_keeps_an_unsettled_job_registered() {
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();
        let token_tx = Arc::new(Mutex::new(Some(token_tx)));
        let stubborn = FnHandler::new(JobKind::ExportNotes, move |_payload, cancel: CancellationToken| {
            if let Some(tx) = token_tx.lock().take() {
                let _ = tx.send(cancel);
            }
            Box::pin(std::future::pending::<HandlerResult>())
        });
        let executor = JobExecutor::new(registry_with(JobKind::ExportNotes, stubborn)).unwrap();

        let handle = executor.process(JobKind::ExportNotes, "J", Value::Null).unwrap();
        let cancel = token_rx.await.unwrap();

        assert!(executor.abort("J"));
        assert!(cancel.is_cancelled());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(executor.is_running("J"));
        assert_eq!(executor.running_jobs(), vec!["J".to_string()]);

        // The slot stays taken until the handler settles.
        assert!(matches!(
            executor.process(JobKind::ExportNotes, "J", Value::Null),
            Err(JobError::AlreadyRunning(id)) if id == "J"
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let executor =
            JobExecutor::new(registry_with(JobKind::CreateBackup, waits_for_cancel(JobKind::CreateBackup)))
                .unwrap();

        let first = executor
            .process(JobKind::CreateBackup, "job-1", Value::Null)
            .unwrap();
        let second = executor.process(JobKind::RestoreBackup, "job-1", Value::Null);
        assert!(matches!(second, Err(JobError::AlreadyRunning(id)) if id == "job-1"));

        executor.cancel_all();
        assert_eq!(first.await.unwrap(), JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_name_is_rejected() {
        let executor =
            JobExecutor::new(registry_with(JobKind::ExportNotes, waits_for_cancel(JobKind::ExportNotes)))
                .unwrap();
        let result = executor.process_named("compactDatabase", "job-1", Value::Null);
        assert!(matches!(result, Err(JobError::UnknownJobType(name)) if name == "compactDatabase"));
        assert!(!executor.is_running("job-1"));
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_free_their_slot() {
        let failing = FnHandler::new(JobKind::RestoreBackup, |payload: Value, _cancel| {
            Box::pin(async move {
                if payload.get("panic").is_some() {
                    panic!("backup archive corrupt");
                }
                Err("no backup found".to_string())
            })
        });
        let executor = JobExecutor::new(registry_with(JobKind::RestoreBackup, failing)).unwrap();

        let outcome = executor
            .process(JobKind::RestoreBackup, "job-1", Value::Null)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                error: "no backup found".to_string()
            }
        );
        assert!(!executor.is_running("job-1"));

        let outcome = executor
            .process(JobKind::RestoreBackup, "job-1", json!({ "panic": true }))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { error } if error.contains("backup archive corrupt")));
        assert!(!executor.is_running("job-1"));
    }

    #[tokio::test]
    async fn job_timeout_signals_the_token() {
        let executor =
            JobExecutor::new(registry_with(JobKind::ExportNotes, waits_for_cancel(JobKind::ExportNotes)))
                .unwrap()
                .with_job_timeout(Some(Duration::from_millis(20)));

        let outcome = executor
            .process(JobKind::ExportNotes, "slow", Value::Null)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_token_cancels_every_job() {
        let shutdown = CancellationToken::new();
        let executor =
            JobExecutor::new(registry_with(JobKind::ExportNotes, waits_for_cancel(JobKind::ExportNotes)))
                .unwrap()
                .with_shutdown(shutdown.clone());

        let a = executor.process(JobKind::ExportNotes, "a", Value::Null).unwrap();
        let b = executor.process(JobKind::ExportNotes, "b", Value::Null).unwrap();
        assert_eq!(executor.running_jobs(), vec!["a".to_string(), "b".to_string()]);

        shutdown.cancel();
        assert_eq!(a.await.unwrap(), JobOutcome::Cancelled);
        assert_eq!(b.await.unwrap(), JobOutcome::Cancelled);
    }
}
