//! Wiring of the notes server's services onto one bus.

use std::sync::Arc;
use std::time::Duration;

use actors::{
    Bus, BusError, FnHandler, FrameIngress, HandlerResult, JobHandlerRegistry, JobService,
    PeriodicFn, PeriodicHandler, PeriodicScheduler, RealtimeService, RuntimeConfig, SchedulerService,
    ServiceContext, ServiceSpec,
};
use bus_core::{BusMessage, JobCommand, JobKind, ServiceName};
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::database::MemoryDatabase;

/// Build the bus with every service registered. Nothing is started yet.
pub fn build_bus(config: RuntimeConfig, frames: FrameIngress) -> Result<Bus, BusError> {
    let handlers = Arc::new(job_handlers());
    let jobs_config = config.clone();
    let tick = config.scheduler_tick;
    let trigger_timeout = config.trigger_timeout;
    let backup_every = config.backup_every_ticks;

    Bus::builder(config)
        .service(ServiceSpec::new(ServiceName::Database, MemoryDatabase::default))
        .service(ServiceSpec::new(ServiceName::Jobs, move || {
            JobService::new(Arc::clone(&handlers), &jobs_config)
        }))
        .service(ServiceSpec::new(ServiceName::Scheduler, move || {
            SchedulerService::new(Arc::new(move |ctx: &ServiceContext| {
                PeriodicScheduler::new(tick)
                    .with_trigger_timeout(trigger_timeout)
                    .with_handler(backup_trigger(ctx.clone(), backup_every))
            }))
        }))
        .service(ServiceSpec::new(ServiceName::Realtime, move || {
            RealtimeService::new(Arc::clone(&frames))
        }))
        .build()
}

/// Periodically asks the jobs service for a backup.
fn backup_trigger(ctx: ServiceContext, every: u32) -> impl PeriodicHandler {
    PeriodicFn::new("scheduled-backup", every, move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            let job_id = format!("backup-{}", Utc::now().format("%Y%m%dT%H%M%S"));
            let command = JobCommand::Process {
                job_name: JobKind::CreateBackup.to_string(),
                job_id,
                payload: json!({ "reason": "scheduled" }),
            };
            ctx.send(ServiceName::Jobs, BusMessage::Job(command))
                .map_err(|e| e.to_string())
        })
    })
}

/// Demo handlers for every job kind. Each one works in steps and stops
/// early when its token is cancelled.
pub fn job_handlers() -> JobHandlerRegistry {
    JobHandlerRegistry::new()
        .with(FnHandler::new(JobKind::CreateBackup, |payload: Value, cancel| {
            Box::pin(async move {
                tracing::info!("Creating backup: {}", payload);
                work_in_steps(5, Duration::from_millis(200), &cancel).await
            })
        }))
        .with(FnHandler::new(JobKind::RestoreBackup, |payload: Value, cancel| {
            let backup_id = payload
                .get("backupId")
                .and_then(Value::as_str)
                .map(str::to_string);
            Box::pin(async move {
                let Some(backup_id) = backup_id else {
                    return Err("restoreBackup requires a backupId".to_string());
                };
                tracing::info!("Restoring backup {}", backup_id);
                work_in_steps(10, Duration::from_millis(200), &cancel).await
            })
        }))
        .with(FnHandler::new(JobKind::ExportNotes, |payload: Value, cancel| {
            let format = payload
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("markdown")
                .to_string();
            Box::pin(async move {
                tracing::info!("Exporting notes as {}", format);
                work_in_steps(3, Duration::from_millis(300), &cancel).await
            })
        }))
}

async fn work_in_steps(steps: u32, step: Duration, cancel: &CancellationToken) -> HandlerResult {
    for done in 0..steps {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Stopping after {}/{} steps", done, steps);
                return Ok(());
            }
            _ = tokio::time::sleep(step) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_job_kind_has_a_demo_handler() {
        assert_eq!(job_handlers().validate(), Ok(()));
    }

    #[tokio::test]
    async fn restore_without_backup_id_fails() {
        let handler = job_handlers()
            .get(JobKind::RestoreBackup)
            .expect("registered");
        let result = handler.handle(json!({}), CancellationToken::new()).await;
        assert_eq!(result, Err("restoreBackup requires a backupId".to_string()));
    }

    #[tokio::test]
    async fn cancelled_work_stops_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        assert_eq!(work_in_steps(100, Duration::from_secs(1), &cancel).await, Ok(()));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
