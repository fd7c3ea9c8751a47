#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use actors::{BusError, RuntimeConfig, Service, ServiceContext, ServiceError, ServiceSupervisor};
use bus_core::{BusMessage, Envelope, ServiceEvent, ServiceName};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(3);

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_ready_timeout(Duration::from_secs(1))
        .with_stop_timeout(Duration::from_secs(1))
        .with_request_timeout(Duration::from_millis(300))
}

/// Answers every request with its own data.
///
/// `crash` fails the handler. `relay` forwards `data.data` as an `echo`
/// request to the service named in `data.to` and answers with the result.
#[derive(Default)]
pub struct EchoService;

impl Service for EchoService {
    async fn handle(&mut self, ctx: &ServiceContext, message: BusMessage) -> Result<(), ServiceError> {
        let BusMessage::Request(request) = message else {
            return Ok(());
        };

        let result = match request.name.as_str() {
            "crash" => return Err(ServiceError::handler("crash requested")),
            "relay" => {
                let to = request.data["to"]
                    .as_str()
                    .and_then(|name| name.parse::<ServiceName>().ok())
                    .ok_or_else(|| ServiceError::handler("relay needs a target"))?;
                ctx.request(to, "echo", None, request.data["data"].clone())
                    .await
                    .map_err(|e| e.to_string())
            }
            _ => Ok(request.data.clone()),
        };

        ctx.reply(&request, result)
            .map_err(|e| ServiceError::handler(e.to_string()))
    }
}

/// Accepts everything and answers nothing.
pub struct SilentService;

impl Service for SilentService {
    async fn handle(&mut self, _ctx: &ServiceContext, _message: BusMessage) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// `wait` calls `hold` on the service named in `data.to` from a background
/// task and reports how that call ended on `outcomes`. `crash` fails the
/// handler.
pub struct WaitingService {
    pub outcomes: mpsc::UnboundedSender<Result<Value, BusError>>,
}

impl Service for WaitingService {
    async fn handle(&mut self, ctx: &ServiceContext, message: BusMessage) -> Result<(), ServiceError> {
        let BusMessage::Request(request) = message else {
            return Ok(());
        };
        match request.name.as_str() {
            "crash" => Err(ServiceError::handler("crash requested")),
            "wait" => {
                let to = request.data["to"]
                    .as_str()
                    .and_then(|name| name.parse::<ServiceName>().ok())
                    .ok_or_else(|| ServiceError::handler("wait needs a target"))?;
                let ctx = ctx.clone();
                let outcomes = self.outcomes.clone();
                tokio::spawn(async move {
                    let result = ctx.request(to, "hold", None, Value::Null).await;
                    let _ = outcomes.send(result);
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Takes `delay` to become ready.
pub struct SlowStartService {
    pub delay: Duration,
}

impl Service for SlowStartService {
    async fn on_start(&mut self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn handle(&mut self, _ctx: &ServiceContext, _message: BusMessage) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Never becomes ready.
pub struct BrokenStartService;

impl Service for BrokenStartService {
    async fn on_start(&mut self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        Err(ServiceError::handler("database file is locked"))
    }

    async fn handle(&mut self, _ctx: &ServiceContext, _message: BusMessage) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Wait for the first event matching `matches`, skipping others.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<ServiceEvent>,
    matches: F,
) -> Option<ServiceEvent>
where
    F: Fn(&ServiceEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Copy every envelope `service` posts into a channel.
pub fn capture_envelopes(service: &ServiceSupervisor) -> mpsc::UnboundedReceiver<Envelope<BusMessage>> {
    let (tx, rx) = mpsc::unbounded_channel();
    service.on_message(Arc::new(move |envelope| {
        let _ = tx.send(envelope);
    }));
    rx
}

pub async fn next_envelope(
    envelopes: &mut mpsc::UnboundedReceiver<Envelope<BusMessage>>,
) -> Option<Envelope<BusMessage>> {
    tokio::time::timeout(WAIT, envelopes.recv()).await.ok().flatten()
}
