//! The realtime service: turns client frames into bus traffic and bus
//! answers into reply frames.

use std::sync::Arc;

use bus_core::{BusMessage, JobCommand, JobKind, Request, ServiceName};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use wire::{ClientMessage, Frame, MessageHeader, encode_text_frame, read_message};

use crate::error::{BusError, ServiceError};
use crate::service::{Service, ServiceContext};

/// A frame received from one client connection, with the channel its
/// replies go back on.
#[derive(Debug)]
pub struct InboundFrame {
    pub frame: Frame,
    pub reply: mpsc::UnboundedSender<Frame>,
}

impl InboundFrame {
    pub fn new(frame: Frame, reply: mpsc::UnboundedSender<Frame>) -> Self {
        Self { frame, reply }
    }
}

/// Receiving half of the ingress channel, shared by successive incarnations.
pub type FrameIngress = Arc<Mutex<mpsc::UnboundedReceiver<InboundFrame>>>;

/// Gateway between client connections and the bus.
///
/// The ingress receiver outlives any one context: after a restart the new
/// incarnation resumes draining the same channel.
pub struct RealtimeService {
    ingress: FrameIngress,
}

impl RealtimeService {
    pub fn new(ingress: FrameIngress) -> Self {
        Self { ingress }
    }

    /// Create the ingress channel. The sender goes to the socket layer.
    pub fn channel() -> (mpsc::UnboundedSender<InboundFrame>, FrameIngress) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Arc::new(Mutex::new(rx)))
    }
}

impl Service for RealtimeService {
    async fn on_start(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let ingress = Arc::clone(&self.ingress);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let shutdown = ctx.shutdown_token().clone();
            let mut rx = tokio::select! {
                _ = shutdown.cancelled() => return,
                rx = ingress.lock() => rx,
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    inbound = rx.recv() => match inbound {
                        Some(inbound) => dispatch_frame(&ctx, inbound),
                        None => {
                            tracing::info!("Realtime ingress closed");
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    async fn handle(&mut self, ctx: &ServiceContext, message: BusMessage) -> Result<(), ServiceError> {
        match message {
            BusMessage::Request(request) => {
                let error = format!("realtime does not support request {}", request.name);
                if let Err(e) = ctx.reply(&request, Err(error)) {
                    tracing::warn!("Realtime could not answer {}: {}", request.request_id, e);
                }
            }
            other => tracing::debug!("Realtime ignoring {}", other.label()),
        }
        Ok(())
    }
}

/// Decode one frame and hand it to the bus. Invalid frames are dropped.
fn dispatch_frame(ctx: &ServiceContext, inbound: InboundFrame) {
    let InboundFrame { frame, reply } = inbound;
    let parsed = match read_message(&frame) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Dropping invalid frame: {}", e);
            return;
        }
    };
    let message = match ClientMessage::try_from(parsed) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("Dropping client message: {}", e);
            return;
        }
    };

    let replier = Replier {
        namespace: message.namespace(),
        kind: message.kind().to_string(),
        request_id: message.request_id().to_string(),
        tx: reply,
    };

    match message {
        ClientMessage::ProcessJob {
            job_name,
            job_id,
            payload,
            ..
        } => {
            if let Err(e) = job_name.parse::<JobKind>() {
                replier.send(Err(e.to_string()));
                return;
            }
            command_jobs(
                ctx,
                JobCommand::Process {
                    job_name,
                    job_id,
                    payload,
                },
                replier,
            );
        }
        ClientMessage::AbortJob { job_id, .. } => {
            command_jobs(ctx, JobCommand::Abort { job_id }, replier);
        }
        ClientMessage::SendFileData {
            target_id, data, ..
        } => {
            let request = Request::new(ctx.name(), "sendFileData", Value::Null)
                .with_key(target_id)
                .with_binary(data.to_vec());
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = ctx.call(ServiceName::Database, request).await;
                replier.send_result(result);
            });
        }
        ClientMessage::Database {
            operation,
            key,
            data,
            ..
        } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = ctx.request(ServiceName::Database, operation, key, data).await;
                replier.send_result(result);
            });
        }
    }
}

/// Hand a job command to the Jobs service and reply with its outcome.
fn command_jobs(ctx: &ServiceContext, command: JobCommand, replier: Replier) {
    let data = match serde_json::to_value(&command) {
        Ok(data) => data,
        Err(e) => {
            replier.send(Err(e.to_string()));
            return;
        }
    };
    let request = Request::new(ctx.name(), JobCommand::REQUEST, data);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let result = ctx.call(ServiceName::Jobs, request).await;
        if let Err(e) = &result {
            tracing::debug!("Job command {} failed: {}", command.job_id(), e);
        }
        replier.send_result(result);
    });
}

/// Writes the reply frame for one client message.
struct Replier {
    namespace: &'static str,
    kind: String,
    request_id: String,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Replier {
    fn send_result(self, result: Result<Value, BusError>) {
        let result = result.map_err(|e| match e {
            BusError::Remote { message, .. } => message,
            other => other.to_string(),
        });
        self.send(result);
    }

    fn send(self, result: Result<Value, String>) {
        let header = MessageHeader::new(self.namespace, self.kind, self.request_id);
        let header = match result {
            Ok(data) => header.with_field("data", data),
            Err(error) => header.with_field("error", error),
        };
        match encode_text_frame(&header) {
            Ok(text) => {
                if self.tx.send(Frame::Text(text)).is_err() {
                    tracing::debug!("Client went away before reply {}", header.request_id);
                }
            }
            Err(e) => tracing::warn!("Could not encode reply {}: {}", header.request_id, e),
        }
    }
}
