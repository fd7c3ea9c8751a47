//! Service contexts: the isolated actor a supervisor starts, and the
//! handle service code uses to talk to the rest of the bus.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bus_core::{BusMessage, Envelope, Request, ServiceEvent, ServiceName};
use chrono::Utc;
use futures_util::future::BoxFuture;
use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SpawnErr};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{BusError, ServiceError};
use crate::messages::ServiceMessage;
use crate::pending::PendingRequests;

/// Code that runs inside a supervised context.
///
/// A fresh value is built by the service's factory for every start and
/// restart, so state never survives a crash. Returning an error from
/// [`Service::handle`] crashes the context and triggers the restart policy.
pub trait Service: Send + 'static {
    /// Prepare the context. The supervisor reports the service as running
    /// only after this returns `Ok`.
    fn on_start(
        &mut self,
        ctx: &ServiceContext,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send {
        let _ = ctx;
        async { Ok(()) }
    }

    /// Handle one inbound message.
    fn handle(
        &mut self,
        ctx: &ServiceContext,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// The outbound channel of one context. Every envelope it posts is
/// serialized before it leaves.
#[derive(Clone)]
pub struct WorkerPort {
    from: ServiceName,
    tx: mpsc::UnboundedSender<String>,
}

impl WorkerPort {
    pub(crate) fn new(from: ServiceName, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { from, tx }
    }

    /// Name of the service that owns this port.
    pub fn name(&self) -> ServiceName {
        self.from
    }

    /// Wrap `message` in an envelope for `to` and post it.
    pub fn send(&self, to: ServiceName, message: &BusMessage) -> Result<(), BusError> {
        let raw = serde_json::to_string(&Envelope::new(to, message))?;
        self.tx
            .send(raw)
            .map_err(|_| BusError::Disconnected(self.from))
    }
}

/// Everything a running service may use to reach the outside world.
#[derive(Clone)]
pub struct ServiceContext {
    port: WorkerPort,
    pending: Arc<PendingRequests>,
    request_timeout: Duration,
    events: broadcast::Sender<ServiceEvent>,
    shutdown: CancellationToken,
}

impl ServiceContext {
    pub(crate) fn new(
        port: WorkerPort,
        pending: Arc<PendingRequests>,
        request_timeout: Duration,
        events: broadcast::Sender<ServiceEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            port,
            pending,
            request_timeout,
            events,
            shutdown,
        }
    }

    pub fn name(&self) -> ServiceName {
        self.port.name()
    }

    pub fn port(&self) -> &WorkerPort {
        &self.port
    }

    /// Cancelled when this context is torn down, by stop or by crash.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Post a message to another service without waiting for an answer.
    pub fn send(&self, to: ServiceName, message: BusMessage) -> Result<(), BusError> {
        self.port.send(to, &message)
    }

    /// Call `name` on another service and wait for the correlated response.
    pub async fn request(
        &self,
        to: ServiceName,
        name: impl Into<String>,
        key: Option<String>,
        data: Value,
    ) -> Result<Value, BusError> {
        let mut request = Request::new(self.name(), name, data);
        request.key = key;
        self.call(to, request).await
    }

    /// Send a prepared request and wait for the correlated response.
    pub async fn call(&self, to: ServiceName, mut request: Request) -> Result<Value, BusError> {
        request.from = self.name();
        let pending = self.pending.register(request.request_id);
        self.port.send(to, &BusMessage::Request(request))?;

        let response = pending.wait(to, self.request_timeout).await?;
        let from = response.from;
        response
            .into_result()
            .map_err(|message| BusError::Remote { from, message })
    }

    /// Answer `request`, routing the response back to its sender.
    pub fn reply(&self, request: &Request, result: Result<Value, String>) -> Result<(), BusError> {
        let response = match result {
            Ok(data) => request.respond(self.name(), data),
            Err(error) => request.fail(self.name(), error),
        };
        self.port.send(request.from, &BusMessage::Response(response))
    }

    /// Sender for lifecycle events, for tasks that outlive a single call.
    pub fn event_sender(&self) -> broadcast::Sender<ServiceEvent> {
        self.events.clone()
    }

    /// Publish a lifecycle event. Nobody listening is not an error.
    pub fn publish(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }
}

/// Builds and spawns a fresh service context.
pub trait ServiceFactory: Send + Sync + 'static {
    fn spawn(
        &self,
        ctx: ServiceContext,
        supervisor: ActorCell,
    ) -> BoxFuture<'static, Result<ActorRef<ServiceMessage>, SpawnErr>>;
}

impl<S, F> ServiceFactory for F
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Service,
{
    fn spawn(
        &self,
        ctx: ServiceContext,
        supervisor: ActorCell,
    ) -> BoxFuture<'static, Result<ActorRef<ServiceMessage>, SpawnErr>> {
        let service = self();
        Box::pin(async move {
            let (actor, _handle) = Actor::spawn_linked(
                None,
                ServiceActor::<S>::new(),
                ServiceActorArgs { service, ctx },
                supervisor,
            )
            .await?;
            Ok(actor)
        })
    }
}

/// Registration of one service: its name, how to build it, and its restart budget.
#[derive(Clone)]
pub struct ServiceSpec {
    pub name: ServiceName,
    pub factory: Arc<dyn ServiceFactory>,
    /// Overrides the bus default when set.
    pub restart_budget: Option<u32>,
}

impl ServiceSpec {
    pub fn new<S, F>(name: ServiceName, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Service,
    {
        Self {
            name,
            factory: Arc::new(factory),
            restart_budget: None,
        }
    }

    /// Set the number of restarts allowed before the service is marked failed.
    pub fn with_restart_budget(mut self, budget: u32) -> Self {
        self.restart_budget = Some(budget);
        self
    }
}

impl std::fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("name", &self.name)
            .field("restart_budget", &self.restart_budget)
            .finish()
    }
}

/// Actor hosting one incarnation of a [`Service`].
struct ServiceActor<S>(PhantomData<fn() -> S>);

impl<S> ServiceActor<S> {
    fn new() -> Self {
        Self(PhantomData)
    }
}

struct ServiceActorArgs<S> {
    service: S,
    ctx: ServiceContext,
}

/// State for the service actor.
struct ServiceActorState<S> {
    service: S,
    ctx: ServiceContext,
}

impl<S: Service> Actor for ServiceActor<S> {
    type Msg = ServiceMessage;
    type State = ServiceActorState<S>;
    type Arguments = ServiceActorArgs<S>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ServiceActorArgs { mut service, ctx } = args;
        tracing::debug!("Starting service context: {}", ctx.name());
        service.on_start(&ctx).await?;
        Ok(ServiceActorState { service, ctx })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ServiceMessage::Deliver(raw) => {
                let message = match serde_json::from_str::<BusMessage>(&raw) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Service {} dropped undecodable message: {}", state.ctx.name(), e);
                        state.ctx.publish(ServiceEvent::MessageDropped {
                            service: state.ctx.name(),
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        return Ok(());
                    }
                };

                state.service.handle(&state.ctx, message).await?;
            }
        }

        Ok(())
    }
}
