//! Supervision of one service context.
//!
//! A [`ServiceSupervisor`] is the handle the rest of the system holds. It
//! spawns a supervisor actor which owns the linked context actor, restarts
//! it on crash while the restart budget lasts, and marks the service failed
//! once the budget is spent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bus_core::{BusMessage, Envelope, Request, ServiceEvent, ServiceName, ServiceState, ServiceStatus};
use chrono::Utc;
use parking_lot::RwLock;
use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SpawnErr, SupervisionEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::error::ServiceError;
use crate::messages::{ServiceMessage, SupervisorMessage};
use crate::pending::PendingRequests;
use crate::service::{ServiceContext, ServiceFactory, ServiceSpec, WorkerPort};

/// Callback invoked with every envelope a service posts.
pub type MessageListener = Arc<dyn Fn(Envelope<BusMessage>) + Send + Sync>;

/// Identifies a listener registered with [`ServiceSupervisor::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, MessageListener)>>,
}

impl ListenerSet {
    fn add(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<MessageListener> {
        self.entries.read().iter().map(|(_, l)| l.clone()).collect()
    }
}

/// One live context and the token that tells its tasks to wind down.
struct Incarnation {
    actor: ActorRef<ServiceMessage>,
    shutdown: CancellationToken,
}

impl Incarnation {
    fn is(&self, cell: &ActorCell) -> bool {
        self.actor.get_id() == cell.get_id()
    }
}

/// State visible to both the handle and the supervisor actor.
struct SupervisorShared {
    name: ServiceName,
    state: RwLock<ServiceState>,
    remaining_restarts: AtomicU32,
    current: RwLock<Option<Incarnation>>,
}

impl SupervisorShared {
    fn state(&self) -> ServiceState {
        *self.state.read()
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.write() = state;
    }

    fn current_actor(&self) -> Option<ActorRef<ServiceMessage>> {
        self.current.read().as_ref().map(|inc| inc.actor.clone())
    }

    fn is_current(&self, cell: &ActorCell) -> bool {
        self.current.read().as_ref().is_some_and(|inc| inc.is(cell))
    }

    fn replace_current(&self, incarnation: Incarnation) {
        *self.current.write() = Some(incarnation);
    }

    /// Detach the live context, signalling its shutdown token.
    fn take_current(&self) -> Option<ActorRef<ServiceMessage>> {
        let incarnation = self.current.write().take()?;
        incarnation.shutdown.cancel();
        Some(incarnation.actor)
    }
}

struct SupervisorRuntime {
    actor: ActorRef<SupervisorMessage>,
    handle: JoinHandle<()>,
    pump: JoinHandle<()>,
}

/// Owns the lifecycle of one isolated service context.
pub struct ServiceSupervisor {
    shared: Arc<SupervisorShared>,
    factory: Arc<dyn ServiceFactory>,
    restart_budget: u32,
    config: RuntimeConfig,
    events: broadcast::Sender<ServiceEvent>,
    listeners: Arc<ListenerSet>,
    pending: Arc<PendingRequests>,
    runtime: tokio::sync::Mutex<Option<SupervisorRuntime>>,
}

impl ServiceSupervisor {
    pub fn new(
        spec: ServiceSpec,
        config: &RuntimeConfig,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        let restart_budget = spec.restart_budget.unwrap_or(config.restart_budget);
        Self {
            shared: Arc::new(SupervisorShared {
                name: spec.name,
                state: RwLock::new(ServiceState::Stopped),
                remaining_restarts: AtomicU32::new(restart_budget),
                current: RwLock::new(None),
            }),
            factory: spec.factory,
            restart_budget,
            config: config.clone(),
            events,
            listeners: Arc::new(ListenerSet::default()),
            pending: Arc::new(PendingRequests::new()),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> ServiceName {
        self.shared.name
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    /// Whether a ready context is accepting messages.
    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn remaining_restarts(&self) -> u32 {
        self.shared.remaining_restarts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name(),
            state: self.state(),
            remaining_restarts: self.remaining_restarts(),
        }
    }

    /// Start the context and wait until it is ready. Does nothing if it is
    /// already running.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut runtime = self.runtime.lock().await;
        match self.state() {
            state if state.is_active() => return Ok(()),
            ServiceState::Failed => return Err(ServiceError::PermanentlyFailed(self.name())),
            _ => {}
        }
        if let Some(stale) = runtime.take() {
            stale.pump.abort();
        }

        self.shared.set_state(ServiceState::Starting);
        self.shared
            .remaining_restarts
            .store(self.restart_budget, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_outbound(
            self.name(),
            rx,
            self.listeners.clone(),
            self.pending.clone(),
            self.events.clone(),
        ));

        let args = SupervisorState {
            shared: self.shared.clone(),
            factory: self.factory.clone(),
            outbound: tx,
            pending: self.pending.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        };

        match Actor::spawn(None, SupervisorActor, args).await {
            Ok((actor, handle)) => {
                *runtime = Some(SupervisorRuntime {
                    actor,
                    handle,
                    pump,
                });
                Ok(())
            }
            Err(e) => {
                pump.abort();
                self.shared.take_current();
                self.shared.set_state(ServiceState::Stopped);
                Err(start_error(self.name(), e))
            }
        }
    }

    /// Tear down the context. Safe to call at any time, including after a
    /// permanent failure, which it clears.
    pub async fn stop(&self) {
        let mut runtime = self.runtime.lock().await;
        let Some(mut rt) = runtime.take() else {
            self.shared.set_state(ServiceState::Stopped);
            return;
        };

        if rt.actor.send_message(SupervisorMessage::Shutdown).is_ok()
            && tokio::time::timeout(self.config.stop_timeout, &mut rt.handle)
                .await
                .is_err()
        {
            tracing::warn!("Supervisor for {} did not stop in time, killing it", self.name());
            rt.actor.kill();
        }

        if let Some(actor) = self.shared.take_current() {
            actor.stop(None);
        }
        rt.pump.abort();
        self.pending.fail_all();
        self.shared.set_state(ServiceState::Stopped);

        tracing::info!("Service {} stopped", self.name());
        let _ = self.events.send(ServiceEvent::ServiceStopped {
            service: self.name(),
            timestamp: Utc::now(),
        });
    }

    /// Serialize `message` and deliver it to the context.
    ///
    /// Responses are matched against this service's outstanding requests
    /// directly so a handler awaiting one cannot block its own reply.
    pub fn send(&self, message: &BusMessage) -> Result<(), ServiceError> {
        if let BusMessage::Response(response) = message {
            if !self.is_started() {
                return Err(ServiceError::NotRunning(self.name()));
            }
            if !self.pending.resolve(response.clone()) {
                tracing::debug!(
                    "Service {} got a response for unknown request {}",
                    self.name(),
                    response.request_id
                );
            }
            return Ok(());
        }

        let raw = serde_json::to_string(message)?;
        self.send_raw(raw)
    }

    /// Deliver an already-serialized message. Undecodable payloads are
    /// dropped by the context without crashing it.
    pub fn send_raw(&self, raw: String) -> Result<(), ServiceError> {
        let actor = self
            .shared
            .current_actor()
            .ok_or(ServiceError::NotRunning(self.name()))?;

        actor
            .send_message(ServiceMessage::Deliver(raw))
            .map_err(|e| ServiceError::Send {
                service: self.name(),
                reason: e.to_string(),
            })
    }

    /// Answer a request this service posted with `reason` on behalf of `to`.
    /// Returns false if nobody is waiting for it any more.
    pub(crate) fn fail_request(&self, request: &Request, to: ServiceName, reason: String) -> bool {
        self.pending.resolve(request.fail(to, reason))
    }

    /// Number of requests this service is still waiting on.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Subscribe to envelopes posted by this service.
    pub fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Remove a listener added with [`ServiceSupervisor::on_message`].
    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// Surface the supervisor's own startup error when there is one.
fn start_error(service: ServiceName, err: SpawnErr) -> ServiceError {
    match err {
        SpawnErr::StartupFailed(inner) => match inner.downcast::<ServiceError>() {
            Ok(err) => *err,
            Err(other) => ServiceError::StartFailed {
                service,
                reason: other.to_string(),
            },
        },
        other => ServiceError::StartFailed {
            service,
            reason: other.to_string(),
        },
    }
}

/// The error a context's `on_start` returned, without ractor's wrapping.
fn spawn_reason(err: SpawnErr) -> String {
    match err {
        SpawnErr::StartupFailed(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// Decode envelopes posted by the context and hand them to listeners.
///
/// A request posted while nobody listens is failed right away.
async fn pump_outbound(
    name: ServiceName,
    mut rx: mpsc::UnboundedReceiver<String>,
    listeners: Arc<ListenerSet>,
    pending: Arc<PendingRequests>,
    events: broadcast::Sender<ServiceEvent>,
) {
    while let Some(raw) = rx.recv().await {
        let envelope = match serde_json::from_str::<Envelope<BusMessage>>(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping undecodable envelope from {}: {}", name, e);
                let _ = events.send(ServiceEvent::MessageDropped {
                    service: name,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                continue;
            }
        };

        let listeners = listeners.snapshot();
        if listeners.is_empty() {
            tracing::warn!(
                "Service {} is not connected, dropping envelope to {}",
                name,
                envelope.to
            );
            let reason = "sender is not connected to the bus";
            if let BusMessage::Request(request) = &envelope.data {
                pending.resolve(request.fail(envelope.to, reason));
            }
            let _ = events.send(ServiceEvent::EnvelopeDropped {
                from: name,
                to: envelope.to,
                reason: reason.into(),
                timestamp: Utc::now(),
            });
            continue;
        }

        for listener in listeners {
            listener(envelope.clone());
        }
    }
}

/// State for the supervisor actor.
struct SupervisorState {
    shared: Arc<SupervisorShared>,
    factory: Arc<dyn ServiceFactory>,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<PendingRequests>,
    events: broadcast::Sender<ServiceEvent>,
    config: RuntimeConfig,
}

impl SupervisorState {
    fn name(&self) -> ServiceName {
        self.shared.name
    }

    fn publish(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    /// Build a fresh context and wait for it to signal readiness.
    async fn spawn_context(&self, myself: &ActorRef<SupervisorMessage>) -> Result<(), ServiceError> {
        let shutdown = CancellationToken::new();
        let ctx = ServiceContext::new(
            WorkerPort::new(self.name(), self.outbound.clone()),
            self.pending.clone(),
            self.config.request_timeout,
            self.events.clone(),
            shutdown.clone(),
        );

        let spawn = self.factory.spawn(ctx, myself.get_cell());
        match tokio::time::timeout(self.config.ready_timeout, spawn).await {
            Ok(Ok(actor)) => {
                self.shared.replace_current(Incarnation { actor, shutdown });
                Ok(())
            }
            Ok(Err(e)) => {
                shutdown.cancel();
                Err(ServiceError::StartFailed {
                    service: self.name(),
                    reason: spawn_reason(e),
                })
            }
            Err(_) => {
                shutdown.cancel();
                Err(ServiceError::ReadyTimeout {
                    service: self.name(),
                    timeout: self.config.ready_timeout,
                })
            }
        }
    }

    /// Apply the restart policy after the live context died.
    async fn recover(&self, myself: &ActorRef<SupervisorMessage>, mut error: String) {
        self.shared.take_current();
        let abandoned = self.pending.fail_all();
        if abandoned > 0 {
            tracing::warn!("Service {} lost {} pending requests", self.name(), abandoned);
        }

        loop {
            let remaining = self.shared.remaining_restarts.load(Ordering::SeqCst);
            if remaining == 0 {
                self.shared.set_state(ServiceState::Failed);
                tracing::error!(
                    "Service {} exhausted its restart budget, last error: {}",
                    self.name(),
                    error
                );
                self.publish(ServiceEvent::ServiceFailed {
                    service: self.name(),
                    error,
                    timestamp: Utc::now(),
                });
                myself.stop(Some("restart budget exhausted".into()));
                return;
            }

            let remaining = remaining - 1;
            self.shared
                .remaining_restarts
                .store(remaining, Ordering::SeqCst);
            self.shared.set_state(ServiceState::Restarting);
            tracing::warn!(
                "Restarting service {} after: {} ({} restarts left)",
                self.name(),
                error,
                remaining
            );

            match self.spawn_context(myself).await {
                Ok(()) => {
                    self.shared.set_state(ServiceState::Running);
                    self.publish(ServiceEvent::ServiceRestarted {
                        service: self.name(),
                        error,
                        remaining_restarts: remaining,
                        timestamp: Utc::now(),
                    });
                    return;
                }
                Err(e) => error = e.to_string(),
            }
        }
    }
}

/// Supervisor actor for one service.
struct SupervisorActor;

impl Actor for SupervisorActor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorState;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        args.spawn_context(&myself).await?;
        args.shared.set_state(ServiceState::Running);

        tracing::info!("Service {} started", args.name());
        args.publish(ServiceEvent::ServiceStarted {
            service: args.name(),
            timestamp: Utc::now(),
        });
        Ok(args)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down service: {}", state.name());
                if let Some(actor) = state.shared.take_current()
                    && let Err(e) = actor
                        .stop_and_wait(None, Some(state.config.stop_timeout))
                        .await
                {
                    tracing::warn!("Context of {} did not stop cleanly: {}", state.name(), e);
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, error) = match message {
            SupervisionEvent::ActorFailed(cell, err) => (cell, err.to_string()),
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                (cell, reason.unwrap_or_else(|| "context exited".into()))
            }
            _ => return Ok(()),
        };

        if !state.shared.is_current(&cell) {
            return Ok(());
        }

        tracing::warn!("Service {} context crashed: {}", state.name(), error);
        state.recover(&myself, error).await;
        Ok(())
    }
}
