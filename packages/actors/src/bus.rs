//! Named routing between supervised services.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use bus_core::{BusMessage, Envelope, ServiceEvent, ServiceName, ServiceStatus};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::RuntimeConfig;
use crate::error::BusError;
use crate::service::ServiceSpec;
use crate::supervisor::{ListenerId, ServiceSupervisor};

/// Collects service registrations before the registry is frozen.
pub struct BusBuilder {
    config: RuntimeConfig,
    specs: Vec<ServiceSpec>,
}

impl BusBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            specs: Vec::new(),
        }
    }

    /// Register a service.
    pub fn service(mut self, spec: ServiceSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Freeze the registry. Each name may be registered once.
    pub fn build(self) -> Result<Bus, BusError> {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let mut services = BTreeMap::new();

        for spec in self.specs {
            let name = spec.name;
            let supervisor = ServiceSupervisor::new(spec, &self.config, events.clone());
            if services.insert(name, Arc::new(supervisor)).is_some() {
                return Err(BusError::DuplicateService(name));
            }
        }

        Ok(Bus {
            inner: Arc::new(BusInner {
                services,
                events,
                connections: Mutex::new(HashMap::new()),
                config: self.config,
            }),
        })
    }
}

struct BusInner {
    services: BTreeMap<ServiceName, Arc<ServiceSupervisor>>,
    events: broadcast::Sender<ServiceEvent>,
    connections: Mutex<HashMap<ServiceName, ListenerId>>,
    config: RuntimeConfig,
}

/// A fixed set of named services that can address each other.
///
/// Cloning is cheap; clones share the same registry. Separate buses share
/// nothing.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder(config: RuntimeConfig) -> BusBuilder {
        BusBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Look up a registered service.
    pub fn service(&self, name: ServiceName) -> Option<Arc<ServiceSupervisor>> {
        self.inner.services.get(&name).cloned()
    }

    /// Names of all registered services.
    pub fn names(&self) -> Vec<ServiceName> {
        self.inner.services.keys().copied().collect()
    }

    /// Subscribe to lifecycle events from every service on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Forward every envelope `name` posts to the envelope's destination.
    /// Connecting twice is a no-op.
    pub fn connect_service_to_bus(&self, name: ServiceName) -> Result<(), BusError> {
        let service = self.service(name).ok_or(BusError::UnknownService(name))?;
        let mut connections = self.inner.connections.lock();
        if connections.contains_key(&name) {
            return Ok(());
        }

        let bus: Weak<BusInner> = Arc::downgrade(&self.inner);
        let id = service.on_message(Arc::new(move |envelope: Envelope<BusMessage>| {
            if let Some(inner) = bus.upgrade() {
                // Failures are logged and published by `route`.
                let _ = Bus { inner }.route(name, envelope);
            }
        }));
        connections.insert(name, id);
        Ok(())
    }

    /// Stop forwarding envelopes posted by `name`.
    pub fn disconnect_service(&self, name: ServiceName) -> bool {
        let id = self.inner.connections.lock().remove(&name);
        match (id, self.service(name)) {
            (Some(id), Some(service)) => service.remove_message_listener(id),
            _ => false,
        }
    }

    /// Deliver `envelope.data` to the service named in `envelope.to`.
    ///
    /// Undeliverable envelopes are logged, published as
    /// [`ServiceEvent::EnvelopeDropped`] and returned as errors; nothing is
    /// retried. An undeliverable request is also answered with the error, so
    /// its caller fails immediately.
    pub fn route(&self, from: ServiceName, envelope: Envelope<BusMessage>) -> Result<(), BusError> {
        let to = envelope.to;
        let result = match self.inner.services.get(&to) {
            Some(target) => target.send(&envelope.data).map_err(BusError::from),
            None => Err(BusError::UnknownService(to)),
        };

        if let Err(e) = &result {
            tracing::warn!(
                "Dropping {} from {} to {}: {}",
                envelope.data.label(),
                from,
                to,
                e
            );
            let _ = self.inner.events.send(ServiceEvent::EnvelopeDropped {
                from,
                to,
                reason: e.to_string(),
                timestamp: Utc::now(),
            });
            if let BusMessage::Request(request) = &envelope.data
                && let Some(caller) = self.inner.services.get(&from)
                && !caller.fail_request(request, to, e.to_string())
            {
                tracing::debug!("Nobody is waiting for request {} any more", request.request_id);
            }
        }

        result
    }

    /// Post a message to a service from outside the mesh.
    pub fn send(&self, to: ServiceName, message: &BusMessage) -> Result<(), BusError> {
        let target = self.service(to).ok_or(BusError::UnknownService(to))?;
        target.send(message)?;
        Ok(())
    }

    /// Connect and start every registered service, in startup order.
    pub async fn start_all(&self) -> Result<(), BusError> {
        for name in self.startup_order() {
            self.connect_service_to_bus(name)?;
            if let Some(service) = self.service(name) {
                service.start().await?;
            }
        }
        Ok(())
    }

    /// Stop every registered service, in reverse startup order.
    pub async fn stop_all(&self) {
        for name in self.startup_order().into_iter().rev() {
            if let Some(service) = self.service(name) {
                service.stop().await;
            }
        }
    }

    /// Health snapshot of every registered service.
    pub fn health(&self) -> Vec<ServiceStatus> {
        self.inner.services.values().map(|s| s.status()).collect()
    }

    fn startup_order(&self) -> Vec<ServiceName> {
        ServiceName::ALL
            .into_iter()
            .filter(|name| self.inner.services.contains_key(name))
            .collect()
    }
}
