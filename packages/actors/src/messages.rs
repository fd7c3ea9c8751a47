//! Message types for actor communication.

/// Messages for a service context actor.
#[derive(Debug)]
pub enum ServiceMessage {
    /// A JSON-serialized [`bus_core::BusMessage`] to decode and handle.
    Deliver(String),
}

/// Messages for a service supervisor actor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Tear down the context and stop supervising.
    Shutdown,
}
