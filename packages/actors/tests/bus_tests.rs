#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Instant;

use actors::{Bus, BusError, ServiceSpec};
use bus_core::{BusMessage, Envelope, Request, ServiceEvent, ServiceName, ServiceState};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use common::{EchoService, capture_envelopes, next_envelope, test_config, wait_for_event};

fn echo_bus(names: &[ServiceName]) -> Result<Bus, BusError> {
    names
        .iter()
        .fold(Bus::builder(test_config()), |builder, name| {
            builder.service(ServiceSpec::new(*name, || EchoService))
        })
        .build()
}

fn relay(to: &str, data: Value) -> Request {
    Request::new(ServiceName::Realtime, "relay", json!({ "to": to, "data": data }))
}

/// The error the relay answered its caller with.
async fn relay_error(
    posted: &mut mpsc::UnboundedReceiver<Envelope<BusMessage>>,
) -> Result<String, Box<dyn Error>> {
    let answer = next_envelope(posted).await.ok_or("relay answer")?;
    let BusMessage::Response(response) = answer.data else {
        return Err("expected a response".into());
    };
    Ok(response.into_result().err().ok_or("relay must fail")?)
}

#[tokio::test]
async fn responses_are_correlated_with_their_request() -> Result<(), Box<dyn Error>> {
    let bus = echo_bus(&[ServiceName::Database, ServiceName::Jobs])?;
    bus.start_all().await?;
    let jobs = bus.service(ServiceName::Jobs).ok_or("jobs registered")?;
    let mut posted = capture_envelopes(&jobs);

    let outer = relay("database", json!({ "noteId": 7 }));
    let outer_id = outer.request_id;
    bus.send(ServiceName::Jobs, &BusMessage::Request(outer))?;

    let call = next_envelope(&mut posted).await.ok_or("inner request")?;
    assert_eq!(call.to, ServiceName::Database);
    let BusMessage::Request(inner) = call.data else {
        return Err("expected a request".into());
    };
    assert_eq!(inner.name, "echo");
    assert_eq!(inner.from, ServiceName::Jobs);
    assert_ne!(inner.request_id, outer_id);

    let answer = next_envelope(&mut posted).await.ok_or("outer response")?;
    assert_eq!(answer.to, ServiceName::Realtime);
    let BusMessage::Response(response) = answer.data else {
        return Err("expected a response".into());
    };
    assert_eq!(response.request_id, outer_id);
    assert_eq!(response.into_result(), Ok(json!({ "noteId": 7 })));

    bus.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn unknown_destination_fails_the_caller_at_once() -> Result<(), Box<dyn Error>> {
    let bus = echo_bus(&[ServiceName::Jobs])?;
    let mut events = bus.subscribe();
    bus.start_all().await?;
    let jobs = bus.service(ServiceName::Jobs).ok_or("jobs registered")?;
    let mut posted = capture_envelopes(&jobs);

    let sent_at = Instant::now();
    bus.send(ServiceName::Jobs, &BusMessage::Request(relay("scheduler", json!(1))))?;

    let dropped = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::EnvelopeDropped { to: ServiceName::Scheduler, .. })
    })
    .await
    .ok_or("envelope dropped")?;
    assert!(dropped.description().contains("scheduler"));

    let _request = next_envelope(&mut posted).await.ok_or("inner request")?;
    let error = relay_error(&mut posted).await?;
    assert!(sent_at.elapsed() < test_config().request_timeout);
    assert!(error.contains("no service named scheduler"), "unexpected error: {error}");
    assert!(!error.contains("timed out"), "unexpected error: {error}");

    assert_eq!(jobs.pending_requests(), 0);
    assert_eq!(jobs.state(), ServiceState::Running);
    bus.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn stopped_destination_is_dropped() -> Result<(), Box<dyn Error>> {
    let bus = echo_bus(&[ServiceName::Database, ServiceName::Jobs])?;
    let mut events = bus.subscribe();
    bus.start_all().await?;
    bus.service(ServiceName::Database)
        .ok_or("database registered")?
        .stop()
        .await;
    let jobs = bus.service(ServiceName::Jobs).ok_or("jobs registered")?;
    let mut posted = capture_envelopes(&jobs);

    let sent_at = Instant::now();
    bus.send(ServiceName::Jobs, &BusMessage::Request(relay("database", json!(1))))?;
    let dropped = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::EnvelopeDropped { to: ServiceName::Database, .. })
    })
    .await
    .ok_or("envelope dropped")?;
    let ServiceEvent::EnvelopeDropped { from, reason, .. } = dropped else {
        return Err("expected a dropped envelope".into());
    };
    assert_eq!(from, ServiceName::Jobs);
    assert!(reason.contains("not running"), "unexpected reason: {reason}");

    let _request = next_envelope(&mut posted).await.ok_or("inner request")?;
    let error = relay_error(&mut posted).await?;
    assert!(sent_at.elapsed() < test_config().request_timeout);
    assert!(error.contains("not running"), "unexpected error: {error}");

    bus.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn unconnected_sender_cannot_reach_anyone() -> Result<(), Box<dyn Error>> {
    let bus = echo_bus(&[ServiceName::Database, ServiceName::Jobs])?;
    let mut events = bus.subscribe();
    let database = bus.service(ServiceName::Database).ok_or("database registered")?;
    let jobs = bus.service(ServiceName::Jobs).ok_or("jobs registered")?;
    database.start().await?;
    jobs.start().await?;

    jobs.send(&BusMessage::Request(relay("database", json!(1))))?;
    let dropped = wait_for_event(&mut events, |e| matches!(e, ServiceEvent::EnvelopeDropped { .. }))
        .await
        .ok_or("envelope dropped")?;
    assert!(matches!(
        dropped,
        ServiceEvent::EnvelopeDropped { from: ServiceName::Jobs, ref reason, .. }
            if reason.contains("not connected")
    ));
    // The relay fails at once and its answer is dropped the same way.
    let _ = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::EnvelopeDropped { to: ServiceName::Realtime, .. })
    })
    .await
    .ok_or("relay answer dropped")?;
    assert_eq!(jobs.pending_requests(), 0);

    // Connecting is idempotent and makes the route work.
    bus.connect_service_to_bus(ServiceName::Jobs)?;
    bus.connect_service_to_bus(ServiceName::Jobs)?;
    let mut posted = capture_envelopes(&jobs);
    jobs.send(&BusMessage::Request(relay("database", json!("ok"))))?;
    let _request = next_envelope(&mut posted).await.ok_or("inner request")?;
    let answer = next_envelope(&mut posted).await.ok_or("response")?;
    let BusMessage::Response(response) = answer.data else {
        return Err("expected a response".into());
    };
    assert_eq!(response.into_result(), Ok(json!("ok")));

    assert!(bus.disconnect_service(ServiceName::Jobs));
    assert!(!bus.disconnect_service(ServiceName::Jobs));
    bus.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn buses_are_isolated() -> Result<(), Box<dyn Error>> {
    let first = echo_bus(&[ServiceName::Database])?;
    let second = echo_bus(&[ServiceName::Database])?;
    let mut second_events = second.subscribe();
    first.start_all().await?;
    second.start_all().await?;
    let _ = wait_for_event(&mut second_events, |e| {
        matches!(e, ServiceEvent::ServiceStarted { .. })
    })
    .await
    .ok_or("second bus started")?;

    first.stop_all().await;

    let first_db = first.service(ServiceName::Database).ok_or("registered")?;
    let second_db = second.service(ServiceName::Database).ok_or("registered")?;
    assert_eq!(first_db.state(), ServiceState::Stopped);
    assert_eq!(second_db.state(), ServiceState::Running);

    // Nothing from the first bus leaks into the second one's events.
    assert!(second_events.try_recv().is_err());

    second.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn registration_is_checked() -> Result<(), Box<dyn Error>> {
    let duplicate = Bus::builder(test_config())
        .service(ServiceSpec::new(ServiceName::Database, || EchoService))
        .service(ServiceSpec::new(ServiceName::Database, || EchoService))
        .build();
    assert!(matches!(
        duplicate,
        Err(BusError::DuplicateService(ServiceName::Database))
    ));

    let bus = echo_bus(&[ServiceName::Database])?;
    assert!(matches!(
        bus.send(ServiceName::Jobs, &BusMessage::Request(relay("database", json!(1)))),
        Err(BusError::UnknownService(ServiceName::Jobs))
    ));
    assert!(matches!(
        bus.connect_service_to_bus(ServiceName::Jobs),
        Err(BusError::UnknownService(ServiceName::Jobs))
    ));

    let health = bus.health();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].name, ServiceName::Database);
    assert_eq!(health[0].state, ServiceState::Stopped);
    Ok(())
}
