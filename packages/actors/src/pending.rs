//! Correlation table for outstanding requests.

use std::collections::HashMap;
use std::time::Duration;

use bus_core::{RequestId, Response, ServiceName};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::BusError;

/// Maps each outstanding request id to the waiter for its response.
///
/// An entry is removed by the first matching response, by timeout, or by
/// [`PendingRequests::fail_all`]; a second response for the same id finds
/// nothing and is dropped.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<Response>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`.
    pub fn register(&self, request_id: RequestId) -> PendingResponse<'_> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);
        PendingResponse {
            table: self,
            request_id,
            rx,
        }
    }

    /// Hand a response to its waiter. Returns false if nobody is waiting.
    pub fn resolve(&self, response: Response) -> bool {
        let waiter = self.waiters.lock().remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Forget a request without answering it.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.waiters.lock().remove(&request_id).is_some()
    }

    /// Abandon every outstanding request; their waiters see [`BusError::Cancelled`].
    pub fn fail_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered request waiting for its response. Dropping it removes the entry.
pub struct PendingResponse<'a> {
    table: &'a PendingRequests,
    request_id: RequestId,
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse<'_> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the response, removing the entry if `timeout` elapses first.
    pub async fn wait(mut self, to: ServiceName, timeout: Duration) -> Result<Response, BusError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BusError::Cancelled(self.request_id)),
            Err(_) => Err(BusError::Timeout {
                request_id: self.request_id,
                to,
                timeout,
            }),
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use bus_core::Request;
    use serde_json::json;

    fn request() -> Request {
        Request::new(ServiceName::Realtime, "get", json!(null))
    }

    #[tokio::test]
    async fn response_reaches_its_waiter_once() {
        let table = PendingRequests::new();
        let request = request();
        let pending = table.register(request.request_id);

        assert!(table.resolve(request.respond(ServiceName::Database, json!(1))));
        assert!(!table.resolve(request.respond(ServiceName::Database, json!(2))));

        let response = pending
            .wait(ServiceName::Database, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.data, json!(1));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timeout_removes_the_entry() {
        let table = PendingRequests::new();
        let request = request();
        let pending = table.register(request.request_id);

        let result = pending
            .wait(ServiceName::Database, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert!(table.is_empty());
        assert!(!table.resolve(request.respond(ServiceName::Database, json!(null))));
    }

    #[tokio::test]
    async fn dropping_the_waiter_removes_the_entry() {
        let table = PendingRequests::new();
        let pending = table.register(RequestId::new());
        assert_eq!(table.len(), 1);
        drop(pending);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_cancels_waiters() {
        let table = PendingRequests::new();
        let pending = table.register(RequestId::new());
        assert_eq!(table.fail_all(), 1);

        let result = pending
            .wait(ServiceName::Database, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(BusError::Cancelled(_))));
    }
}
