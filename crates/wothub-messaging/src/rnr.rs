//! Request-and-response rendezvous: pairs each in-flight correlation id with
//! a single-slot channel its response is delivered through.
//!
//! The receive loop of a transport adapter must never stall on a slow waiter,
//! so delivery uses a bounded write timeout: when the slot is full and stays
//! full, `handle_response` reports failure and the caller re-classifies the
//! response as a notification.

use crate::{ResponseMessage, TransportError, TransportResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default bound on how long `handle_response` may block the reader.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(300);

/// Concurrent map of correlation id to a single-slot response channel.
///
/// An entry is opened before its request is sent and closed on the first
/// terminal response, on timeout, or on connection loss. Responses arriving
/// after close are dropped.
pub struct RnrChannel {
    slots: Mutex<HashMap<String, mpsc::Sender<ResponseMessage>>>,
    write_timeout: Duration,
}

impl Default for RnrChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RnrChannel {
    /// Create an empty rendezvous map with the default write timeout.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Register a new single-slot channel for `correlation_id`.
    ///
    /// Re-opening an id that is already in flight is a programming error and
    /// is rejected.
    pub fn open(&self, correlation_id: &str) -> TransportResult<mpsc::Receiver<ResponseMessage>> {
        let mut slots = self.slots.lock();
        if slots.contains_key(correlation_id) {
            return Err(TransportError::internal(format!(
                "correlation id '{correlation_id}' is already awaiting a response"
            )));
        }
        let (tx, rx) = mpsc::channel(1);
        slots.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Deliver a response to the waiter registered for its correlation id.
    ///
    /// Returns false when no entry exists or the waiter did not drain the
    /// slot within the write timeout; the caller then treats the response as
    /// an unsolicited notification.
    pub async fn handle_response(&self, resp: ResponseMessage) -> bool {
        let tx = {
            let slots = self.slots.lock();
            match slots.get(&resp.correlation_id) {
                Some(tx) => tx.clone(),
                None => return false,
            }
        };
        let correlation_id = resp.correlation_id.clone();
        match tx.send_timeout(resp, self.write_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(correlation_id = %correlation_id, "response slot full, waiter not reading");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(correlation_id = %correlation_id, "response arrived after close, dropped");
                false
            }
        }
    }

    /// Remove the channel for `correlation_id`, releasing any blocked waiter.
    pub fn close(&self, correlation_id: &str) {
        self.slots.lock().remove(correlation_id);
    }

    /// Drop every channel. Called on disconnect; all blocked waiters observe
    /// a closed channel and return without a value.
    pub fn close_all(&self) {
        self.slots.lock().clear();
    }

    /// Number of requests currently awaiting a response.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no request is awaiting a response.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Single timed read from a rendezvous channel.
    ///
    /// Returns `(true, Some(resp))` when a response arrived, `(true, None)`
    /// when the channel was closed, and `(false, None)` on timeout.
    pub async fn wait_for_response(
        rx: &mut mpsc::Receiver<ResponseMessage>,
        timeout: Duration,
    ) -> (bool, Option<ResponseMessage>) {
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(resp)) => (true, Some(resp)),
            Ok(None) => (true, None),
            Err(_) => (false, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Operation, RequestMessage};

    fn response(correlation_id: &str) -> ResponseMessage {
        RequestMessage::new(Operation::Ping, "", "", None, correlation_id).create_response(None, None)
    }

    #[tokio::test]
    async fn open_and_deliver() {
        let rnr = RnrChannel::new();
        let mut rx = rnr.open("c-1").unwrap();
        assert!(rnr.handle_response(response("c-1")).await);
        let (ok, resp) = RnrChannel::wait_for_response(&mut rx, Duration::from_millis(100)).await;
        assert!(ok);
        assert_eq!(resp.unwrap().correlation_id, "c-1");
    }

    #[tokio::test]
    async fn duplicate_open_fails() {
        let rnr = RnrChannel::new();
        let _rx = rnr.open("c-1").unwrap();
        assert!(rnr.open("c-1").is_err());
    }

    #[tokio::test]
    async fn unknown_correlation_is_reported() {
        let rnr = RnrChannel::new();
        assert!(!rnr.handle_response(response("nobody")).await);
    }

    #[tokio::test]
    async fn response_after_close_is_dropped() {
        let rnr = RnrChannel::new();
        let mut rx = rnr.open("c-1").unwrap();
        rnr.close("c-1");
        assert!(!rnr.handle_response(response("c-1")).await);
        let (ok, resp) = RnrChannel::wait_for_response(&mut rx, Duration::from_millis(50)).await;
        assert!(ok);
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn close_all_releases_waiters() {
        let rnr = RnrChannel::new();
        let mut rx = rnr.open("c-1").unwrap();
        let waiter = tokio::spawn(async move {
            RnrChannel::wait_for_response(&mut rx, Duration::from_secs(5)).await
        });
        rnr.close_all();
        let (ok, resp) = waiter.await.unwrap();
        assert!(ok);
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn full_slot_times_out() {
        let rnr = RnrChannel::new();
        let _rx = rnr.open("c-1").unwrap();
        assert!(rnr.handle_response(response("c-1")).await);
        // the waiter is not reading, the slot stays full
        assert!(!rnr.handle_response(response("c-1")).await);
    }
}
