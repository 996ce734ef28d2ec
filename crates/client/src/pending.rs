//! Outstanding-request table keyed by request id.
//!
//! Every entry is resolved at most once: by its response, by its deadline
//! (the waiter removes it), or by a bulk failure when the transport goes away.

use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tether_core::protocol::RequestId;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Outcome = ClientResult<Value>;

struct PendingRequest {
    method: String,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an outstanding request and hand back the receiver for its outcome.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
        deadline: Instant,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.entries().insert(
            id,
            PendingRequest {
                method: method.into(),
                deadline,
                tx,
            },
        );
        rx
    }

    /// Deliver an outcome. Returns false when no entry matched.
    pub fn resolve(&self, id: &RequestId, outcome: Outcome) -> bool {
        match self.entries().remove(id) {
            Some(entry) => {
                // The waiter may already have given up; nothing to do then.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it. Returns its method when present.
    pub fn remove(&self, id: &RequestId) -> Option<String> {
        self.entries().remove(id).map(|entry| entry.method)
    }

    /// Fail every outstanding request, leaving the table empty.
    pub fn fail_all(&self, error: impl Fn() -> ClientError) -> usize {
        let drained: Vec<PendingRequest> = self.entries().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error()));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn deadline(&self, id: &RequestId) -> Option<Instant> {
        self.entries().get(id).map(|entry| entry.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let table = PendingTable::new();
        let id = RequestId::from(1);
        let rx = table.register(id.clone(), "ping", Instant::now() + Duration::from_secs(1));

        assert!(table.resolve(&id, Ok(Value::Null)));
        assert!(!table.resolve(&id, Ok(Value::Bool(true))));
        assert_eq!(rx.await.unwrap().unwrap(), Value::Null);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_drains_table() {
        let table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let receivers: Vec<_> = (1..=3)
            .map(|n| table.register(RequestId::from(n), "tools/list", deadline))
            .collect();

        assert_eq!(table.fail_all(|| ClientError::ConnectionClosed), 3);
        assert!(table.is_empty());
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(ClientError::ConnectionClosed)));
        }
    }

    #[test]
    fn test_remove_leaves_others() {
        let table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let _a = table.register(RequestId::from(1), "a", deadline);
        let _b = table.register(RequestId::from(2), "b", deadline);

        assert_eq!(table.remove(&RequestId::from(1)).as_deref(), Some("a"));
        assert!(table.remove(&RequestId::from(1)).is_none());
        assert!(table.contains(&RequestId::from(2)));
        assert_eq!(table.deadline(&RequestId::from(2)), Some(deadline));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let table = PendingTable::new();
        let id = RequestId::from("abc");
        let rx = table.register(id.clone(), "ping", Instant::now());
        drop(rx);

        assert!(table.resolve(&id, Ok(Value::Null)));
        assert!(table.is_empty());
    }
}
