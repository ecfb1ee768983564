//! Correlation tracking: the join point between outbound calls and inbound
//! replies.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;

use heron_errors::Error;

/// RAII guard that removes the registered entry on drop.
/// Ensures cleanup on reply, timeout, and when the call future is dropped
/// (caller cancellation, task abort).
pub(crate) struct PendingCallGuard<'a> {
    registry: &'a CorrelationRegistry,
    id: String,
}

impl std::fmt::Debug for PendingCallGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallGuard")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for PendingCallGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Concurrency-safe map from outstanding correlation id to the one-shot
/// slot its reply is delivered through. Written by call publishers and read
/// by the single reply dispatcher.
pub(crate) struct CorrelationRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<Bytes>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the delivery slot for `id`. Fails if `id` is already
    /// outstanding — id uniqueness is a caller contract.
    pub fn register(
        &self,
        id: &str,
    ) -> Result<(oneshot::Receiver<Bytes>, PendingCallGuard<'_>), Error> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(id) {
            return Err(Error::private(format!(
                "correlation id already in flight: {id}"
            )));
        }
        pending.insert(id.to_string(), tx);
        Ok((
            rx,
            PendingCallGuard {
                registry: self,
                id: id.to_string(),
            },
        ))
    }

    /// Delivers `body` to the caller waiting on `id`. Returns `false` when
    /// no caller is outstanding — the reply is dropped silently, which is
    /// not an error (the call may have timed out or been cancelled).
    pub fn resolve(&self, id: &str, body: Bytes) -> bool {
        let sender = self.pending.lock().unwrap().remove(id);
        match sender {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve_delivers_body() {
        let registry = CorrelationRegistry::new();
        let (rx, _guard) = registry.register("abc123").unwrap();

        assert!(registry.resolve("abc123", Bytes::from_static(b"{\"v\":1}")));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"{\"v\":1}"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = CorrelationRegistry::new();
        let (_rx, _guard) = registry.register("abc123").unwrap();

        let err = registry.register("abc123").unwrap_err();
        assert!(err.private_message().contains("abc123"));
    }

    #[test]
    fn resolve_without_caller_is_dropped() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.resolve("nobody", Bytes::from_static(b"x")));
    }

    #[test]
    fn guard_drop_frees_the_id() {
        let registry = CorrelationRegistry::new();
        {
            let (_rx, _guard) = registry.register("abc123").unwrap();
            assert_eq!(registry.outstanding(), 1);
        }
        assert_eq!(registry.outstanding(), 0);
        assert!(registry.register("abc123").is_ok());
    }

    #[tokio::test]
    async fn at_most_one_reply_per_call() {
        let registry = CorrelationRegistry::new();
        let (rx, _guard) = registry.register("abc123").unwrap();

        assert!(registry.resolve("abc123", Bytes::from_static(b"first")));
        assert!(!registry.resolve("abc123", Bytes::from_static(b"second")));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn resolve_after_receiver_dropped_reports_false() {
        let registry = CorrelationRegistry::new();
        let (rx, guard) = registry.register("abc123").unwrap();
        drop(rx);

        // Entry still present until the guard goes; delivery fails cleanly.
        assert!(!registry.resolve("abc123", Bytes::from_static(b"late")));
        drop(guard);
    }

    #[test]
    fn concurrent_register_and_resolve() {
        use std::sync::Arc;

        let registry = Arc::new(CorrelationRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let id = format!("call-{i}");
                let (rx, _guard) = registry.register(&id).unwrap();
                assert!(registry.resolve(&id, Bytes::from(id.clone().into_bytes())));
                let body = rx.blocking_recv().unwrap();
                assert_eq!(body, Bytes::from(id.into_bytes()));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.outstanding(), 0);
    }
}
