//! Tracks outstanding pings this side has sent, so `Connection::ping` can
//! `await` the matching Pong instead of returning as soon as the frame hits
//! the wire. The read pump resolves an entry when it sees a Pong whose
//! payload matches; entries are dropped (and their sender along with them)
//! without panicking if the connection tears down first.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub(crate) struct PingRegistry {
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<()>>>,
}

impl PingRegistry {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Registers a ping payload as outstanding and returns the receiver half
    /// the caller should await.
    pub fn register(&self, payload: Vec<u8>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(payload, tx);
        rx
    }

    /// Called by the read pump when a Pong frame arrives. Resolves the
    /// matching registration, if any; unmatched Pongs (unsolicited, or a
    /// reply to a ping we gave up waiting on) are silently ignored.
    pub fn resolve(&self, payload: &[u8]) {
        if let Some(tx) = self.pending.lock().unwrap().remove(payload) {
            let _ = tx.send(());
        }
    }

    /// Drops every outstanding registration, waking any waiter with a
    /// dropped-sender error. Called once the connection reaches a terminal
    /// state.
    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_pong_resolves_the_waiter() {
        let registry = PingRegistry::new();
        let rx = registry.register(b"abc".to_vec());
        registry.resolve(b"abc");
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn mismatched_pong_does_not_resolve() {
        let registry = PingRegistry::new();
        let rx = registry.register(b"abc".to_vec());
        registry.resolve(b"xyz");
        registry.clear();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn clear_wakes_waiters_with_error() {
        let registry = PingRegistry::new();
        let rx = registry.register(b"abc".to_vec());
        registry.clear();
        assert!(rx.await.is_err());
    }
}
