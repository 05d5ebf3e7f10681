//! Address → live session table.
//!
//! At most one session per address: installing a new one closes the old one
//! before the lock is released, so concurrent reconnects can never leave two
//! live sessions behind. Entries leave only through [`ConnectionRegistry::remove`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::cert::AdbIdentity;
use crate::error::AdbError;
use crate::network::{AdbSession, ConnectOptions, ConnectionInfo};

/// What the registry needs from a session.
#[async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    /// Health probe; must not fail, only report `false`.
    async fn is_alive(&self) -> bool;

    /// Close the session. Must be idempotent.
    async fn close(&self);
}

#[async_trait]
impl ManagedSession for AdbSession {
    async fn is_alive(&self) -> bool {
        AdbSession::is_alive(self).await
    }

    async fn close(&self) {
        AdbSession::close(self).await
    }
}

pub struct ConnectionRegistry<S: ManagedSession = AdbSession> {
    sessions: Mutex<HashMap<String, Arc<S>>>,
}

impl<S: ManagedSession> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: ManagedSession> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` for `address`, closing any session it replaces.
    pub async fn set(&self, address: &str, session: Arc<S>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(old) = sessions.insert(address.to_string(), session) {
            debug!(address, "replacing existing session");
            old.close().await;
        }
    }

    pub async fn get(&self, address: &str) -> Option<Arc<S>> {
        self.sessions.lock().await.get(address).cloned()
    }

    /// Close and forget the session for `address`. Returns whether one existed.
    pub async fn remove(&self, address: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.remove(address) {
            Some(session) => {
                session.close().await;
                info!(address, "session removed");
                true
            }
            None => false,
        }
    }

    /// Probe the session for `address`. No entry is `false`.
    ///
    /// The probe runs outside the lock so a slow device does not stall
    /// other registry users.
    pub async fn is_connected(&self, address: &str) -> bool {
        let Some(session) = self.get(address).await else {
            return false;
        };
        session.is_alive().await
    }

    pub async fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Close every session and empty the table.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (address, session) in sessions.drain() {
            debug!(address, "closing");
            session.close().await;
        }
    }
}

impl ConnectionRegistry<AdbSession> {
    /// Connect to `target` and install the session under its address.
    ///
    /// A failed connect leaves the registry untouched.
    pub async fn connect(
        &self,
        target: &ConnectionInfo,
        identity: &AdbIdentity,
        options: &ConnectOptions,
    ) -> Result<Arc<AdbSession>, AdbError> {
        let session = Arc::new(AdbSession::connect(target, identity, options).await?);
        self.set(&target.to_string(), Arc::clone(&session)).await;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSession {
        closes: AtomicUsize,
        dead: AtomicBool,
    }

    #[async_trait]
    impl ManagedSession for FakeSession {
        async fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst) && self.closes.load(Ordering::SeqCst) == 0
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn set_twice_closes_first_once() {
        let registry = ConnectionRegistry::<FakeSession>::new();
        let first = Arc::new(FakeSession::default());
        let second = Arc::new(FakeSession::default());

        registry.set("10.0.0.2:5555", Arc::clone(&first)).await;
        registry.set("10.0.0.2:5555", Arc::clone(&second)).await;

        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len().await, 1);
        let current = registry.get("10.0.0.2:5555").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn is_connected_follows_probe() {
        let registry = ConnectionRegistry::<FakeSession>::new();
        assert!(!registry.is_connected("nowhere:5555").await);

        let session = Arc::new(FakeSession::default());
        registry.set("a:5555", Arc::clone(&session)).await;
        assert!(registry.is_connected("a:5555").await);

        session.dead.store(true, Ordering::SeqCst);
        assert!(!registry.is_connected("a:5555").await);
    }

    #[tokio::test]
    async fn remove_closes_and_erases() {
        let registry = ConnectionRegistry::<FakeSession>::new();
        let session = Arc::new(FakeSession::default());
        registry.set("a:5555", Arc::clone(&session)).await;

        assert!(registry.remove("a:5555").await);
        assert!(!registry.remove("a:5555").await);
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert!(registry.get("a:5555").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_sets_leave_one_session() {
        let registry = Arc::new(ConnectionRegistry::<FakeSession>::new());
        let sessions: Vec<Arc<FakeSession>> = (0..8).map(|_| Arc::new(FakeSession::default())).collect();

        let mut handles = Vec::new();
        for s in &sessions {
            let registry = Arc::clone(&registry);
            let s = Arc::clone(s);
            handles.push(tokio::spawn(async move { registry.set("dev:5555", s).await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let open = sessions
            .iter()
            .filter(|s| s.closes.load(Ordering::SeqCst) == 0)
            .count();
        assert_eq!(open, 1);
        assert!(sessions.iter().all(|s| s.closes.load(Ordering::SeqCst) <= 1));

        registry.close_all().await;
        assert!(registry.is_empty().await);
    }
}
