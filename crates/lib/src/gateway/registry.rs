//! Per-connection session registry: port name -> open session.
//!
//! Owned by a single connection task, so no locking. A port maps to at most one session;
//! every session gets a fresh [`SessionId`] so events from a replaced session can be told apart.

use crate::device::DeviceHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Identifies one open/close cycle of a port on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// An open device on this connection. Dropping it cancels the event subscription.
pub struct Session {
    id: SessionId,
    port: String,
    handle: Arc<dyn DeviceHandle>,
    forwarder: JoinHandle<()>,
}

impl Session {
    pub fn new(
        id: SessionId,
        port: impl Into<String>,
        handle: Arc<dyn DeviceHandle>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            port: port.into(),
            handle,
            forwarder,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn handle(&self) -> &Arc<dyn DeviceHandle> {
        &self.handle
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    pub fn is_open(&self, port: &str) -> bool {
        self.sessions.contains_key(port)
    }

    pub fn get(&self, port: &str) -> Option<&Session> {
        self.sessions.get(port)
    }

    /// True if `id` is the session currently registered for `port`.
    pub fn is_current(&self, port: &str, id: SessionId) -> bool {
        self.sessions.get(port).is_some_and(|s| s.id == id)
    }

    /// Register a session. A port that is already open is left untouched and the new
    /// session is handed back.
    pub fn insert(&mut self, session: Session) -> Result<(), Session> {
        if self.sessions.contains_key(&session.port) {
            return Err(session);
        }
        self.sessions.insert(session.port.clone(), session);
        Ok(())
    }

    pub fn remove(&mut self, port: &str) -> Option<Session> {
        self.sessions.remove(port)
    }

    /// Take every session (connection teardown).
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.sessions.keys().cloned().collect();
        ports.sort();
        ports
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDriver, MockDriver};
    use tokio::sync::mpsc;

    async fn session(registry: &mut SessionRegistry, driver: &MockDriver, port: &str) -> Session {
        let opened = driver.open(port, 9600).await.expect("open");
        Session::new(
            registry.next_session_id(),
            port,
            opened.handle,
            tokio::spawn(async {}),
        )
    }

    #[tokio::test]
    async fn one_session_per_port() {
        let driver = MockDriver::new().with_device("COM1").with_device("COM2");
        let mut registry = SessionRegistry::new();
        let first = session(&mut registry, &driver, "COM1").await;
        let first_id = first.id();
        assert!(registry.insert(first).is_ok());

        // A second handle for the same name is refused and the first stays registered.
        let other = MockDriver::new().with_device("COM1");
        let dup = session(&mut registry, &other, "COM1").await;
        let rejected = registry.insert(dup).err().expect("duplicate rejected");
        assert_ne!(rejected.id(), first_id);
        assert!(registry.is_current("COM1", first_id));
        assert_eq!(registry.len(), 1);

        let second = session(&mut registry, &driver, "COM2").await;
        assert!(registry.insert(second).is_ok());
        assert_eq!(registry.ports(), vec!["COM1".to_string(), "COM2".to_string()]);
    }

    #[tokio::test]
    async fn stale_ids_are_not_current() {
        let driver = MockDriver::new().with_device("COM1");
        let mut registry = SessionRegistry::new();
        let s = session(&mut registry, &driver, "COM1").await;
        let old = s.id();
        assert!(registry.insert(s).is_ok());
        let removed = registry.remove("COM1").expect("removed");
        removed.handle().close().await.expect("close");
        drop(removed);

        let s = session(&mut registry, &driver, "COM1").await;
        let new = s.id();
        assert!(registry.insert(s).is_ok());
        assert!(!registry.is_current("COM1", old));
        assert!(registry.is_current("COM1", new));
    }

    #[tokio::test]
    async fn dropping_a_session_stops_its_forwarder() {
        let driver = MockDriver::new().with_device("COM1");
        let mut registry = SessionRegistry::new();
        let opened = driver.open("COM1", 9600).await.expect("open");
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let forwarder = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        let id = registry.next_session_id();
        assert!(registry
            .insert(Session::new(id, "COM1", opened.handle, forwarder))
            .is_ok());

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        drop(drained);
        // The aborted forwarder drops its sender.
        assert_eq!(rx.recv().await, None);
    }
}
