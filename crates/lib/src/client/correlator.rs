//! Request ids, the pending-request table and the handle callers await responses through.

use crate::client::port::PortEvent;
use crate::client::ClientError;
use crate::protocol::{Command, Request, RequestId, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub(crate) type Resolver = oneshot::Sender<Result<Response, ClientError>>;

/// Messages from client handles to the connection driver task.
pub(crate) enum DriverCommand {
    /// Register `reply` under the request's id, then send the request.
    Send { request: Request, reply: Resolver },
    /// Drop the pending entry (the caller stopped waiting).
    Forget(RequestId),
    /// Route pushes for `port` to `events`. Replies false if another live subscriber holds the port.
    Subscribe {
        port: String,
        events: mpsc::UnboundedSender<PortEvent>,
        reply: oneshot::Sender<bool>,
    },
    /// Remove the subscription for `port` if it is still `events`.
    Unsubscribe {
        port: String,
        events: mpsc::UnboundedSender<PortEvent>,
    },
    Shutdown,
}

/// In-flight requests by id. At most one entry per id; owned by the driver task.
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiting: HashMap<RequestId, Resolver>,
}

impl PendingRequests {
    /// Fails (handing the resolver back) if `id` is already outstanding.
    pub fn register(&mut self, id: RequestId, resolver: Resolver) -> Result<(), Resolver> {
        if self.waiting.contains_key(&id) {
            return Err(resolver);
        }
        self.waiting.insert(id, resolver);
        Ok(())
    }

    /// Complete the request with a response (success or error alike). False if `id` is unknown.
    pub fn resolve(&mut self, id: &RequestId, response: Response) -> bool {
        match self.waiting.remove(id) {
            Some(resolver) => {
                let _ = resolver.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub fn reject(&mut self, id: &RequestId, error: ClientError) -> bool {
        match self.waiting.remove(id) {
            Some(resolver) => {
                let _ = resolver.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn forget(&mut self, id: &RequestId) -> bool {
        self.waiting.remove(id).is_some()
    }

    /// Reject every outstanding request. Returns how many there were.
    pub fn fail_all(&mut self, error: impl Fn() -> ClientError) -> usize {
        let count = self.waiting.len();
        for (_, resolver) in self.waiting.drain() {
            let _ = resolver.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// Cheap-to-clone sending half: assigns ids and waits for the matching response.
#[derive(Clone)]
pub(crate) struct Correlator {
    next_id: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<DriverCommand>,
    timeout: Option<Duration>,
}

impl Correlator {
    pub fn new(commands: mpsc::UnboundedSender<DriverCommand>, timeout: Option<Duration>) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            commands,
            timeout,
        }
    }

    pub fn commands(&self) -> &mpsc::UnboundedSender<DriverCommand> {
        &self.commands
    }

    fn next_id(&self) -> RequestId {
        RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send `command` and wait for its response. Only transport failures and timeouts are
    /// errors here; an error response from the gateway is `Ok(Response::Error(..))`.
    pub async fn send(&self, command: Command) -> Result<Response, ClientError> {
        let id = self.next_id();
        let (reply, response) = oneshot::channel();
        let request = Request {
            request_id: id.clone(),
            command,
        };
        self.commands
            .send(DriverCommand::Send { request, reply })
            .map_err(|_| ClientError::ConnectionClosed)?;

        let outcome = match self.timeout {
            None => response.await,
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.commands.send(DriverCommand::Forget(id.clone()));
                    return Err(ClientError::Timeout(id));
                }
            },
        };
        outcome.map_err(|_| ClientError::ConnectionClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with(ids: &[u64]) -> (PendingRequests, Vec<oneshot::Receiver<Result<Response, ClientError>>>) {
        let mut pending = PendingRequests::default();
        let mut receivers = Vec::new();
        for &id in ids {
            let (tx, rx) = oneshot::channel();
            assert!(pending.register(id.into(), tx).is_ok());
            receivers.push(rx);
        }
        (pending, receivers)
    }

    #[test]
    fn responses_resolve_only_their_own_request() {
        let (mut pending, mut receivers) = pending_with(&[1, 2, 3]);
        assert!(pending.resolve(&RequestId::from(3), Response::Error("three".into())));
        assert!(pending.resolve(&RequestId::from(1), Response::Success));
        assert!(receivers[1].try_recv().is_err());
        assert!(matches!(receivers[0].try_recv(), Ok(Ok(Response::Success))));
        assert!(matches!(
            receivers[2].try_recv(),
            Ok(Ok(Response::Error(ref m))) if m == "three"
        ));
        assert_eq!(pending.len(), 1);

        // A second response for the same id finds nothing.
        assert!(!pending.resolve(&RequestId::from(1), Response::Success));
    }

    #[test]
    fn ids_are_unique_while_outstanding() {
        let (mut pending, _receivers) = pending_with(&[7]);
        let (tx, _rx) = oneshot::channel();
        assert!(pending.register(RequestId::from(7), tx).is_err());
        let (tx, _rx) = oneshot::channel();
        assert!(pending.register(RequestId::Text("7".into()), tx).is_ok());
    }

    #[test]
    fn fail_all_rejects_everything() {
        let (mut pending, mut receivers) = pending_with(&[1, 2]);
        assert_eq!(pending.fail_all(|| ClientError::Malformed("bad".into())), 2);
        assert_eq!(pending.len(), 0);
        for rx in &mut receivers {
            assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Malformed(_)))));
        }
    }

    #[test]
    fn forgotten_requests_are_not_resolved() {
        let (mut pending, mut receivers) = pending_with(&[1]);
        assert!(pending.forget(&RequestId::from(1)));
        assert!(!pending.resolve(&RequestId::from(1), Response::Success));
        // The resolver was dropped without a value.
        assert!(matches!(
            receivers[0].try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn send_assigns_increasing_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Correlator::new(tx, None);
        let sender = correlator.clone();
        let calls = tokio::spawn(async move {
            let first = sender.send(Command::Enumerate).await;
            let second = sender.send(Command::Enumerate).await;
            (first, second)
        });
        let mut seen = Vec::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(DriverCommand::Send { request, reply }) => {
                    seen.push(request.request_id);
                    let _ = reply.send(Ok(Response::Success));
                }
                _ => panic!("expected a send"),
            }
        }
        assert_eq!(seen, vec![RequestId::from(1), RequestId::from(2)]);
        let (first, second) = calls.await.expect("join");
        assert!(matches!(first, Ok(Response::Success)));
        assert!(matches!(second, Ok(Response::Success)));
    }

    #[tokio::test]
    async fn timed_out_requests_are_forgotten() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Correlator::new(tx, Some(Duration::from_millis(20)));
        let result = correlator.send(Command::Enumerate).await;
        assert!(matches!(result, Err(ClientError::Timeout(ref id)) if *id == RequestId::from(1)));
        assert!(matches!(rx.recv().await, Some(DriverCommand::Send { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(DriverCommand::Forget(id)) if id == RequestId::from(1)
        ));
    }

    #[tokio::test]
    async fn closed_driver_means_connection_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let correlator = Correlator::new(tx, None);
        assert!(matches!(
            correlator.send(Command::Enumerate).await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
