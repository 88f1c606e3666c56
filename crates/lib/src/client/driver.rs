//! Connection driver: the one task that owns the socket, the pending-request table and the
//! per-port subscribers.

use crate::client::correlator::{DriverCommand, PendingRequests};
use crate::client::port::PortEvent;
use crate::client::ClientError;
use crate::protocol::{Inbound, PushMessage, ServerMessage};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

type Subscribers = HashMap<String, mpsc::UnboundedSender<PortEvent>>;

pub(crate) async fn run<S>(mut ws: S, mut commands: mpsc::UnboundedReceiver<DriverCommand>)
where
    S: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut pending = PendingRequests::default();
    let mut subscribers = Subscribers::new();

    loop {
        // Commands first: an unsubscribe issued before a frame arrived must win.
        tokio::select! {
            biased;

            command = commands.recv() => {
                // Every client handle dropped.
                let Some(command) = command else { break };
                match command {
                    DriverCommand::Send { request, reply } => {
                        let id = request.request_id.clone();
                        let text = match serde_json::to_string(&request) {
                            Ok(text) => text,
                            Err(e) => {
                                let _ = reply.send(Err(ClientError::Encode(e)));
                                continue;
                            }
                        };
                        // Registered before sending so a fast response always finds it.
                        if let Err(reply) = pending.register(id.clone(), reply) {
                            let _ = reply.send(Err(ClientError::DuplicateRequestId(id)));
                            continue;
                        }
                        log::trace!("sending {} ({} in flight)", text, pending.len());
                        if let Err(e) = ws.send(Message::Text(text)).await {
                            log::debug!("sending request {} failed: {}", id, e);
                            pending.reject(&id, ClientError::Transport(e));
                            break;
                        }
                    }
                    DriverCommand::Forget(id) => {
                        if pending.forget(&id) {
                            log::debug!("gave up waiting for request {}", id);
                        }
                    }
                    DriverCommand::Subscribe { port, events, reply } => {
                        let taken = subscribers.get(&port).is_some_and(|s| !s.is_closed());
                        if !taken {
                            subscribers.insert(port, events);
                        }
                        let _ = reply.send(!taken);
                    }
                    DriverCommand::Unsubscribe { port, events } => {
                        if subscribers.get(&port).is_some_and(|s| s.same_channel(&events)) {
                            subscribers.remove(&port);
                        }
                    }
                    DriverCommand::Shutdown => {
                        let _ = ws.close().await;
                        break;
                    }
                }
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => on_frame(&text, &mut pending, &mut subscribers),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => on_frame(&text, &mut pending, &mut subscribers),
                        Err(e) => malformed(&e.to_string(), &mut pending),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("connection error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    let failed = pending.fail_all(|| ClientError::ConnectionClosed);
    log::debug!(
        "connection closed ({} pending request(s) failed, {} port(s) notified)",
        failed,
        subscribers.len()
    );
    for (_, events) in subscribers.drain() {
        let _ = events.send(PortEvent::Error("connection closed".to_string()));
        let _ = events.send(PortEvent::Close);
    }
}

/// Unparseable inbound data: no way to tell which request it answered, so every pending
/// request fails. The connection itself stays up.
fn malformed(reason: &str, pending: &mut PendingRequests) {
    let failed = pending.fail_all(|| ClientError::Malformed(reason.to_string()));
    log::warn!(
        "malformed frame from gateway ({}); rejected {} pending request(s)",
        reason,
        failed
    );
}

fn on_frame(text: &str, pending: &mut PendingRequests, subscribers: &mut Subscribers) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return malformed(&e.to_string(), pending),
    };
    match message.into_inbound() {
        Inbound::Response { id, response } => {
            if !pending.resolve(&id, response) {
                log::debug!("response for unknown request {}", id);
            }
        }
        Inbound::Push(PushMessage::Error {
            port: None,
            message,
        }) => log::warn!("gateway error: {}", message),
        Inbound::Push(PushMessage::Error {
            port: Some(port),
            message,
        }) => deliver(subscribers, port, PortEvent::Error(message)),
        Inbound::Push(PushMessage::Data { port, data }) => {
            deliver(subscribers, port, PortEvent::Data(data))
        }
        Inbound::Push(PushMessage::Closed { port }) => deliver(subscribers, port, PortEvent::Close),
    }
}

/// Hand an event to the port's subscriber. `Close` ends the subscription.
fn deliver(subscribers: &mut Subscribers, port: String, event: PortEvent) {
    let Some(events) = subscribers.get(&port) else {
        log::debug!("dropping push for unsubscribed port {}", port);
        return;
    };
    let last = matches!(event, PortEvent::Close);
    if events.send(event).is_err() || last {
        subscribers.remove(&port);
    }
}
