//! Per-connection state: parses frames, dispatches requests, forwards device events and
//! releases every open device when the client goes away.

use crate::device::DeviceEvent;
use crate::gateway::devices::{DeviceGateway, GatewayError, SessionEvent};
use crate::gateway::registry::SessionRegistry;
use crate::protocol::{
    salvage_request_id, Command, PushMessage, Request, Response, ServerMessage,
};
use futures_util::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;

const INTERNAL_ERROR: &str = "Internal server error";

/// One client connection. Lives on the connection's task; never shared.
pub struct Connection {
    peer: String,
    gateway: DeviceGateway,
    registry: SessionRegistry,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Connection {
    /// Returns the connection and the receiver its sessions' device events arrive on.
    pub fn new(
        peer: impl Into<String>,
        gateway: DeviceGateway,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Self {
            peer: peer.into(),
            gateway,
            registry: SessionRegistry::new(),
            events_tx,
        };
        (conn, events_rx)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn open_ports(&self) -> Vec<String> {
        self.registry.ports()
    }

    /// Handle one text frame. Always produces exactly one reply frame: the response, or an
    /// error push when the frame is not a request.
    pub async fn handle_frame(&mut self, text: &str) -> ServerMessage {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[{}] unparseable frame: {}", self.peer, e);
                return ServerMessage::push(PushMessage::Error {
                    port: None,
                    message: format!("Error parsing JSON: {}", e),
                });
            }
        };
        match Request::deserialize(&value) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                let message = format!("Invalid request: {}", e);
                log::debug!("[{}] {}", self.peer, message);
                match salvage_request_id(&value) {
                    Some(id) => ServerMessage::response(id, Response::Error(message)),
                    None => ServerMessage::push(PushMessage::Error {
                        port: None,
                        message,
                    }),
                }
            }
        }
    }

    /// Handle a well-formed request. Failures, panics included, become error responses.
    pub async fn handle(&mut self, request: Request) -> ServerMessage {
        let Request {
            request_id,
            command,
        } = request;
        log::debug!(
            "[{}] request {}: {} {}",
            self.peer,
            request_id,
            command.name(),
            command.port().unwrap_or("")
        );
        let response = match AssertUnwindSafe(self.dispatch(command)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::warn!("[{}] request {} failed: {}", self.peer, request_id, e);
                Response::Error(e.to_string())
            }
            Err(_) => {
                log::error!("[{}] uncaught error handling request {}", self.peer, request_id);
                Response::Error(INTERNAL_ERROR.to_string())
            }
        };
        ServerMessage::response(request_id, response)
    }

    async fn dispatch(&mut self, command: Command) -> Result<Response, GatewayError> {
        match command {
            Command::Enumerate => self.gateway.enumerate().await.map(Response::Devices),
            Command::Open { port, baud_rate } => self
                .gateway
                .open(&mut self.registry, &port, baud_rate, &self.events_tx)
                .await
                .map(|()| Response::Success),
            Command::Write { port, data } => self
                .gateway
                .write(&self.registry, &port, &data)
                .await
                .map(|()| Response::Success),
            Command::Close { port } => self
                .gateway
                .close(&mut self.registry, &port)
                .await
                .map(|()| Response::Success),
        }
    }

    /// Turn a device event into the push for the client. Events of sessions that were
    /// closed or replaced are dropped; `closed` also ends the session.
    pub fn on_device_event(&mut self, event: SessionEvent) -> Option<ServerMessage> {
        let SessionEvent {
            session,
            port,
            event,
        } = event;
        if !self.registry.is_current(&port, session) {
            log::debug!("[{}] dropping event for stale session {} of {}", self.peer, session, port);
            return None;
        }
        match &event {
            DeviceEvent::Data(_) => {}
            DeviceEvent::Error(reason) => {
                log::error!("[{}] serial port {} error: {}", self.peer, port, reason);
            }
            DeviceEvent::Closed(reason) => {
                log::warn!(
                    "[{}] serial port {} disconnected: {}",
                    self.peer,
                    port,
                    reason.as_deref().unwrap_or("closed by device")
                );
                self.registry.remove(&port);
            }
        }
        Some(ServerMessage::push(DeviceGateway::push_for(port, event)))
    }

    /// Close every device still open on this connection. Failures are logged; there is no
    /// client left to tell.
    pub async fn teardown(&mut self) {
        let sessions = self.registry.drain();
        if !sessions.is_empty() {
            log::debug!("[{}] closing {} open port(s)", self.peer, sessions.len());
        }
        for session in sessions {
            if let Err(e) = session.handle().close().await {
                log::warn!(
                    "[{}] closing {} during teardown failed: {}",
                    self.peer,
                    session.port(),
                    e
                );
            }
        }
    }
}
