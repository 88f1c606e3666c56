//! Client: one WebSocket connection to a gateway, shared by any number of remote ports.
//!
//! A background driver task owns the socket. Requests are correlated to responses by
//! `requestId`; pushes are routed to the [`RemotePort`] subscribed to their port name.

mod correlator;
mod driver;
mod port;

pub use port::{PortEvent, RemotePort};

use crate::protocol::{Command, DeviceDescriptor, RequestId, Response, SUBPROTOCOL};
use correlator::{Correlator, DriverCommand};
use futures_util::{Sink, Stream};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] WsError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("malformed data from gateway: {0}")]
    Malformed(String),
    #[error("request {0} timed out")]
    Timeout(RequestId),
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(RequestId),
    /// Error response from the gateway; the message is the gateway's.
    #[error("{0}")]
    Remote(String),
    #[error("unexpected response to {command}: {response:?}")]
    Unexpected {
        command: &'static str,
        response: Response,
    },
    #[error("port is already open: {0}")]
    AlreadyOpen(String),
    #[error("encoding request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Fail a request that has no response after this long. `None` waits until the
    /// response arrives or the connection fails.
    pub request_timeout: Option<Duration>,
}

/// Handle to a gateway connection. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    correlator: Correlator,
}

impl Client {
    /// Connect to a gateway WebSocket URL (e.g. `ws://127.0.0.1:8080/ws`).
    pub async fn connect(url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        log::debug!("connected to {}", url);
        Ok(Self::from_stream(ws, options))
    }

    /// Run the client over an established WebSocket.
    pub fn from_stream<S>(ws: S, options: ClientOptions) -> Self
    where
        S: Sink<Message, Error = WsError>
            + Stream<Item = Result<Message, WsError>>
            + Unpin
            + Send
            + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(driver::run(ws, commands_rx));
        Self {
            correlator: Correlator::new(commands_tx, options.request_timeout),
        }
    }

    /// Send one command and wait for its response. Error responses are `Ok(Response::Error)`.
    pub async fn request(&self, command: Command) -> Result<Response, ClientError> {
        self.correlator.send(command).await
    }

    /// Enumerate the gateway's serial devices.
    pub async fn list_ports(&self) -> Result<Vec<DeviceDescriptor>, ClientError> {
        match self.request(Command::Enumerate).await? {
            Response::Devices(devices) => Ok(devices),
            Response::Error(message) => Err(ClientError::Remote(message)),
            response => Err(ClientError::Unexpected {
                command: "enumerate",
                response,
            }),
        }
    }

    /// A handle for `path`; nothing is sent until [`RemotePort::open`].
    pub fn port(&self, path: impl Into<String>, baud_rate: u32) -> RemotePort {
        RemotePort::new(self.clone(), path.into(), baud_rate)
    }

    pub async fn open_port(
        &self,
        path: impl Into<String>,
        baud_rate: u32,
    ) -> Result<RemotePort, ClientError> {
        let mut port = self.port(path, baud_rate);
        port.open().await?;
        Ok(port)
    }

    /// False once the connection has ended.
    pub fn is_connected(&self) -> bool {
        !self.correlator.commands().is_closed()
    }

    /// Close the connection. Pending requests fail and open ports see a close event; the
    /// gateway closes every port this connection opened.
    pub fn disconnect(&self) {
        let _ = self.correlator.commands().send(DriverCommand::Shutdown);
    }

    pub(crate) async fn subscribe(
        &self,
        port: &str,
        events: mpsc::UnboundedSender<PortEvent>,
    ) -> Result<(), ClientError> {
        let (reply, accepted) = oneshot::channel();
        self.correlator
            .commands()
            .send(DriverCommand::Subscribe {
                port: port.to_string(),
                events,
                reply,
            })
            .map_err(|_| ClientError::ConnectionClosed)?;
        match accepted.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClientError::AlreadyOpen(port.to_string())),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    pub(crate) fn unsubscribe(&self, port: &str, events: &mpsc::UnboundedSender<PortEvent>) {
        let _ = self.correlator.commands().send(DriverCommand::Unsubscribe {
            port: port.to_string(),
            events: events.clone(),
        });
    }
}

/// `Ok` for a success response; the gateway's message for an error response.
pub(crate) fn expect_success(command: &'static str, response: Response) -> Result<(), ClientError> {
    match response {
        Response::Success => Ok(()),
        Response::Error(message) => Err(ClientError::Remote(message)),
        response => Err(ClientError::Unexpected { command, response }),
    }
}
