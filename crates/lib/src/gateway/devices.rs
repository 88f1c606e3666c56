//! Device operations behind the wire commands, and translation of device events into pushes.

use crate::device::{DeviceDriver, DeviceError, DeviceEvent, OpenedDevice};
use crate::gateway::registry::{Session, SessionId, SessionRegistry};
use crate::protocol::{DeviceDescriptor, PushMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Request failure; the display text is the `message` of the error response.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Port is not open: {0}")]
    NotOpen(String),
    #[error("Port is already open: {0}")]
    AlreadyOpen(String),
    #[error("Error listing devices: {0}")]
    Enumerate(#[source] DeviceError),
    #[error("Error opening port: {1}")]
    Open(String, #[source] DeviceError),
    #[error("Error writing to port: {1}")]
    Write(String, #[source] DeviceError),
    #[error("Error closing port: {1}")]
    Close(String, #[source] DeviceError),
}

/// A device event tagged with the session it belongs to.
#[derive(Debug)]
pub struct SessionEvent {
    pub session: SessionId,
    pub port: String,
    pub event: DeviceEvent,
}

/// Wraps the shared device driver. Cheap to clone; one per gateway, used by every connection.
#[derive(Clone)]
pub struct DeviceGateway {
    driver: Arc<dyn DeviceDriver>,
}

impl DeviceGateway {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        Self { driver }
    }

    pub async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, GatewayError> {
        self.driver.enumerate().await.map_err(GatewayError::Enumerate)
    }

    /// Open `port`, register the session and start forwarding its events to `events`.
    pub async fn open(
        &self,
        registry: &mut SessionRegistry,
        port: &str,
        baud_rate: u32,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), GatewayError> {
        if registry.is_open(port) {
            return Err(GatewayError::AlreadyOpen(port.to_string()));
        }
        let OpenedDevice {
            handle,
            events: mut device_events,
        } = self
            .driver
            .open(port, baud_rate)
            .await
            .map_err(|e| GatewayError::Open(port.to_string(), e))?;

        let id = registry.next_session_id();
        let forwarder = tokio::spawn({
            let events = events.clone();
            let port = port.to_string();
            async move {
                while let Some(event) = device_events.recv().await {
                    let last = matches!(event, DeviceEvent::Closed(_));
                    let tagged = SessionEvent {
                        session: id,
                        port: port.clone(),
                        event,
                    };
                    if events.send(tagged).is_err() || last {
                        break;
                    }
                }
            }
        });
        if let Err(session) = registry.insert(Session::new(id, port, handle, forwarder)) {
            if let Err(e) = session.handle().close().await {
                log::warn!("closing duplicate handle for {} failed: {}", port, e);
            }
            return Err(GatewayError::AlreadyOpen(port.to_string()));
        }
        log::debug!("serial port {} opened ({})", port, id);
        Ok(())
    }

    pub async fn write(
        &self,
        registry: &SessionRegistry,
        port: &str,
        data: &[u8],
    ) -> Result<(), GatewayError> {
        let handle = registry
            .get(port)
            .map(|s| Arc::clone(s.handle()))
            .ok_or_else(|| GatewayError::NotOpen(port.to_string()))?;
        handle
            .write(data)
            .await
            .map_err(|e| GatewayError::Write(port.to_string(), e))
    }

    /// Close `port`. The session is unregistered (and its events dropped) even if the driver
    /// reports a failure.
    pub async fn close(
        &self,
        registry: &mut SessionRegistry,
        port: &str,
    ) -> Result<(), GatewayError> {
        let session = registry
            .remove(port)
            .ok_or_else(|| GatewayError::NotOpen(port.to_string()))?;
        session
            .handle()
            .close()
            .await
            .map_err(|e| GatewayError::Close(port.to_string(), e))?;
        log::debug!("serial port {} closed ({})", port, session.id());
        Ok(())
    }

    /// Translate a device event into the push sent to the client.
    pub fn push_for(port: String, event: DeviceEvent) -> PushMessage {
        match event {
            DeviceEvent::Data(data) => PushMessage::Data { port, data },
            DeviceEvent::Error(reason) => PushMessage::Error {
                port: Some(port),
                message: format!("Serialport error: {}", reason),
            },
            DeviceEvent::Closed(_) => PushMessage::Closed { port },
        }
    }
}
