//! A remote serial port presented as a local duplex byte stream.

use crate::client::{expect_success, Client, ClientError};
use crate::protocol::Command;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Events a [`RemotePort`] yields to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Data(Vec<u8>),
    Error(String),
    /// The port is closed: by request, by the device, or because the connection went away.
    Close,
}

/// One serial port on the gateway, opened through a shared [`Client`].
///
/// Pushes for this port's name arrive on [`RemotePort::recv`] from the moment `open` is
/// called until a close event.
pub struct RemotePort {
    client: Client,
    path: String,
    baud_rate: u32,
    open: bool,
    events_tx: mpsc::UnboundedSender<PortEvent>,
    events_rx: mpsc::UnboundedReceiver<PortEvent>,
    /// Events taken off the channel by `open` and not yet handed to the consumer.
    backlog: VecDeque<PortEvent>,
}

impl RemotePort {
    pub(crate) fn new(client: Client, path: String, baud_rate: u32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            path,
            baud_rate,
            open: false,
            events_tx,
            events_rx,
            backlog: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub async fn open(&mut self) -> Result<(), ClientError> {
        // A close may already be queued (device gone) before the consumer read it.
        while self.open {
            let Ok(event) = self.events_rx.try_recv() else { break };
            self.observe(&event);
            self.backlog.push_back(event);
        }
        if self.open {
            return Err(ClientError::AlreadyOpen(self.path.clone()));
        }
        // Subscribe first: data may follow the success response immediately.
        self.client
            .subscribe(&self.path, self.events_tx.clone())
            .await?;
        let outcome = self
            .client
            .request(Command::Open {
                port: self.path.clone(),
                baud_rate: self.baud_rate,
            })
            .await
            .and_then(|response| expect_success("open", response));
        match outcome {
            Ok(()) => {
                self.open = true;
                log::debug!("opened {} at {} baud", self.path, self.baud_rate);
                Ok(())
            }
            Err(e) => {
                self.client.unsubscribe(&self.path, &self.events_tx);
                Err(e)
            }
        }
    }

    /// Write bytes (or a string) to the port. Resolves with the number of bytes written.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<usize, ClientError> {
        let data = data.as_ref().to_vec();
        let len = data.len();
        let response = self
            .client
            .request(Command::Write {
                port: self.path.clone(),
                data,
            })
            .await?;
        expect_success("write", response)?;
        Ok(len)
    }

    /// Close the port. The local close event is emitted and the subscription dropped whatever
    /// the gateway answers; a failure is still returned.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let outcome = self
            .client
            .request(Command::Close {
                port: self.path.clone(),
            })
            .await
            .and_then(|response| expect_success("close", response));
        self.client.unsubscribe(&self.path, &self.events_tx);
        self.open = false;
        let _ = self.events_tx.send(PortEvent::Close);
        outcome
    }

    /// Next event for this port. Waits indefinitely while the port is idle.
    pub async fn recv(&mut self) -> Option<PortEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let event = self.events_rx.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Next already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<PortEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let event = self.events_rx.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&mut self, event: &PortEvent) {
        if *event == PortEvent::Close {
            self.open = false;
        }
    }
}

impl Drop for RemotePort {
    fn drop(&mut self) {
        self.client.unsubscribe(&self.path, &self.events_tx);
    }
}
