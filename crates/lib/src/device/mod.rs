//! Device driver interface: enumerate ports, open a handle, write/close it, and receive its
//! events (`data`, `error`, `closed`) as a typed stream.
//!
//! Two drivers ship: [`SerialDriver`] for real hardware and [`MockDriver`] for tests and the
//! `--simulate` mode of the CLI.

mod mock;
mod serial;

pub use mock::MockDriver;
pub use serial::SerialDriver;

use crate::config::Config;
use crate::protocol::DeviceDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Serial(#[from] serialport::Error),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("no such device: {0}")]
    NotFound(String),
    #[error("port is closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

/// Event emitted by an open handle. `Closed` is always the last event of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Data(Vec<u8>),
    Error(String),
    /// Device-initiated close (unplug, I/O failure); carries the reason when known.
    Closed(Option<String>),
}

/// Event stream of one open handle. Ends when the handle is closed or dropped.
pub type DeviceEvents = mpsc::UnboundedReceiver<DeviceEvent>;

/// Result of a successful [`DeviceDriver::open`].
pub struct OpenedDevice {
    pub handle: Arc<dyn DeviceHandle>,
    pub events: DeviceEvents,
}

/// The OS-level driver, shared by every connection of a gateway.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    async fn open(&self, port: &str, baud_rate: u32) -> Result<OpenedDevice, DeviceError>;
}

/// An open device. Closing it stops its event stream without a `Closed` event.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// Completes once the driver accepted the bytes; does not wait for the line to drain.
    async fn write(&self, data: &[u8]) -> Result<(), DeviceError>;

    async fn close(&self) -> Result<(), DeviceError>;
}

/// Pick the driver the config asks for: simulated loopback devices when `simulated` lists any,
/// real serial ports otherwise.
pub fn driver_from_config(config: &Config) -> Arc<dyn DeviceDriver> {
    if config.simulated.is_empty() {
        Arc::new(SerialDriver::new(Duration::from_millis(
            config.serial.read_timeout_ms,
        )))
    } else {
        let driver = MockDriver::new();
        for name in &config.simulated {
            driver.add_loopback_device(name);
        }
        log::info!("serving {} simulated device(s)", config.simulated.len());
        Arc::new(driver)
    }
}
