//! In-memory devices for tests and `serve --simulate`.
//!
//! Every device records the bytes written to it and counts close attempts; tests drive the
//! device side with [`MockDriver::inject_data`], [`MockDriver::inject_error`] and
//! [`MockDriver::disconnect`]. Loopback devices echo writes back as data.

use crate::device::{DeviceDriver, DeviceError, DeviceEvent, DeviceHandle, OpenedDevice};
use crate::protocol::DeviceDescriptor;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    devices: BTreeMap<String, MockDevice>,
    next_generation: u64,
}

struct MockDevice {
    descriptor: DeviceDescriptor,
    loopback: bool,
    open: Option<OpenState>,
    written: Vec<u8>,
    close_attempts: usize,
    fail_next_write: Option<String>,
    fail_next_open: Option<String>,
}

struct OpenState {
    generation: u64,
    baud_rate: u32,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

/// Driver over a fixed set of simulated devices. Clones share the same devices.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MockDriver::add_device`].
    pub fn with_device(self, port: &str) -> Self {
        self.add_device(DeviceDescriptor::named(port));
        self
    }

    pub fn add_device(&self, descriptor: DeviceDescriptor) {
        self.insert(descriptor, false);
    }

    pub fn add_loopback_device(&self, port: &str) {
        self.insert(DeviceDescriptor::named(port), true);
    }

    fn insert(&self, descriptor: DeviceDescriptor, loopback: bool) {
        let port = descriptor.port.clone();
        self.lock().devices.insert(
            port,
            MockDevice {
                descriptor,
                loopback,
                open: None,
                written: Vec::new(),
                close_attempts: 0,
                fail_next_write: None,
                fail_next_open: None,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit driver data on an open device. Returns false when the device is not open.
    pub fn inject_data(&self, port: &str, data: &[u8]) -> bool {
        self.emit(port, DeviceEvent::Data(data.to_vec()))
    }

    pub fn inject_error(&self, port: &str, reason: &str) -> bool {
        self.emit(port, DeviceEvent::Error(reason.to_string()))
    }

    /// Device-initiated close, as when the adapter is unplugged.
    pub fn disconnect(&self, port: &str) -> bool {
        let mut state = self.lock();
        let Some(open) = state.devices.get_mut(port).and_then(|d| d.open.take()) else {
            return false;
        };
        let _ = open
            .events
            .send(DeviceEvent::Closed(Some("device disconnected".to_string())));
        true
    }

    fn emit(&self, port: &str, event: DeviceEvent) -> bool {
        let state = self.lock();
        state
            .devices
            .get(port)
            .and_then(|d| d.open.as_ref())
            .is_some_and(|open| open.events.send(event).is_ok())
    }

    /// Everything written to the device so far.
    pub fn written(&self, port: &str) -> Vec<u8> {
        self.lock()
            .devices
            .get(port)
            .map(|d| d.written.clone())
            .unwrap_or_default()
    }

    pub fn close_attempts(&self, port: &str) -> usize {
        self.lock()
            .devices
            .get(port)
            .map_or(0, |d| d.close_attempts)
    }

    pub fn is_open(&self, port: &str) -> bool {
        self.lock()
            .devices
            .get(port)
            .is_some_and(|d| d.open.is_some())
    }

    pub fn baud_rate(&self, port: &str) -> Option<u32> {
        self.lock()
            .devices
            .get(port)
            .and_then(|d| d.open.as_ref())
            .map(|o| o.baud_rate)
    }

    pub fn fail_next_write(&self, port: &str, reason: &str) {
        if let Some(d) = self.lock().devices.get_mut(port) {
            d.fail_next_write = Some(reason.to_string());
        }
    }

    pub fn fail_next_open(&self, port: &str, reason: &str) {
        if let Some(d) = self.lock().devices.get_mut(port) {
            d.fail_next_open = Some(reason.to_string());
        }
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self
            .lock()
            .devices
            .values()
            .map(|d| d.descriptor.clone())
            .collect())
    }

    async fn open(&self, port: &str, baud_rate: u32) -> Result<OpenedDevice, DeviceError> {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let device = state
            .devices
            .get_mut(port)
            .ok_or_else(|| DeviceError::NotFound(port.to_string()))?;
        if let Some(reason) = device.fail_next_open.take() {
            return Err(DeviceError::Failed(reason));
        }
        if device.open.is_some() {
            return Err(DeviceError::Busy(port.to_string()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        device.open = Some(OpenState {
            generation,
            baud_rate,
            events: events_tx,
        });
        Ok(OpenedDevice {
            handle: Arc::new(MockHandle {
                port: port.to_string(),
                generation,
                driver: self.clone(),
            }),
            events: events_rx,
        })
    }
}

struct MockHandle {
    port: String,
    generation: u64,
    driver: MockDriver,
}

#[async_trait]
impl DeviceHandle for MockHandle {
    async fn write(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.driver.lock();
        let device = state
            .devices
            .get_mut(&self.port)
            .ok_or_else(|| DeviceError::NotFound(self.port.clone()))?;
        let Some(open) = device.open.as_ref().filter(|o| o.generation == self.generation) else {
            return Err(DeviceError::Closed);
        };
        if let Some(reason) = device.fail_next_write.take() {
            return Err(DeviceError::Failed(reason));
        }
        if device.loopback {
            let _ = open.events.send(DeviceEvent::Data(data.to_vec()));
        }
        device.written.extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let mut state = self.driver.lock();
        let device = state
            .devices
            .get_mut(&self.port)
            .ok_or_else(|| DeviceError::NotFound(self.port.clone()))?;
        device.close_attempts += 1;
        let current = device
            .open
            .as_ref()
            .is_some_and(|o| o.generation == self.generation);
        if !current {
            return Err(DeviceError::Closed);
        }
        device.open = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_echoes_writes() {
        let driver = MockDriver::new();
        driver.add_loopback_device("sim0");
        let OpenedDevice { handle, mut events } = driver.open("sim0", 9600).await.expect("open");
        handle.write(b"ping").await.expect("write");
        assert_eq!(events.recv().await, Some(DeviceEvent::Data(b"ping".to_vec())));
        assert_eq!(driver.written("sim0"), b"ping");
    }

    #[tokio::test]
    async fn second_open_is_busy_until_closed() {
        let driver = MockDriver::new().with_device("COM1");
        let first = driver.open("COM1", 9600).await.expect("open");
        assert!(matches!(
            driver.open("COM1", 9600).await,
            Err(DeviceError::Busy(_))
        ));
        first.handle.close().await.expect("close");
        assert!(!driver.is_open("COM1"));
        assert!(driver.open("COM1", 115200).await.is_ok());
        assert_eq!(driver.baud_rate("COM1"), Some(115200));
    }

    #[tokio::test]
    async fn stale_handle_cannot_touch_a_reopened_device() {
        let driver = MockDriver::new().with_device("COM1");
        let first = driver.open("COM1", 9600).await.expect("open");
        assert!(driver.disconnect("COM1"));
        let _second = driver.open("COM1", 9600).await.expect("reopen");
        assert!(matches!(first.handle.write(b"x").await, Err(DeviceError::Closed)));
        assert!(matches!(first.handle.close().await, Err(DeviceError::Closed)));
        assert!(driver.is_open("COM1"));
        assert_eq!(driver.close_attempts("COM1"), 1);
    }

    #[tokio::test]
    async fn disconnect_emits_closed() {
        let driver = MockDriver::new().with_device("COM1");
        let mut opened = driver.open("COM1", 9600).await.expect("open");
        assert!(driver.disconnect("COM1"));
        assert!(matches!(
            opened.events.recv().await,
            Some(DeviceEvent::Closed(Some(_)))
        ));
        assert!(!driver.inject_data("COM1", b"late"));
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let driver = MockDriver::new();
        assert!(matches!(
            driver.open("nope", 9600).await,
            Err(DeviceError::NotFound(_))
        ));
    }
}
