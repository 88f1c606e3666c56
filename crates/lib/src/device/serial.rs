//! Real serial ports via the `serialport` crate.
//!
//! Blocking port I/O runs on the blocking pool; each open handle owns one reader thread that
//! polls with the configured read timeout and forwards bytes as [`DeviceEvent::Data`].

use crate::device::{DeviceDriver, DeviceError, DeviceEvent, DeviceHandle, OpenedDevice};
use crate::protocol::DeviceDescriptor;
use async_trait::async_trait;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

const READ_CHUNK: usize = 1024;

/// Driver backed by the operating system's serial ports.
#[derive(Debug, Clone)]
pub struct SerialDriver {
    read_timeout: Duration,
}

impl SerialDriver {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

fn describe(info: SerialPortInfo) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor::named(info.port_name);
    if let SerialPortType::UsbPort(usb) = info.port_type {
        descriptor.manufacturer = usb.manufacturer;
        descriptor.serial_number = usb.serial_number;
        descriptor.vid = Some(format!("{:04x}", usb.vid));
        descriptor.pid = Some(format!("{:04x}", usb.pid));
    }
    descriptor
}

fn join_error(e: tokio::task::JoinError) -> DeviceError {
    DeviceError::Failed(format!("serial worker failed: {}", e))
}

#[async_trait]
impl DeviceDriver for SerialDriver {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(join_error)??;
        Ok(ports.into_iter().map(describe).collect())
    }

    async fn open(&self, port: &str, baud_rate: u32) -> Result<OpenedDevice, DeviceError> {
        let name = port.to_string();
        let timeout = self.read_timeout;
        let (writer, reader) = tokio::task::spawn_blocking(move || -> Result<_, DeviceError> {
            let writer = serialport::new(&name, baud_rate).timeout(timeout).open()?;
            let reader = writer.try_clone()?;
            Ok((writer, reader))
        })
        .await
        .map_err(join_error)??;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_thread = std::thread::Builder::new()
            .name(format!("serial-reader {}", port))
            .spawn({
                let stop = Arc::clone(&stop);
                let port = port.to_string();
                move || read_loop(&port, reader, &stop, &events_tx)
            })?;

        log::debug!("serial port {} opened at {} baud", port, baud_rate);
        let handle = SerialHandle {
            port: port.to_string(),
            writer: Arc::new(Mutex::new(Some(writer))),
            stop,
            reader: Mutex::new(Some(reader_thread)),
        };
        Ok(OpenedDevice {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

fn read_loop(
    port: &str,
    mut reader: Box<dyn SerialPort>,
    stop: &AtomicBool,
    events: &mpsc::UnboundedSender<DeviceEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    while !stop.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if events.send(DeviceEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                continue
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("serial port {} read failed: {}", port, e);
                let _ = events.send(DeviceEvent::Error(e.to_string()));
                let _ = events.send(DeviceEvent::Closed(Some(e.to_string())));
                break;
            }
        }
    }
    log::debug!("serial reader for {} stopped", port);
}

struct SerialHandle {
    port: String,
    /// `None` once closed.
    writer: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl DeviceHandle for SerialHandle {
    async fn write(&self, data: &[u8]) -> Result<(), DeviceError> {
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer
                .lock()
                .map_err(|_| DeviceError::Failed("serial writer lock poisoned".to_string()))?;
            let port = guard.as_mut().ok_or(DeviceError::Closed)?;
            port.write_all(&data)?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&self) -> Result<(), DeviceError> {
        log::debug!("closing serial port {}", self.port);
        self.stop.store(true, Ordering::SeqCst);
        let writer = Arc::clone(&self.writer);
        let reader = self.reader.lock().ok().and_then(|mut g| g.take());
        tokio::task::spawn_blocking(move || {
            let port = writer
                .lock()
                .map_err(|_| DeviceError::Failed("serial writer lock poisoned".to_string()))?
                .take();
            if port.is_none() {
                return Err(DeviceError::Closed);
            }
            drop(port);
            // The reader holds a cloned descriptor; the port stays busy until it exits.
            if let Some(reader) = reader {
                let _ = reader.join();
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn usb_ports_report_hex_ids() {
        let info = SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: Some("A50285BI".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: None,
            }),
        };
        let d = describe(info);
        assert_eq!(d.port, "/dev/ttyUSB0");
        assert_eq!(d.vid.as_deref(), Some("0403"));
        assert_eq!(d.pid.as_deref(), Some("6001"));
        assert_eq!(d.manufacturer.as_deref(), Some("FTDI"));
        assert_eq!(d.serial_number.as_deref(), Some("A50285BI"));
    }

    #[test]
    fn non_usb_ports_only_have_a_name() {
        let info = SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        };
        assert_eq!(describe(info), DeviceDescriptor::named("/dev/ttyS0"));
    }

    #[tokio::test]
    async fn opening_a_missing_port_fails() {
        let driver = SerialDriver::new(Duration::from_millis(10));
        assert!(driver
            .open("/dev/serialnet-does-not-exist", 9600)
            .await
            .is_err());
    }
}
