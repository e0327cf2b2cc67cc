//! Serial/USB link to a Meshtastic radio.
//!
//! The port is opened 8N1 with DTR/RTS asserted (ESP32 boards stay in reset otherwise) and
//! whatever boot text the radio already printed is discarded. A dedicated reader thread
//! performs the blocking reads, runs them through [`StreamFramer`] and forwards whole
//! payloads; writes are framed and performed on the blocking pool.
//!
//! Ports are opened exclusively, so `close` waits for the reader thread and drops both
//! handles before returning; an immediate reopen then finds the device free.
use super::{FrameResult, Link, LinkHandle, Transport};
use crate::error::TransportError;
use crate::logutil::hex_snippet;
use crate::meshtastic::framer::{encode_frame, StreamFramer, MAX_PAYLOAD};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const SETTLE_DELAY: Duration = Duration::from_millis(150);
const INBOUND_QUEUE: usize = 64;

/// Consecutive empty reads taken as end of file; some platforms report an unplugged
/// device this way instead of with an error.
const MAX_EMPTY_READS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SerialTransport {
    port: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

/// A serial device that could host a radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// Enumerate serial ports, USB devices first.
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(map_serial_error)?;
    let mut out: Vec<(bool, PortInfo)> = ports
        .into_iter()
        .map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let description = match (usb.manufacturer, usb.product) {
                    (Some(m), Some(p)) => format!("{} {}", m, p),
                    (Some(m), None) => m,
                    (None, Some(p)) => p,
                    (None, None) => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
                };
                (
                    true,
                    PortInfo {
                        name: p.port_name,
                        description,
                    },
                )
            }
            serialport::SerialPortType::BluetoothPort => (
                false,
                PortInfo {
                    name: p.port_name,
                    description: "Bluetooth".to_string(),
                },
            ),
            _ => (
                false,
                PortInfo {
                    name: p.port_name,
                    description: String::new(),
                },
            ),
        })
        .collect();
    out.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    Ok(out.into_iter().map(|(_, p)| p).collect())
}

fn map_serial_error(e: serialport::Error) -> TransportError {
    match e.kind {
        serialport::ErrorKind::NoDevice => TransportError::NotFound(e.description),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::NotFound(e.description)
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied(e.description)
        }
        _ => TransportError::Io(e.description),
    }
}

fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    let mut port = serialport::new(name, baud_rate)
        .timeout(READ_TIMEOUT)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .open()
        .map_err(map_serial_error)?;
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    std::thread::sleep(SETTLE_DELAY);
    let pending = port.bytes_to_read().unwrap_or(0);
    let _ = port.clear(serialport::ClearBuffer::Input);
    debug!("serial {} opened, discarded {} buffered bytes", name, pending);
    Ok(port)
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<LinkHandle, TransportError> {
        let name = self.port.clone();
        let baud = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || open_port(&name, baud))
            .await
            .map_err(|e| TransportError::Io(format!("open task failed: {}", e)))??;
        let reader_port = port.try_clone().map_err(map_serial_error)?;

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let reader = ReaderThread::spawn(self.port.clone(), reader_port, tx, alive.clone())?;
        info!("serial link open on {} at {} baud", self.port, self.baud_rate);
        let link = SerialLink {
            label: self.port.clone(),
            port: Arc::new(Mutex::new(Some(port))),
            alive,
            reader,
        };
        Ok(LinkHandle::new(Box::new(link), rx))
    }

    fn describe(&self) -> String {
        self.port.clone()
    }
}

/// The thread doing blocking reads for one link.
struct ReaderThread {
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderThread {
    fn spawn<R: Read + Send + 'static>(
        label: String,
        port: R,
        tx: mpsc::Sender<FrameResult>,
        alive: Arc<AtomicBool>,
    ) -> Result<Self, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        let handle = {
            let closed = closed.clone();
            std::thread::Builder::new()
                .name("serial-reader".into())
                .spawn(move || reader_loop(label, port, tx, alive, closed))
                .map_err(TransportError::from)?
        };
        Ok(Self {
            closed,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit and wait until it has released its handle on the port. Takes
    /// at most one read timeout.
    async fn stop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("serial reader thread could not be joined");
            }
        }
    }
}

fn reader_loop<R: Read>(
    label: String,
    mut port: R,
    tx: mpsc::Sender<FrameResult>,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 1024];
    let mut empty_reads = 0;
    while !closed.load(Ordering::Acquire) {
        let failure = match port.read(&mut buf) {
            Ok(0) => {
                empty_reads += 1;
                if empty_reads < MAX_EMPTY_READS {
                    continue;
                }
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "device returned end of file")
            }
            Ok(n) => {
                empty_reads = 0;
                trace!("serial rx {} bytes: {}", n, hex_snippet(&buf[..n], 64));
                framer.push(&buf[..n]);
                while let Some(frame) = framer.next_frame() {
                    if tx.blocking_send(Ok(frame)).is_err() {
                        debug!("serial {}: receiver dropped, reader exiting", label);
                        return;
                    }
                }
                if framer.buffered() > MAX_PAYLOAD * 8 {
                    warn!("serial {}: discarding unframed input", label);
                    framer = StreamFramer::new();
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => e,
        };
        alive.store(false, Ordering::Release);
        if !closed.load(Ordering::Acquire) {
            warn!("serial {} read failed: {}", label, failure);
            let _ = tx.blocking_send(Err(TransportError::from(failure)));
        }
        return;
    }
    debug!("serial {} reader stopped", label);
}

struct SerialLink {
    label: String,
    /// Write side; taken on close so the device is released.
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    alive: Arc<AtomicBool>,
    reader: ReaderThread,
}

#[async_trait]
impl Link for SerialLink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let wire = encode_frame(frame).ok_or_else(|| {
            TransportError::Io(format!("frame of {} bytes cannot be sent", frame.len()))
        })?;
        let port = self.port.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut guard = port
                .lock()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "port lock poisoned"))?;
            let port = guard
                .as_mut()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))?;
            port.write_all(&wire)?;
            port.flush()
        })
        .await
        .map_err(|e| TransportError::Io(format!("write task failed: {}", e)))?;
        if let Err(e) = result {
            warn!("serial {} write failed: {}", self.label, e);
            self.alive.store(false, Ordering::Release);
            return Err(e.into());
        }
        trace!("serial tx {} bytes", frame.len());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.reader.stop().await;
        let port = self.port.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = port.lock() {
                guard.take();
            }
        })
        .await;
        debug!("serial {} closed", self.label);
    }
}
