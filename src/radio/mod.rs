//! # Radio Module
//!
//! Receives tag-read packets from the LoRa receiver.
//!
//! The receiver sits behind a UART bridge that forwards each LoRa packet in
//! a small frame (see [`frame`]). This module handles:
//! - Opening the bridge serial port (115200 8N1 by default)
//! - Reassembling bridge frames and stripping the LoRa header
//! - Handing each payload to a [`PacketSink`]

pub mod frame;
pub mod port_trait;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use frame::{decode_packet, FrameBuffer};
use port_trait::{RadioIo, TokioSerialPort};

/// Default bridge baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default bridge device paths to try (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyUSB0", // USB-to-serial adapters (most common bridges)
    "/dev/ttyACM0", // USB CDC bridges
];

/// Bytes read from the bridge per poll
const READ_CHUNK: usize = 256;

/// Receiver of decoded radio payloads
///
/// Called on the radio polling path; implementations must not block.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, payload: &[u8]);
}

/// A packet radio that can be polled for received payloads
#[async_trait]
pub trait RadioPort: Send {
    /// Brings the radio up.
    async fn begin(&mut self) -> Result<()>;

    /// Registers the sink that receives every decoded payload.
    fn on_packet(&mut self, sink: Arc<dyn PacketSink>);

    /// Checks for received packets once, delivering them to the sink.
    ///
    /// Returns the number of payloads delivered.
    async fn poll_once(&mut self) -> Result<usize>;
}

/// LoRa receiver behind a UART bridge
pub struct SerialRadio {
    io: Option<Box<dyn RadioIo>>,
    device_paths: Vec<String>,
    device_path: Option<String>,
    baud_rate: u32,
    read_timeout: Duration,
    frames: FrameBuffer,
    sink: Option<Arc<dyn PacketSink>>,
}

impl std::fmt::Debug for SerialRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialRadio")
            .field("device_path", &self.device_path)
            .field("baud_rate", &self.baud_rate)
            .finish_non_exhaustive()
    }
}

impl SerialRadio {
    /// Creates an unopened radio that will try `device_paths` on [`begin`](RadioPort::begin).
    ///
    /// An empty path list falls back to [`DEFAULT_DEVICE_PATHS`].
    pub fn new(device_paths: Vec<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        let device_paths = if device_paths.is_empty() {
            DEFAULT_DEVICE_PATHS.iter().map(|p| p.to_string()).collect()
        } else {
            device_paths
        };
        Self {
            io: None,
            device_paths,
            device_path: None,
            baud_rate,
            read_timeout,
            frames: FrameBuffer::new(),
            sink: None,
        }
    }

    /// Creates a radio over an already-open transport.
    pub fn with_io(io: Box<dyn RadioIo>, read_timeout: Duration) -> Self {
        Self {
            io: Some(io),
            device_paths: Vec::new(),
            device_path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout,
            frames: FrameBuffer::new(),
            sink: None,
        }
    }

    /// Path of the opened bridge, if any
    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    /// Tries each path in order and keeps the first that opens.
    ///
    /// # Errors
    ///
    /// Returns `RadioPortNotFound` listing every path tried.
    fn open_with_paths(paths: &[String], baud_rate: u32) -> Result<(TokioSerialPort, String)> {
        for path in paths {
            debug!("Trying to open radio bridge: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened radio bridge at {} ({} baud)", path, baud_rate);
                    return Ok((TokioSerialPort::new(port), path.clone()));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(GatewayError::RadioPortNotFound(paths.join(", ")))
    }

    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| GatewayError::Radio(format!("Failed to open {}: {}", path, e)))
    }
}

#[async_trait]
impl RadioPort for SerialRadio {
    async fn begin(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }
        let (port, path) = Self::open_with_paths(&self.device_paths, self.baud_rate)?;
        self.io = Some(Box::new(port));
        self.device_path = Some(path);
        Ok(())
    }

    fn on_packet(&mut self, sink: Arc<dyn PacketSink>) {
        self.sink = Some(sink);
    }

    async fn poll_once(&mut self) -> Result<usize> {
        let Some(io) = self.io.as_mut() else {
            return Err(GatewayError::Radio("radio not started".to_string()));
        };

        let mut chunk = [0u8; READ_CHUNK];
        let n = io
            .read_available(&mut chunk, self.read_timeout)
            .await
            .map_err(|e| GatewayError::Radio(format!("Bridge read failed: {}", e)))?;
        if n == 0 {
            return Ok(0);
        }
        self.frames.extend(&chunk[..n]);

        let mut delivered = 0;
        while let Some(packet) = self.frames.next_frame() {
            let decoded = decode_packet(&packet);
            match decoded.header {
                Some(h) => debug!(
                    "RX net=0x{:02X} dst=0x{:02X} src=0x{:02X} seq={} len={} payload={:?}",
                    h.net,
                    h.dst,
                    h.src,
                    h.seq,
                    h.len,
                    String::from_utf8_lossy(&decoded.payload)
                ),
                None => debug!(
                    "RX payload={:?} (no header)",
                    String::from_utf8_lossy(&decoded.payload)
                ),
            }

            match &self.sink {
                Some(sink) => {
                    sink.on_packet(&decoded.payload);
                    delivered += 1;
                }
                None => warn!("Radio packet received with no sink registered"),
            }
        }
        Ok(delivered)
    }
}
