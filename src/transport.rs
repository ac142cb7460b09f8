use crate::error::ScopeError;
use crate::protocol::MSG_LENGTH;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::ClearBuffer;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Upper bound on frames dropped by the default [`Transport::discard_input`],
/// in case the peer keeps streaming
pub const MAX_DISCARDED_FRAMES: usize = 64;

/// Byte-oriented duplex channel to the stage controller.
///
/// `receive` returns `Ok(None)` when no bytes arrived within the transport's
/// read window. A frame shorter than [`MSG_LENGTH`] is returned as-is and is
/// rejected by the decoder.
pub trait Transport: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), ScopeError>;
    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScopeError>;

    /// Drop input that is already waiting, returning the number of frames dropped
    fn discard_input(&mut self) -> Result<usize, ScopeError> {
        let mut dropped = 0;
        while dropped < MAX_DISCARDED_FRAMES && self.receive()?.is_some() {
            dropped += 1;
        }
        Ok(dropped)
    }
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Read window for one status frame
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 2_000_000,
            read_timeout_ms: 10,
        }
    }
}

/// Transport over a serial port.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> Result<Self, ScopeError> {
        debug!("Opening serial port {} at {} baud", config.port, config.baud_rate);
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| ScopeError::Io {
                source: e.into(),
                context: format!("Failed to open serial port {}", config.port),
            })?;
        info!("Connected to stage controller on {}", config.port);
        Ok(Self {
            port,
            name: config.port.clone(),
        })
    }

    /// Names of the serial ports present on this machine
    pub fn available_ports() -> Result<Vec<String>, ScopeError> {
        let ports = serialport::available_ports().map_err(|e| ScopeError::Io {
            source: e.into(),
            context: "Could not enumerate serial ports".to_string(),
        })?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), ScopeError> {
        debug!("[{}] -> {:02x?}", self.name, frame);
        self.port.write_all(frame).map_err(|source| ScopeError::Io {
            source,
            context: format!("Failed to write to {}", self.name),
        })?;
        self.port.flush().map_err(|source| ScopeError::Io {
            source,
            context: format!("Failed to flush {}", self.name),
        })
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScopeError> {
        let mut frame = vec![0u8; MSG_LENGTH];
        let mut filled = 0;
        while filled < MSG_LENGTH {
            match self.port.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => break,
                Err(source) => {
                    return Err(ScopeError::Io {
                        source,
                        context: format!("Failed to read from {}", self.name),
                    });
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < MSG_LENGTH {
            warn!("[{}] partial status frame: {} of {} bytes", self.name, filled, MSG_LENGTH);
        }
        frame.truncate(filled);
        debug!("[{}] <- {:02x?}", self.name, frame);
        Ok(Some(frame))
    }

    fn discard_input(&mut self) -> Result<usize, ScopeError> {
        let io_error = |e: serialport::Error, context: &str| ScopeError::Io {
            source: e.into(),
            context: format!("{context} {}", self.name),
        };
        let pending = self
            .port
            .bytes_to_read()
            .map_err(|e| io_error(e, "Failed to query input of"))? as usize;
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| io_error(e, "Failed to clear input of"))?;
        Ok(pending.div_ceil(MSG_LENGTH))
    }
}
