use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Raw byte access to one instrument. Knows nothing about framing.
///
/// Implementations block for at most their configured timeout. They are
/// only ever driven from the owning worker thread.
pub trait Transport: Send {
    /// Human readable name of the link, usually the port name.
    fn name(&self) -> &str;

    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<usize, TransportError>;

    /// Fill `buffer` completely or fail with `Timeout`.
    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError>;

    /// Write every byte of `bytes`.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Throw away everything in the input buffer.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Read and discard whatever is waiting, returning how many bytes
    /// were dropped.
    fn drain(&mut self) -> Result<usize, TransportError> {
        let waiting = self.bytes_to_read()?;
        if waiting > 0 {
            let mut scratch = vec![0u8; waiting];
            self.read_exact(&mut scratch)?;
        }
        Ok(waiting)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// No bytes arrived within the transport timeout. Recoverable.
    #[error("Timed out waiting for bytes.")]
    Timeout,

    /// The link went away (cable pulled, device reset).
    #[error("Link disconnected: {0}")]
    Disconnected(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl TransportError {
    /// Only timeouts leave the link usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted => Self::Disconnected(value.to_string()),
            _ => Self::Io(value),
        }
    }
}

/// Where a worker gets its transport from.
pub enum Link {
    /// Open a serial port when the worker opens.
    Serial(SerialSettings),

    /// An already established transport.
    Ready(Box<dyn Transport>),
}

impl Link {
    pub fn connect(self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            Self::Serial(settings) => Ok(Box::new(SerialTransport::open(&settings)?)),
            Self::Ready(transport) => Ok(transport),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Serial(settings) => format!("{}@{}", settings.port, settings.baud_rate),
            Self::Ready(transport) => transport.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

/// `Transport` over a USB serial port.
pub struct SerialTransport {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    #[instrument(skip_all, fields(port = %settings.port))]
    pub fn open(settings: &SerialSettings) -> Result<Self, TransportError> {
        let port = serialport::new(settings.port.as_str(), settings.baud_rate)
            .timeout(settings.timeout)
            .open()?;
        debug!(
            "Opened port at {} baud with {:?} timeout.",
            settings.baud_rate, settings.timeout
        );
        Ok(Self {
            name: settings.port.clone(),
            port,
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_to_read(&mut self) -> Result<usize, TransportError> {
        let waiting = self.port.bytes_to_read()?;
        Ok(waiting as usize)
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        self.port.read_exact(buffer)?;
        trace!("Read {} bytes from {}.", buffer.len(), self.name);
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        trace!("Wrote {} bytes to {}.", bytes.len(), self.name);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
