//! One worker per connected instrument. A worker owns its transport on a
//! dedicated thread so reads and writes to one device never interleave,
//! and hands results to the scheduler as `WorkerEvent`s.

pub mod actuator;
pub mod force;
pub mod laser;
pub mod worker;

use std::time::Duration;

use common::FrameError;
use thiserror::Error;

use crate::{
    externals::{laser::LaserError, transport::TransportError},
    models::device::DeviceKind,
};

pub use worker::{DeviceWorker, WorkerHandle, WorkerSettings, WorkerState};

/// Failures reported by a worker while it is running.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The link is gone. Terminal for the worker.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Wrong byte count or undecodable payload. The value is dropped.
    #[error("Malformed frame: {0}")]
    Frame(FrameError),

    /// The device answered but there is no calibration to convert with.
    #[error("No calibration profile loaded.")]
    CalibrationMissing,

    /// No answer within the response timeout.
    #[error("Timed out waiting for the device.")]
    Timeout,

    /// The sensor had nothing buffered.
    #[error("No data available.")]
    NoData,

    /// Error code reported by a vendor library.
    #[error("Vendor error: {0}")]
    Vendor(String),

    /// The device doesn't support the requested operation.
    #[error("Operation not supported.")]
    Unsupported,
}

impl DeviceError {
    /// Whether the worker has to give up its connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<FrameError> for DeviceError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

impl From<TransportError> for DeviceError {
    fn from(value: TransportError) -> Self {
        if value.is_recoverable() {
            Self::Timeout
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<LaserError> for DeviceError {
    fn from(value: LaserError) -> Self {
        match value {
            LaserError::NoData => Self::NoData,
            LaserError::NotOpen => Self::Transport(value.to_string()),
            LaserError::Vendor(message) => Self::Vendor(message),
        }
    }
}

/// Failure to bring a device up. Surfaced to whoever asked for the device.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to open {kind} on {link}: {source}")]
    Transport {
        kind: DeviceKind,
        link: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to open laser sensor: {0}")]
    Laser(#[from] LaserError),

    #[error("No laser vendor library is available in this build.")]
    LaserUnavailable,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a request was not handed to a worker.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The previous request of the same type hasn't completed yet.
    #[error("Previous request still in flight.")]
    Overrun,

    /// The worker thread is gone.
    #[error("Worker is closed.")]
    Closed,
}

/// What a driver made of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The request is complete and produced values.
    Values(Vec<f64>),

    /// The request is complete and produces no values.
    Done,

    /// The answer will arrive later; keep calling `poll_pending`.
    Pending,
}

/// Device specific half of a worker. All methods run on the worker thread
/// and may block for at most the transport timeout.
pub trait DeviceDriver: Send + 'static {
    fn kind(&self) -> DeviceKind;

    /// Establish the transport. Called once, before the thread starts.
    fn open(&mut self) -> Result<(), ConnectError>;

    fn read(&mut self) -> Result<Reply, DeviceError>;

    fn write(&mut self, payload: &[u8]) -> Result<Reply, DeviceError>;

    /// Run the startup self-test.
    fn self_test(&mut self) -> Result<Reply, DeviceError>;

    /// Check whether a `Pending` answer has arrived.
    fn poll_pending(&mut self) -> Result<Reply, DeviceError> {
        Ok(Reply::Pending)
    }

    /// A pending answer didn't arrive in time. Returns the error to report
    /// instead of a plain timeout, if any.
    fn abandon_pending(&mut self) -> Option<DeviceError> {
        None
    }

    /// Housekeeping while no request is outstanding.
    fn idle(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self);
}

/// How long a worker waits for a pending answer by default.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
