use std::fmt::Display;

use crate::workers::{DeviceError, WorkerState};

use super::device::{DeviceKind, RequestId};

/// Everything a device worker reports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A frame (or vendor poll) decoded successfully.
    Sample {
        kind: DeviceKind,
        request: RequestId,
        values: Vec<f64>,
    },

    /// Transport or decode failure. `request` is set when the failure
    /// completed an outstanding request.
    Error {
        kind: DeviceKind,
        request: Option<RequestId>,
        error: DeviceError,
    },

    /// The worker moved through its lifecycle.
    StateChanged { kind: DeviceKind, state: WorkerState },
}

impl WorkerEvent {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Sample { kind, .. } | Self::Error { kind, .. } | Self::StateChanged { kind, .. } => {
                *kind
            }
        }
    }
}

impl Display for WorkerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sample {
                kind,
                request,
                values,
            } => write!(f, "<Sample {} {} {:?}>", kind, request, values),
            Self::Error { kind, error, .. } => write!(f, "<Error {} {}>", kind, error),
            Self::StateChanged { kind, state } => write!(f, "<State {} {:?}>", kind, state),
        }
    }
}
