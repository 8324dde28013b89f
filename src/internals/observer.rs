use std::{collections::BTreeMap, fmt::Display};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::device::DeviceKind;

/// State of a registered device. Unregistered devices have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Active,
    Inactive,
}

/// Published whenever a device changes state. `state` is `None` once the
/// device was unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverEvent {
    pub kind: DeviceKind,
    pub state: Option<DeviceState>,
}

impl Display for ObserverEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state {
            Some(DeviceState::Active) => write!(f, "<{} active>", self.kind),
            Some(DeviceState::Inactive) => write!(f, "<{} inactive>", self.kind),
            None => write!(f, "<{} unregistered>", self.kind),
        }
    }
}

/// Tracks which devices take part in scheduling. Does no I/O.
pub struct DeviceObserver {
    states: BTreeMap<DeviceKind, DeviceState>,
    tx_events: broadcast::Sender<ObserverEvent>,
}

impl DeviceObserver {
    pub fn new(tx_events: broadcast::Sender<ObserverEvent>) -> Self {
        Self {
            states: BTreeMap::new(),
            tx_events,
        }
    }

    /// Register a device as active.
    pub fn register(&mut self, kind: DeviceKind) {
        self.transition(kind, Some(DeviceState::Active));
    }

    /// Mark a registered device inactive. Unknown devices are ignored.
    pub fn set_inactive(&mut self, kind: DeviceKind) {
        if self.states.contains_key(&kind) {
            self.transition(kind, Some(DeviceState::Inactive));
        }
    }

    /// Mark a registered device active again. Unknown devices are ignored.
    pub fn set_active(&mut self, kind: DeviceKind) {
        if self.states.contains_key(&kind) {
            self.transition(kind, Some(DeviceState::Active));
        }
    }

    pub fn unregister(&mut self, kind: DeviceKind) {
        self.transition(kind, None);
    }

    pub fn state(&self, kind: DeviceKind) -> Option<DeviceState> {
        self.states.get(&kind).copied()
    }

    pub fn is_registered(&self, kind: DeviceKind) -> bool {
        self.states.contains_key(&kind)
    }

    pub fn is_active(&self, kind: DeviceKind) -> bool {
        self.state(kind) == Some(DeviceState::Active)
    }

    fn transition(&mut self, kind: DeviceKind, state: Option<DeviceState>) {
        let previous = match state {
            Some(state) => self.states.insert(kind, state),
            None => self.states.remove(&kind),
        };
        if previous == state {
            return;
        }

        let event = ObserverEvent { kind, state };
        info!("Device state changed: {}", event);
        if self.tx_events.send(event).is_err() {
            debug!("No observer subscribers.");
        }
    }
}
