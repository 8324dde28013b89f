use common::{
    actuator::{decode_telemetry, self_test_command, TELEMETRY_FRAME_LEN},
    FrameError,
};
use tracing::{debug, warn};

use crate::{
    externals::transport::{Link, Transport},
    models::device::DeviceKind,
};

use super::{ConnectError, DeviceDriver, DeviceError, Reply};

/// Driver for the 6-channel actuator board.
///
/// The board answers every command frame with one 16 byte telemetry frame.
/// A frame is only taken when exactly 16 bytes are waiting; anything else is
/// drained so a short read can never shift the next frame.
pub struct ActuatorDriver {
    link: Option<Link>,
    transport: Option<Box<dyn Transport>>,
}

impl ActuatorDriver {
    pub fn new(link: Link) -> Self {
        Self {
            link: Some(link),
            transport: None,
        }
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, DeviceError> {
        self.transport
            .as_mut()
            .ok_or_else(|| DeviceError::Transport("actuator link is not open".into()))
    }

    fn send(&mut self, frame: &[u8]) -> Result<Reply, DeviceError> {
        let transport = self.transport()?;
        let stale = transport.drain()?;
        if stale > 0 {
            warn!("Dropped {} stale bytes before writing.", stale);
        }
        transport.write_all(frame)?;
        Ok(Reply::Pending)
    }
}

impl DeviceDriver for ActuatorDriver {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Actuator
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        let Some(link) = self.link.take() else {
            debug!("Actuator link already open.");
            return Ok(());
        };
        let name = link.describe();
        let transport = link.connect().map_err(|source| ConnectError::Transport {
            kind: DeviceKind::Actuator,
            link: name,
            source,
        })?;
        self.transport = Some(transport);
        Ok(())
    }

    /// Telemetry arrives on its own after each write; a read only waits for
    /// the next complete frame.
    fn read(&mut self) -> Result<Reply, DeviceError> {
        self.transport()?;
        Ok(Reply::Pending)
    }

    fn write(&mut self, payload: &[u8]) -> Result<Reply, DeviceError> {
        self.send(payload)
    }

    fn self_test(&mut self) -> Result<Reply, DeviceError> {
        debug!("Sending self-test frame.");
        self.send(&self_test_command())
    }

    fn poll_pending(&mut self) -> Result<Reply, DeviceError> {
        let transport = self.transport()?;
        let waiting = transport.bytes_to_read()?;
        if waiting < TELEMETRY_FRAME_LEN {
            return Ok(Reply::Pending);
        }
        if waiting > TELEMETRY_FRAME_LEN {
            let dropped = transport.drain()?;
            warn!("Discarded oversized telemetry of {} bytes.", dropped);
            return Err(FrameError::WrongLength {
                expected: TELEMETRY_FRAME_LEN,
                actual: dropped,
            }
            .into());
        }

        let mut frame = [0u8; TELEMETRY_FRAME_LEN];
        transport.read_exact(&mut frame)?;
        let values = decode_telemetry(&frame)?;
        Ok(Reply::Values(values.iter().map(|v| *v as f64).collect()))
    }

    fn abandon_pending(&mut self) -> Option<DeviceError> {
        let transport = self.transport.as_mut()?;
        match transport.drain() {
            Ok(0) => None,
            Ok(dropped) => {
                warn!("Discarded partial telemetry of {} bytes.", dropped);
                Some(DeviceError::Frame(FrameError::WrongLength {
                    expected: TELEMETRY_FRAME_LEN,
                    actual: dropped,
                }))
            }
            Err(e) => Some(e.into()),
        }
    }

    fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("Actuator link closed.");
        }
    }
}
