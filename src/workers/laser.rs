use tracing::{debug, warn};

use crate::{
    externals::laser::{LaserCapability, LaserParameters},
    models::device::DeviceKind,
};

use super::{ConnectError, DeviceDriver, DeviceError, Reply};

/// Values fetched from the vendor library per poll.
const POLL_COUNT: usize = 2;

/// Driver for the laser displacement sensor. All I/O goes through the vendor
/// capability, so the driver only tracks whether the sensor is open.
pub struct LaserDriver {
    capability: Box<dyn LaserCapability>,
    parameters: LaserParameters,
    open: bool,
}

impl LaserDriver {
    pub fn new(capability: Box<dyn LaserCapability>, parameters: LaserParameters) -> Self {
        Self {
            capability,
            parameters,
            open: false,
        }
    }
}

impl DeviceDriver for LaserDriver {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Laser
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        if self.open {
            return Ok(());
        }
        self.capability.open(&self.parameters)?;
        self.open = true;
        debug!(
            "Laser {} opened on {}.",
            self.parameters.serial_number, self.parameters.port
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Reply, DeviceError> {
        let values = self.capability.poll(POLL_COUNT)?;
        if values.is_empty() {
            return Err(DeviceError::NoData);
        }
        Ok(Reply::Values(values))
    }

    fn write(&mut self, _payload: &[u8]) -> Result<Reply, DeviceError> {
        warn!("The laser sensor takes no commands.");
        Err(DeviceError::Unsupported)
    }

    fn self_test(&mut self) -> Result<Reply, DeviceError> {
        self.read()
    }

    fn close(&mut self) {
        if self.open {
            self.capability.close();
            self.open = false;
            debug!("Laser closed.");
        }
    }
}
