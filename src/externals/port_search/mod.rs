//! Finds the instruments among the serial ports of the host.

use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::{
    externals::{config::AppConfig, transport::TransportError},
    models::device::DeviceKind,
};

/// Product names the actuator board enumerates with, depending on the OS
/// language and version.
const ACTUATOR_PRODUCTS: [&str; 3] = ["USB Serial Device", "Serielles USB-Gerät", "Arduino"];

/// The parts of a port listing the matching rules look at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortDescription {
    pub name: String,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortDescription {
    fn from(value: SerialPortInfo) -> Self {
        let (product, serial_number) = match value.port_type {
            SerialPortType::UsbPort(usb) => (usb.product, usb.serial_number),
            _ => (None, None),
        };
        Self {
            name: value.port_name,
            product,
            serial_number,
        }
    }
}

/// A port that looks like one of the instruments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: DeviceKind,
    pub port: String,

    /// Description shown to the user: the product name for the actuator
    /// board, the calibration profile for the force amplifier, the serial
    /// number for the laser.
    pub detail: String,
}

/// List every serial port the OS reports.
pub fn available_ports() -> Result<Vec<PortDescription>, TransportError> {
    let ports = serialport::available_ports()?;
    debug!("Found {} serial ports.", ports.len());
    Ok(ports.into_iter().map(PortDescription::from).collect())
}

/// Classifies ports using the serial numbers known to the configuration.
pub struct PortSearcher<'a> {
    config: &'a AppConfig,
}

impl<'a> PortSearcher<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self { config }
    }

    pub fn actuators(&self, ports: &[PortDescription]) -> Vec<Candidate> {
        ports
            .iter()
            .filter_map(|port| {
                let product = port.product.as_ref()?;
                ACTUATOR_PRODUCTS
                    .iter()
                    .any(|known| product.contains(known))
                    .then(|| Candidate {
                        kind: DeviceKind::Actuator,
                        port: port.name.clone(),
                        detail: product.clone(),
                    })
            })
            .collect()
    }

    pub fn force_amplifiers(&self, ports: &[PortDescription]) -> Vec<Candidate> {
        ports
            .iter()
            .filter_map(|port| {
                let serial = port.serial_number.as_ref()?;
                let profile = self.config.force_amplifier_sn.get(serial)?;
                Some(Candidate {
                    kind: DeviceKind::Force,
                    port: port.name.clone(),
                    detail: profile.clone(),
                })
            })
            .collect()
    }

    /// The laser's USB serial number carries one extra character on top of
    /// the sensor serial number.
    pub fn lasers(&self, ports: &[PortDescription]) -> Vec<Candidate> {
        ports
            .iter()
            .filter_map(|port| {
                let serial = port.serial_number.as_ref()?;
                let mut chars = serial.chars();
                chars.next_back()?;
                let sensor = chars.as_str();
                self.config
                    .laser
                    .serial_numbers
                    .iter()
                    .any(|known| known == sensor)
                    .then(|| Candidate {
                        kind: DeviceKind::Laser,
                        port: port.name.clone(),
                        detail: sensor.to_string(),
                    })
            })
            .collect()
    }

    pub fn all(&self, ports: &[PortDescription]) -> Vec<Candidate> {
        let mut candidates = self.actuators(ports);
        candidates.extend(self.force_amplifiers(ports));
        candidates.extend(self.lasers(ports));
        candidates
    }
}
