use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access to the laser displacement sensor through the vendor library.
///
/// The vendor library is an opaque capability: this crate only opens it with
/// a parameter set, polls scaled values from it and closes it again.
pub trait LaserCapability: Send {
    /// Apply `parameters` and open the sensor.
    fn open(&mut self, parameters: &LaserParameters) -> Result<(), LaserError>;

    /// Poll the last `count` scaled values. Fails with `NoData` when the
    /// sensor has nothing buffered.
    fn poll(&mut self, count: usize) -> Result<Vec<f64>, LaserError>;

    /// Close the sensor and release the vendor instance.
    fn close(&mut self);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaserError {
    #[error("The sensor has no data available.")]
    NoData,

    #[error("The sensor is not open.")]
    NotOpen,

    /// Any other error code reported by the vendor library.
    #[error("Vendor library error: {0}")]
    Vendor(String),
}

/// Value of a vendor parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    Int(i64),
    Str(String),
}

/// Everything handed to the vendor library when opening the sensor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct LaserParameters {
    pub port: String,
    pub serial_number: String,

    #[serde(default)]
    pub int_params: BTreeMap<String, i64>,

    #[serde(default)]
    pub str_params: BTreeMap<String, String>,

    #[serde(default)]
    pub enable_logging: bool,
}

impl LaserParameters {
    /// Flatten into the ordered list of vendor parameters. Configured
    /// parameters come first; serial number, port and logging always win.
    pub fn parameter_list(&self) -> Vec<(String, ParameterValue)> {
        let mut list: Vec<(String, ParameterValue)> = Vec::new();
        for (name, value) in &self.int_params {
            list.push((name.clone(), ParameterValue::Int(*value)));
        }
        for (name, value) in &self.str_params {
            list.push((name.clone(), ParameterValue::Str(value.clone())));
        }
        list.push((
            "IP_SerialNumber".into(),
            ParameterValue::Str(self.serial_number.clone()),
        ));
        list.push(("IP_Port".into(), ParameterValue::Str(self.port.clone())));
        list.push((
            "IP_EnableLogging".into(),
            ParameterValue::Int(i64::from(self.enable_logging)),
        ));
        list
    }
}
