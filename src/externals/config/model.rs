use std::{collections::BTreeMap, time::Duration};

use common::force::{ForceProfile, SampleRate};
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::{
    externals::laser::LaserParameters,
    internals::{
        acquisition::{AcquisitionSettings, JoinPolicy},
        scheduler::SchedulerSettings,
        signal::SineParameters,
    },
    models::device::DeviceKind,
    workers::WorkerSettings,
};

/// Everything the acquisition host reads at startup. Missing keys fall back
/// to their defaults so that older configuration files keep loading.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,

    /// Scheduler tick period.
    pub scheduler_interval_ms: u64,

    /// Acquisition buffer tick period.
    pub acquisition_interval_ms: u64,

    /// Row count that triggers a compaction of the table.
    pub buffer_capacity: usize,

    /// Rows left after a compaction.
    pub buffer_keep: usize,

    pub join_policy: JoinPolicy,

    /// How long a worker waits for a device to answer.
    pub response_timeout_ms: u64,

    pub self_test_delay_ms: SelfTestDelays,

    /// Wait after a zero request before the next sample becomes the offset.
    pub zero_settle_ms: u64,

    /// Force jumps at least this large are treated as spikes and dropped.
    pub force_spike_threshold: f64,

    /// Consecutive timeouts after which a device is marked inactive.
    pub timeout_limit: u32,

    /// Rate the force amplifier is switched to when it connects.
    pub force_sample_rate: SampleRate,

    /// Last laser offset, written back after every laser zero.
    pub laser_offset: f64,

    /// Calibration profiles by name.
    pub force_profiles: BTreeMap<String, ForceProfile>,

    /// Amplifier serial number to calibration profile name.
    pub force_amplifier_sn: BTreeMap<String, String>,

    pub laser: LaserConfig,

    /// Per channel sine parameters the generator starts with.
    pub sine: Vec<SineParameters>,

    pub devices: DeviceSelection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            scheduler_interval_ms: 15,
            acquisition_interval_ms: 20,
            buffer_capacity: 20_000,
            buffer_keep: 3_000,
            join_policy: JoinPolicy::default(),
            response_timeout_ms: 500,
            self_test_delay_ms: SelfTestDelays::default(),
            zero_settle_ms: 300,
            force_spike_threshold: 0.4,
            timeout_limit: 10,
            force_sample_rate: SampleRate::Hz200,
            laser_offset: 0.0,
            force_profiles: BTreeMap::new(),
            force_amplifier_sn: BTreeMap::new(),
            laser: LaserConfig::default(),
            sine: Vec::new(),
            devices: DeviceSelection::default(),
        }
    }
}

impl AppConfig {
    /// Reject values the tasks cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler_interval_ms must be positive"));
        }
        if self.acquisition_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "acquisition_interval_ms must be positive",
            ));
        }
        if self.buffer_keep >= self.buffer_capacity {
            return Err(ConfigError::Invalid(
                "buffer_keep must be smaller than buffer_capacity",
            ));
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn acquisition_interval(&self) -> Duration {
        Duration::from_millis(self.acquisition_interval_ms)
    }

    pub fn zero_settle(&self) -> Duration {
        Duration::from_millis(self.zero_settle_ms)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            interval: self.scheduler_interval(),
            zero_settle: self.zero_settle(),
            force_spike_threshold: self.force_spike_threshold,
            timeout_limit: self.timeout_limit,
            laser_offset: self.laser_offset,
        }
    }

    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            capacity: self.buffer_capacity,
            keep: self.buffer_keep,
            policy: self.join_policy.clone(),
        }
    }

    pub fn worker_settings(&self, kind: DeviceKind) -> WorkerSettings {
        WorkerSettings {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            self_test_delay: Duration::from_millis(self.self_test_delay_ms.of(kind)),
            ..Default::default()
        }
    }

    /// Profile of the selected force amplifier, if it names a known one.
    pub fn force_profile(&self) -> Option<ForceProfile> {
        let selected = self.devices.force.as_ref()?;
        self.force_profiles.get(&selected.profile).copied()
    }

    /// Vendor parameters for the selected laser sensor.
    pub fn laser_parameters(&self) -> Option<LaserParameters> {
        let selected = self.devices.laser.as_ref()?;
        Some(LaserParameters {
            port: selected.port.clone(),
            serial_number: selected.serial_number.clone(),
            int_params: self.laser.int_params.clone(),
            str_params: self.laser.str_params.clone(),
            enable_logging: self.laser.enable_logging,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelfTestDelays {
    pub actuator: u64,
    pub force: u64,
    pub laser: u64,
}

impl Default for SelfTestDelays {
    fn default() -> Self {
        Self {
            actuator: 1_500,
            force: 3_000,
            laser: 3_000,
        }
    }
}

impl SelfTestDelays {
    fn of(&self, kind: DeviceKind) -> u64 {
        match kind {
            DeviceKind::Actuator => self.actuator,
            DeviceKind::Force => self.force,
            DeviceKind::Laser | DeviceKind::Camera => self.laser,
        }
    }
}

/// Vendor parameter tables shared by every laser sensor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct LaserConfig {
    /// Known sensor serial numbers, without the trailing check character.
    pub serial_numbers: Vec<String>,
    pub int_params: BTreeMap<String, i64>,
    pub str_params: BTreeMap<String, String>,
    pub enable_logging: bool,
}

/// The devices the user selected. Only these are connected at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct DeviceSelection {
    pub actuator: Option<ActuatorSelection>,
    pub force: Option<ForceSelection>,
    pub laser: Option<LaserSelection>,
    pub camera: Option<CameraSelection>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActuatorSelection {
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

fn default_baudrate() -> u32 {
    250_000
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ForceSelection {
    pub port: String,

    /// Name of the calibration profile in `force_profiles`.
    pub profile: String,

    #[serde(default = "default_force_baudrate")]
    pub baudrate: u32,
}

fn default_force_baudrate() -> u32 {
    38_400
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LaserSelection {
    pub port: String,
    pub serial_number: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CameraSelection {
    pub number: u32,
}
