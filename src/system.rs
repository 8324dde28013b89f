//! Wiring of the acquisition host: builds the scheduler, the acquisition
//! buffer and the event logger from a configuration, spawns them on a task
//! tracker and connects the selected devices.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    externals::{
        config::{AppConfig, ConfigStore},
        event_logging::task::task_event_logging,
        laser::LaserCapability,
        transport::{Link, SerialSettings},
    },
    internals::{
        acquisition::{acquisition_channel, task_acquisition, AcquisitionBuffer, AcquisitionHandle},
        observer::{DeviceObserver, ObserverEvent},
        scheduler::{
            scheduler_channel, task_scheduler, Scheduler, SchedulerError, SchedulerHandle,
        },
        signal::SignalGenerator,
    },
    models::{device::DeviceKind, row::Row},
    workers::{
        actuator::ActuatorDriver, force::ForceDriver, laser::LaserDriver, ConnectError,
        DeviceWorker,
    },
};

const EVENT_CAPACITY: usize = 32;
const ROW_CAPACITY: usize = 1024;

/// Handles to a running system.
pub struct System {
    pub scheduler: SchedulerHandle,
    pub acquisition: AcquisitionHandle,
    tx_rows: broadcast::Sender<Row>,
    tx_devices: broadcast::Sender<ObserverEvent>,
}

impl System {
    /// Every row appended to the acquisition table from now on.
    pub fn subscribe_rows(&self) -> broadcast::Receiver<Row> {
        self.tx_rows.subscribe()
    }

    /// Device state changes from now on.
    pub fn subscribe_devices(&self) -> broadcast::Receiver<ObserverEvent> {
        self.tx_devices.subscribe()
    }
}

/// Build and spawn the scheduler, acquisition and event logging tasks.
/// Devices are not connected yet.
pub fn spawn_system(
    token: &CancellationToken,
    tracker: &TaskTracker,
    config: &AppConfig,
    store: Arc<dyn ConfigStore>,
) -> System {
    let (tx_devices, rx_devices) = broadcast::channel(EVENT_CAPACITY);
    let (tx_rows, rx_rows) = broadcast::channel(ROW_CAPACITY);

    let (acquisition, acquisition_inbox) = acquisition_channel();
    let (scheduler, scheduler_inbox) = scheduler_channel();

    let core = Scheduler::new(
        config.scheduler_settings(),
        DeviceObserver::new(tx_devices.clone()),
        SignalGenerator::with_sine(&config.sine),
        acquisition.clone(),
        store,
    );

    let token_clone = token.clone();
    tracker.spawn(async move { task_scheduler(token_clone, core, scheduler_inbox).await });

    let token_clone = token.clone();
    let buffer = AcquisitionBuffer::new(config.acquisition_settings());
    let period = config.acquisition_interval();
    let tx_rows_clone = tx_rows.clone();
    tracker.spawn(async move {
        task_acquisition(token_clone, buffer, period, acquisition_inbox, tx_rows_clone).await
    });

    let token_clone = token.clone();
    tracker.spawn(async move { task_event_logging(token_clone, rx_devices, rx_rows).await });

    System {
        scheduler,
        acquisition,
        tx_rows,
        tx_devices,
    }
}

/// Open every device selected in `config` and hand it to the scheduler.
/// Blocks while transports open. A device that fails to connect is left
/// out; the outcome per device is returned.
pub fn connect_devices(
    scheduler: &SchedulerHandle,
    config: &AppConfig,
    laser: Option<Box<dyn LaserCapability>>,
) -> BTreeMap<DeviceKind, Result<(), SchedulerError>> {
    let mut outcome = BTreeMap::new();
    let devices = &config.devices;

    if let Some(actuator) = &devices.actuator {
        let link = serial_link(config, &actuator.port, actuator.baudrate);
        let worker = DeviceWorker::new(
            ActuatorDriver::new(link),
            config.worker_settings(DeviceKind::Actuator),
        );
        outcome.insert(DeviceKind::Actuator, scheduler.add_worker(worker));
    }

    if let Some(force) = &devices.force {
        let profile = config.force_profile();
        if profile.is_none() {
            warn!(
                "Force profile '{}' is not configured. Samples will be dropped.",
                force.profile
            );
        }
        let link = serial_link(config, &force.port, force.baudrate);
        let worker = DeviceWorker::new(
            ForceDriver::new(link, profile).with_rate(config.force_sample_rate),
            config.worker_settings(DeviceKind::Force),
        );
        outcome.insert(DeviceKind::Force, scheduler.add_worker(worker));
    }

    if let Some(parameters) = config.laser_parameters() {
        let result = match laser {
            Some(capability) => scheduler.add_worker(DeviceWorker::new(
                LaserDriver::new(capability, parameters),
                config.worker_settings(DeviceKind::Laser),
            )),
            None => Err(SchedulerError::Connect(ConnectError::LaserUnavailable)),
        };
        outcome.insert(DeviceKind::Laser, result);
    }

    if devices.camera.is_some() {
        outcome.insert(
            DeviceKind::Camera,
            scheduler.register_passive(DeviceKind::Camera),
        );
    }

    for (kind, result) in &outcome {
        match result {
            Ok(()) => info!("Connected {}.", kind),
            Err(e) => error!("Failed to connect {}. Error: {}", kind, e),
        }
    }
    outcome
}

fn serial_link(config: &AppConfig, port: &str, baud_rate: u32) -> Link {
    Link::Serial(SerialSettings {
        port: port.to_string(),
        baud_rate,
        timeout: Duration::from_millis(config.response_timeout_ms),
    })
}

/// Load the configuration and bring the whole system up.
pub async fn start(
    token: &CancellationToken,
    tracker: &TaskTracker,
    store: Arc<dyn ConfigStore>,
    laser: Option<Box<dyn LaserCapability>>,
) -> Result<System> {
    let config = store.load().context("Failed to load configuration")?;
    info!("Loaded configuration '{}'.", config.name);

    let system = spawn_system(token, tracker, &config, store);

    let scheduler = system.scheduler.clone();
    let outcome = tokio::task::spawn_blocking(move || connect_devices(&scheduler, &config, laser))
        .await
        .context("Device connection panicked")?;
    let connected = outcome.values().filter(|r| r.is_ok()).count();
    info!("{} of {} devices connected.", connected, outcome.len());

    Ok(system)
}
