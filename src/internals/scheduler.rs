use std::{collections::BTreeMap, sync::Arc, time::Duration};

use common::{
    actuator::{encode_command, ActuatorMode, RESISTANCE_OFFSET, TELEMETRY_VALUE_COUNT},
    physical::PowerVector,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    externals::config::ConfigStore,
    models::{
        channel::Channel,
        device::{DeviceKind, RequestId},
        worker_event::WorkerEvent,
    },
    workers::{
        ConnectError, DeviceDriver, DeviceError, DeviceWorker, DispatchError, WorkerHandle,
        WorkerState,
    },
};

use super::{
    acquisition::AcquisitionHandle,
    observer::{DeviceObserver, DeviceState},
    signal::{SignalGenerator, SignalMode, SineParameters},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub interval: Duration,

    /// Wait after a zero request before the next sample becomes the offset.
    pub zero_settle: Duration,

    /// Force jumps at least this large are replaced by the previous value.
    pub force_spike_threshold: f64,

    /// Consecutive timeouts tolerated before a device is marked inactive.
    pub timeout_limit: u32,

    /// Laser offset restored from the configuration.
    pub laser_offset: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15),
            zero_settle: Duration::from_millis(300),
            force_spike_threshold: 0.4,
            timeout_limit: 10,
            laser_offset: 0.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("The scheduler task is not running.")]
    Closed,

    #[error("The request interval must be positive.")]
    InvalidInterval,

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[derive(Debug)]
pub enum SchedulerCommand {
    StartRequesting(SignalMode),
    StopRequesting,
    SetInterval(Duration),
    SetMode(SignalMode),
    SetActuatorMode(ActuatorMode),
    SetDirect(PowerVector),
    SetSine(usize, SineParameters),
    Zero(DeviceKind),
    ZeroOutput,
    /// Devices without a worker, e.g. the camera.
    RegisterPassive(DeviceKind),
    AddWorker(WorkerHandle),
    RemoveWorker(DeviceKind, oneshot::Sender<()>),
}

/// Cloneable access to the scheduler task.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx_commands: mpsc::UnboundedSender<SchedulerCommand>,
    tx_events: mpsc::UnboundedSender<WorkerEvent>,
}

impl SchedulerHandle {
    pub fn start_requesting(&self, mode: SignalMode) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::StartRequesting(mode))
    }

    pub fn stop_requesting(&self) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::StopRequesting)
    }

    pub fn set_interval(&self, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        self.command(SchedulerCommand::SetInterval(interval))
    }

    pub fn set_mode(&self, mode: SignalMode) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::SetMode(mode))
    }

    pub fn set_actuator_mode(&self, mode: ActuatorMode) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::SetActuatorMode(mode))
    }

    pub fn set_direct(&self, power: PowerVector) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::SetDirect(power))
    }

    pub fn set_sine(&self, channel: usize, parameters: SineParameters) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::SetSine(channel, parameters))
    }

    pub fn zero(&self, kind: DeviceKind) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::Zero(kind))
    }

    pub fn zero_output(&self) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::ZeroOutput)
    }

    pub fn register_passive(&self, kind: DeviceKind) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::RegisterPassive(kind))
    }

    /// Open `worker` and hand it to the scheduler. Blocks while the
    /// transport opens.
    pub fn add_worker<D: DeviceDriver>(&self, worker: DeviceWorker<D>) -> Result<(), SchedulerError> {
        let handle = worker.open(self.tx_events.clone())?;
        self.add_handle(handle)
    }

    pub fn add_handle(&self, handle: WorkerHandle) -> Result<(), SchedulerError> {
        self.command(SchedulerCommand::AddWorker(handle))
    }

    /// Stop the worker of `kind` and wait until its thread has exited.
    pub async fn remove_worker(&self, kind: DeviceKind) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.command(SchedulerCommand::RemoveWorker(kind, tx))?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    fn command(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.tx_commands
            .send(command)
            .map_err(|_| SchedulerError::Closed)
    }
}

/// Receiving ends of a `SchedulerHandle`.
pub struct SchedulerInbox {
    rx_commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    rx_events: mpsc::UnboundedReceiver<WorkerEvent>,
}

#[cfg(test)]
impl SchedulerInbox {
    pub(crate) fn try_next_command(&mut self) -> Option<SchedulerCommand> {
        self.rx_commands.try_recv().ok()
    }
}

pub fn scheduler_channel() -> (SchedulerHandle, SchedulerInbox) {
    let (tx_commands, rx_commands) = mpsc::unbounded_channel();
    let (tx_events, rx_events) = mpsc::unbounded_channel();
    (
        SchedulerHandle {
            tx_commands,
            tx_events,
        },
        SchedulerInbox {
            rx_commands,
            rx_events,
        },
    )
}

/// Single coordinator of polling cadence and command issuance. Owns every
/// worker handle; all of its state is touched from the scheduler task only.
pub struct Scheduler {
    settings: SchedulerSettings,
    workers: BTreeMap<DeviceKind, WorkerHandle>,
    observer: DeviceObserver,
    signal: SignalGenerator,
    actuator_mode: ActuatorMode,
    offsets: BTreeMap<DeviceKind, f64>,
    zeroing: BTreeMap<DeviceKind, Instant>,
    timeouts: BTreeMap<DeviceKind, u32>,
    last_force: Option<f64>,
    requesting: bool,
    acquisition: AcquisitionHandle,
    config: Arc<dyn ConfigStore>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        observer: DeviceObserver,
        signal: SignalGenerator,
        acquisition: AcquisitionHandle,
        config: Arc<dyn ConfigStore>,
    ) -> Self {
        let mut offsets = BTreeMap::new();
        offsets.insert(DeviceKind::Force, 0.0);
        offsets.insert(DeviceKind::Laser, settings.laser_offset);
        Self {
            settings,
            workers: BTreeMap::new(),
            observer,
            signal,
            actuator_mode: ActuatorMode::default(),
            offsets,
            zeroing: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            last_force: None,
            requesting: false,
            acquisition,
            config,
        }
    }

    pub fn is_requesting(&self) -> bool {
        self.requesting
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    pub fn observer(&self) -> &DeviceObserver {
        &self.observer
    }

    pub fn offset(&self, kind: DeviceKind) -> f64 {
        self.offsets.get(&kind).copied().unwrap_or_default()
    }

    pub fn actuator_mode(&self) -> ActuatorMode {
        self.actuator_mode
    }

    pub fn start_requesting(&mut self, mode: SignalMode) {
        self.signal.set_mode(mode);
        self.requesting = true;
        if self.acquisition.start().is_err() {
            warn!("Acquisition task is gone.");
        }
        info!("Requesting in {} mode.", mode);
    }

    /// Stop issuing requests. In-flight requests still complete.
    pub fn stop_requesting(&mut self) {
        self.requesting = false;
        if self.acquisition.stop().is_err() {
            warn!("Acquisition task is gone.");
        }
        info!("Stopped requesting.");
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.settings.interval = interval;
    }

    pub fn set_mode(&mut self, mode: SignalMode) {
        self.signal.set_mode(mode);
    }

    pub fn set_actuator_mode(&mut self, mode: ActuatorMode) {
        info!("Actuator mode {}.", mode);
        self.actuator_mode = mode;
    }

    pub fn set_direct(&mut self, power: PowerVector) {
        self.signal.set_direct(power);
    }

    pub fn set_sine(&mut self, channel: usize, parameters: SineParameters) {
        if let Err(e) = self.signal.set_sine(channel, parameters) {
            warn!("Ignoring sine parameters. Error: {}", e);
        }
    }

    /// Reset the offset of `kind`; after the settle delay its next raw
    /// sample becomes the new offset.
    pub fn zero(&mut self, kind: DeviceKind) {
        if !matches!(kind, DeviceKind::Force | DeviceKind::Laser) {
            warn!("{} has no offset to zero.", kind);
            return;
        }
        self.offsets.insert(kind, 0.0);
        self.zeroing
            .insert(kind, Instant::now() + self.settings.zero_settle);
        info!("Zeroing {}.", kind);
    }

    /// Command all channels to zero and write that immediately.
    pub fn zero_output(&mut self) {
        self.signal.set_direct(PowerVector::zero());
        self.signal.set_mode(SignalMode::Direct);
        self.write_actuator();
    }

    pub fn register_passive(&mut self, kind: DeviceKind) {
        self.observer.register(kind);
    }

    /// Take ownership of a running worker and schedule its self-test. The
    /// device only becomes active once the self-test passes.
    pub fn add_worker(&mut self, worker: WorkerHandle) {
        let kind = worker.kind();
        if let Err(e) = worker.self_test(RequestId::SelfTest(kind)) {
            warn!("Failed to schedule {} self-test. Error: {}", kind, e);
        }
        self.timeouts.remove(&kind);
        if let Some(previous) = self.workers.insert(kind, worker) {
            warn!("Replacing running {} worker.", kind);
            stop_in_background(previous);
        }
        info!("Added {} worker.", kind);
    }

    /// Hand the worker of `kind` back for stopping and forget the device.
    pub fn remove_worker(&mut self, kind: DeviceKind) -> Option<WorkerHandle> {
        self.observer.unregister(kind);
        self.zeroing.remove(&kind);
        self.workers.remove(&kind)
    }

    /// One scheduling cycle: write the actuator, read every other active
    /// device. Busy workers are skipped.
    pub fn tick(&mut self) {
        if self.observer.is_registered(DeviceKind::Actuator) {
            self.write_actuator();
        }

        for (kind, worker) in &self.workers {
            if !kind.is_polled() || !self.observer.is_active(*kind) {
                continue;
            }
            match worker.read(RequestId::FromDevice(*kind)) {
                Ok(()) => {}
                Err(DispatchError::Overrun) => trace!("{} still busy, skipping read.", kind),
                Err(DispatchError::Closed) => {
                    debug!("{} worker is closed.", kind);
                    self.observer.set_inactive(*kind);
                }
            }
        }
    }

    fn write_actuator(&mut self) {
        let Some(worker) = self.workers.get(&DeviceKind::Actuator) else {
            return;
        };
        let power = self.signal.next_vector();
        let frame = encode_command(&power, self.actuator_mode);
        match worker.write(RequestId::FromDevice(DeviceKind::Actuator), frame.to_vec()) {
            Ok(()) => trace!("Commanded {}.", power),
            Err(DispatchError::Overrun) => trace!("Actuator still busy, skipping write."),
            Err(DispatchError::Closed) => {
                debug!("Actuator worker is closed.");
                self.observer.set_inactive(DeviceKind::Actuator);
            }
        }
    }

    pub fn handle_event(&mut self, event: WorkerEvent) {
        // A removed worker may still have answers queued.
        if !self.workers.contains_key(&event.kind()) {
            debug!("Dropping {} from a removed worker.", event);
            return;
        }
        match event {
            WorkerEvent::Sample {
                kind,
                request,
                values,
            } => {
                if request.is_self_test() {
                    if !self.check_self_test(kind, &values) {
                        return;
                    }
                } else if self.observer.state(kind) == Some(DeviceState::Inactive) {
                    info!("{} answers again.", kind);
                    self.observer.set_active(kind);
                }
                self.timeouts.insert(kind, 0);
                self.forward(kind, &values);
            }
            WorkerEvent::Error {
                kind,
                request,
                error,
            } => self.handle_error(kind, request, error),
            WorkerEvent::StateChanged { kind, state } => match state {
                WorkerState::Faulted => self.observer.set_inactive(kind),
                other => debug!("{} worker is {:?}.", kind, other),
            },
        }
    }

    fn check_self_test(&mut self, kind: DeviceKind, values: &[f64]) -> bool {
        let passed = match kind.expected_self_test_len() {
            Some(expected) => values.len() == expected,
            None => !values.is_empty(),
        };
        if passed {
            info!("{} passed its self-test.", kind);
            self.observer.register(kind);
        } else {
            warn!(
                "{} failed its self-test with {} values.",
                kind,
                values.len()
            );
            self.observer.unregister(kind);
        }
        passed
    }

    fn handle_error(&mut self, kind: DeviceKind, request: Option<RequestId>, error: DeviceError) {
        if request.map(|r| r.is_self_test()).unwrap_or(false) {
            warn!("{} failed its self-test. Error: {}", kind, error);
            self.observer.unregister(kind);
            return;
        }

        match error {
            DeviceError::Transport(_) => {
                error!("{} lost its transport. Error: {}", kind, error);
                self.observer.set_inactive(kind);
            }
            DeviceError::Timeout => {
                let count = self.timeouts.entry(kind).or_insert(0);
                *count += 1;
                debug!("{} timed out ({} in a row).", kind, count);
                if *count > self.settings.timeout_limit {
                    warn!("{} stopped answering.", kind);
                    self.observer.set_inactive(kind);
                }
            }
            DeviceError::Frame(_) | DeviceError::CalibrationMissing => {
                warn!("Dropped {} sample. Error: {}", kind, error);
            }
            DeviceError::NoData => trace!("{} had no data.", kind),
            DeviceError::Vendor(_) | DeviceError::Unsupported => {
                warn!("{} error: {}", kind, error);
            }
        }
    }

    /// Apply offsets and hand named values to the acquisition buffer.
    fn forward(&mut self, kind: DeviceKind, values: &[f64]) {
        match kind {
            DeviceKind::Actuator => self.forward_actuator(values),
            DeviceKind::Force => {
                let Some(raw) = values.first().copied() else {
                    return;
                };
                let value = self.force_value(raw);
                self.collect(Channel::Force, value);
            }
            DeviceKind::Laser => {
                let Some(raw) = values.last().copied() else {
                    return;
                };
                let value = self.laser_value(raw);
                self.collect(Channel::Laser, value);
            }
            DeviceKind::Camera => {}
        }
    }

    fn forward_actuator(&mut self, values: &[f64]) {
        if values.len() != TELEMETRY_VALUE_COUNT {
            warn!("Actuator sent {} values, dropping.", values.len());
            return;
        }
        for (i, value) in values[RESISTANCE_OFFSET..].iter().enumerate() {
            self.collect(Channel::Resistance(i as u8), *value);
        }
        let commanded = self.signal.last();
        for (i, level) in commanded.values().iter().enumerate() {
            let channel = match self.actuator_mode {
                ActuatorMode::Power => Channel::Power(i as u8),
                ActuatorMode::Current => Channel::Current(i as u8),
            };
            self.collect(channel, f64::from(*level));
        }
    }

    /// If a zero of `kind` has settled, `raw` becomes its offset.
    fn capture_offset(&mut self, kind: DeviceKind, raw: f64) -> bool {
        match self.zeroing.get(&kind) {
            Some(due) if Instant::now() >= *due => {
                self.zeroing.remove(&kind);
                self.offsets.insert(kind, raw);
                info!("{} offset set to {}.", kind, raw);
                true
            }
            _ => false,
        }
    }

    fn force_value(&mut self, raw: f64) -> f64 {
        if self.capture_offset(DeviceKind::Force, raw) {
            self.last_force = Some(0.0);
            return 0.0;
        }
        let corrected = raw - self.offset(DeviceKind::Force);
        let value = match self.last_force {
            Some(last) if (corrected - last).abs() >= self.settings.force_spike_threshold => {
                debug!("Force spike {} -> {} filtered.", last, corrected);
                last
            }
            _ => corrected,
        };
        self.last_force = Some(value);
        value
    }

    fn laser_value(&mut self, raw: f64) -> f64 {
        if self.capture_offset(DeviceKind::Laser, raw) {
            if let Err(e) = self.config.write_laser_offset(raw) {
                error!("Failed to persist laser offset. Error: {}", e);
            }
            return 0.0;
        }
        raw - self.offset(DeviceKind::Laser)
    }

    fn collect(&self, channel: Channel, value: f64) {
        if self.acquisition.collect(channel, value).is_err() {
            trace!("Acquisition task is gone, dropping {}.", channel);
        }
    }

    /// Every worker handle, for stopping at shutdown.
    pub fn take_workers(&mut self) -> Vec<WorkerHandle> {
        let kinds: Vec<DeviceKind> = self.workers.keys().copied().collect();
        kinds
            .into_iter()
            .filter_map(|kind| self.remove_worker(kind))
            .collect()
    }
}

fn stop_in_background(mut worker: WorkerHandle) {
    let kind = worker.kind();
    let spawned = std::thread::Builder::new()
        .name(format!("{}-stop", kind))
        .spawn(move || worker.stop());
    if let Err(e) = spawned {
        error!("Failed to stop {} worker in the background. Error: {}", kind, e);
    }
}

/// Join a worker thread without stalling the runtime.
async fn stop_worker(mut worker: WorkerHandle) {
    let kind = worker.kind();
    if let Err(e) = task::spawn_blocking(move || worker.stop()).await {
        error!("Failed to stop {} worker. Error: {}", kind, e);
    }
}

/// Shortest tick period; tokio rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Task: Drive the scheduler. Ticks while requesting, applies commands and
/// worker events in between. Stops every worker when cancelled.
#[tracing::instrument(skip_all)]
pub async fn task_scheduler(
    token: CancellationToken,
    mut scheduler: Scheduler,
    inbox: SchedulerInbox,
) {
    info!("Started.");
    let SchedulerInbox {
        mut rx_commands,
        mut rx_events,
    } = inbox;
    let mut ticker = ticker(scheduler.interval());

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            Some(command) = rx_commands.recv() => {
                match command {
                    SchedulerCommand::StartRequesting(mode) => {
                        if !scheduler.is_requesting() {
                            ticker = self::ticker(scheduler.interval());
                        }
                        scheduler.start_requesting(mode);
                    }
                    SchedulerCommand::StopRequesting => scheduler.stop_requesting(),
                    SchedulerCommand::SetInterval(period) => {
                        info!("Interval {:?} -> {:?}.", scheduler.interval(), period);
                        scheduler.set_interval(period);
                        ticker = self::ticker(period);
                    }
                    SchedulerCommand::SetMode(mode) => scheduler.set_mode(mode),
                    SchedulerCommand::SetActuatorMode(mode) => scheduler.set_actuator_mode(mode),
                    SchedulerCommand::SetDirect(power) => scheduler.set_direct(power),
                    SchedulerCommand::SetSine(channel, parameters) => {
                        scheduler.set_sine(channel, parameters)
                    }
                    SchedulerCommand::Zero(kind) => scheduler.zero(kind),
                    SchedulerCommand::ZeroOutput => scheduler.zero_output(),
                    SchedulerCommand::RegisterPassive(kind) => scheduler.register_passive(kind),
                    SchedulerCommand::AddWorker(worker) => scheduler.add_worker(worker),
                    SchedulerCommand::RemoveWorker(kind, done) => {
                        if let Some(worker) = scheduler.remove_worker(kind) {
                            stop_worker(worker).await;
                            info!("Removed {} worker.", kind);
                        }
                        if done.send(()).is_err() {
                            debug!("Remove requester went away.");
                        }
                    }
                }
            },
            Some(event) = rx_events.recv() => scheduler.handle_event(event),
            _ = ticker.tick(), if scheduler.is_requesting() => scheduler.tick(),
        }
    }

    for worker in scheduler.take_workers() {
        stop_worker(worker).await;
    }
    info!("All workers stopped.");
}

#[cfg(test)]
mod tests {
    use common::actuator::decode_command;
    use tokio::sync::broadcast;

    use super::*;
    use crate::{
        externals::config::{AppConfig, MemoryConfigStore},
        internals::{
            acquisition::{acquisition_channel, AcquisitionCommand, AcquisitionInbox},
            observer::ObserverEvent,
        },
        workers::worker::{DetachedWorker, SeenRequest},
    };

    struct Rig {
        scheduler: Scheduler,
        inbox: AcquisitionInbox,
        store: MemoryConfigStore,
        _rx_observer: broadcast::Receiver<ObserverEvent>,
    }

    impl Rig {
        fn new(settings: SchedulerSettings) -> Self {
            let (acquisition, inbox) = acquisition_channel();
            let (tx_observer, rx_observer) = broadcast::channel(64);
            let store = MemoryConfigStore::new(AppConfig::default());
            let scheduler = Scheduler::new(
                settings,
                DeviceObserver::new(tx_observer),
                SignalGenerator::new(),
                acquisition,
                Arc::new(store.clone()),
            );
            Self {
                scheduler,
                inbox,
                store,
                _rx_observer: rx_observer,
            }
        }

        fn add(&mut self, kind: DeviceKind) -> DetachedWorker {
            let (handle, worker) = WorkerHandle::detached(kind);
            self.scheduler.add_worker(handle);
            worker
        }

        /// Add a worker and pass its self-test.
        fn add_active(&mut self, kind: DeviceKind) -> DetachedWorker {
            let worker = self.add(kind);
            let values = match kind {
                DeviceKind::Actuator => vec![0.0; 8],
                _ => vec![0.0],
            };
            self.scheduler.handle_event(WorkerEvent::Sample {
                kind,
                request: RequestId::SelfTest(kind),
                values,
            });
            worker.take_requests();
            self.values();
            worker
        }

        fn sample(&mut self, kind: DeviceKind, values: Vec<f64>) {
            self.scheduler.handle_event(WorkerEvent::Sample {
                kind,
                request: RequestId::FromDevice(kind),
                values,
            });
        }

        fn values(&mut self) -> Vec<(Channel, f64)> {
            std::iter::from_fn(|| self.inbox.try_next_value()).collect()
        }

        fn commands(&mut self) -> Vec<AcquisitionCommand> {
            std::iter::from_fn(|| self.inbox.try_next_command()).collect()
        }
    }

    fn instant_zero() -> SchedulerSettings {
        SchedulerSettings {
            zero_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_actuator_telemetry_maps_to_resistances() {
        let mut rig = Rig::new(SchedulerSettings::default());
        let worker = rig.add(DeviceKind::Actuator);
        assert_eq!(
            worker.take_requests(),
            vec![SeenRequest::SelfTest(RequestId::SelfTest(DeviceKind::Actuator))]
        );

        rig.scheduler.handle_event(WorkerEvent::Sample {
            kind: DeviceKind::Actuator,
            request: RequestId::SelfTest(DeviceKind::Actuator),
            values: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        });
        assert!(rig.scheduler.observer().is_active(DeviceKind::Actuator));

        let values: BTreeMap<Channel, f64> = rig.values().into_iter().collect();
        for (i, expected) in [3.0, 4.0, 5.0, 6.0, 7.0, 8.0].iter().enumerate() {
            assert_eq!(values.get(&Channel::Resistance(i as u8)), Some(expected));
            assert_eq!(values.get(&Channel::Current(i as u8)), Some(&0.0));
        }
        assert!(!values.contains_key(&Channel::Power(0)));
    }

    #[test]
    fn test_commanded_vector_follows_actuator_mode() {
        let mut rig = Rig::new(SchedulerSettings::default());
        let worker = rig.add_active(DeviceKind::Actuator);
        rig.scheduler.set_actuator_mode(ActuatorMode::Power);
        rig.scheduler.set_mode(SignalMode::Direct);
        rig.scheduler.set_direct(PowerVector::new([10, 20, 30, 40, 50, 60]));
        rig.scheduler.tick();

        let requests = worker.take_requests();
        let [SeenRequest::Write(_, frame)] = requests.as_slice() else {
            panic!("Expected one write, got {:?}", requests);
        };
        let frame = decode_command(frame).expect("Valid frame.");
        assert_eq!(frame.mode(), Ok(ActuatorMode::Power));
        assert_eq!(frame.power, PowerVector::new([10, 20, 30, 40, 50, 60]));

        rig.sample(DeviceKind::Actuator, vec![0.0; 8]);
        let values: BTreeMap<Channel, f64> = rig.values().into_iter().collect();
        assert_eq!(values.get(&Channel::Power(5)), Some(&60.0));
        assert!(!values.contains_key(&Channel::Current(5)));
    }

    #[test]
    fn test_no_second_request_while_in_flight() {
        let mut rig = Rig::new(SchedulerSettings::default());
        let actuator = rig.add_active(DeviceKind::Actuator);
        let force = rig.add_active(DeviceKind::Force);
        let laser = rig.add_active(DeviceKind::Laser);

        for _ in 0..5 {
            rig.scheduler.tick();
        }
        assert_eq!(actuator.take_requests().len(), 1);
        assert_eq!(
            force.take_requests(),
            vec![SeenRequest::Read(RequestId::FromDevice(DeviceKind::Force))]
        );
        assert_eq!(laser.take_requests().len(), 1);

        force.complete_read();
        actuator.complete_write();
        rig.scheduler.tick();
        assert_eq!(force.take_requests().len(), 1);
        assert_eq!(actuator.take_requests().len(), 1);
        assert!(laser.take_requests().is_empty());
    }

    #[test]
    fn test_force_self_test() {
        let mut rig = Rig::new(SchedulerSettings::default());
        rig.add(DeviceKind::Force);
        rig.scheduler.handle_event(WorkerEvent::Sample {
            kind: DeviceKind::Force,
            request: RequestId::SelfTest(DeviceKind::Force),
            values: vec![0.25],
        });
        assert_eq!(
            rig.scheduler.observer().state(DeviceKind::Force),
            Some(DeviceState::Active)
        );

        let mut rig = Rig::new(SchedulerSettings::default());
        let force = rig.add(DeviceKind::Force);
        rig.scheduler.handle_event(WorkerEvent::Sample {
            kind: DeviceKind::Force,
            request: RequestId::SelfTest(DeviceKind::Force),
            values: vec![],
        });
        assert_eq!(rig.scheduler.observer().state(DeviceKind::Force), None);
        rig.scheduler.tick();
        assert_eq!(
            force.take_requests(),
            vec![SeenRequest::SelfTest(RequestId::SelfTest(DeviceKind::Force))]
        );

        let mut rig = Rig::new(SchedulerSettings::default());
        rig.add(DeviceKind::Force);
        rig.scheduler.handle_event(WorkerEvent::Error {
            kind: DeviceKind::Force,
            request: Some(RequestId::SelfTest(DeviceKind::Force)),
            error: DeviceError::Timeout,
        });
        assert!(!rig.scheduler.observer().is_registered(DeviceKind::Force));
    }

    #[test]
    fn test_zero_force_then_next_sample_reads_zero() {
        let mut rig = Rig::new(instant_zero());
        rig.add_active(DeviceKind::Force);
        rig.sample(DeviceKind::Force, vec![0.1]);

        rig.scheduler.zero(DeviceKind::Force);
        rig.sample(DeviceKind::Force, vec![1.7]);
        let values = rig.values();
        let (_, value) = values.last().copied().expect("Force collected.");
        assert!(value.abs() < 1e-12);
        assert_eq!(rig.scheduler.offset(DeviceKind::Force), 1.7);

        rig.sample(DeviceKind::Force, vec![1.9]);
        let (_, value) = rig.values().last().copied().expect("Force collected.");
        assert!((value - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_zero_waits_for_settle() {
        let mut rig = Rig::new(SchedulerSettings {
            zero_settle: Duration::from_secs(3600),
            force_spike_threshold: f64::INFINITY,
            ..Default::default()
        });
        rig.add_active(DeviceKind::Force);
        rig.scheduler.zero(DeviceKind::Force);
        rig.sample(DeviceKind::Force, vec![1.5]);
        assert_eq!(rig.values(), vec![(Channel::Force, 1.5)]);
        assert_eq!(rig.scheduler.offset(DeviceKind::Force), 0.0);
    }

    #[test]
    fn test_force_spikes_are_held() {
        let mut rig = Rig::new(SchedulerSettings::default());
        rig.add_active(DeviceKind::Force);
        rig.sample(DeviceKind::Force, vec![0.2]);
        rig.sample(DeviceKind::Force, vec![5.0]);
        rig.sample(DeviceKind::Force, vec![0.3]);
        let forces: Vec<f64> = rig.values().into_iter().map(|(_, v)| v).collect();
        assert_eq!(forces, vec![0.2, 0.2, 0.3]);
    }

    #[test]
    fn test_laser_uses_last_value_and_persists_offset() {
        let mut rig = Rig::new(SchedulerSettings {
            laser_offset: 1.0,
            zero_settle: Duration::ZERO,
            ..Default::default()
        });
        rig.add_active(DeviceKind::Laser);
        rig.sample(DeviceKind::Laser, vec![9.0, 3.5]);
        assert_eq!(rig.values(), vec![(Channel::Laser, 2.5)]);

        rig.scheduler.zero(DeviceKind::Laser);
        rig.sample(DeviceKind::Laser, vec![0.0, 4.0]);
        rig.sample(DeviceKind::Laser, vec![0.0, 4.5]);
        assert_eq!(
            rig.values(),
            vec![(Channel::Laser, 0.0), (Channel::Laser, 0.5)]
        );
        let stored = rig.store.load().expect("Store is readable.");
        assert_eq!(stored.laser_offset, 4.0);
    }

    #[test]
    fn test_timeouts_mark_device_inactive() {
        let mut rig = Rig::new(SchedulerSettings {
            timeout_limit: 2,
            ..Default::default()
        });
        let force = rig.add_active(DeviceKind::Force);
        for _ in 0..3 {
            rig.scheduler.handle_event(WorkerEvent::Error {
                kind: DeviceKind::Force,
                request: Some(RequestId::FromDevice(DeviceKind::Force)),
                error: DeviceError::Timeout,
            });
        }
        assert_eq!(
            rig.scheduler.observer().state(DeviceKind::Force),
            Some(DeviceState::Inactive)
        );
        rig.scheduler.tick();
        assert!(force.take_requests().is_empty());
    }

    #[test]
    fn test_transport_fault_marks_device_inactive() {
        let mut rig = Rig::new(SchedulerSettings::default());
        let laser = rig.add_active(DeviceKind::Laser);
        rig.scheduler.handle_event(WorkerEvent::Error {
            kind: DeviceKind::Laser,
            request: Some(RequestId::FromDevice(DeviceKind::Laser)),
            error: DeviceError::Transport("gone".into()),
        });
        assert_eq!(
            rig.scheduler.observer().state(DeviceKind::Laser),
            Some(DeviceState::Inactive)
        );

        laser.fault();
        rig.scheduler.handle_event(WorkerEvent::StateChanged {
            kind: DeviceKind::Laser,
            state: WorkerState::Faulted,
        });
        rig.scheduler.tick();
        assert!(laser.take_requests().is_empty());
    }

    #[test]
    fn test_frame_errors_are_not_escalated() {
        let mut rig = Rig::new(SchedulerSettings::default());
        rig.add_active(DeviceKind::Actuator);
        rig.scheduler.handle_event(WorkerEvent::Error {
            kind: DeviceKind::Actuator,
            request: Some(RequestId::FromDevice(DeviceKind::Actuator)),
            error: DeviceError::Frame(common::FrameError::WrongLength {
                expected: 16,
                actual: 10,
            }),
        });
        assert!(rig.scheduler.observer().is_active(DeviceKind::Actuator));
        assert!(rig.values().is_empty());
    }

    #[test]
    fn test_zero_output_writes_zero_vector() {
        let mut rig = Rig::new(SchedulerSettings::default());
        let actuator = rig.add_active(DeviceKind::Actuator);
        rig.scheduler.set_direct(PowerVector::new([5; 6]));
        rig.scheduler.zero_output();
        let requests = actuator.take_requests();
        let [SeenRequest::Write(_, frame)] = requests.as_slice() else {
            panic!("Expected one write, got {:?}", requests);
        };
        let frame = decode_command(frame).expect("Valid frame.");
        assert!(frame.power.is_zero());
    }

    #[test]
    fn test_remove_worker_unregisters() {
        let mut rig = Rig::new(SchedulerSettings::default());
        rig.add_active(DeviceKind::Force);
        let handle = rig.scheduler.remove_worker(DeviceKind::Force);
        assert!(handle.is_some());
        assert!(!rig.scheduler.observer().is_registered(DeviceKind::Force));
        assert!(rig.scheduler.remove_worker(DeviceKind::Force).is_none());
    }

    #[test]
    fn test_start_and_stop_drive_acquisition() {
        let mut rig = Rig::new(SchedulerSettings::default());
        rig.scheduler.start_requesting(SignalMode::Direct);
        assert!(rig.scheduler.is_requesting());
        rig.scheduler.stop_requesting();
        assert!(!rig.scheduler.is_requesting());
        let commands = rig.commands();
        assert!(matches!(
            commands.as_slice(),
            [AcquisitionCommand::Start, AcquisitionCommand::Stop]
        ));
    }

    #[test]
    fn test_answers_after_removal_are_dropped() {
        let mut rig = Rig::new(SchedulerSettings::default());
        rig.add_active(DeviceKind::Force);
        let removed = rig.scheduler.remove_worker(DeviceKind::Force);
        assert!(removed.is_some());

        rig.sample(DeviceKind::Force, vec![0.5]);
        rig.scheduler.handle_event(WorkerEvent::Error {
            kind: DeviceKind::Force,
            request: Some(RequestId::FromDevice(DeviceKind::Force)),
            error: DeviceError::Transport("gone".into()),
        });
        assert!(rig.values().is_empty());
        assert!(!rig.scheduler.observer().is_registered(DeviceKind::Force));
    }

    fn spawn_task(
        settings: SchedulerSettings,
    ) -> (CancellationToken, SchedulerHandle, task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let (acquisition, _acquisition_inbox) = acquisition_channel();
        let (tx_observer, _rx_observer) = broadcast::channel(64);
        let scheduler = Scheduler::new(
            settings,
            DeviceObserver::new(tx_observer),
            SignalGenerator::new(),
            acquisition,
            Arc::new(MemoryConfigStore::default()),
        );
        let (handle, inbox) = scheduler_channel();
        let task = tokio::spawn(task_scheduler(token.clone(), scheduler, inbox));
        (token, handle, task)
    }

    async fn add_registered(handle: &SchedulerHandle, kind: DeviceKind) -> DetachedWorker {
        let (worker_handle, worker) = WorkerHandle::detached(kind);
        handle.add_handle(worker_handle).expect("Scheduler is running.");
        time::sleep(Duration::from_millis(1)).await;
        let values = match kind {
            DeviceKind::Actuator => vec![0.0; 8],
            _ => vec![0.0],
        };
        handle
            .tx_events
            .send(WorkerEvent::Sample {
                kind,
                request: RequestId::SelfTest(kind),
                values,
            })
            .expect("Scheduler is running.");
        time::sleep(Duration::from_millis(1)).await;
        worker.take_requests();
        worker
    }

    /// Count actuator writes over `window`, completing each one right away.
    async fn count_writes(actuator: &DetachedWorker, window: Duration) -> usize {
        let end = Instant::now() + window;
        let mut writes = 0;
        while Instant::now() < end {
            time::sleep(Duration::from_millis(1)).await;
            writes += actuator
                .take_requests()
                .iter()
                .filter(|r| matches!(r, SeenRequest::Write(..)))
                .count();
            actuator.complete_write();
        }
        writes
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_changes_cadence() {
        let (token, handle, task) = spawn_task(SchedulerSettings::default());
        let actuator = add_registered(&handle, DeviceKind::Actuator).await;
        handle
            .start_requesting(SignalMode::Direct)
            .expect("Scheduler is running.");

        let fast = count_writes(&actuator, Duration::from_millis(150)).await;
        assert!((9..=11).contains(&fast), "{} writes at 15 ms", fast);

        handle
            .set_interval(Duration::from_millis(100))
            .expect("Scheduler is running.");
        time::sleep(Duration::from_millis(1)).await;
        actuator.take_requests();
        actuator.complete_write();

        let slow = count_writes(&actuator, Duration::from_millis(240)).await;
        assert_eq!(slow, 2);

        token.cancel();
        task.await.expect("Task panicked.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_rejected() {
        let (token, handle, task) = spawn_task(SchedulerSettings {
            interval: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(
            handle.set_interval(Duration::ZERO),
            Err(SchedulerError::InvalidInterval)
        ));

        // a zero interval from the settings still ticks
        let force = add_registered(&handle, DeviceKind::Force).await;
        handle
            .start_requesting(SignalMode::Sine)
            .expect("Scheduler is running.");
        time::sleep(Duration::from_millis(10)).await;
        assert!(force
            .take_requests()
            .contains(&SeenRequest::Read(RequestId::FromDevice(DeviceKind::Force))));

        token.cancel();
        task.await.expect("Task panicked.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_polls_on_interval() {
        let token = CancellationToken::new();
        let (acquisition, _acquisition_inbox) = acquisition_channel();
        let (tx_observer, _rx_observer) = broadcast::channel(64);
        let scheduler = Scheduler::new(
            SchedulerSettings::default(),
            DeviceObserver::new(tx_observer),
            SignalGenerator::new(),
            acquisition,
            Arc::new(MemoryConfigStore::default()),
        );
        let (handle, inbox) = scheduler_channel();
        let task = tokio::spawn(task_scheduler(token.clone(), scheduler, inbox));

        let (force_handle, force) = WorkerHandle::detached(DeviceKind::Force);
        handle.add_handle(force_handle).expect("Scheduler is running.");
        time::sleep(Duration::from_millis(1)).await;
        handle
            .tx_events
            .send(WorkerEvent::Sample {
                kind: DeviceKind::Force,
                request: RequestId::SelfTest(DeviceKind::Force),
                values: vec![0.0],
            })
            .expect("Scheduler is running.");
        handle
            .start_requesting(SignalMode::Sine)
            .expect("Scheduler is running.");

        time::sleep(Duration::from_millis(100)).await;
        let requests = force.take_requests();
        assert!(requests.contains(&SeenRequest::Read(RequestId::FromDevice(DeviceKind::Force))));

        handle
            .remove_worker(DeviceKind::Force)
            .await
            .expect("Scheduler is running.");
        token.cancel();
        task.await.expect("Task panicked.");
        assert!(handle.stop_requesting().is_err());
    }
}
