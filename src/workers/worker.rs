use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

use crate::models::{
    device::{DeviceKind, RequestId},
    worker_event::WorkerEvent,
};

use super::{ConnectError, DeviceDriver, DeviceError, DispatchError, Reply};

/// Lifecycle of one worker.
///
/// `Created -> Opening -> Ready -> (Reading <-> Idle) -> Closed`, or
/// `Ready -> Faulted -> Closed` after an unrecoverable transport error.
/// A faulted worker is never revived; reconnecting means a new worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Opening,
    Ready,
    Reading,
    Idle,
    Faulted,
    Closed,
}

impl WorkerState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Opening => 1,
            Self::Ready => 2,
            Self::Reading => 3,
            Self::Idle => 4,
            Self::Faulted => 5,
            Self::Closed => 6,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Opening,
            2 => Self::Ready,
            3 => Self::Reading,
            4 => Self::Idle,
            5 => Self::Faulted,
            _ => Self::Closed,
        }
    }

    /// Whether the worker can still take requests.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Ready | Self::Reading | Self::Idle)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// How long a pending answer may take before the request times out.
    pub response_timeout: Duration,

    /// Delay between the worker starting and its self-test, giving
    /// the instrument time to boot.
    pub self_test_delay: Duration,

    /// How often the worker thread wakes up to poll its transport.
    pub idle_poll: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            response_timeout: super::DEFAULT_RESPONSE_TIMEOUT,
            self_test_delay: Duration::from_millis(1500),
            idle_poll: Duration::from_millis(1),
        }
    }
}

#[derive(Debug)]
enum WorkerRequest {
    Read(RequestId),
    Write(RequestId, Vec<u8>),
    SelfTest(RequestId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Read,
    Write,
    SelfTest,
}

/// State shared between a worker thread and its handle.
struct Shared {
    state: AtomicU8,
    running: AtomicBool,
    read_busy: AtomicBool,
    write_busy: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Created.to_u8()),
            running: AtomicBool::new(false),
            read_busy: AtomicBool::new(false),
            write_busy: AtomicBool::new(false),
        }
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn flag(&self, slot: Slot) -> Option<&AtomicBool> {
        match slot {
            Slot::Read => Some(&self.read_busy),
            Slot::Write => Some(&self.write_busy),
            Slot::SelfTest => None,
        }
    }
}

/// A worker that has been created but not opened yet.
pub struct DeviceWorker<D: DeviceDriver> {
    driver: D,
    settings: WorkerSettings,
    shared: Arc<Shared>,
}

impl<D: DeviceDriver> DeviceWorker<D> {
    pub fn new(driver: D, settings: WorkerSettings) -> Self {
        Self {
            driver,
            settings,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Open the transport and start the worker thread. Opening consumes the
    /// worker, so it can only ever happen once.
    #[tracing::instrument(skip_all, fields(kind = %self.driver.kind()))]
    pub fn open(
        mut self,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle, ConnectError> {
        let kind = self.driver.kind();
        self.shared.set_state(WorkerState::Opening);
        if let Err(e) = self.driver.open() {
            error!("Failed to open device. Error: {}", e);
            self.shared.set_state(WorkerState::Closed);
            return Err(e);
        }

        let (tx_requests, rx_requests) = mpsc::channel();
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(WorkerState::Ready);
        if events
            .send(WorkerEvent::StateChanged {
                kind,
                state: WorkerState::Ready,
            })
            .is_err()
        {
            debug!("Nobody is listening for worker events yet.");
        }

        let shared = self.shared.clone();
        let runner = Runner {
            driver: self.driver,
            settings: self.settings,
            shared: self.shared.clone(),
            events,
            outstanding: None,
            backlog: VecDeque::new(),
            self_test: SelfTestSlot::NotRequested,
            started: Instant::now(),
        };

        let thread = thread::Builder::new()
            .name(format!("{}-worker", kind))
            .spawn(move || runner.run(rx_requests));
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                shared.set_state(WorkerState::Closed);
                return Err(ConnectError::Spawn(e));
            }
        };
        info!("Worker started.");

        Ok(WorkerHandle {
            kind,
            tx_requests: Some(tx_requests),
            shared,
            thread: Some(thread),
        })
    }
}

/// The scheduler's side of a running worker. Dispatching never blocks.
pub struct WorkerHandle {
    kind: DeviceKind,
    tx_requests: Option<mpsc::Sender<WorkerRequest>>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Ask for one reading. A no-op returning `Overrun` while the previous
    /// read hasn't completed.
    pub fn read(&self, request: RequestId) -> Result<(), DispatchError> {
        self.dispatch(Slot::Read, WorkerRequest::Read(request))
    }

    /// Send a payload. A no-op returning `Overrun` while the previous write
    /// hasn't completed.
    pub fn write(&self, request: RequestId, payload: Vec<u8>) -> Result<(), DispatchError> {
        self.dispatch(Slot::Write, WorkerRequest::Write(request, payload))
    }

    /// Schedule the one-shot startup self-test.
    pub fn self_test(&self, request: RequestId) -> Result<(), DispatchError> {
        self.dispatch(Slot::SelfTest, WorkerRequest::SelfTest(request))
    }

    fn dispatch(&self, slot: Slot, request: WorkerRequest) -> Result<(), DispatchError> {
        let Some(tx_requests) = &self.tx_requests else {
            return Err(DispatchError::Closed);
        };
        if !self.shared.state().is_live() {
            return Err(DispatchError::Closed);
        }
        let flag = self.shared.flag(slot);
        if let Some(flag) = flag {
            if flag.swap(true, Ordering::SeqCst) {
                trace!("{} request skipped, previous one still in flight.", self.kind);
                return Err(DispatchError::Overrun);
            }
        }
        if tx_requests.send(request).is_err() {
            if let Some(flag) = flag {
                flag.store(false, Ordering::SeqCst);
            }
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    /// Close the transport and wait for the worker thread to exit.
    /// Safe to call more than once.
    #[tracing::instrument(skip_all, fields(kind = %self.kind))]
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.tx_requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Worker thread panicked.");
            } else {
                debug!("Worker thread joined.");
            }
        }
        self.shared.set_state(WorkerState::Closed);
    }

    /// A handle with no thread behind it, for exercising dispatch logic.
    #[cfg(test)]
    pub(crate) fn detached(kind: DeviceKind) -> (Self, DetachedWorker) {
        let (tx_requests, rx_requests) = mpsc::channel();
        let shared = Arc::new(Shared::new());
        shared.set_state(WorkerState::Idle);
        shared.running.store(true, Ordering::SeqCst);
        (
            Self {
                kind,
                tx_requests: Some(tx_requests),
                shared: shared.clone(),
                thread: None,
            },
            DetachedWorker {
                rx_requests,
                shared,
            },
        )
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Test side of a detached handle: sees the requests and completes them.
#[cfg(test)]
pub(crate) struct DetachedWorker {
    rx_requests: mpsc::Receiver<WorkerRequest>,
    shared: Arc<Shared>,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SeenRequest {
    Read(RequestId),
    Write(RequestId, Vec<u8>),
    SelfTest(RequestId),
}

#[cfg(test)]
impl DetachedWorker {
    pub(crate) fn take_requests(&self) -> Vec<SeenRequest> {
        self.rx_requests
            .try_iter()
            .map(|request| match request {
                WorkerRequest::Read(id) => SeenRequest::Read(id),
                WorkerRequest::Write(id, payload) => SeenRequest::Write(id, payload),
                WorkerRequest::SelfTest(id) => SeenRequest::SelfTest(id),
            })
            .collect()
    }

    pub(crate) fn complete_read(&self) {
        self.shared.read_busy.store(false, Ordering::SeqCst);
    }

    pub(crate) fn complete_write(&self) {
        self.shared.write_busy.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fault(&self) {
        self.shared.set_state(WorkerState::Faulted);
    }
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    request: RequestId,
    slot: Slot,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
enum SelfTestSlot {
    NotRequested,
    Scheduled(RequestId, Instant),
    Done,
}

/// Marker for a fatal error that ends the worker loop.
struct Fatal;

struct Runner<D: DeviceDriver> {
    driver: D,
    settings: WorkerSettings,
    shared: Arc<Shared>,
    events: UnboundedSender<WorkerEvent>,
    outstanding: Option<Outstanding>,
    backlog: VecDeque<WorkerRequest>,
    self_test: SelfTestSlot,
    started: Instant,
}

impl<D: DeviceDriver> Runner<D> {
    #[tracing::instrument(skip_all, fields(kind = %self.driver.kind()))]
    fn run(mut self, rx_requests: mpsc::Receiver<WorkerRequest>) {
        info!("Started.");
        self.shared.set_state(WorkerState::Idle);

        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                warn!("Cancelled.");
                break;
            }

            if self.step().is_err() {
                break;
            }

            match rx_requests.recv_timeout(self.settings.idle_poll) {
                Ok(request) => self.backlog.push_back(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Handle dropped.");
                    break;
                }
            }
        }

        self.driver.close();
        self.shared.read_busy.store(false, Ordering::SeqCst);
        self.shared.write_busy.store(false, Ordering::SeqCst);
        if self.shared.state() != WorkerState::Faulted {
            self.shared.set_state(WorkerState::Closed);
            self.emit(WorkerEvent::StateChanged {
                kind: self.driver.kind(),
                state: WorkerState::Closed,
            });
        }
        info!("Stopped.");
    }

    /// Advance whatever is outstanding, otherwise start the next request.
    fn step(&mut self) -> Result<(), Fatal> {
        if self.outstanding.is_some() {
            return self.poll_outstanding();
        }

        if let Some(request) = self.backlog.pop_front() {
            return self.start(request);
        }

        if let SelfTestSlot::Scheduled(request, due) = self.self_test {
            if Instant::now() >= due {
                self.self_test = SelfTestSlot::Done;
                debug!("Running self-test.");
                self.shared.set_state(WorkerState::Reading);
                let result = self.driver.self_test();
                return self.conclude(request, Slot::SelfTest, result);
            }
        }

        match self.driver.idle() {
            Ok(()) => Ok(()),
            Err(error) => self.report(None, error),
        }
    }

    fn start(&mut self, request: WorkerRequest) -> Result<(), Fatal> {
        let (id, slot, result) = match request {
            WorkerRequest::Read(id) => {
                self.shared.set_state(WorkerState::Reading);
                (id, Slot::Read, self.driver.read())
            }
            WorkerRequest::Write(id, payload) => {
                self.shared.set_state(WorkerState::Reading);
                (id, Slot::Write, self.driver.write(&payload))
            }
            WorkerRequest::SelfTest(id) => {
                match self.self_test {
                    SelfTestSlot::NotRequested => {
                        let due = self.started + self.settings.self_test_delay;
                        debug!("Self-test scheduled.");
                        self.self_test = SelfTestSlot::Scheduled(id, due);
                    }
                    _ => warn!("Self-test already requested, ignoring."),
                }
                return Ok(());
            }
        };
        self.conclude(id, slot, result)
    }

    fn poll_outstanding(&mut self) -> Result<(), Fatal> {
        let Some(outstanding) = self.outstanding else {
            return Ok(());
        };
        match self.driver.poll_pending() {
            Ok(Reply::Pending) => {
                if Instant::now() >= outstanding.deadline {
                    let error = self
                        .driver
                        .abandon_pending()
                        .unwrap_or(DeviceError::Timeout);
                    self.conclude(outstanding.request, outstanding.slot, Err(error))
                } else {
                    Ok(())
                }
            }
            other => self.conclude(outstanding.request, outstanding.slot, other),
        }
    }

    fn conclude(
        &mut self,
        request: RequestId,
        slot: Slot,
        result: Result<Reply, DeviceError>,
    ) -> Result<(), Fatal> {
        match result {
            Ok(Reply::Pending) => {
                self.outstanding = Some(Outstanding {
                    request,
                    slot,
                    deadline: Instant::now() + self.settings.response_timeout,
                });
                Ok(())
            }
            Ok(Reply::Done) => {
                self.finish(slot);
                Ok(())
            }
            Ok(Reply::Values(values)) => {
                self.finish(slot);
                trace!("{} answered with {:?}.", request, values);
                self.emit(WorkerEvent::Sample {
                    kind: self.driver.kind(),
                    request,
                    values,
                });
                Ok(())
            }
            Err(error) => {
                self.finish(slot);
                self.report(Some(request), error)
            }
        }
    }

    fn finish(&mut self, slot: Slot) {
        self.outstanding = None;
        if let Some(flag) = self.shared.flag(slot) {
            flag.store(false, Ordering::SeqCst);
        }
        self.shared.set_state(WorkerState::Idle);
    }

    fn report(&mut self, request: Option<RequestId>, error: DeviceError) -> Result<(), Fatal> {
        let kind = self.driver.kind();
        let fatal = error.is_fatal();
        if fatal {
            error!("Unrecoverable device error. Error: {}", error);
            self.shared.set_state(WorkerState::Faulted);
        } else {
            warn!("Device error. Error: {}", error);
        }
        self.emit(WorkerEvent::Error {
            kind,
            request,
            error,
        });
        if fatal {
            self.emit(WorkerEvent::StateChanged {
                kind,
                state: WorkerState::Faulted,
            });
            return Err(Fatal);
        }
        Ok(())
    }

    fn emit(&self, event: WorkerEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("Dropped worker event, receiver is gone. Event: {}", e.0);
        }
    }
}

/// Wait up to `timeout` for the next sample or error, skipping lifecycle
/// notifications.
#[cfg(test)]
pub(crate) fn next_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>,
    timeout: Duration,
) -> Option<WorkerEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(WorkerEvent::StateChanged { .. }) => continue,
            Ok(event) => return Some(event),
            Err(_) if Instant::now() >= deadline => return None,
            Err(_) => thread::sleep(Duration::from_millis(1)),
        }
    }
}
