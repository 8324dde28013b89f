use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use super::services::{LaserCapability, LaserError, LaserParameters};

/// Scripted stand-in for the vendor library.
pub struct FakeLaser {
    handle: FakeLaserHandle,
    open: bool,
}

/// Test side of a `FakeLaser`.
#[derive(Clone)]
pub struct FakeLaserHandle {
    pub polls: Arc<AtomicUsize>,
    replies: Arc<Mutex<VecDeque<Result<Vec<f64>, LaserError>>>>,
    poll_delay: Arc<Mutex<Duration>>,
    opened_with: Arc<Mutex<Option<LaserParameters>>>,
    fail_open: Arc<Mutex<Option<LaserError>>>,
}

impl FakeLaser {
    pub fn new() -> (Self, FakeLaserHandle) {
        let handle = FakeLaserHandle {
            polls: Arc::new(AtomicUsize::new(0)),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            poll_delay: Arc::new(Mutex::new(Duration::ZERO)),
            opened_with: Arc::new(Mutex::new(None)),
            fail_open: Arc::new(Mutex::new(None)),
        };
        (
            Self {
                handle: handle.clone(),
                open: false,
            },
            handle,
        )
    }
}

impl FakeLaserHandle {
    pub fn push_reply(&self, reply: Result<Vec<f64>, LaserError>) {
        self.replies
            .lock()
            .expect("Fake laser lock poisoned.")
            .push_back(reply);
    }

    pub fn set_poll_delay(&self, delay: Duration) {
        *self.poll_delay.lock().expect("Fake laser lock poisoned.") = delay;
    }

    pub fn fail_open_with(&self, error: LaserError) {
        *self.fail_open.lock().expect("Fake laser lock poisoned.") = Some(error);
    }

    pub fn opened_with(&self) -> Option<LaserParameters> {
        self.opened_with
            .lock()
            .expect("Fake laser lock poisoned.")
            .clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl LaserCapability for FakeLaser {
    fn open(&mut self, parameters: &LaserParameters) -> Result<(), LaserError> {
        if let Some(error) = self
            .handle
            .fail_open
            .lock()
            .expect("Fake laser lock poisoned.")
            .take()
        {
            return Err(error);
        }
        *self
            .handle
            .opened_with
            .lock()
            .expect("Fake laser lock poisoned.") = Some(parameters.clone());
        self.open = true;
        Ok(())
    }

    fn poll(&mut self, _count: usize) -> Result<Vec<f64>, LaserError> {
        if !self.open {
            return Err(LaserError::NotOpen);
        }
        self.handle.polls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.handle.poll_delay.lock().expect("Fake laser lock poisoned.");
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.handle
            .replies
            .lock()
            .expect("Fake laser lock poisoned.")
            .pop_front()
            .unwrap_or(Err(LaserError::NoData))
    }

    fn close(&mut self) {
        self.open = false;
    }
}
