use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use super::services::{Transport, TransportError};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// In-memory transport with scripted replies, for driving workers in tests.
pub struct MockTransport {
    link: MockLink,
}

/// Test side of a `MockTransport`: feed input, inspect writes.
#[derive(Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

struct MockState {
    input: VecDeque<u8>,
    scheduled: Vec<(Instant, Vec<u8>)>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    latency: Duration,
    read_timeout: Duration,
    disconnected: bool,
}

impl MockState {
    fn release_due(&mut self) {
        let now = Instant::now();
        let mut pending = Vec::new();
        for (due, bytes) in self.scheduled.drain(..) {
            if due <= now {
                self.input.extend(bytes);
            } else {
                pending.push((due, bytes));
            }
        }
        self.scheduled = pending;
    }
}

impl MockTransport {
    pub fn new() -> (Self, MockLink) {
        let link = MockLink {
            state: Arc::new(Mutex::new(MockState {
                input: VecDeque::new(),
                scheduled: Vec::new(),
                written: Vec::new(),
                responder: None,
                latency: Duration::ZERO,
                read_timeout: Duration::from_millis(50),
                disconnected: false,
            })),
        };
        (Self { link: link.clone() }, link)
    }
}

impl MockLink {
    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().expect("Mock transport lock poisoned.");
        f(&mut state)
    }

    /// Make bytes available to the next reads.
    pub fn push_input(&self, bytes: &[u8]) {
        self.with_state(|s| s.input.extend(bytes.iter().copied()));
    }

    /// Reply to every write with whatever `responder` returns, after the
    /// configured latency.
    pub fn respond_with(&self, responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        self.with_state(|s| s.responder = Some(Box::new(responder)));
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.with_state(|s| s.read_timeout = timeout);
    }

    /// Every subsequent operation fails as if the cable was pulled.
    pub fn disconnect(&self) {
        self.with_state(|s| s.disconnected = true);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.written.clone())
    }

    pub fn write_count(&self) -> usize {
        self.with_state(|s| s.written.len())
    }

    pub fn pending_input(&self) -> usize {
        self.with_state(|s| {
            s.release_due();
            s.input.len()
        })
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn bytes_to_read(&mut self) -> Result<usize, TransportError> {
        self.link.with_state(|s| {
            if s.disconnected {
                return Err(TransportError::Disconnected("mock unplugged".into()));
            }
            s.release_due();
            Ok(s.input.len())
        })
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        let timeout = self.link.with_state(|s| s.read_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let done = self.link.with_state(|s| {
                if s.disconnected {
                    return Err(TransportError::Disconnected("mock unplugged".into()));
                }
                s.release_due();
                if s.input.len() >= buffer.len() {
                    for slot in buffer.iter_mut() {
                        *slot = s.input.pop_front().unwrap_or_default();
                    }
                    return Ok(true);
                }
                Ok(false)
            })?;
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.link.with_state(|s| {
            if s.disconnected {
                return Err(TransportError::Disconnected("mock unplugged".into()));
            }
            s.written.push(bytes.to_vec());
            let reply = s.responder.as_mut().and_then(|r| r(bytes));
            if let Some(reply) = reply {
                let due = Instant::now() + s.latency;
                s.scheduled.push((due, reply));
            }
            Ok(())
        })
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.link.with_state(|s| {
            if s.disconnected {
                return Err(TransportError::Disconnected("mock unplugged".into()));
            }
            s.release_due();
            s.input.clear();
            Ok(())
        })
    }
}
