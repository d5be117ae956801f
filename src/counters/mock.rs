//! Mock counter backend for testing
//!
//! This backend never touches the kernel. It can be told to fail at open time,
//! returns scripted counts, and records every control call with a timestamp so
//! tests can check where counting starts and stops relative to the measured
//! loop.
//!
//! # Example
//!
//! ```
//! use memprobe::counters::{CounterBackend, CounterEvent, EventSpec};
//! use memprobe::counters::mock::{CounterCall, MockBackend};
//!
//! let backend = MockBackend::new();
//! backend.set_count(CounterEvent::LocalDramAccess, 42);
//!
//! let spec = EventSpec { event: CounterEvent::LocalDramAccess, raw: 0x1d3 };
//! let mut handles = backend.open(&[spec]).unwrap();
//! handles.enable();
//! handles.disable();
//! assert_eq!(handles.read().get(CounterEvent::LocalDramAccess), 42);
//! assert_eq!(backend.calls(), vec![CounterCall::Open, CounterCall::Enable, CounterCall::Disable, CounterCall::Read]);
//! ```

use super::{CounterBackend, CounterEvent, CounterHandles, CounterSample, EventSpec};
use crate::error::CounterError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Control call recorded by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCall {
    Open,
    Reset,
    Enable,
    Disable,
    Read,
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    fail_open: bool,
    enable_delay: Option<Duration>,
    counts: CounterSample,
    calls: Vec<(CounterCall, Instant)>,
    opened_specs: Vec<EventSpec>,
}

/// Scripted counter backend
///
/// Clones share state, so a test can keep one clone and hand another to a worker.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

struct MockHandles {
    state: Arc<Mutex<MockState>>,
    requested: Vec<EventSpec>,
}

impl MockBackend {
    /// Create a backend that opens successfully and counts zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend whose `open()` is denied
    pub fn failing() -> Self {
        let backend = Self::new();
        backend.set_fail_open(true);
        backend
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    /// Value returned for `event` by every subsequent read
    pub fn set_count(&self, event: CounterEvent, value: u64) {
        self.state.lock().unwrap().counts.set(event, value);
    }

    /// Sleep inside `enable()`, to make one worker arrive late at a rendezvous
    pub fn set_enable_delay(&self, delay: Duration) {
        self.state.lock().unwrap().enable_delay = Some(delay);
    }

    /// Control calls in order
    pub fn calls(&self) -> Vec<CounterCall> {
        self.state.lock().unwrap().calls.iter().map(|(c, _)| *c).collect()
    }

    /// Time at which the first occurrence of `call` returned
    pub fn call_time(&self, call: CounterCall) -> Option<Instant> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .find(|(c, _)| *c == call)
            .map(|(_, t)| *t)
    }

    /// Specs passed to the last successful open
    pub fn opened_specs(&self) -> Vec<EventSpec> {
        self.state.lock().unwrap().opened_specs.clone()
    }

    fn record(state: &Mutex<MockState>, call: CounterCall) {
        state.lock().unwrap().calls.push((call, Instant::now()));
    }
}

impl CounterBackend for MockBackend {
    fn open(&self, specs: &[EventSpec]) -> Result<Box<dyn CounterHandles>, CounterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            let first = specs.first().copied().unwrap_or(EventSpec {
                event: CounterEvent::LocalDramAccess,
                raw: CounterEvent::LocalDramAccess.default_raw(),
            });
            return Err(CounterError::Open {
                event: first.event,
                raw: first.raw,
                source: std::io::Error::from_raw_os_error(libc::EACCES),
            });
        }
        state.opened_specs = specs.to_vec();
        state.calls.push((CounterCall::Open, Instant::now()));
        Ok(Box::new(MockHandles {
            state: Arc::clone(&self.state),
            requested: specs.to_vec(),
        }))
    }
}

impl CounterHandles for MockHandles {
    fn reset(&mut self) {
        MockBackend::record(&self.state, CounterCall::Reset);
    }

    fn enable(&mut self) {
        let delay = self.state.lock().unwrap().enable_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        MockBackend::record(&self.state, CounterCall::Enable);
    }

    fn disable(&mut self) {
        MockBackend::record(&self.state, CounterCall::Disable);
    }

    fn read(&mut self) -> CounterSample {
        let mut state = self.state.lock().unwrap();
        state.calls.push((CounterCall::Read, Instant::now()));
        // Only requested events report a value
        let mut sample = CounterSample::default();
        for spec in &self.requested {
            sample.set(spec.event, state.counts.get(spec.event));
        }
        sample
    }

    fn close(self: Box<Self>) {
        MockBackend::record(&self.state, CounterCall::Close);
    }
}
