//! Linux perf_event backend
//!
//! Opens one raw (`PERF_TYPE_RAW`) counter per requested event for the calling
//! thread on any CPU, through `perf_event2`. Counters are built disabled and
//! are only switched on by [`CounterHandles::enable`].

use super::{CounterBackend, CounterHandles, CounterSample, EventSpec};
use crate::error::CounterError;

/// perf_event_open backend for raw memory events
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfBackend;

impl PerfBackend {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
fn open_raw(spec: &EventSpec) -> std::io::Result<::perf_event2::Counter> {
    use ::perf_event2::events::Raw;
    use ::perf_event2::Builder;

    // Builders observe the calling thread on any CPU and start disabled
    Builder::new(Raw::new(spec.raw)).build()
}

#[cfg(target_os = "linux")]
struct PerfHandles {
    counters: Vec<(EventSpec, ::perf_event2::Counter)>,
}

#[cfg(target_os = "linux")]
impl PerfHandles {
    fn control(
        &mut self,
        what: &str,
        op: impl Fn(&mut ::perf_event2::Counter) -> std::io::Result<()>,
    ) {
        for (spec, counter) in &mut self.counters {
            if let Err(e) = op(counter) {
                tracing::warn!(event = %spec.event, error = %e, "perf {} failed", what);
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl CounterBackend for PerfBackend {
    fn open(&self, specs: &[EventSpec]) -> Result<Box<dyn CounterHandles>, CounterError> {
        let mut counters = Vec::with_capacity(specs.len());
        for spec in specs {
            // Counters opened so far close when `counters` drops on error
            let counter = open_raw(spec).map_err(|source| CounterError::Open {
                event: spec.event,
                raw: spec.raw,
                source,
            })?;
            counters.push((*spec, counter));
        }
        tracing::debug!(events = counters.len(), "opened perf counters");
        Ok(Box::new(PerfHandles { counters }))
    }
}

#[cfg(target_os = "linux")]
impl CounterHandles for PerfHandles {
    fn reset(&mut self) {
        self.control("reset", |c| c.reset());
    }

    fn enable(&mut self) {
        self.control("enable", |c| c.enable());
    }

    fn disable(&mut self) {
        self.control("disable", |c| c.disable());
    }

    fn read(&mut self) -> CounterSample {
        let mut sample = CounterSample::default();
        for (spec, counter) in &mut self.counters {
            match counter.read() {
                Ok(value) => sample.set(spec.event, value),
                Err(e) => tracing::warn!(event = %spec.event, error = %e, "perf read failed"),
            }
        }
        sample
    }

    fn close(self: Box<Self>) {
        drop(self);
    }
}

#[cfg(not(target_os = "linux"))]
impl CounterBackend for PerfBackend {
    fn open(&self, _specs: &[EventSpec]) -> Result<Box<dyn CounterHandles>, CounterError> {
        Err(CounterError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterEvent;

    #[test]
    fn test_open_empty_set() {
        // Nothing to open, so this succeeds on Linux regardless of privilege
        let result = PerfBackend::new().open(&[]);
        #[cfg(target_os = "linux")]
        assert!(result.is_ok());
        #[cfg(not(target_os = "linux"))]
        assert!(result.is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_raw_event() {
        // May fail without privilege or PMU access; the error must then explain why
        let spec = EventSpec {
            event: CounterEvent::LocalDramAccess,
            raw: 0x1d3,
        };
        match PerfBackend::new().open(&[spec]) {
            Ok(mut handles) => {
                handles.reset();
                handles.enable();
                handles.disable();
                let _ = handles.read();
                handles.close();
            }
            Err(e) => {
                assert!(matches!(e, CounterError::Open { event: CounterEvent::LocalDramAccess, raw: 0x1d3, .. }));
                assert!(e.to_string().contains("perf_event_paranoid"));
            }
        }
    }
}
