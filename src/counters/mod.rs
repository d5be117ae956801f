//! Hardware performance counter sampling
//!
//! Workers attribute measured time to real memory traffic by sampling a fixed
//! set of raw performance-monitoring events around the measured loop. Counting
//! never covers the dummy loop.
//!
//! # Protocol
//!
//! 1. `CounterBackend::open()` with the event specs for the measurement
//! 2. `reset()` + `enable()` right before the measured loop
//! 3. `disable()` + `read()` right after it
//! 4. `close()` (or drop) before the dummy loop starts
//!
//! A backend that cannot open its events is a hard error: a run with a silently
//! degraded counter set would publish misleading numbers.

pub mod mock;
pub mod perf;

use crate::config::{CounterBackendKind, CounterConfig};
use crate::error::CounterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Memory traffic events sampled by workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterEvent {
    LocalDramAccess,
    LocalPmemAccess,
    RemoteDramAccess,
    RemotePmemAccess,
    /// Throughput measurements only
    WritePendingQueueOccupancy,
    /// Throughput measurements only
    ReadPendingQueueOccupancy,
}

impl CounterEvent {
    /// Number of events in the enumeration
    pub const COUNT: usize = 6;

    /// Every event, in index order
    pub const ALL: [CounterEvent; Self::COUNT] = [
        CounterEvent::LocalDramAccess,
        CounterEvent::LocalPmemAccess,
        CounterEvent::RemoteDramAccess,
        CounterEvent::RemotePmemAccess,
        CounterEvent::WritePendingQueueOccupancy,
        CounterEvent::ReadPendingQueueOccupancy,
    ];

    /// Events sampled by latency measurements
    pub const ACCESS_EVENTS: [CounterEvent; 4] = [
        CounterEvent::LocalDramAccess,
        CounterEvent::LocalPmemAccess,
        CounterEvent::RemoteDramAccess,
        CounterEvent::RemotePmemAccess,
    ];

    /// Position of this event in a [`CounterSample`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable snake_case name, also used as the config override key
    pub fn name(self) -> &'static str {
        match self {
            CounterEvent::LocalDramAccess => "local_dram_access",
            CounterEvent::LocalPmemAccess => "local_pmem_access",
            CounterEvent::RemoteDramAccess => "remote_dram_access",
            CounterEvent::RemotePmemAccess => "remote_pmem_access",
            CounterEvent::WritePendingQueueOccupancy => "write_pending_queue_occupancy",
            CounterEvent::ReadPendingQueueOccupancy => "read_pending_queue_occupancy",
        }
    }

    /// Look up an event by its [`name`](Self::name)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.name() == name)
    }

    /// Default raw event code (Intel server uncore/offcore encodings)
    pub fn default_raw(self) -> u64 {
        match self {
            CounterEvent::LocalDramAccess => 0x1d3,
            CounterEvent::LocalPmemAccess => 0x80d1,
            CounterEvent::RemoteDramAccess => 0x2d3,
            CounterEvent::RemotePmemAccess => 0x10d3,
            CounterEvent::WritePendingQueueOccupancy => 0x81,
            CounterEvent::ReadPendingQueueOccupancy => 0x80,
        }
    }
}

impl fmt::Display for CounterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A raw event requested at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    pub event: CounterEvent,
    pub raw: u64,
}

/// Accumulated count per event
///
/// Events that were not requested stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    counts: [u64; CounterEvent::COUNT],
}

impl CounterSample {
    pub fn get(&self, event: CounterEvent) -> u64 {
        self.counts[event.index()]
    }

    pub fn set(&mut self, event: CounterEvent, value: u64) {
        self.counts[event.index()] = value;
    }

    /// Iterate over `(event, count)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (CounterEvent, u64)> + '_ {
        CounterEvent::ALL.iter().map(move |&e| (e, self.get(e)))
    }

    /// Total accesses across the four access events
    pub fn total_accesses(&self) -> u64 {
        CounterEvent::ACCESS_EVENTS
            .iter()
            .map(|&e| self.get(e))
            .fold(0u64, u64::saturating_add)
    }
}

/// Opens a set of counters for the calling thread
pub trait CounterBackend: Send + Sync {
    /// Open every event in `specs`, or fail without leaving any open
    fn open(&self, specs: &[EventSpec]) -> Result<Box<dyn CounterHandles>, CounterError>;
}

/// Open counters owned by one worker thread
///
/// Control calls are issued outside timed sections. Failures after a successful
/// open are logged by the backend rather than returned.
pub trait CounterHandles: Send {
    fn reset(&mut self);
    fn enable(&mut self);
    fn disable(&mut self);
    fn read(&mut self) -> CounterSample;
    fn close(self: Box<Self>);
}

/// Backend for runs where the operator explicitly disabled counters
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

struct NullHandles;

impl CounterBackend for NullBackend {
    fn open(&self, _specs: &[EventSpec]) -> Result<Box<dyn CounterHandles>, CounterError> {
        Ok(Box::new(NullHandles))
    }
}

impl CounterHandles for NullHandles {
    fn reset(&mut self) {}
    fn enable(&mut self) {}
    fn disable(&mut self) {}
    fn read(&mut self) -> CounterSample {
        CounterSample::default()
    }
    fn close(self: Box<Self>) {}
}

/// Build the backend selected by the configuration
pub fn backend_for(config: &CounterConfig) -> Arc<dyn CounterBackend> {
    match config.backend {
        CounterBackendKind::Perf => Arc::new(perf::PerfBackend::new()),
        CounterBackendKind::None => {
            tracing::warn!("hardware counters disabled by configuration; counts will read zero");
            Arc::new(NullBackend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_indices_match_all() {
        for (i, event) in CounterEvent::ALL.iter().enumerate() {
            assert_eq!(event.index(), i);
        }
    }

    #[test]
    fn test_event_name_roundtrip() {
        for event in CounterEvent::ALL {
            assert_eq!(CounterEvent::from_name(event.name()), Some(event));
        }
        assert_eq!(CounterEvent::from_name("l3_miss"), None);
    }

    #[test]
    fn test_default_raw_codes() {
        assert_eq!(CounterEvent::LocalDramAccess.default_raw(), 0x1d3);
        assert_eq!(CounterEvent::LocalPmemAccess.default_raw(), 0x80d1);
        assert_eq!(CounterEvent::RemoteDramAccess.default_raw(), 0x2d3);
        assert_eq!(CounterEvent::RemotePmemAccess.default_raw(), 0x10d3);
    }

    #[test]
    fn test_sample_total_accesses_ignores_occupancy() {
        let mut sample = CounterSample::default();
        sample.set(CounterEvent::LocalDramAccess, 10);
        sample.set(CounterEvent::RemotePmemAccess, 5);
        sample.set(CounterEvent::ReadPendingQueueOccupancy, 1000);
        assert_eq!(sample.total_accesses(), 15);
        assert_eq!(sample.iter().count(), CounterEvent::COUNT);
    }

    #[test]
    fn test_null_backend_reads_zero() {
        let mut handles = NullBackend.open(&[]).unwrap();
        handles.reset();
        handles.enable();
        handles.disable();
        assert_eq!(handles.read(), CounterSample::default());
        handles.close();
    }
}
