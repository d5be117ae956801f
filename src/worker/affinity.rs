//! CPU affinity and scheduling priority
//!
//! Workers pin themselves to one logical CPU and raise their scheduling
//! priority for the duration of a run. Both are best effort: a failure is
//! logged and the run continues, since it biases but does not invalidate the
//! measurement.
//!
//! # Platform Support
//!
//! [`OsCpuControl`] uses `sched_setaffinity` and `setpriority` on Linux. On
//! other platforms every operation returns an error, which workers log.
//!
//! # Example
//!
//! ```no_run
//! use memprobe::worker::affinity::{parse_cpu_list, OsCpuControl, RunGuard};
//!
//! let cores = parse_cpu_list("0,2-4").unwrap();
//! {
//!     let _guard = RunGuard::acquire(&OsCpuControl, cores[0]);
//!     // ... timed work pinned to cores[0] at raised priority ...
//! } // previous affinity and priority restored here
//! ```

use crate::Result;
use anyhow::Context;
use std::sync::Mutex;

/// CPU set the thread was allowed on before pinning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityToken {
    cpus: Vec<usize>,
}

impl AffinityToken {
    pub fn new(cpus: Vec<usize>) -> Self {
        Self { cpus }
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }
}

/// Scheduling priority in effect before a boost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityToken {
    nice: i32,
}

impl PriorityToken {
    pub fn new(nice: i32) -> Self {
        Self { nice }
    }

    pub fn nice(&self) -> i32 {
        self.nice
    }
}

/// OS resource control used by workers
///
/// All operations apply to the calling thread.
pub trait CpuControl: Send + Sync {
    /// Restrict the calling thread to one logical CPU
    ///
    /// The token holds the CPU set in effect before the call.
    fn pin(&self, cpu: usize) -> Result<AffinityToken>;

    /// Restore the CPU set captured by [`pin`](Self::pin)
    fn unpin(&self, token: AffinityToken) -> Result<()>;

    /// Raise scheduling priority; the token restores the previous one
    ///
    /// On error the priority was left untouched and there is nothing to revert.
    fn boost_priority(&self) -> Result<PriorityToken>;

    /// Restore the priority captured in `token`
    fn revert_priority(&self, token: PriorityToken) -> Result<()>;
}

/// Pinning and priority held for the duration of a run
///
/// Dropping the guard releases whatever was acquired, so every exit path of a
/// run restores the thread's previous affinity and priority.
pub struct RunGuard<'a> {
    control: &'a dyn CpuControl,
    cpu: usize,
    affinity: Option<AffinityToken>,
    priority: Option<PriorityToken>,
}

impl<'a> RunGuard<'a> {
    pub fn acquire(control: &'a dyn CpuControl, cpu: usize) -> Self {
        let affinity = match control.pin(cpu) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(cpu, error = %format!("{:#}", e), "failed to pin thread to logical CPU; results may be skewed");
                None
            }
        };

        let priority = match control.boost_priority() {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "failed to boost scheduling priority; running with elevated privileges may help");
                None
            }
        };

        Self {
            control,
            cpu,
            affinity,
            priority,
        }
    }

    /// Whether pinning succeeded
    pub fn pinned(&self) -> bool {
        self.affinity.is_some()
    }

    /// Whether the priority boost succeeded
    pub fn boosted(&self) -> bool {
        self.priority.is_some()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.affinity.take() {
            if let Err(e) = self.control.unpin(token) {
                tracing::warn!(cpu = self.cpu, error = %format!("{:#}", e), "failed to unpin thread");
            }
        }
        if let Some(token) = self.priority.take() {
            if let Err(e) = self.control.revert_priority(token) {
                tracing::warn!(error = %format!("{:#}", e), "failed to revert scheduling priority");
            }
        }
    }
}

/// Operating system backend
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCpuControl;

/// Nice value requested by [`OsCpuControl::boost_priority`]
pub const BOOSTED_NICE: i32 = -20;

#[cfg(target_os = "linux")]
fn current_tid() -> libc::id_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::id_t }
}

#[cfg(target_os = "linux")]
impl CpuControl for OsCpuControl {
    fn pin(&self, cpu: usize) -> Result<AffinityToken> {
        let previous = current_cpu_affinity()?;
        set_cpu_affinity(&[cpu])?;
        Ok(AffinityToken::new(previous))
    }

    fn unpin(&self, token: AffinityToken) -> Result<()> {
        set_cpu_affinity(token.cpus())
    }

    fn boost_priority(&self) -> Result<PriorityToken> {
        let tid = current_tid();

        // getpriority can legitimately return -1, so errno is the only failure signal
        let previous = unsafe {
            *libc::__errno_location() = 0;
            let nice = libc::getpriority(libc::PRIO_PROCESS, tid);
            if nice == -1 && *libc::__errno_location() != 0 {
                None
            } else {
                Some(nice)
            }
        };
        let Some(previous) = previous else {
            let err = std::io::Error::last_os_error();
            return Err(err).context("Failed to read current scheduling priority");
        };

        let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, BOOSTED_NICE) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("Failed to set nice value {}", BOOSTED_NICE));
        }
        Ok(PriorityToken::new(previous))
    }

    fn revert_priority(&self, token: PriorityToken) -> Result<()> {
        let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, current_tid(), token.nice) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("Failed to restore nice value {}", token.nice));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl CpuControl for OsCpuControl {
    fn pin(&self, _cpu: usize) -> Result<AffinityToken> {
        anyhow::bail!("CPU affinity is only supported on Linux")
    }

    fn unpin(&self, _token: AffinityToken) -> Result<()> {
        anyhow::bail!("CPU affinity is only supported on Linux")
    }

    fn boost_priority(&self) -> Result<PriorityToken> {
        anyhow::bail!("priority control is only supported on Linux")
    }

    fn revert_priority(&self, _token: PriorityToken) -> Result<()> {
        anyhow::bail!("priority control is only supported on Linux")
    }
}

/// Call recorded by [`RecordingCpuControl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    Pin(usize),
    Unpin,
    Boost,
    Revert(PriorityToken),
}

/// CPU set [`RecordingCpuControl`] reports as the pre-pin affinity
const RECORDED_CPUS: &[usize] = &[0, 1, 2, 3];

/// In-memory backend that records calls, for tests
#[derive(Debug, Default)]
pub struct RecordingCpuControl {
    calls: Mutex<Vec<ControlCall>>,
    fail_pin: bool,
    fail_boost: bool,
}

impl RecordingCpuControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose pin and boost both fail
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_pin: true,
            fail_boost: true,
        }
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: ControlCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CpuControl for RecordingCpuControl {
    fn pin(&self, cpu: usize) -> Result<AffinityToken> {
        self.record(ControlCall::Pin(cpu));
        if self.fail_pin {
            anyhow::bail!("pin to CPU {} denied", cpu);
        }
        Ok(AffinityToken::new(RECORDED_CPUS.to_vec()))
    }

    fn unpin(&self, token: AffinityToken) -> Result<()> {
        if token.cpus() != RECORDED_CPUS {
            anyhow::bail!("unpin got CPU set {:?}, not the one captured by pin", token.cpus());
        }
        self.record(ControlCall::Unpin);
        Ok(())
    }

    fn boost_priority(&self) -> Result<PriorityToken> {
        self.record(ControlCall::Boost);
        if self.fail_boost {
            anyhow::bail!("priority boost denied");
        }
        Ok(PriorityToken::new(5))
    }

    fn revert_priority(&self, token: PriorityToken) -> Result<()> {
        self.record(ControlCall::Revert(token));
        Ok(())
    }
}

/// Set CPU affinity for the current thread
///
/// # Errors
///
/// Returns an error if the list is empty, a core ID is 1024 or above, or
/// the syscall fails.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cores: &[usize]) -> Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut cpu_set);

        for &core in cores {
            if core >= 1024 {
                anyhow::bail!("CPU core ID {} is too large (max 1023)", core);
            }
            CPU_SET(core, &mut cpu_set);
        }

        let result = sched_setaffinity(
            0, // 0 = current thread
            mem::size_of::<cpu_set_t>(),
            &cpu_set,
        );

        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("Failed to set CPU affinity to cores {:?}", cores));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cores: &[usize]) -> Result<()> {
    anyhow::bail!("CPU affinity is only supported on Linux")
}

/// CPUs the current thread may run on, in ascending order
#[cfg(target_os = "linux")]
pub fn current_cpu_affinity() -> Result<Vec<usize>> {
    use libc::{cpu_set_t, sched_getaffinity, CPU_ISSET, CPU_SETSIZE};
    use std::mem;

    let cpu_set = unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        if sched_getaffinity(0, mem::size_of::<cpu_set_t>(), &mut cpu_set) != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context("Failed to read CPU affinity");
        }
        cpu_set
    };

    let cpus: Vec<usize> = (0..CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { CPU_ISSET(cpu, &cpu_set) })
        .collect();
    if cpus.is_empty() {
        anyhow::bail!("CPU affinity mask is empty");
    }
    Ok(cpus)
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu_affinity() -> Result<Vec<usize>> {
    anyhow::bail!("CPU affinity is only supported on Linux")
}

/// Parse a comma-separated list of CPU cores or ranges
///
/// Supports formats like "0,1,2,3", "0-3" and "0,2-4,7".
///
/// # Example
///
/// ```
/// use memprobe::worker::affinity::parse_cpu_list;
///
/// let cores = parse_cpu_list("0,2-4,7").unwrap();
/// assert_eq!(cores, vec![0, 2, 3, 4, 7]);
/// ```
pub fn parse_cpu_list(spec: &str) -> Result<Vec<usize>> {
    let mut cores = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();

        if part.contains('-') {
            let range_parts: Vec<&str> = part.split('-').collect();
            if range_parts.len() != 2 {
                anyhow::bail!("Invalid CPU range format: {}", part);
            }

            let start: usize = range_parts[0]
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", range_parts[0]))?;
            let end: usize = range_parts[1]
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", range_parts[1]))?;

            if start > end {
                anyhow::bail!("Invalid CPU range: start ({}) > end ({})", start, end);
            }

            cores.extend(start..=end);
        } else {
            let core: usize = part
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", part))?;
            cores.push(core);
        }
    }

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    cores.sort_unstable();
    cores.dedup();

    Ok(cores)
}

/// Number of logical CPUs available
pub fn num_cpus() -> usize {
    num_cpus::get()
}
