//! Rendezvous for co-running load workers
//!
//! The controller creates one coordinator per aggregate-bandwidth run and hands
//! an `Arc` of it to every participating [`LoadWorker`](super::load::LoadWorker).
//! Each participant waits twice: once before priming the full region and once
//! right before its timed loop.
//!
//! A participant that fails before its timed loop calls
//! [`abort`](BarrierCoordinator::abort). Every current and later waiter then
//! gets [`WorkerError::RendezvousAborted`] instead of blocking on a party that
//! will never arrive.

use crate::error::WorkerError;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// N-party barrier shared by reference among load workers
#[derive(Debug)]
pub struct BarrierCoordinator {
    state: Mutex<RendezvousState>,
    released: Condvar,
    parties: usize,
}

impl BarrierCoordinator {
    /// A coordinator for `parties` workers (at least one)
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState::default()),
            released: Condvar::new(),
            parties: parties.max(1),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    fn lock(&self) -> MutexGuard<'_, RendezvousState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every party has arrived
    ///
    /// Returns true for exactly one party per rendezvous.
    ///
    /// # Errors
    ///
    /// [`WorkerError::RendezvousAborted`] once any party has aborted, unless
    /// this rendezvous was already complete.
    pub fn wait(&self) -> Result<bool, WorkerError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(WorkerError::RendezvousAborted);
        }

        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(true);
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            return Err(WorkerError::RendezvousAborted);
        }
        Ok(false)
    }

    /// Release every waiter with an error and fail all later waits
    pub fn abort(&self) {
        let mut state = self.lock();
        if !state.aborted {
            tracing::warn!(parties = self.parties, "load rendezvous aborted by a failing worker");
        }
        state.aborted = true;
        self.released.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_party_never_blocks() {
        let coordinator = BarrierCoordinator::new(0);
        assert_eq!(coordinator.parties(), 1);
        assert!(coordinator.wait().unwrap());
        assert!(coordinator.wait().unwrap());
    }

    #[test]
    fn test_all_parties_arrive_before_release() {
        let parties = 4;
        let coordinator = Arc::new(BarrierCoordinator::new(parties));
        let arrived = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..parties)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let arrived = Arc::clone(&arrived);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    for round in 1..=2 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        if coordinator.wait().unwrap() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(arrived.load(Ordering::SeqCst) >= round * parties);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_abort_releases_blocked_waiter() {
        let coordinator = Arc::new(BarrierCoordinator::new(2));
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.wait())
        };

        thread::sleep(Duration::from_millis(20));
        coordinator.abort();

        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Err(WorkerError::RendezvousAborted)));
        assert!(coordinator.is_aborted());
    }

    #[test]
    fn test_wait_after_abort_fails_fast() {
        let coordinator = BarrierCoordinator::new(3);
        coordinator.abort();
        assert!(matches!(coordinator.wait(), Err(WorkerError::RendezvousAborted)));
    }
}
