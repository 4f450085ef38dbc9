//! Hardware barrier model.
//!
//! Every core of a cluster must cross the cluster barrier the same number of
//! times. On silicon a mismatch hangs the cluster; here it is detected and
//! turned into a fault: a core that finishes its task *retires* from the
//! barrier, and any core waiting at (or later arriving at) a barrier with a
//! retired party can never be released. A faulting core *poisons* the
//! barrier so its peers stop waiting.

use parking_lot::{Condvar, Mutex};
use spad_core::{Result, SpadError};

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    retired: usize,
    generation: u64,
    fault: Option<String>,
}

/// A reusable rendezvous point for a fixed number of cores.
#[derive(Debug)]
pub struct HwBarrier {
    name: &'static str,
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl HwBarrier {
    pub fn new(name: &'static str, parties: usize) -> Self {
        Self {
            name,
            parties,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    /// Block until all parties have arrived.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.fault {
            return Err(self.error(reason));
        }
        if state.retired > 0 {
            let reason = format!(
                "barrier count mismatch: {} of {} cores already finished",
                state.retired, self.parties
            );
            state.fault = Some(reason.clone());
            self.released.notify_all();
            return Err(self.error(&reason));
        }

        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && state.fault.is_none() {
            self.released.wait(&mut state);
        }
        if state.generation != generation {
            return Ok(());
        }
        let reason = state.fault.clone().unwrap_or_default();
        Err(self.error(&reason))
    }

    /// Mark one core as done with this barrier for good.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        state.retired += 1;
        if state.arrived > 0 && state.fault.is_none() {
            state.fault = Some(format!(
                "barrier count mismatch: a core finished while {} others wait",
                state.arrived
            ));
            self.released.notify_all();
        }
    }

    /// Release every waiter with an error. The first reason sticks.
    pub fn poison(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.fault.is_none() {
            state.fault = Some(reason.to_string());
        }
        self.released.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().fault.is_some()
    }

    fn error(&self, reason: &str) -> SpadError {
        SpadError::BarrierFault {
            barrier: self.name,
            reason: reason.to_string(),
        }
    }
}
