//! Admission gate
//!
//! Counts commands from admission to completion and implements the
//! freeze/drain/unfreeze half of the quiesce protocol.
//!
//! ```text
//!   submit ──enter()──▶ in_flight += 1 ──▶ ... ──▶ complete ──▶ in_flight -= 1
//!                 ▲
//!                 └── blocks while frozen
//!
//!   freeze(): frozen += 1, wait until in_flight == 0
//!   drop(FreezeGuard): frozen -= 1, wake blocked submitters
//! ```
//!
//! A completion callback still holds its command's token, so a freeze is
//! waiting on it. Commands submitted from inside such a callback are
//! admitted anyway and drained by the same freeze.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{LoopError, Result};

thread_local! {
    /// Gates whose completion callbacks are running on this thread
    static COMPLETING: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

#[derive(Debug, Default)]
struct GateState {
    frozen: u32,
    in_flight: usize,
    /// Bumped on every admitted write
    writes: u64,
    /// Bumped on every completed write
    writes_done: u64,
}

#[derive(Debug, Default)]
pub(crate) struct IoGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl IoGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn completing_here(&self) -> bool {
        let addr = self.addr();
        COMPLETING.with(|c| c.borrow().contains(&addr))
    }

    /// Admit one command, waiting out any freeze
    pub(crate) fn enter(self: &Arc<Self>, write: bool) -> GateToken {
        let reentrant = self.completing_here();
        let mut state = self.state.lock();
        while state.frozen > 0 && !reentrant {
            self.cond.wait(&mut state);
        }
        state.in_flight += 1;
        if write {
            state.writes = state.writes.wrapping_add(1);
        }
        GateToken {
            gate: self.clone(),
            write,
        }
    }

    /// Stop admission and wait for every admitted command to complete
    pub(crate) fn freeze(&self) -> FreezeGuard<'_> {
        let mut state = self.state.lock();
        state.frozen += 1;
        while state.in_flight > 0 {
            self.cond.wait(&mut state);
        }
        FreezeGuard { gate: self }
    }

    /// Run `sync`, then freeze. Any write admitted or completed from just
    /// before `sync` until the drain finishes may have left unsynced data
    /// behind; in that case admission reopens and the caller must retry.
    pub(crate) fn freeze_clean(&self, sync: impl FnOnce() -> Result<()>) -> Result<FreezeGuard<'_>> {
        let before = self.write_counts();
        sync()?;
        let frozen = self.freeze();
        if self.write_counts() != before {
            return Err(LoopError::Retryable);
        }
        Ok(frozen)
    }

    /// Count of admitted writes so far
    #[cfg(test)]
    pub(crate) fn write_generation(&self) -> u64 {
        self.state.lock().writes
    }

    fn write_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.writes, state.writes_done)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    #[cfg(test)]
    pub(crate) fn is_frozen(&self) -> bool {
        self.state.lock().frozen > 0
    }

    fn leave(&self, write: bool) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if write {
            state.writes_done = state.writes_done.wrapping_add(1);
        }
        if state.in_flight == 0 {
            self.cond.notify_all();
        }
    }

    fn unfreeze(&self) {
        let mut state = self.state.lock();
        state.frozen -= 1;
        if state.frozen == 0 {
            self.cond.notify_all();
        }
    }
}

/// Proof of admission; completing a command drops it
#[derive(Debug)]
pub(crate) struct GateToken {
    gate: Arc<IoGate>,
    write: bool,
}

impl GateToken {
    /// Run a completion callback while this token is still held
    pub(crate) fn complete_with<R>(self, f: impl FnOnce() -> R) -> R {
        let addr = self.gate.addr();
        COMPLETING.with(|c| c.borrow_mut().push(addr));
        let _pop = CompletingGuard;
        f()
    }
}

struct CompletingGuard;

impl Drop for CompletingGuard {
    fn drop(&mut self) {
        COMPLETING.with(|c| {
            c.borrow_mut().pop();
        });
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        self.gate.leave(self.write);
    }
}

/// Admission stays closed while this guard lives
pub(crate) struct FreezeGuard<'a> {
    gate: &'a IoGate,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.gate.unfreeze();
    }
}
