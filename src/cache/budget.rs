//! Daily upstream call budget
//!
//! A soft, in-memory guard: it stops the gateway from calling the provider
//! once the day's ceiling is reached. It is not a rate limiter and it is not
//! persisted; a restart starts the count from zero.

use crate::clock::Clock;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct BudgetState {
    day_key: String,
    calls: u32,
}

impl BudgetState {
    fn release(&mut self, day_key: &str) {
        if self.day_key == day_key {
            self.calls = self.calls.saturating_sub(1);
        }
    }
}

/// One call charged against a given day.
///
/// The charge only sticks once [`BudgetPermit::commit`] runs. A permit that
/// is dropped unsettled (failed call, or a fetch future cancelled mid-call)
/// gives the call back.
#[derive(Debug)]
pub struct BudgetPermit {
    day_key: String,
    state: Arc<Mutex<BudgetState>>,
    settled: bool,
}

impl BudgetPermit {
    /// Keep the charge: the upstream call succeeded
    pub fn commit(mut self) {
        self.settled = true;
    }

    pub fn day_key(&self) -> &str {
        &self.day_key
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        if !self.settled {
            // Permits from a previous day find the count already reset
            self.state.lock().release(&self.day_key);
        }
    }
}

/// Day-scoped call counter keyed by UTC calendar date
pub struct DailyBudget {
    state: Arc<Mutex<BudgetState>>,
    clock: Arc<dyn Clock>,
}

impl DailyBudget {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let day_key = Self::day_key(clock.as_ref());
        Self {
            state: Arc::new(Mutex::new(BudgetState { day_key, calls: 0 })),
            clock,
        }
    }

    /// Charge one call and return the new count
    pub fn increment(&self) -> u32 {
        let mut state = self.state.lock();
        self.rollover_if_needed(&mut state);
        state.calls = state.calls.saturating_add(1);
        state.calls
    }

    /// Calls charged so far today
    pub fn value(&self) -> u32 {
        let mut state = self.state.lock();
        self.rollover_if_needed(&mut state);
        state.calls
    }

    /// Charge one call if the count is still below `ceiling`.
    ///
    /// The comparison and the increment happen under one lock, so concurrent
    /// callers can never push the count past the ceiling.
    pub fn try_reserve(&self, ceiling: u32) -> Option<BudgetPermit> {
        let mut state = self.state.lock();
        self.rollover_if_needed(&mut state);
        if state.calls >= ceiling {
            return None;
        }
        state.calls += 1;
        Some(BudgetPermit {
            day_key: state.day_key.clone(),
            state: self.state.clone(),
            settled: false,
        })
    }

    /// Give back a reserved call whose upstream request did not succeed.
    ///
    /// Permits from a previous day are ignored; that day's count is gone.
    pub fn refund(&self, mut permit: BudgetPermit) {
        let mut state = self.state.lock();
        self.rollover_if_needed(&mut state);
        state.release(&permit.day_key);
        permit.settled = true;
    }

    fn rollover_if_needed(&self, state: &mut BudgetState) {
        let today = Self::day_key(self.clock.as_ref());
        if state.day_key != today {
            tracing::info!(
                "DailyBudget rollover {} -> {} ({} calls charged)",
                state.day_key,
                today,
                state.calls
            );
            state.day_key = today;
            state.calls = 0;
        }
    }

    fn day_key(clock: &dyn Clock) -> String {
        clock.now().format("%Y-%m-%d").to_string()
    }
}
