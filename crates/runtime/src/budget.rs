//! Daemon-wide token budgets with tentative reservations.

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;

/// Tentative charge taken at admission so two concurrent runs cannot both
/// pass a near-full budget check before either records actual usage.
const RESERVATION: u64 = 1;

struct TrackerState {
    total_consumed: u64,
    daily_consumed: u64,
    last_reset_date: NaiveDate,
    pending_reservations: u64,
}

pub struct TokenTracker {
    lifetime_budget: Option<u64>,
    daily_budget: Option<u64>,
    state: Mutex<TrackerState>,
}

impl TokenTracker {
    pub fn new(lifetime_budget: Option<u64>, daily_budget: Option<u64>) -> Self {
        Self {
            lifetime_budget,
            daily_budget,
            state: Mutex::new(TrackerState {
                total_consumed: 0,
                daily_consumed: 0,
                last_reset_date: Utc::now().date_naive(),
                pending_reservations: 0,
            }),
        }
    }

    /// Atomically check the budgets and reserve one token. Returns
    /// `Err(reason)` when a budget is exhausted.
    pub fn check_before_run(&self) -> Result<(), String> {
        let mut state = self.state.lock();
        let today = Utc::now().date_naive();
        if today > state.last_reset_date {
            state.daily_consumed = 0;
            state.last_reset_date = today;
        }
        if let Some(budget) = self.lifetime_budget {
            if state.total_consumed >= budget {
                return Err(format!(
                    "Lifetime budget exhausted ({}/{} tokens)",
                    state.total_consumed, budget
                ));
            }
        }
        if let Some(budget) = self.daily_budget {
            if state.daily_consumed >= budget {
                return Err(format!(
                    "Daily budget exhausted ({}/{} tokens)",
                    state.daily_consumed, budget
                ));
            }
        }
        state.total_consumed += RESERVATION;
        state.daily_consumed += RESERVATION;
        state.pending_reservations += 1;
        Ok(())
    }

    /// Record actual usage, netting out one outstanding reservation if any.
    pub fn record_usage(&self, tokens: u64) {
        let mut state = self.state.lock();
        if state.pending_reservations > 0 {
            state.pending_reservations -= 1;
            // The reservation already counted 1; add the remainder. Usage
            // below the reservation rolls the counters back accordingly.
            state.total_consumed = state.total_consumed + tokens - RESERVATION;
            state.daily_consumed = state.daily_consumed + tokens - RESERVATION;
        } else {
            state.total_consumed += tokens;
            state.daily_consumed += tokens;
        }
    }

    pub fn total_consumed(&self) -> u64 {
        self.state.lock().total_consumed
    }

    pub fn daily_consumed(&self) -> u64 {
        self.state.lock().daily_consumed
    }

    pub fn pending_reservations(&self) -> u64 {
        self.state.lock().pending_reservations
    }
}
