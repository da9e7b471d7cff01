//! Session-wide gate on new cycles.
//!
//! The guard only decides whether a NEW cycle may open. It never closes an
//! open ladder itself; the emergency check tells the session when to
//! force-exit everything.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::config::GuardConfig;

#[derive(Debug)]
struct GuardState {
    open_cycles: usize,
    day: Option<NaiveDate>,
    daily_pnl: Decimal,
    daily_cycles: u32,
    /// Set by the daily loss limit, lifted on day rollover
    daily_halt: bool,
    /// Set by `halt`, lifted only by `resume`
    manual_halt: Option<String>,
}

impl GuardState {
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day == Some(today) {
            return;
        }
        if self.day.is_some() {
            info!(
                day = %today,
                previous_pnl = %self.daily_pnl,
                previous_cycles = self.daily_cycles,
                "New trading day, daily counters reset"
            );
        }
        self.day = Some(today);
        self.daily_pnl = Decimal::ZERO;
        self.daily_cycles = 0;
        self.daily_halt = false;
    }
}

/// Concurrent-cycle, daily and emergency limits for one session.
pub struct SessionGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
}

impl SessionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState {
                open_cycles: 0,
                day: None,
                daily_pnl: Decimal::ZERO,
                daily_cycles: 0,
                daily_halt: false,
                manual_halt: None,
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Whether a new cycle may open at `now`; the error names the limit hit.
    pub fn can_start_cycle(&self, now: DateTime<Utc>) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll_day(now);

        if let Some(reason) = &state.manual_halt {
            return Err(format!("Trading halted: {}", reason));
        }

        if state.open_cycles >= self.config.max_concurrent_cycles {
            return Err(format!(
                "Open cycles {} at limit {}",
                state.open_cycles, self.config.max_concurrent_cycles
            ));
        }

        if self.config.enable_daily_limits {
            if state.daily_halt || state.daily_pnl <= -self.config.daily_loss_limit {
                state.daily_halt = true;
                return Err(format!(
                    "Daily loss {} exceeds limit {}",
                    -state.daily_pnl, self.config.daily_loss_limit
                ));
            }
            if state.daily_cycles >= self.config.max_cycles_per_day {
                return Err(format!(
                    "Daily cycle count {} at limit {}",
                    state.daily_cycles, self.config.max_cycles_per_day
                ));
            }
        }

        Ok(())
    }

    pub fn register_cycle_start(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll_day(now);
        state.open_cycles += 1;
    }

    /// Give back a slot whose cycle was dropped before any fill.
    pub fn release_cycle_slot(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open_cycles = state.open_cycles.saturating_sub(1);
    }

    /// Record a retired cycle and its realized P&L.
    pub fn register_cycle_end(&self, pnl: Decimal, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll_day(now);
        state.open_cycles = state.open_cycles.saturating_sub(1);
        state.daily_pnl += pnl;
        state.daily_cycles += 1;

        if self.config.enable_daily_limits
            && !state.daily_halt
            && state.daily_pnl <= -self.config.daily_loss_limit
        {
            state.daily_halt = true;
            warn!(
                daily_pnl = %state.daily_pnl,
                limit = %self.config.daily_loss_limit,
                "Daily loss limit reached, new cycles halted"
            );
        }
    }

    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Trading halted");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.manual_halt = Some(reason);
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.manual_halt = None;
        state.daily_halt = false;
        info!("Trading resumed");
    }

    pub fn is_halted(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.manual_halt.is_some() || state.daily_halt
    }

    pub fn open_cycles(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).open_cycles
    }

    /// Realized P&L of the current UTC day.
    pub fn daily_pnl(&self) -> Decimal {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).daily_pnl
    }

    /// True when the session should flatten every open cycle.
    pub fn should_emergency_exit(&self, total_loss: Decimal, drawdown_pct: f64) -> bool {
        if !self.config.enable_emergency_exit {
            return false;
        }
        total_loss >= self.config.emergency_loss_threshold
            || drawdown_pct >= self.config.emergency_drawdown_threshold
    }
}
