//! Closed-cycle trade records fed into performance tracking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{CycleResult, StrategyId};

/// A completed cycle viewed as a single trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Strategy instance that produced the trade
    pub strategy: StrategyId,

    /// Realized P&L in account currency
    pub pnl: Decimal,

    /// Realized return as a fraction of the cost basis
    pub return_pct: f64,

    /// Number of ladder legs used
    #[serde(default)]
    pub legs: usize,

    /// When the cycle was closed
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(strategy: StrategyId, pnl: Decimal, return_pct: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            strategy,
            pnl,
            return_pct,
            legs: 1,
            timestamp,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.pnl < Decimal::ZERO
    }
}

impl From<&CycleResult> for TradeRecord {
    fn from(result: &CycleResult) -> Self {
        Self {
            strategy: result.strategy.clone(),
            pnl: result.realized_pnl,
            return_pct: result.return_pct,
            legs: result.legs_filled,
            timestamp: result.closed_at,
        }
    }
}
