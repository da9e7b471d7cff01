//! Ladder cycle model: legs, blended cost basis and trailing stop state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, StrategyId};

/// Static configuration of one ladder rung.
///
/// Percentages are in percent units (2.0 == 2%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegConfig {
    /// Cumulative distance from the anchor at which this leg triggers (0 for leg 1)
    pub trigger_distance_pct: Decimal,
    /// Multiplier applied to the sized base notional
    pub size_multiplier: Decimal,
    /// Take-profit on the blended position while this is the active leg
    pub take_profit_pct: Decimal,
    /// Unrealized profit at which the trailing stop activates
    pub trailing_trigger_pct: Decimal,
    /// Distance of the trailing stop behind the peak favorable price
    pub trailing_distance_pct: Decimal,
}

/// One rung of a cycle: static config plus fill state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    /// 1-based position in the ladder
    pub number: usize,
    pub config: LegConfig,
    pub filled: bool,
    pub fill_price: Decimal,
    pub quantity: Decimal,
}

impl Leg {
    pub fn new(number: usize, config: LegConfig) -> Self {
        Self {
            number,
            config,
            filled: false,
            fill_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
        }
    }
}

/// Cycle lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Inactive,
    Leg1Filled,
    LadderActive,
    TrailingActive,
    Closed,
    Aborted,
}

impl CycleStatus {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            CycleStatus::Leg1Filled | CycleStatus::LadderActive | CycleStatus::TrailingActive
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Closed | CycleStatus::Aborted)
    }
}

/// Why a cycle was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    TrailingStop,
    ForcedExit,
}

/// Trailing stop on the blended position.
///
/// Once active the stop only moves in the favorable direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopState {
    pub active: bool,
    /// Most favorable price seen since activation
    pub peak_price: Decimal,
    pub stop_price: Decimal,
}

impl TrailingStopState {
    fn stop_for(price: Decimal, distance_pct: Decimal, direction: Direction) -> Decimal {
        let offset = distance_pct / Decimal::ONE_HUNDRED;
        match direction {
            Direction::Long => price * (Decimal::ONE - offset),
            Direction::Short => price * (Decimal::ONE + offset),
        }
    }

    /// Arm the stop at the current price.
    pub fn activate(&mut self, price: Decimal, distance_pct: Decimal, direction: Direction) {
        self.active = true;
        self.peak_price = price;
        self.stop_price = Self::stop_for(price, distance_pct, direction);
    }

    /// Follow a new favorable extreme. Returns true if the stop moved.
    pub fn advance(&mut self, price: Decimal, distance_pct: Decimal, direction: Direction) -> bool {
        if !self.active {
            return false;
        }

        let new_peak = match direction {
            Direction::Long => price > self.peak_price,
            Direction::Short => price < self.peak_price,
        };
        if !new_peak {
            return false;
        }
        self.peak_price = price;

        let candidate = Self::stop_for(price, distance_pct, direction);
        let tighter = match direction {
            Direction::Long => candidate > self.stop_price,
            Direction::Short => candidate < self.stop_price,
        };
        if tighter {
            self.stop_price = candidate;
        }
        tighter
    }

    pub fn is_crossed(&self, price: Decimal, direction: Direction) -> bool {
        if !self.active {
            return false;
        }
        match direction {
            Direction::Long => price <= self.stop_price,
            Direction::Short => price >= self.stop_price,
        }
    }
}

/// One martingale sequence from first entry to flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: String,
    pub strategy: StrategyId,
    pub direction: Direction,
    pub anchor_price: Decimal,
    pub legs: Vec<Leg>,
    /// Quantity-weighted mean fill price of filled legs
    pub avg_cost: Decimal,
    /// Sum of filled leg quantities
    pub total_quantity: Decimal,
    pub trailing: TrailingStopState,
    pub status: CycleStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn new(
        strategy: StrategyId,
        direction: Direction,
        ladder: &[LegConfig],
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            strategy,
            direction,
            anchor_price: Decimal::ZERO,
            legs: ladder
                .iter()
                .enumerate()
                .map(|(i, cfg)| Leg::new(i + 1, *cfg))
                .collect(),
            avg_cost: Decimal::ZERO,
            total_quantity: Decimal::ZERO,
            trailing: TrailingStopState::default(),
            status: CycleStatus::Inactive,
            opened_at,
            closed_at: None,
        }
    }

    pub fn filled_legs(&self) -> usize {
        self.legs.iter().filter(|l| l.filled).count()
    }

    /// The most recently filled leg; its TP/trailing settings govern exits.
    pub fn active_leg(&self) -> Option<&Leg> {
        self.legs.iter().rev().find(|l| l.filled)
    }

    /// Next unfilled leg, only if every earlier leg is filled.
    pub fn next_leg(&self) -> Option<&Leg> {
        let filled = self.filled_legs();
        self.legs.get(filled).filter(|l| !l.filled)
    }

    /// Record a fill for leg `number` and recompute the blended cost.
    pub fn apply_leg_fill(&mut self, number: usize, price: Decimal, quantity: Decimal) {
        let Some(leg) = self.legs.iter_mut().find(|l| l.number == number) else {
            return;
        };
        leg.filled = true;
        leg.fill_price = price;
        leg.quantity = quantity;

        self.recompute_cost_basis();

        if !self.status.is_terminal() && self.status != CycleStatus::TrailingActive {
            self.status = if self.filled_legs() == 1 {
                CycleStatus::Leg1Filled
            } else {
                CycleStatus::LadderActive
            };
        }
    }

    fn recompute_cost_basis(&mut self) {
        let (qty, cost) = self
            .legs
            .iter()
            .filter(|l| l.filled)
            .fold((Decimal::ZERO, Decimal::ZERO), |(q, c), l| {
                (q + l.quantity, c + l.quantity * l.fill_price)
            });

        self.total_quantity = qty;
        self.avg_cost = if qty.is_zero() { Decimal::ZERO } else { cost / qty };
    }

    /// Unrealized profit on the blended position in percent, sign-adjusted.
    pub fn unrealized_pnl_pct(&self, price: Decimal) -> Decimal {
        if self.avg_cost.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.avg_cost) / self.avg_cost * Decimal::ONE_HUNDRED * self.direction.sign()
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.realized_pnl(price)
    }

    /// PnL of flattening the whole position at `exit_price`.
    pub fn realized_pnl(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.avg_cost) * self.total_quantity * self.direction.sign()
    }

    /// Dollar cost basis of the open position.
    pub fn cost_basis(&self) -> Decimal {
        self.avg_cost * self.total_quantity
    }
}

/// Archived outcome of a retired cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: String,
    pub strategy: StrategyId,
    pub direction: Direction,
    pub legs_filled: usize,
    pub avg_cost: Decimal,
    pub quantity: Decimal,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    /// Realized PnL as a fraction of the cost basis
    pub return_pct: f64,
    pub reason: ExitReason,
    pub status: CycleStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}
