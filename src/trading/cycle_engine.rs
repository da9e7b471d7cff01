//! Per-instance ladder state machine.
//!
//! One `CycleEngine` drives one strategy instance: it opens a cycle on an
//! entry signal, adds legs as price reaches each leg's cumulative trigger,
//! tracks the blended cost basis, and closes the cycle on take-profit or a
//! trailing stop. There is deliberately no stop-loss: a cycle whose legs are
//! exhausted stays open until one of the two exits is hit or it is forced out.
//!
//! The engine never talks to a broker. It returns at most one `OrderIntent`
//! per tick and keeps at most one order in flight; placement results and
//! fills are fed back through `on_order_placed`, `on_order_failed` and
//! `on_fill`. A forced exit never abandons an order the broker has
//! acknowledged: it waits for that order to resolve, then flattens the whole
//! position including whatever the order filled.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::StrategySettings;
use crate::models::{
    AnchorMode, Cycle, CycleResult, CycleStatus, Direction, ExitReason, Fill, LadderGeometry,
    LegConfig, OrderAction, OrderPurpose, OrderRequest, OrderType, StrategyId, StrategyKind,
};

/// Archived results kept per instance.
const MAX_CYCLE_HISTORY: usize = 500;

/// An order the engine wants placed.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub strategy: StrategyId,
    pub purpose: OrderPurpose,
    pub action: OrderAction,
    pub order_type: OrderType,
    /// Price at decision time
    pub reference_price: Decimal,
    /// Fixed quantity for exits; `None` when the leg still has to be sized
    pub quantity: Option<Decimal>,
    /// Leg size multiplier passed to the sizer
    pub size_multiplier: Decimal,
}

impl OrderIntent {
    pub fn needs_sizing(&self) -> bool {
        self.quantity.is_none()
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.purpose, OrderPurpose::Exit(_))
    }

    pub fn into_request(self, quantity: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: self.strategy.symbol.clone(),
            action: self.action,
            quantity,
            order_type: self.order_type,
            reference_price: self.reference_price,
            strategy: self.strategy,
            purpose: self.purpose,
        }
    }
}

/// The single order an engine may have in flight.
#[derive(Debug, Clone)]
struct PendingOrder {
    purpose: OrderPurpose,
    order_id: Option<String>,
}

/// Reporting view of an instance's open cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStatusReport {
    pub strategy: StrategyId,
    pub status: CycleStatus,
    pub legs_filled: usize,
    pub total_legs: usize,
    pub anchor_price: Decimal,
    pub avg_cost: Decimal,
    pub quantity: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub trailing_stop: Option<Decimal>,
    pub next_leg_trigger: Option<Decimal>,
    pub order_pending: bool,
}

impl std::fmt::Display for CycleStatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<16} {:<16} legs {}/{} avg {:.4} qty {:.4} pnl {:.2} ({:.2}%)",
            self.strategy.to_string(),
            format!("{:?}", self.status),
            self.legs_filled,
            self.total_legs,
            self.avg_cost,
            self.quantity,
            self.unrealized_pnl,
            self.unrealized_pnl_pct
        )?;
        if let Some(stop) = self.trailing_stop {
            write!(f, " stop {:.4}", stop)?;
        }
        if let Some(trigger) = self.next_leg_trigger {
            write!(f, " next {:.4}", trigger)?;
        }
        Ok(())
    }
}

/// Ladder state machine for one strategy instance.
pub struct CycleEngine {
    id: StrategyId,
    settings: StrategySettings,
    geometry: LadderGeometry,
    ladder: Vec<LegConfig>,
    cycle: Option<Cycle>,
    pending: Option<PendingOrder>,
    /// Forced exit waiting on an acknowledged entry or leg order
    exit_deferred: bool,
    history: VecDeque<CycleResult>,
    last_price: Option<Decimal>,
}

impl CycleEngine {
    pub fn new(settings: StrategySettings) -> Self {
        Self {
            id: settings.id(),
            geometry: settings.kind.geometry(),
            ladder: settings.ladder(),
            settings,
            cycle: None,
            pending: None,
            exit_deferred: false,
            history: VecDeque::new(),
            last_price: None,
        }
    }

    pub fn id(&self) -> &StrategyId {
        &self.id
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    pub fn cycle(&self) -> Option<&Cycle> {
        self.cycle.as_ref()
    }

    /// True once leg 1 is filled and until the cycle is retired.
    pub fn has_open_cycle(&self) -> bool {
        self.cycle.as_ref().is_some_and(|c| c.filled_legs() > 0)
    }

    pub fn has_pending_order(&self) -> bool {
        self.pending.is_some()
    }

    /// True while a forced exit waits for the in-flight order to resolve.
    pub fn exit_deferred(&self) -> bool {
        self.exit_deferred
    }

    /// Whether the in-flight order was acknowledged under `order_id`.
    pub fn awaits_fill(&self, order_id: &str) -> bool {
        self.pending
            .as_ref()
            .and_then(|p| p.order_id.as_deref())
            .is_some_and(|id| id == order_id)
    }

    pub fn results(&self) -> impl Iterator<Item = &CycleResult> {
        self.history.iter()
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    /// Market value of the open position at `price`.
    pub fn position_value(&self, price: Decimal) -> Decimal {
        self.cycle
            .as_ref()
            .map(|c| c.total_quantity * price)
            .unwrap_or(Decimal::ZERO)
    }

    // ==================== Entry Signals ====================

    /// Whether `price` satisfies this instance's entry condition.
    pub fn entry_signal(&self, price: Decimal) -> bool {
        match self.settings.kind {
            StrategyKind::ContrarianDca => self.settings.price_trigger.map_or(true, |t| price <= t),
            StrategyKind::WeightedDca => self.settings.price_trigger.map_or(true, |t| price >= t),
            StrategyKind::ZeroRiskMartingale | StrategyKind::InverseZeroRiskMartingale => {
                self.settings.zone_center_price.map_or(true, |center| {
                    match self.geometry.direction {
                        Direction::Long => price <= center,
                        Direction::Short => price >= center,
                    }
                })
            }
        }
    }

    // ==================== Tick Evaluation ====================

    /// Evaluate one market tick.
    ///
    /// For an open cycle the checks run in order: trailing stop crossed,
    /// take-profit reached, trailing activation/advance, next leg trigger.
    pub fn on_tick(&mut self, price: Decimal, ts: DateTime<Utc>, entry_signal: bool) -> Option<OrderIntent> {
        self.last_price = Some(price);

        if self.pending.is_some() {
            debug!(strategy = %self.id, price = %price, "Order in flight, tick skipped");
            return None;
        }
        if self.exit_deferred {
            return self.resume_forced_exit(price);
        }

        match self.cycle.as_ref().map(|c| c.filled_legs()) {
            None if entry_signal => Some(self.begin_cycle(price, ts)),
            None => None,
            // Entry order failed earlier without a fill; retry it
            Some(0) => Some(self.request(OrderPurpose::Entry, price)),
            Some(_) => self.evaluate_open_cycle(price),
        }
    }

    fn begin_cycle(&mut self, price: Decimal, ts: DateTime<Utc>) -> OrderIntent {
        let cycle = Cycle::new(self.id.clone(), self.geometry.direction, &self.ladder, ts);
        info!(
            strategy = %self.id,
            cycle = %cycle.id,
            price = %price,
            legs = self.ladder.len(),
            "Opening cycle"
        );
        self.cycle = Some(cycle);
        self.request(OrderPurpose::Entry, price)
    }

    fn evaluate_open_cycle(&mut self, price: Decimal) -> Option<OrderIntent> {
        let trailing_enabled = self.settings.trailing_stops;
        let geometry = self.geometry;
        let id = self.id.clone();
        let cycle = self.cycle.as_mut()?;
        let direction = cycle.direction;
        let active = cycle.active_leg()?.config;

        // (1) trailing stop crossed
        if cycle.trailing.is_crossed(price, direction) {
            info!(
                strategy = %id,
                price = %price,
                stop = %cycle.trailing.stop_price,
                "Trailing stop hit"
            );
            return Some(self.exit(ExitReason::TrailingStop, price));
        }

        // (2) take-profit of the active leg
        let pnl_pct = cycle.unrealized_pnl_pct(price);
        if active.take_profit_pct > Decimal::ZERO && pnl_pct >= active.take_profit_pct {
            info!(
                strategy = %id,
                price = %price,
                pnl_pct = %pnl_pct.round_dp(4),
                target = %active.take_profit_pct,
                "Take profit reached"
            );
            return Some(self.exit(ExitReason::TakeProfit, price));
        }

        // (3) trailing activation / advance
        if trailing_enabled {
            if !cycle.trailing.active {
                if pnl_pct >= active.trailing_trigger_pct {
                    cycle.trailing.activate(price, active.trailing_distance_pct, direction);
                    cycle.status = CycleStatus::TrailingActive;
                    info!(
                        strategy = %id,
                        price = %price,
                        stop = %cycle.trailing.stop_price,
                        "Trailing stop activated"
                    );
                }
            } else if cycle.trailing.advance(price, active.trailing_distance_pct, direction) {
                debug!(strategy = %id, stop = %cycle.trailing.stop_price, "Trailing stop advanced");
            }
        }

        // (4) next leg, never while trailing
        if cycle.trailing.active {
            return None;
        }
        let next = cycle.next_leg()?;
        let trigger = geometry.trigger_price(cycle.anchor_price, next.config.trigger_distance_pct);
        if !geometry.is_triggered(price, trigger) {
            return None;
        }

        let leg = next.number;
        info!(
            strategy = %id,
            leg = leg,
            price = %price,
            trigger = %trigger,
            "Leg triggered"
        );
        Some(self.request(OrderPurpose::AddLeg(leg), price))
    }

    fn request(&mut self, purpose: OrderPurpose, price: Decimal) -> OrderIntent {
        let direction = self.geometry.direction;
        let (action, quantity, size_multiplier) = match purpose {
            OrderPurpose::Entry => (direction.entry_action(), None, self.leg_multiplier(1)),
            OrderPurpose::AddLeg(n) => (direction.entry_action(), None, self.leg_multiplier(n)),
            OrderPurpose::Exit(_) => (
                direction.exit_action(),
                self.cycle.as_ref().map(|c| c.total_quantity),
                Decimal::ONE,
            ),
        };

        if matches!(purpose, OrderPurpose::Exit(_)) {
            self.exit_deferred = false;
        }
        self.pending = Some(PendingOrder {
            purpose,
            order_id: None,
        });

        OrderIntent {
            strategy: self.id.clone(),
            purpose,
            action,
            order_type: if matches!(purpose, OrderPurpose::Exit(_)) {
                OrderType::Market
            } else {
                self.settings.order_type
            },
            reference_price: price,
            quantity,
            size_multiplier,
        }
    }

    fn exit(&mut self, reason: ExitReason, price: Decimal) -> OrderIntent {
        self.request(OrderPurpose::Exit(reason), price)
    }

    fn leg_multiplier(&self, number: usize) -> Decimal {
        self.ladder
            .get(number.saturating_sub(1))
            .map(|l| l.size_multiplier)
            .unwrap_or(Decimal::ONE)
    }

    /// Abort the open cycle. Returns the flattening order when there is a
    /// position to close and nothing acknowledged is still in flight.
    ///
    /// An acknowledged entry or leg order may still fill, so the exit is
    /// deferred until it resolves; `resume_forced_exit` then covers the full
    /// position. An intent that was never sent is simply dropped.
    pub fn force_exit(&mut self, price: Decimal) -> Option<OrderIntent> {
        let filled = self.cycle.as_ref().map(|c| c.filled_legs())?;

        if let Some(pending) = &self.pending {
            if matches!(pending.purpose, OrderPurpose::Exit(_)) {
                debug!(strategy = %self.id, "Exit already in flight");
                return None;
            }
            if let Some(order_id) = &pending.order_id {
                warn!(
                    strategy = %self.id,
                    order_id = %order_id,
                    purpose = ?pending.purpose,
                    "Forced exit deferred until in-flight order resolves"
                );
                self.exit_deferred = true;
                return None;
            }
            warn!(
                strategy = %self.id,
                purpose = ?pending.purpose,
                "Dropping unsent order for forced exit"
            );
            self.pending = None;
        }

        if filled == 0 {
            warn!(strategy = %self.id, "Forced exit before entry fill, discarding cycle");
            self.cycle = None;
            self.exit_deferred = false;
            return None;
        }

        warn!(strategy = %self.id, price = %price, "Forcing cycle exit");
        Some(self.exit(ExitReason::ForcedExit, price))
    }

    /// Issue a deferred forced exit once nothing is in flight.
    pub fn resume_forced_exit(&mut self, price: Decimal) -> Option<OrderIntent> {
        if !self.exit_deferred || self.pending.is_some() {
            return None;
        }
        self.exit_deferred = false;
        self.force_exit(price)
    }

    // ==================== Order Feedback ====================

    pub fn on_order_placed(&mut self, order_id: &str) {
        if let Some(pending) = self.pending.as_mut() {
            pending.order_id = Some(order_id.to_string());
        }
    }

    /// The in-flight order was not sent. Ladder state is left as it was, so
    /// the same order is requested again on the next qualifying tick.
    pub fn on_order_failed(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        warn!(strategy = %self.id, purpose = ?pending.purpose, "Order not placed, will retry");

        if pending.purpose == OrderPurpose::Entry
            && self.cycle.as_ref().is_some_and(|c| c.filled_legs() == 0)
        {
            self.cycle = None;
            self.exit_deferred = false;
        }
    }

    /// Apply a fill for the in-flight order. Returns the archived result when
    /// the fill closes the cycle.
    pub fn on_fill(&mut self, fill: &Fill) -> Option<CycleResult> {
        let Some(pending) = self.pending.as_ref() else {
            warn!(strategy = %self.id, order_id = %fill.order_id, "Fill without an order in flight");
            return None;
        };
        if let Some(expected) = &pending.order_id {
            if *expected != fill.order_id {
                warn!(
                    strategy = %self.id,
                    expected = %expected,
                    order_id = %fill.order_id,
                    "Fill for unknown order ignored"
                );
                return None;
            }
        }
        let purpose = pending.purpose;
        self.pending = None;

        match purpose {
            OrderPurpose::Entry => {
                self.apply_leg_fill(1, fill);
                None
            }
            OrderPurpose::AddLeg(n) => {
                self.apply_leg_fill(n, fill);
                None
            }
            OrderPurpose::Exit(reason) => self.close_cycle(reason, fill),
        }
    }

    fn apply_leg_fill(&mut self, number: usize, fill: &Fill) {
        let anchor = self.geometry.anchor;
        let zone_center = self.settings.zone_center_price;
        let Some(cycle) = self.cycle.as_mut() else {
            warn!(strategy = %self.id, leg = number, "Leg fill without a cycle");
            return;
        };

        cycle.apply_leg_fill(number, fill.price, fill.quantity);
        if number == 1 {
            cycle.anchor_price = match (anchor, zone_center) {
                (AnchorMode::ZoneCenter, Some(center)) => center,
                _ => fill.price,
            };
        }

        info!(
            strategy = %self.id,
            leg = number,
            price = %fill.price,
            quantity = %fill.quantity,
            avg_cost = %cycle.avg_cost.round_dp(4),
            total_quantity = %cycle.total_quantity,
            "Leg filled"
        );
    }

    fn close_cycle(&mut self, reason: ExitReason, fill: &Fill) -> Option<CycleResult> {
        let mut cycle = self.cycle.take()?;
        self.exit_deferred = false;

        let realized_pnl = cycle.realized_pnl(fill.price);
        let cost_basis = cycle.cost_basis();
        let return_pct = if cost_basis.is_zero() {
            0.0
        } else {
            (realized_pnl / cost_basis).to_f64().unwrap_or(0.0)
        };

        cycle.status = if reason == ExitReason::ForcedExit {
            CycleStatus::Aborted
        } else {
            CycleStatus::Closed
        };
        cycle.closed_at = Some(fill.timestamp);

        let result = CycleResult {
            cycle_id: cycle.id.clone(),
            strategy: cycle.strategy.clone(),
            direction: cycle.direction,
            legs_filled: cycle.filled_legs(),
            avg_cost: cycle.avg_cost,
            quantity: cycle.total_quantity,
            exit_price: fill.price,
            realized_pnl,
            return_pct,
            reason,
            status: cycle.status,
            opened_at: cycle.opened_at,
            closed_at: fill.timestamp,
        };

        info!(
            strategy = %self.id,
            cycle = %result.cycle_id,
            reason = ?reason,
            legs = result.legs_filled,
            exit_price = %fill.price,
            pnl = %realized_pnl.round_dp(2),
            "Cycle closed"
        );

        self.history.push_back(result.clone());
        while self.history.len() > MAX_CYCLE_HISTORY {
            self.history.pop_front();
        }

        Some(result)
    }

    // ==================== Reporting ====================

    /// Status of the open cycle at `price`, or `None` when flat.
    pub fn status(&self, price: Decimal) -> Option<CycleStatusReport> {
        let cycle = self.cycle.as_ref()?;
        let next_leg_trigger = if cycle.filled_legs() > 0 && !cycle.trailing.active {
            cycle
                .next_leg()
                .map(|l| self.geometry.trigger_price(cycle.anchor_price, l.config.trigger_distance_pct))
        } else {
            None
        };

        Some(CycleStatusReport {
            strategy: self.id.clone(),
            status: cycle.status,
            legs_filled: cycle.filled_legs(),
            total_legs: cycle.legs.len(),
            anchor_price: cycle.anchor_price,
            avg_cost: cycle.avg_cost,
            quantity: cycle.total_quantity,
            unrealized_pnl: cycle.unrealized_pnl(price),
            unrealized_pnl_pct: cycle.unrealized_pnl_pct(price),
            trailing_stop: cycle.trailing.active.then_some(cycle.trailing.stop_price),
            next_leg_trigger,
            order_pending: self.pending.is_some(),
        })
    }
}
