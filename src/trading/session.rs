//! Trading session: owns the trackers, sizer, guard and every strategy
//! instance, and drives them from market ticks.
//!
//! Each instance sits behind its own async mutex so ticks for one instance
//! never overlap, while different symbols are evaluated concurrently.
//! Force-exit raises the instance's abort count before waiting for the lock;
//! a tick holding the lock drops its order intent while the count is above
//! zero.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::cycle_engine::{CycleEngine, CycleStatusReport, OrderIntent};
use super::guard::SessionGuard;
use super::performance::PerformanceTracker;
use super::position_sizer::{PositionSizer, SizingRequest};
use super::risk::{RiskMonitor, RiskSnapshot};
use crate::execution::ExecutionClient;
use crate::metrics::MetricsReport;
use crate::models::{CycleResult, Fill, OrderPurpose, RiskSummary, StrategyId, TradeRecord};

/// Equity points kept for reporting.
const MAX_EQUITY_POINTS: usize = 100_000;

/// One market price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// What happened while processing ticks.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub closed: Vec<CycleResult>,
    pub orders_placed: usize,
    pub orders_failed: usize,
    pub emergency_exit: bool,
}

impl TickOutcome {
    fn merge(&mut self, other: TickOutcome) {
        self.closed.extend(other.closed);
        self.orders_placed += other.orders_placed;
        self.orders_failed += other.orders_failed;
        self.emergency_exit |= other.emergency_exit;
    }
}

struct StrategyInstance {
    id: StrategyId,
    engine: Mutex<CycleEngine>,
    /// Forced exits in progress
    aborts: AtomicUsize,
}

impl StrategyInstance {
    fn aborting(&self) -> bool {
        self.aborts.load(Ordering::SeqCst) > 0
    }
}

/// Holds an instance's abort count up for as long as it lives.
struct AbortScope<'a>(&'a AtomicUsize);

impl<'a> AbortScope<'a> {
    fn enter(aborts: &'a AtomicUsize) -> Self {
        aborts.fetch_add(1, Ordering::SeqCst);
        Self(aborts)
    }
}

impl Drop for AbortScope<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Ledger {
    realized_pnl: Decimal,
    equity_curve: Vec<Decimal>,
}

/// A trading session over a fixed set of strategy instances.
pub struct TradingSession {
    config: SessionConfig,
    broker: Arc<dyn ExecutionClient>,
    tracker: Arc<PerformanceTracker>,
    risk: RiskMonitor,
    sizer: PositionSizer,
    guard: SessionGuard,
    /// Instances by symbol, in config order within a symbol
    instances: BTreeMap<String, Vec<Arc<StrategyInstance>>>,
    ledger: RwLock<Ledger>,
    emergency: AtomicBool,
}

impl TradingSession {
    pub fn new(config: SessionConfig, broker: Arc<dyn ExecutionClient>) -> Result<Self> {
        config.validate().context("Invalid session config")?;

        let tracker = Arc::new(PerformanceTracker::new(config.sizing.performance_lookback));
        let sizer = PositionSizer::new(config.sizing.clone(), Arc::clone(&tracker));
        let guard = SessionGuard::new(config.guard.clone());

        let mut instances: BTreeMap<String, Vec<Arc<StrategyInstance>>> = BTreeMap::new();
        for settings in config.enabled_strategies() {
            instances
                .entry(settings.symbol.clone())
                .or_default()
                .push(Arc::new(StrategyInstance {
                    id: settings.id(),
                    engine: Mutex::new(CycleEngine::new(settings.clone())),
                    aborts: AtomicUsize::new(0),
                }));
        }

        info!(
            balance = %config.account_balance,
            method = config.sizing.method.as_str(),
            instances = instances.values().map(Vec::len).sum::<usize>(),
            symbols = instances.len(),
            "Trading session created"
        );

        Ok(Self {
            ledger: RwLock::new(Ledger {
                realized_pnl: Decimal::ZERO,
                equity_curve: vec![config.account_balance],
            }),
            config,
            broker,
            tracker,
            risk: RiskMonitor::new(),
            sizer,
            guard,
            instances,
            emergency: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    pub fn strategy_ids(&self) -> Vec<StrategyId> {
        self.instances.values().flatten().map(|i| i.id.clone()).collect()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner).realized_pnl
    }

    /// Starting balance plus realized P&L.
    pub fn account_balance(&self) -> Decimal {
        self.config.account_balance + self.realized_pnl()
    }

    /// Marked-to-market equity after every tick.
    pub fn equity_curve(&self) -> Vec<Decimal> {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .equity_curve
            .clone()
    }

    // ==================== Tick Processing ====================

    /// Evaluate every instance on `symbol` at `price`.
    pub async fn on_tick(&self, symbol: &str, price: Decimal, ts: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        self.tracker.record_price(symbol, price);
        self.broker.on_market_price(symbol, price).await;

        if let Some(instances) = self.instances.get(symbol) {
            for instance in instances {
                outcome.merge(self.evaluate(instance, price, ts).await);
            }
        }

        let unrealized = self.refresh_risk().await;
        self.record_equity(unrealized);
        outcome.merge(self.check_emergency(unrealized).await);
        outcome
    }

    /// Process a batch of ticks: symbols run concurrently, each symbol's ticks
    /// in arrival order.
    pub async fn process_ticks(&self, ticks: &[MarketTick]) -> TickOutcome {
        let mut by_symbol: BTreeMap<&str, Vec<&MarketTick>> = BTreeMap::new();
        for tick in ticks {
            by_symbol.entry(tick.symbol.as_str()).or_default().push(tick);
        }

        let runs = by_symbol.into_values().map(|ticks| async move {
            let mut outcome = TickOutcome::default();
            for tick in ticks {
                outcome.merge(self.on_tick(&tick.symbol, tick.price, tick.timestamp).await);
            }
            outcome
        });

        let mut outcome = TickOutcome::default();
        for run in join_all(runs).await {
            outcome.merge(run);
        }
        outcome
    }

    async fn evaluate(&self, instance: &StrategyInstance, price: Decimal, ts: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if instance.aborting() {
            debug!(strategy = %instance.id, "Forced exit pending, tick skipped");
            return outcome;
        }

        let mut engine = instance.engine.lock().await;

        let wants_entry =
            engine.cycle().is_none() && !engine.has_pending_order() && engine.entry_signal(price);
        let entry_signal = wants_entry
            && match self.guard.can_start_cycle(ts) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(strategy = %instance.id, reason = %reason, "Entry blocked");
                    false
                }
            };

        let Some(intent) = engine.on_tick(price, ts, entry_signal) else {
            return outcome;
        };

        if instance.aborting() {
            debug!(strategy = %instance.id, purpose = ?intent.purpose, "Intent dropped for forced exit");
            engine.on_order_failed();
            return outcome;
        }

        let opens_cycle = entry_signal && intent.purpose == OrderPurpose::Entry;
        match self.execute(&mut engine, intent).await {
            Ok(result) => {
                // The slot is held from placement so unfilled entries count
                if opens_cycle {
                    self.guard.register_cycle_start(ts);
                }
                outcome.orders_placed += 1;
                outcome.closed.extend(result);
            }
            Err(e) => {
                warn!(strategy = %instance.id, error = %e, "Order not placed");
                outcome.orders_failed += 1;
            }
        }
        outcome
    }

    /// Size and place an intent. On error the engine has already been told
    /// the order was not sent.
    async fn execute(&self, engine: &mut CycleEngine, intent: OrderIntent) -> Result<Option<CycleResult>> {
        let quantity = match intent.quantity {
            Some(quantity) => quantity,
            None => {
                let request = SizingRequest::new(
                    intent.strategy.clone(),
                    self.account_balance(),
                    intent.reference_price,
                    self.config.sizing.method,
                )
                .with_multiplier(intent.size_multiplier);
                self.sizer.size(&request).quantity
            }
        };

        if quantity <= Decimal::ZERO {
            engine.on_order_failed();
            bail!("{:?} sized to zero quantity", intent.purpose);
        }

        let order = intent.into_request(quantity);
        let ack = match self.broker.place_order(&order).await {
            Ok(ack) => ack,
            Err(e) => {
                engine.on_order_failed();
                return Err(e.context(format!(
                    "{} {} {} rejected",
                    order.action.as_str(),
                    order.quantity,
                    order.symbol
                )));
            }
        };

        info!(
            strategy = %order.strategy,
            order_id = %ack.order_id,
            purpose = ?order.purpose,
            side = order.action.as_str(),
            quantity = %order.quantity,
            price = %order.reference_price,
            "Order placed"
        );
        engine.on_order_placed(&ack.order_id);

        Ok(match ack.fill {
            Some(fill) => self.apply_fill(engine, &fill),
            None => None,
        })
    }

    fn apply_fill(&self, engine: &mut CycleEngine, fill: &Fill) -> Option<CycleResult> {
        let result = engine.on_fill(fill);
        if let Some(result) = &result {
            self.record_result(result);
        }
        result
    }

    fn record_result(&self, result: &CycleResult) {
        self.tracker.record_trade(TradeRecord::from(result));
        self.guard.register_cycle_end(result.realized_pnl, result.closed_at);

        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        ledger.realized_pnl += result.realized_pnl;
    }

    /// Asynchronous fill notification for an acknowledged order. A forced
    /// exit that was waiting on this order is placed right after the fill.
    pub async fn on_fill(&self, symbol: &str, fill: &Fill) -> Result<Option<CycleResult>> {
        let instances = self
            .instances
            .get(symbol)
            .with_context(|| format!("No strategy trades {}", symbol))?;

        for instance in instances {
            let mut engine = instance.engine.lock().await;
            if !engine.awaits_fill(&fill.order_id) {
                continue;
            }

            let result = self.apply_fill(&mut engine, fill);
            if result.is_some() || !engine.exit_deferred() {
                return Ok(result);
            }

            let price = self.exit_price(&engine, symbol).await.unwrap_or(fill.price);
            return match engine.resume_forced_exit(price) {
                Some(intent) => self
                    .execute(&mut engine, intent)
                    .await
                    .with_context(|| format!("Deferred forced exit for {} not placed", instance.id)),
                None => Ok(None),
            };
        }
        Err(anyhow!("No order {} in flight for {}", fill.order_id, symbol))
    }

    // ==================== Forced Exit ====================

    /// Abort every open cycle on `symbol`.
    pub async fn force_exit(&self, symbol: &str) -> Result<Vec<CycleResult>> {
        let instances = self
            .instances
            .get(symbol)
            .with_context(|| format!("No strategy trades {}", symbol))?;

        let mut closed = Vec::new();
        let mut failures = Vec::new();
        for instance in instances {
            match self.force_exit_instance(instance, symbol).await {
                Ok(result) => closed.extend(result),
                Err(e) => failures.push(format!("{}: {:#}", instance.id, e)),
            }
        }

        if !failures.is_empty() {
            bail!("Forced exit incomplete: {}", failures.join("; "));
        }
        Ok(closed)
    }

    async fn force_exit_instance(&self, instance: &StrategyInstance, symbol: &str) -> Result<Option<CycleResult>> {
        let _abort = AbortScope::enter(&instance.aborts);
        let mut engine = instance.engine.lock().await;
        if engine.cycle().is_none() {
            return Ok(None);
        }

        let price = self.exit_price(&engine, symbol).await?;
        let intent = engine.force_exit(price);
        if engine.cycle().is_none() {
            // Discarded before any fill
            self.guard.release_cycle_slot();
        }

        match intent {
            Some(intent) => self.execute(&mut engine, intent).await,
            None => {
                if engine.exit_deferred() {
                    info!(strategy = %instance.id, "Forced exit waits for the in-flight order");
                }
                Ok(None)
            }
        }
    }

    /// Broker price for an exit, falling back to the instance's last tick.
    async fn exit_price(&self, engine: &CycleEngine, symbol: &str) -> Result<Decimal> {
        match self.broker.market_price(symbol).await {
            Ok(price) => Ok(price),
            Err(e) => engine
                .last_price()
                .with_context(|| format!("No price to exit {}: {}", symbol, e)),
        }
    }

    async fn check_emergency(&self, unrealized: Decimal) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let total_loss = -(self.realized_pnl() + unrealized);
        let drawdown = self.risk.metrics().current_drawdown;

        if !self.guard.should_emergency_exit(total_loss, drawdown) {
            return outcome;
        }

        if !self.emergency.swap(true, Ordering::SeqCst) {
            error!(
                loss = %total_loss.round_dp(2),
                drawdown = drawdown,
                "Emergency exit triggered, flattening all cycles"
            );
            self.guard.halt("emergency exit");
        }
        outcome.emergency_exit = true;

        for symbol in self.instances.keys() {
            match self.force_exit(symbol).await {
                Ok(closed) => outcome.closed.extend(closed),
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "Emergency exit failed");
                    outcome.orders_failed += 1;
                }
            }
        }
        outcome
    }

    // ==================== Risk ====================

    /// Refresh portfolio risk from current positions; returns total unrealized P&L.
    async fn refresh_risk(&self) -> Decimal {
        let mut position_values = Vec::new();
        let mut unrealized = Decimal::ZERO;
        for instance in self.instances.values().flatten() {
            let engine = instance.engine.lock().await;
            let (Some(cycle), Some(price)) = (engine.cycle(), engine.last_price()) else {
                continue;
            };
            if cycle.total_quantity > Decimal::ZERO {
                position_values.push(engine.position_value(price));
                unrealized += cycle.unrealized_pnl(price);
            }
        }

        let snapshot = RiskSnapshot {
            position_values,
            strategy_returns: self.tracker.strategy_returns(),
            trade_returns: self.tracker.all_returns(),
        };
        self.risk.refresh(&snapshot);
        unrealized
    }

    fn record_equity(&self, unrealized: Decimal) {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        let equity = self.config.account_balance + ledger.realized_pnl + unrealized;
        ledger.equity_curve.push(equity);
        if ledger.equity_curve.len() > MAX_EQUITY_POINTS {
            let excess = ledger.equity_curve.len() - MAX_EQUITY_POINTS;
            ledger.equity_curve.drain(..excess);
        }
        drop(ledger);
        self.risk.record_equity(equity);
    }

    // ==================== Reporting ====================

    pub fn risk_summary(&self) -> RiskSummary {
        self.risk.summary()
    }

    /// Capital allocation for a strategy adjusted by its recent performance.
    pub fn recommended_allocation(&self, strategy: &StrategyId) -> Option<Decimal> {
        let settings = self.config.enabled_strategies().find(|s| s.id() == *strategy)?;
        let metrics = self.tracker.metrics(strategy);
        Some(PositionSizer::recommended_allocation(settings.capital_allocation, &metrics))
    }

    /// Open cycles on `symbol`, valued at each instance's last price.
    pub async fn cycle_status(&self, symbol: &str) -> Vec<CycleStatusReport> {
        let mut reports = Vec::new();
        for instance in self.instances.get(symbol).into_iter().flatten() {
            let engine = instance.engine.lock().await;
            if let Some(report) = engine.last_price().and_then(|p| engine.status(p)) {
                reports.push(report);
            }
        }
        reports
    }

    /// Archived cycle results of every instance, oldest first.
    pub async fn completed_cycles(&self) -> Vec<CycleResult> {
        let mut results = Vec::new();
        for instance in self.instances.values().flatten() {
            let engine = instance.engine.lock().await;
            results.extend(engine.results().cloned());
        }
        results.sort_by_key(|r| r.closed_at);
        results
    }

    /// Ratio report over the session's equity curve.
    pub fn metrics_report(&self) -> MetricsReport {
        let equity: Vec<f64> = self
            .equity_curve()
            .iter()
            .filter_map(|e| e.to_f64())
            .collect();
        MetricsReport::from_equity_curve(&equity, self.config.risk_free_rate)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperBroker;
    use crate::models::{
        BrokerPosition, CycleStatus, ExitReason, OrderAck, OrderRequest, StrategyKind,
    };
    use crate::trading::config::{GuardConfig, PositionSizingConfig, SizingMethod, StrategySettings};
    use async_trait::async_trait;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    /// Paper broker that can fail placements or defer fills.
    #[derive(Default)]
    struct ScriptedBroker {
        paper: PaperBroker,
        failures: AtomicUsize,
        defer_fills: AtomicBool,
    }

    impl ScriptedBroker {
        fn fail_next(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ExecutionClient for ScriptedBroker {
        async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("broker unavailable");
            }
            let mut ack = self.paper.place_order(order).await?;
            if self.defer_fills.load(Ordering::SeqCst) {
                ack.fill = None;
            }
            Ok(ack)
        }

        async fn market_price(&self, symbol: &str) -> Result<Decimal> {
            self.paper.market_price(symbol).await
        }

        async fn positions(&self) -> Result<HashMap<String, BrokerPosition>> {
            self.paper.positions().await
        }

        async fn on_market_price(&self, symbol: &str, price: Decimal) {
            self.paper.set_price(symbol, price);
        }
    }

    /// Paper broker whose next placement blocks until released.
    #[derive(Default)]
    struct GatedBroker {
        paper: PaperBroker,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ExecutionClient for GatedBroker {
        async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
            let ack = self.paper.place_order(order).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(ack)
        }

        async fn market_price(&self, symbol: &str) -> Result<Decimal> {
            self.paper.market_price(symbol).await
        }

        async fn positions(&self) -> Result<HashMap<String, BrokerPosition>> {
            self.paper.positions().await
        }

        async fn on_market_price(&self, symbol: &str, price: Decimal) {
            self.paper.set_price(symbol, price);
        }
    }

    /// Let spawned tasks run until they block.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn strategy(kind: StrategyKind, symbol: &str) -> StrategySettings {
        StrategySettings {
            capital_allocation: dec!(0.5),
            max_orders: 3,
            order_distances: vec![dec!(2)],
            order_sizes: vec![dec!(1), dec!(2)],
            order_tps: vec![dec!(2)],
            ..StrategySettings::new(kind, symbol)
        }
    }

    fn config(strategies: Vec<StrategySettings>) -> SessionConfig {
        SessionConfig {
            account_balance: dec!(10000),
            sizing: PositionSizingConfig {
                method: SizingMethod::Percentage,
                base_allocation: dec!(0.25),
                max_allocation: dec!(0.5),
                ..PositionSizingConfig::default()
            },
            strategies,
            ..SessionConfig::default()
        }
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minutes)
    }

    fn session(cfg: SessionConfig) -> (TradingSession, Arc<ScriptedBroker>) {
        let broker = Arc::new(ScriptedBroker::default());
        let session = TradingSession::new(cfg, broker.clone()).unwrap();
        (session, broker)
    }

    #[tokio::test]
    async fn test_full_cycle_with_paper_broker() {
        let (session, broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));

        let outcome = session.on_tick("AAPL", dec!(100), t(0)).await;
        assert_eq!(outcome.orders_placed, 1);
        // 10000 * 0.25 / 100
        assert_eq!(broker.paper.position("AAPL").unwrap().quantity, dec!(25));
        assert_eq!(session.guard().open_cycles(), 1);

        // Leg 2 at 98 with a 2x multiplier
        session.on_tick("AAPL", dec!(98), t(1)).await;
        // 10000 * 0.25 * 2 = 5000 notional, at the 50% cap
        assert_eq!(
            broker.paper.position("AAPL").unwrap().quantity,
            dec!(25) + dec!(5000) / dec!(98)
        );
        let status = session.cycle_status("AAPL").await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].legs_filled, 2);
        assert_eq!(status[0].status, CycleStatus::LadderActive);

        let outcome = session.on_tick("AAPL", dec!(101), t(2)).await;
        assert_eq!(outcome.closed.len(), 1);
        let result = &outcome.closed[0];
        assert_eq!(result.reason, ExitReason::TakeProfit);
        assert!(result.is_win());

        assert!(broker.paper.position("AAPL").is_none());
        assert_eq!(session.account_balance(), dec!(10000) + result.realized_pnl);
        assert_eq!(session.tracker().trade_count(), 1);
        assert_eq!(session.guard().open_cycles(), 0);
        assert_eq!(session.completed_cycles().await.len(), 1);
        assert!(session.cycle_status("AAPL").await.is_empty());
        assert_eq!(session.equity_curve().len(), 4);
    }

    #[tokio::test]
    async fn test_placement_failure_retried_next_tick() {
        let (session, broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));
        broker.fail_next(1);

        let outcome = session.on_tick("AAPL", dec!(100), t(0)).await;
        assert_eq!(outcome.orders_failed, 1);
        assert!(broker.paper.position("AAPL").is_none());
        assert!(session.cycle_status("AAPL").await.is_empty());
        assert_eq!(session.guard().open_cycles(), 0);

        let outcome = session.on_tick("AAPL", dec!(100), t(1)).await;
        assert_eq!(outcome.orders_placed, 1);
        assert_eq!(session.cycle_status("AAPL").await[0].legs_filled, 1);

        // Failed leg stays unfilled
        broker.fail_next(1);
        session.on_tick("AAPL", dec!(98), t(2)).await;
        assert_eq!(session.cycle_status("AAPL").await[0].legs_filled, 1);
        session.on_tick("AAPL", dec!(97.5), t(3)).await;
        assert_eq!(session.cycle_status("AAPL").await[0].legs_filled, 2);
    }

    #[tokio::test]
    async fn test_guard_limits_concurrent_cycles() {
        let mut cfg = config(vec![
            strategy(StrategyKind::ContrarianDca, "AAPL"),
            strategy(StrategyKind::ContrarianDca, "MSFT"),
        ]);
        cfg.guard = GuardConfig {
            max_concurrent_cycles: 1,
            ..GuardConfig::default()
        };
        let (session, _broker) = session(cfg);

        session.on_tick("AAPL", dec!(100), t(0)).await;
        let outcome = session.on_tick("MSFT", dec!(50), t(0)).await;
        assert_eq!(outcome.orders_placed, 0);
        assert!(session.cycle_status("MSFT").await.is_empty());

        // AAPL closes, MSFT may enter
        session.on_tick("AAPL", dec!(102), t(1)).await;
        let outcome = session.on_tick("MSFT", dec!(50), t(2)).await;
        assert_eq!(outcome.orders_placed, 1);
    }

    #[tokio::test]
    async fn test_force_exit() {
        let (session, broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));
        assert!(assert_ok!(session.force_exit("AAPL").await).is_empty());
        assert_err!(session.force_exit("TSLA").await);

        session.on_tick("AAPL", dec!(100), t(0)).await;
        session.on_tick("AAPL", dec!(99), t(1)).await;

        let closed = session.force_exit("AAPL").await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, CycleStatus::Aborted);
        assert_eq!(closed[0].realized_pnl, dec!(-25));
        assert!(broker.paper.position("AAPL").is_none());
        assert_eq!(session.account_balance(), dec!(9975));
    }

    #[tokio::test]
    async fn test_failed_force_exit_keeps_cycle() {
        let (session, broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));
        session.on_tick("AAPL", dec!(100), t(0)).await;

        broker.fail_next(1);
        assert_err!(session.force_exit("AAPL").await);
        let status = session.cycle_status("AAPL").await;
        assert_eq!(status[0].status, CycleStatus::Leg1Filled);
        assert!(!status[0].order_pending);

        // Ticks resume once the abort is over
        let outcome = session.on_tick("AAPL", dec!(102), t(1)).await;
        assert_eq!(outcome.closed.len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_fill_path() {
        let (session, broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));
        broker.defer_fills.store(true, Ordering::SeqCst);

        session.on_tick("AAPL", dec!(100), t(0)).await;
        let status = session.cycle_status("AAPL").await;
        assert_eq!(status[0].status, CycleStatus::Inactive);
        assert!(status[0].order_pending);
        assert_eq!(session.guard().open_cycles(), 1);

        // Further ticks wait for the fill
        let outcome = session.on_tick("AAPL", dec!(97), t(1)).await;
        assert_eq!(outcome.orders_placed, 0);

        let fill = Fill {
            order_id: "paper-1".to_string(),
            price: dec!(100),
            quantity: dec!(25),
            timestamp: t(2),
        };
        assert!(session.on_fill("AAPL", &fill).await.unwrap().is_none());
        assert_eq!(session.cycle_status("AAPL").await[0].legs_filled, 1);
        assert_eq!(session.guard().open_cycles(), 1);

        assert_err!(session.on_fill("AAPL", &fill).await);
    }

    #[tokio::test]
    async fn test_unfilled_entries_hold_cycle_slots() {
        let mut cfg = config(vec![
            strategy(StrategyKind::ContrarianDca, "AAPL"),
            strategy(StrategyKind::ContrarianDca, "MSFT"),
        ]);
        cfg.guard = GuardConfig {
            max_concurrent_cycles: 1,
            ..GuardConfig::default()
        };
        let (session, broker) = session(cfg);
        broker.defer_fills.store(true, Ordering::SeqCst);

        let outcome = session.on_tick("AAPL", dec!(100), t(0)).await;
        assert_eq!(outcome.orders_placed, 1);
        let outcome = session.on_tick("MSFT", dec!(50), t(0)).await;
        assert_eq!(outcome.orders_placed, 0);
        assert_eq!(session.guard().open_cycles(), 1);

        // A rejected entry never takes a slot
        let (session, broker) = session_with_limit(1);
        broker.fail_next(1);
        session.on_tick("AAPL", dec!(100), t(0)).await;
        assert_eq!(session.guard().open_cycles(), 0);
    }

    fn session_with_limit(max_cycles: usize) -> (TradingSession, Arc<ScriptedBroker>) {
        let mut cfg = config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]);
        cfg.guard = GuardConfig {
            max_concurrent_cycles: max_cycles,
            ..GuardConfig::default()
        };
        session(cfg)
    }

    #[tokio::test]
    async fn test_force_exit_covers_late_leg_fill() {
        let (session, broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));
        session.on_tick("AAPL", dec!(100), t(0)).await;

        broker.defer_fills.store(true, Ordering::SeqCst);
        session.on_tick("AAPL", dec!(98), t(1)).await;
        assert!(session.cycle_status("AAPL").await[0].order_pending);

        // Leg 2 is acknowledged but unfilled: the exit waits for it
        assert!(assert_ok!(session.force_exit("AAPL").await).is_empty());
        let status = session.cycle_status("AAPL").await;
        assert_eq!(status[0].legs_filled, 1);
        assert_eq!(status[0].quantity, dec!(25));

        broker.defer_fills.store(false, Ordering::SeqCst);
        let leg_quantity = dec!(5000) / dec!(98);
        let fill = Fill {
            order_id: "paper-2".to_string(),
            price: dec!(98),
            quantity: leg_quantity,
            timestamp: t(2),
        };
        let result = session.on_fill("AAPL", &fill).await.unwrap().unwrap();
        assert_eq!(result.reason, ExitReason::ForcedExit);
        assert_eq!(result.legs_filled, 2);
        assert_eq!(result.quantity, dec!(25) + leg_quantity);
        // Entry 25 @ 100 flattened at 98; leg 2 flat
        assert_eq!(result.realized_pnl.round_dp(8), dec!(-50));

        assert!(broker.paper.position("AAPL").is_none());
        assert!(session.cycle_status("AAPL").await.is_empty());
        assert_eq!(session.guard().open_cycles(), 0);
    }

    #[tokio::test]
    async fn test_force_exit_preempts_queued_tick() {
        let broker = Arc::new(GatedBroker::default());
        let session = Arc::new(
            TradingSession::new(
                config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]),
                broker.clone(),
            )
            .unwrap(),
        );
        session.on_tick("AAPL", dec!(100), t(0)).await;

        // Leg 2 placement holds the instance lock
        broker.armed.store(true, Ordering::SeqCst);
        let leg = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.on_tick("AAPL", dec!(98), t(1)).await }
        });
        broker.entered.notified().await;

        // A take-profit tick queues for the lock, then the forced exit
        let take_profit = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.on_tick("AAPL", dec!(102), t(2)).await }
        });
        settle().await;
        let exit = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.force_exit("AAPL").await }
        });
        settle().await;

        broker.release.notify_one();
        let leg = leg.await.unwrap();
        let take_profit = take_profit.await.unwrap();
        let closed = exit.await.unwrap().unwrap();

        assert_eq!(leg.orders_placed, 1);
        assert_eq!(take_profit.orders_placed, 0);
        assert!(take_profit.closed.is_empty());
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ExitReason::ForcedExit);
        assert_eq!(closed[0].legs_filled, 2);
        assert!(broker.paper.position("AAPL").is_none());
        assert_eq!(session.completed_cycles().await.len(), 1);
    }

    #[test]
    fn test_abort_scopes_nest() {
        let aborts = AtomicUsize::new(0);
        let first = AbortScope::enter(&aborts);
        let second = AbortScope::enter(&aborts);
        drop(first);
        // One forced exit finishing leaves the other's precedence intact
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_process_ticks_across_symbols() {
        let (session, _broker) = session(config(vec![
            strategy(StrategyKind::ContrarianDca, "AAPL"),
            strategy(StrategyKind::WeightedDca, "MSFT"),
        ]));

        let ticks = vec![
            MarketTick { symbol: "AAPL".into(), price: dec!(100), timestamp: t(0) },
            MarketTick { symbol: "MSFT".into(), price: dec!(50), timestamp: t(0) },
            MarketTick { symbol: "AAPL".into(), price: dec!(101), timestamp: t(1) },
            MarketTick { symbol: "MSFT".into(), price: dec!(49), timestamp: t(1) },
            MarketTick { symbol: "AAPL".into(), price: dec!(102), timestamp: t(2) },
            MarketTick { symbol: "MSFT".into(), price: dec!(51), timestamp: t(2) },
        ];
        let outcome = session.process_ticks(&ticks).await;

        assert_eq!(outcome.closed.len(), 2);
        assert!(outcome.closed.iter().all(|r| r.reason == ExitReason::TakeProfit));
        assert_eq!(session.completed_cycles().await.len(), 2);
        assert_eq!(session.tracker().all_returns().len(), 2);

        let report = session.metrics_report();
        assert!(report.total_return_pct > 0.0);
    }

    #[tokio::test]
    async fn test_emergency_exit_flattens_and_halts() {
        let mut cfg = config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]);
        cfg.guard = GuardConfig {
            emergency_loss_threshold: dec!(20),
            ..GuardConfig::default()
        };
        let (session, broker) = session(cfg);

        session.on_tick("AAPL", dec!(100), t(0)).await;
        // -25 unrealized on 25 shares
        let outcome = session.on_tick("AAPL", dec!(99), t(1)).await;
        assert!(outcome.emergency_exit);
        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].reason, ExitReason::ForcedExit);
        assert!(broker.paper.position("AAPL").is_none());

        assert!(session.guard().is_halted());
        let outcome = session.on_tick("AAPL", dec!(99), t(2)).await;
        assert_eq!(outcome.orders_placed, 0);
    }

    #[tokio::test]
    async fn test_reporting_surface() {
        let (session, _broker) = session(config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]));
        let id = StrategyId::new(StrategyKind::ContrarianDca, "AAPL");

        assert_eq!(session.recommended_allocation(&id), Some(dec!(0.5)));
        assert_eq!(
            session.recommended_allocation(&StrategyId::new(StrategyKind::WeightedDca, "AAPL")),
            None
        );

        session.on_tick("AAPL", dec!(100), t(0)).await;
        let summary = session.risk_summary();
        // One open position: 2% of its own value
        assert!((summary.portfolio_heat - 2.0).abs() < 1e-9);
        assert_eq!(summary.var_95, 0.0);
        assert_eq!(session.strategy_ids(), vec![id]);
        assert_eq!(session.symbols().collect::<Vec<_>>(), vec!["AAPL"]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = config(vec![strategy(StrategyKind::ContrarianDca, "AAPL")]);
        cfg.account_balance = dec!(0);
        assert!(TradingSession::new(cfg, Arc::new(PaperBroker::new())).is_err());
    }
}
