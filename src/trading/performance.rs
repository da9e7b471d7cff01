//! Rolling trade history and per-strategy performance metrics.
//!
//! Metrics are published as immutable `Arc` snapshots, swapped under the same
//! write lock that appends the trade, so readers see either the old or the new
//! state of a strategy, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::metrics::{MetricsCalculator, MetricsReport};
use crate::models::{PerformanceMetrics, StrategyId, TradeRecord};

/// History above this many entries is trimmed.
const MAX_TRADE_HISTORY: usize = 1000;
/// Entries kept after a trim.
const TRIMMED_TRADE_HISTORY: usize = 500;
/// Prices and returns kept per symbol.
const MAX_PRICE_HISTORY: usize = 100;

fn trim_history<T>(history: &mut Vec<T>) {
    if history.len() > MAX_TRADE_HISTORY {
        let excess = history.len() - TRIMMED_TRADE_HISTORY;
        history.drain(..excess);
    }
}

fn keep_last<T>(history: &mut Vec<T>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}

#[derive(Default)]
struct TradeBook {
    /// All strategies, oldest first
    trades: Vec<TradeRecord>,
    by_strategy: HashMap<StrategyId, Vec<TradeRecord>>,
    metrics: HashMap<StrategyId, Arc<PerformanceMetrics>>,
}

#[derive(Default)]
struct PriceHistory {
    prices: Vec<Decimal>,
    returns: Vec<f64>,
}

/// Tracks closed trades and symbol prices for sizing and risk decisions.
pub struct PerformanceTracker {
    lookback: usize,
    book: RwLock<TradeBook>,
    prices: RwLock<HashMap<String, PriceHistory>>,
}

impl PerformanceTracker {
    /// `lookback` is the number of recent trades per strategy that metrics cover.
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(1),
            book: RwLock::new(TradeBook::default()),
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Append a closed trade and republish its strategy's metrics.
    pub fn record_trade(&self, trade: TradeRecord) -> Arc<PerformanceMetrics> {
        let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);

        let strategy = trade.strategy.clone();
        book.trades.push(trade.clone());
        trim_history(&mut book.trades);

        let history = book.by_strategy.entry(strategy.clone()).or_default();
        history.push(trade);
        trim_history(history);

        let window_start = history.len().saturating_sub(self.lookback);
        let metrics = Arc::new(MetricsCalculator::calculate(&history[window_start..]));
        book.metrics.insert(strategy.clone(), Arc::clone(&metrics));

        debug!(
            strategy = %strategy,
            trades = metrics.trade_count,
            win_rate = metrics.win_rate,
            avg_return = metrics.avg_return,
            consecutive_losses = metrics.consecutive_losses,
            "Performance metrics updated"
        );

        metrics
    }

    /// Latest metrics for a strategy; defaults when it has no trades yet.
    pub fn metrics(&self, strategy: &StrategyId) -> Arc<PerformanceMetrics> {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        book.metrics
            .get(strategy)
            .cloned()
            .unwrap_or_else(|| Arc::new(PerformanceMetrics::default()))
    }

    /// Return volatility of a strategy, if it has traded.
    pub fn strategy_volatility(&self, strategy: &StrategyId) -> Option<f64> {
        let metrics = self.metrics(strategy);
        metrics.has_history().then_some(metrics.volatility)
    }

    /// Consistent snapshot of every strategy's trade-return series.
    pub fn strategy_returns(&self) -> HashMap<StrategyId, Vec<f64>> {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        book.by_strategy
            .iter()
            .map(|(id, trades)| {
                let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
                (id.clone(), returns)
            })
            .collect()
    }

    /// Trade returns of all strategies, oldest first.
    pub fn all_returns(&self) -> Vec<f64> {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        book.trades.iter().map(|t| t.return_pct).collect()
    }

    pub fn trade_count(&self) -> usize {
        self.book.read().unwrap_or_else(PoisonError::into_inner).trades.len()
    }

    /// Realized P&L over the retained trade history.
    pub fn total_pnl(&self) -> Decimal {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        book.trades.iter().map(|t| t.pnl).sum()
    }

    /// Ratio report over a strategy's full retained trade-return series.
    pub fn performance_report(&self, strategy: &StrategyId, risk_free_rate: f64) -> MetricsReport {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        let returns: Vec<f64> = book
            .by_strategy
            .get(strategy)
            .map(|trades| trades.iter().map(|t| t.return_pct).collect())
            .unwrap_or_default();
        MetricsReport::from_returns(&returns, risk_free_rate)
    }

    /// Record a market price and the simple return from the previous one.
    pub fn record_price(&self, symbol: &str, price: Decimal) {
        let mut prices = self.prices.write().unwrap_or_else(PoisonError::into_inner);
        let history = prices.entry(symbol.to_string()).or_default();

        if let Some(prev) = history.prices.last().copied() {
            if prev > Decimal::ZERO {
                if let Some(ret) = ((price - prev) / prev).to_f64() {
                    history.returns.push(ret);
                }
            }
        }
        history.prices.push(price);

        keep_last(&mut history.prices, MAX_PRICE_HISTORY);
        keep_last(&mut history.returns, MAX_PRICE_HISTORY);
    }

    /// The most recent `lookback` simple returns for a symbol.
    pub fn symbol_returns(&self, symbol: &str, lookback: usize) -> Vec<f64> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        prices
            .get(symbol)
            .map(|h| {
                let start = h.returns.len().saturating_sub(lookback);
                h.returns[start..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        prices.get(symbol).and_then(|h| h.prices.last().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyKind;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(id: &StrategyId, pnl: Decimal, ret: f64) -> TradeRecord {
        TradeRecord::new(id.clone(), pnl, ret, Utc::now())
    }

    #[test]
    fn test_metrics_use_lookback_window() {
        let tracker = PerformanceTracker::new(3);
        let id = StrategyId::new(StrategyKind::ContrarianDca, "AAPL");

        tracker.record_trade(trade(&id, dec!(10), 0.01));
        tracker.record_trade(trade(&id, dec!(10), 0.01));
        tracker.record_trade(trade(&id, dec!(-5), -0.01));
        let metrics = tracker.record_trade(trade(&id, dec!(-5), -0.01));

        // Only the last 3 trades count
        assert_eq!(metrics.trade_count, 3);
        assert!((metrics.win_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.consecutive_losses, 2);
        assert_eq!(metrics.recent_pnl, dec!(0));
        assert_eq!(*tracker.metrics(&id), *metrics);
    }

    #[test]
    fn test_unknown_strategy_defaults() {
        let tracker = PerformanceTracker::new(10);
        let id = StrategyId::new(StrategyKind::WeightedDca, "MSFT");

        assert!(!tracker.metrics(&id).has_history());
        assert_eq!(tracker.strategy_volatility(&id), None);
    }

    #[test]
    fn test_history_trimmed() {
        let tracker = PerformanceTracker::new(10);
        let id = StrategyId::new(StrategyKind::ContrarianDca, "AAPL");

        for _ in 0..1001 {
            tracker.record_trade(trade(&id, dec!(1), 0.001));
        }
        assert_eq!(tracker.trade_count(), 500);
        assert_eq!(tracker.all_returns().len(), 500);
        assert_eq!(tracker.strategy_returns()[&id].len(), 500);
    }

    #[test]
    fn test_strategy_returns_snapshot() {
        let tracker = PerformanceTracker::new(10);
        let a = StrategyId::new(StrategyKind::ContrarianDca, "AAPL");
        let b = StrategyId::new(StrategyKind::ZeroRiskMartingale, "AAPL");

        tracker.record_trade(trade(&a, dec!(1), 0.01));
        tracker.record_trade(trade(&b, dec!(-1), -0.02));
        tracker.record_trade(trade(&a, dec!(2), 0.03));

        let returns = tracker.strategy_returns();
        assert_eq!(returns[&a], vec![0.01, 0.03]);
        assert_eq!(returns[&b], vec![-0.02]);
        assert_eq!(tracker.all_returns(), vec![0.01, -0.02, 0.03]);
        assert_eq!(tracker.total_pnl(), dec!(2));
    }

    #[test]
    fn test_price_history() {
        let tracker = PerformanceTracker::new(10);
        tracker.record_price("AAPL", dec!(100));
        tracker.record_price("AAPL", dec!(110));
        tracker.record_price("AAPL", dec!(99));

        let returns = tracker.symbol_returns("AAPL", 20);
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.1).abs() < 1e-12);
        assert!((returns[1] + 0.1).abs() < 1e-12);
        assert_eq!(tracker.symbol_returns("AAPL", 1).len(), 1);
        assert_eq!(tracker.last_price("AAPL"), Some(dec!(99)));
        assert!(tracker.symbol_returns("MSFT", 20).is_empty());

        for i in 0..150 {
            tracker.record_price("NVDA", Decimal::from(100 + i));
        }
        assert_eq!(tracker.symbol_returns("NVDA", 1000).len(), 100);
    }

    #[test]
    fn test_performance_report() {
        let tracker = PerformanceTracker::new(10);
        let id = StrategyId::new(StrategyKind::ContrarianDca, "AAPL");
        tracker.record_trade(trade(&id, dec!(10), 0.1));
        tracker.record_trade(trade(&id, dec!(-10), -0.1));

        let report = tracker.performance_report(&id, 0.0);
        assert_eq!(report.periods, 3);
        assert!((report.max_drawdown_pct - 10.0).abs() < 1e-9);
    }
}
