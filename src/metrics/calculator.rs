//! Calculator for strategy performance metrics: win rate, volatility, streaks, drawdown.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{PerformanceMetrics, TradeRecord};

/// Calculator for per-strategy rolling performance.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics over a window of trades, oldest first.
    pub fn calculate(trades: &[TradeRecord]) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::new();

        if trades.is_empty() {
            return metrics;
        }

        metrics.trade_count = trades.len();

        let pnls: Vec<Decimal> = trades.iter().map(|t| t.pnl).collect();
        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();

        Self::calculate_pnl_metrics(&mut metrics, &pnls);
        Self::calculate_return_metrics(&mut metrics, &returns);
        Self::calculate_streaks(&mut metrics, &pnls);
        Self::calculate_drawdown(&mut metrics, &pnls);

        metrics.calculated_at = Utc::now();
        metrics
    }

    /// Win rate, recent P&L and profit factor.
    fn calculate_pnl_metrics(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().copied().filter(|p| !p.is_zero()).partition(|p| *p > Decimal::ZERO);

        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;
        metrics.recent_pnl = pnls.iter().copied().sum();

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        metrics.profit_factor = if gross_loss > Decimal::ZERO {
            gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0)
        } else if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };
    }

    /// Mean, population volatility and Sharpe-like ratio of fractional returns.
    fn calculate_return_metrics(metrics: &mut PerformanceMetrics, returns: &[f64]) {
        metrics.avg_return = returns.mean();

        if returns.len() > 1 {
            metrics.volatility = returns.population_std_dev();
        }

        if metrics.volatility > 0.0 && metrics.avg_return != 0.0 {
            metrics.sharpe_ratio = metrics.avg_return / metrics.volatility;
        }
    }

    /// Streaks counted back from the newest trade.
    fn calculate_streaks(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        metrics.consecutive_losses =
            pnls.iter().rev().take_while(|p| **p < Decimal::ZERO).count() as u32;
        metrics.consecutive_wins =
            pnls.iter().rev().take_while(|p| **p > Decimal::ZERO).count() as u32;
    }

    /// Maximum drawdown of cumulative P&L as a fraction of its peak.
    fn calculate_drawdown(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for pnl in pnls {
            equity += pnl;

            if equity > peak {
                peak = equity;
            }

            if peak > Decimal::ZERO {
                let dd = peak - equity;
                let dd_pct = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
                if dd_pct > max_dd_pct {
                    max_dd_pct = dd_pct;
                }
            }
        }

        metrics.max_drawdown = max_dd_pct;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StrategyId, StrategyKind};
    use rust_decimal_macros::dec;

    fn trades(pnls: &[(Decimal, f64)]) -> Vec<TradeRecord> {
        let id = StrategyId::new(StrategyKind::ContrarianDca, "AAPL");
        pnls.iter()
            .map(|(pnl, ret)| TradeRecord::new(id.clone(), *pnl, *ret, Utc::now()))
            .collect()
    }

    #[test]
    fn test_calculate_pnl_metrics() {
        let history = trades(&[
            (dec!(100), 0.04),  // Win
            (dec!(-50), -0.02), // Loss
            (dec!(200), 0.08),  // Win
            (dec!(-30), -0.01), // Loss
            (dec!(150), 0.06),  // Win
        ]);

        let metrics = MetricsCalculator::calculate(&history);

        assert_eq!(metrics.trade_count, 5);
        assert_eq!(metrics.recent_pnl, dec!(370));
        assert!((metrics.win_rate - 0.6).abs() < 1e-9);
        assert!((metrics.avg_return - 0.03).abs() < 1e-9);
        assert!((metrics.profit_factor - 450.0 / 80.0).abs() < 1e-9);
        assert_eq!(metrics.consecutive_wins, 1);
        assert_eq!(metrics.consecutive_losses, 0);
    }

    #[test]
    fn test_population_volatility() {
        let history = trades(&[(dec!(1), 0.01), (dec!(3), 0.03)]);
        let metrics = MetricsCalculator::calculate(&history);

        // population std of [0.01, 0.03] is 0.01
        assert!((metrics.volatility - 0.01).abs() < 1e-12);
        assert!((metrics.sharpe_ratio - 2.0).abs() < 1e-9);

        let single = MetricsCalculator::calculate(&trades(&[(dec!(1), 0.01)]));
        assert_eq!(single.volatility, 0.0);
        assert_eq!(single.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_loss_streak() {
        let history = trades(&[
            (dec!(10), 0.01),
            (dec!(-5), -0.005),
            (dec!(-5), -0.005),
            (dec!(-5), -0.005),
            (dec!(-5), -0.005),
        ]);
        let metrics = MetricsCalculator::calculate(&history);
        assert_eq!(metrics.consecutive_losses, 4);
        assert_eq!(metrics.consecutive_wins, 0);
    }

    #[test]
    fn test_calculate_drawdown() {
        let history = trades(&[
            (dec!(100), 0.0), // Equity: 100, Peak: 100
            (dec!(50), 0.0),  // Equity: 150, Peak: 150
            (dec!(-80), 0.0), // Equity: 70,  DD: 80 (53%)
            (dec!(-20), 0.0), // Equity: 50,  DD: 100 (67%)
            (dec!(150), 0.0), // Equity: 200, Peak: 200
        ]);
        let metrics = MetricsCalculator::calculate(&history);
        assert!(metrics.max_drawdown > 0.66 && metrics.max_drawdown < 0.67);
    }

    #[test]
    fn test_empty_history() {
        let metrics = MetricsCalculator::calculate(&[]);
        assert!(!metrics.has_history());
        assert_eq!(metrics.win_rate, 0.0);
    }
}
