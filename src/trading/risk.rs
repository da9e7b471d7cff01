//! Portfolio-level risk: heat, inter-strategy correlation, VaR and drawdown.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use statrs::statistics::Statistics;
use tracing::{debug, warn};

use crate::models::{RiskLevel, RiskMetrics, RiskSummary, StrategyId};

/// Capital assumed at risk per open position.
const POSITION_RISK_FRACTION: Decimal = dec!(0.02);
/// Samples required before VaR is reported.
const MIN_VAR_SAMPLES: usize = 20;
const MAX_DRAWDOWN_HISTORY: usize = 1000;

/// Owned inputs for one risk recomputation.
#[derive(Debug, Clone, Default)]
pub struct RiskSnapshot {
    /// Market value of each open position
    pub position_values: Vec<Decimal>,
    /// Trade-return series per strategy instance
    pub strategy_returns: HashMap<StrategyId, Vec<f64>>,
    /// Combined trade returns (fractions), oldest first
    pub trade_returns: Vec<f64>,
}

#[derive(Default)]
struct RiskState {
    metrics: RiskMetrics,
    peak_equity: Option<Decimal>,
    drawdown_history: Vec<f64>,
}

/// Computes and publishes process-wide risk metrics.
#[derive(Default)]
pub struct RiskMonitor {
    state: RwLock<RiskState>,
}

impl RiskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Pure Calculations ====================

    /// Σ(value × 2%) / Σ(value) × 100; 0 when the book is empty.
    pub fn portfolio_heat(position_values: &[Decimal]) -> f64 {
        let total: Decimal = position_values.iter().sum();
        if total <= Decimal::ZERO {
            return 0.0;
        }
        let at_risk: Decimal = position_values.iter().map(|v| *v * POSITION_RISK_FRACTION).sum();
        (at_risk / total * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
    }

    /// Pearson correlation of two equally long series; NaN when undefined.
    pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
        if a.len() != b.len() || a.len() < 2 {
            return f64::NAN;
        }
        let denominator = a.std_dev() * b.std_dev();
        if denominator == 0.0 {
            return f64::NAN;
        }
        a.covariance(b) / denominator
    }

    /// Mean |correlation| over all strategy pairs with at least 2 samples each,
    /// aligned on the tail of the shorter series.
    pub fn correlation_risk(strategy_returns: &HashMap<StrategyId, Vec<f64>>) -> f64 {
        if strategy_returns.len() < 2 {
            return 0.0;
        }

        let mut ids: Vec<&StrategyId> = strategy_returns.keys().collect();
        ids.sort();

        let mut correlations = Vec::new();
        for (i, first) in ids.iter().enumerate() {
            for second in &ids[i + 1..] {
                let a = &strategy_returns[*first];
                let b = &strategy_returns[*second];
                if a.len() < 2 || b.len() < 2 {
                    continue;
                }
                let n = a.len().min(b.len());
                let corr = Self::pearson(&a[a.len() - n..], &b[b.len() - n..]);
                if !corr.is_nan() {
                    correlations.push(corr.abs());
                }
            }
        }

        if correlations.is_empty() {
            0.0
        } else {
            correlations.mean()
        }
    }

    /// Linear-interpolated percentile (rank = p·(n−1)) of unsorted samples.
    pub fn percentile(samples: &[f64], pct: f64) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }

    /// |5th percentile| of returns; 0 with fewer than 20 samples.
    pub fn var_95(returns: &[f64]) -> f64 {
        if returns.len() < MIN_VAR_SAMPLES {
            return 0.0;
        }
        Self::percentile(returns, 5.0).abs()
    }

    /// Point score from heat, correlation and drawdown thresholds.
    pub fn risk_score(metrics: &RiskMetrics) -> u32 {
        let mut score = 0;

        if metrics.portfolio_heat > 20.0 {
            score += 2;
        } else if metrics.portfolio_heat > 10.0 {
            score += 1;
        }

        if metrics.correlation_risk > 0.8 {
            score += 2;
        } else if metrics.correlation_risk > 0.6 {
            score += 1;
        }

        if metrics.current_drawdown > 15.0 {
            score += 2;
        } else if metrics.current_drawdown > 8.0 {
            score += 1;
        }

        score
    }

    pub fn classify(metrics: &RiskMetrics) -> RiskLevel {
        RiskLevel::from_score(Self::risk_score(metrics))
    }

    /// True when at least two risk factors are elevated.
    pub fn exposure_too_high(metrics: &RiskMetrics) -> bool {
        let factors = [
            metrics.portfolio_heat > 15.0,
            metrics.correlation_risk > 0.7,
            metrics.current_drawdown > 10.0,
            metrics.var_95 > 5.0,
        ];
        factors.iter().filter(|f| **f).count() >= 2
    }

    // ==================== Published State ====================

    /// Recompute heat, correlation and VaR from a snapshot and publish them.
    pub fn refresh(&self, snapshot: &RiskSnapshot) -> RiskMetrics {
        let portfolio_heat = Self::portfolio_heat(&snapshot.position_values);
        let correlation_risk = Self::correlation_risk(&snapshot.strategy_returns);
        let pct_returns: Vec<f64> = snapshot.trade_returns.iter().map(|r| r * 100.0).collect();
        let var_95 = Self::var_95(&pct_returns);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.metrics.portfolio_heat = portfolio_heat;
        state.metrics.correlation_risk = correlation_risk;
        state.metrics.var_95 = var_95;

        debug!(
            heat = portfolio_heat,
            correlation = correlation_risk,
            var_95 = var_95,
            "Risk metrics refreshed"
        );

        state.metrics.clone()
    }

    /// Track equity against its peak and append the current drawdown %.
    pub fn record_equity(&self, equity: Decimal) -> f64 {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let peak = match state.peak_equity {
            Some(peak) if peak >= equity => peak,
            _ => equity,
        };
        state.peak_equity = Some(peak);

        let drawdown = if peak > Decimal::ZERO {
            ((peak - equity) / peak * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        state.drawdown_history.push(drawdown);
        if state.drawdown_history.len() > MAX_DRAWDOWN_HISTORY {
            let excess = state.drawdown_history.len() - MAX_DRAWDOWN_HISTORY;
            state.drawdown_history.drain(..excess);
        }

        state.metrics.current_drawdown = drawdown;
        if drawdown > state.metrics.max_drawdown {
            state.metrics.max_drawdown = drawdown;
            if drawdown > 10.0 {
                warn!(drawdown = drawdown, "New maximum drawdown");
            }
        }

        drawdown
    }

    pub fn metrics(&self) -> RiskMetrics {
        self.state.read().unwrap_or_else(PoisonError::into_inner).metrics.clone()
    }

    pub fn drawdown_history(&self) -> Vec<f64> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .drawdown_history
            .clone()
    }

    pub fn should_reduce_exposure(&self) -> bool {
        Self::exposure_too_high(&self.metrics())
    }

    pub fn risk_level(&self) -> RiskLevel {
        Self::classify(&self.metrics())
    }

    pub fn summary(&self) -> RiskSummary {
        let metrics = self.metrics();
        RiskSummary {
            portfolio_heat: metrics.portfolio_heat,
            correlation_risk: metrics.correlation_risk,
            var_95: metrics.var_95,
            should_reduce_exposure: Self::exposure_too_high(&metrics),
            current_drawdown: metrics.current_drawdown,
            risk_level: Self::classify(&metrics),
        }
    }
}
