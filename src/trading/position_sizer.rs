//! Dynamic position sizing: percentage, volatility, performance, risk parity and Kelly.
//!
//! Every method produces a multiplier on the base notional; the result is
//! then clamped to the account-level allocation bounds. Sizing never fails:
//! any computation error falls back to plain percentage sizing.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use statrs::statistics::Statistics;
use tracing::{debug, warn};

use super::config::{PositionSizingConfig, SizingMethod};
use super::PerformanceTracker;
use crate::models::{PerformanceMetrics, StrategyId};

/// Volatility assumed when there is not enough history.
const DEFAULT_VOLATILITY: f64 = 0.15;
/// Risk parity volatility target.
const RISK_PARITY_TARGET: f64 = 0.15;

/// Inputs to one sizing call.
#[derive(Debug, Clone)]
pub struct SizingRequest {
    pub strategy: StrategyId,
    pub account_balance: Decimal,
    pub price: Decimal,
    pub method: SizingMethod,
    /// Ladder leg size multiplier (1 for a plain entry)
    pub size_multiplier: Decimal,
}

impl SizingRequest {
    pub fn new(strategy: StrategyId, account_balance: Decimal, price: Decimal, method: SizingMethod) -> Self {
        Self {
            strategy,
            account_balance,
            price,
            method,
            size_multiplier: Decimal::ONE,
        }
    }

    pub fn with_multiplier(mut self, size_multiplier: Decimal) -> Self {
        self.size_multiplier = size_multiplier;
        self
    }
}

/// Outcome of a sizing call.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingDecision {
    /// Order quantity (notional / price)
    pub quantity: Decimal,
    /// Final notional after the allocation clamp
    pub notional: Decimal,
    /// balance × base_allocation × leg multiplier
    pub base_notional: Decimal,
    /// Method multiplier applied to the base notional
    pub multiplier: f64,
    pub method: SizingMethod,
    /// True when the method failed and percentage sizing was used instead
    pub fell_back: bool,
}

// ==================== Method Multipliers ====================

/// target / max(realized, 1%), clamped to [0.5, 2.0].
pub fn volatility_multiplier(target_volatility: f64, returns: &[f64]) -> f64 {
    let realized = if returns.len() < 2 {
        DEFAULT_VOLATILITY
    } else {
        returns.population_std_dev()
    };
    (target_volatility / realized.max(0.01)).clamp(0.5, 2.0)
}

/// Loss-streak penalty and win-rate boost.
pub fn performance_multiplier(metrics: &PerformanceMetrics, max_boost: f64) -> f64 {
    let mut multiplier = 1.0;

    if metrics.consecutive_losses >= 3 {
        let penalty = 0.8f64.powi(metrics.consecutive_losses as i32 - 2);
        multiplier *= penalty.max(0.3);
    }

    if metrics.win_rate > 0.6 && metrics.avg_return > 0.0 {
        let boost = 1.0 + (metrics.win_rate - 0.5) * max_boost;
        multiplier *= boost.min(max_boost);
    }

    multiplier
}

/// 15% / strategy volatility, clamped to [0.5, 2.0].
pub fn risk_parity_multiplier(strategy_volatility: Option<f64>) -> f64 {
    let volatility = match strategy_volatility {
        Some(v) if v > 0.0 => v,
        _ => DEFAULT_VOLATILITY,
    };
    (RISK_PARITY_TARGET / volatility).clamp(0.5, 2.0)
}

/// Fractional Kelly on the average return; 0.5× without an edge.
pub fn kelly_multiplier(metrics: &PerformanceMetrics, kelly_fraction: f64, min_edge: f64) -> f64 {
    if metrics.win_rate <= 0.5 || metrics.avg_return <= 0.0 {
        return 0.5;
    }

    let edge = metrics.avg_return;
    if edge >= min_edge {
        (edge * kelly_fraction).clamp(0.1, 1.0)
    } else {
        0.5
    }
}

/// Calculator for order quantities.
pub struct PositionSizer {
    config: PositionSizingConfig,
    tracker: Arc<PerformanceTracker>,
}

impl PositionSizer {
    /// Create a new position sizer with given config.
    pub fn new(config: PositionSizingConfig, tracker: Arc<PerformanceTracker>) -> Self {
        Self { config, tracker }
    }

    pub fn config(&self) -> &PositionSizingConfig {
        &self.config
    }

    /// Size an order. Falls back to percentage sizing on any error.
    pub fn size(&self, request: &SizingRequest) -> SizingDecision {
        match self.try_size(request) {
            Ok(decision) => {
                debug!(
                    strategy = %request.strategy,
                    method = request.method.as_str(),
                    base = %decision.base_notional,
                    multiplier = decision.multiplier,
                    notional = %decision.notional,
                    quantity = %decision.quantity,
                    "Position sized"
                );
                decision
            }
            Err(e) => {
                warn!(
                    strategy = %request.strategy,
                    method = request.method.as_str(),
                    error = %e,
                    "Sizing failed, falling back to percentage sizing"
                );
                self.fallback(request)
            }
        }
    }

    fn base_notional(&self, request: &SizingRequest) -> Decimal {
        request.account_balance * self.config.base_allocation * request.size_multiplier
    }

    fn try_size(&self, request: &SizingRequest) -> Result<SizingDecision> {
        if request.price <= Decimal::ZERO {
            bail!("non-positive price {}", request.price);
        }
        if request.account_balance <= Decimal::ZERO {
            bail!("non-positive account balance {}", request.account_balance);
        }

        let multiplier = self.multiplier(request);
        if !multiplier.is_finite() || multiplier < 0.0 {
            bail!("invalid multiplier {}", multiplier);
        }

        let base_notional = self.base_notional(request);
        let adjusted = base_notional
            * Decimal::try_from(multiplier).context("multiplier out of decimal range")?;
        let notional = self.clamp_notional(adjusted, request.account_balance);

        Ok(SizingDecision {
            quantity: notional / request.price,
            notional,
            base_notional,
            multiplier,
            method: request.method,
            fell_back: false,
        })
    }

    fn multiplier(&self, request: &SizingRequest) -> f64 {
        let cfg = &self.config;
        match request.method {
            SizingMethod::Fixed | SizingMethod::Percentage => 1.0,
            SizingMethod::VolatilityAdjusted => {
                let returns = self
                    .tracker
                    .symbol_returns(&request.strategy.symbol, cfg.lookback_period);
                volatility_multiplier(cfg.target_volatility, &returns)
            }
            SizingMethod::PerformanceBased => {
                let metrics = self.tracker.metrics(&request.strategy);
                performance_multiplier(&metrics, cfg.performance_multiplier)
            }
            SizingMethod::RiskParity => {
                risk_parity_multiplier(self.tracker.strategy_volatility(&request.strategy))
            }
            SizingMethod::KellyCriterion => {
                let metrics = self.tracker.metrics(&request.strategy);
                kelly_multiplier(&metrics, cfg.kelly_fraction, cfg.min_edge)
            }
        }
    }

    /// Clamp to [min_allocation × balance, max_allocation × balance].
    fn clamp_notional(&self, notional: Decimal, balance: Decimal) -> Decimal {
        let floor = balance * self.config.min_allocation;
        let cap = balance * self.config.max_allocation;
        notional.max(floor).min(cap)
    }

    fn fallback(&self, request: &SizingRequest) -> SizingDecision {
        let base_notional = self.base_notional(request);
        let (notional, quantity) = if request.price > Decimal::ZERO {
            let notional = self.clamp_notional(base_notional, request.account_balance);
            (notional, notional / request.price)
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };

        SizingDecision {
            quantity,
            notional,
            base_notional,
            multiplier: 1.0,
            method: request.method,
            fell_back: true,
        }
    }

    /// Strategy capital allocation adjusted for recent performance.
    pub fn recommended_allocation(allocation: Decimal, metrics: &PerformanceMetrics) -> Decimal {
        let factor = if metrics.consecutive_losses >= 3 {
            0.8f64.powi(metrics.consecutive_losses as i32 - 2).max(0.3)
        } else if metrics.win_rate > 0.6 && metrics.avg_return > 0.0 {
            (1.0 + (metrics.win_rate - 0.5) * 0.5).min(1.5)
        } else {
            return allocation;
        };

        allocation * Decimal::try_from(factor).unwrap_or(Decimal::ONE)
    }
}
