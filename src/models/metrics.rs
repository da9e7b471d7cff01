//! Performance and risk metric records shared between tracker, monitor and sizer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Rolling performance of one strategy instance over the lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// When these metrics were calculated
    pub calculated_at: DateTime<Utc>,

    /// Number of trades in the window
    pub trade_count: usize,

    // === Win/Loss Metrics ===
    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Mean fractional return per trade
    pub avg_return: f64,

    /// Population standard deviation of trade returns
    pub volatility: f64,

    /// avg_return / volatility
    pub sharpe_ratio: f64,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    /// Largest peak-to-trough fall of cumulative P&L, as a fraction of the peak
    pub max_drawdown: f64,

    // === Recent Performance ===
    /// Sum of P&L over the window
    pub recent_pnl: Decimal,

    /// Losses in a row, counted back from the newest trade
    pub consecutive_losses: u32,

    /// Wins in a row, counted back from the newest trade
    pub consecutive_wins: u32,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            calculated_at: Utc::now(),
            trade_count: 0,
            win_rate: 0.0,
            avg_return: 0.0,
            volatility: 0.0,
            sharpe_ratio: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            recent_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            consecutive_wins: 0,
        }
    }

    pub fn has_history(&self) -> bool {
        self.trade_count > 0
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Discrete portfolio risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
    VeryAggressive,
}

impl RiskLevel {
    /// Map a threshold point score to a level.
    pub fn from_score(score: u32) -> Self {
        match score {
            0 => RiskLevel::Conservative,
            1..=2 => RiskLevel::Moderate,
            3..=4 => RiskLevel::Aggressive,
            _ => RiskLevel::VeryAggressive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Conservative => "CONSERVATIVE",
            RiskLevel::Moderate => "MODERATE",
            RiskLevel::Aggressive => "AGGRESSIVE",
            RiskLevel::VeryAggressive => "VERY_AGGRESSIVE",
        }
    }
}

/// Process-wide risk figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Estimated capital at risk as a percentage of open position value
    pub portfolio_heat: f64,

    /// Mean pairwise |correlation| across strategy return series
    pub correlation_risk: f64,

    /// 95% Value-at-Risk in percent (0 with fewer than 20 samples)
    pub var_95: f64,

    /// Latest drawdown from peak equity in percent
    pub current_drawdown: f64,

    /// Worst drawdown seen this session in percent
    pub max_drawdown: f64,
}

/// Reporting view of the risk monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub portfolio_heat: f64,
    pub correlation_risk: f64,
    pub var_95: f64,
    pub should_reduce_exposure: bool,
    pub current_drawdown: f64,
    pub risk_level: RiskLevel,
}

impl std::fmt::Display for RiskSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Risk Summary ===")?;
        writeln!(f, "Portfolio Heat:   {:.2}%", self.portfolio_heat)?;
        writeln!(f, "Correlation Risk: {:.3}", self.correlation_risk)?;
        writeln!(f, "VaR (95%):        {:.2}%", self.var_95)?;
        writeln!(f, "Drawdown:         {:.2}%", self.current_drawdown)?;
        writeln!(f, "Risk Level:       {}", self.risk_level.as_str())?;
        writeln!(
            f,
            "Reduce Exposure:  {}",
            if self.should_reduce_exposure { "Yes" } else { "No" }
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_buckets() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Conservative);
        assert_eq!(RiskLevel::from_score(1), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(2), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(3), RiskLevel::Aggressive);
        assert_eq!(RiskLevel::from_score(4), RiskLevel::Aggressive);
        assert_eq!(RiskLevel::from_score(5), RiskLevel::VeryAggressive);
        assert_eq!(RiskLevel::from_score(6), RiskLevel::VeryAggressive);
    }
}
