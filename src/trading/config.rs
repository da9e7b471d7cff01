//! Session configuration: position sizing, per-strategy ladders and session guard limits.

use std::collections::HashSet;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{LegConfig, OrderType, StrategyId, StrategyKind};

/// Upper bound on ladder length.
pub const MAX_LEGS: usize = 50;

/// Configuration errors. All of them are fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON or has an unknown strategy kind
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Allocation fraction outside (0, 1]
    #[error("{field} must be in (0, 1], got {value}")]
    Allocation { field: String, value: Decimal },

    /// min_allocation above max_allocation
    #[error("min_allocation {min} exceeds max_allocation {max}")]
    AllocationBounds { min: Decimal, max: Decimal },

    /// Any other out-of-range scalar
    #[error("invalid {field}: {reason}")]
    Parameter { field: String, reason: String },

    /// Malformed leg arrays for a strategy instance
    #[error("invalid ladder for {strategy}: {reason}")]
    Ladder { strategy: String, reason: String },

    /// Same (kind, symbol) configured twice
    #[error("duplicate strategy instance {0}")]
    DuplicateStrategy(String),
}

fn parameter(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Parameter {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn check_fraction(field: &str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(ConfigError::Allocation {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

/// Position sizing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    /// Base allocation of the balance
    Fixed,
    /// Base allocation of the balance
    Percentage,
    /// Scale inversely to the symbol's realized volatility
    VolatilityAdjusted,
    /// Penalize loss streaks, reward high win rates
    PerformanceBased,
    /// Scale inversely to the strategy's return volatility
    RiskParity,
    /// Fractional Kelly on the strategy's edge
    KellyCriterion,
}

impl SizingMethod {
    pub const ALL: [SizingMethod; 6] = [
        SizingMethod::Fixed,
        SizingMethod::Percentage,
        SizingMethod::VolatilityAdjusted,
        SizingMethod::PerformanceBased,
        SizingMethod::RiskParity,
        SizingMethod::KellyCriterion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SizingMethod::Fixed => "fixed",
            SizingMethod::Percentage => "percentage",
            SizingMethod::VolatilityAdjusted => "volatility_adjusted",
            SizingMethod::PerformanceBased => "performance_based",
            SizingMethod::RiskParity => "risk_parity",
            SizingMethod::KellyCriterion => "kelly_criterion",
        }
    }
}

/// Parameters for dynamic position sizing. Read-only for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSizingConfig {
    /// Which position sizing method to use
    pub method: SizingMethod,

    /// Fraction of the balance a plain leg is sized at
    pub base_allocation: Decimal,

    /// Lower bound on any order's notional, as a fraction of the balance
    pub min_allocation: Decimal,

    /// Upper bound on any order's notional, as a fraction of the balance
    pub max_allocation: Decimal,

    /// Volatility the volatility-adjusted method targets
    pub target_volatility: f64,

    /// Number of symbol returns used for realized volatility
    pub lookback_period: usize,

    /// Number of recent trades per strategy used for performance metrics
    pub performance_lookback: usize,

    /// Cap on the performance-based boost
    pub performance_multiplier: f64,

    /// Fraction of Kelly to use (0.0 to 1.0, typically 0.25)
    pub kelly_fraction: f64,

    /// Minimum average return before Kelly sizing applies
    pub min_edge: f64,
}

impl Default for PositionSizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::Percentage,
            base_allocation: dec!(0.05), // 5% of balance
            min_allocation: dec!(0.01),  // 1% floor
            max_allocation: dec!(0.15),  // 15% cap
            target_volatility: 0.15,
            lookback_period: 20,
            performance_lookback: 10,
            performance_multiplier: 1.5,
            kelly_fraction: 0.25, // Quarter Kelly
            min_edge: 0.02,
        }
    }
}

impl PositionSizingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("base_allocation", self.base_allocation)?;
        check_fraction("min_allocation", self.min_allocation)?;
        check_fraction("max_allocation", self.max_allocation)?;

        if self.min_allocation > self.max_allocation {
            return Err(ConfigError::AllocationBounds {
                min: self.min_allocation,
                max: self.max_allocation,
            });
        }
        if !(self.target_volatility > 0.0) {
            return Err(parameter("target_volatility", "must be positive"));
        }
        if self.lookback_period == 0 {
            return Err(parameter("lookback_period", "must be at least 1"));
        }
        if self.performance_lookback == 0 {
            return Err(parameter("performance_lookback", "must be at least 1"));
        }
        if !(self.performance_multiplier >= 1.0) {
            return Err(parameter("performance_multiplier", "must be at least 1.0"));
        }
        if !(self.kelly_fraction > 0.0 && self.kelly_fraction <= 1.0) {
            return Err(parameter("kelly_fraction", "must be in (0, 1]"));
        }
        if !(self.min_edge >= 0.0) {
            return Err(parameter("min_edge", "must be non-negative"));
        }
        Ok(())
    }
}

/// One strategy instance: a kind trading a symbol, with its leg ladder.
///
/// Leg arrays are indexed by leg; arrays shorter than `max_orders` repeat
/// their last element. All percentages are in percent units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    pub kind: StrategyKind,
    pub symbol: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Share of capital assigned to this instance
    #[serde(default = "default_capital_allocation")]
    pub capital_allocation: Decimal,

    /// Entry trigger price (cdm: at or below, wdm: at or above)
    #[serde(default)]
    pub price_trigger: Option<Decimal>,

    /// Zone center for zone-anchored kinds
    #[serde(default)]
    pub zone_center_price: Option<Decimal>,

    /// Number of legs in the ladder
    #[serde(default = "default_max_orders")]
    pub max_orders: usize,

    /// `order_distances[i]`: additional move after leg i+1 fills that triggers leg i+2
    #[serde(default = "default_order_distances")]
    pub order_distances: Vec<Decimal>,

    /// Size multiplier per leg
    #[serde(default = "default_order_sizes")]
    pub order_sizes: Vec<Decimal>,

    /// Take-profit % per leg
    #[serde(default = "default_order_tps")]
    pub order_tps: Vec<Decimal>,

    #[serde(default = "default_true")]
    pub trailing_stops: bool,

    /// Unrealized profit % that activates trailing, per leg
    #[serde(default = "default_trailing_trigger")]
    pub trailing_trigger_pct: Vec<Decimal>,

    /// Trailing stop distance %, per leg
    #[serde(default = "default_trailing_distance")]
    pub trailing_distance_pct: Vec<Decimal>,

    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
}

fn default_true() -> bool {
    true
}
fn default_capital_allocation() -> Decimal {
    dec!(0.25)
}
fn default_max_orders() -> usize {
    5
}
fn default_order_distances() -> Vec<Decimal> {
    vec![dec!(1.0), dec!(1.5), dec!(2.0), dec!(2.5), dec!(3.0)]
}
fn default_order_sizes() -> Vec<Decimal> {
    vec![dec!(1.0), dec!(1.5), dec!(2.0), dec!(2.5), dec!(3.0)]
}
fn default_order_tps() -> Vec<Decimal> {
    vec![dec!(2.0)]
}
fn default_trailing_trigger() -> Vec<Decimal> {
    vec![dec!(5.0)]
}
fn default_trailing_distance() -> Vec<Decimal> {
    vec![dec!(1.0)]
}
fn default_order_type() -> OrderType {
    OrderType::Market
}

/// Element `i`, or the last element when the array is shorter.
fn leg_value(values: &[Decimal], i: usize) -> Decimal {
    values
        .get(i)
        .or_else(|| values.last())
        .copied()
        .unwrap_or(Decimal::ZERO)
}

impl StrategySettings {
    pub fn new(kind: StrategyKind, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            enabled: true,
            capital_allocation: default_capital_allocation(),
            price_trigger: None,
            zone_center_price: None,
            max_orders: default_max_orders(),
            order_distances: default_order_distances(),
            order_sizes: default_order_sizes(),
            order_tps: default_order_tps(),
            trailing_stops: true,
            trailing_trigger_pct: default_trailing_trigger(),
            trailing_distance_pct: default_trailing_distance(),
            order_type: default_order_type(),
        }
    }

    pub fn id(&self) -> StrategyId {
        StrategyId::new(self.kind, self.symbol.clone())
    }

    /// Expand the per-leg arrays into `max_orders` leg configs.
    ///
    /// Leg 1 triggers at the anchor; leg k's cumulative distance is the sum
    /// of the first k-1 order distances.
    pub fn ladder(&self) -> Vec<LegConfig> {
        let mut cumulative = Decimal::ZERO;
        (0..self.max_orders)
            .map(|i| {
                if i > 0 {
                    cumulative += leg_value(&self.order_distances, i - 1);
                }
                LegConfig {
                    trigger_distance_pct: cumulative,
                    size_multiplier: leg_value(&self.order_sizes, i),
                    take_profit_pct: leg_value(&self.order_tps, i),
                    trailing_trigger_pct: leg_value(&self.trailing_trigger_pct, i),
                    trailing_distance_pct: leg_value(&self.trailing_distance_pct, i),
                }
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ladder_error = |reason: String| ConfigError::Ladder {
            strategy: self.id().to_string(),
            reason,
        };

        if self.symbol.trim().is_empty() {
            return Err(parameter("symbol", "must not be empty"));
        }
        check_fraction("capital_allocation", self.capital_allocation)?;

        if self.max_orders == 0 || self.max_orders > MAX_LEGS {
            return Err(ladder_error(format!(
                "max_orders must be between 1 and {}, got {}",
                MAX_LEGS, self.max_orders
            )));
        }

        let arrays: [(&str, &Vec<Decimal>); 5] = [
            ("order_distances", &self.order_distances),
            ("order_sizes", &self.order_sizes),
            ("order_tps", &self.order_tps),
            ("trailing_trigger_pct", &self.trailing_trigger_pct),
            ("trailing_distance_pct", &self.trailing_distance_pct),
        ];
        for (name, values) in arrays {
            if values.is_empty() {
                return Err(ladder_error(format!("{} is empty", name)));
            }
            if values.len() > MAX_LEGS {
                return Err(ladder_error(format!("{} has more than {} entries", name, MAX_LEGS)));
            }
            if values.iter().any(|v| *v < Decimal::ZERO) {
                return Err(ladder_error(format!("{} contains a negative value", name)));
            }
        }
        if self.order_sizes.iter().any(|v| *v <= Decimal::ZERO) {
            return Err(ladder_error("order_sizes must be positive".to_string()));
        }

        for (name, price) in [
            ("price_trigger", self.price_trigger),
            ("zone_center_price", self.zone_center_price),
        ] {
            if matches!(price, Some(p) if p <= Decimal::ZERO) {
                return Err(parameter(name, "must be positive"));
            }
        }
        Ok(())
    }
}

/// Limits that gate new cycles and trigger emergency flattening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Maximum number of cycles open at once across all instances
    pub max_concurrent_cycles: usize,

    /// Enforce the daily loss limit
    pub enable_daily_limits: bool,

    /// Realized loss per UTC day that halts new cycles
    pub daily_loss_limit: Decimal,

    /// Completed cycles per UTC day before new cycles are refused
    pub max_cycles_per_day: u32,

    /// Flatten everything when a threshold below is hit
    pub enable_emergency_exit: bool,

    /// Total loss that triggers an emergency exit
    pub emergency_loss_threshold: Decimal,

    /// Drawdown % that triggers an emergency exit
    pub emergency_drawdown_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_concurrent_cycles: 100,
            enable_daily_limits: false,
            daily_loss_limit: dec!(1000),
            max_cycles_per_day: 1000,
            enable_emergency_exit: true,
            emergency_loss_threshold: dec!(5000), // $5000
            emergency_drawdown_threshold: 15.0,   // 15%
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_cycles == 0 {
            return Err(parameter("max_concurrent_cycles", "must be at least 1"));
        }
        if self.daily_loss_limit <= Decimal::ZERO {
            return Err(parameter("daily_loss_limit", "must be positive"));
        }
        if self.max_cycles_per_day == 0 {
            return Err(parameter("max_cycles_per_day", "must be at least 1"));
        }
        if self.emergency_loss_threshold <= Decimal::ZERO {
            return Err(parameter("emergency_loss_threshold", "must be positive"));
        }
        if !(self.emergency_drawdown_threshold > 0.0 && self.emergency_drawdown_threshold <= 100.0) {
            return Err(parameter("emergency_drawdown_threshold", "must be in (0, 100]"));
        }
        Ok(())
    }
}

/// Everything a trading session needs, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Starting account balance
    #[serde(default = "default_balance")]
    pub account_balance: Decimal,

    /// Annual risk-free rate for ratio reports
    #[serde(default)]
    pub risk_free_rate: f64,

    #[serde(default)]
    pub sizing: PositionSizingConfig,

    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub strategies: Vec<StrategySettings>,
}

fn default_balance() -> Decimal {
    dec!(50000)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            account_balance: default_balance(),
            risk_free_rate: 0.0,
            sizing: PositionSizingConfig::default(),
            guard: GuardConfig::default(),
            strategies: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON config string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_balance <= Decimal::ZERO {
            return Err(parameter("account_balance", "must be positive"));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(parameter("risk_free_rate", "must be finite"));
        }
        self.sizing.validate()?;
        self.guard.validate()?;

        let mut seen = HashSet::new();
        let mut total_allocation = Decimal::ZERO;
        for strategy in &self.strategies {
            strategy.validate()?;
            if !seen.insert(strategy.id()) {
                return Err(ConfigError::DuplicateStrategy(strategy.id().to_string()));
            }
            if strategy.enabled {
                total_allocation += strategy.capital_allocation;
            }
        }
        if total_allocation > Decimal::ONE {
            return Err(parameter(
                "capital_allocation",
                format!("enabled strategies allocate {} of capital, above 1", total_allocation),
            ));
        }
        Ok(())
    }

    pub fn enabled_strategies(&self) -> impl Iterator<Item = &StrategySettings> {
        self.strategies.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_cumulative_distances() {
        let settings = StrategySettings {
            max_orders: 3,
            order_distances: vec![dec!(2), dec!(3), dec!(4)],
            ..StrategySettings::new(StrategyKind::ContrarianDca, "AAPL")
        };

        let ladder = settings.ladder();
        assert_eq!(ladder.len(), 3);
        assert_eq!(ladder[0].trigger_distance_pct, dec!(0));
        assert_eq!(ladder[1].trigger_distance_pct, dec!(2));
        // 3% beyond leg 2's trigger, not 3% from the anchor
        assert_eq!(ladder[2].trigger_distance_pct, dec!(5));
    }

    #[test]
    fn test_short_arrays_repeat_last() {
        let settings = StrategySettings {
            max_orders: 4,
            order_distances: vec![dec!(1)],
            order_sizes: vec![dec!(1), dec!(2)],
            ..StrategySettings::new(StrategyKind::ZeroRiskMartingale, "MSFT")
        };

        let ladder = settings.ladder();
        let distances: Vec<_> = ladder.iter().map(|l| l.trigger_distance_pct).collect();
        let sizes: Vec<_> = ladder.iter().map(|l| l.size_multiplier).collect();
        assert_eq!(distances, vec![dec!(0), dec!(1), dec!(2), dec!(3)]);
        assert_eq!(sizes, vec![dec!(1), dec!(2), dec!(2), dec!(2)]);
        assert!(ladder.iter().all(|l| l.take_profit_pct == dec!(2)));
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{
            "account_balance": "10000",
            "sizing": { "method": "kelly_criterion", "base_allocation": "0.25", "max_allocation": "0.3" },
            "strategies": [
                { "kind": "cdm", "symbol": "AAPL", "capital_allocation": "0.5" },
                { "kind": "izrm", "symbol": "AAPL", "zone_center_price": "150", "capital_allocation": "0.5" }
            ]
        }"#;

        let config = SessionConfig::from_json(json).unwrap();
        assert_eq!(config.account_balance, dec!(10000));
        assert_eq!(config.sizing.method, SizingMethod::KellyCriterion);
        assert_eq!(config.sizing.min_allocation, dec!(0.01));
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.strategies[1].kind, StrategyKind::InverseZeroRiskMartingale);
        assert_eq!(config.strategies[1].zone_center_price, Some(dec!(150)));
    }

    #[test]
    fn test_unknown_kind_fails_at_load() {
        let json = r#"{ "strategies": [ { "kind": "grid", "symbol": "AAPL" } ] }"#;
        let err = SessionConfig::from_json(json).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_validation_rejections() {
        let mut config = SessionConfig::default();
        config.sizing.min_allocation = dec!(0.2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AllocationBounds { .. })
        ));

        let mut config = SessionConfig::default();
        config.sizing.base_allocation = dec!(1.5);
        assert!(matches!(config.validate(), Err(ConfigError::Allocation { .. })));

        let mut config = SessionConfig::default();
        config.sizing.kelly_fraction = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Parameter { .. })));

        let mut config = SessionConfig::default();
        config.account_balance = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        let mut settings = StrategySettings::new(StrategyKind::WeightedDca, "AAPL");
        settings.max_orders = 51;
        config.strategies.push(settings);
        assert!(matches!(config.validate(), Err(ConfigError::Ladder { .. })));

        let mut config = SessionConfig::default();
        let mut settings = StrategySettings::new(StrategyKind::WeightedDca, "AAPL");
        settings.order_sizes = vec![dec!(1), dec!(0)];
        config.strategies.push(settings);
        assert!(matches!(config.validate(), Err(ConfigError::Ladder { .. })));

        let mut config = SessionConfig::default();
        let mut settings = StrategySettings::new(StrategyKind::WeightedDca, "AAPL");
        settings.order_distances = vec![dec!(1), dec!(-1)];
        config.strategies.push(settings);
        assert!(matches!(config.validate(), Err(ConfigError::Ladder { .. })));
    }

    #[test]
    fn test_duplicate_instances_rejected() {
        let mut config = SessionConfig::default();
        config.strategies.push(StrategySettings::new(StrategyKind::ContrarianDca, "AAPL"));
        config.strategies.push(StrategySettings::new(StrategyKind::ContrarianDca, "AAPL"));

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStrategy(_)));
        assert_eq!(err.to_string(), "duplicate strategy instance cdm_AAPL");
    }

    #[test]
    fn test_total_capital_allocation() {
        let mut config = SessionConfig::default();
        for symbol in ["AAPL", "MSFT", "NVDA", "TSLA", "AMZN"] {
            config.strategies.push(StrategySettings::new(StrategyKind::ContrarianDca, symbol));
        }
        // 5 x 0.25
        assert!(config.validate().is_err());

        config.strategies[4].enabled = false;
        assert!(config.validate().is_ok());
    }
}
