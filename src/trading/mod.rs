//! Trading logic: ladder cycles, position sizing, risk and session wiring.

mod config;
mod cycle_engine;
mod guard;
mod performance;
mod position_sizer;
mod risk;
mod session;

pub use config::{
    ConfigError, GuardConfig, PositionSizingConfig, SessionConfig, SizingMethod, StrategySettings,
    MAX_LEGS,
};
pub use cycle_engine::{CycleEngine, CycleStatusReport, OrderIntent};
pub use guard::SessionGuard;
pub use performance::PerformanceTracker;
pub use position_sizer::{
    kelly_multiplier, performance_multiplier, risk_parity_multiplier, volatility_multiplier,
    PositionSizer, SizingDecision, SizingRequest,
};
pub use risk::{RiskMonitor, RiskSnapshot};
pub use session::{MarketTick, TickOutcome, TradingSession};
