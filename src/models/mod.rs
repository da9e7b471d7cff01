//! Data models for strategies, cycles, orders, trades and metrics.

mod cycle;
mod metrics;
mod order;
mod strategy;
mod trade;

pub use cycle::{Cycle, CycleResult, CycleStatus, ExitReason, Leg, LegConfig, TrailingStopState};
pub use metrics::{PerformanceMetrics, RiskLevel, RiskMetrics, RiskSummary};
pub use order::{BrokerPosition, Fill, OrderAck, OrderAction, OrderPurpose, OrderRequest, OrderType};
pub use strategy::{
    AnchorMode, Direction, LadderGeometry, LegStep, StrategyId, StrategyKind, UnknownStrategyKind,
};
pub use trade::TradeRecord;
