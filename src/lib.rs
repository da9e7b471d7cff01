//! Martingale-ladder trading core.
//!
//! Opens a position per strategy instance, adds legs on configured price
//! moves, tracks the blended cost basis and closes the cycle via take-profit
//! or a trailing stop. Leg sizes come from a dynamic position sizer fed by
//! per-strategy performance and portfolio-level risk analytics.

pub mod execution;
pub mod metrics;
pub mod models;
pub mod trading;
