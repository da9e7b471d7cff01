//! Performance analytics: rolling strategy metrics and equity-curve ratios.

mod calculator;
pub mod ratios;
mod report;

pub use calculator::MetricsCalculator;
pub use ratios::{
    burke_ratio, gain_to_pain_ratio, irr, lake_ratio, martin_ratio, pain_index, recovery_factor,
    sterling_ratio,
};
pub use report::{format_metric, MetricUnit, MetricsReport};
