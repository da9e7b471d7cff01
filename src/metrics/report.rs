//! Equity-curve metrics report and display formatting.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ratios;

/// How a metric value is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Plain ratio, 3 decimals
    Ratio,
    /// Already in percent, 2 decimals with a `%` suffix
    Percent,
}

/// Render a metric so that infinities and NaN never look like numeric zero.
pub fn format_metric(value: f64, unit: MetricUnit) -> String {
    if value.is_nan() {
        return "N/A".to_string();
    }
    if value == f64::INFINITY {
        return "∞".to_string();
    }
    if value == f64::NEG_INFINITY {
        return "-∞".to_string();
    }
    match unit {
        MetricUnit::Ratio => format!("{:.3}", value),
        MetricUnit::Percent => format!("{:.2}%", value),
    }
}

/// Offline evaluation of an equity curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Number of equity points evaluated
    pub periods: usize,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub recovery_factor: f64,
    pub sterling_ratio: f64,
    pub burke_ratio: f64,
    pub martin_ratio: f64,
    /// Percent
    pub pain_index: f64,
    pub gain_to_pain_ratio: f64,
    /// Percent of periods spent in drawdown
    pub lake_ratio: f64,
    /// Percent, from a single buy-and-hold cash flow pair
    pub irr_pct: f64,
}

impl MetricsReport {
    /// Build a report from a sequence of equity values.
    pub fn from_equity_curve(equity: &[f64], risk_free_rate: f64) -> Self {
        let mut report = Self {
            periods: equity.len(),
            ..Default::default()
        };
        if equity.len() < 2 {
            return report;
        }

        let first = equity[0];
        let last = equity[equity.len() - 1];
        if first != 0.0 {
            report.total_return_pct = (last - first) / first * 100.0;
        }
        report.max_drawdown_pct = ratios::drawdown_series(equity).into_iter().fold(0.0, f64::max) * 100.0;
        report.recovery_factor = ratios::recovery_factor(equity);

        let returns = ratios::returns_from_equity(equity);
        if returns.len() > 1 {
            report.sterling_ratio = ratios::sterling_ratio(&returns, risk_free_rate);
            report.burke_ratio = ratios::burke_ratio(&returns, risk_free_rate);
            report.martin_ratio = ratios::martin_ratio(&returns, risk_free_rate);
            report.pain_index = ratios::pain_index(&returns);
            report.gain_to_pain_ratio = ratios::gain_to_pain_ratio(&returns);
            report.lake_ratio = ratios::lake_ratio(&returns);

            let mut cash_flows = vec![0.0; equity.len()];
            cash_flows[0] = -first;
            cash_flows[equity.len() - 1] = last;
            report.irr_pct = ratios::irr(&cash_flows) * 100.0;
        }

        report
    }

    /// Build a report from a series of per-trade fractional returns by
    /// compounding them onto a unit equity curve.
    pub fn from_returns(returns: &[f64], risk_free_rate: f64) -> Self {
        let mut equity = Vec::with_capacity(returns.len() + 1);
        equity.push(1.0);
        for r in returns {
            let prev = equity[equity.len() - 1];
            equity.push(prev * (1.0 + r));
        }
        Self::from_equity_curve(&equity, risk_free_rate)
    }
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MetricUnit::*;

        writeln!(f, "=== Metrics Report ({} periods) ===", self.periods)?;
        writeln!(f, "Total Return:       {}", format_metric(self.total_return_pct, Percent))?;
        writeln!(f, "Max Drawdown:       {}", format_metric(self.max_drawdown_pct, Percent))?;
        writeln!(f, "Recovery Factor:    {}", format_metric(self.recovery_factor, Ratio))?;
        writeln!(f, "Sterling Ratio:     {}", format_metric(self.sterling_ratio, Ratio))?;
        writeln!(f, "Burke Ratio:        {}", format_metric(self.burke_ratio, Ratio))?;
        writeln!(f, "Martin Ratio:       {}", format_metric(self.martin_ratio, Ratio))?;
        writeln!(f, "Pain Index:         {}", format_metric(self.pain_index, Percent))?;
        writeln!(f, "Gain-to-Pain Ratio: {}", format_metric(self.gain_to_pain_ratio, Ratio))?;
        writeln!(f, "Lake Ratio:         {}", format_metric(self.lake_ratio, Percent))?;
        writeln!(f, "IRR:                {}", format_metric(self.irr_pct, Percent))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_metric() {
        assert_eq!(format_metric(f64::INFINITY, MetricUnit::Ratio), "∞");
        assert_eq!(format_metric(f64::NEG_INFINITY, MetricUnit::Percent), "-∞");
        assert_eq!(format_metric(f64::NAN, MetricUnit::Ratio), "N/A");
        assert_eq!(format_metric(0.0, MetricUnit::Ratio), "0.000");
        assert_eq!(format_metric(1.23456, MetricUnit::Ratio), "1.235");
        assert_eq!(format_metric(12.5, MetricUnit::Percent), "12.50%");
    }

    #[test]
    fn test_report_from_equity_curve() {
        let report = MetricsReport::from_equity_curve(&[100.0, 110.0, 99.0, 120.0], 0.0);

        assert_eq!(report.periods, 4);
        assert!((report.total_return_pct - 20.0).abs() < 1e-9);
        assert!((report.max_drawdown_pct - 10.0).abs() < 1e-9);
        assert!((report.recovery_factor - 2.0).abs() < 1e-9);
        assert!((report.lake_ratio - 100.0 / 3.0).abs() < 1e-9);
        // 100 -> 120 over three periods
        let expected_irr = (1.2f64.powf(1.0 / 3.0) - 1.0) * 100.0;
        assert!((report.irr_pct - expected_irr).abs() < 1e-6);
    }

    #[test]
    fn test_report_irr_on_long_curve() {
        // One equity point per tick, 10000 -> 10200 over 200 points
        let equity: Vec<f64> = (0..200).map(|i| 10000.0 + i as f64 * 200.0 / 199.0).collect();
        let report = MetricsReport::from_equity_curve(&equity, 0.0);
        let expected = (1.02f64.powf(1.0 / 199.0) - 1.0) * 100.0;
        assert!(report.irr_pct > 0.0);
        assert!((report.irr_pct - expected).abs() < 1e-6);
    }

    #[test]
    fn test_report_short_curve() {
        let report = MetricsReport::from_equity_curve(&[100.0], 0.0);
        assert_eq!(report, MetricsReport { periods: 1, ..Default::default() });
    }

    #[test]
    fn test_report_renders_infinity() {
        let report = MetricsReport::from_returns(&[0.01, 0.02, 0.03], 0.0);
        let text = report.to_string();
        assert!(text.contains("Sterling Ratio:     ∞"));
        assert!(text.contains("Pain Index:         0.00%"));
    }
}
