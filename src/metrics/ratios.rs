//! Drawdown-based ratios and IRR over equity curves and return series.
//!
//! Every function needs at least two data points and returns 0 otherwise.
//! A zero denominator yields `f64::INFINITY` when the numerator is positive
//! and 0 when it is not.

use statrs::statistics::Statistics;

/// Periods per year used for annualization.
pub const PERIODS_PER_YEAR: i32 = 252;

const IRR_TOLERANCE: f64 = 1e-6;
const IRR_MAX_ITERATIONS: usize = 100;
const IRR_BISECTION_STEPS: usize = 200;
/// Bisection brackets, narrowest first.
const IRR_BRACKETS: [(f64, f64); 3] = [(-0.5, 1.0), (-0.9, 10.0), (-0.99, 10.0)];

/// (1 + rate)^-t computed through logs; `powi` underflows to zero on long
/// series near -100%.
fn discount(rate: f64, t: usize) -> f64 {
    (-(t as f64) * (1.0 + rate).ln()).exp()
}

/// Net present value of evenly spaced cash flows at `rate`.
pub fn npv(cash_flows: &[f64], rate: f64) -> f64 {
    cash_flows
        .iter()
        .enumerate()
        .filter(|(_, cf)| **cf != 0.0)
        .map(|(t, cf)| cf * discount(rate, t))
        .sum()
}

fn npv_derivative(cash_flows: &[f64], rate: f64) -> f64 {
    cash_flows
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, cf)| **cf != 0.0)
        .map(|(t, cf)| -(t as f64) * cf * discount(rate, t) / (1.0 + rate))
        .sum()
}

/// Internal rate of return of evenly spaced cash flows.
///
/// Newton-Raphson from 10%, then bisection over widening brackets up to
/// (-99%, 1000%). The rate is only accepted when |NPV| at that rate is
/// within 1e-6; otherwise 0.
pub fn irr(cash_flows: &[f64]) -> f64 {
    if cash_flows.len() < 2 {
        return 0.0;
    }

    let accept = |rate: f64| rate.is_finite() && npv(cash_flows, rate).abs() <= IRR_TOLERANCE;

    let mut rate = 0.1;
    for _ in 0..IRR_MAX_ITERATIONS {
        let value = npv(cash_flows, rate);
        if !value.is_finite() || value.abs() <= IRR_TOLERANCE {
            break;
        }
        let slope = npv_derivative(cash_flows, rate);
        if slope == 0.0 || !slope.is_finite() {
            break;
        }
        rate -= value / slope;
        if !rate.is_finite() || rate <= -1.0 {
            break;
        }
    }
    if accept(rate) {
        return rate;
    }

    IRR_BRACKETS
        .iter()
        .find_map(|&(lo, hi)| bisect(cash_flows, lo, hi))
        .unwrap_or(0.0)
}

/// Root of the NPV inside (lo, hi), if the bracket changes sign.
fn bisect(cash_flows: &[f64], mut lo: f64, mut hi: f64) -> Option<f64> {
    let mut f_lo = npv(cash_flows, lo);
    let f_hi = npv(cash_flows, hi);
    if f_lo.is_nan() || f_hi.is_nan() {
        return None;
    }
    if f_lo.abs() <= IRR_TOLERANCE {
        return Some(lo);
    }
    if f_hi.abs() <= IRR_TOLERANCE {
        return Some(hi);
    }
    if f_lo.signum() == f_hi.signum() {
        return None;
    }

    for _ in 0..IRR_BISECTION_STEPS {
        let mid = (lo + hi) / 2.0;
        let f_mid = npv(cash_flows, mid);
        if f_mid.is_nan() {
            return None;
        }
        if f_mid.abs() <= IRR_TOLERANCE {
            return Some(mid);
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }

    let mid = (lo + hi) / 2.0;
    (npv(cash_flows, mid).abs() <= IRR_TOLERANCE).then_some(mid)
}

/// Fractional drawdown from the running peak at each point of `equity`.
pub fn drawdown_series(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::MIN;
    equity
        .iter()
        .map(|&value| {
            peak = peak.max(value);
            if peak > 0.0 {
                (peak - value) / peak
            } else {
                0.0
            }
        })
        .collect()
}

/// Compounded equity curve starting at 1.0, one point per return.
fn compounded(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .scan(1.0, |equity, r| {
            *equity *= 1.0 + r;
            Some(*equity)
        })
        .collect()
}

fn return_drawdowns(returns: &[f64]) -> Vec<f64> {
    drawdown_series(&compounded(returns))
}

/// (1 + mean)^252 - 1
pub fn annualized_return(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    (1.0 + returns.mean()).powi(PERIODS_PER_YEAR) - 1.0
}

fn ratio_or_infinite(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        if numerator > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        numerator / denominator
    }
}

/// Net profit over initial equity times the maximum drawdown.
pub fn recovery_factor(equity: &[f64]) -> f64 {
    if equity.len() < 2 {
        return 0.0;
    }
    let first = equity[0];
    let net_profit = equity[equity.len() - 1] - first;
    let max_drawdown = drawdown_series(equity).into_iter().fold(0.0, f64::max);

    ratio_or_infinite(net_profit, first * max_drawdown)
}

/// Excess annualized return over the mean of non-zero drawdowns.
pub fn sterling_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let excess = annualized_return(returns) - risk_free_rate;
    let in_drawdown: Vec<f64> = return_drawdowns(returns).into_iter().filter(|d| *d > 0.0).collect();
    let avg_drawdown = if in_drawdown.is_empty() {
        0.0
    } else {
        in_drawdown.mean()
    };

    ratio_or_infinite(excess, avg_drawdown)
}

/// Excess annualized return over sqrt(sum of squared drawdowns).
pub fn burke_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let excess = annualized_return(returns) - risk_free_rate;
    let denominator = return_drawdowns(returns).iter().map(|d| d * d).sum::<f64>().sqrt();

    ratio_or_infinite(excess, denominator)
}

/// Root mean squared drawdown.
pub fn ulcer_index(returns: &[f64]) -> f64 {
    let drawdowns = return_drawdowns(returns);
    if drawdowns.is_empty() {
        return 0.0;
    }
    (drawdowns.iter().map(|d| d * d).sum::<f64>() / drawdowns.len() as f64).sqrt()
}

/// Excess annualized return over the Ulcer Index.
pub fn martin_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let excess = annualized_return(returns) - risk_free_rate;
    ratio_or_infinite(excess, ulcer_index(returns))
}

/// Mean drawdown, in percent.
pub fn pain_index(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    return_drawdowns(returns).mean() * 100.0
}

/// Total compounded return over the Pain Index (as a fraction).
pub fn gain_to_pain_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let total_return = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
    ratio_or_infinite(total_return, pain_index(returns) / 100.0)
}

/// Share of periods spent below the running peak, in percent.
pub fn lake_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let drawdowns = return_drawdowns(returns);
    let underwater = drawdowns.iter().filter(|d| **d > 0.0).count();
    underwater as f64 / drawdowns.len() as f64 * 100.0
}

/// Simple period returns of an equity curve.
pub fn returns_from_equity(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}
