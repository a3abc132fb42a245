// =============================================================================
// Moving Average Convergence/Divergence (MACD)
// =============================================================================
//
// line      = EMA(fast) - EMA(slow)
// signal    = EMA(line, signal_period)
// histogram = line - signal
//
// The EMA seeds with the SMA of the first `period` values, then applies the
// standard smoothing factor k = 2 / (period + 1).
// =============================================================================

use serde::{Deserialize, Serialize};

/// Latest MACD line, signal and histogram values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MacdResult {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD over `closes` with the given fast/slow/signal periods (12/26/9 in
/// the classic parameterisation). All-zero result on insufficient data.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdResult {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return MacdResult::default();
    }
    // Need enough closes for the slow EMA plus a signal series worth of
    // MACD-line points.
    if closes.len() < slow + signal_period {
        return MacdResult::default();
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return MacdResult::default();
    }

    // Align the two EMA series on their tails; the slow series is shorter.
    let offset = fast_series.len() - slow_series.len();
    let line_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, &s)| fast_series[i + offset] - s)
        .collect();

    let signal_series = ema_series(&line_series, signal_period);
    let (line, signal) = match (line_series.last(), signal_series.last()) {
        (Some(&l), Some(&s)) => (l, s),
        _ => return MacdResult::default(),
    };

    MacdResult {
        line,
        signal,
        histogram: line - signal,
    }
}

/// Exponential moving average series seeded with the SMA of the first
/// `period` values. Empty when `values.len() < period`.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &v in &values[period..] {
        prev = (v - prev) * k + prev;
        result.push(prev);
    }

    result
}

// =============================================================================
// Tests
// =============================================================================
