// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing
// =============================================================================
//
// True range of bar i:
//   TR_i = max(high_i - low_i, |high_i - close_{i-1}|, |low_i - close_{i-1}|)
//
// ATR seeds with the SMA of the first `period` true ranges, then smooths:
//   ATR_i = (ATR_{i-1} * (period - 1) + TR_i) / period
// =============================================================================

/// Most recent ATR over the given high/low/close series. Returns 0.0 on
/// insufficient or mismatched input (the caller treats zero as "not ready").
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = highs.len();
    if period == 0 || n != lows.len() || n != closes.len() || n < period + 1 {
        return 0.0;
    }

    // True range needs the previous close, so the series starts at bar 1.
    let true_ranges: Vec<f64> = (1..n)
        .map(|i| {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    if true_ranges.len() < period {
        return 0.0;
    }

    let period_f = period as f64;
    let mut value = true_ranges[..period].iter().sum::<f64>() / period_f;

    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    if value.is_finite() {
        value
    } else {
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        (vec![101.0; n], vec![99.0; n], vec![100.0; n])
    }

    #[test]
    fn zero_on_empty_input() {
        assert_eq!(atr(&[], &[], &[], 14), 0.0);
    }

    #[test]
    fn zero_on_mismatched_lengths() {
        assert_eq!(atr(&[1.0, 2.0], &[1.0], &[1.0, 2.0], 1), 0.0);
    }

    #[test]
    fn zero_on_insufficient_data() {
        let (h, l, c) = flat_bars(14);
        // 14 bars => 13 true ranges < period.
        assert_eq!(atr(&h, &l, &c, 14), 0.0);
    }

    #[test]
    fn constant_range_bars() {
        let (h, l, c) = flat_bars(40);
        // Every TR is exactly high - low = 2.0.
        assert!((atr(&h, &l, &c, 14) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn gap_widens_true_range() {
        // A gap from close 100 to a 110..108 bar makes TR = |110 - 100| = 10.
        let mut h = vec![101.0; 20];
        let mut l = vec![99.0; 20];
        let mut c = vec![100.0; 20];
        h.push(110.0);
        l.push(108.0);
        c.push(109.0);
        let with_gap = atr(&h, &l, &c, 14);
        let (h0, l0, c0) = flat_bars(21);
        let without_gap = atr(&h0, &l0, &c0, 14);
        assert!(with_gap > without_gap);
    }

    #[test]
    fn atr_is_non_negative() {
        let h: Vec<f64> = (0..50).map(|x| 100.0 + (x as f64 * 0.9).sin() * 3.0).collect();
        let l: Vec<f64> = h.iter().map(|x| x - 1.5).collect();
        let c: Vec<f64> = h.iter().map(|x| x - 0.7).collect();
        assert!(atr(&h, &l, &c, 14) >= 0.0);
    }
}
