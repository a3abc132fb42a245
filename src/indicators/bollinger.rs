// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(period)
// upper  = middle + std_dev_multiplier * sigma
// lower  = middle - std_dev_multiplier * sigma
//
// `position` locates the last close inside the band: 0.0 at the lower band,
// 1.0 at the upper band, clamped when price escapes the band.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Bollinger band values for the most recent close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Last close's location in the band, clamped to [0, 1].
    pub position: f64,
}

impl Default for BollingerBands {
    fn default() -> Self {
        Self {
            upper: 0.0,
            middle: 0.0,
            lower: 0.0,
            position: 0.5,
        }
    }
}

/// Bollinger bands over the trailing `period` closes with the given standard
/// deviation multiplier. Neutral default on insufficient data.
pub fn bollinger(closes: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    if period == 0 || closes.len() < period {
        return BollingerBands::default();
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();

    let upper = middle + std_dev * sigma;
    let lower = middle - std_dev * sigma;

    let last = *window.last().unwrap_or(&middle);
    let position = if upper > lower {
        ((last - lower) / (upper - lower)).clamp(0.0, 1.0)
    } else {
        0.5 // Zero-width band (flat window).
    };

    BollingerBands {
        upper,
        middle,
        lower,
        position,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_on_empty_input() {
        let b = bollinger(&[], 20, 2.0);
        assert_eq!(b.middle, 0.0);
        assert_eq!(b.position, 0.5);
    }

    #[test]
    fn default_on_short_input() {
        let b = bollinger(&[1.0, 2.0, 3.0], 20, 2.0);
        assert_eq!(b.middle, 0.0);
    }

    #[test]
    fn flat_window_is_midband() {
        let b = bollinger(&vec![100.0; 25], 20, 2.0);
        assert!((b.middle - 100.0).abs() < 1e-12);
        assert!((b.upper - b.lower).abs() < 1e-12);
        assert_eq!(b.position, 0.5);
    }

    #[test]
    fn band_ordering() {
        let closes: Vec<f64> = (0..40).map(|x| 100.0 + (x as f64 * 0.7).sin()).collect();
        let b = bollinger(&closes, 20, 2.0);
        assert!(b.lower < b.middle && b.middle < b.upper);
    }

    #[test]
    fn position_clamped_on_breakout() {
        // Steady series with a violent final spike far outside the band.
        let mut closes = vec![100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0];
        closes.extend_from_slice(&[100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0]);
        closes.extend_from_slice(&[100.0, 101.0, 100.0, 150.0]);
        let b = bollinger(&closes, 20, 2.0);
        assert_eq!(b.position, 1.0);
    }

    #[test]
    fn position_near_zero_at_lows() {
        let mut closes = vec![100.0; 19];
        closes.push(90.0);
        let b = bollinger(&closes, 20, 2.0);
        assert_eq!(b.position, 0.0);
    }
}
