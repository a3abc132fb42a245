// =============================================================================
// Composite indicator bundle — one timeframe, one bias score
// =============================================================================
//
// Runs every base indicator over a candle series and condenses them into an
// integer bias score in [-4, +4]. All four reads are trend-aligned so that a
// clean trend saturates the score instead of cancelling itself out:
//
//   RSI        — above 55 => +1, below 45 => -1
//   MACD       — histogram sign
//   Bollinger  — riding the upper band (position >= 0.8) => +1,
//                pinned to the lower band (position <= 0.2) => -1
//   Momentum   — last close vs the close 5 bars back, beyond 0.3%
//
// bullish when score >= +2, bearish when score <= -2, else neutral.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::{atr, bollinger, macd, rsi, volume_ratio, BollingerBands, MacdResult};
use crate::market_data::Candle;

/// Directional read of one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasTag {
    Bullish,
    Bearish,
    Neutral,
}

impl Default for BiasTag {
    fn default() -> Self {
        Self::Neutral
    }
}

/// All computed indicators for one timeframe plus the condensed bias.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorBundle {
    pub rsi: f64,
    pub macd: MacdResult,
    pub bollinger: BollingerBands,
    pub atr: f64,
    pub volume_ratio: f64,
    /// Integer score in [-4, +4].
    pub bias_score: i8,
    pub bias: BiasTag,
}

/// Compute the full indicator bundle for one candle series. Empty input
/// yields an all-neutral bundle.
pub fn composite(candles: &[Candle]) -> IndicatorBundle {
    if candles.is_empty() {
        return IndicatorBundle {
            rsi: 50.0,
            volume_ratio: 1.0,
            ..IndicatorBundle::default()
        };
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let rsi_val = rsi(&closes, 14);
    let macd_val = macd(&closes, 12, 26, 9);
    let boll = bollinger(&closes, 20, 2.0);
    let atr_val = atr(&highs, &lows, &closes, 14);
    let vol_ratio = volume_ratio(&volumes, 20);

    let mut score: i8 = 0;

    if rsi_val >= 55.0 {
        score += 1;
    } else if rsi_val <= 45.0 {
        score -= 1;
    }

    if macd_val.histogram > 0.0 {
        score += 1;
    } else if macd_val.histogram < 0.0 {
        score -= 1;
    }

    if boll.position >= 0.8 {
        score += 1;
    } else if boll.position <= 0.2 {
        score -= 1;
    }

    // Short momentum: last close vs 5 bars back, beyond a 0.3% dead band.
    if closes.len() > 5 {
        let prev = closes[closes.len() - 6];
        if prev > 0.0 {
            let change_pct = (closes[closes.len() - 1] - prev) / prev * 100.0;
            if change_pct > 0.3 {
                score += 1;
            } else if change_pct < -0.3 {
                score -= 1;
            }
        }
    }

    let bias = if score >= 2 {
        BiasTag::Bullish
    } else if score <= -2 {
        BiasTag::Bearish
    } else {
        BiasTag::Neutral
    };

    IndicatorBundle {
        rsi: rsi_val,
        macd: macd_val,
        bollinger: boll,
        atr: atr_val,
        volume_ratio: vol_ratio,
        bias_score: score,
        bias,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            time_sec: 0,
            open: close,
            high: close * 1.005,
            low: close * 0.995,
            close,
            vwap: close,
            volume: 10.0,
            count: 1,
        }
    }

    #[test]
    fn empty_input_is_neutral() {
        let b = composite(&[]);
        assert_eq!(b.bias_score, 0);
        assert_eq!(b.bias, BiasTag::Neutral);
        assert_eq!(b.rsi, 50.0);
        assert_eq!(b.volume_ratio, 1.0);
    }

    #[test]
    fn short_input_never_panics() {
        let candles: Vec<Candle> = (0..3).map(|i| candle(100.0 + i as f64)).collect();
        let b = composite(&candles);
        assert_eq!(b.bias, BiasTag::Neutral);
    }

    #[test]
    fn strong_downtrend_is_bearish() {
        let candles: Vec<Candle> = (0..80).map(|i| candle(200.0 - i as f64)).collect();
        let b = composite(&candles);
        assert!(b.bias_score <= -2, "score {} not bearish", b.bias_score);
        assert_eq!(b.bias, BiasTag::Bearish);
    }

    #[test]
    fn strong_uptrend_is_bullish() {
        let candles: Vec<Candle> = (0..80).map(|i| candle(100.0 + i as f64)).collect();
        let b = composite(&candles);
        assert!(b.bias_score >= 2, "score {} not bullish", b.bias_score);
        assert_eq!(b.bias, BiasTag::Bullish);
    }

    #[test]
    fn score_bounds() {
        let up: Vec<Candle> = (0..80).map(|i| candle(100.0 + i as f64)).collect();
        let down: Vec<Candle> = (0..80).map(|i| candle(200.0 - i as f64)).collect();
        for series in [up, down] {
            let b = composite(&series);
            assert!((-4..=4).contains(&b.bias_score));
        }
    }
}
