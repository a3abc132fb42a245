// =============================================================================
// Market data model — candles, tickers, per-tick snapshots
// =============================================================================
//
// A MarketSnapshot is an immutable value produced once per refresh interval
// and shared by reference with every agent. It carries the raw candle series
// for all five timeframes, the computed indicator bundles, the BTC reference
// trend, and a base trade recommendation condensed from the weighted
// per-timeframe bias scores.
// =============================================================================

pub mod cache;
pub mod kraken;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators::{composite, IndicatorBundle};

pub use cache::MarketDataCache;
pub use kraken::{KrakenClient, MarketSource};

// =============================================================================
// Candles & tickers
// =============================================================================

/// One OHLC bar as delivered by the upstream source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Candle {
    pub time_sec: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vwap: f64,
    pub volume: f64,
    pub count: u64,
}

/// Ticker top-of-book and 24-hour aggregates for one pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub open_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
}

impl Ticker {
    /// Percent change of last vs the 24-hour open.
    pub fn change_24h_pct(&self) -> f64 {
        if self.open_24h > 0.0 {
            (self.last - self.open_24h) / self.open_24h * 100.0
        } else {
            0.0
        }
    }
}

// =============================================================================
// Timeframes
// =============================================================================

/// The five analysis timeframes, ordered shortest to longest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Upstream interval parameter in minutes.
    pub fn minutes(self) -> u32 {
        match self {
            Self::M5 => 5,
            Self::M15 => 15,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
        }
    }

    /// Weight of this timeframe in the base recommendation, out of 100.
    pub fn recommendation_weight(self) -> f64 {
        match self {
            Self::D1 => 30.0,
            Self::H4 => 25.0,
            Self::H1 => 20.0,
            Self::M15 => 15.0,
            Self::M5 => 10.0,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M5 => write!(f, "5m"),
            Self::M15 => write!(f, "15m"),
            Self::H1 => write!(f, "1h"),
            Self::H4 => write!(f, "4h"),
            Self::D1 => write!(f, "1d"),
        }
    }
}

/// Candle series plus computed indicators for one timeframe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeframeData {
    pub candles: Vec<Candle>,
    pub indicators: IndicatorBundle,
}

// =============================================================================
// BTC reference trend
// =============================================================================

/// Coarse market-wide trend derived from the BTC reference ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtcTrend {
    Bull,
    Bear,
    Neut,
}

impl BtcTrend {
    /// Bull above +1.5% on the day, bear below -1.5%, else neutral.
    pub fn from_change_24h(change_pct: f64) -> Self {
        if change_pct >= 1.5 {
            Self::Bull
        } else if change_pct <= -1.5 {
            Self::Bear
        } else {
            Self::Neut
        }
    }
}

// =============================================================================
// Base recommendation
// =============================================================================

/// Recommended action from the shared market view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecAction {
    Long,
    Short,
    Wait,
}

/// Condensed trade recommendation shared by all agents as a starting point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaseRecommendation {
    pub action: RecAction,
    /// Confidence in [0, 100].
    pub confidence: f64,
    /// Weighted bias in [-4, +4] the action was derived from.
    pub weighted_bias: f64,
}

/// Condense per-timeframe bias scores into one recommendation using the
/// fixed timeframe weights.
pub fn base_recommendation(timeframes: &BTreeMap<Timeframe, TimeframeData>) -> BaseRecommendation {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for (tf, data) in timeframes {
        let w = tf.recommendation_weight();
        weighted += w * data.indicators.bias_score as f64;
        total_weight += w;
    }

    let bias = if total_weight > 0.0 {
        weighted / total_weight
    } else {
        0.0
    };

    let action = if bias >= 1.0 {
        RecAction::Long
    } else if bias <= -1.0 {
        RecAction::Short
    } else {
        RecAction::Wait
    };

    BaseRecommendation {
        action,
        confidence: (50.0 + bias.abs() * 12.5).clamp(0.0, 95.0),
        weighted_bias: bias,
    }
}

// =============================================================================
// Market snapshot
// =============================================================================

/// Immutable per-refresh view of the market, shared across all agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub pair: String,
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub timeframes: BTreeMap<Timeframe, TimeframeData>,
    pub btc_trend: BtcTrend,
    pub btc_change_24h: f64,
    pub recommendation: Option<BaseRecommendation>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Assemble a snapshot from raw upstream reads, computing indicators and
    /// the base recommendation for every timeframe.
    pub fn assemble(
        pair: &str,
        ticker: Ticker,
        btc_ticker: Ticker,
        candles: BTreeMap<Timeframe, Vec<Candle>>,
    ) -> Self {
        let timeframes: BTreeMap<Timeframe, TimeframeData> = candles
            .into_iter()
            .map(|(tf, series)| {
                let indicators = composite(&series);
                (
                    tf,
                    TimeframeData {
                        candles: series,
                        indicators,
                    },
                )
            })
            .collect();

        let recommendation = Some(base_recommendation(&timeframes));
        let btc_change = btc_ticker.change_24h_pct();

        Self {
            pair: pair.to_string(),
            last_price: ticker.last,
            bid: ticker.bid,
            ask: ticker.ask,
            high_24h: ticker.high_24h,
            low_24h: ticker.low_24h,
            volume_24h: ticker.volume_24h,
            timeframes,
            btc_trend: BtcTrend::from_change_24h(btc_change),
            btc_change_24h: btc_change,
            recommendation,
            fetched_at: Utc::now(),
        }
    }

    pub fn timeframe(&self, tf: Timeframe) -> Option<&TimeframeData> {
        self.timeframes.get(&tf)
    }

    pub fn indicators(&self, tf: Timeframe) -> Option<&IndicatorBundle> {
        self.timeframes.get(&tf).map(|d| &d.indicators)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn series(trend_up: bool) -> Vec<Candle> {
        (0..80)
            .map(|i| {
                let close = if trend_up {
                    100.0 + i as f64
                } else {
                    200.0 - i as f64
                };
                Candle {
                    time_sec: i,
                    open: close,
                    high: close * 1.005,
                    low: close * 0.995,
                    close,
                    vwap: close,
                    volume: 10.0,
                    count: 1,
                }
            })
            .collect()
    }

    #[test]
    fn btc_trend_bands() {
        assert_eq!(BtcTrend::from_change_24h(2.0), BtcTrend::Bull);
        assert_eq!(BtcTrend::from_change_24h(-2.0), BtcTrend::Bear);
        assert_eq!(BtcTrend::from_change_24h(0.5), BtcTrend::Neut);
    }

    #[test]
    fn recommendation_long_on_uniform_uptrend() {
        let mut tfs = BTreeMap::new();
        for tf in Timeframe::ALL {
            let candles = series(true);
            let indicators = composite(&candles);
            tfs.insert(tf, TimeframeData { candles, indicators });
        }
        let rec = base_recommendation(&tfs);
        assert_eq!(rec.action, RecAction::Long);
        assert!(rec.confidence > 50.0);
    }

    #[test]
    fn recommendation_wait_on_no_data() {
        let rec = base_recommendation(&BTreeMap::new());
        assert_eq!(rec.action, RecAction::Wait);
        assert!((rec.confidence - 50.0).abs() < 1e-9);
    }

    #[test]
    fn assemble_computes_all_timeframes() {
        let mut candles = BTreeMap::new();
        for tf in Timeframe::ALL {
            candles.insert(tf, series(false));
        }
        let ticker = Ticker {
            bid: 0.59,
            ask: 0.61,
            last: 0.60,
            open_24h: 0.58,
            high_24h: 0.62,
            low_24h: 0.57,
            volume_24h: 1_000_000.0,
        };
        let btc = Ticker {
            last: 98.0,
            open_24h: 100.0,
            ..Ticker::default()
        };
        let snap = MarketSnapshot::assemble("XRP/EUR", ticker, btc, candles);
        assert_eq!(snap.timeframes.len(), 5);
        assert_eq!(snap.btc_trend, BtcTrend::Bear);
        let rec = snap.recommendation.unwrap();
        assert_eq!(rec.action, RecAction::Short);
    }

    #[test]
    fn ticker_change_handles_zero_open() {
        let t = Ticker::default();
        assert_eq!(t.change_24h_pct(), 0.0);
    }
}
