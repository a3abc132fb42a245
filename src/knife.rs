// =============================================================================
// Knife Tracker — phased FSM for live breaks through key levels
// =============================================================================
//
// Tracks whether price is actively "knifing" through a support or resistance
// level, per timeframe. Phases:
//
//   none -> impulse -> capitulation -> stabilizing -> confirming -> safe
//
// A break enters `impulse` when a candle closes through the rolling extreme
// of the lookback window on a volume spike. Follow-through selling (a new
// extreme on at least impulse volume) is `capitulation`. When no new extreme
// prints for a few candles the knife is `stabilizing`; a close back through
// the broken level is `confirming`; enough reclaimed closes and the level is
// `safe`. Two TTLs clear the state: a candle budget since the break and an
// inactivity window since the last new extreme.
//
// The decision engine uses the tracker to gate or shrink counter-trend
// entries: never catch a falling knife at full size.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::{Candle, Timeframe};
use crate::types::Side;

/// Tunable thresholds. Hosts may adjust these without touching the FSM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnifeConfig {
    /// Candles inspected for the rolling support/resistance level.
    pub lookback: usize,
    /// Volume ratio (vs 20-bar mean) that qualifies a break as an impulse.
    pub volume_spike_ratio: f64,
    /// Candles without a new extreme before the knife is stabilizing.
    pub stabilize_candles: u32,
    /// Consecutive reclaimed closes before the level is safe again.
    pub confirm_candles: u32,
    /// Hard TTL: candles since the break.
    pub max_candles_since_break: u32,
    /// Soft TTL: hours without a new extreme.
    pub max_inactivity_hours: i64,
}

impl Default for KnifeConfig {
    fn default() -> Self {
        Self {
            lookback: 24,
            volume_spike_ratio: 2.0,
            stabilize_candles: 4,
            confirm_candles: 6,
            max_candles_since_break: 48,
            max_inactivity_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnifePhase {
    Impulse,
    Capitulation,
    Stabilizing,
    Confirming,
    Safe,
}

/// Which way the level broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnifeDirection {
    Down,
    Up,
}

/// One active (or recently active) break.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnifeState {
    pub phase: KnifePhase,
    pub direction: KnifeDirection,
    pub broken_level: f64,
    pub break_time_sec: i64,
    /// Volume of the break candle, the baseline for capitulation.
    pub impulse_volume: f64,
    /// Lowest low (down) or highest high (up) since the break.
    pub extreme_price: f64,
    pub extreme_time_sec: i64,
    pub candles_since_break: u32,
    pub last_activity: DateTime<Utc>,
}

/// How an entry should be treated given the current knife state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KnifeGate {
    Clear,
    /// Allowed, but margin multiplied by this factor.
    Shrink(f64),
    Block,
}

/// Per-pair tracker holding at most one knife per timeframe.
#[derive(Debug, Default)]
pub struct KnifeTracker {
    config: KnifeConfig,
    states: BTreeMap<Timeframe, KnifeState>,
}

impl KnifeTracker {
    pub fn new(config: KnifeConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
        }
    }

    pub fn active(&self, tf: Timeframe) -> Option<&KnifeState> {
        self.states.get(&tf)
    }

    /// Feed the latest candle series for one timeframe. Detects new breaks,
    /// advances phases, and expires stale states.
    pub fn update(&mut self, tf: Timeframe, candles: &[Candle]) {
        if candles.len() < self.config.lookback + 1 {
            return;
        }

        if let Some(state) = self.states.get_mut(&tf) {
            Self::advance(&self.config, state, candles);
            let expired = state.candles_since_break > self.config.max_candles_since_break
                || Utc::now() - state.last_activity
                    > Duration::hours(self.config.max_inactivity_hours);
            if expired {
                debug!(timeframe = %tf, "knife state expired");
                self.states.remove(&tf);
            }
            return;
        }

        if let Some(state) = Self::detect(&self.config, candles) {
            debug!(
                timeframe = %tf,
                direction = ?state.direction,
                level = state.broken_level,
                "knife break detected"
            );
            self.states.insert(tf, state);
        }
    }

    /// Gate for a prospective entry. Longs are endangered by downward knives,
    /// shorts by upward ones; the worst phase across timeframes wins.
    pub fn gate(&self, entry_side: Side) -> KnifeGate {
        let danger_direction = match entry_side {
            Side::Long => KnifeDirection::Down,
            Side::Short => KnifeDirection::Up,
        };

        let mut gate = KnifeGate::Clear;
        for state in self.states.values() {
            if state.direction != danger_direction {
                continue;
            }
            match state.phase {
                KnifePhase::Impulse | KnifePhase::Capitulation => return KnifeGate::Block,
                KnifePhase::Stabilizing | KnifePhase::Confirming => {
                    gate = KnifeGate::Shrink(0.5);
                }
                KnifePhase::Safe => {}
            }
        }
        gate
    }

    // ── Detection ────────────────────────────────────────────────────────

    fn detect(config: &KnifeConfig, candles: &[Candle]) -> Option<KnifeState> {
        let last = candles.last()?;
        let window = &candles[candles.len() - 1 - config.lookback..candles.len() - 1];

        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let vol_ratio = crate::indicators::volume_ratio(&volumes, 20);
        if vol_ratio < config.volume_spike_ratio {
            return None;
        }

        let support = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let resistance = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);

        let direction = if last.close < support {
            KnifeDirection::Down
        } else if last.close > resistance {
            KnifeDirection::Up
        } else {
            return None;
        };

        let (broken_level, extreme_price) = match direction {
            KnifeDirection::Down => (support, last.low),
            KnifeDirection::Up => (resistance, last.high),
        };

        Some(KnifeState {
            phase: KnifePhase::Impulse,
            direction,
            broken_level,
            break_time_sec: last.time_sec,
            impulse_volume: last.volume,
            extreme_price,
            extreme_time_sec: last.time_sec,
            candles_since_break: 0,
            last_activity: Utc::now(),
        })
    }

    // ── Phase advancement ────────────────────────────────────────────────

    fn advance(config: &KnifeConfig, state: &mut KnifeState, candles: &[Candle]) {
        let after_break: Vec<&Candle> = candles
            .iter()
            .filter(|c| c.time_sec > state.break_time_sec)
            .collect();
        state.candles_since_break = after_break.len() as u32;

        // Track new extremes; a fresh extreme resets the activity clock.
        let mut capitulated = state.phase == KnifePhase::Capitulation;
        for candle in &after_break {
            let new_extreme = match state.direction {
                KnifeDirection::Down => candle.low < state.extreme_price,
                KnifeDirection::Up => candle.high > state.extreme_price,
            };
            if new_extreme {
                state.extreme_price = match state.direction {
                    KnifeDirection::Down => candle.low,
                    KnifeDirection::Up => candle.high,
                };
                state.extreme_time_sec = candle.time_sec;
                state.last_activity = Utc::now();
                if candle.volume >= state.impulse_volume {
                    capitulated = true;
                }
            }
        }

        let candles_since_extreme = candles
            .iter()
            .filter(|c| c.time_sec > state.extreme_time_sec)
            .count() as u32;

        // Trailing consecutive closes back through the broken level.
        let reclaimed_tail = candles
            .iter()
            .rev()
            .take_while(|c| match state.direction {
                KnifeDirection::Down => c.close > state.broken_level,
                KnifeDirection::Up => c.close < state.broken_level,
            })
            .count() as u32;

        state.phase = if reclaimed_tail >= config.confirm_candles {
            KnifePhase::Safe
        } else if reclaimed_tail > 0 {
            KnifePhase::Confirming
        } else if candles_since_extreme >= config.stabilize_candles {
            KnifePhase::Stabilizing
        } else if capitulated {
            KnifePhase::Capitulation
        } else {
            KnifePhase::Impulse
        };
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, close: f64, low: f64, high: f64, volume: f64) -> Candle {
        Candle {
            time_sec: i * 300,
            open: close,
            high,
            low,
            close,
            vwap: close,
            volume,
            count: 1,
        }
    }

    /// Steady series at 100 with normal volume.
    fn base_series(n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i, 100.0, 99.5, 100.5, 10.0))
            .collect()
    }

    fn tracker() -> KnifeTracker {
        KnifeTracker::new(KnifeConfig::default())
    }

    #[test]
    fn no_knife_on_quiet_market() {
        let mut t = tracker();
        t.update(Timeframe::M5, &base_series(40));
        assert!(t.active(Timeframe::M5).is_none());
        assert_eq!(t.gate(Side::Long), KnifeGate::Clear);
    }

    #[test]
    fn break_with_volume_spike_enters_impulse() {
        let mut series = base_series(40);
        let n = series.len() as i64;
        series.push(candle(n, 95.0, 94.5, 100.0, 40.0)); // close below support on 4x volume
        let mut t = tracker();
        t.update(Timeframe::M5, &series);

        let state = t.active(Timeframe::M5).expect("knife detected");
        assert_eq!(state.phase, KnifePhase::Impulse);
        assert_eq!(state.direction, KnifeDirection::Down);
        assert!((state.broken_level - 99.5).abs() < 1e-9);
        assert_eq!(t.gate(Side::Long), KnifeGate::Block);
        // A short is trend-aligned, not endangered.
        assert_eq!(t.gate(Side::Short), KnifeGate::Clear);
    }

    #[test]
    fn break_without_volume_is_ignored() {
        let mut series = base_series(40);
        let n = series.len() as i64;
        series.push(candle(n, 95.0, 94.5, 100.0, 10.0));
        let mut t = tracker();
        t.update(Timeframe::M5, &series);
        assert!(t.active(Timeframe::M5).is_none());
    }

    #[test]
    fn follow_through_is_capitulation() {
        let mut series = base_series(40);
        let n = series.len() as i64;
        series.push(candle(n, 95.0, 94.5, 100.0, 40.0));
        let mut t = tracker();
        t.update(Timeframe::M5, &series);

        series.push(candle(n + 1, 93.0, 92.5, 95.0, 45.0)); // new low, heavy volume
        t.update(Timeframe::M5, &series);

        let state = t.active(Timeframe::M5).unwrap();
        assert_eq!(state.phase, KnifePhase::Capitulation);
        assert_eq!(t.gate(Side::Long), KnifeGate::Block);
    }

    #[test]
    fn quiet_candles_stabilize_then_reclaim_confirms() {
        let mut series = base_series(40);
        let n = series.len() as i64;
        series.push(candle(n, 95.0, 94.5, 100.0, 40.0));
        let mut t = tracker();
        t.update(Timeframe::M5, &series);

        // Four candles holding above the extreme: stabilizing.
        for i in 1..=4 {
            series.push(candle(n + i, 95.2, 94.8, 95.5, 8.0));
        }
        t.update(Timeframe::M5, &series);
        assert_eq!(t.active(Timeframe::M5).unwrap().phase, KnifePhase::Stabilizing);
        assert_eq!(t.gate(Side::Long), KnifeGate::Shrink(0.5));

        // Close back above the broken level: confirming.
        series.push(candle(n + 5, 99.8, 99.0, 100.0, 9.0));
        t.update(Timeframe::M5, &series);
        assert_eq!(t.active(Timeframe::M5).unwrap().phase, KnifePhase::Confirming);

        // Enough reclaimed closes: safe, entries clear.
        for i in 6..=11 {
            series.push(candle(n + i, 100.0, 99.6, 100.4, 9.0));
        }
        t.update(Timeframe::M5, &series);
        assert_eq!(t.active(Timeframe::M5).unwrap().phase, KnifePhase::Safe);
        assert_eq!(t.gate(Side::Long), KnifeGate::Clear);
    }

    #[test]
    fn candle_ttl_expires_state() {
        let mut series = base_series(40);
        let n = series.len() as i64;
        series.push(candle(n, 95.0, 94.5, 100.0, 40.0));
        let mut t = tracker();
        t.update(Timeframe::M5, &series);
        assert!(t.active(Timeframe::M5).is_some());

        // 49 further candles exceed the 48-candle budget.
        for i in 1..=49 {
            series.push(candle(n + i, 95.0, 94.6, 95.4, 8.0));
        }
        t.update(Timeframe::M5, &series);
        assert!(t.active(Timeframe::M5).is_none());
    }

    #[test]
    fn upward_knife_blocks_shorts() {
        let mut series = base_series(40);
        let n = series.len() as i64;
        series.push(candle(n, 106.0, 100.2, 106.5, 40.0));
        let mut t = tracker();
        t.update(Timeframe::M5, &series);

        let state = t.active(Timeframe::M5).unwrap();
        assert_eq!(state.direction, KnifeDirection::Up);
        assert_eq!(t.gate(Side::Short), KnifeGate::Block);
        assert_eq!(t.gate(Side::Long), KnifeGate::Clear);
    }
}
