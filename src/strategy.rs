// =============================================================================
// Trading Strategy — per-agent parameter set and the built-in archetypes
// =============================================================================
//
// A strategy is data, not behaviour: the decision engine reads it, the
// validator guarantees its invariants. Externally supplied strategies (model
// mode) are arbitrary JSON merged onto `TradingStrategy::default()` by the
// validator; the archetype table below provides the offline roster.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Relative importance of each analysis timeframe. Invariant after
/// validation: the five weights sum to 100.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeframeWeights {
    pub d1: f64,
    pub h4: f64,
    pub h1: f64,
    pub m15: f64,
    pub m5: f64,
}

impl TimeframeWeights {
    pub fn sum(&self) -> f64 {
        self.d1 + self.h4 + self.h1 + self.m15 + self.m5
    }

    pub fn scale(&mut self, factor: f64) {
        self.d1 *= factor;
        self.h4 *= factor;
        self.h1 *= factor;
        self.m15 *= factor;
        self.m5 *= factor;
    }
}

impl Default for TimeframeWeights {
    fn default() -> Self {
        Self {
            d1: 20.0,
            h4: 25.0,
            h1: 25.0,
            m15: 20.0,
            m5: 10.0,
        }
    }
}

/// How much the agent likes each market regime, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimePreference {
    pub trending: f64,
    pub ranging: f64,
    pub volatile: f64,
}

impl Default for RegimePreference {
    fn default() -> Self {
        Self {
            trending: 0.5,
            ranging: 0.5,
            volatile: 0.5,
        }
    }
}

/// Full per-agent strategy. Every field is safe to read after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingStrategy {
    pub name: String,
    pub style: String,
    pub description: String,

    pub timeframe_weights: TimeframeWeights,
    /// Forced to the session-uniform value by the validator.
    pub leverage: f64,

    /// Margin percent used at the entry-threshold confidence.
    pub cautious_margin_percent: f64,
    /// Margin percent used at full (95) confidence.
    pub full_margin_percent: f64,

    /// Entry confidence threshold, clamped to [40, 95].
    pub entry_confidence: f64,
    /// Confidence required of a DCA signal, clamped to [40, 95].
    pub dca_confidence: f64,
    /// Averaging-in budget, clamped to [0, 3].
    pub max_dca_count: u32,
    /// Maximum position age in hours, clamped to [0.5, session duration].
    pub max_hours: f64,

    pub rsi_oversold: f64,
    pub rsi_overbought: f64,

    pub regime_preference: RegimePreference,

    /// Safety rails — forced by the validator.
    pub use_stop_loss: bool,
    pub accept_liquidation: bool,
    pub use_fixed_tp: bool,
}

impl Default for TradingStrategy {
    fn default() -> Self {
        Self {
            name: "Balanced".to_string(),
            style: "balanced".to_string(),
            description: "Even-keeled multi-timeframe trader".to_string(),
            timeframe_weights: TimeframeWeights::default(),
            leverage: 10.0,
            cautious_margin_percent: 8.0,
            full_margin_percent: 15.0,
            entry_confidence: 60.0,
            dca_confidence: 60.0,
            max_dca_count: 2,
            max_hours: 8.0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            regime_preference: RegimePreference::default(),
            use_stop_loss: false,
            accept_liquidation: true,
            use_fixed_tp: false,
        }
    }
}

// =============================================================================
// Archetypes
// =============================================================================

/// A built-in trading personality: a partial strategy tree merged onto the
/// default, plus commentary templates for the narrative layer.
#[derive(Debug, Clone)]
pub struct Archetype {
    pub id: &'static str,
    pub display_name: &'static str,
    pub overrides: Value,
}

impl Archetype {
    /// Commentary template for one of the fixed triggers; `{name}`, `{price}`
    /// and `{pnl}` are substituted at emission time.
    pub fn commentary(&self, trigger: &str) -> Option<&'static str> {
        commentary_for(self.id, trigger)
    }
}

/// The six built-in archetypes, in table order.
pub fn archetypes() -> Vec<Archetype> {
    vec![
        Archetype {
            id: "scalper",
            display_name: "Scalper",
            overrides: json!({
                "name": "Scalper",
                "style": "scalper",
                "description": "Quick in, quick out. Lives on the 5m chart.",
                "timeframe_weights": {"d1": 5.0, "h4": 10.0, "h1": 20.0, "m15": 30.0, "m5": 35.0},
                "cautious_margin_percent": 6.0,
                "full_margin_percent": 12.0,
                "entry_confidence": 55.0,
                "max_dca_count": 1,
                "max_hours": 1.5,
                "regime_preference": {"trending": 0.4, "ranging": 0.6, "volatile": 0.7},
            }),
        },
        Archetype {
            id: "momentum",
            display_name: "Momentum",
            overrides: json!({
                "name": "Momentum",
                "style": "momentum",
                "description": "Follows strong directional moves with size.",
                "timeframe_weights": {"d1": 15.0, "h4": 25.0, "h1": 30.0, "m15": 20.0, "m5": 10.0},
                "cautious_margin_percent": 10.0,
                "full_margin_percent": 18.0,
                "entry_confidence": 62.0,
                "max_hours": 6.0,
                "regime_preference": {"trending": 0.9, "ranging": 0.2, "volatile": 0.6},
            }),
        },
        Archetype {
            id: "mean_reversion",
            display_name: "Mean Reversion",
            overrides: json!({
                "name": "Mean Reversion",
                "style": "mean_reversion",
                "description": "Fades overextended moves back to the mean.",
                "timeframe_weights": {"d1": 15.0, "h4": 20.0, "h1": 30.0, "m15": 25.0, "m5": 10.0},
                "cautious_margin_percent": 7.0,
                "full_margin_percent": 13.0,
                "entry_confidence": 58.0,
                "dca_confidence": 55.0,
                "max_dca_count": 3,
                "max_hours": 4.0,
                "rsi_oversold": 25.0,
                "rsi_overbought": 75.0,
                "regime_preference": {"trending": 0.2, "ranging": 0.9, "volatile": 0.4},
            }),
        },
        Archetype {
            id: "trend_follower",
            display_name: "Trend Follower",
            overrides: json!({
                "name": "Trend Follower",
                "style": "trend_follower",
                "description": "Patient rider of the higher-timeframe tide.",
                "timeframe_weights": {"d1": 35.0, "h4": 30.0, "h1": 20.0, "m15": 10.0, "m5": 5.0},
                "cautious_margin_percent": 9.0,
                "full_margin_percent": 16.0,
                "entry_confidence": 65.0,
                "max_hours": 20.0,
                "regime_preference": {"trending": 1.0, "ranging": 0.1, "volatile": 0.3},
            }),
        },
        Archetype {
            id: "breakout",
            display_name: "Breakout",
            overrides: json!({
                "name": "Breakout",
                "style": "breakout",
                "description": "Waits for compression, strikes on expansion.",
                "timeframe_weights": {"d1": 10.0, "h4": 20.0, "h1": 30.0, "m15": 25.0, "m5": 15.0},
                "cautious_margin_percent": 8.0,
                "full_margin_percent": 17.0,
                "entry_confidence": 68.0,
                "max_dca_count": 0,
                "max_hours": 5.0,
                "regime_preference": {"trending": 0.7, "ranging": 0.3, "volatile": 0.9},
            }),
        },
        Archetype {
            id: "contrarian",
            display_name: "Contrarian",
            overrides: json!({
                "name": "Contrarian",
                "style": "contrarian",
                "description": "Sells euphoria, buys despair.",
                "timeframe_weights": {"d1": 25.0, "h4": 25.0, "h1": 25.0, "m15": 15.0, "m5": 10.0},
                "cautious_margin_percent": 7.0,
                "full_margin_percent": 14.0,
                "entry_confidence": 60.0,
                "dca_confidence": 50.0,
                "max_dca_count": 3,
                "max_hours": 12.0,
                "rsi_oversold": 22.0,
                "rsi_overbought": 78.0,
                "regime_preference": {"trending": 0.3, "ranging": 0.7, "volatile": 0.6},
            }),
        },
    ]
}

/// Look up one archetype by id.
pub fn archetype_by_id(id: &str) -> Option<Archetype> {
    archetypes().into_iter().find(|a| a.id == id)
}

// =============================================================================
// Commentary templates
// =============================================================================

/// The fixed commentary trigger set.
pub const COMMENTARY_TRIGGERS: [&str; 5] = [
    "on_entry",
    "on_exit_profit",
    "on_exit_loss",
    "on_death",
    "on_rival_death",
];

/// Generic fallbacks used when an agent has no template for a trigger.
pub fn generic_commentary(trigger: &str) -> &'static str {
    match trigger {
        "on_entry" => "{name} steps into the market at {price}.",
        "on_exit_profit" => "{name} banks {pnl} and walks away smiling.",
        "on_exit_loss" => "{name} takes the hit of {pnl} and regroups.",
        "on_death" => "{name} is out of the arena.",
        "on_rival_death" => "{name} watches a rival fall. One fewer to beat.",
        _ => "{name} does something off-script.",
    }
}

fn commentary_for(archetype_id: &str, trigger: &str) -> Option<&'static str> {
    let t = match (archetype_id, trigger) {
        ("scalper", "on_entry") => "{name} darts in at {price}. Blink and you miss it.",
        ("scalper", "on_exit_profit") => "{name} clips {pnl} in record time.",
        ("scalper", "on_exit_loss") => "{name} cuts it instantly. {pnl} gone, next trade.",
        ("scalper", "on_death") => "{name} scalped one knife too many.",
        ("scalper", "on_rival_death") => "{name} barely looks up from the tape.",

        ("momentum", "on_entry") => "{name} jumps on the move at {price}. Full send.",
        ("momentum", "on_exit_profit") => "{name} rides the wave for {pnl}.",
        ("momentum", "on_exit_loss") => "{name} got chopped for {pnl}. The trend lied.",
        ("momentum", "on_death") => "{name} chased momentum straight off a cliff.",
        ("momentum", "on_rival_death") => "{name}: \"Slow money dies first.\"",

        ("mean_reversion", "on_entry") => "{name} fades the crowd at {price}.",
        ("mean_reversion", "on_exit_profit") => "{name} collects {pnl} as price snaps back.",
        ("mean_reversion", "on_exit_loss") => "{name} learns the hard way: {pnl}.",
        ("mean_reversion", "on_death") => "{name} averaged into the abyss.",
        ("mean_reversion", "on_rival_death") => "{name} nods. Extremes punish everyone.",

        ("trend_follower", "on_entry") => "{name} joins the tide at {price}.",
        ("trend_follower", "on_exit_profit") => "{name} lets the trend pay: {pnl}.",
        ("trend_follower", "on_exit_loss") => "{name} exits at {pnl}. The tide turned.",
        ("trend_follower", "on_death") => "{name} held the line until the line broke.",
        ("trend_follower", "on_rival_death") => "{name}: \"Patience would have saved them.\"",

        ("breakout", "on_entry") => "{name} strikes the breakout at {price}!",
        ("breakout", "on_exit_profit") => "{name} caught the expansion for {pnl}.",
        ("breakout", "on_exit_loss") => "{name} bought the fakeout: {pnl}.",
        ("breakout", "on_death") => "{name} broke out of the arena, feet first.",
        ("breakout", "on_rival_death") => "{name} smells volatility in the air.",

        ("contrarian", "on_entry") => "{name} takes the other side at {price}.",
        ("contrarian", "on_exit_profit") => "{name} was right when it hurt most: {pnl}.",
        ("contrarian", "on_exit_loss") => "{name} fought the tape and lost {pnl}.",
        ("contrarian", "on_death") => "{name} was early. Fatally early.",
        ("contrarian", "on_rival_death") => "{name}: \"The consensus claims another.\"",

        _ => return None,
    };
    Some(t)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_archetypes_with_unique_ids() {
        let all = archetypes();
        assert_eq!(all.len(), 6);
        let mut ids: Vec<&str> = all.iter().map(|a| a.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn default_weights_sum_to_100() {
        assert!((TimeframeWeights::default().sum() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn archetype_weight_overrides_sum_to_100() {
        for a in archetypes() {
            let w = &a.overrides["timeframe_weights"];
            let sum = ["d1", "h4", "h1", "m15", "m5"]
                .iter()
                .map(|k| w[k].as_f64().unwrap())
                .sum::<f64>();
            assert!((sum - 100.0).abs() < 1e-9, "{} weights sum {sum}", a.id);
        }
    }

    #[test]
    fn every_archetype_has_full_commentary() {
        for a in archetypes() {
            for trigger in COMMENTARY_TRIGGERS {
                assert!(
                    a.commentary(trigger).is_some(),
                    "{} missing {trigger}",
                    a.id
                );
            }
        }
    }

    #[test]
    fn generic_commentary_covers_all_triggers() {
        for trigger in COMMENTARY_TRIGGERS {
            assert!(generic_commentary(trigger).contains("{name}"));
        }
    }

    #[test]
    fn lookup_by_id() {
        assert!(archetype_by_id("breakout").is_some());
        assert!(archetype_by_id("nonsense").is_none());
    }
}
