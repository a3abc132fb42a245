// =============================================================================
// Agent Decision Engine — rules first, model second, rules as the net
// =============================================================================
//
// One engine per agent. Each tick produces exactly one decision:
//
//   Tier 1 — deterministic rules over the shared snapshot and agent state.
//   Tier 2 — optional model assist, only for borderline actionable calls
//            (confidence in [30, 70)) while the agent still has budget.
//   Tier 3 — any tier-2 failure silently falls back to the tier-1 result.
//
// Holds and waits are never escalated to the model. The engine also owns the
// per-agent model budget and the consecutive-hold counter used by the
// narrative layer.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::AgentState;
use crate::knife::KnifeGate;
use crate::llm::{estimate_cost_usd, extract_json_object, LlmInvoker};
use crate::market_data::{MarketSnapshot, RecAction, Timeframe};
use crate::strategy::TradingStrategy;
use crate::types::{HealthZone, Side};

/// Closed set of per-tick actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    Close,
    Dca,
    Hold,
    Wait,
}

impl DecisionAction {
    pub fn is_passive(self) -> bool {
        matches!(self, Self::Hold | Self::Wait)
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::Close => "close",
            Self::Dca => "dca",
            Self::Hold => "hold",
            Self::Wait => "wait",
        };
        write!(f, "{s}")
    }
}

/// The engine's verdict for one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub action: DecisionAction,
    /// [0, 100].
    pub confidence: f64,
    pub rationale: String,
    pub used_model: bool,
    /// Present for entries and DCAs.
    pub margin_percent: Option<f64>,
    /// Tokens charged to the agent for this decision (zero without tier 2).
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AgentDecision {
    fn rule(action: DecisionAction, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 100.0),
            rationale: rationale.into(),
            used_model: false,
            margin_percent: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Market regime inferred from the 1h timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
}

/// Infer the regime from 1h ATR (relative to price) and composite bias.
pub fn infer_regime(snapshot: &MarketSnapshot) -> Regime {
    let Some(h1) = snapshot.indicators(Timeframe::H1) else {
        return Regime::Ranging;
    };
    let atr_pct = if snapshot.last_price > 0.0 {
        h1.atr / snapshot.last_price * 100.0
    } else {
        0.0
    };
    if atr_pct > 1.5 {
        Regime::Volatile
    } else if h1.bias_score.abs() >= 2 {
        Regime::Trending
    } else {
        Regime::Ranging
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct DecisionEngine {
    pub agent_id: String,
    pub strategy: TradingStrategy,
    /// Free-text persona woven into tier-2 prompts.
    pub personality: String,
    pub model_id: Option<String>,
    pub budget_initial_usd: f64,
    pub budget_remaining_usd: f64,
    pub consecutive_holds: u32,
    budget_warned: bool,
}

impl DecisionEngine {
    pub fn new(
        agent_id: impl Into<String>,
        strategy: TradingStrategy,
        personality: impl Into<String>,
        model_id: Option<String>,
        budget_usd: f64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            strategy,
            personality: personality.into(),
            model_id,
            budget_initial_usd: budget_usd,
            budget_remaining_usd: budget_usd,
            consecutive_holds: 0,
            budget_warned: false,
        }
    }

    /// Fires once, the first time the remaining budget drops under 20%.
    pub fn take_budget_warning(&mut self) -> bool {
        if !self.budget_warned
            && self.budget_initial_usd > 0.0
            && self.budget_remaining_usd < self.budget_initial_usd * 0.2
        {
            self.budget_warned = true;
            return true;
        }
        false
    }

    /// Produce this tick's decision. `knife_gate` is the tracker's verdict
    /// for counter-trend entries; `llm` is the optional tier-2 capability.
    pub async fn decide(
        &mut self,
        agent: &AgentState,
        snapshot: &MarketSnapshot,
        knife_gate: KnifeGate,
        llm: Option<&dyn LlmInvoker>,
    ) -> AgentDecision {
        let tier1 = self.tier1(agent, snapshot, knife_gate);

        let decision = if self.should_escalate(&tier1, llm.is_some()) {
            match self.tier2(&tier1, agent, snapshot, llm.expect("checked")).await {
                Some(model_decision) => model_decision,
                None => tier1,
            }
        } else {
            tier1
        };

        if decision.action.is_passive() {
            self.consecutive_holds += 1;
        } else {
            self.consecutive_holds = 0;
        }

        decision
    }

    // ── Tier 1: rules ────────────────────────────────────────────────────

    fn tier1(
        &self,
        agent: &AgentState,
        snapshot: &MarketSnapshot,
        knife_gate: KnifeGate,
    ) -> AgentDecision {
        match agent.position.as_ref().filter(|p| p.is_open) {
            Some(_) => self.tier1_position(agent, snapshot),
            None => self.tier1_entry(agent, snapshot, knife_gate),
        }
    }

    fn tier1_entry(
        &self,
        agent: &AgentState,
        snapshot: &MarketSnapshot,
        knife_gate: KnifeGate,
    ) -> AgentDecision {
        let Some(rec) = snapshot.recommendation else {
            return AgentDecision::rule(DecisionAction::Wait, 50.0, "no market read yet");
        };

        let side = match rec.action {
            RecAction::Long => Side::Long,
            RecAction::Short => Side::Short,
            RecAction::Wait => {
                return AgentDecision::rule(
                    DecisionAction::Wait,
                    rec.confidence,
                    format!("market undecided (bias {:+.2})", rec.weighted_bias),
                );
            }
        };

        // Threshold rises as health falls; death row is the last stand.
        let zone = agent.health_zone;
        let threshold = self.strategy.entry_confidence
            + match zone {
                HealthZone::Critical => 20.0,
                HealthZone::Danger => 10.0,
                _ => 0.0,
            };

        // Regime affinity.
        let regime = infer_regime(snapshot);
        let preference = match regime {
            Regime::Trending => self.strategy.regime_preference.trending,
            Regime::Ranging => self.strategy.regime_preference.ranging,
            Regime::Volatile => self.strategy.regime_preference.volatile,
        };
        let regime_bonus = (preference - 0.5) * 20.0;

        // Personal timeframe weighting of the shared bias scores.
        let personal_bias = self.weighted_bias(snapshot);
        let personal_adj = side.sign() * personal_bias * 2.5;

        // RSI extremes nudge entries in the contrarian direction.
        let rsi_nudge = snapshot
            .indicators(Timeframe::H1)
            .map(|h1| {
                if h1.rsi <= self.strategy.rsi_oversold && side == Side::Long {
                    5.0
                } else if h1.rsi >= self.strategy.rsi_overbought && side == Side::Short {
                    5.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let adjusted = rec.confidence + regime_bonus + personal_adj + rsi_nudge;

        if adjusted < threshold {
            return AgentDecision::rule(
                DecisionAction::Wait,
                adjusted,
                format!("confidence {adjusted:.0} below bar {threshold:.0}"),
            );
        }

        // Size by conviction, shrink by fragility.
        let mut margin = self.margin_for_confidence(adjusted, threshold);
        margin *= zone.margin_scale();

        match knife_gate {
            KnifeGate::Block => {
                return AgentDecision::rule(
                    DecisionAction::Wait,
                    adjusted,
                    "knife in progress; not catching it",
                );
            }
            KnifeGate::Shrink(factor) => margin *= factor,
            KnifeGate::Clear => {}
        }

        let action = match side {
            Side::Long => DecisionAction::OpenLong,
            Side::Short => DecisionAction::OpenShort,
        };
        let mut decision = AgentDecision::rule(
            action,
            adjusted,
            format!(
                "{side} setup: base {:.0}, regime {regime:?} {regime_bonus:+.0}, personal {personal_adj:+.0}",
                rec.confidence
            ),
        );
        decision.margin_percent = Some(margin.clamp(1.0, 20.0));
        decision
    }

    fn tier1_position(&self, agent: &AgentState, snapshot: &MarketSnapshot) -> AgentDecision {
        let position = agent.position.as_ref().expect("caller checked");
        let now = chrono::Utc::now();
        let hours_open = position.hours_open(now);
        let pnl_pct = position.unrealized_pnl_pct;
        let zone = agent.health_zone;
        let rec = snapshot.recommendation;

        // (i) Time stop.
        if hours_open >= self.strategy.max_hours {
            return AgentDecision::rule(
                DecisionAction::Close,
                85.0,
                format!("time stop: {hours_open:.1}h >= {:.1}h", self.strategy.max_hours),
            );
        }

        // (ii) The market read flipped hard against us.
        if let Some(rec) = rec {
            let reversed = matches!(
                (position.side, rec.action),
                (Side::Long, RecAction::Short) | (Side::Short, RecAction::Long)
            );
            if reversed && rec.confidence >= 75.0 {
                return AgentDecision::rule(
                    DecisionAction::Close,
                    rec.confidence,
                    format!("signal reversed against {} at {:.0}", position.side, rec.confidence),
                );
            }
        }

        // (iii) Anti-greed take-profit.
        let time_pressure = if self.strategy.max_hours > 0.0 {
            hours_open / self.strategy.max_hours
        } else {
            0.0
        };
        if (pnl_pct > 3.0 && time_pressure > 0.6) || pnl_pct > 5.0 {
            return AgentDecision::rule(
                DecisionAction::Close,
                75.0,
                format!("taking {pnl_pct:.1}% off the table"),
            );
        }

        // (iv) Average in on a dip that still agrees with us.
        if pnl_pct <= -2.0
            && !matches!(zone, HealthZone::Critical | HealthZone::DeathRow)
            && position.dca_count < self.strategy.max_dca_count
        {
            if let Some(rec) = rec {
                let agrees = matches!(
                    (position.side, rec.action),
                    (Side::Long, RecAction::Long) | (Side::Short, RecAction::Short)
                );
                if agrees && rec.confidence >= self.strategy.dca_confidence {
                    let base = self.margin_for_confidence(rec.confidence, self.strategy.entry_confidence);
                    let mut decision = AgentDecision::rule(
                        DecisionAction::Dca,
                        rec.confidence,
                        format!("averaging a {pnl_pct:.1}% dip, signal still {}", position.side),
                    );
                    decision.margin_percent = Some((base * 0.5).max(1.0));
                    return decision;
                }
            }
        }

        // (v) Critical health: cut meaningful losses.
        if zone == HealthZone::Critical && pnl_pct <= -5.0 {
            return AgentDecision::rule(
                DecisionAction::Close,
                80.0,
                format!("cutting {pnl_pct:.1}% loss on critical health"),
            );
        }

        // (vi) Default: sit on it.
        AgentDecision::rule(
            DecisionAction::Hold,
            50.0,
            format!("holding {} at {pnl_pct:+.1}%", position.side),
        )
    }

    /// Interpolate margin between the cautious and full bounds by how far
    /// confidence clears the threshold.
    fn margin_for_confidence(&self, confidence: f64, threshold: f64) -> f64 {
        let span = (95.0 - threshold).max(1.0);
        let t = ((confidence - threshold) / span).clamp(0.0, 1.0);
        self.strategy.cautious_margin_percent
            + t * (self.strategy.full_margin_percent - self.strategy.cautious_margin_percent)
    }

    /// The agent's own timeframe-weighted bias in [-4, +4].
    fn weighted_bias(&self, snapshot: &MarketSnapshot) -> f64 {
        let w = &self.strategy.timeframe_weights;
        let mut total = 0.0;
        for (tf, weight) in [
            (Timeframe::D1, w.d1),
            (Timeframe::H4, w.h4),
            (Timeframe::H1, w.h1),
            (Timeframe::M15, w.m15),
            (Timeframe::M5, w.m5),
        ] {
            if let Some(ind) = snapshot.indicators(tf) {
                total += weight / 100.0 * ind.bias_score as f64;
            }
        }
        total
    }

    // ── Tier 2: model assist ─────────────────────────────────────────────

    fn should_escalate(&self, tier1: &AgentDecision, llm_available: bool) -> bool {
        !tier1.action.is_passive()
            && (30.0..70.0).contains(&tier1.confidence)
            && self.budget_remaining_usd > 0.0
            && self.model_id.is_some()
            && llm_available
    }

    /// Ask the model to confirm or overrule a borderline tier-1 call.
    /// Returns None on any failure; tokens are charged whenever a response
    /// was actually received.
    async fn tier2(
        &mut self,
        tier1: &AgentDecision,
        agent: &AgentState,
        snapshot: &MarketSnapshot,
        llm: &dyn LlmInvoker,
    ) -> Option<AgentDecision> {
        let model_id = self.model_id.clone()?;
        let system_prompt = self.tier2_system_prompt();
        let user_prompt = self.tier2_user_prompt(tier1, agent, snapshot);

        let response = match llm.invoke(&model_id, &system_prompt, &user_prompt, 300).await {
            Ok(r) => r,
            Err(e) => {
                // Transport failure: nothing consumed, nothing charged.
                warn!(agent = %self.agent_id, error = %e, "tier-2 call failed; using tier-1");
                return None;
            }
        };

        let cost = estimate_cost_usd(&model_id, response.input_tokens, response.output_tokens);
        self.budget_remaining_usd = (self.budget_remaining_usd - cost).max(0.0);

        let parsed = extract_json_object(&response.text)
            .and_then(|json| serde_json::from_str::<Tier2Reply>(json).ok());

        let Some(reply) = parsed else {
            // Tokens were consumed even though the reply was unusable; fall
            // back to tier-1 but keep the accounting.
            debug!(agent = %self.agent_id, "tier-2 reply unparseable; using tier-1");
            let mut fallback = tier1.clone();
            fallback.used_model = true;
            fallback.input_tokens = response.input_tokens;
            fallback.output_tokens = response.output_tokens;
            return Some(fallback);
        };

        let Some(action) = reply.parse_action() else {
            let mut fallback = tier1.clone();
            fallback.used_model = true;
            fallback.input_tokens = response.input_tokens;
            fallback.output_tokens = response.output_tokens;
            return Some(fallback);
        };

        // The model cannot conjure impossible actions: entries with a
        // position open or exits with none degrade to tier-1.
        let has_position = agent.position.as_ref().is_some_and(|p| p.is_open);
        let legal = match action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => !has_position,
            DecisionAction::Close | DecisionAction::Dca => has_position,
            DecisionAction::Hold | DecisionAction::Wait => true,
        };
        if !legal {
            let mut fallback = tier1.clone();
            fallback.used_model = true;
            fallback.input_tokens = response.input_tokens;
            fallback.output_tokens = response.output_tokens;
            return Some(fallback);
        }

        let margin_percent = match action {
            DecisionAction::OpenLong | DecisionAction::OpenShort | DecisionAction::Dca => Some(
                reply
                    .margin_percent
                    .or(tier1.margin_percent)
                    .unwrap_or(self.strategy.cautious_margin_percent)
                    .clamp(1.0, 20.0),
            ),
            _ => None,
        };

        Some(AgentDecision {
            action,
            confidence: reply.confidence.unwrap_or(tier1.confidence).clamp(0.0, 100.0),
            rationale: reply
                .reasoning
                .unwrap_or_else(|| "model concurred without comment".to_string()),
            used_model: true,
            margin_percent,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        })
    }

    fn tier2_system_prompt(&self) -> String {
        format!(
            "You are {persona}, a trader in a leveraged XRP/EUR paper-trading arena. \
             Decide the next action. Respond with a single JSON object: \
             {{\"action\": \"open_long|open_short|close|dca|hold|wait\", \
             \"confidence\": 0-100, \"margin_percent\": 5-20, \"reasoning\": \"...\"}}. \
             No other text.",
            persona = self.personality
        )
    }

    fn tier2_user_prompt(
        &self,
        tier1: &AgentDecision,
        agent: &AgentState,
        snapshot: &MarketSnapshot,
    ) -> String {
        let position_summary = match agent.position.as_ref().filter(|p| p.is_open) {
            Some(p) => format!(
                "{} {:.1} units @ {:.4}, P&L {:+.2}% ({} DCAs)",
                p.side, p.volume, p.avg_entry_price, p.unrealized_pnl_pct, p.dca_count
            ),
            None => "none".to_string(),
        };
        let rec_summary = match snapshot.recommendation {
            Some(r) => format!("{:?} at {:.0}", r.action, r.confidence),
            None => "unavailable".to_string(),
        };
        let h1 = snapshot.indicators(Timeframe::H1);

        format!(
            "Price: {:.4} (24h {:.4}..{:.4}). BTC: {:?} {:+.1}%.\n\
             1h RSI {:.0}, bias {}.\n\
             Base recommendation: {rec_summary}.\n\
             Your state: balance {:.2}, equity {:.2}, health {:.0} ({}), position: {position_summary}.\n\
             Rule engine suggests: {} at confidence {:.0} ({}).\n\
             Confirm or overrule.",
            snapshot.last_price,
            snapshot.low_24h,
            snapshot.high_24h,
            snapshot.btc_trend,
            snapshot.btc_change_24h,
            h1.map(|i| i.rsi).unwrap_or(50.0),
            h1.map(|i| i.bias_score).unwrap_or(0),
            agent.balance,
            agent.equity,
            agent.health,
            agent.health_zone,
            tier1.action,
            tier1.confidence,
            tier1.rationale,
        )
    }
}

/// Shape the model is asked to reply with.
#[derive(Debug, Deserialize)]
struct Tier2Reply {
    action: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    margin_percent: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl Tier2Reply {
    fn parse_action(&self) -> Option<DecisionAction> {
        match self.action.trim().to_lowercase().as_str() {
            "open_long" | "long" | "buy" => Some(DecisionAction::OpenLong),
            "open_short" | "short" | "sell" => Some(DecisionAction::OpenShort),
            "close" | "exit" => Some(DecisionAction::Close),
            "dca" | "average" | "add" => Some(DecisionAction::Dca),
            "hold" => Some(DecisionAction::Hold),
            "wait" => Some(DecisionAction::Wait),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Position;
    use crate::llm::LlmResponse;
    use crate::market_data::{BaseRecommendation, BtcTrend};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn snapshot_with(rec: Option<BaseRecommendation>) -> MarketSnapshot {
        MarketSnapshot {
            pair: "XRP/EUR".to_string(),
            last_price: 0.60,
            bid: 0.599,
            ask: 0.601,
            high_24h: 0.62,
            low_24h: 0.58,
            volume_24h: 1_000_000.0,
            timeframes: BTreeMap::new(),
            btc_trend: BtcTrend::Neut,
            btc_change_24h: 0.0,
            recommendation: rec,
            fetched_at: Utc::now(),
        }
    }

    fn rec(action: RecAction, confidence: f64) -> Option<BaseRecommendation> {
        Some(BaseRecommendation {
            action,
            confidence,
            weighted_bias: match action {
                RecAction::Long => 2.0,
                RecAction::Short => -2.0,
                RecAction::Wait => 0.0,
            },
        })
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(
            "agent-1",
            TradingStrategy::default(),
            "a steady hand",
            None,
            0.0,
        )
    }

    fn agent() -> AgentState {
        AgentState::new("Test", "momentum", "circle", 0, 1000.0)
    }

    fn with_position(mut a: AgentState, side: Side, pnl_pct: f64) -> AgentState {
        let mut pos = Position::open("XRP/EUR", side, 0.6, 1000.0, 10.0, 60.0, 0.0, "");
        pos.unrealized_pnl_pct = pnl_pct;
        pos.unrealized_pnl = 60.0 * pnl_pct / 100.0;
        a.position = Some(pos);
        a.recompute_derived();
        a
    }

    #[tokio::test]
    async fn strong_signal_opens_long() {
        let mut e = engine();
        let d = e
            .decide(&agent(), &snapshot_with(rec(RecAction::Long, 90.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::OpenLong);
        let margin = d.margin_percent.unwrap();
        assert!((1.0..=20.0).contains(&margin));
        assert!(!d.used_model);
    }

    #[tokio::test]
    async fn weak_signal_waits() {
        let mut e = engine();
        let d = e
            .decide(&agent(), &snapshot_with(rec(RecAction::Long, 45.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Wait);
        assert_eq!(e.consecutive_holds, 1);
    }

    #[tokio::test]
    async fn wait_recommendation_waits() {
        let mut e = engine();
        let d = e
            .decide(&agent(), &snapshot_with(rec(RecAction::Wait, 80.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Wait);
    }

    #[tokio::test]
    async fn knife_block_downgrades_entry_to_wait() {
        let mut e = engine();
        let d = e
            .decide(&agent(), &snapshot_with(rec(RecAction::Long, 90.0)), KnifeGate::Block, None)
            .await;
        assert_eq!(d.action, DecisionAction::Wait);
        assert!(d.rationale.contains("knife"));
    }

    #[tokio::test]
    async fn knife_shrink_halves_margin() {
        let mut e = engine();
        let snap = snapshot_with(rec(RecAction::Long, 90.0));
        let full = e
            .decide(&agent(), &snap, KnifeGate::Clear, None)
            .await
            .margin_percent
            .unwrap();
        let shrunk = e
            .decide(&agent(), &snap, KnifeGate::Shrink(0.5), None)
            .await
            .margin_percent
            .unwrap();
        assert!((shrunk - full * 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn critical_health_raises_the_bar() {
        let mut e = engine();
        let mut a = agent();
        a.balance = 300.0; // health 30 => critical; threshold 60 + 20 = 80
        a.recompute_derived();
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Long, 70.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Wait);
    }

    #[tokio::test]
    async fn death_row_is_a_last_stand() {
        let mut e = engine();
        let mut a = agent();
        a.balance = 150.0; // health 15 => death row; baseline threshold, full size
        a.recompute_derived();
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Long, 90.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::OpenLong);
    }

    #[tokio::test]
    async fn time_stop_closes() {
        let mut e = engine();
        let mut a = with_position(agent(), Side::Long, 0.5);
        a.position.as_mut().unwrap().opened_at = Utc::now() - Duration::hours(9);
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Long, 60.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Close);
        assert!(d.rationale.contains("time stop"));
    }

    #[tokio::test]
    async fn hard_reversal_closes() {
        let mut e = engine();
        let a = with_position(agent(), Side::Long, 1.0);
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Short, 80.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Close);
        assert!(d.rationale.contains("reversed"));
    }

    #[tokio::test]
    async fn anti_greed_takes_large_profit() {
        let mut e = engine();
        let a = with_position(agent(), Side::Long, 6.0);
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Long, 60.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Close);
    }

    #[tokio::test]
    async fn dca_on_agreeing_dip() {
        let mut e = engine();
        let a = with_position(agent(), Side::Long, -3.0);
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Long, 65.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Dca);
        assert!(d.margin_percent.unwrap() >= 1.0);
    }

    #[tokio::test]
    async fn no_dca_when_critical() {
        let mut e = engine();
        let mut a = with_position(agent(), Side::Long, -3.0);
        a.balance = 240.0; // push equity into critical
        a.recompute_derived();
        assert_eq!(a.health_zone, HealthZone::Critical);
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Long, 65.0)), KnifeGate::Clear, None)
            .await;
        assert_ne!(d.action, DecisionAction::Dca);
    }

    #[tokio::test]
    async fn critical_cuts_heavy_loss() {
        let mut e = engine();
        let mut a = with_position(agent(), Side::Long, -6.0);
        a.balance = 240.0;
        a.recompute_derived();
        assert_eq!(a.health_zone, HealthZone::Critical);
        let d = e
            .decide(&a, &snapshot_with(rec(RecAction::Wait, 50.0)), KnifeGate::Clear, None)
            .await;
        assert_eq!(d.action, DecisionAction::Close);
    }

    #[tokio::test]
    async fn default_is_hold_and_counter_increments() {
        let mut e = engine();
        let a = with_position(agent(), Side::Long, 0.5);
        let snap = snapshot_with(rec(RecAction::Wait, 50.0));
        for expected in 1..=3 {
            let d = e.decide(&a, &snap, KnifeGate::Clear, None).await;
            assert_eq!(d.action, DecisionAction::Hold);
            assert_eq!(e.consecutive_holds, expected);
        }
    }

    // ── Tier 2 ───────────────────────────────────────────────────────────

    struct ScriptedLlm {
        reply: String,
        fail: bool,
        calls: AtomicU64,
    }

    #[async_trait]
    impl LlmInvoker for ScriptedLlm {
        async fn invoke(
            &self,
            _model_id: &str,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
        ) -> anyhow::Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("connection reset");
            }
            Ok(LlmResponse {
                text: self.reply.clone(),
                input_tokens: 500,
                output_tokens: 100,
            })
        }
    }

    fn model_engine(budget: f64) -> DecisionEngine {
        DecisionEngine::new(
            "agent-2",
            TradingStrategy::default(),
            "a bold gambler",
            Some("gpt-4o-mini".to_string()),
            budget,
        )
    }

    /// A borderline entry: confidence lands in [30, 70).
    fn borderline_snapshot() -> MarketSnapshot {
        snapshot_with(rec(RecAction::Long, 62.0))
    }

    #[tokio::test]
    async fn tier2_overrules_borderline_call() {
        let llm = ScriptedLlm {
            reply: r#"{"action": "wait", "confidence": 80, "reasoning": "spread too wide"}"#
                .to_string(),
            fail: false,
            calls: AtomicU64::new(0),
        };
        let mut e = model_engine(1.0);
        let d = e
            .decide(&agent(), &borderline_snapshot(), KnifeGate::Clear, Some(&llm))
            .await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.action, DecisionAction::Wait);
        assert!(d.used_model);
        assert_eq!(d.input_tokens, 500);
        assert!(e.budget_remaining_usd < 1.0);
    }

    #[tokio::test]
    async fn tier2_parse_failure_falls_back_but_charges() {
        let llm = ScriptedLlm {
            reply: "I would simply win the competition.".to_string(),
            fail: false,
            calls: AtomicU64::new(0),
        };
        let mut e = model_engine(1.0);
        let d = e
            .decide(&agent(), &borderline_snapshot(), KnifeGate::Clear, Some(&llm))
            .await;
        assert_eq!(d.action, DecisionAction::OpenLong); // tier-1 result
        assert!(d.used_model);
        assert_eq!(d.output_tokens, 100);
        assert!(e.budget_remaining_usd < 1.0);
    }

    #[tokio::test]
    async fn tier2_transport_failure_is_free() {
        let llm = ScriptedLlm {
            reply: String::new(),
            fail: true,
            calls: AtomicU64::new(0),
        };
        let mut e = model_engine(1.0);
        let d = e
            .decide(&agent(), &borderline_snapshot(), KnifeGate::Clear, Some(&llm))
            .await;
        assert_eq!(d.action, DecisionAction::OpenLong);
        assert!(!d.used_model);
        assert_eq!(e.budget_remaining_usd, 1.0);
    }

    #[tokio::test]
    async fn tier2_suppressed_without_budget() {
        let llm = ScriptedLlm {
            reply: r#"{"action": "wait"}"#.to_string(),
            fail: false,
            calls: AtomicU64::new(0),
        };
        let mut e = model_engine(0.0);
        let _ = e
            .decide(&agent(), &borderline_snapshot(), KnifeGate::Clear, Some(&llm))
            .await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tier2_never_escalates_confident_calls() {
        let llm = ScriptedLlm {
            reply: r#"{"action": "wait"}"#.to_string(),
            fail: false,
            calls: AtomicU64::new(0),
        };
        let mut e = model_engine(1.0);
        let _ = e
            .decide(&agent(), &snapshot_with(rec(RecAction::Long, 95.0)), KnifeGate::Clear, Some(&llm))
            .await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tier2_illegal_action_falls_back() {
        // Model says close, but there is no position.
        let llm = ScriptedLlm {
            reply: r#"{"action": "close", "confidence": 90}"#.to_string(),
            fail: false,
            calls: AtomicU64::new(0),
        };
        let mut e = model_engine(1.0);
        let d = e
            .decide(&agent(), &borderline_snapshot(), KnifeGate::Clear, Some(&llm))
            .await;
        assert_eq!(d.action, DecisionAction::OpenLong);
        assert!(d.used_model);
    }

    #[test]
    fn budget_warning_fires_once() {
        let mut e = model_engine(1.0);
        assert!(!e.take_budget_warning());
        e.budget_remaining_usd = 0.1;
        assert!(e.take_budget_warning());
        assert!(!e.take_budget_warning());
    }
}
