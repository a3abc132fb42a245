// =============================================================================
// Arena Events — the narrative stream and its stateful detector
// =============================================================================
//
// Every observable fact leaves the core as an ArenaEvent. The EventDetector
// holds per-session memory (previous leader, a bounded price ring, streaks,
// near-death and comeback latches, active face-off pairs) and turns per-tick
// agent snapshots into dramatic events exactly once each.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::agent::AgentState;
use crate::types::Side;

/// Bounded ring of previous prices used for market-shock detection.
const PRICE_HISTORY_CAP: usize = 100;

// =============================================================================
// Event model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

/// Closed set of event types crossing the subscriber boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Tick,
    AgentAction,
    TradeOpen,
    TradeClose,
    TradeDca,
    AgentDeath,
    LeaderboardUpdate,
    FaceOff,
    LeadChange,
    NearDeath,
    HotStreak,
    Comeback,
    MarketShock,
    BadgeEarned,
    Milestone,
    SessionStarted,
    SessionPaused,
    SessionResumed,
    SessionEnded,
    BudgetWarning,
    AgentHold,
    AgentWait,
    AgentAnalyzing,
    AgentThinking,
    RosterReveal,
    SessionCountdown,
}

/// One immutable, append-only event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaEvent {
    pub id: String,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub importance: Importance,
    pub title: String,
    pub detail: String,
    pub price_at: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ArenaEvent {
    pub fn new(
        event_type: EventType,
        importance: Importance,
        title: impl Into<String>,
        detail: impl Into<String>,
        price_at: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            agent_id: None,
            agent_name: None,
            importance,
            title: title.into(),
            detail: detail.into(),
            price_at,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_agent(mut self, id: &str, name: &str) -> Self {
        self.agent_id = Some(id.to_string());
        self.agent_name = Some(name.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// =============================================================================
// Detector
// =============================================================================

/// Per-session detector memory. Construct fresh for every session.
#[derive(Debug, Default)]
pub struct EventDetector {
    prev_leader: Option<String>,
    price_history: VecDeque<f64>,
    win_streaks: HashMap<String, u32>,
    lowest_health: HashMap<String, f64>,
    near_death_alerted: HashSet<String>,
    comeback_alerted: HashSet<String>,
    active_face_offs: HashSet<(String, String)>,
    countdown_emitted: [bool; 3],
}

/// Countdown thresholds in milliseconds: 1h, 15m, 5m.
const COUNTDOWNS: [(u64, &str, Importance); 3] = [
    (3_600_000, "One hour remains", Importance::Medium),
    (900_000, "Fifteen minutes remain", Importance::Medium),
    (300_000, "Five minutes remain", Importance::High),
];

impl EventDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run all per-tick checks over the updated agent states. Order:
    /// face-offs, lead change, near-death, comeback, market shock.
    pub fn detect(
        &mut self,
        agents: &BTreeMap<String, AgentState>,
        price: f64,
    ) -> Vec<ArenaEvent> {
        let mut events = Vec::new();

        self.detect_face_offs(agents, price, &mut events);
        self.detect_lead_change(agents, price, &mut events);
        self.detect_near_death(agents, price, &mut events);
        self.detect_comebacks(agents, price, &mut events);
        self.detect_market_shock(price, &mut events);

        events
    }

    /// Trade-close path: advance the win streak and emit hot-streak events.
    pub fn record_trade_close(
        &mut self,
        agent: &AgentState,
        win: bool,
        price: f64,
    ) -> Option<ArenaEvent> {
        let streak = self.win_streaks.entry(agent.id.clone()).or_insert(0);
        if !win {
            *streak = 0;
            return None;
        }
        *streak += 1;
        let streak = *streak;
        if streak < 3 {
            return None;
        }

        let importance = if streak >= 5 {
            Importance::High
        } else {
            Importance::Medium
        };
        Some(
            ArenaEvent::new(
                EventType::HotStreak,
                importance,
                format!("{} is on fire", agent.name),
                format!("{} straight winning trades", streak),
                price,
            )
            .with_agent(&agent.id, &agent.name)
            .with_metadata(json!({ "streak": streak })),
        )
    }

    /// Emit each countdown exactly once as remaining time crosses it.
    /// Thresholds at or above the full session length never fire.
    pub fn countdown_events(
        &mut self,
        remaining_ms: u64,
        total_ms: u64,
        price: f64,
    ) -> Vec<ArenaEvent> {
        let mut events = Vec::new();
        for (i, (threshold, title, importance)) in COUNTDOWNS.iter().enumerate() {
            if *threshold >= total_ms || self.countdown_emitted[i] {
                continue;
            }
            if remaining_ms <= *threshold {
                self.countdown_emitted[i] = true;
                events.push(
                    ArenaEvent::new(
                        EventType::SessionCountdown,
                        *importance,
                        *title,
                        format!("{} seconds left in the arena", remaining_ms / 1000),
                        price,
                    )
                    .with_metadata(json!({ "remaining_ms": remaining_ms })),
                );
            }
        }
        events
    }

    /// The detector's view of the current leader, for the orchestrator.
    pub fn current_leader(&self) -> Option<&str> {
        self.prev_leader.as_deref()
    }

    // ── Individual checks ────────────────────────────────────────────────

    fn detect_face_offs(
        &mut self,
        agents: &BTreeMap<String, AgentState>,
        price: f64,
        events: &mut Vec<ArenaEvent>,
    ) {
        let mut current: HashSet<(String, String)> = HashSet::new();
        let sided: Vec<(&AgentState, Side)> = agents
            .values()
            .filter(|a| a.is_alive())
            .filter_map(|a| {
                a.position
                    .as_ref()
                    .filter(|p| p.is_open)
                    .map(|p| (a, p.side))
            })
            .collect();

        for (i, (a, a_side)) in sided.iter().enumerate() {
            for (b, b_side) in sided.iter().skip(i + 1) {
                if *a_side == b_side.opposite() {
                    let key = pair_key(&a.id, &b.id);
                    current.insert(key.clone());
                    if !self.active_face_offs.contains(&key) {
                        let (long, short) = if *a_side == Side::Long { (a, b) } else { (b, a) };
                        events.push(
                            ArenaEvent::new(
                                EventType::FaceOff,
                                Importance::High,
                                format!("{} vs {}", long.name, short.name),
                                format!(
                                    "{} is long, {} is short. Only one walks away right.",
                                    long.name, short.name
                                ),
                                price,
                            )
                            .with_metadata(json!({
                                "long_agent_id": long.id,
                                "short_agent_id": short.id,
                            })),
                        );
                    }
                }
            }
        }

        self.active_face_offs = current;
    }

    fn detect_lead_change(
        &mut self,
        agents: &BTreeMap<String, AgentState>,
        price: f64,
        events: &mut Vec<ArenaEvent>,
    ) {
        let leader = agents
            .values()
            .filter(|a| a.is_alive())
            .max_by(|a, b| a.equity.total_cmp(&b.equity));

        let Some(leader) = leader else {
            return;
        };

        if let Some(prev) = &self.prev_leader {
            if *prev != leader.id {
                let prev_name = agents
                    .get(prev)
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| "the former leader".to_string());
                events.push(
                    ArenaEvent::new(
                        EventType::LeadChange,
                        Importance::Medium,
                        format!("{} takes the lead", leader.name),
                        format!(
                            "{} overtakes {} with equity {:.2}",
                            leader.name, prev_name, leader.equity
                        ),
                        price,
                    )
                    .with_agent(&leader.id, &leader.name),
                );
            }
        }

        self.prev_leader = Some(leader.id.clone());
    }

    fn detect_near_death(
        &mut self,
        agents: &BTreeMap<String, AgentState>,
        price: f64,
        events: &mut Vec<ArenaEvent>,
    ) {
        for agent in agents.values() {
            // Latch bookkeeping also feeds comebacks.
            let lowest = self
                .lowest_health
                .entry(agent.id.clone())
                .or_insert(agent.health);
            if agent.health < *lowest {
                *lowest = agent.health;
            }

            if !agent.is_alive() {
                continue;
            }

            if agent.health <= 25.0 {
                if self.near_death_alerted.insert(agent.id.clone()) {
                    events.push(
                        ArenaEvent::new(
                            EventType::NearDeath,
                            Importance::High,
                            format!("{} is on the ropes", agent.name),
                            format!("Health down to {:.0}%", agent.health),
                            price,
                        )
                        .with_agent(&agent.id, &agent.name),
                    );
                }
            } else if agent.health > 40.0 {
                // Recovery above 40 re-arms the alert.
                self.near_death_alerted.remove(&agent.id);
            }
        }
    }

    fn detect_comebacks(
        &mut self,
        agents: &BTreeMap<String, AgentState>,
        price: f64,
        events: &mut Vec<ArenaEvent>,
    ) {
        for agent in agents.values().filter(|a| a.is_alive()) {
            if self.comeback_alerted.contains(&agent.id) {
                continue;
            }
            let lowest = self.lowest_health.get(&agent.id).copied().unwrap_or(100.0);
            if lowest < 40.0 && agent.health > 70.0 {
                self.comeback_alerted.insert(agent.id.clone());
                events.push(
                    ArenaEvent::new(
                        EventType::Comeback,
                        Importance::High,
                        format!("{} climbs back from the brink", agent.name),
                        format!(
                            "From {:.0}% health to {:.0}%. The arena loves a comeback.",
                            lowest, agent.health
                        ),
                        price,
                    )
                    .with_agent(&agent.id, &agent.name),
                );
            }
        }
    }

    fn detect_market_shock(&mut self, price: f64, events: &mut Vec<ArenaEvent>) {
        if let Some(&prev) = self.price_history.back() {
            if prev > 0.0 {
                let change_pct = (price - prev) / prev * 100.0;
                if change_pct.abs() > 1.0 {
                    let importance = if change_pct.abs() > 2.5 {
                        Importance::High
                    } else {
                        Importance::Medium
                    };
                    let direction = if change_pct > 0.0 { "surges" } else { "plunges" };
                    events.push(
                        ArenaEvent::new(
                            EventType::MarketShock,
                            importance,
                            format!("Market {direction} {:.2}%", change_pct.abs()),
                            format!("Price moved {prev:.4} -> {price:.4} in one tick"),
                            price,
                        )
                        .with_metadata(json!({ "change_pct": change_pct })),
                    );
                }
            }
        }

        self.price_history.push_back(price);
        while self.price_history.len() > PRICE_HISTORY_CAP {
            self.price_history.pop_front();
        }
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Position;
    use crate::types::AgentStatus;

    fn agent(name: &str, capital: f64) -> AgentState {
        AgentState::new(name, "momentum", "circle", 0, capital)
    }

    fn give_position(a: &mut AgentState, side: Side) {
        a.position = Some(Position::open("XRP/EUR", side, 0.6, 100.0, 10.0, 60.0, 0.0, ""));
        a.recompute_derived();
    }

    fn agents_map(list: Vec<AgentState>) -> BTreeMap<String, AgentState> {
        list.into_iter().map(|a| (a.id.clone(), a)).collect()
    }

    fn events_of(events: &[ArenaEvent], t: EventType) -> usize {
        events.iter().filter(|e| e.event_type == t).count()
    }

    // ---- S4: face-off emission ---------------------------------------------

    #[test]
    fn face_off_emitted_once_per_pair() {
        let mut a = agent("Long Larry", 1000.0);
        let mut b = agent("Short Sally", 1000.0);
        give_position(&mut a, Side::Long);
        give_position(&mut b, Side::Short);
        let agents = agents_map(vec![a, b]);

        let mut d = EventDetector::new();
        let first = d.detect(&agents, 0.6);
        assert_eq!(events_of(&first, EventType::FaceOff), 1);

        // Both still opposite: no repeat.
        let second = d.detect(&agents, 0.6);
        assert_eq!(events_of(&second, EventType::FaceOff), 0);
    }

    #[test]
    fn face_off_rearms_after_close() {
        let mut a = agent("A", 1000.0);
        let mut b = agent("B", 1000.0);
        give_position(&mut a, Side::Long);
        give_position(&mut b, Side::Short);
        let mut agents = agents_map(vec![a, b]);

        let mut d = EventDetector::new();
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::FaceOff), 1);

        // One side closes: pair clears.
        let first_id = agents.keys().next().unwrap().clone();
        agents.get_mut(&first_id).unwrap().position = None;
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::FaceOff), 0);

        // Re-opens opposite: a fresh face-off fires.
        let side = {
            let other = agents
                .values()
                .find(|x| x.id != first_id)
                .and_then(|x| x.position.as_ref())
                .unwrap();
            other.side.opposite()
        };
        give_position(agents.get_mut(&first_id).unwrap(), side);
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::FaceOff), 1);
    }

    // ---- Lead change --------------------------------------------------------

    #[test]
    fn lead_change_fires_only_on_transition() {
        let a = agent("A", 1000.0);
        let b = agent("B", 1000.0);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        let mut agents = agents_map(vec![a, b]);
        agents.get_mut(&a_id).unwrap().equity = 1100.0;

        let mut d = EventDetector::new();
        // First observation establishes the leader silently.
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::LeadChange), 0);
        // Same leader: silent.
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::LeadChange), 0);

        // B overtakes.
        agents.get_mut(&b_id).unwrap().equity = 1200.0;
        let events = d.detect(&agents, 0.6);
        assert_eq!(events_of(&events, EventType::LeadChange), 1);
    }

    #[test]
    fn dead_agents_cannot_lead() {
        let a = agent("A", 1000.0);
        let b = agent("B", 1000.0);
        let a_id = a.id.clone();
        let mut agents = agents_map(vec![a, b]);
        let mut d = EventDetector::new();
        d.detect(&agents, 0.6);

        let dead = agents.get_mut(&a_id).unwrap();
        dead.equity = 99999.0;
        dead.mark_dead(AgentStatus::Liquidated, 1, "test");
        d.detect(&agents, 0.6);
        assert_ne!(d.current_leader(), Some(a_id.as_str()));
    }

    // ---- Near-death hysteresis ---------------------------------------------

    #[test]
    fn near_death_emits_once_until_recovery() {
        let mut a = agent("Frail Fred", 1000.0);
        a.balance = 200.0;
        a.recompute_derived(); // health 20
        let id = a.id.clone();
        let mut agents = agents_map(vec![a]);

        let mut d = EventDetector::new();
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::NearDeath), 1);
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::NearDeath), 0);

        // Recovery to 35 does not re-arm (needs > 40).
        agents.get_mut(&id).unwrap().balance = 350.0;
        agents.get_mut(&id).unwrap().recompute_derived();
        d.detect(&agents, 0.6);
        agents.get_mut(&id).unwrap().balance = 200.0;
        agents.get_mut(&id).unwrap().recompute_derived();
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::NearDeath), 0);

        // Recovery above 40 re-arms the alert.
        agents.get_mut(&id).unwrap().balance = 500.0;
        agents.get_mut(&id).unwrap().recompute_derived();
        d.detect(&agents, 0.6);
        agents.get_mut(&id).unwrap().balance = 200.0;
        agents.get_mut(&id).unwrap().recompute_derived();
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::NearDeath), 1);
    }

    // ---- Comeback latch -----------------------------------------------------

    #[test]
    fn comeback_emitted_once_for_session() {
        let mut a = agent("Lazarus", 1000.0);
        a.balance = 300.0;
        a.recompute_derived(); // dips to 30
        let id = a.id.clone();
        let mut agents = agents_map(vec![a]);

        let mut d = EventDetector::new();
        d.detect(&agents, 0.6);

        agents.get_mut(&id).unwrap().balance = 800.0;
        agents.get_mut(&id).unwrap().recompute_derived(); // back to 80
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::Comeback), 1);

        // Dip and recover again: the latch holds for the session.
        agents.get_mut(&id).unwrap().balance = 300.0;
        agents.get_mut(&id).unwrap().recompute_derived();
        d.detect(&agents, 0.6);
        agents.get_mut(&id).unwrap().balance = 800.0;
        agents.get_mut(&id).unwrap().recompute_derived();
        assert_eq!(events_of(&d.detect(&agents, 0.6), EventType::Comeback), 0);
    }

    // ---- Market shock -------------------------------------------------------

    #[test]
    fn market_shock_threshold_is_strict() {
        let agents = agents_map(vec![agent("A", 1000.0)]);
        let mut d = EventDetector::new();

        d.detect(&agents, 0.6000);
        // Exactly 1.0%: no shock (threshold is strictly greater than).
        assert_eq!(events_of(&d.detect(&agents, 0.6060), EventType::MarketShock), 0);
        // 1.16% from 0.606: shock.
        assert_eq!(events_of(&d.detect(&agents, 0.6131), EventType::MarketShock), 1);
    }

    #[test]
    fn market_shock_uses_consecutive_prices() {
        let agents = agents_map(vec![agent("A", 1000.0)]);
        let mut d = EventDetector::new();
        d.detect(&agents, 0.60);
        d.detect(&agents, 0.603); // +0.5%
        d.detect(&agents, 0.606); // +0.5%
        // Cumulative move is >1% but no consecutive step is.
        let events = d.detect(&agents, 0.609);
        assert_eq!(events_of(&events, EventType::MarketShock), 0);
    }

    // ---- Hot streak ---------------------------------------------------------

    #[test]
    fn hot_streak_starts_at_three_and_escalates_at_five() {
        let a = agent("Streaky", 1000.0);
        let mut d = EventDetector::new();

        assert!(d.record_trade_close(&a, true, 0.6).is_none());
        assert!(d.record_trade_close(&a, true, 0.6).is_none());
        let third = d.record_trade_close(&a, true, 0.6).unwrap();
        assert_eq!(third.importance, Importance::Medium);
        let fourth = d.record_trade_close(&a, true, 0.6).unwrap();
        assert_eq!(fourth.importance, Importance::Medium);
        let fifth = d.record_trade_close(&a, true, 0.6).unwrap();
        assert_eq!(fifth.importance, Importance::High);

        // A loss resets the streak.
        assert!(d.record_trade_close(&a, false, 0.6).is_none());
        assert!(d.record_trade_close(&a, true, 0.6).is_none());
    }

    // ---- Countdowns ---------------------------------------------------------

    #[test]
    fn countdowns_fire_once_each() {
        let mut d = EventDetector::new();
        let total = 2 * 3_600_000; // 2h session

        assert!(d.countdown_events(90 * 60_000, total, 0.6).is_empty());
        // Crossing 1h.
        assert_eq!(d.countdown_events(59 * 60_000, total, 0.6).len(), 1);
        assert!(d.countdown_events(58 * 60_000, total, 0.6).is_empty());
        // Crossing 15m.
        assert_eq!(d.countdown_events(14 * 60_000, total, 0.6).len(), 1);
        // Crossing 5m.
        assert_eq!(d.countdown_events(4 * 60_000, total, 0.6).len(), 1);
        assert!(d.countdown_events(60_000, total, 0.6).is_empty());
    }

    #[test]
    fn countdowns_skip_thresholds_beyond_session_length() {
        let mut d = EventDetector::new();
        let total = 30 * 60_000; // 30 minute session: the 1h threshold never fires
        let events = d.countdown_events(14 * 60_000, total, 0.6);
        assert_eq!(events.len(), 1); // only the 15m threshold
    }
}
