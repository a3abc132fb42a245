// =============================================================================
// Orchestrator — session lifecycle, the tick loop, and subscriber fan-out
// =============================================================================
//
// One logical instance per process (see the named registry at the bottom).
// The orchestrator owns every agent's state; all other components are
// data-in/data-out. Mutation happens exclusively on the tick path, which is
// serialised by an async gate mutex — external operations (start, pause,
// stop) take the same gate, so at most one session-mutating computation runs
// at any time. parking_lot locks are only ever held between await points.
//
// Per tick: countdowns -> auto-pause check -> market fetch -> knife update ->
// per-agent liquidation/decision/execution (agent-id order) -> detector ->
// rankings -> one composite tick event -> buffered persistence.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::AgentState;
use crate::config::SessionConfig;
use crate::decision::{AgentDecision, DecisionAction, DecisionEngine};
use crate::events::{ArenaEvent, EventDetector, EventType, Importance};
use crate::execution::{self, ClosedTrade, ExecOutcome};
use crate::knife::{KnifeGate, KnifeTracker};
use crate::llm::{estimate_cost_usd, LlmInvoker};
use crate::market_data::{MarketDataCache, MarketSnapshot, RecAction, Timeframe};
use crate::roster::Roster;
use crate::scoring::{award_titles, rank_agents, AwardedTitle, RankedAgent};
use crate::store::{ArenaStore, DecisionRecord};
use crate::strategy::generic_commentary;
use crate::types::{Activity, AgentStatus, SessionStatus, Side};

/// Pause the session after this long without any subscriber.
pub const SUBSCRIBER_IDLE_PAUSE: Duration = Duration::from_secs(30);
/// Non-tick events replayed to late subscribers.
pub const EVENT_RING_CAPACITY: usize = 500;
/// Decision buffer flush cadence, in ticks.
pub const DECISION_FLUSH_TICKS: u64 = 10;
/// Snapshot + agent upsert cadence.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

/// Subscriber callback. Must be non-blocking; a panicking sink is isolated.
pub type EventSink = Box<dyn Fn(&ArenaEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    sink: EventSink,
}

// =============================================================================
// Summary types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub name: String,
    pub status: AgentStatus,
    pub equity: f64,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub trade_count: u64,
    pub win_count: u32,
    pub loss_count: u32,
    pub model_cost_usd: f64,
    pub badges: Vec<String>,
}

/// Returned by `stop` and persisted onto the session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_ms: u64,
    pub ticks: u64,
    pub start_price: f64,
    pub end_price: f64,
    pub rankings: Vec<RankedAgent>,
    pub titles: Vec<AwardedTitle>,
    pub agents: Vec<AgentSummary>,
}

// =============================================================================
// Session state
// =============================================================================

struct SessionState {
    status: SessionStatus,
    session_id: Option<String>,
    config: Option<SessionConfig>,
    agents: BTreeMap<String, AgentState>,
    /// agent_id -> trigger -> template.
    commentary: HashMap<String, BTreeMap<String, String>>,
    detector: EventDetector,
    knife: KnifeTracker,
    tick: u64,
    started_at: Option<Instant>,
    start_price: f64,
    last_price: f64,
    decision_buffer: Vec<DecisionRecord>,
    last_snapshot_at: Option<Instant>,
    prev_rank_order: Vec<String>,
    theme: String,
    master_commentary: String,
    milestone_emitted: bool,
    first_blood_claimed: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            session_id: None,
            config: None,
            agents: BTreeMap::new(),
            commentary: HashMap::new(),
            detector: EventDetector::new(),
            knife: KnifeTracker::default(),
            tick: 0,
            started_at: None,
            start_price: 0.0,
            last_price: 0.0,
            decision_buffer: Vec::new(),
            last_snapshot_at: None,
            prev_rank_order: Vec::new(),
            theme: String::new(),
            master_commentary: String::new(),
            milestone_emitted: false,
            first_blood_claimed: false,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    store: Arc<ArenaStore>,
    market: Arc<MarketDataCache>,
    llm: Option<Arc<dyn LlmInvoker>>,

    inner: RwLock<SessionState>,
    engines: Mutex<HashMap<String, DecisionEngine>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    /// Last moment a subscriber was present. Checked only while the set is
    /// empty; reset by start/resume so fresh sessions get their grace period.
    last_subscriber_at: Mutex<Instant>,
    event_ring: RwLock<VecDeque<ArenaEvent>>,
    /// Serialises the tick against itself and against external operations.
    gate: tokio::sync::Mutex<()>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    subscriber_idle_pause: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ArenaStore>,
        market: Arc<MarketDataCache>,
        llm: Option<Arc<dyn LlmInvoker>>,
    ) -> Self {
        Self {
            store,
            market,
            llm,
            inner: RwLock::new(SessionState::new()),
            engines: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            last_subscriber_at: Mutex::new(Instant::now()),
            event_ring: RwLock::new(VecDeque::new()),
            gate: tokio::sync::Mutex::new(()),
            scheduler: Mutex::new(None),
            subscriber_idle_pause: SUBSCRIBER_IDLE_PAUSE,
        }
    }

    /// Orchestrator with a short auto-pause window (tests).
    pub fn with_idle_pause(
        store: Arc<ArenaStore>,
        market: Arc<MarketDataCache>,
        llm: Option<Arc<dyn LlmInvoker>>,
        idle_pause: Duration,
    ) -> Self {
        let mut o = Self::new(store, market, llm);
        o.subscriber_idle_pause = idle_pause;
        o
    }

    // ── Read-only accessors ──────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        self.inner.read().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session_id.clone()
    }

    pub fn current_tick(&self) -> u64 {
        self.inner.read().tick
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.inner.read().elapsed_ms()
    }

    pub fn config(&self) -> Option<SessionConfig> {
        self.inner.read().config.clone()
    }

    pub fn current_price(&self) -> f64 {
        self.inner.read().last_price
    }

    pub fn agent_states(&self) -> Vec<AgentState> {
        self.inner.read().agents.values().cloned().collect()
    }

    pub fn rankings(&self) -> Vec<RankedAgent> {
        let mut agents = self.inner.read().agents.clone();
        rank_agents(&mut agents)
    }

    /// Last 500 non-tick events, oldest first.
    pub fn event_buffer(&self) -> Vec<ArenaEvent> {
        self.event_ring.read().iter().cloned().collect()
    }

    // ── Lifecycle operations ─────────────────────────────────────────────

    /// Create a session from a validated config and a generated roster.
    /// Requires no active session (idle, or an abandoned pending one).
    pub async fn create_session(
        &self,
        config: SessionConfig,
        roster: Roster,
    ) -> Result<(String, Vec<AgentState>)> {
        config.validate().context("invalid session config")?;
        let _gate = self.gate.lock().await;

        {
            let inner = self.inner.read();
            match inner.status {
                SessionStatus::Idle => {}
                // An abandoned created-but-never-started session is replaced.
                SessionStatus::Pending => {
                    info!("replacing abandoned pending session");
                }
                other => bail!("cannot create a session while {other}"),
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let config_json = serde_json::to_string(&config).unwrap_or_else(|_| "{}".into());
        if let Err(e) = self.store.insert_session(&session_id, &config_json) {
            warn!(error = %e, "failed to persist session row");
        }

        let budget = config.agent_budget_usd();
        let mut agents = BTreeMap::new();
        let mut commentary = HashMap::new();
        let mut engines = HashMap::new();

        for spec in &roster.agents {
            let agent = AgentState::new(
                spec.name.clone(),
                spec.archetype.clone(),
                spec.avatar_shape.clone(),
                spec.color_index,
                config.starting_capital,
            );
            let strategy_json =
                serde_json::to_string(&spec.strategy).unwrap_or_else(|_| "{}".into());
            if let Err(e) =
                self.store
                    .insert_agent(&session_id, &agent, &spec.personality, &strategy_json)
            {
                warn!(error = %e, agent = %agent.name, "failed to persist agent row");
            }

            engines.insert(
                agent.id.clone(),
                DecisionEngine::new(
                    agent.id.clone(),
                    spec.strategy.clone(),
                    spec.personality.clone(),
                    config.model_id.clone(),
                    budget,
                ),
            );
            commentary.insert(agent.id.clone(), spec.commentary.clone());
            agents.insert(agent.id.clone(), agent);
        }

        let snapshots: Vec<AgentState> = agents.values().cloned().collect();

        {
            let mut inner = self.inner.write();
            *inner = SessionState::new();
            inner.status = SessionStatus::Pending;
            inner.session_id = Some(session_id.clone());
            inner.config = Some(config);
            inner.agents = agents;
            inner.commentary = commentary;
            inner.theme = roster.theme.clone();
            inner.master_commentary = roster.master_commentary.clone();
        }
        *self.engines.lock() = engines;

        let roster_meta = json!({
            "theme": roster.theme.clone(),
            "agents": snapshots
                .iter()
                .map(|a| json!({
                    "id": a.id,
                    "name": a.name,
                    "archetype": a.archetype,
                    "avatar_shape": a.avatar_shape,
                    "color_index": a.color_index,
                }))
                .collect::<Vec<_>>(),
        });
        self.emit(
            ArenaEvent::new(
                EventType::RosterReveal,
                Importance::High,
                format!("{} enter the arena", snapshots.len()),
                roster.theme,
                0.0,
            )
            .with_metadata(roster_meta),
        );

        info!(session_id = %session_id, agents = snapshots.len(), "session created");
        Ok((session_id, snapshots))
    }

    /// Start a created session. The initial market fetch is forced so a dead
    /// upstream fails fast: on error the status resets to idle (the session
    /// is retained) and the caller can retry.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _gate = self.gate.lock().await;

        {
            let inner = self.inner.read();
            if inner.session_id.is_none() {
                bail!("no session created");
            }
            match inner.status {
                SessionStatus::Pending | SessionStatus::Idle => {}
                other => bail!("cannot start while {other}"),
            }
        }

        let snapshot = match self.market.fetch(true).await {
            Ok(s) => s,
            Err(e) => {
                self.inner.write().status = SessionStatus::Idle;
                return Err(e.context("initial market fetch failed; session left idle"));
            }
        };

        let (session_id, theme, master_commentary) = {
            let mut inner = self.inner.write();
            inner.status = SessionStatus::Running;
            inner.started_at = Some(Instant::now());
            inner.start_price = snapshot.last_price;
            inner.last_price = snapshot.last_price;
            (
                inner.session_id.clone().expect("checked above"),
                inner.theme.clone(),
                inner.master_commentary.clone(),
            )
        };
        *self.last_subscriber_at.lock() = Instant::now();

        if let Err(e) = self.store.mark_session_started(&session_id, snapshot.last_price) {
            warn!(error = %e, "failed to persist session start");
        }

        self.emit(
            ArenaEvent::new(
                EventType::SessionStarted,
                Importance::High,
                "The arena opens",
                master_commentary,
                snapshot.last_price,
            )
            .with_metadata(json!({ "session_id": session_id, "theme": theme })),
        );

        self.arm_scheduler();
        info!(session_id = %session_id, price = snapshot.last_price, "session started");
        Ok(())
    }

    pub async fn pause(self: &Arc<Self>) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.pause_locked(false)
    }

    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let _gate = self.gate.lock().await;

        {
            let inner = self.inner.read();
            if inner.status != SessionStatus::Paused {
                bail!("cannot resume while {}", inner.status);
            }
        }

        let session_id = {
            let mut inner = self.inner.write();
            inner.status = SessionStatus::Running;
            inner.session_id.clone().unwrap_or_default()
        };
        *self.last_subscriber_at.lock() = Instant::now();

        if let Err(e) = self.store.update_session_status(&session_id, "running") {
            warn!(error = %e, "failed to persist resume");
        }
        self.emit(ArenaEvent::new(
            EventType::SessionResumed,
            Importance::Medium,
            "The arena resumes",
            "Trading continues where it left off.",
            self.current_price(),
        ));

        self.arm_scheduler();
        info!("session resumed");
        Ok(())
    }

    /// Stop the session: close every position at the current price, flush
    /// buffers, score, persist, and return the summary. Degrades gracefully
    /// when in-memory state was lost (rebuilds agents from the store).
    pub async fn stop(self: &Arc<Self>) -> Result<SessionSummary> {
        let _gate = self.gate.lock().await;
        self.stop_locked(false)
    }

    /// Register a subscriber sink; returns the id used to unsubscribe.
    /// Subscribing to a paused session resumes it.
    pub async fn subscribe(self: &Arc<Self>, sink: EventSink) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().push(Subscriber { id, sink });
        *self.last_subscriber_at.lock() = Instant::now();

        if self.status() == SessionStatus::Paused && self.session_id().is_some() {
            if let Err(e) = self.resume().await {
                warn!(error = %e, "auto-resume on subscribe failed");
            }
        }

        debug!(subscriber_id = id, "subscriber attached");
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.write();
        subs.retain(|s| s.id != id);
        if subs.is_empty() {
            *self.last_subscriber_at.lock() = Instant::now();
        }
        debug!(subscriber_id = id, remaining = subs.len(), "subscriber detached");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // ── Scheduler ────────────────────────────────────────────────────────

    fn arm_scheduler(self: &Arc<Self>) {
        let interval_ms = self
            .config()
            .map(|c| c.decision_interval_ms)
            .unwrap_or(60_000);

        let orchestrator = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(orch) = orchestrator.upgrade() else {
                    break;
                };
                if orch.status() != SessionStatus::Running {
                    break;
                }
                orch.tick().await;
            }
        });

        if let Some(old) = self.scheduler.lock().replace(handle) {
            old.abort();
        }
    }

    // ── Tick ─────────────────────────────────────────────────────────────

    /// One full tick. Serialised by the gate: at most one tick (or external
    /// operation) is in flight at any time.
    pub async fn tick(self: &Arc<Self>) {
        let _gate = self.gate.lock().await;

        // 1. Status and duration bookkeeping.
        let (tick, elapsed_ms, total_ms, price_hint) = {
            let mut inner = self.inner.write();
            if inner.status != SessionStatus::Running {
                return;
            }
            inner.tick += 1;
            let total_ms = inner
                .config
                .as_ref()
                .map(|c| c.max_duration_ms())
                .unwrap_or(u64::MAX);
            (inner.tick, inner.elapsed_ms(), total_ms, inner.last_price)
        };

        if elapsed_ms >= total_ms {
            info!("session duration reached; stopping");
            let _ = self.stop_locked(true);
            return;
        }

        // 2. Countdown and milestone events.
        let countdowns = {
            let mut inner = self.inner.write();
            let remaining = total_ms.saturating_sub(elapsed_ms);
            inner.detector.countdown_events(remaining, total_ms, price_hint)
        };
        for event in countdowns {
            self.emit(event);
        }
        if elapsed_ms >= total_ms / 2 {
            let emit_milestone = {
                let mut inner = self.inner.write();
                !std::mem::replace(&mut inner.milestone_emitted, true)
            };
            if emit_milestone {
                self.emit(ArenaEvent::new(
                    EventType::Milestone,
                    Importance::Medium,
                    "Halfway through the session",
                    "Half the clock is gone. Standings can still flip.",
                    price_hint,
                ));
            }
        }

        // 3. Auto-pause when nobody is watching.
        let idle_for = {
            if self.subscribers.read().is_empty() {
                Some(self.last_subscriber_at.lock().elapsed())
            } else {
                None
            }
        };
        if idle_for.is_some_and(|d| d >= self.subscriber_idle_pause) {
            info!("no subscribers; auto-pausing");
            let _ = self.pause_locked(true);
            return;
        }

        // 4. Market data. A failed refresh skips the tick without mutation.
        let snapshot = match self.market.fetch(false).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, tick, "market fetch failed; skipping tick");
                return;
            }
        };
        let price = snapshot.last_price;

        // Knife tracking on the short timeframes.
        {
            let mut inner = self.inner.write();
            inner.last_price = price;
            for tf in [Timeframe::M5, Timeframe::M15] {
                if let Some(data) = snapshot.timeframe(tf) {
                    inner.knife.update(tf, &data.candles);
                }
            }
        }

        // 5. The arena needs at least two alive competitors.
        let alive = {
            let inner = self.inner.read();
            inner.agents.values().filter(|a| a.is_alive()).count()
        };
        if alive <= 1 {
            info!(alive, "not enough competitors; stopping");
            let _ = self.stop_locked(true);
            return;
        }

        // 6. Per-agent processing in deterministic (BTreeMap key) order.
        let agent_ids: Vec<String> = {
            self.inner.read().agents.keys().cloned().collect()
        };
        for agent_id in agent_ids {
            self.process_agent(&agent_id, &snapshot, tick).await;
        }

        // 7. Detector events and rankings.
        let (detector_events, board, order_changed) = {
            let mut inner = self.inner.write();
            let SessionState {
                ref mut detector,
                ref agents,
                ..
            } = *inner;
            let events = detector.detect(agents, price);
            let board = rank_agents(&mut inner.agents);
            let order: Vec<String> = board.iter().map(|r| r.agent_id.clone()).collect();
            let changed = !inner.prev_rank_order.is_empty() && inner.prev_rank_order != order;
            inner.prev_rank_order = order;
            (events, board, changed)
        };
        for event in detector_events {
            self.emit(event);
        }
        if order_changed {
            self.emit(
                ArenaEvent::new(
                    EventType::LeaderboardUpdate,
                    Importance::Low,
                    "Leaderboard shifts",
                    "The ranking order changed this tick.",
                    price,
                )
                .with_metadata(json!({ "rankings": board })),
            );
        }

        // 8. The composite tick event: the full per-agent view.
        let tick_view = self.build_tick_view(tick, price, &board);
        self.emit(
            ArenaEvent::new(
                EventType::Tick,
                Importance::Low,
                format!("Tick {tick}"),
                String::new(),
                price,
            )
            .with_metadata(tick_view),
        );

        // 9. Persistence cadence: decisions every 10 ticks, snapshots and
        // agent upserts every 5 minutes. Failures are logged, never fatal.
        if tick % DECISION_FLUSH_TICKS == 0 {
            self.flush_decisions();
        }
        let snapshot_due = {
            let inner = self.inner.read();
            inner
                .last_snapshot_at
                .map(|t| t.elapsed() >= SNAPSHOT_INTERVAL)
                .unwrap_or(true)
        };
        if snapshot_due {
            self.write_snapshot(price);
        }
    }

    /// Liquidation check, unrealised update, decision, and execution for one
    /// agent. Works on a clone and applies the result under the lock; the
    /// tick gate guarantees nobody else mutates in between.
    async fn process_agent(self: &Arc<Self>, agent_id: &str, snapshot: &MarketSnapshot, tick: u64) {
        let price = snapshot.last_price;
        let Some(agent) = self.inner.read().agents.get(agent_id).cloned() else {
            return;
        };
        if agent.dead {
            return;
        }

        // Liquidation first; a liquidated agent makes no decision.
        if execution::check_liquidation(&agent, price) {
            let (state, outcome) = execution::liquidate(agent, tick);
            if let ExecOutcome::Liquidated(trade) = &outcome {
                self.handle_death(&state, trade, price);
            }
            self.inner.write().agents.insert(agent_id.to_string(), state);
            return;
        }

        let mut agent = execution::update_unrealized(agent, price);

        // A corrupted agent (non-finite money, non-positive open volume) is
        // removed from play; the session continues without it.
        let corrupted = !agent.balance.is_finite()
            || !agent.equity.is_finite()
            || agent
                .position
                .as_ref()
                .is_some_and(|p| p.is_open && p.volume <= 0.0);
        if corrupted {
            error!(agent = %agent.name, "invariant violation; removing agent from play");
            agent.position = None;
            if !agent.balance.is_finite() {
                agent.balance = 0.0;
            }
            agent.mark_dead(AgentStatus::Bankrupt, tick, "internal invariant violation");
            agent.recompute_derived();
            if let Err(e) = self.store.upsert_agent(&agent) {
                warn!(error = %e, "failed to persist corrupted agent");
            }
            self.emit(
                ArenaEvent::new(
                    EventType::AgentDeath,
                    Importance::Critical,
                    format!("{} is out (bankrupt)", agent.name),
                    "Disqualified on an internal accounting failure.",
                    price,
                )
                .with_agent(&agent.id, &agent.name),
            );
            self.inner.write().agents.insert(agent_id.to_string(), agent);
            return;
        }

        // Decide. The engine is taken out of the map so the model call can
        // await without holding any lock.
        let Some(mut engine) = self.engines.lock().remove(agent_id) else {
            return;
        };

        let knife_gate = {
            let inner = self.inner.read();
            match snapshot.recommendation.map(|r| r.action) {
                Some(RecAction::Long) => inner.knife.gate(Side::Long),
                Some(RecAction::Short) => inner.knife.gate(Side::Short),
                _ => KnifeGate::Clear,
            }
        };

        agent.activity = Activity::Thinking;
        let decision = engine
            .decide(&agent, snapshot, knife_gate, self.llm.as_deref())
            .await;

        // Model usage accounting mirrors the engine's budget deduction.
        if decision.used_model {
            agent.model_calls += 1;
            agent.input_tokens += decision.input_tokens;
            agent.output_tokens += decision.output_tokens;
            if let Some(model_id) = engine.model_id.as_deref() {
                agent.estimated_cost_usd +=
                    estimate_cost_usd(model_id, decision.input_tokens, decision.output_tokens);
            }
            self.emit(
                ArenaEvent::new(
                    EventType::AgentThinking,
                    Importance::Low,
                    format!("{} consults the oracle", agent.name),
                    decision.rationale.clone(),
                    price,
                )
                .with_agent(&agent.id, &agent.name),
            );
        }
        let budget_warning = engine.take_budget_warning();
        let max_dca = engine.strategy.max_dca_count;
        let leverage = engine.strategy.leverage;
        let pair = self.market.pair().to_string();

        agent.last_rationale = Some(decision.rationale.clone());

        // Execute.
        let agent = self.apply_decision(agent, &decision, &pair, price, leverage, max_dca, tick);

        // Buffer the decision record: every actionable decision, and a
        // sampled subset (every 10th tick) of holds and waits.
        if !decision.action.is_passive() || tick % 10 == 0 {
            let record = DecisionRecord {
                session_id: self.session_id().unwrap_or_default(),
                agent_id: agent.id.clone(),
                tick,
                action: decision.action.to_string(),
                reasoning: Some(decision.rationale.clone()),
                confidence: decision.confidence,
                used_model: decision.used_model,
                price_at: price,
                balance_at: agent.balance,
                pnl_at: agent.realized_pnl,
                input_tokens: decision.used_model.then_some(decision.input_tokens),
                output_tokens: decision.used_model.then_some(decision.output_tokens),
            };
            self.inner.write().decision_buffer.push(record);
        }

        if budget_warning {
            self.emit(
                ArenaEvent::new(
                    EventType::BudgetWarning,
                    Importance::Medium,
                    format!("{} is running out of thinking money", agent.name),
                    format!(
                        "Model budget below 20%: {:.4} USD remaining",
                        engine.budget_remaining_usd
                    ),
                    price,
                )
                .with_agent(&agent.id, &agent.name),
            );
        }

        self.engines.lock().insert(agent_id.to_string(), engine);
        self.inner.write().agents.insert(agent_id.to_string(), agent);
    }

    /// Map a decision onto the execution engine and emit the trade events.
    #[allow(clippy::too_many_arguments)]
    fn apply_decision(
        self: &Arc<Self>,
        agent: AgentState,
        decision: &AgentDecision,
        pair: &str,
        price: f64,
        leverage: f64,
        max_dca: u32,
        tick: u64,
    ) -> AgentState {
        match decision.action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => {
                let side = if decision.action == DecisionAction::OpenLong {
                    Side::Long
                } else {
                    Side::Short
                };
                let margin = decision.margin_percent.unwrap_or(5.0);
                let (mut state, outcome) = execution::open_position(
                    agent,
                    pair,
                    side,
                    price,
                    margin,
                    leverage,
                    &decision.rationale,
                );
                match &outcome {
                    ExecOutcome::Opened { volume, margin, .. } => {
                        state.activity = Activity::Trading;
                        if let Some(position) = state.position.as_ref() {
                            let conditions = json!({
                                "price": price,
                                "recommendation": decision.rationale,
                                "confidence": decision.confidence,
                            });
                            if let Err(e) = self.store.insert_open_position(
                                &state.id,
                                position,
                                &conditions.to_string(),
                            ) {
                                warn!(error = %e, "failed to persist opened position");
                            }
                        }
                        let line = self.commentary_line(&state, "on_entry", price, 0.0);
                        self.emit(
                            ArenaEvent::new(
                                EventType::TradeOpen,
                                Importance::Medium,
                                format!("{} goes {side}", state.name),
                                line,
                                price,
                            )
                            .with_agent(&state.id, &state.name)
                            .with_metadata(json!({
                                "side": side,
                                "volume": volume,
                                "margin": margin,
                                "confidence": decision.confidence,
                                "used_model": decision.used_model,
                            })),
                        );
                    }
                    ExecOutcome::Rejected { reason } => {
                        self.emit_rejection(&state, reason, price);
                    }
                    _ => {}
                }
                state
            }

            DecisionAction::Close => {
                let (mut state, outcome) = execution::close_position(agent, price, &decision.rationale);
                match outcome {
                    ExecOutcome::Closed(trade) => {
                        state.activity = Activity::Idle;
                        if let Err(e) = self.store.close_position(&trade, &decision.rationale) {
                            warn!(error = %e, "failed to persist closed position");
                        }
                        self.emit_trade_close(&mut state, &trade, price);
                        if trade.bankrupt {
                            state.mark_dead(
                                AgentStatus::Bankrupt,
                                tick,
                                format!("balance exhausted after closing at {price:.4}"),
                            );
                            state.recompute_derived();
                            self.handle_death(&state, &trade, price);
                        }
                    }
                    ExecOutcome::Rejected { ref reason } => {
                        self.emit_rejection(&state, reason, price);
                    }
                    _ => {}
                }
                state
            }

            DecisionAction::Dca => {
                let margin = decision.margin_percent.unwrap_or(3.0);
                let (mut state, outcome) =
                    execution::dca(agent, price, margin, max_dca, &decision.rationale);
                match &outcome {
                    ExecOutcome::DcaApplied {
                        dca_count,
                        new_avg_entry,
                        added_margin,
                        ..
                    } => {
                        state.activity = Activity::Trading;
                        if let Some(position) = state.position.as_ref() {
                            if let Err(e) = self.store.update_position_after_dca(position) {
                                warn!(error = %e, "failed to persist dca");
                            }
                        }
                        self.emit(
                            ArenaEvent::new(
                                EventType::TradeDca,
                                Importance::Medium,
                                format!("{} doubles down", state.name),
                                format!(
                                    "DCA #{dca_count}: average entry now {new_avg_entry:.4}"
                                ),
                                price,
                            )
                            .with_agent(&state.id, &state.name)
                            .with_metadata(json!({
                                "dca_count": dca_count,
                                "added_margin": added_margin,
                            })),
                        );
                    }
                    ExecOutcome::Rejected { reason } => {
                        self.emit_rejection(&state, reason, price);
                    }
                    _ => {}
                }
                state
            }

            DecisionAction::Hold => {
                let mut state = agent;
                state.activity = Activity::Holding;
                self.emit(
                    ArenaEvent::new(
                        EventType::AgentHold,
                        Importance::Low,
                        format!("{} holds", state.name),
                        decision.rationale.clone(),
                        price,
                    )
                    .with_agent(&state.id, &state.name),
                );
                state
            }

            DecisionAction::Wait => {
                let mut state = agent;
                state.activity = Activity::Waiting;
                self.emit(
                    ArenaEvent::new(
                        EventType::AgentWait,
                        Importance::Low,
                        format!("{} waits", state.name),
                        decision.rationale.clone(),
                        price,
                    )
                    .with_agent(&state.id, &state.name),
                );
                state
            }
        }
    }

    /// Trade-close event plus streaks and badges.
    fn emit_trade_close(self: &Arc<Self>, state: &mut AgentState, trade: &ClosedTrade, price: f64) {
        let trigger = if trade.win { "on_exit_profit" } else { "on_exit_loss" };
        let line = self.commentary_line(state, trigger, price, trade.realized_pnl);
        let importance = if trade.realized_pnl.abs() > state.starting_capital * 0.05 {
            Importance::High
        } else {
            Importance::Medium
        };
        self.emit(
            ArenaEvent::new(
                EventType::TradeClose,
                importance,
                format!(
                    "{} closes {} at {:+.2}",
                    state.name, trade.side, trade.realized_pnl
                ),
                line,
                price,
            )
            .with_agent(&state.id, &state.name)
            .with_metadata(json!({
                "realized_pnl": trade.realized_pnl,
                "win": trade.win,
                "hold_duration_ms": trade.hold_duration_ms,
                "dca_count": trade.dca_count,
            })),
        );

        // Streaks come from the detector's trade-close path.
        let streak_event = {
            let mut inner = self.inner.write();
            inner.detector.record_trade_close(state, trade.win, price)
        };
        if let Some(event) = streak_event {
            let five_plus = event.importance >= Importance::High;
            self.emit(event);
            if five_plus {
                self.award_badge(state, "on_fire", price);
            }
        }

        // First winning close of the whole session.
        if trade.win {
            let claimed = {
                let mut inner = self.inner.write();
                !std::mem::replace(&mut inner.first_blood_claimed, true)
            };
            if claimed {
                self.award_badge(state, "first_blood", price);
            }
        }
    }

    /// Death event with commentary, persistence, and a single rival remark.
    fn handle_death(self: &Arc<Self>, state: &AgentState, trade: &ClosedTrade, price: f64) {
        if let Err(e) = self.store.close_position(trade, state.death_reason.as_deref().unwrap_or("dead")) {
            warn!(error = %e, "failed to persist terminal position");
        }
        if let Err(e) = self.store.upsert_agent(state) {
            warn!(error = %e, "failed to persist dead agent");
        }

        let line = self.commentary_line(state, "on_death", price, trade.realized_pnl);
        self.emit(
            ArenaEvent::new(
                EventType::AgentDeath,
                Importance::Critical,
                format!("{} is out ({})", state.name, state.status),
                line,
                price,
            )
            .with_agent(&state.id, &state.name)
            .with_metadata(json!({
                "status": state.status,
                "death_tick": state.death_tick,
                "death_reason": state.death_reason,
            })),
        );

        // One rival gets the last word: the current leader among the others.
        let rival = {
            let inner = self.inner.read();
            inner
                .agents
                .values()
                .filter(|a| a.is_alive() && a.id != state.id)
                .max_by(|a, b| a.equity.total_cmp(&b.equity))
                .cloned()
        };
        if let Some(rival) = rival {
            let line = self.commentary_line(&rival, "on_rival_death", price, 0.0);
            self.emit(
                ArenaEvent::new(
                    EventType::AgentAction,
                    Importance::Low,
                    format!("{} reacts", rival.name),
                    line,
                    price,
                )
                .with_agent(&rival.id, &rival.name),
            );
        }
    }

    fn emit_rejection(self: &Arc<Self>, state: &AgentState, reason: &str, price: f64) {
        self.emit(
            ArenaEvent::new(
                EventType::AgentAction,
                Importance::Low,
                format!("{} hesitates", state.name),
                format!("Order rejected: {reason}"),
                price,
            )
            .with_agent(&state.id, &state.name),
        );
    }

    fn award_badge(self: &Arc<Self>, state: &mut AgentState, badge: &str, price: f64) {
        if !state.badges.insert(badge.to_string()) {
            return;
        }
        self.emit(
            ArenaEvent::new(
                EventType::BadgeEarned,
                Importance::Medium,
                format!("{} earns \"{badge}\"", state.name),
                String::new(),
                price,
            )
            .with_agent(&state.id, &state.name)
            .with_metadata(json!({ "badge": badge })),
        );
    }

    /// Format a commentary line for an agent and trigger, substituting the
    /// `{name}`, `{price}` and `{pnl}` placeholders; falls back to the
    /// built-in generic template when the agent has none.
    fn commentary_line(&self, state: &AgentState, trigger: &str, price: f64, pnl: f64) -> String {
        let template = {
            let inner = self.inner.read();
            inner
                .commentary
                .get(&state.id)
                .and_then(|map| map.get(trigger))
                .filter(|t| !t.trim().is_empty())
                .cloned()
        };
        let template = template.unwrap_or_else(|| generic_commentary(trigger).to_string());
        template
            .replace("{name}", &state.name)
            .replace("{price}", &format!("{price:.4}"))
            .replace("{pnl}", &format!("{pnl:+.2}"))
    }

    // ── Persistence helpers ──────────────────────────────────────────────

    /// Flush the decision buffer; on failure the records are retried on the
    /// next cadence.
    fn flush_decisions(&self) {
        let records: Vec<DecisionRecord> = {
            let mut inner = self.inner.write();
            std::mem::take(&mut inner.decision_buffer)
        };
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.store.append_decisions(&records) {
            error!(error = %e, count = records.len(), "decision flush failed; retrying later");
            let mut inner = self.inner.write();
            let mut restored = records;
            restored.extend(inner.decision_buffer.drain(..));
            inner.decision_buffer = restored;
        }
    }

    fn write_snapshot(&self, price: f64) {
        let (session_id, agents) = {
            let mut inner = self.inner.write();
            inner.last_snapshot_at = Some(Instant::now());
            (
                inner.session_id.clone().unwrap_or_default(),
                inner.agents.values().cloned().collect::<Vec<_>>(),
            )
        };
        let data = serde_json::to_string(&json!({ "agents": agents })).unwrap_or_default();
        if let Err(e) = self.store.insert_snapshot(&session_id, price, &data) {
            warn!(error = %e, "snapshot write failed");
        }
        for agent in &agents {
            if let Err(e) = self.store.upsert_agent(agent) {
                warn!(error = %e, agent = %agent.name, "agent upsert failed");
            }
        }
    }

    fn build_tick_view(&self, tick: u64, price: f64, board: &[RankedAgent]) -> serde_json::Value {
        let inner = self.inner.read();
        let agents: Vec<serde_json::Value> = inner
            .agents
            .values()
            .map(|a| {
                json!({
                    "id": a.id,
                    "name": a.name,
                    "balance": a.balance,
                    "equity": a.equity,
                    "health": a.health,
                    "health_zone": a.health_zone,
                    "rank": a.rank,
                    "status": a.status,
                    "activity": a.activity,
                    "trade_count": a.trade_count,
                    "realized_pnl": a.realized_pnl,
                    "total_fees": a.total_fees,
                    "model_cost_usd": a.estimated_cost_usd,
                    "badges": a.badges,
                    "last_rationale": a.last_rationale,
                    "position": a.position.as_ref().filter(|p| p.is_open).map(|p| json!({
                        "side": p.side,
                        "volume": p.volume,
                        "avg_entry_price": p.avg_entry_price,
                        "unrealized_pnl": p.unrealized_pnl,
                        "unrealized_pnl_pct": p.unrealized_pnl_pct,
                        "liquidation_price": p.liquidation_price,
                        "dca_count": p.dca_count,
                    })),
                })
            })
            .collect();

        json!({
            "tick": tick,
            "price": price,
            "elapsed_ms": inner.elapsed_ms(),
            "agents": agents,
            "rankings": board,
        })
    }

    // ── Internal stop / pause (gate already held) ────────────────────────

    fn pause_locked(&self, from_tick: bool) -> Result<()> {
        {
            let inner = self.inner.read();
            if inner.status != SessionStatus::Running {
                bail!("cannot pause while {}", inner.status);
            }
        }

        let session_id = {
            let mut inner = self.inner.write();
            inner.status = SessionStatus::Paused;
            inner.session_id.clone().unwrap_or_default()
        };

        // The scheduler loop exits on its own after a tick-path pause; an
        // external pause cancels it outright.
        if let Some(handle) = self.scheduler.lock().take() {
            if !from_tick {
                handle.abort();
            }
        }

        if let Err(e) = self.store.update_session_status(&session_id, "paused") {
            warn!(error = %e, "failed to persist pause");
        }
        self.emit(ArenaEvent::new(
            EventType::SessionPaused,
            Importance::Medium,
            "The arena pauses",
            "Positions are frozen in place.",
            self.current_price(),
        ));
        info!("session paused");
        Ok(())
    }

    fn stop_locked(&self, from_tick: bool) -> Result<SessionSummary> {
        let session_id = {
            let inner = self.inner.read();
            match &inner.session_id {
                Some(id) => id.clone(),
                None => bail!("no session to stop"),
            }
        };

        self.inner.write().status = SessionStatus::Stopping;
        if let Some(handle) = self.scheduler.lock().take() {
            if !from_tick {
                handle.abort();
            }
        }

        // Single price read for every forced close: live cache if possible,
        // else the last tick's price.
        let price = self
            .market
            .peek()
            .map(|s| s.last_price)
            .unwrap_or_else(|| self.current_price());

        // Degraded mode: in-memory state lost, rebuild what the store knows.
        {
            let mut inner = self.inner.write();
            if inner.agents.is_empty() {
                warn!("stopping with empty in-memory state; rebuilding from store");
                match self.store.load_agents(&session_id) {
                    Ok(loaded) => {
                        inner.agents = loaded.into_iter().map(|a| (a.id.clone(), a)).collect();
                    }
                    Err(e) => warn!(error = %e, "agent rebuild failed; summary will be empty"),
                }
            }
        }

        // Force-close every open position at the single stop price.
        let open_ids: Vec<String> = {
            let inner = self.inner.read();
            inner
                .agents
                .values()
                .filter(|a| a.position.as_ref().is_some_and(|p| p.is_open))
                .map(|a| a.id.clone())
                .collect()
        };
        for id in open_ids {
            let Some(agent) = self.inner.read().agents.get(&id).cloned() else {
                continue;
            };
            let (mut state, outcome) = execution::close_position(agent, price, "session ended");
            if let ExecOutcome::Closed(trade) = outcome {
                if let Err(e) = self.store.close_position(&trade, "session ended") {
                    warn!(error = %e, "failed to persist forced close");
                }
                let trigger = if trade.win { "on_exit_profit" } else { "on_exit_loss" };
                let line = self.commentary_line(&state, trigger, price, trade.realized_pnl);
                self.emit(
                    ArenaEvent::new(
                        EventType::TradeClose,
                        Importance::Medium,
                        format!("{} closed at the bell ({:+.2})", state.name, trade.realized_pnl),
                        line,
                        price,
                    )
                    .with_agent(&state.id, &state.name),
                );
            }
            state.activity = Activity::Idle;
            self.inner.write().agents.insert(id, state);
        }

        self.flush_decisions();

        // Score, summarise, persist.
        let summary = {
            let mut inner = self.inner.write();
            let rankings = rank_agents(&mut inner.agents);
            let titles = award_titles(&inner.agents);
            let agents: Vec<AgentSummary> = inner
                .agents
                .values()
                .map(|a| AgentSummary {
                    agent_id: a.id.clone(),
                    name: a.name.clone(),
                    status: a.status,
                    equity: a.equity,
                    realized_pnl: a.realized_pnl,
                    total_fees: a.total_fees,
                    trade_count: a.trade_count,
                    win_count: a.win_count,
                    loss_count: a.loss_count,
                    model_cost_usd: a.estimated_cost_usd,
                    badges: a.badges.iter().cloned().collect(),
                })
                .collect();

            SessionSummary {
                session_id: session_id.clone(),
                duration_ms: inner.elapsed_ms(),
                ticks: inner.tick,
                start_price: inner.start_price,
                end_price: price,
                rankings,
                titles,
                agents,
            }
        };

        for agent in self.inner.read().agents.values() {
            if let Err(e) = self.store.upsert_agent(agent) {
                warn!(error = %e, agent = %agent.name, "final agent upsert failed");
            }
        }
        let summary_json = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".into());
        if let Err(e) =
            self.store
                .mark_session_ended(&session_id, price, summary.duration_ms, &summary_json)
        {
            // The summary is still returned from memory.
            error!(error = %e, "failed to persist session summary");
        }

        self.emit(
            ArenaEvent::new(
                EventType::SessionEnded,
                Importance::Critical,
                "The arena closes",
                summary
                    .rankings
                    .first()
                    .map(|r| format!("{} takes the crown", r.name))
                    .unwrap_or_else(|| "No one survived to claim the crown.".to_string()),
                price,
            )
            .with_metadata(json!({ "summary": summary })),
        );

        // Clear in-memory maps; the event ring stays for late subscribers.
        {
            let mut inner = self.inner.write();
            *inner = SessionState::new();
        }
        self.engines.lock().clear();

        info!(session_id = %session_id, "session stopped");
        Ok(summary)
    }

    // ── Event fan-out ────────────────────────────────────────────────────

    /// Append non-tick events to the bounded replay ring, then deliver to
    /// every subscriber synchronously. A panicking sink is isolated.
    pub fn emit(&self, event: ArenaEvent) {
        if event.event_type != EventType::Tick {
            let mut ring = self.event_ring.write();
            ring.push_back(event.clone());
            while ring.len() > EVENT_RING_CAPACITY {
                ring.pop_front();
            }
        }

        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| (subscriber.sink)(&event)));
            if result.is_err() {
                warn!(subscriber_id = subscriber.id, "subscriber sink panicked; isolated");
            }
        }
    }
}

// =============================================================================
// Named registry — hot-reload-safe process-wide instances
// =============================================================================

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Orchestrator>>>> = OnceLock::new();

/// Return the orchestrator registered under `name`, constructing and
/// registering it on first use. Re-entrant construction (hot reload) gets
/// the existing instance. Tests construct isolated instances directly.
pub fn named(name: &str, build: impl FnOnce() -> Arc<Orchestrator>) -> Arc<Orchestrator> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock();
    map.entry(name.to_string()).or_insert_with(build).clone()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{Candle, MarketSource, Ticker};
    use crate::roster::archetype_roster;
    use anyhow::bail as abail;
    use async_trait::async_trait;

    struct MockSource {
        price: RwLock<f64>,
        fail: RwLock<bool>,
    }

    impl MockSource {
        fn new(price: f64) -> Self {
            Self {
                price: RwLock::new(price),
                fail: RwLock::new(false),
            }
        }
    }

    #[async_trait]
    impl MarketSource for MockSource {
        async fn fetch_candles(&self, _pair: &str, _interval: u32) -> Result<Vec<Candle>> {
            if *self.fail.read() {
                abail!("feed down");
            }
            let price = *self.price.read();
            Ok((0..60)
                .map(|i| Candle {
                    time_sec: i * 60,
                    open: price,
                    high: price * 1.002,
                    low: price * 0.998,
                    close: price,
                    vwap: price,
                    volume: 10.0,
                    count: 1,
                })
                .collect())
        }

        async fn fetch_ticker(&self, _pair: &str) -> Result<Ticker> {
            if *self.fail.read() {
                abail!("feed down");
            }
            let price = *self.price.read();
            Ok(Ticker {
                bid: price * 0.999,
                ask: price * 1.001,
                last: price,
                open_24h: price,
                high_24h: price * 1.01,
                low_24h: price * 0.99,
                volume_24h: 1000.0,
            })
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            agent_count: 3,
            decision_interval_ms: 1000,
            max_duration_hours: 1.0,
            ..SessionConfig::default()
        }
    }

    fn build(source: Arc<MockSource>) -> Arc<Orchestrator> {
        let store = Arc::new(ArenaStore::open_in_memory().unwrap());
        let cache = Arc::new(MarketDataCache::with_min_refresh(
            source,
            "XRP/EUR",
            Duration::ZERO,
        ));
        Arc::new(Orchestrator::with_idle_pause(
            store,
            cache,
            None,
            Duration::from_millis(50),
        ))
    }

    async fn created(orch: &Arc<Orchestrator>) -> String {
        let roster = archetype_roster(&test_config());
        let (id, agents) = orch.create_session(test_config(), roster).await.unwrap();
        assert_eq!(agents.len(), 3);
        id
    }

    #[tokio::test]
    async fn create_requires_idle() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();

        let roster = archetype_roster(&test_config());
        assert!(orch.create_session(test_config(), roster).await.is_err());
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_failure_resets_to_idle_and_is_retryable() {
        let source = Arc::new(MockSource::new(0.6));
        let orch = build(source.clone());
        created(&orch).await;

        *source.fail.write() = true;
        assert!(orch.start().await.is_err());
        assert_eq!(orch.status(), SessionStatus::Idle);

        *source.fail.write() = false;
        orch.start().await.unwrap();
        assert_eq!(orch.status(), SessionStatus::Running);
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tick_emits_composite_tick_event() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();

        let events: Arc<Mutex<Vec<ArenaEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        orch.subscribe(Box::new(move |e| sink_events.lock().push(e.clone())))
            .await;

        orch.tick().await;

        let collected = events.lock();
        let tick_events: Vec<&ArenaEvent> = collected
            .iter()
            .filter(|e| e.event_type == EventType::Tick)
            .collect();
        assert_eq!(tick_events.len(), 1);
        let meta = tick_events[0].metadata.as_ref().unwrap();
        assert_eq!(meta["agents"].as_array().unwrap().len(), 3);
        assert_eq!(meta["tick"], 1);
        // Ordering: every per-agent event precedes the tick event.
        let tick_pos = collected
            .iter()
            .position(|e| e.event_type == EventType::Tick)
            .unwrap();
        assert!(collected
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(
                e.event_type,
                EventType::AgentHold | EventType::AgentWait | EventType::TradeOpen
            ))
            .all(|(i, _)| i < tick_pos));
        drop(collected);
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn feed_failure_skips_tick_without_mutation() {
        let source = Arc::new(MockSource::new(0.6));
        let orch = build(source.clone());
        created(&orch).await;
        orch.start().await.unwrap();
        // Keep a subscriber attached so auto-pause stays away.
        orch.subscribe(Box::new(|_| {})).await;

        orch.tick().await;
        let balances_before: Vec<f64> =
            orch.agent_states().iter().map(|a| a.balance).collect();

        *source.fail.write() = true;
        orch.tick().await;
        assert_eq!(orch.status(), SessionStatus::Running);
        let balances_after: Vec<f64> =
            orch.agent_states().iter().map(|a| a.balance).collect();
        assert_eq!(balances_before, balances_after);

        *source.fail.write() = false;
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn auto_pause_after_subscriber_idle() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();

        let id = orch.subscribe(Box::new(|_| {})).await;
        orch.tick().await;
        assert_eq!(orch.status(), SessionStatus::Running);

        orch.unsubscribe(id);
        tokio::time::sleep(Duration::from_millis(80)).await;
        orch.tick().await;
        assert_eq!(orch.status(), SessionStatus::Paused);

        // S5: re-subscribing resumes, ticks continue counting.
        let tick_at_pause = orch.current_tick();
        orch.subscribe(Box::new(|_| {})).await;
        assert_eq!(orch.status(), SessionStatus::Running);
        orch.tick().await;
        assert_eq!(orch.current_tick(), tick_at_pause + 1);
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_returns_summary_and_clears_state() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        let session_id = created(&orch).await;
        orch.start().await.unwrap();
        orch.subscribe(Box::new(|_| {})).await;
        orch.tick().await;

        let summary = orch.stop().await.unwrap();
        assert_eq!(summary.session_id, session_id);
        assert_eq!(summary.rankings.len(), 3);
        assert!((summary.start_price - 0.6).abs() < 1e-9);
        assert_eq!(orch.status(), SessionStatus::Idle);
        assert!(orch.session_id().is_none());
        assert!(orch.agent_states().is_empty());

        // Stop is not re-runnable without a session.
        assert!(orch.stop().await.is_err());
    }

    #[tokio::test]
    async fn stop_rebuilds_from_store_when_memory_lost() {
        let store = Arc::new(ArenaStore::open_in_memory().unwrap());
        let cache = Arc::new(MarketDataCache::with_min_refresh(
            Arc::new(MockSource::new(0.6)),
            "XRP/EUR",
            Duration::ZERO,
        ));
        let orch = Arc::new(Orchestrator::new(store.clone(), cache, None));

        let session_id = created(&orch).await;

        // Simulate a crash-like reset that kept only the session id.
        {
            let mut inner = orch.inner.write();
            inner.agents.clear();
            inner.started_at = None;
        }

        let summary = orch.stop().await.unwrap();
        assert_eq!(summary.session_id, session_id);
        assert_eq!(summary.rankings.len(), 3, "agents rebuilt from the store");
        assert_eq!(summary.duration_ms, 0, "unknown start time degrades to 0");
    }

    #[tokio::test]
    async fn subscriber_panic_is_isolated() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();

        let received: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));
        let counter = received.clone();
        orch.subscribe(Box::new(|_| panic!("bad sink"))).await;
        orch.subscribe(Box::new(move |_| *counter.lock() += 1)).await;

        orch.tick().await;
        assert!(*received.lock() > 0, "healthy sink still receives events");
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn event_ring_replays_without_tick_events() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();
        orch.subscribe(Box::new(|_| {})).await;
        orch.tick().await;

        let ring = orch.event_buffer();
        assert!(!ring.is_empty());
        assert!(ring.iter().all(|e| e.event_type != EventType::Tick));
        assert!(ring.iter().any(|e| e.event_type == EventType::SessionStarted));
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn session_stops_when_one_alive_remains() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();
        orch.subscribe(Box::new(|_| {})).await;

        // Kill all but one agent directly.
        {
            let mut inner = orch.inner.write();
            let ids: Vec<String> = inner.agents.keys().cloned().collect();
            for id in ids.iter().skip(1) {
                inner
                    .agents
                    .get_mut(id)
                    .unwrap()
                    .mark_dead(AgentStatus::Liquidated, 1, "test kill");
            }
        }

        orch.tick().await;
        assert_eq!(orch.status(), SessionStatus::Idle, "session auto-stopped");
    }

    #[tokio::test]
    async fn decisions_flush_on_cadence_and_stop() {
        let store = Arc::new(ArenaStore::open_in_memory().unwrap());
        let cache = Arc::new(MarketDataCache::with_min_refresh(
            Arc::new(MockSource::new(0.6)),
            "XRP/EUR",
            Duration::ZERO,
        ));
        let orch = Arc::new(Orchestrator::new(store.clone(), cache, None));
        let session_id = created(&orch).await;
        orch.start().await.unwrap();
        orch.subscribe(Box::new(|_| {})).await;

        orch.tick().await;
        orch.stop().await.unwrap();

        // Tick 1 is not a sampling tick, but any actionable decisions plus
        // the stop-path flush must land in the store.
        let count = store.decision_count(&session_id).unwrap();
        let buffered = orch.inner.read().decision_buffer.len();
        assert_eq!(buffered, 0, "stop flushed the buffer");
        let _ = count; // content depends on market read; flush behaviour is the contract
    }

    #[tokio::test]
    async fn registry_returns_same_instance() {
        let source = Arc::new(MockSource::new(0.6));
        let a = named("registry-test", || build(source.clone()));
        let b = named("registry-test", || panic!("must not rebuild"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn pause_and_resume_roundtrip() {
        let orch = build(Arc::new(MockSource::new(0.6)));
        created(&orch).await;
        orch.start().await.unwrap();

        orch.pause().await.unwrap();
        assert_eq!(orch.status(), SessionStatus::Paused);
        // Ticks are no-ops while paused.
        let t = orch.current_tick();
        orch.tick().await;
        assert_eq!(orch.current_tick(), t);

        orch.resume().await.unwrap();
        assert_eq!(orch.status(), SessionStatus::Running);
        orch.stop().await.unwrap();
    }
}
