// =============================================================================
// Arena Store — SQLite persistence for sessions, agents, positions,
// decisions, and snapshots
// =============================================================================
//
// The core writes, anyone may read. All writes go through one connection
// behind a Mutex; decision records are appended in batches inside a
// transaction. A persistence failure is the caller's to log — it must never
// abort a tick, so every method returns Result and nothing panics.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::agent::{AgentState, Position};
use crate::execution::ClosedTrade;
use crate::types::{AgentStatus, HealthZone};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS arena_sessions (
    id               TEXT PRIMARY KEY,
    status           TEXT NOT NULL,
    config           TEXT NOT NULL,
    started_at       TEXT,
    ended_at         TEXT,
    start_price      REAL,
    end_price        REAL,
    total_runtime_ms INTEGER,
    summary          TEXT,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS arena_agents (
    id                 TEXT PRIMARY KEY,
    session_id         TEXT NOT NULL,
    name               TEXT NOT NULL,
    personality        TEXT NOT NULL,
    avatar_shape       TEXT NOT NULL,
    color_index        INTEGER NOT NULL,
    strategy_config    TEXT NOT NULL,
    starting_capital   REAL NOT NULL,
    current_capital    REAL NOT NULL,
    peak_equity        REAL NOT NULL,
    total_pnl          REAL NOT NULL,
    total_fees         REAL NOT NULL,
    win_count          INTEGER NOT NULL,
    loss_count         INTEGER NOT NULL,
    max_drawdown       REAL NOT NULL,
    health             REAL NOT NULL,
    rank               INTEGER NOT NULL,
    status             TEXT NOT NULL,
    death_tick         INTEGER,
    death_reason       TEXT,
    model_calls        INTEGER NOT NULL DEFAULT 0,
    input_tokens       INTEGER NOT NULL DEFAULT 0,
    output_tokens      INTEGER NOT NULL DEFAULT 0,
    estimated_cost_usd REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_agents_session ON arena_agents(session_id);

CREATE TABLE IF NOT EXISTS arena_positions (
    id               TEXT PRIMARY KEY,
    agent_id         TEXT NOT NULL,
    pair             TEXT NOT NULL,
    side             TEXT NOT NULL,
    volume           REAL NOT NULL,
    avg_entry_price  REAL NOT NULL,
    leverage         REAL NOT NULL,
    margin_used      REAL NOT NULL,
    total_fees       REAL NOT NULL,
    dca_count        INTEGER NOT NULL,
    dca_history      TEXT NOT NULL,
    is_open          INTEGER NOT NULL,
    entry_conditions TEXT,
    entry_reasoning  TEXT,
    exit_price       REAL,
    realized_pnl     REAL,
    hold_duration_ms INTEGER,
    exit_reasoning   TEXT,
    opened_at        TEXT NOT NULL,
    closed_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_positions_agent ON arena_positions(agent_id);

CREATE TABLE IF NOT EXISTS arena_decisions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT NOT NULL,
    agent_id      TEXT NOT NULL,
    tick          INTEGER NOT NULL,
    action        TEXT NOT NULL,
    reasoning     TEXT,
    confidence    REAL NOT NULL,
    used_model    INTEGER NOT NULL,
    price_at      REAL NOT NULL,
    balance_at    REAL NOT NULL,
    pnl_at        REAL NOT NULL,
    input_tokens  INTEGER,
    output_tokens INTEGER,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_session_tick
    ON arena_decisions(session_id, tick);

CREATE TABLE IF NOT EXISTS arena_snapshots (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id   TEXT NOT NULL,
    market_price REAL NOT NULL,
    data         TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_session ON arena_snapshots(session_id);
"#;

/// One buffered decision row, flushed in batches.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub session_id: String,
    pub agent_id: String,
    pub tick: u64,
    pub action: String,
    pub reasoning: Option<String>,
    pub confidence: f64,
    pub used_model: bool,
    pub price_at: f64,
    pub balance_at: f64,
    pub pnl_at: f64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// SQLite-backed persistence store.
pub struct ArenaStore {
    conn: Mutex<Connection>,
}

impl ArenaStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("failed to open {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Isolated in-memory store (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory db")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn insert_session(&self, id: &str, config_json: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO arena_sessions (id, status, config, created_at)
                 VALUES (?1, 'pending', ?2, ?3)",
                params![id, config_json, Utc::now().to_rfc3339()],
            )
            .context("insert session")?;
        Ok(())
    }

    pub fn mark_session_started(&self, id: &str, start_price: f64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE arena_sessions
                 SET status = 'running', started_at = ?2, start_price = ?3
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339(), start_price],
            )
            .context("mark session started")?;
        Ok(())
    }

    pub fn update_session_status(&self, id: &str, status: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE arena_sessions SET status = ?2 WHERE id = ?1",
                params![id, status],
            )
            .context("update session status")?;
        Ok(())
    }

    pub fn mark_session_ended(
        &self,
        id: &str,
        end_price: f64,
        total_runtime_ms: u64,
        summary_json: &str,
    ) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE arena_sessions
                 SET status = 'completed', ended_at = ?2, end_price = ?3,
                     total_runtime_ms = ?4, summary = ?5
                 WHERE id = ?1",
                params![
                    id,
                    Utc::now().to_rfc3339(),
                    end_price,
                    total_runtime_ms as i64,
                    summary_json
                ],
            )
            .context("mark session ended")?;
        Ok(())
    }

    pub fn session_started_at(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT started_at FROM arena_sessions WHERE id = ?1")?;
        let started: Option<Option<String>> = stmt
            .query_row(params![id], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(started.flatten())
    }

    // ── Agents ───────────────────────────────────────────────────────────

    pub fn insert_agent(
        &self,
        session_id: &str,
        agent: &AgentState,
        personality: &str,
        strategy_json: &str,
    ) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO arena_agents (
                     id, session_id, name, personality, avatar_shape, color_index,
                     strategy_config, starting_capital, current_capital, peak_equity,
                     total_pnl, total_fees, win_count, loss_count, max_drawdown,
                     health, rank, status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    agent.id,
                    session_id,
                    agent.name,
                    personality,
                    agent.avatar_shape,
                    agent.color_index,
                    strategy_json,
                    agent.starting_capital,
                    agent.balance,
                    agent.peak_equity,
                    agent.realized_pnl,
                    agent.total_fees,
                    agent.win_count,
                    agent.loss_count,
                    agent.max_drawdown_pct,
                    agent.health,
                    agent.rank,
                    agent.status.to_string(),
                ],
            )
            .context("insert agent")?;
        Ok(())
    }

    /// Push every mutable field of an agent to its row.
    pub fn upsert_agent(&self, agent: &AgentState) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE arena_agents SET
                     current_capital = ?2, peak_equity = ?3, total_pnl = ?4,
                     total_fees = ?5, win_count = ?6, loss_count = ?7,
                     max_drawdown = ?8, health = ?9, rank = ?10, status = ?11,
                     death_tick = ?12, death_reason = ?13, model_calls = ?14,
                     input_tokens = ?15, output_tokens = ?16, estimated_cost_usd = ?17
                 WHERE id = ?1",
                params![
                    agent.id,
                    agent.balance,
                    agent.peak_equity,
                    agent.realized_pnl,
                    agent.total_fees,
                    agent.win_count,
                    agent.loss_count,
                    agent.max_drawdown_pct,
                    agent.health,
                    agent.rank,
                    agent.status.to_string(),
                    agent.death_tick.map(|t| t as i64),
                    agent.death_reason,
                    agent.model_calls as i64,
                    agent.input_tokens as i64,
                    agent.output_tokens as i64,
                    agent.estimated_cost_usd,
                ],
            )
            .context("upsert agent")?;
        Ok(())
    }

    /// Best-effort reconstruction for `stop` against lost in-memory state.
    /// Positions are not rebuilt; equity falls back to last-known capital.
    pub fn load_agents(&self, session_id: &str) -> Result<Vec<AgentState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, avatar_shape, color_index, starting_capital,
                        current_capital, peak_equity, total_pnl, total_fees,
                        win_count, loss_count, max_drawdown, health, rank, status,
                        death_tick, death_reason, model_calls, input_tokens,
                        output_tokens, estimated_cost_usd
                 FROM arena_agents WHERE session_id = ?1",
            )
            .context("prepare load_agents")?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                let status_text: String = row.get(14)?;
                let status = match status_text.as_str() {
                    "liquidated" => AgentStatus::Liquidated,
                    "bankrupt" => AgentStatus::Bankrupt,
                    _ => AgentStatus::Alive,
                };
                let health: f64 = row.get(12)?;
                let mut agent = AgentState::new(
                    row.get::<_, String>(1)?,
                    "unknown",
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, f64>(4)?,
                );
                agent.id = row.get(0)?;
                agent.balance = row.get(5)?;
                agent.equity = agent.balance;
                agent.peak_equity = row.get(6)?;
                agent.realized_pnl = row.get(7)?;
                agent.total_fees = row.get(8)?;
                agent.win_count = row.get(9)?;
                agent.loss_count = row.get(10)?;
                agent.max_drawdown_pct = row.get(11)?;
                agent.health = health;
                agent.health_zone = HealthZone::from_health(health);
                agent.rank = row.get(13)?;
                agent.status = status;
                agent.dead = !matches!(status, AgentStatus::Alive);
                agent.death_tick = row.get::<_, Option<i64>>(15)?.map(|t| t as u64);
                agent.death_reason = row.get(16)?;
                agent.model_calls = row.get::<_, i64>(17)? as u64;
                agent.input_tokens = row.get::<_, i64>(18)? as u64;
                agent.output_tokens = row.get::<_, i64>(19)? as u64;
                agent.estimated_cost_usd = row.get(20)?;
                agent.trade_count = (agent.win_count + agent.loss_count) as u64;
                Ok(agent)
            })
            .context("query load_agents")?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("read agent row")?);
        }
        Ok(agents)
    }

    // ── Positions ────────────────────────────────────────────────────────

    pub fn insert_open_position(
        &self,
        agent_id: &str,
        position: &Position,
        entry_conditions_json: &str,
    ) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO arena_positions (
                     id, agent_id, pair, side, volume, avg_entry_price, leverage,
                     margin_used, total_fees, dca_count, dca_history, is_open,
                     entry_conditions, entry_reasoning, opened_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?13, ?14)",
                params![
                    position.id,
                    agent_id,
                    position.pair,
                    position.side.to_string(),
                    position.volume,
                    position.avg_entry_price,
                    position.leverage,
                    position.margin_used,
                    position.total_fees,
                    position.dca_count,
                    serde_json::to_string(&position.dca_history).unwrap_or_else(|_| "[]".into()),
                    entry_conditions_json,
                    position.entry_reasoning,
                    position.opened_at.to_rfc3339(),
                ],
            )
            .context("insert open position")?;
        Ok(())
    }

    /// Update a position row after a DCA changed its shape.
    pub fn update_position_after_dca(&self, position: &Position) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE arena_positions SET
                     volume = ?2, avg_entry_price = ?3, margin_used = ?4,
                     total_fees = ?5, dca_count = ?6, dca_history = ?7
                 WHERE id = ?1",
                params![
                    position.id,
                    position.volume,
                    position.avg_entry_price,
                    position.margin_used,
                    position.total_fees,
                    position.dca_count,
                    serde_json::to_string(&position.dca_history).unwrap_or_else(|_| "[]".into()),
                ],
            )
            .context("update position after dca")?;
        Ok(())
    }

    pub fn close_position(&self, trade: &ClosedTrade, exit_reasoning: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE arena_positions SET
                     is_open = 0, volume = ?2, avg_entry_price = ?3, total_fees = ?4,
                     dca_count = ?5, dca_history = ?6, exit_price = ?7,
                     realized_pnl = ?8, hold_duration_ms = ?9, exit_reasoning = ?10,
                     closed_at = ?11
                 WHERE id = ?1",
                params![
                    trade.position_id,
                    trade.position.volume,
                    trade.position.avg_entry_price,
                    trade.total_fees,
                    trade.dca_count,
                    serde_json::to_string(&trade.position.dca_history)
                        .unwrap_or_else(|_| "[]".into()),
                    trade.exit_price,
                    trade.realized_pnl,
                    trade.hold_duration_ms,
                    exit_reasoning,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("close position")?;
        Ok(())
    }

    // ── Decisions ────────────────────────────────────────────────────────

    /// Append a batch of decision records inside one transaction.
    pub fn append_decisions(&self, records: &[DecisionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("begin decision batch")?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO arena_decisions (
                         session_id, agent_id, tick, action, reasoning, confidence,
                         used_model, price_at, balance_at, pnl_at, input_tokens,
                         output_tokens, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .context("prepare decision insert")?;
            let now = Utc::now().to_rfc3339();
            for r in records {
                stmt.execute(params![
                    r.session_id,
                    r.agent_id,
                    r.tick as i64,
                    r.action,
                    r.reasoning,
                    r.confidence,
                    r.used_model,
                    r.price_at,
                    r.balance_at,
                    r.pnl_at,
                    r.input_tokens.map(|t| t as i64),
                    r.output_tokens.map(|t| t as i64),
                    now,
                ])
                .context("insert decision")?;
            }
        }
        tx.commit().context("commit decision batch")?;
        Ok(())
    }

    pub fn decision_count(&self, session_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM arena_decisions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("count decisions")?;
        Ok(count as u64)
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    pub fn insert_snapshot(&self, session_id: &str, market_price: f64, data_json: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO arena_snapshots (session_id, market_price, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, market_price, data_json, Utc::now().to_rfc3339()],
            )
            .context("insert snapshot")?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{close_position, open_position, ExecOutcome};
    use crate::types::Side;

    fn store() -> ArenaStore {
        ArenaStore::open_in_memory().unwrap()
    }

    fn agent() -> AgentState {
        AgentState::new("Stored Steve", "momentum", "circle", 0, 1000.0)
    }

    #[test]
    fn session_lifecycle_rows() {
        let s = store();
        s.insert_session("sess-1", "{}").unwrap();
        assert!(s.session_started_at("sess-1").unwrap().is_none());

        s.mark_session_started("sess-1", 0.60).unwrap();
        assert!(s.session_started_at("sess-1").unwrap().is_some());

        s.update_session_status("sess-1", "paused").unwrap();
        s.mark_session_ended("sess-1", 0.61, 3_600_000, "{\"ok\":true}").unwrap();
    }

    #[test]
    fn unknown_session_started_at_is_none() {
        let s = store();
        assert!(s.session_started_at("missing").unwrap().is_none());
    }

    #[test]
    fn agent_roundtrip() {
        let s = store();
        s.insert_session("sess-1", "{}").unwrap();

        let mut a = agent();
        s.insert_agent("sess-1", &a, "a patient grinder", "{}").unwrap();

        a.balance = 1234.5;
        a.realized_pnl = 234.5;
        a.win_count = 3;
        a.loss_count = 1;
        a.model_calls = 7;
        a.input_tokens = 4000;
        a.output_tokens = 900;
        a.estimated_cost_usd = 0.012;
        a.recompute_derived();
        s.upsert_agent(&a).unwrap();

        let loaded = s.load_agents("sess-1").unwrap();
        assert_eq!(loaded.len(), 1);
        let l = &loaded[0];
        assert_eq!(l.id, a.id);
        assert_eq!(l.name, "Stored Steve");
        assert!((l.balance - 1234.5).abs() < 1e-9);
        assert!((l.realized_pnl - 234.5).abs() < 1e-9);
        assert_eq!(l.win_count, 3);
        assert_eq!(l.trade_count, 4);
        assert_eq!(l.model_calls, 7);
        assert!(l.is_alive());
    }

    #[test]
    fn dead_agent_survives_roundtrip() {
        let s = store();
        s.insert_session("sess-1", "{}").unwrap();
        let mut a = agent();
        s.insert_agent("sess-1", &a, "doomed", "{}").unwrap();
        a.mark_dead(AgentStatus::Liquidated, 99, "liquidated at 0.51");
        s.upsert_agent(&a).unwrap();

        let loaded = s.load_agents("sess-1").unwrap();
        assert!(loaded[0].dead);
        assert_eq!(loaded[0].status, AgentStatus::Liquidated);
        assert_eq!(loaded[0].death_tick, Some(99));
    }

    #[test]
    fn position_open_dca_close_rows() {
        let s = store();
        let (state, _) = open_position(agent(), "XRP/EUR", Side::Long, 0.6, 10.0, 10.0, "dip buy");
        let position = state.position.as_ref().unwrap();
        s.insert_open_position(&state.id, position, "{}").unwrap();
        s.update_position_after_dca(position).unwrap();

        let (_, outcome) = close_position(state, 0.62, "tp");
        let ExecOutcome::Closed(trade) = outcome else {
            panic!("expected close")
        };
        s.close_position(&trade, "take profit").unwrap();
    }

    #[test]
    fn decision_batches_append() {
        let s = store();
        let records: Vec<DecisionRecord> = (0..25)
            .map(|i| DecisionRecord {
                session_id: "sess-1".to_string(),
                agent_id: format!("agent-{}", i % 4),
                tick: i,
                action: "hold".to_string(),
                reasoning: Some("steady".to_string()),
                confidence: 50.0,
                used_model: false,
                price_at: 0.6,
                balance_at: 1000.0,
                pnl_at: 0.0,
                input_tokens: None,
                output_tokens: None,
            })
            .collect();

        s.append_decisions(&records[..10]).unwrap();
        s.append_decisions(&records[10..]).unwrap();
        s.append_decisions(&[]).unwrap();
        assert_eq!(s.decision_count("sess-1").unwrap(), 25);
    }

    #[test]
    fn snapshots_insert() {
        let s = store();
        s.insert_snapshot("sess-1", 0.6, "{\"agents\":[]}").unwrap();
        s.insert_snapshot("sess-1", 0.61, "{\"agents\":[]}").unwrap();
    }
}
