// =============================================================================
// Agent State — balance, equity, health, and the single open position
// =============================================================================
//
// One AgentState per competitor. Created from the roster at session creation,
// mutated only by the orchestrator tick path, frozen at session stop or on
// death. Everything derived (equity, peak equity, drawdown, health, zone) is
// recomputed through `recompute_derived` after any balance or position
// change so the invariants in the scoring and event layers always hold.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Activity, AgentStatus, HealthZone, Side};

// =============================================================================
// Position
// =============================================================================

/// One averaging-in step of an open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaEntry {
    pub price: f64,
    pub volume: f64,
    pub margin: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// At most one open position per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub pair: String,
    pub side: Side,
    /// Base units; > 0 while open.
    pub volume: f64,
    /// Volume-weighted average entry price.
    pub avg_entry_price: f64,
    pub leverage: f64,
    /// Notional / leverage, summed across entry and DCA fills.
    pub margin_used: f64,
    /// All fees this position has incurred so far (entry + DCA).
    pub total_fees: f64,
    pub dca_count: u32,
    pub dca_history: Vec<DcaEntry>,
    pub is_open: bool,
    pub opened_at: DateTime<Utc>,
    pub unrealized_pnl: f64,
    /// Unrealised P&L as a percent of margin used.
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    /// Rationale recorded at entry.
    pub entry_reasoning: String,
}

impl Position {
    pub fn open(
        pair: &str,
        side: Side,
        price: f64,
        volume: f64,
        leverage: f64,
        margin: f64,
        entry_fees: f64,
        entry_reasoning: &str,
    ) -> Self {
        let mut pos = Self {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            side,
            volume,
            avg_entry_price: price,
            leverage,
            margin_used: margin,
            total_fees: entry_fees,
            dca_count: 0,
            dca_history: Vec::new(),
            is_open: true,
            opened_at: Utc::now(),
            unrealized_pnl: -entry_fees,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            entry_reasoning: entry_reasoning.to_string(),
        };
        pos.recompute_liquidation();
        pos.unrealized_pnl_pct = if margin > 0.0 {
            pos.unrealized_pnl / margin * 100.0
        } else {
            0.0
        };
        pos
    }

    /// Liquidation price for the simple 20/leverage approximation: strictly
    /// below entry for longs, strictly above for shorts, floored at zero.
    pub fn liquidation_price_for(side: Side, entry: f64, leverage: f64) -> f64 {
        let threshold = 20.0 / leverage / 100.0;
        let price = match side {
            Side::Long => entry * (1.0 - threshold),
            Side::Short => entry * (1.0 + threshold),
        };
        price.max(0.0)
    }

    pub fn recompute_liquidation(&mut self) {
        self.liquidation_price =
            Self::liquidation_price_for(self.side, self.avg_entry_price, self.leverage);
    }

    /// Fold one DCA fill into the position: volume-weighted average entry,
    /// added margin and volume, liquidation recomputed from the new average.
    pub fn apply_dca_fill(
        &mut self,
        price: f64,
        volume: f64,
        margin: f64,
        fees: f64,
        reason: &str,
    ) {
        let total_volume = self.volume + volume;
        if total_volume > 0.0 {
            self.avg_entry_price =
                (self.avg_entry_price * self.volume + price * volume) / total_volume;
        }
        self.volume = total_volume;
        self.margin_used += margin;
        self.total_fees += fees;
        self.dca_count += 1;
        self.dca_history.push(DcaEntry {
            price,
            volume,
            margin,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.recompute_liquidation();
    }

    /// Price P&L before fees: (price - entry) * volume, negated for shorts.
    pub fn raw_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.avg_entry_price) * self.volume
    }

    /// Update unrealised P&L (price P&L minus fees already incurred).
    pub fn update_unrealized(&mut self, price: f64) {
        self.unrealized_pnl = self.raw_pnl(price) - self.total_fees;
        self.unrealized_pnl_pct = if self.margin_used > 0.0 {
            self.unrealized_pnl / self.margin_used * 100.0
        } else {
            0.0
        };
    }

    /// Notional at the volume-weighted entry.
    pub fn notional_at_entry(&self) -> f64 {
        self.avg_entry_price * self.volume
    }

    pub fn hours_open(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_milliseconds().max(0) as f64 / 3_600_000.0
    }
}

// =============================================================================
// Agent state
// =============================================================================

/// Full mutable state of one competing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub name: String,
    pub archetype: String,
    /// Cosmetic only.
    pub avatar_shape: String,
    pub color_index: u32,

    /// Free quote currency.
    pub balance: f64,
    pub starting_capital: f64,
    /// balance + margin_used + unrealised P&L.
    pub equity: f64,
    pub position: Option<Position>,

    pub realized_pnl: f64,
    pub total_fees: f64,
    pub win_count: u32,
    pub loss_count: u32,
    pub peak_equity: f64,
    pub max_drawdown_pct: f64,

    /// clamp(equity / starting_capital * 100, 0, 100).
    pub health: f64,
    pub health_zone: HealthZone,
    /// 1-based among alive agents; dead agents rank last.
    pub rank: u32,
    pub dead: bool,
    pub status: AgentStatus,
    pub death_tick: Option<u64>,
    pub death_reason: Option<String>,

    pub model_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,

    pub trade_count: u64,
    pub badges: BTreeSet<String>,
    pub activity: Activity,
    pub last_rationale: Option<String>,
}

impl AgentState {
    pub fn new(
        name: impl Into<String>,
        archetype: impl Into<String>,
        avatar_shape: impl Into<String>,
        color_index: u32,
        starting_capital: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            archetype: archetype.into(),
            avatar_shape: avatar_shape.into(),
            color_index,
            balance: starting_capital,
            starting_capital,
            equity: starting_capital,
            position: None,
            realized_pnl: 0.0,
            total_fees: 0.0,
            win_count: 0,
            loss_count: 0,
            peak_equity: starting_capital,
            max_drawdown_pct: 0.0,
            health: 100.0,
            health_zone: HealthZone::Safe,
            rank: 0,
            dead: false,
            status: AgentStatus::Alive,
            death_tick: None,
            death_reason: None,
            model_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost_usd: 0.0,
            trade_count: 0,
            badges: BTreeSet::new(),
            activity: Activity::Idle,
            last_rationale: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.dead
    }

    /// Unrealised P&L of the open position, zero when flat.
    pub fn unrealized_pnl(&self) -> f64 {
        self.position
            .as_ref()
            .filter(|p| p.is_open)
            .map(|p| p.unrealized_pnl)
            .unwrap_or(0.0)
    }

    /// Margin committed to the open position, zero when flat.
    pub fn margin_used(&self) -> f64 {
        self.position
            .as_ref()
            .filter(|p| p.is_open)
            .map(|p| p.margin_used)
            .unwrap_or(0.0)
    }

    /// Recompute equity, peak equity, drawdown, health, and zone. Call after
    /// every balance or position mutation.
    pub fn recompute_derived(&mut self) {
        self.equity = self.balance + self.margin_used() + self.unrealized_pnl();

        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        if self.peak_equity > 0.0 {
            let drawdown = (self.peak_equity - self.equity) / self.peak_equity * 100.0;
            if drawdown > self.max_drawdown_pct {
                self.max_drawdown_pct = drawdown;
            }
        }

        self.health = if self.starting_capital > 0.0 {
            (self.equity / self.starting_capital * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.health_zone = if self.dead {
            HealthZone::Dead
        } else {
            HealthZone::from_health(self.health)
        };
    }

    /// Freeze the agent in a terminal state.
    pub fn mark_dead(&mut self, status: AgentStatus, tick: u64, reason: impl Into<String>) {
        self.dead = true;
        self.status = status;
        self.death_tick = Some(tick);
        self.death_reason = Some(reason.into());
        self.health = 0.0;
        self.health_zone = HealthZone::Dead;
        self.activity = Activity::Idle;
    }
}

// =============================================================================
// Tests
// =============================================================================
