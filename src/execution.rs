// =============================================================================
// Execution Engine — fee-accurate paper trades over agent state
// =============================================================================
//
// Pure functions: each operation consumes an agent snapshot plus a current
// price and returns the new snapshot and an outcome record. No I/O, no
// panics. A precondition failure (open on top of an open position, DCA with
// none, dead agent) returns the state unchanged with a Rejected outcome.
//
// Fee model (fractions of notional):
//   taker          0.26%   charged on entry and exit notional
//   maker          0.16%   reserved for resting orders
//   margin open    0.02%   charged on entry and DCA notional
//   rollover       0.02%   per started 4h period, on notional at entry
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{AgentState, Position};
use crate::types::{AgentStatus, Side};

pub const TAKER_FEE: f64 = 0.0026;
#[allow(dead_code)]
pub const MAKER_FEE: f64 = 0.0016;
pub const MARGIN_OPEN_FEE: f64 = 0.0002;
pub const ROLLOVER_FEE_PER_4H: f64 = 0.0002;

/// Margin percent band every entry is clamped into.
pub const MARGIN_PERCENT_MIN: f64 = 5.0;
pub const MARGIN_PERCENT_MAX: f64 = 20.0;

// =============================================================================
// Outcomes
// =============================================================================

/// Everything a subscriber or the store needs to know about a closed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub volume: f64,
    pub margin_returned: f64,
    pub realized_pnl: f64,
    pub closing_fee: f64,
    pub rollover_fee: f64,
    pub total_fees: f64,
    pub hold_duration_ms: i64,
    pub dca_count: u32,
    pub win: bool,
    /// Balance fell to or below zero after settlement.
    pub bankrupt: bool,
    /// The full position record, for persistence.
    pub position: Position,
}

/// Result of one execution operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecOutcome {
    Opened {
        position_id: String,
        side: Side,
        price: f64,
        volume: f64,
        margin: f64,
        fees: f64,
    },
    Closed(ClosedTrade),
    DcaApplied {
        position_id: String,
        price: f64,
        added_volume: f64,
        added_margin: f64,
        fees: f64,
        dca_count: u32,
        new_avg_entry: f64,
    },
    Liquidated(ClosedTrade),
    Rejected {
        reason: String,
    },
}

impl ExecOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

fn reject(state: AgentState, reason: impl Into<String>) -> (AgentState, ExecOutcome) {
    let reason = reason.into();
    debug!(agent = %state.name, %reason, "execution rejected");
    (state, ExecOutcome::Rejected { reason })
}

// =============================================================================
// Operations
// =============================================================================

/// Open a new leveraged position sized by `margin_percent` of free balance
/// (clamped into the [5, 20] band).
pub fn open_position(
    mut state: AgentState,
    pair: &str,
    side: Side,
    price: f64,
    margin_percent: f64,
    leverage: f64,
    reasoning: &str,
) -> (AgentState, ExecOutcome) {
    if state.dead {
        return reject(state, "agent is dead");
    }
    if state.position.as_ref().is_some_and(|p| p.is_open) {
        return reject(state, "position already open");
    }
    if price <= 0.0 {
        return reject(state, format!("invalid price {price}"));
    }

    let margin_percent = margin_percent.clamp(MARGIN_PERCENT_MIN, MARGIN_PERCENT_MAX);
    let margin = state.balance * margin_percent / 100.0;
    if margin <= 0.0 {
        return reject(state, "no free balance to commit");
    }

    let notional = margin * leverage;
    let volume = notional / price;
    let fees = notional * (TAKER_FEE + MARGIN_OPEN_FEE);

    let position = Position::open(pair, side, price, volume, leverage, margin, fees, reasoning);
    let position_id = position.id.clone();

    state.balance -= margin;
    state.total_fees += fees;
    state.position = Some(position);
    state.recompute_derived();

    (
        state,
        ExecOutcome::Opened {
            position_id,
            side,
            price,
            volume,
            margin,
            fees,
        },
    )
}

/// Close the open position at `price`, settling fees and rollover.
pub fn close_position(
    mut state: AgentState,
    price: f64,
    _reason: &str,
) -> (AgentState, ExecOutcome) {
    let Some(mut position) = state.position.take().filter(|p| p.is_open) else {
        return reject(state, "no open position to close");
    };
    if price <= 0.0 {
        state.position = Some(position);
        return reject(state, format!("invalid price {price}"));
    }

    let now = Utc::now();
    let closing_fee = TAKER_FEE * price * position.volume;
    let rollover_periods = (position.hours_open(now) / 4.0).floor();
    let rollover_fee = rollover_periods * ROLLOVER_FEE_PER_4H * position.notional_at_entry();

    let raw_pnl = position.raw_pnl(price);
    let realized = raw_pnl - (position.total_fees + closing_fee + rollover_fee);
    let margin_returned = position.margin_used;

    state.balance += margin_returned + realized;
    state.realized_pnl += realized;
    state.total_fees += closing_fee + rollover_fee;
    state.trade_count += 1;

    let win = realized > 0.0;
    if win {
        state.win_count += 1;
    } else {
        state.loss_count += 1;
    }

    let bankrupt = state.balance <= 0.0;

    position.is_open = false;
    position.unrealized_pnl = 0.0;
    position.unrealized_pnl_pct = 0.0;
    let trade = ClosedTrade {
        position_id: position.id.clone(),
        side: position.side,
        entry_price: position.avg_entry_price,
        exit_price: price,
        volume: position.volume,
        margin_returned,
        realized_pnl: realized,
        closing_fee,
        rollover_fee,
        total_fees: position.total_fees + closing_fee + rollover_fee,
        hold_duration_ms: (now - position.opened_at).num_milliseconds().max(0),
        dca_count: position.dca_count,
        win,
        bankrupt,
        position,
    };

    state.recompute_derived();

    (state, ExecOutcome::Closed(trade))
}

/// Average into the open position with `additional_margin_percent` of free
/// balance. Fails when the position's DCA budget (`max_dca_count`) is spent.
pub fn dca(
    mut state: AgentState,
    price: f64,
    additional_margin_percent: f64,
    max_dca_count: u32,
    reason: &str,
) -> (AgentState, ExecOutcome) {
    let Some(position) = state.position.as_ref().filter(|p| p.is_open) else {
        return reject(state, "no open position to average into");
    };
    if position.dca_count >= max_dca_count {
        let count = position.dca_count;
        return reject(state, format!("dca budget spent ({count}/{max_dca_count})"));
    }
    if price <= 0.0 {
        return reject(state, format!("invalid price {price}"));
    }

    let pct = additional_margin_percent.clamp(0.0, MARGIN_PERCENT_MAX);
    let margin = state.balance * pct / 100.0;
    if margin <= 0.0 || margin > state.balance {
        return reject(state, "insufficient balance for dca");
    }

    let leverage = position.leverage;
    let notional = margin * leverage;
    let volume = notional / price;
    let fees = notional * (TAKER_FEE + MARGIN_OPEN_FEE);

    let position = state.position.as_mut().expect("position checked above");
    position.apply_dca_fill(price, volume, margin, fees, reason);
    position.update_unrealized(price);
    let position_id = position.id.clone();
    let dca_count = position.dca_count;
    let new_avg_entry = position.avg_entry_price;

    state.balance -= margin;
    state.total_fees += fees;
    state.recompute_derived();

    (
        state,
        ExecOutcome::DcaApplied {
            position_id,
            price,
            added_volume: volume,
            added_margin: margin,
            fees,
            dca_count,
            new_avg_entry,
        },
    )
}

/// True when the current price has crossed the position's liquidation price.
pub fn check_liquidation(state: &AgentState, price: f64) -> bool {
    match state.position.as_ref().filter(|p| p.is_open) {
        Some(p) => match p.side {
            Side::Long => price <= p.liquidation_price,
            Side::Short => price >= p.liquidation_price,
        },
        None => false,
    }
}

/// Force-close at the liquidation threshold price and mark the agent dead.
/// The balance is floored at zero: liquidation never takes an agent negative.
pub fn liquidate(state: AgentState, tick: u64) -> (AgentState, ExecOutcome) {
    let Some(liq_price) = state
        .position
        .as_ref()
        .filter(|p| p.is_open)
        .map(|p| p.liquidation_price)
    else {
        return reject(state, "no open position to liquidate");
    };

    let (mut state, outcome) = close_position(state, liq_price, "liquidated");
    let ExecOutcome::Closed(mut trade) = outcome else {
        return (state, outcome);
    };

    state.balance = state.balance.max(0.0);
    state.mark_dead(
        AgentStatus::Liquidated,
        tick,
        format!("liquidated at {liq_price:.4}"),
    );
    state.recompute_derived();
    trade.bankrupt = false;

    (state, ExecOutcome::Liquidated(trade))
}

/// Refresh unrealised P&L and all derived fields without trading.
pub fn update_unrealized(mut state: AgentState, price: f64) -> AgentState {
    if let Some(position) = state.position.as_mut().filter(|p| p.is_open) {
        position.update_unrealized(price);
    }
    state.recompute_derived();
    state
}

// =============================================================================
// Tests
// =============================================================================
