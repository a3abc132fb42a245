// =============================================================================
// Scoring — RARS, stable ranking, end-of-session titles
// =============================================================================
//
// RARS (risk-adjusted return score):
//
//   rars = return_pct * consistency * survival - dead_penalty
//
//   return_pct  = realised P&L / starting capital * 100
//   consistency = 1 + (win_rate - 0.5) * 0.5
//   survival    = min(1, equity / starting capital)
//   penalty     = 10000 when dead
//
// The penalty dwarfs any achievable live score, so dead agents always rank
// below alive ones without a special-cased comparator.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::AgentState;

const DEAD_PENALTY: f64 = 10_000.0;

/// Win rate over closed trades; neutral 0.5 before the first close.
pub fn win_rate(agent: &AgentState) -> f64 {
    let total = agent.win_count + agent.loss_count;
    if total == 0 {
        0.5
    } else {
        agent.win_count as f64 / total as f64
    }
}

/// Risk-adjusted return score for one agent.
pub fn rars(agent: &AgentState) -> f64 {
    let return_pct = if agent.starting_capital > 0.0 {
        agent.realized_pnl / agent.starting_capital * 100.0
    } else {
        0.0
    };
    let consistency = 1.0 + (win_rate(agent) - 0.5) * 0.5;
    let survival = (agent.equity / agent.starting_capital).min(1.0).max(0.0);
    let penalty = if agent.dead { DEAD_PENALTY } else { 0.0 };

    return_pct * consistency * survival - penalty
}

/// One row of the leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedAgent {
    pub agent_id: String,
    pub name: String,
    pub rank: u32,
    pub rars: f64,
    pub equity: f64,
    pub realized_pnl: f64,
    pub health: f64,
    pub dead: bool,
}

/// Sort by RARS descending, write 1-based ranks back into the agents, and
/// return the ordered leaderboard.
pub fn rank_agents(agents: &mut BTreeMap<String, AgentState>) -> Vec<RankedAgent> {
    let mut scored: Vec<(String, f64)> = agents
        .values()
        .map(|a| (a.id.clone(), rars(a)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut board = Vec::with_capacity(scored.len());
    for (i, (id, score)) in scored.iter().enumerate() {
        let rank = i as u32 + 1;
        if let Some(agent) = agents.get_mut(id) {
            agent.rank = rank;
            board.push(RankedAgent {
                agent_id: agent.id.clone(),
                name: agent.name.clone(),
                rank,
                rars: *score,
                equity: agent.equity,
                realized_pnl: agent.realized_pnl,
                health: agent.health,
                dead: agent.dead,
            });
        }
    }
    board
}

// =============================================================================
// Titles
// =============================================================================

/// One awarded end-of-session title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardedTitle {
    pub title: String,
    pub agent_id: String,
    pub agent_name: String,
    pub value: f64,
}

/// The fixed title taxonomy. Each title names at most one winner; titles with
/// no qualifying agent are simply absent.
pub fn award_titles(agents: &BTreeMap<String, AgentState>) -> Vec<AwardedTitle> {
    let mut titles = Vec::new();
    let traders: Vec<&AgentState> = agents.values().filter(|a| a.trade_count > 0).collect();

    // Best Trader: highest realised P&L.
    if let Some(best) = traders
        .iter()
        .max_by(|a, b| a.realized_pnl.total_cmp(&b.realized_pnl))
    {
        titles.push(AwardedTitle {
            title: "Best Trader".to_string(),
            agent_id: best.id.clone(),
            agent_name: best.name.clone(),
            value: best.realized_pnl,
        });
    }

    // Most Consistent: highest win rate with at least 3 closed trades.
    if let Some(steady) = traders
        .iter()
        .filter(|a| a.win_count + a.loss_count >= 3)
        .max_by(|a, b| win_rate(a).total_cmp(&win_rate(b)))
    {
        titles.push(AwardedTitle {
            title: "Most Consistent".to_string(),
            agent_id: steady.id.clone(),
            agent_name: steady.name.clone(),
            value: win_rate(steady),
        });
    }

    // Biggest Risk Taker: highest average fee per trade.
    if let Some(whale) = traders
        .iter()
        .max_by(|a, b| {
            (a.total_fees / a.trade_count as f64).total_cmp(&(b.total_fees / b.trade_count as f64))
        })
    {
        titles.push(AwardedTitle {
            title: "Biggest Risk Taker".to_string(),
            agent_id: whale.id.clone(),
            agent_name: whale.name.clone(),
            value: whale.total_fees / whale.trade_count as f64,
        });
    }

    // Survivor: alive with trades, deepest drawdown survived.
    if let Some(survivor) = traders
        .iter()
        .filter(|a| a.is_alive())
        .max_by(|a, b| a.max_drawdown_pct.total_cmp(&b.max_drawdown_pct))
    {
        titles.push(AwardedTitle {
            title: "Survivor".to_string(),
            agent_id: survivor.id.clone(),
            agent_name: survivor.name.clone(),
            value: survivor.max_drawdown_pct,
        });
    }

    // Speed Demon: most closed trades.
    if let Some(fastest) = traders.iter().max_by_key(|a| a.trade_count) {
        titles.push(AwardedTitle {
            title: "Speed Demon".to_string(),
            agent_id: fastest.id.clone(),
            agent_name: fastest.name.clone(),
            value: fastest.trade_count as f64,
        });
    }

    titles
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentStatus;

    fn agent(name: &str) -> AgentState {
        AgentState::new(name, "momentum", "circle", 0, 1000.0)
    }

    fn agents_map(list: Vec<AgentState>) -> BTreeMap<String, AgentState> {
        list.into_iter().map(|a| (a.id.clone(), a)).collect()
    }

    #[test]
    fn fresh_agent_scores_zero() {
        assert_eq!(rars(&agent("A")), 0.0);
    }

    #[test]
    fn profitable_agent_scores_positive() {
        let mut a = agent("A");
        a.realized_pnl = 120.0;
        a.balance = 1120.0;
        a.win_count = 3;
        a.loss_count = 1;
        a.recompute_derived();
        // return 12%, consistency 1.125, survival capped at 1.
        let score = rars(&a);
        assert!((score - 12.0 * 1.125).abs() < 1e-9);
    }

    #[test]
    fn survival_multiplier_shrinks_losers() {
        let mut a = agent("A");
        a.realized_pnl = 50.0;
        a.balance = 500.0; // equity half of start
        a.win_count = 1;
        a.recompute_derived();
        let score = rars(&a);
        assert!((score - 5.0 * 1.25 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn dead_penalty_dominates() {
        let mut a = agent("A");
        a.realized_pnl = 500.0; // 50% return before dying
        a.mark_dead(AgentStatus::Liquidated, 10, "test");
        a.recompute_derived();
        assert!(rars(&a) < -9000.0);
    }

    // ---- S6: ranking stability ---------------------------------------------

    #[test]
    fn rank_order_and_dead_last() {
        // A: alive, rars ~12.3; B: alive, marginally higher; C: dead but was
        // a star performer. Expected order: B, A, C.
        let mut a = agent("A");
        a.realized_pnl = 123.0;
        a.recompute_derived();

        let mut b = agent("B");
        b.realized_pnl = 123.001;
        b.recompute_derived();

        let mut c = agent("C");
        c.realized_pnl = 500.0;
        c.mark_dead(AgentStatus::Liquidated, 5, "test");
        c.recompute_derived();

        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());
        let mut agents = agents_map(vec![a, b, c]);
        let board = rank_agents(&mut agents);

        assert_eq!(board[0].agent_id, b_id);
        assert_eq!(board[1].agent_id, a_id);
        assert_eq!(board[2].agent_id, c_id);
        assert_eq!(agents.get(&b_id).unwrap().rank, 1);
        assert_eq!(agents.get(&c_id).unwrap().rank, 3);
    }

    #[test]
    fn every_alive_agent_outranks_every_dead_agent() {
        let mut winners = Vec::new();
        for i in 0..3 {
            let mut a = agent(&format!("alive-{i}"));
            a.realized_pnl = -90.0 * (i as f64 + 1.0) / 3.0; // losing but alive
            a.balance = 1000.0 + a.realized_pnl;
            a.recompute_derived();
            winners.push(a);
        }
        for i in 0..3 {
            let mut a = agent(&format!("dead-{i}"));
            a.realized_pnl = 300.0;
            a.mark_dead(AgentStatus::Bankrupt, i, "test");
            a.recompute_derived();
            winners.push(a);
        }

        let mut agents = agents_map(winners);
        let board = rank_agents(&mut agents);
        let first_dead_rank = board.iter().find(|r| r.dead).map(|r| r.rank).unwrap();
        let last_alive_rank = board.iter().filter(|r| !r.dead).map(|r| r.rank).max().unwrap();
        assert!(last_alive_rank < first_dead_rank);
    }

    // ---- Titles -------------------------------------------------------------

    #[test]
    fn titles_name_at_most_one_winner_each() {
        let mut a = agent("A");
        a.trade_count = 5;
        a.win_count = 4;
        a.loss_count = 1;
        a.realized_pnl = 200.0;
        a.total_fees = 25.0;
        a.recompute_derived();

        let mut b = agent("B");
        b.trade_count = 9;
        b.win_count = 3;
        b.loss_count = 6;
        b.realized_pnl = -50.0;
        b.total_fees = 90.0;
        b.max_drawdown_pct = 35.0;
        b.recompute_derived();

        let agents = agents_map(vec![a, b]);
        let titles = award_titles(&agents);

        let mut names: Vec<&str> = titles.iter().map(|t| t.title.as_str()).collect();
        names.sort();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len(), "duplicate titles awarded");

        let by_title = |t: &str| titles.iter().find(|x| x.title == t);
        assert_eq!(by_title("Best Trader").unwrap().agent_name, "A");
        assert_eq!(by_title("Most Consistent").unwrap().agent_name, "A");
        assert_eq!(by_title("Speed Demon").unwrap().agent_name, "B");
        assert_eq!(by_title("Biggest Risk Taker").unwrap().agent_name, "B");
        assert_eq!(by_title("Survivor").unwrap().agent_name, "B");
    }

    #[test]
    fn no_titles_without_trades() {
        let agents = agents_map(vec![agent("A"), agent("B")]);
        assert!(award_titles(&agents).is_empty());
    }

    #[test]
    fn most_consistent_requires_three_trades() {
        let mut a = agent("A");
        a.trade_count = 2;
        a.win_count = 2;
        a.recompute_derived();
        let agents = agents_map(vec![a]);
        let titles = award_titles(&agents);
        assert!(titles.iter().all(|t| t.title != "Most Consistent"));
    }
}
