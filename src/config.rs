// =============================================================================
// Session Configuration — immutable parameters of one arena session
// =============================================================================
//
// Validated once at session creation and never mutated afterwards. Everything
// an operator can tune about a session lives here; engine-internal constants
// (fee rates, event ring sizes, flush cadences) do not.
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Reference pair used for the market-wide trend tag.
pub const BTC_REFERENCE_PAIR: &str = "XBT/EUR";

/// Immutable configuration of a single arena session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Trading pair, e.g. "XRP/EUR".
    pub pair: String,

    /// Number of competing agents (2-8).
    #[serde(default = "default_agent_count")]
    pub agent_count: usize,

    /// Per-agent starting capital in quote currency.
    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,

    /// Milliseconds between decision ticks. Minimum 1000.
    #[serde(default = "default_decision_interval_ms")]
    pub decision_interval_ms: u64,

    /// Maximum wall-clock duration of the session in hours.
    #[serde(default = "default_max_duration_hours")]
    pub max_duration_hours: f64,

    /// Language-model identifier for tier-2 decisions and model-mode rosters.
    #[serde(default)]
    pub model_id: Option<String>,

    /// Uniform leverage applied to every agent's strategy.
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Total model budget for the session in USD.
    #[serde(default)]
    pub session_budget_usd: Option<f64>,

    /// Per-agent model budget in USD. Defaults to an even split of the
    /// session budget when absent.
    #[serde(default)]
    pub per_agent_budget_usd: Option<f64>,

    /// Restrict archetype-mode rosters to these archetype ids.
    #[serde(default)]
    pub archetype_ids: Option<Vec<String>>,

    /// Generate the roster with the language model instead of the built-in
    /// archetype table.
    #[serde(default)]
    pub use_master_agent: bool,
}

fn default_agent_count() -> usize {
    4
}
fn default_starting_capital() -> f64 {
    1000.0
}
fn default_decision_interval_ms() -> u64 {
    60_000
}
fn default_max_duration_hours() -> f64 {
    24.0
}
fn default_leverage() -> f64 {
    10.0
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pair: "XRP/EUR".to_string(),
            agent_count: default_agent_count(),
            starting_capital: default_starting_capital(),
            decision_interval_ms: default_decision_interval_ms(),
            max_duration_hours: default_max_duration_hours(),
            model_id: None,
            leverage: default_leverage(),
            session_budget_usd: None,
            per_agent_budget_usd: None,
            archetype_ids: None,
            use_master_agent: false,
        }
    }
}

impl SessionConfig {
    /// Check every invariant the orchestrator relies on. Called once by
    /// `create_session`; a failure here is a precondition violation and the
    /// session is not created.
    pub fn validate(&self) -> Result<()> {
        if self.pair.trim().is_empty() {
            bail!("pair must not be empty");
        }
        if !(2..=8).contains(&self.agent_count) {
            bail!("agent_count must be in 2..=8, got {}", self.agent_count);
        }
        if self.starting_capital <= 0.0 {
            bail!(
                "starting_capital must be > 0, got {}",
                self.starting_capital
            );
        }
        if self.decision_interval_ms < 1000 {
            bail!(
                "decision_interval_ms must be >= 1000, got {}",
                self.decision_interval_ms
            );
        }
        if self.max_duration_hours <= 0.0 {
            bail!(
                "max_duration_hours must be > 0, got {}",
                self.max_duration_hours
            );
        }
        if self.max_duration_ms() <= self.decision_interval_ms {
            bail!("max duration must exceed the decision interval");
        }
        if self.leverage < 1.0 || self.leverage > 100.0 {
            bail!("leverage must be in 1..=100, got {}", self.leverage);
        }
        Ok(())
    }

    /// Maximum session duration in milliseconds.
    pub fn max_duration_ms(&self) -> u64 {
        (self.max_duration_hours * 3600.0 * 1000.0) as u64
    }

    /// Model budget available to one agent, in USD. Zero disables tier-2.
    pub fn agent_budget_usd(&self) -> f64 {
        if let Some(per_agent) = self.per_agent_budget_usd {
            per_agent.max(0.0)
        } else if let Some(total) = self.session_budget_usd {
            (total / self.agent_count as f64).max(0.0)
        } else {
            0.0
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
