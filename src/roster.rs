// =============================================================================
// Roster Generator — who fights in the arena
// =============================================================================
//
// Two modes:
//   - Archetype mode: the built-in archetype table is shuffled without
//     replacement and deep-merged onto the default strategy. Free, instant,
//     deterministic in content (random in assignment).
//   - Model mode: one prompt asks the language model for the entire roster as
//     JSON (fence-tolerant parse); each agent's strategy goes through the
//     validator so nothing unsafe survives. Token usage is accounted and
//     returned with the roster.
//
// Either way the roster carries a theme, a master-commentary line, and one
// validated spec per agent. Avatar shapes are assigned round-robin from the
// fixed 8-element list; the colour index is the agent's index.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::llm::{estimate_cost_usd, extract_json_object, LlmInvoker};
use crate::strategy::{archetypes, Archetype, TradingStrategy, COMMENTARY_TRIGGERS};
use crate::validator::validate_strategy;

/// Fixed avatar shape rotation.
pub const AVATAR_SHAPES: [&str; 8] = [
    "circle", "square", "triangle", "diamond", "hexagon", "star", "pentagon", "cross",
];

/// One fully specified competitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub archetype: String,
    pub personality: String,
    pub avatar_shape: String,
    pub color_index: u32,
    pub strategy: TradingStrategy,
    /// Commentary templates by trigger; missing triggers fall back to the
    /// built-in generic template at emission time.
    pub commentary: BTreeMap<String, String>,
    pub validation_errors: Vec<String>,
    pub validation_warnings: Vec<String>,
}

/// A validated roster plus its generation cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    pub agents: Vec<AgentSpec>,
    pub theme: String,
    pub master_commentary: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Generate a roster in the mode the config selects. Model mode degrades to
/// archetype mode when no model capability is available or the call fails.
pub async fn generate_roster(
    config: &SessionConfig,
    llm: Option<&dyn LlmInvoker>,
) -> Roster {
    if config.use_master_agent {
        if let (Some(llm), Some(model_id)) = (llm, config.model_id.as_deref()) {
            match model_roster(config, model_id, llm).await {
                Ok(roster) => return roster,
                Err(e) => {
                    warn!(error = %e, "model roster failed; falling back to archetypes");
                }
            }
        } else {
            warn!("use_master_agent set but no model configured; using archetypes");
        }
    }
    archetype_roster(config)
}

// =============================================================================
// Archetype mode
// =============================================================================

/// Build the roster from the built-in archetype table.
pub fn archetype_roster(config: &SessionConfig) -> Roster {
    let mut pool: Vec<Archetype> = match &config.archetype_ids {
        Some(ids) => archetypes()
            .into_iter()
            .filter(|a| ids.iter().any(|id| id == a.id))
            .collect(),
        None => archetypes(),
    };
    if pool.is_empty() {
        warn!("archetype_ids matched nothing; using the full table");
        pool = archetypes();
    }

    pool.shuffle(&mut rand::thread_rng());

    let mut agents = Vec::with_capacity(config.agent_count);
    for i in 0..config.agent_count {
        let archetype = &pool[i % pool.len()];
        let round = i / pool.len();
        let name = if round == 0 {
            archetype.display_name.to_string()
        } else {
            format!("{} {}", archetype.display_name, round + 1)
        };

        let validated = validate_strategy(
            &archetype.overrides,
            config.leverage,
            config.max_duration_hours,
        );

        let commentary: BTreeMap<String, String> = COMMENTARY_TRIGGERS
            .iter()
            .filter_map(|t| archetype.commentary(t).map(|c| (t.to_string(), c.to_string())))
            .collect();

        agents.push(AgentSpec {
            name,
            archetype: archetype.id.to_string(),
            personality: validated.strategy.description.clone(),
            avatar_shape: AVATAR_SHAPES[i % AVATAR_SHAPES.len()].to_string(),
            color_index: i as u32,
            strategy: validated.strategy,
            commentary,
            validation_errors: validated.errors,
            validation_warnings: validated.warnings,
        });
    }

    info!(count = agents.len(), "archetype roster generated");

    Roster {
        agents,
        theme: "Classic arena: six schools of trading, one survivor".to_string(),
        master_commentary: "The bell rings. Balances are even, knives are out.".to_string(),
        input_tokens: 0,
        output_tokens: 0,
        cost_usd: 0.0,
    }
}

// =============================================================================
// Model mode
// =============================================================================

#[derive(Debug, Deserialize)]
struct ModelRosterReply {
    #[serde(default)]
    theme: Option<String>,
    #[serde(default)]
    master_commentary: Option<String>,
    #[serde(default)]
    agents: Vec<ModelAgentReply>,
}

#[derive(Debug, Deserialize)]
struct ModelAgentReply {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    archetype: Option<String>,
    #[serde(default)]
    personality: Option<String>,
    #[serde(default)]
    strategy: Option<Value>,
    #[serde(default)]
    commentary: Option<BTreeMap<String, String>>,
}

/// Ask the model for a themed roster; every strategy is validated before use.
pub async fn model_roster(
    config: &SessionConfig,
    model_id: &str,
    llm: &dyn LlmInvoker,
) -> Result<Roster> {
    let system_prompt = "You are the master of ceremonies of a leveraged \
        paper-trading arena. You invent distinctive trading agents. Respond \
        with a single JSON object and no other text.";
    let user_prompt = format!(
        "Create a roster of {count} trading agents for a {hours:.1}-hour XRP/EUR \
         arena session. Reply with JSON of the shape:\n\
         {{\"theme\": \"...\", \"master_commentary\": \"...\", \"agents\": [\n\
           {{\"name\": \"...\", \"archetype\": \"...\", \"personality\": \"...\",\n\
            \"strategy\": {{\"timeframe_weights\": {{\"d1\": 20, \"h4\": 25, \"h1\": 25, \"m15\": 20, \"m5\": 10}},\n\
             \"cautious_margin_percent\": 5-20, \"full_margin_percent\": 5-20,\n\
             \"entry_confidence\": 40-95, \"max_dca_count\": 0-3, \"max_hours\": 0.5-{hours:.1},\n\
             \"rsi_oversold\": 10-45, \"rsi_overbought\": 55-90,\n\
             \"regime_preference\": {{\"trending\": 0-1, \"ranging\": 0-1, \"volatile\": 0-1}}}},\n\
            \"commentary\": {{\"on_entry\": \"...\", \"on_exit_profit\": \"...\",\n\
             \"on_exit_loss\": \"...\", \"on_death\": \"...\", \"on_rival_death\": \"...\"}}}}\n\
         ]}}\n\
         Timeframe weights must sum to 100. Make the personalities clash.",
        count = config.agent_count,
        hours = config.max_duration_hours,
    );

    let response = llm
        .invoke(model_id, system_prompt, &user_prompt, 4000)
        .await
        .context("roster model call failed")?;

    let json = extract_json_object(&response.text)
        .context("roster response contained no JSON object")?;
    let reply: ModelRosterReply =
        serde_json::from_str(json).context("roster response JSON did not match the schema")?;

    if reply.agents.is_empty() {
        anyhow::bail!("roster response contained no agents");
    }

    let mut agents = Vec::with_capacity(config.agent_count);
    for (i, raw) in reply.agents.into_iter().take(config.agent_count).enumerate() {
        let strategy_value = raw.strategy.unwrap_or(Value::Null);
        let validated =
            validate_strategy(&strategy_value, config.leverage, config.max_duration_hours);

        // Only the fixed trigger set is kept; unknown keys are dropped and
        // missing ones are left empty for the generic fallback.
        let commentary: BTreeMap<String, String> = raw
            .commentary
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| COMMENTARY_TRIGGERS.contains(&k.as_str()))
            .collect();

        agents.push(AgentSpec {
            name: raw.name.unwrap_or_else(|| format!("Agent {}", i + 1)),
            archetype: raw.archetype.unwrap_or_else(|| "custom".to_string()),
            personality: raw
                .personality
                .unwrap_or_else(|| "an inscrutable trader".to_string()),
            avatar_shape: AVATAR_SHAPES[i % AVATAR_SHAPES.len()].to_string(),
            color_index: i as u32,
            strategy: validated.strategy,
            commentary,
            validation_errors: validated.errors,
            validation_warnings: validated.warnings,
        });
    }

    // The model may under-deliver; pad from the archetype table.
    if agents.len() < config.agent_count {
        warn!(
            delivered = agents.len(),
            requested = config.agent_count,
            "model under-delivered agents; padding from archetypes"
        );
        let pad = archetype_roster(config);
        for spec in pad.agents.into_iter().skip(agents.len()) {
            agents.push(spec);
        }
    }

    let cost_usd = estimate_cost_usd(model_id, response.input_tokens, response.output_tokens);
    info!(
        count = agents.len(),
        cost_usd, "model roster generated"
    );

    Ok(Roster {
        agents,
        theme: reply.theme.unwrap_or_else(|| "An arena of strangers".to_string()),
        master_commentary: reply
            .master_commentary
            .unwrap_or_else(|| "The bell rings.".to_string()),
        input_tokens: response.input_tokens,
        output_tokens: response.output_tokens,
        cost_usd,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use async_trait::async_trait;

    fn config(count: usize) -> SessionConfig {
        SessionConfig {
            agent_count: count,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn archetype_roster_has_requested_count() {
        let roster = archetype_roster(&config(4));
        assert_eq!(roster.agents.len(), 4);
        assert_eq!(roster.cost_usd, 0.0);
        assert_eq!(roster.input_tokens, 0);
    }

    #[test]
    fn archetype_roster_no_repeats_up_to_six() {
        let roster = archetype_roster(&config(6));
        let mut ids: Vec<&str> = roster.agents.iter().map(|a| a.archetype.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6, "archetypes must not repeat within one cycle");
    }

    #[test]
    fn archetype_roster_cycles_past_six() {
        let roster = archetype_roster(&config(8));
        assert_eq!(roster.agents.len(), 8);
        // Names stay unique even when archetypes repeat.
        let mut names: Vec<&str> = roster.agents.iter().map(|a| a.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn avatar_shapes_round_robin_and_colors_by_index() {
        let roster = archetype_roster(&config(8));
        for (i, agent) in roster.agents.iter().enumerate() {
            assert_eq!(agent.avatar_shape, AVATAR_SHAPES[i % 8]);
            assert_eq!(agent.color_index, i as u32);
        }
    }

    #[test]
    fn restricted_archetype_ids_respected() {
        let mut cfg = config(4);
        cfg.archetype_ids = Some(vec!["scalper".to_string(), "breakout".to_string()]);
        let roster = archetype_roster(&cfg);
        for agent in &roster.agents {
            assert!(agent.archetype == "scalper" || agent.archetype == "breakout");
        }
    }

    #[test]
    fn archetype_strategies_are_validated() {
        let roster = archetype_roster(&config(6));
        for agent in &roster.agents {
            assert!((agent.strategy.timeframe_weights.sum() - 100.0).abs() < 0.01);
            assert_eq!(agent.strategy.leverage, 10.0);
            assert!(agent.validation_errors.is_empty());
        }
    }

    // ---- Model mode ---------------------------------------------------------

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmInvoker for ScriptedLlm {
        async fn invoke(
            &self,
            _model: &str,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
        ) -> Result<LlmResponse> {
            Ok(LlmResponse {
                text: self.0.clone(),
                input_tokens: 800,
                output_tokens: 600,
            })
        }
    }

    fn model_config(count: usize) -> SessionConfig {
        SessionConfig {
            agent_count: count,
            model_id: Some("gpt-4o-mini".to_string()),
            use_master_agent: true,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn model_roster_parses_fenced_json() {
        let reply = r#"Here is your roster!
```json
{"theme": "Ghosts of trades past", "master_commentary": "Let the haunting begin.",
 "agents": [
   {"name": "Banshee", "archetype": "momentum", "personality": "shrieks at breakouts",
    "strategy": {"entry_confidence": 200, "leverage": 50},
    "commentary": {"on_entry": "Banshee wails in.", "bogus_trigger": "dropped"}},
   {"name": "Wraith", "archetype": "contrarian", "personality": "fades the living"}
 ]}
```"#;
        let cfg = model_config(2);
        let roster = model_roster(&cfg, "gpt-4o-mini", &ScriptedLlm(reply.to_string()))
            .await
            .unwrap();

        assert_eq!(roster.theme, "Ghosts of trades past");
        assert_eq!(roster.agents.len(), 2);
        // Out-of-range values were clamped, leverage forced.
        assert_eq!(roster.agents[0].strategy.entry_confidence, 95.0);
        assert_eq!(roster.agents[0].strategy.leverage, 10.0);
        // Unknown commentary triggers dropped; known kept.
        assert!(roster.agents[0].commentary.contains_key("on_entry"));
        assert!(!roster.agents[0].commentary.contains_key("bogus_trigger"));
        // Missing strategy means pure defaults.
        assert_eq!(roster.agents[1].strategy.entry_confidence, 60.0);
        assert!(roster.input_tokens > 0);
        assert!(roster.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn model_roster_pads_when_under_delivered() {
        let reply = r#"{"agents": [{"name": "Lonely"}]}"#;
        let cfg = model_config(4);
        let roster = model_roster(&cfg, "gpt-4o-mini", &ScriptedLlm(reply.to_string()))
            .await
            .unwrap();
        assert_eq!(roster.agents.len(), 4);
        assert_eq!(roster.agents[0].name, "Lonely");
    }

    #[tokio::test]
    async fn model_roster_rejects_unparseable_reply() {
        let cfg = model_config(2);
        let result = model_roster(&cfg, "gpt-4o-mini", &ScriptedLlm("no json".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn generate_falls_back_to_archetypes_on_model_failure() {
        let cfg = model_config(3);
        let roster = generate_roster(&cfg, Some(&ScriptedLlm("garbage".to_string()))).await;
        assert_eq!(roster.agents.len(), 3);
        assert_eq!(roster.cost_usd, 0.0); // archetype fallback is free
    }

    #[tokio::test]
    async fn generate_uses_archetypes_without_master_agent() {
        let roster = generate_roster(&config(5), None).await;
        assert_eq!(roster.agents.len(), 5);
    }
}
