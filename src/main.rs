// =============================================================================
// Arena Engine — Main Entry Point
// =============================================================================
//
// Boots the shared market cache, the persistence store, the optional model
// client, and the process-wide orchestrator, then serves the REST/WebSocket
// host surface. Sessions are created and driven through the API; on shutdown
// any running session is stopped so every position settles and the summary
// is persisted.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agent;
mod api;
mod config;
mod decision;
mod events;
mod execution;
mod indicators;
mod knife;
mod llm;
mod market_data;
mod orchestrator;
mod roster;
mod scoring;
mod store;
mod strategy;
mod types;
mod validator;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::llm::{HttpLlmClient, LlmInvoker};
use crate::market_data::{KrakenClient, MarketDataCache};
use crate::orchestrator::Orchestrator;
use crate::store::ArenaStore;
use crate::types::SessionStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Arena Engine — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let pair = std::env::var("ARENA_PAIR").unwrap_or_else(|_| "XRP/EUR".to_string());
    let db_path = std::env::var("ARENA_DB_PATH").unwrap_or_else(|_| "arena.db".to_string());
    let bind_addr = std::env::var("ARENA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());

    // ── 2. Shared subsystems ─────────────────────────────────────────────
    let store = Arc::new(ArenaStore::open(&db_path)?);
    info!(db_path = %db_path, "persistence store ready");

    let market = MarketDataCache::install(Arc::new(MarketDataCache::new(
        Arc::new(KrakenClient::new()),
        pair.clone(),
    )));
    info!(pair = %pair, "market data cache ready");

    let llm: Option<Arc<dyn LlmInvoker>> = match HttpLlmClient::from_env() {
        Some(client) => {
            info!("language model client configured");
            Some(Arc::new(client))
        }
        None => {
            warn!("ARENA_LLM_API_KEY not set; tier-2 decisions and model rosters disabled");
            None
        }
    };

    // ── 3. The process-wide orchestrator ─────────────────────────────────
    let orch = orchestrator::named("arena", {
        let store = store.clone();
        let market = market.clone();
        let llm = llm.clone();
        move || Arc::new(Orchestrator::new(store, market, llm))
    });

    // ── 4. API server ────────────────────────────────────────────────────
    let context = Arc::new(ApiContext {
        orchestrator: orch.clone(),
        llm,
    });
    let app = api::rest::router(context);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if orch.session_id().is_some() && orch.status() != SessionStatus::Idle {
        match orch.stop().await {
            Ok(summary) => info!(
                session_id = %summary.session_id,
                winner = summary.rankings.first().map(|r| r.name.as_str()).unwrap_or("nobody"),
                "active session stopped"
            ),
            Err(e) => error!(error = %e, "failed to stop active session"),
        }
    }

    server.abort();
    info!("Arena Engine shut down complete.");
    Ok(())
}
