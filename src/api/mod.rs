// =============================================================================
// Host API — REST command surface + WebSocket event stream
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::llm::LlmInvoker;
use crate::orchestrator::Orchestrator;

/// Shared state handed to every handler.
pub struct ApiContext {
    pub orchestrator: Arc<Orchestrator>,
    pub llm: Option<Arc<dyn LlmInvoker>>,
}
