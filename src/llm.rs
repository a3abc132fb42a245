// =============================================================================
// Language Model Client — chat completions with token accounting
// =============================================================================
//
// One contract (`LlmInvoker`), one HTTP implementation speaking the
// OpenAI-compatible chat-completions shape, and the static pricing table used
// to convert usage tokens into USD against per-agent budgets.
//
// The arena never retries a model call within a tick: a transport error or a
// bad response degrades to the tier-1 decision at the call site.
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A completed model invocation with accounted usage.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Capability contract the decision engine and roster generator consume.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn invoke(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<LlmResponse>;
}

// =============================================================================
// Pricing
// =============================================================================

/// USD per million tokens, input and output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub usd_per_million_input: f64,
    pub usd_per_million_output: f64,
}

/// Static pricing table. Unknown models fall back to the cheapest small
/// model so budget accounting always errs on the generous side of running.
const PRICING: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o",
        ModelPricing {
            usd_per_million_input: 2.50,
            usd_per_million_output: 10.00,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPricing {
            usd_per_million_input: 0.15,
            usd_per_million_output: 0.60,
        },
    ),
    (
        "gpt-4.1",
        ModelPricing {
            usd_per_million_input: 2.00,
            usd_per_million_output: 8.00,
        },
    ),
    (
        "gpt-4.1-mini",
        ModelPricing {
            usd_per_million_input: 0.40,
            usd_per_million_output: 1.60,
        },
    ),
    (
        "claude-sonnet-4",
        ModelPricing {
            usd_per_million_input: 3.00,
            usd_per_million_output: 15.00,
        },
    ),
    (
        "claude-haiku-3.5",
        ModelPricing {
            usd_per_million_input: 0.80,
            usd_per_million_output: 4.00,
        },
    ),
];

/// Rates for the cheapest small model; the documented fallback.
pub const FALLBACK_PRICING: ModelPricing = ModelPricing {
    usd_per_million_input: 0.15,
    usd_per_million_output: 0.60,
};

pub fn pricing_for(model_id: &str) -> ModelPricing {
    PRICING
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, p)| *p)
        .unwrap_or(FALLBACK_PRICING)
}

/// Cost of one invocation in USD.
pub fn estimate_cost_usd(model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let p = pricing_for(model_id);
    input_tokens as f64 / 1e6 * p.usd_per_million_input
        + output_tokens as f64 / 1e6 * p.usd_per_million_output
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Pull the first-`{`-to-last-`}` slice out of a model response, tolerating
/// markdown fences and surrounding prose.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

// =============================================================================
// HTTP client
// =============================================================================

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible chat-completions client. Base URL and key come from the
/// environment (`ARENA_LLM_BASE_URL`, `ARENA_LLM_API_KEY`).
pub struct HttpLlmClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            // Short enough to never stall a full decision interval.
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Build from environment variables; `None` when no API key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("ARENA_LLM_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        let base_url = std::env::var("ARENA_LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Some(Self::new(base_url, api_key))
    }
}

#[async_trait]
impl LlmInvoker for HttpLlmClient {
    async fn invoke(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<LlmResponse> {
        let request = ChatRequest {
            model: model_id,
            max_tokens,
            temperature: 0.7,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "model call failed");
            bail!("model endpoint returned {status}: {body}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to parse chat completion response")?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .context("chat completion contained no choices")?;

        let usage = parsed.usage.unwrap_or_default();
        debug!(
            model = model_id,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "model call complete"
        );

        Ok(LlmResponse {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
