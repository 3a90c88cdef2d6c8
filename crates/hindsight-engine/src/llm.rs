//! LLM client contract (SPEC_FULL.md §6): `call(messages) -> raw JSON
//! text`, plus a `verify` reachability probe. Retry/backoff and
//! provider failover live entirely behind this trait — the engine
//! never matches on a transport-specific error, only on
//! [`crate::error::EngineError::LlmTransient`] /
//! [`crate::error::EngineError::LlmOutputTooLong`].
//!
//! `LlmClient::call` itself returns the raw response text rather than
//! a generic structured type: a generic method on the trait would
//! make it impossible to use as `&dyn LlmClient`, which `consolidation`
//! and `reflection` both need (one caller, many possible response
//! shapes). [`call_structured`] is the generic convenience wrapper
//! every call site actually uses.
//!
//! The concrete `HttpLlmClient` speaks the OpenAI-compatible chat
//! completions shape (works against OpenAI, Groq, and a local Ollama
//! server with its `/v1` compatibility endpoint) since that is the
//! lowest common denominator across the three providers named in
//! `LlmConfig`'s default-base-URL table.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::{EngineError, Result};

/// One message in a chat-style prompt.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: &'static str,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
}

/// A named call scope, logged alongside bank/operation IDs and used to
/// pick the right env-var-resolved config (`for_memory` vs `for_judge`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallScope {
    Memory,
    Judge,
}

/// `trait LlmClient: Send + Sync` per SPEC_FULL.md §6 [FULL]. Returns
/// the raw JSON text of the model's response; callers parse it into
/// whatever DTO this call site expects via [`call_structured`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, messages: &[Message], scope: CallScope, max_retries: u32, timeout: Duration) -> Result<String>;

    /// Trivial reachability probe; does not require a full structured
    /// round-trip. Used by operators to check provider connectivity
    /// without spending a real call's worth of tokens.
    async fn verify(&self) -> Result<()>;
}

/// Call `llm` and parse its response into `T`. A malformed or
/// schema-violating response surfaces as `EngineError::LlmTransient`,
/// which callers may retry at a different chunk size.
pub async fn call_structured<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    messages: &[Message],
    scope: CallScope,
    max_retries: u32,
    timeout: Duration,
) -> Result<T> {
    let raw = llm.call(messages, scope, max_retries, timeout).await?;
    serde_json::from_str(&raw).map_err(|e| EngineError::LlmTransient(format!("schema violation: {e}")))
}

/// Hierarchical config resolution (SPEC_FULL.md §9 ambient stack note):
/// provider/api_key/base_url/model resolved from environment variables,
/// with per-provider default base URLs matching the source
/// implementation's `LLMConfig.for_memory`/`for_judge` table. This is
/// the one-level-deep instance of the "defaults -> overrides" pattern
/// described in §9 (env-var defaults -> call-site override), since the
/// engine itself has no server process layering bank-level overrides on
/// top.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl LlmConfig {
    /// Resolve the memory-path config: `HINDSIGHT_LLM_PROVIDER`,
    /// `HINDSIGHT_LLM_API_KEY`, `HINDSIGHT_LLM_BASE_URL`,
    /// `HINDSIGHT_LLM_MODEL`.
    pub fn for_memory() -> Self {
        Self::resolve("HINDSIGHT_LLM").config
    }

    /// Resolve the judge-path config (reflection, evaluation), falling
    /// back to the memory config's env vars when judge-specific ones
    /// are unset — the "server defaults -> call-site overrides"
    /// precedence chain from §9 applied to a two-scope hierarchy.
    pub fn for_judge() -> Self {
        let memory = Self::for_memory();
        let judge = Self::resolve("HINDSIGHT_JUDGE_LLM");
        Self {
            provider: env_or("HINDSIGHT_JUDGE_LLM_PROVIDER").unwrap_or(memory.provider),
            api_key: env_or("HINDSIGHT_JUDGE_LLM_API_KEY").or(memory.api_key),
            base_url: if judge.base_url_was_explicit { judge.config.base_url } else { memory.base_url },
            model: env_or("HINDSIGHT_JUDGE_LLM_MODEL").unwrap_or(memory.model),
            initial_backoff: memory.initial_backoff,
            max_backoff: memory.max_backoff,
        }
    }

    fn resolve(prefix: &str) -> ResolvedWithFlag {
        let provider = env_or(&format!("{prefix}_PROVIDER")).unwrap_or_else(|| "openai".to_string());
        let base_url_was_explicit = env_or(&format!("{prefix}_BASE_URL")).is_some();
        let base_url = env_or(&format!("{prefix}_BASE_URL")).unwrap_or_else(|| default_base_url(&provider));
        let model = env_or(&format!("{prefix}_MODEL")).unwrap_or_else(|| default_model(&provider));
        let api_key = env_or(&format!("{prefix}_API_KEY"));
        ResolvedWithFlag {
            config: Self {
                provider,
                api_key,
                base_url,
                model,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(20),
            },
            base_url_was_explicit,
        }
    }
}

/// Carries whether `base_url` came from an explicit env var, so
/// `for_judge` can decide whether to inherit the memory scope's base
/// URL or keep the judge-specific resolved default.
struct ResolvedWithFlag {
    config: LlmConfig,
    base_url_was_explicit: bool,
}

fn default_base_url(provider: &str) -> String {
    match provider {
        "groq" => "https://api.groq.com/openai/v1".to_string(),
        "ollama" => "http://localhost:11434/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

fn default_model(provider: &str) -> String {
    match provider {
        "groq" => "llama-3.3-70b-versatile".to_string(),
        "ollama" => "llama3.1".to_string(),
        _ => "gpt-4o-mini".to_string(),
    }
}

fn env_or(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Process-wide limiter on outstanding LLM calls (SPEC_FULL.md §5,
/// default 32 permits), mirroring the teacher's `OnceLock`-guarded lazy
/// singleton idiom (there used for the embedding model, here for a
/// semaphore instead of a model handle).
static LLM_CONCURRENCY: OnceLock<Semaphore> = OnceLock::new();

pub fn llm_concurrency_limiter() -> &'static Semaphore {
    LLM_CONCURRENCY.get_or_init(|| Semaphore::new(32))
}

/// Production client speaking the OpenAI-compatible chat completions
/// API with JSON schema structured output, backed by `reqwest`.
pub struct HttpLlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as u64 * 2u64.saturating_pow(attempt);
        let capped = base.min(self.config.max_backoff.as_millis() as u64);
        // Jitter +-20% without pulling in `rand`: derive a [0, 1) factor
        // from the current instant's sub-millisecond component, which is
        // unpredictable enough for backoff smearing without needing a
        // seeded PRNG dependency the teacher's stack doesn't carry.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let jitter_factor = 0.8 + (nanos % 1000) as f64 / 1000.0 * 0.4;
        Duration::from_millis(((capped as f64) * jitter_factor) as u64)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(&self, messages: &[Message], _scope: CallScope, max_retries: u32, timeout: Duration) -> Result<String> {
        let _permit = llm_concurrency_limiter().acquire().await.map_err(|e| EngineError::LlmTransient(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "response_format": { "type": "json_object" },
        });

        let mut last_err = EngineError::LlmTransient("no attempts made".to_string());
        for attempt in 0..=max_retries {
            let mut req = self
                .http
                .post(format!("{}/chat/completions", self.config.base_url))
                .json(&body)
                .timeout(timeout);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let text = resp.text().await.map_err(|e| EngineError::LlmTransient(e.to_string()))?;
                    return extract_message_content(&text);
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::PAYLOAD_TOO_LARGE => {
                    return Err(EngineError::LlmOutputTooLong);
                }
                Ok(resp) => {
                    last_err = EngineError::LlmTransient(format!("http {}", resp.status()));
                }
                Err(e) => {
                    last_err = EngineError::LlmTransient(e.to_string());
                }
            }

            if attempt < max_retries {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }
        }
        Err(last_err)
    }

    async fn verify(&self) -> Result<()> {
        let mut req = self.http.get(format!("{}/models", self.config.base_url));
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.timeout(Duration::from_secs(5)).send().await.map_err(|e| EngineError::LlmTransient(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::LlmTransient(format!("http {}", resp.status())))
        }
    }
}

fn extract_message_content(raw_response: &str) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct Choice {
        message: ChoiceMessage,
    }
    #[derive(serde::Deserialize)]
    struct ChoiceMessage {
        content: String,
    }
    #[derive(serde::Deserialize)]
    struct ChatCompletion {
        choices: Vec<Choice>,
    }

    let completion: ChatCompletion = serde_json::from_str(raw_response)
        .map_err(|e| EngineError::LlmTransient(format!("malformed chat completion envelope: {e}")))?;
    completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| EngineError::LlmTransient("empty choices".to_string()))
}

/// Deterministic test double driven by a scripted queue of responses,
/// one per call, so the six end-to-end scenarios in SPEC_FULL.md §8 run
/// without a live network call. Enabled behind `test-support` so
/// integration tests in the sibling `tests/e2e` crate can construct it
/// too.
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeLlmClient {
        responses: Mutex<std::collections::VecDeque<String>>,
    }

    impl FakeLlmClient {
        pub fn new(scripted_json_responses: Vec<String>) -> Self {
            Self { responses: Mutex::new(scripted_json_responses.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlmClient {
        async fn call(&self, _messages: &[Message], _scope: CallScope, _max_retries: u32, _timeout: Duration) -> Result<String> {
            self.responses
                .lock()
                .expect("fake llm client mutex poisoned")
                .pop_front()
                .ok_or_else(|| EngineError::LlmTransient("FakeLlmClient exhausted".to_string()))
        }

        async fn verify(&self) -> Result<()> {
            Ok(())
        }
    }
}
