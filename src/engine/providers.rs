// ── Chatvend Engine: LLM Provider Clients ──────────────────────────────────
// Direct HTTP calls to the AI APIs, no SDK layer. One OpenAI-compatible
// client serves both OpenAI and Metis (an OpenAI-style proxy with its own
// base URL); Gemini speaks its own shapes. The worker talks to a single
// `LlmClient`, usually the router wrapped in the counting-semaphore gate.
//
// Providers report usage with every completion; billing uses those
// numbers, never our local estimate. The estimate exists only for the
// pre-check (do they plausibly have enough credit to start the call).

use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::atoms::constants::LLM_TIMEOUT_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatRole, ModelInfo, PromptMessage, TokenUsage};
use crate::engine::http::{is_retryable_status, retry_delay, MAX_RETRIES};

// ── Port ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;
    async fn list_models(&self) -> EngineResult<Vec<String>>;
    fn model_info(&self, model: &str) -> Option<ModelInfo>;
    async fn count_tokens(&self, model: &str, messages: &[PromptMessage]) -> EngineResult<i64>;
    async fn chat_with_usage(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> EngineResult<(String, TokenUsage)>;
}

/// ~4 chars per token plus a small per-message overhead. Same heuristic
/// everywhere a provider has no counting endpoint.
pub fn estimate_tokens(messages: &[PromptMessage]) -> i64 {
    messages.iter().map(|m| (m.content.len() as i64) / 4 + 4).sum()
}

fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(LLM_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

/// Coarse context-window table keyed by model-name prefix.
fn max_tokens_for(model: &str) -> u32 {
    match model {
        m if m.starts_with("gpt-4o") || m.starts_with("gpt-4.1") => 128_000,
        m if m.starts_with("o1") || m.starts_with("o3") => 200_000,
        m if m.starts_with("gemini-2") || m.starts_with("gemini-1.5") => 1_000_000,
        _ => 32_000,
    }
}

// ── OpenAI-compatible provider (OpenAI, Metis) ─────────────────────────────

pub struct OpenAiCompatClient {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        OpenAiCompatClient {
            name: name.into(),
            client: http_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    pub fn metis(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self::new("metis", base_url.unwrap_or("https://api.metisai.ir/openai/v1"), api_key)
    }

    fn format_messages(messages: &[PromptMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let resp = self.client.get(&url).bearer_auth(&self.api_key).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::provider(&self.name, format!("models: HTTP {}", resp.status())));
        }
        let v: Value = resp.json().await?;
        let ids = v["data"]
            .as_array()
            .map(|arr| {
                arr.iter().filter_map(|m| m["id"].as_str().map(str::to_string)).collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        Some(ModelInfo {
            name: model.to_string(),
            description: format!("{} chat model", self.name),
            max_tokens: max_tokens_for(model),
            supports: vec!["chat".into()],
        })
    }

    async fn count_tokens(&self, _model: &str, messages: &[PromptMessage]) -> EngineResult<i64> {
        // No counting endpoint in the OpenAI API; use the estimate.
        Ok(estimate_tokens(messages))
    }

    async fn chat_with_usage(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> EngineResult<(String, TokenUsage)> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": Self::format_messages(messages),
        });

        let mut attempt = 0u32;
        loop {
            let resp = self.client.post(&url).bearer_auth(&self.api_key).json(&body).send().await?;
            let status = resp.status().as_u16();
            if is_retryable_status(status) && attempt < MAX_RETRIES {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let waited = retry_delay(attempt, retry_after).await;
                warn!(
                    "[{}] HTTP {} on chat, retry {} after {}ms",
                    self.name,
                    status,
                    attempt + 1,
                    waited.as_millis()
                );
                attempt += 1;
                continue;
            }
            if status >= 400 {
                let detail = resp.text().await.unwrap_or_default();
                return Err(EngineError::provider(
                    &self.name,
                    format!("chat: HTTP {}: {}", status, truncate(&detail, 300)),
                ));
            }

            let v: Value = resp.json().await?;
            let text = v["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| EngineError::provider(&self.name, "chat: no content in response"))?
                .to_string();
            let usage = parse_openai_usage(&v["usage"]);
            return Ok((text, usage));
        }
    }
}

fn parse_openai_usage(u: &Value) -> TokenUsage {
    TokenUsage {
        prompt_tokens: u["prompt_tokens"].as_i64().unwrap_or(0),
        completion_tokens: u["completion_tokens"].as_i64().unwrap_or(0),
        total_tokens: u["total_tokens"].as_i64().unwrap_or(0),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Google Gemini provider ─────────────────────────────────────────────────

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        GeminiClient {
            client: http_client(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            api_key: api_key.into(),
        }
    }

    /// System messages become systemInstruction; user/assistant map to
    /// user/model contents.
    fn format_messages(messages: &[PromptMessage]) -> (Option<Value>, Vec<Value>) {
        let mut system_instruction = None;
        let mut contents = Vec::new();
        for m in messages {
            match m.role {
                ChatRole::System => {
                    system_instruction = Some(json!({"parts": [{"text": m.content}]}));
                }
                ChatRole::User => {
                    contents.push(json!({"role": "user", "parts": [{"text": m.content}]}));
                }
                ChatRole::Assistant => {
                    contents.push(json!({"role": "model", "parts": [{"text": m.content}]}));
                }
            }
        }
        (system_instruction, contents)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::provider("gemini", format!("models: HTTP {}", resp.status())));
        }
        let v: Value = resp.json().await?;
        let ids = v["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|n| n.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        Some(ModelInfo {
            name: model.to_string(),
            description: "Google Gemini model".into(),
            max_tokens: max_tokens_for(model),
            supports: vec!["chat".into()],
        })
    }

    async fn count_tokens(&self, model: &str, messages: &[PromptMessage]) -> EngineResult<i64> {
        let (_, contents) = Self::format_messages(messages);
        let url =
            format!("{}/models/{}:countTokens?key={}", self.base_url, model, self.api_key);
        let resp = self.client.post(&url).json(&json!({"contents": contents})).send().await?;
        if !resp.status().is_success() {
            // The counting endpoint is best-effort; the estimate keeps the
            // pre-check working when it is down.
            warn!("[gemini] countTokens HTTP {}, falling back to estimate", resp.status());
            return Ok(estimate_tokens(messages));
        }
        let v: Value = resp.json().await?;
        Ok(v["totalTokens"].as_i64().unwrap_or_else(|| estimate_tokens(messages)))
    }

    async fn chat_with_usage(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> EngineResult<(String, TokenUsage)> {
        let (system_instruction, contents) = Self::format_messages(messages);
        let url =
            format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key);
        let mut body = json!({"contents": contents});
        if let Some(si) = system_instruction {
            body["systemInstruction"] = si;
        }

        let mut attempt = 0u32;
        loop {
            let resp = self.client.post(&url).json(&body).send().await?;
            let status = resp.status().as_u16();
            if is_retryable_status(status) && attempt < MAX_RETRIES {
                let waited = retry_delay(attempt, None).await;
                warn!(
                    "[gemini] HTTP {} on generateContent, retry {} after {}ms",
                    status,
                    attempt + 1,
                    waited.as_millis()
                );
                attempt += 1;
                continue;
            }
            if status >= 400 {
                let detail = resp.text().await.unwrap_or_default();
                return Err(EngineError::provider(
                    "gemini",
                    format!("generateContent: HTTP {}: {}", status, truncate(&detail, 300)),
                ));
            }

            let v: Value = resp.json().await?;
            let text = v["candidates"][0]["content"]["parts"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .filter(|t| !t.is_empty())
                .ok_or_else(|| EngineError::provider("gemini", "generateContent: empty candidate"))?;

            let um = &v["usageMetadata"];
            let usage = TokenUsage {
                prompt_tokens: um["promptTokenCount"].as_i64().unwrap_or(0),
                completion_tokens: um["candidatesTokenCount"].as_i64().unwrap_or(0),
                total_tokens: um["totalTokenCount"].as_i64().unwrap_or(0),
            };
            return Ok((text, usage));
        }
    }
}

// ── Counting-semaphore gate ────────────────────────────────────────────────

/// Caps in-flight provider calls across the whole process
/// (`ai.concurrent_limit`). Wraps any adapter.
pub struct Limited {
    inner: Arc<dyn LlmClient>,
    gate: Semaphore,
}

impl Limited {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Limited { inner, gate: Semaphore::new(max_concurrent.max(1)) }
    }
}

#[async_trait]
impl LlmClient for Limited {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        self.inner.list_models().await
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        self.inner.model_info(model)
    }

    async fn count_tokens(&self, model: &str, messages: &[PromptMessage]) -> EngineResult<i64> {
        let _permit = self.gate.acquire().await.map_err(|_| {
            EngineError::provider(self.inner.name(), "semaphore closed during shutdown")
        })?;
        self.inner.count_tokens(model, messages).await
    }

    async fn chat_with_usage(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> EngineResult<(String, TokenUsage)> {
        let _permit = self.gate.acquire().await.map_err(|_| {
            EngineError::provider(self.inner.name(), "semaphore closed during shutdown")
        })?;
        self.inner.chat_with_usage(model, messages).await
    }
}

// ── Router ─────────────────────────────────────────────────────────────────

/// Picks a configured client by model-name prefix. Gemini models go to
/// the Gemini client; gpt/o-series to OpenAI; everything else to Metis
/// when configured, else the first client.
pub struct ProviderRouter {
    openai: Option<Arc<dyn LlmClient>>,
    gemini: Option<Arc<dyn LlmClient>>,
    metis: Option<Arc<dyn LlmClient>>,
}

impl ProviderRouter {
    pub fn from_config(ai: &crate::atoms::config::AiConfig) -> EngineResult<Self> {
        let openai = ai
            .openai_key
            .as_deref()
            .map(|k| Arc::new(OpenAiCompatClient::openai(k)) as Arc<dyn LlmClient>);
        let gemini = ai
            .gemini_key
            .as_deref()
            .map(|k| Arc::new(GeminiClient::new(k)) as Arc<dyn LlmClient>);
        let metis = ai.metis_key.as_deref().map(|k| {
            Arc::new(OpenAiCompatClient::metis(k, ai.metis_base_url.as_deref()))
                as Arc<dyn LlmClient>
        });
        if openai.is_none() && gemini.is_none() && metis.is_none() {
            return Err(EngineError::Config("no ai provider configured".into()));
        }
        Ok(ProviderRouter { openai, gemini, metis })
    }

    fn route(&self, model: &str) -> EngineResult<&Arc<dyn LlmClient>> {
        let picked = if model.starts_with("gemini") {
            self.gemini.as_ref()
        } else if model.starts_with("gpt")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("chatgpt")
        {
            self.openai.as_ref().or(self.metis.as_ref())
        } else {
            self.metis.as_ref().or(self.openai.as_ref())
        };
        picked
            .or(self.openai.as_ref())
            .or(self.metis.as_ref())
            .or(self.gemini.as_ref())
            .ok_or_else(|| EngineError::ModelNotAvailable(model.to_string()))
    }

    fn clients(&self) -> impl Iterator<Item = &Arc<dyn LlmClient>> {
        self.openai.iter().chain(self.gemini.iter()).chain(self.metis.iter())
    }
}

#[async_trait]
impl LlmClient for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        let mut all = Vec::new();
        for client in self.clients() {
            match client.list_models().await {
                Ok(models) => all.extend(models),
                Err(e) => warn!("[router] {} list_models failed: {}", client.name(), e),
            }
        }
        all.sort();
        all.dedup();
        Ok(all)
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        self.route(model).ok().and_then(|c| c.model_info(model))
    }

    async fn count_tokens(&self, model: &str, messages: &[PromptMessage]) -> EngineResult<i64> {
        self.route(model)?.count_tokens(model, messages).await
    }

    async fn chat_with_usage(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> EngineResult<(String, TokenUsage)> {
        self.route(model)?.chat_with_usage(model, messages).await
    }
}
