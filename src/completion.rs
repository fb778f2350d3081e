//! The hosted completion capability.
//!
//! The review generator only needs two calls, captured by
//! [`CompletionClient`]: a JSON-producing chat completion and a plain text
//! completion for employer-context enrichment. [`LlmCompletionClient`] adapts
//! any `edgequake_llm` provider to it and bounds every call with the
//! configured per-call timeout.

use crate::config::ReviewConfig;
use crate::error::{CompletionError, ReviewError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Model used when a provider is created without an explicit model.
pub const DEFAULT_REVIEW_MODEL: &str = "gpt-4.1-mini";

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Ask for a single JSON object. The returned text may still contain
    /// surrounding prose; callers decode leniently.
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String, CompletionError>;

    /// Free-form completion of a single prompt.
    async fn complete_text(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// [`CompletionClient`] over an `edgequake_llm` provider.
pub struct LlmCompletionClient {
    provider: Arc<dyn LLMProvider>,
    timeout_secs: u64,
}

impl LlmCompletionClient {
    pub fn new(provider: Arc<dyn LLMProvider>, timeout_secs: u64) -> Self {
        Self {
            provider,
            timeout_secs: timeout_secs.max(1),
        }
    }

    /// Resolve a provider from `config` and wrap it. `Ok(None)` means no
    /// provider could be found and reviews will use the heuristic reviewer.
    pub fn from_config(config: &ReviewConfig) -> Result<Option<Self>, ReviewError> {
        Ok(resolve_provider(config)?.map(|p| Self::new(p, config.api_timeout_secs)))
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<String, CompletionError> {
        let call = self.provider.chat(&messages, Some(&options));
        let response = tokio::time::timeout(Duration::from_secs(self.timeout_secs), call)
            .await
            .map_err(|_| CompletionError::Timeout(self.timeout_secs))?
            .map_err(|e| CompletionError::Provider(e.to_string()))?;

        debug!(
            "Completion: {} prompt tokens, {} completion tokens",
            response.prompt_tokens, response.completion_tokens
        );
        if response.content.trim().is_empty() {
            return Err(CompletionError::Empty);
        }
        Ok(response.content)
    }
}

#[async_trait]
impl CompletionClient for LlmCompletionClient {
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String, CompletionError> {
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_prompt),
        ];
        let options = CompletionOptions {
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
            ..Default::default()
        };
        self.chat(messages, options).await
    }

    async fn complete_text(&self, prompt: &str) -> Result<String, CompletionError> {
        self.chat(vec![ChatMessage::user(prompt)], CompletionOptions::default())
            .await
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ReviewError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ReviewError::InvalidConfig(format!("provider '{provider_name}' is not usable: {e}"))
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `review_model`,
///    `model`, or [`DEFAULT_REVIEW_MODEL`]. A named provider that cannot be
///    created is a configuration error.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key** (`OPENAI_API_KEY`), preferred over other detected keys.
/// 5. **Auto-detection** via [`ProviderFactory::from_env`].
///
/// Nothing found is `Ok(None)`: the review still runs, on heuristics.
pub fn resolve_provider(config: &ReviewConfig) -> Result<Option<Arc<dyn LLMProvider>>, ReviewError> {
    if let Some(ref provider) = config.provider {
        return Ok(Some(Arc::clone(provider)));
    }

    let model = config
        .review_model
        .as_deref()
        .or(config.model.as_deref())
        .unwrap_or(DEFAULT_REVIEW_MODEL);

    if let Some(ref name) = config.provider_name {
        info!("Completion provider: {} ({})", name, model);
        return create_provider(name, model).map(Some);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let model = config.review_model.as_deref().unwrap_or(&env_model);
            info!("Completion provider from environment: {} ({})", prov, model);
            return create_provider(&prov, model).map(Some);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            info!("Completion provider: openai ({})", model);
            return create_provider("openai", model).map(Some);
        }
    }

    match ProviderFactory::from_env() {
        Ok((llm_provider, _embedding)) => Ok(Some(llm_provider)),
        Err(e) => {
            warn!("No completion provider configured, reviews will use heuristics: {}", e);
            Ok(None)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedCompletion;
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_in_order() {
        let c = ScriptedCompletion::with_json([Ok("{}".to_string()), Err(CompletionError::Empty)]);
        assert_eq!(c.complete_json("s", "u1", 0.2, 10).await.unwrap(), "{}");
        assert_eq!(
            c.complete_json("s", "u2", 0.2, 10).await.unwrap_err(),
            CompletionError::Empty
        );
        assert!(c.complete_json("s", "u3", 0.2, 10).await.is_err());
        assert_eq!(c.json_calls(), 3);
    }
}
