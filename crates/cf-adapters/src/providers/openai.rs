//! OpenAI-compatible chat completions provider.
//!
//! Sends the image as a `data:` URI in a vision message. Requests are paced
//! client-side with a [`governor`] token bucket so a large batch stays under
//! the account's rate limit; a 429 that still gets through is reported as
//! [`AdapterErrorKind::RateLimited`](crate::AdapterErrorKind) and not retried.

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::json;

use cf_core::config::OpenAiConfig;
use cf_core::{Error, Result};

use crate::describe::{read_image, Description, Describer, TokenUsage};
use crate::error::AdapterError;
use crate::prompt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOKENS: u32 = 500;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Describer for OpenAI and API-compatible endpoints.
pub struct OpenAiDescriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl OpenAiDescriber {
    /// # Errors
    ///
    /// [`Error::Validation`] if no API key is configured.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Validation("providers.openai.api_key is not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter,
        })
    }
}

#[async_trait]
impl Describer for OpenAiDescriber {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn describe(
        &self,
        path: &Path,
        prompt_style: &str,
        model: &str,
    ) -> std::result::Result<Description, AdapterError> {
        let prompt = prompt::prompt_for(prompt_style).ok_or_else(|| {
            AdapterError::invalid_input(format!("unknown prompt style '{prompt_style}'"))
        })?;
        let (bytes, mime) = read_image(path).await?;
        let data_uri = format!("data:{mime};base64,{}", STANDARD.encode(bytes));

        let body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_uri}},
                ],
            }],
        });

        self.rate_limiter.until_ready().await;

        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(%url, model, path = %path.display(), "Requesting description");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &text));
        }

        let parsed: ChatResponse = resp.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::unknown("provider returned no description"))?;

        Ok(Description {
            text,
            token_usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }
}
