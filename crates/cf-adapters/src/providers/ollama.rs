//! Ollama vision model provider.
//!
//! Calls `POST {base_url}/api/generate` with the image inlined as base64 and
//! streaming disabled.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use cf_core::config::OllamaConfig;
use cf_core::{Error, Result};

use crate::describe::{read_image, Description, Describer, TokenUsage};
use crate::error::AdapterError;
use crate::prompt;

/// Upper bound on a single HTTP exchange; the run applies its own item
/// timeout on top.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

/// Describer backed by a local or remote Ollama server.
pub struct OllamaDescriber {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaDescriber {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Describer for OllamaDescriber {
    fn name(&self) -> &'static str {
        "ollama"
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
        let (bytes, _mime) = read_image(path).await?;

        let body = GenerateRequest {
            model,
            prompt,
            images: vec![STANDARD.encode(bytes)],
            stream: false,
        };

        let url = format!("{}/api/generate", self.base_url);
        tracing::debug!(%url, model, path = %path.display(), "Requesting description");
        let resp = self.client.post(&url).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &text));
        }

        let parsed: GenerateResponse = resp.json().await?;
        let text = parsed.response.trim().to_string();
        if text.is_empty() {
            return Err(AdapterError::unknown("provider returned an empty description"));
        }

        let token_usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (p, c) => Some(TokenUsage {
                prompt_tokens: p.unwrap_or(0),
                completion_tokens: c.unwrap_or(0),
            }),
        };

        Ok(Description { text, token_usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdapterErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn describer(server: &MockServer) -> OllamaDescriber {
        OllamaDescriber::new(&OllamaConfig {
            enabled: true,
            base_url: format!("{}/", server.uri()),
        })
        .unwrap()
    }

    fn image(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("cat.jpg");
        std::fs::write(&path, b"\xff\xd8\xff\xe0jpeg").unwrap();
        path
    }

    #[tokio::test]
    async fn describe_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"model": "llava", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "  A cat on a windowsill. ",
                "prompt_eval_count": 12,
                "eval_count": 7
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = describer(&server)
            .describe(&image(&dir), "concise", "llava")
            .await
            .unwrap();
        assert_eq!(out.text, "A cat on a windowsill.");
        assert_eq!(out.token_usage.unwrap().total(), 19);
    }

    #[tokio::test]
    async fn server_error_maps_to_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = describer(&server)
            .describe(&image(&dir), "concise", "llava")
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unknown);
        assert!(err.message.contains("model crashed"));
    }

    #[tokio::test]
    async fn missing_model_is_invalid_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = describer(&server)
            .describe(&image(&dir), "concise", "nope")
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn unknown_style_fails_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = describer(&server)
            .describe(&image(&dir), "sonnet", "llava")
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn unreachable_server_is_unknown() {
        let describer = OllamaDescriber::new(&OllamaConfig {
            enabled: true,
            base_url: "http://127.0.0.1:1".into(),
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = describer
            .describe(&image(&dir), "concise", "llava")
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unknown);
    }
}
