//! Client for upstreams speaking the OpenAI chat-completions wire protocol
//! (openai, groq, ollama, openrouter).

use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, ErrorResponse};
use crate::{RelayError, Result};

#[derive(Clone, Debug)]
pub struct OpenAiWireClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiWireClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    /// POST the caller's request with its `model` overwritten by the
    /// upstream's model identifier.
    pub async fn post_chat_completion(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        let mut body = request.clone();
        body.model = model.to_string();

        tracing::debug!(model, url = %self.chat_completions_url(), "forwarding chat completion");

        let response = self
            .http
            .post(self.chat_completions_url())
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            // Prefer the upstream's own error message when the body carries
            // the standard envelope.
            let body = serde_json::from_str::<ErrorResponse>(&text)
                .map(|envelope| envelope.error.message)
                .unwrap_or(text);
            return Err(RelayError::Api { status, body });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
        Ok(parsed)
    }
}
