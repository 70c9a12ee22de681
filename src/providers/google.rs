//! Google Gemini client and the OpenAI <-> `generateContent` translation.
//!
//! Inbound requests arrive OpenAI-shaped; this module rewrites them into
//! Gemini's wire format, issues the call, and re-expresses the result as an
//! OpenAI chat completion so callers never see the provider difference.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::openai::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, CompletionMessage, FunctionCall,
    ToolCall, Usage,
};
use crate::utils::json_schema::{to_gemini_schema, GeminiSchema};
use crate::{RelayError, Result};

#[derive(Clone, Debug)]
pub struct GoogleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Default, Serialize)]
pub struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiSystemInstruction>,
    pub contents: Vec<GeminiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Default, Serialize)]
pub struct GeminiSystemInstruction {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
pub struct GeminiMessage {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        rename = "functionCall",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_call: Option<GeminiFunctionCall>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            function_call: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<GeminiSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        self.response_mime_type.is_none()
            && self.response_schema.is_none()
            && self.stop_sequences.is_empty()
            && self.temperature.is_none()
            && self.max_output_tokens.is_none()
            && self.top_p.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(rename = "modelVersion", default)]
    pub model_version: String,
    #[serde(rename = "usageMetadata", default)]
    pub usage_metadata: GeminiUsageMetadata,
    #[serde(default)]
    pub error: Option<GeminiError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: GeminiContent,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: String,
    #[serde(rename = "finishReason", default)]
    pub finish_reason: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct GeminiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

impl GoogleClient {
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

    fn generate_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/models/{model}:generateContent")
    }

    pub async fn post_chat_completion(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        let body = gemini_request_from_openai(request)?;
        let url = self.generate_url(model);

        tracing::debug!(model, url = %url, "forwarding chat completion to gemini");

        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RelayError::Api { status, body: text });
        }

        openai_response_from_body(&text)
    }
}

/// Decode a Gemini `generateContent` body and re-express it as an OpenAI
/// chat completion.
fn openai_response_from_body(text: &str) -> Result<ChatCompletionResponse> {
    let parsed: GeminiResponse = serde_json::from_str(text)?;
    if let Some(error) = parsed.error {
        return Err(RelayError::InvalidResponse(format!(
            "gemini returned error: {}",
            error.message
        )));
    }
    if parsed.candidates.is_empty() {
        return Err(RelayError::InvalidResponse(
            "gemini returned no candidates".to_string(),
        ));
    }
    Ok(openai_response_from_gemini(&parsed))
}

pub fn gemini_request_from_openai(request: &ChatCompletionRequest) -> Result<GeminiRequest> {
    let mut system_parts = Vec::<GeminiPart>::new();
    let mut contents = Vec::<GeminiMessage>::new();

    for message in &request.messages {
        // Non-text content has no Gemini rendering here and is dropped.
        let Some(text) = message.text() else {
            continue;
        };
        if message.role == "system" {
            system_parts.push(GeminiPart::text(text));
        } else {
            contents.push(GeminiMessage {
                role: message.role.clone(),
                parts: vec![GeminiPart::text(text)],
            });
        }
    }

    let tools = match request.tools.as_ref() {
        Some(tools) if !tools.is_empty() => {
            let declarations = tools
                .iter()
                .map(|tool| GeminiFunctionDeclaration {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    parameters: tool.function.parameters.clone(),
                })
                .collect();
            vec![GeminiTool {
                function_declarations: declarations,
            }]
        }
        _ => Vec::new(),
    };

    let mut config = GenerationConfig {
        stop_sequences: request.stop_sequences()?,
        temperature: request.temperature,
        max_output_tokens: request.max_completion_tokens,
        top_p: request.top_p,
        ..Default::default()
    };

    let schema = request
        .response_format
        .as_ref()
        .and_then(|format| format.json_schema.as_ref())
        .and_then(|json_schema| json_schema.schema.as_ref())
        .filter(|schema| !schema.is_null());
    if let Some(schema) = schema {
        config.response_mime_type = Some("application/json".to_string());
        config.response_schema = Some(to_gemini_schema(schema));
    }

    Ok(GeminiRequest {
        system_instruction: (!system_parts.is_empty())
            .then_some(GeminiSystemInstruction { parts: system_parts }),
        contents,
        tools,
        generation_config: (!config.is_empty()).then_some(config),
    })
}

pub fn openai_response_from_gemini(response: &GeminiResponse) -> ChatCompletionResponse {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);

    let mut choices = Vec::<Choice>::with_capacity(response.candidates.len());
    for candidate in &response.candidates {
        let mut content: Option<String> = None;
        let mut tool_calls = Vec::<ToolCall>::new();

        for part in &candidate.content.parts {
            if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
                content = Some(text.to_string());
            }
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.args.clone(),
                    },
                });
            }
        }

        choices.push(Choice {
            finish_reason: candidate.content.finish_reason.clone(),
            index: candidate.content.index,
            logprobs: None,
            message: CompletionMessage {
                content,
                role: candidate.content.role.clone(),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                ..Default::default()
            },
        });
    }

    ChatCompletionResponse {
        id: uuid::Uuid::new_v4().to_string(),
        object: "chat.completion".to_string(),
        created,
        model: response.model_version.clone(),
        service_tier: None,
        system_fingerprint: Some(response.model_version.clone()),
        choices,
        usage: Usage {
            prompt_tokens: response.usage_metadata.prompt_token_count,
            completion_tokens: response.usage_metadata.candidates_token_count,
            total_tokens: response.usage_metadata.total_token_count,
            ..Default::default()
        },
    }
}
