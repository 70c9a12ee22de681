//! Upstream wire clients.
//!
//! The provider set is closed: everything except Google speaks the OpenAI
//! wire protocol, so adding a provider means adding a variant here plus its
//! client module.

pub mod google;
pub mod openai_wire;

pub use google::GoogleClient;
pub use openai_wire::OpenAiWireClient;

use crate::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::Result;

#[derive(Clone, Debug)]
pub enum UpstreamClient {
    OpenAiWire(OpenAiWireClient),
    Gemini(GoogleClient),
}

impl UpstreamClient {
    /// Issue one chat completion against the upstream, returning the
    /// response re-expressed in OpenAI form.
    pub async fn post_chat_completion(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        match self {
            UpstreamClient::OpenAiWire(client) => client.post_chat_completion(request, model).await,
            UpstreamClient::Gemini(client) => client.post_chat_completion(request, model).await,
        }
    }
}
