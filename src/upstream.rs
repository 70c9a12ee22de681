//! Validated upstream descriptors.
//!
//! An `Upstream` is immutable after construction: all config validation and
//! API-key resolution happen here, and the provider-appropriate client is
//! bound once so dispatch never has to branch on provider kind again.

use crate::config::{ConfigError, Provider, UpstreamConfig};
use crate::providers::{GoogleClient, OpenAiWireClient, UpstreamClient};

#[derive(Debug)]
pub struct Upstream {
    pub provider: Provider,
    pub model: String,
    pub base_url: String,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub context_length: u32,
    pub modalities: Vec<String>,
    pub cost_input: f64,
    pub cost_output: f64,
    pub quality: i32,
    pub groups: Vec<String>,
    pub client: UpstreamClient,
}

impl Upstream {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let api_key = config.resolve_api_key()?;

        let client = match config.provider {
            Provider::Google => {
                UpstreamClient::Gemini(GoogleClient::new(config.base_url.clone(), api_key))
            }
            _ => UpstreamClient::OpenAiWire(OpenAiWireClient::new(
                config.base_url.clone(),
                api_key,
            )),
        };

        Ok(Self {
            provider: config.provider,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            requests_per_minute: config.requests_per_minute,
            tokens_per_minute: config.tokens_per_minute,
            context_length: config.context_length,
            modalities: config.modalities.clone(),
            cost_input: config.cost_input,
            cost_output: config.cost_output,
            quality: config.quality,
            groups: config.groups.clone(),
            client,
        })
    }

    pub fn is_free(&self) -> bool {
        self.cost_input + self.cost_output == 0.0
    }
}
