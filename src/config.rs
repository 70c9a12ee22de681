//! YAML configuration loaded once at startup.
//!
//! Validation failures here are fatal: the process reports the error and
//! exits non-zero rather than starting with a partial upstream set.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONTEXT_TIMEOUT_SECS: u64 = 90;
const DEFAULT_CONTEXT_LENGTH: u32 = 32_768;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no upstreams configured under `llms`")]
    NoUpstreams,
    #[error("upstream `{model}`: missing or empty field `{field}`")]
    MissingField { model: String, field: &'static str },
    #[error("upstream `{model}`: `{field}` must be at least 1")]
    NonPositiveLimit { model: String, field: &'static str },
    #[error("upstream `{model}`: `{field}` must not be negative")]
    NegativeCost { model: String, field: &'static str },
    #[error("upstream `{model}`: api key variable `{name}` is not set")]
    MissingApiKey { model: String, name: String },
    #[error("upstream `{model}`: no `api_key` or `api_key_name` configured")]
    NoApiKeySource { model: String },
}

/// Provider kinds the relay can talk to. Every kind except `google` speaks
/// the OpenAI wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Google,
    Groq,
    Ollama,
    Openrouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Google => "google",
            Provider::Groq => "groq",
            Provider::Ollama => "ollama",
            Provider::Openrouter => "openrouter",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub llms: Vec<UpstreamConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub listen_address: String,
    pub listen_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound in seconds applied to every dispatch; 0 selects the
    /// built-in default.
    #[serde(default)]
    pub context_timeout: u64,
}

impl GeneralConfig {
    pub fn context_timeout_secs(&self) -> u64 {
        if self.context_timeout == 0 {
            DEFAULT_CONTEXT_TIMEOUT_SECS
        } else {
            self.context_timeout
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    pub provider: Provider,
    pub model: String,
    pub base_url: String,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_modalities")]
    pub modalities: Vec<String>,
    #[serde(default)]
    pub cost_input: f64,
    #[serde(default)]
    pub cost_output: f64,
    #[serde(default)]
    pub quality: i32,
    /// Literal credential; takes precedence over `api_key_name`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default)]
    pub api_key_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_context_length() -> u32 {
    DEFAULT_CONTEXT_LENGTH
}

fn default_modalities() -> Vec<String> {
    vec!["text".to_string()]
}

impl UpstreamConfig {
    pub fn is_free(&self) -> bool {
        self.cost_input + self.cost_output == 0.0
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let model = self.model.clone();
        if self.model.trim().is_empty() {
            return Err(ConfigError::MissingField {
                model,
                field: "model",
            });
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                model,
                field: "base_url",
            });
        }
        if self.requests_per_minute < 1 {
            return Err(ConfigError::NonPositiveLimit {
                model,
                field: "requests_per_minute",
            });
        }
        if self.tokens_per_minute < 1 {
            return Err(ConfigError::NonPositiveLimit {
                model,
                field: "tokens_per_minute",
            });
        }
        if self.context_length < 1 {
            return Err(ConfigError::NonPositiveLimit {
                model,
                field: "context_length",
            });
        }
        if self.modalities.is_empty() {
            return Err(ConfigError::MissingField {
                model,
                field: "modalities",
            });
        }
        if self.cost_input < 0.0 {
            return Err(ConfigError::NegativeCost {
                model,
                field: "cost_input",
            });
        }
        if self.cost_output < 0.0 {
            return Err(ConfigError::NegativeCost {
                model,
                field: "cost_output",
            });
        }
        Ok(())
    }

    /// The bearer credential: the literal `api_key` when present, otherwise
    /// the environment variable named by `api_key_name`.
    pub(crate) fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_string());
        }
        let Some(name) = self
            .api_key_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
        else {
            return Err(ConfigError::NoApiKeySource {
                model: self.model.clone(),
            });
        };
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigError::MissingApiKey {
                model: self.model.clone(),
                name: name.to_string(),
            }),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llms.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        for upstream in &self.llms {
            upstream.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Config {
        serde_yaml::from_str(raw).expect("parse config")
    }

    const BASE: &str = r#"
general:
  listen_address: "127.0.0.1"
  listen_port: 8080
  log_level: "debug"
llms:
  - provider: openai
    model: gpt-4
    base_url: "https://api.openai.com/v1"
    requests_per_minute: 60
    tokens_per_minute: 1000
    context_length: 2048
    api_key: sk-test
    quality: 5
"#;

    #[test]
    fn parses_and_validates_minimal_config() {
        let config = parse(BASE);
        config.validate().expect("valid");
        assert_eq!(config.general.listen_port, 8080);
        assert_eq!(config.llms[0].provider, Provider::Openai);
        assert_eq!(config.llms[0].context_length, 2048);
        assert_eq!(config.llms[0].modalities, vec!["text".to_string()]);
    }

    #[test]
    fn context_timeout_zero_selects_default() {
        let config = parse(BASE);
        assert_eq!(config.general.context_timeout_secs(), 90);
    }

    #[test]
    fn context_length_defaults_when_unspecified() {
        let raw = BASE.replace("    context_length: 2048\n", "");
        let config = parse(&raw);
        assert_eq!(config.llms[0].context_length, 32_768);
    }

    #[test]
    fn unknown_provider_fails_parse() {
        let raw = BASE.replace("provider: openai", "provider: acme");
        assert!(serde_yaml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn empty_llms_is_rejected() {
        let raw = r#"
general:
  listen_address: "127.0.0.1"
  listen_port: 8080
llms: []
"#;
        let config = parse(raw);
        assert!(matches!(config.validate(), Err(ConfigError::NoUpstreams)));
    }

    #[test]
    fn zero_rpm_is_rejected() {
        let raw = BASE.replace("requests_per_minute: 60", "requests_per_minute: 0");
        let config = parse(&raw);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveLimit {
                field: "requests_per_minute",
                ..
            })
        ));
    }

    #[test]
    fn literal_api_key_wins_over_env_name() {
        let config = parse(BASE);
        let key = config.llms[0].resolve_api_key().expect("key");
        assert_eq!(key, "sk-test");
    }

    #[test]
    fn missing_api_key_source_is_rejected() {
        let raw = BASE.replace("    api_key: sk-test\n", "");
        let config = parse(&raw);
        assert!(matches!(
            config.llms[0].resolve_api_key(),
            Err(ConfigError::NoApiKeySource { .. })
        ));
    }

    #[test]
    fn unset_env_variable_is_rejected() {
        let raw = BASE.replace(
            "    api_key: sk-test\n",
            "    api_key_name: LLM_RELAY_TEST_KEY_THAT_IS_NOT_SET\n",
        );
        let config = parse(&raw);
        assert!(matches!(
            config.llms[0].resolve_api_key(),
            Err(ConfigError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn free_group_detection_uses_summed_cost() {
        let mut upstream = parse(BASE).llms.remove(0);
        assert!(upstream.is_free());
        upstream.cost_input = 0.03;
        assert!(!upstream.is_free());
    }
}
