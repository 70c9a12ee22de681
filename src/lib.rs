//! llm-relay: an OpenAI-compatible gateway that spreads chat-completion
//! requests across rate-limited upstream LLM providers.
//!
//! The pool owns one request-per-minute and one token-per-minute bucket per
//! upstream, selects an upstream by exact model, group name, or round-robin
//! over everything, blocks only as long as the chosen upstream's quota
//! requires, and translates to and from Gemini's wire format when the
//! upstream is Google.

pub mod config;
mod error;
pub mod http;
pub mod limiter;
pub mod openai;
pub mod pool;
pub mod providers;
pub mod token_count;
pub mod upstream;
pub mod utils;

pub use config::{Config, ConfigError, GeneralConfig, Provider, UpstreamConfig};
pub use error::{RelayError, Result};
pub use limiter::{LimiterPair, TokenBucket};
pub use pool::{ModelLimiter, Pool, RelayRequest, Selection, FREE_GROUP};
pub use providers::{GoogleClient, OpenAiWireClient, UpstreamClient};
pub use upstream::Upstream;
