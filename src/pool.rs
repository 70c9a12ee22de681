//! The dispatch engine: upstream pool, selection policy, and the blocking
//! admission protocol that reserves quota before anything goes on the wire.
//!
//! Selection never blocks and holds the pool mutex only while inspecting
//! buckets and advancing the round-robin cursor. Dispatch owns all blocking:
//! it waits on the request and token buckets (request bucket first, so a
//! caller with a huge token demand cannot starve callers that want a single
//! request slot) and then performs the upstream call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::limiter::LimiterPair;
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::upstream::Upstream;
use crate::{RelayError, Result};

/// Group name attached to upstreams whose summed cost is zero.
pub const FREE_GROUP: &str = "free";

/// A chat-completion request plus the token estimate the front-end computed
/// for it.
pub struct RelayRequest {
    pub request: ChatCompletionRequest,
    pub tokens_needed: u32,
}

/// One upstream together with its limiter pair.
#[derive(Debug)]
pub struct ModelLimiter {
    pub upstream: Upstream,
    pub limiters: LimiterPair,
}

/// Outcome of selection: the chosen upstream and whether the request slot
/// was already consumed while selecting. Dispatch uses the flag to keep the
/// observable consumption at exactly one request slot per dispatch.
#[derive(Debug)]
pub struct Selection {
    limiter: Arc<ModelLimiter>,
    request_reserved: bool,
}

impl Selection {
    pub fn model(&self) -> &str {
        &self.limiter.upstream.model
    }

    pub fn upstream(&self) -> &Upstream {
        &self.limiter.upstream
    }
}

pub struct Pool {
    limiters: HashMap<String, Arc<ModelLimiter>>,
    models: Vec<String>,
    groups: HashMap<String, Vec<String>>,
    default_limiter: Arc<ModelLimiter>,
    next: Mutex<usize>,
    default_timeout: Duration,
}

impl Pool {
    /// Build the pool from validated upstreams. The first upstream with the
    /// highest quality becomes the default model.
    ///
    /// # Panics
    ///
    /// Panics when `upstreams` is empty; config validation rejects that
    /// before a pool is ever built.
    pub fn new(upstreams: Vec<Upstream>, default_timeout: Duration) -> Self {
        assert!(!upstreams.is_empty(), "pool requires at least one upstream");

        let mut limiters = HashMap::<String, Arc<ModelLimiter>>::new();
        let mut models = Vec::<String>::with_capacity(upstreams.len());
        let mut groups = HashMap::<String, Vec<String>>::new();
        let mut default: Option<Arc<ModelLimiter>> = None;

        for upstream in upstreams {
            let model = upstream.model.clone();

            let mut memberships = vec![upstream.provider.as_str().to_string()];
            if upstream.is_free() {
                memberships.push(FREE_GROUP.to_string());
            }
            memberships.extend(upstream.groups.iter().cloned());
            for group in memberships {
                groups.entry(group).or_default().push(model.clone());
            }

            let limiter = Arc::new(ModelLimiter {
                limiters: LimiterPair::new(
                    upstream.requests_per_minute,
                    upstream.tokens_per_minute,
                ),
                upstream,
            });

            let higher_quality = default
                .as_ref()
                .is_none_or(|current| limiter.upstream.quality > current.upstream.quality);
            if higher_quality {
                default = Some(limiter.clone());
            }

            models.push(model.clone());
            limiters.insert(model, limiter);
        }

        let default_limiter = default.expect("nonempty upstream list yields a default");

        Self {
            limiters,
            models,
            groups,
            default_limiter,
            next: Mutex::new(0),
            default_timeout,
        }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.limiters.contains_key(model)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn default_model(&self) -> &str {
        &self.default_limiter.upstream.model
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Upstream> {
        self.models
            .iter()
            .filter_map(|model| self.limiters.get(model))
            .map(|limiter| &limiter.upstream)
    }

    /// Direct routing: the named model regardless of current availability.
    /// Consumes no quota; dispatch blocks on the limiters as needed.
    pub fn assign(&self, model: &str) -> Result<Selection> {
        let limiter = self
            .limiters
            .get(model)
            .cloned()
            .ok_or_else(|| RelayError::UnknownModel(model.to_string()))?;
        Ok(Selection {
            limiter,
            request_reserved: false,
        })
    }

    /// Round-robin over a group's members; falls back to the group's first
    /// member when none is currently eligible.
    pub fn pick_group(&self, tokens_needed: u32, group: &str) -> Result<Selection> {
        let members = self
            .groups
            .get(group)
            .ok_or_else(|| RelayError::UnknownModel(group.to_string()))?;
        if let Some(selection) = self.pick_eligible(tokens_needed, members) {
            return Ok(selection);
        }
        self.assign(&members[0])
    }

    /// Round-robin over every configured model; falls back to the default
    /// (highest-quality) model when none is currently eligible.
    pub fn pick_any(&self, tokens_needed: u32) -> Selection {
        if let Some(selection) = self.pick_eligible(tokens_needed, &self.models) {
            return selection;
        }
        Selection {
            limiter: self.default_limiter.clone(),
            request_reserved: false,
        }
    }

    /// The round-robin scan shared by `pick_group` and `pick_any`.
    ///
    /// Eligibility requires headroom on all three axes; the availability
    /// checks run before the consuming `try_take(1)` so a rejected candidate
    /// never loses a request slot. Only the token *level* is inspected here:
    /// the token budget itself is reserved during dispatch.
    fn pick_eligible(&self, tokens_needed: u32, candidates: &[String]) -> Option<Selection> {
        let mut next = self
            .next
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let len = candidates.len();
        let start = *next % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let Some(limiter) = self.limiters.get(&candidates[idx]) else {
                continue;
            };
            if tokens_needed >= limiter.upstream.context_length {
                continue;
            }
            if limiter.limiters.tokens.level() < f64::from(tokens_needed) {
                continue;
            }
            if !limiter.limiters.requests.try_take(1.0) {
                continue;
            }
            *next = idx + 1;
            return Some(Selection {
                limiter: limiter.clone(),
                request_reserved: true,
            });
        }
        None
    }

    /// Reserve quota (blocking as needed) and perform the upstream call.
    /// Quota consumed before a failure is not refunded.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        selection: Selection,
        request: &RelayRequest,
    ) -> Result<ChatCompletionResponse> {
        match tokio::time::timeout(
            self.default_timeout,
            self.dispatch_inner(cancel, &selection, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::DeadlineExceeded),
        }
    }

    async fn dispatch_inner(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
        request: &RelayRequest,
    ) -> Result<ChatCompletionResponse> {
        let pair = &selection.limiter.limiters;
        if !selection.request_reserved {
            pair.requests.wait_take(1.0, cancel).await?;
        }
        pair.tokens
            .wait_take(f64::from(request.tokens_needed), cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let upstream = &selection.limiter.upstream;
        tracing::debug!(
            model = %upstream.model,
            provider = upstream.provider.as_str(),
            tokens_needed = request.tokens_needed,
            "dispatching to upstream"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = upstream.client.post_chat_completion(&request.request, &upstream.model) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::openai::Message;

    fn upstream(model: &str, quality: i32, rpm: u32, tpm: u32, context: u32) -> Upstream {
        let config: UpstreamConfig = serde_yaml::from_str(&format!(
            r#"
provider: openai
model: {model}
base_url: "http://127.0.0.1:9"
requests_per_minute: {rpm}
tokens_per_minute: {tpm}
context_length: {context}
api_key: sk-test
quality: {quality}
groups: [pair]
"#
        ))
        .expect("config");
        Upstream::from_config(&config).expect("upstream")
    }

    fn pool_of_two() -> Pool {
        Pool::new(
            vec![
                upstream("model-a", 10, 60, 1000, 2048),
                upstream("model-b", 5, 60, 1000, 2048),
            ],
            Duration::from_secs(90),
        )
    }

    fn relay_request(tokens_needed: u32) -> RelayRequest {
        RelayRequest {
            request: ChatCompletionRequest {
                messages: vec![Message::new("user", "hi")],
                ..Default::default()
            },
            tokens_needed,
        }
    }

    fn drain_requests(pool: &Pool, model: &str) {
        let limiter = pool.limiters.get(model).expect("model");
        while limiter.limiters.requests.try_take(1.0) {}
    }

    #[tokio::test]
    async fn assign_routes_directly_without_consuming_quota() {
        let pool = pool_of_two();
        let selection = pool.assign("model-b").expect("assign");
        assert_eq!(selection.model(), "model-b");
        assert!(!selection.request_reserved);

        let limiter = pool.limiters.get("model-b").expect("model");
        assert!(limiter.limiters.requests.level() > 59.0);
    }

    #[tokio::test]
    async fn assign_unknown_model_errors() {
        let pool = pool_of_two();
        let err = pool.assign("missing").expect_err("unknown");
        assert!(matches!(err, RelayError::UnknownModel(name) if name == "missing"));
    }

    #[tokio::test]
    async fn successive_selections_rotate_over_candidates() {
        let pool = pool_of_two();
        let first = pool.pick_any(100);
        let second = pool.pick_any(100);
        assert!(first.request_reserved);
        assert!(second.request_reserved);
        assert_ne!(first.model(), second.model());

        let third = pool.pick_any(100);
        assert_eq!(third.model(), first.model());
    }

    #[tokio::test]
    async fn selection_consumes_exactly_one_request_slot() {
        let pool = pool_of_two();
        let selection = pool.pick_any(100);
        let limiter = pool.limiters.get(selection.model()).expect("model");
        let level = limiter.limiters.requests.level();
        assert!(level <= 59.0 + 1e-6, "level was {level}");
        assert!(level > 58.0, "level was {level}");
    }

    #[tokio::test]
    async fn candidates_over_context_length_are_skipped() {
        let pool = Pool::new(
            vec![
                upstream("small", 10, 60, 100_000, 512),
                upstream("large", 5, 60, 100_000, 65_536),
            ],
            Duration::from_secs(90),
        );
        for _ in 0..4 {
            let selection = pool.pick_any(4096);
            assert_eq!(selection.model(), "large");
        }
    }

    #[tokio::test]
    async fn candidates_below_token_level_are_skipped_without_deduction() {
        let pool = pool_of_two();
        let first = pool.limiters.get("model-a").expect("model");
        assert!(first.limiters.tokens.try_take(980.0));

        let selection = pool.pick_any(100);
        assert_eq!(selection.model(), "model-b");

        // The skipped candidate keeps both its request slot and its tokens.
        assert!(first.limiters.requests.level() > 59.0);
    }

    #[tokio::test]
    async fn pick_any_falls_back_to_highest_quality_when_drained() {
        let pool = pool_of_two();
        drain_requests(&pool, "model-a");
        drain_requests(&pool, "model-b");

        let selection = pool.pick_any(100);
        assert_eq!(selection.model(), "model-a");
        assert!(!selection.request_reserved);
        assert_eq!(pool.default_model(), "model-a");
    }

    #[tokio::test]
    async fn pick_group_falls_back_to_first_member_when_drained() {
        let pool = pool_of_two();
        drain_requests(&pool, "model-a");
        drain_requests(&pool, "model-b");

        let selection = pool.pick_group(100, "pair").expect("group");
        assert_eq!(selection.model(), "model-a");
        assert!(!selection.request_reserved);
    }

    #[tokio::test]
    async fn pick_group_unknown_group_errors() {
        let pool = pool_of_two();
        assert!(pool.pick_group(100, "nope").is_err());
    }

    #[tokio::test]
    async fn groups_contain_provider_free_and_configured_names() {
        let pool = pool_of_two();
        assert!(pool.has_group("openai"));
        assert!(pool.has_group(FREE_GROUP));
        assert!(pool.has_group("pair"));
        assert_eq!(
            pool.groups.get("pair").map(Vec::len),
            Some(2),
            "configured group holds both members"
        );
    }

    #[tokio::test]
    async fn dispatch_returns_cancelled_before_reaching_upstream() {
        let pool = pool_of_two();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let selection = pool.assign("model-a").expect("assign");
        let err = pool
            .dispatch(&cancel, selection, &relay_request(100))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, RelayError::Cancelled));

        // Nothing was reserved on behalf of the cancelled caller.
        let limiter = pool.limiters.get("model-a").expect("model");
        assert!(limiter.limiters.requests.level() > 59.0);
        assert!(limiter.limiters.tokens.level() > 999.0);
    }

    #[tokio::test]
    async fn fallback_dispatch_waits_for_refill_before_the_upstream_call() {
        let pool = pool_of_two();
        drain_requests(&pool, "model-a");
        drain_requests(&pool, "model-b");

        let selection = pool.pick_any(100);
        assert_eq!(selection.model(), "model-a");

        // The fallback blocks on the request bucket (~1s of refill at 60
        // rpm) and only then reaches the unroutable upstream address.
        let started = std::time::Instant::now();
        let err = pool
            .dispatch(&CancellationToken::new(), selection, &relay_request(10))
            .await
            .expect_err("unreachable upstream");
        assert!(matches!(err, RelayError::Http(_)), "got {err}");
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out_when_quota_cannot_accumulate() {
        let pool = Pool::new(
            vec![upstream("model-a", 10, 60, 100, 65_536)],
            Duration::from_secs(2),
        );
        let cancel = CancellationToken::new();
        let selection = pool.assign("model-a").expect("assign");

        // Demands more than one minute of token credit; the deadline fires
        // long before the bucket can satisfy it.
        let err = pool
            .dispatch(&cancel, selection, &relay_request(101))
            .await
            .expect_err("deadline");
        assert!(matches!(err, RelayError::DeadlineExceeded));
    }
}
