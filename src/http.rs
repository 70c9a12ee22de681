//! The HTTP front-end: decodes OpenAI chat-completion requests, estimates
//! their token demand, routes them through the pool, and encodes the result.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::openai::{ChatCompletionRequest, Model, ModelList};
use crate::pool::{Pool, RelayRequest, Selection};
use crate::token_count;
use crate::RelayError;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("invalid request body: {err}"),
            );
        }
    };

    if request.stream == Some(true) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "streaming responses are not supported",
        );
    }
    if let Err(err) = request.stop_sequences() {
        return relay_error_response(err);
    }

    let tokens_needed = token_count::estimate_input_tokens(&request)
        .unwrap_or_else(|| token_count::heuristic_tokens(body.len()));

    let selection = match select(&state.pool, &request.model, tokens_needed) {
        Ok(selection) => selection,
        Err(err) => return relay_error_response(err),
    };

    tracing::info!(
        requested = %request.model,
        selected = selection.model(),
        tokens_needed,
        "routing chat completion"
    );

    let relay_request = RelayRequest {
        request,
        tokens_needed,
    };
    let cancel = CancellationToken::new();
    match state.pool.dispatch(&cancel, selection, &relay_request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => relay_error_response(err),
    }
}

/// Routing on the request's `model` field: a configured model dispatches
/// directly, a configured group round-robins inside the group, anything else
/// round-robins over the whole pool.
fn select(pool: &Pool, model: &str, tokens_needed: u32) -> crate::Result<Selection> {
    if pool.has_model(model) {
        pool.assign(model)
    } else if pool.has_group(model) {
        pool.pick_group(tokens_needed, model)
    } else {
        Ok(pool.pick_any(tokens_needed))
    }
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(models_response(&state.pool))
}

fn models_response(pool: &Pool) -> ModelList {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);

    ModelList {
        object: "list".to_string(),
        data: pool
            .upstreams()
            .map(|upstream| Model {
                id: upstream.model.clone(),
                object: "model".to_string(),
                created,
                owned_by: upstream.provider.as_str().to_string(),
            })
            .collect(),
    }
}

fn relay_error_response(err: RelayError) -> Response {
    let (status, kind) = match &err {
        RelayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        RelayError::UnknownModel(_) => (StatusCode::NOT_FOUND, "invalid_request_error"),
        RelayError::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
        RelayError::Api { .. } | RelayError::Http(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        RelayError::Json(_) | RelayError::InvalidResponse(_) => {
            (StatusCode::BAD_GATEWAY, "upstream_error")
        }
        RelayError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled"),
    };
    tracing::warn!(status = status.as_u16(), error = %err, "request failed");
    error_response(status, kind, &err.to_string())
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": { "message": message, "type": kind }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::upstream::Upstream;
    use std::time::Duration;

    fn pool() -> Pool {
        let config: UpstreamConfig = serde_yaml::from_str(
            r#"
provider: groq
model: llama-3.1-8b
base_url: "http://127.0.0.1:9"
requests_per_minute: 60
tokens_per_minute: 1000
api_key: sk-test
quality: 3
"#,
        )
        .expect("config");
        Pool::new(
            vec![Upstream::from_config(&config).expect("upstream")],
            Duration::from_secs(90),
        )
    }

    #[tokio::test]
    async fn models_listing_exposes_ids_without_secrets() {
        let listing = models_response(&pool());
        assert_eq!(listing.object, "list");
        assert_eq!(listing.data.len(), 1);
        assert_eq!(listing.data[0].id, "llama-3.1-8b");
        assert_eq!(listing.data[0].owned_by, "groq");

        let raw = serde_json::to_string(&listing).expect("serialize");
        assert!(!raw.contains("sk-test"));
    }

    #[tokio::test]
    async fn select_prefers_model_then_group_then_any() {
        let pool = pool();
        let direct = select(&pool, "llama-3.1-8b", 10).expect("direct");
        assert_eq!(direct.model(), "llama-3.1-8b");

        let grouped = select(&pool, "groq", 10).expect("group");
        assert_eq!(grouped.model(), "llama-3.1-8b");

        let any = select(&pool, "whatever", 10).expect("any");
        assert_eq!(any.model(), "llama-3.1-8b");
    }

    #[tokio::test]
    async fn invalid_request_maps_to_bad_request() {
        let response = relay_error_response(RelayError::InvalidRequest(
            "unsupported stop type: 42".to_string(),
        ));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_model_maps_to_not_found() {
        let response = relay_error_response(RelayError::UnknownModel("x".to_string()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deadline_maps_to_gateway_timeout() {
        let response = relay_error_response(RelayError::DeadlineExceeded);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
