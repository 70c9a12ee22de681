use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("deadline exceeded while waiting for quota or upstream")]
    DeadlineExceeded,
}

pub type Result<T> = std::result::Result<T, RelayError>;
