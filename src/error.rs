use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub type PollResult<T> = Result<T, PollError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Poll not found")]
    NotFound,

    #[error("Poll is no longer active")]
    PollClosed,

    #[error("Option does not belong to this poll")]
    InvalidOption,

    #[error("Too many requests, please try again later")]
    RateLimited,

    #[error("{0}")]
    Unauthenticated(String),

    #[error("Vote identity does not match the connection identity")]
    IdentityMismatch,

    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("Misconfigured: {0}")]
    Fatal(String),
}

impl PollError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PollError::InvalidInput(message.into())
    }

    /// Stable identifier sent to clients next to the human readable message.
    pub fn code(&self) -> &'static str {
        match self {
            PollError::InvalidInput(_) => "invalid_input",
            PollError::NotFound => "not_found",
            PollError::PollClosed => "poll_closed",
            PollError::InvalidOption => "invalid_option",
            PollError::RateLimited => "rate_limited",
            PollError::Unauthenticated(_) => "unauthenticated",
            PollError::IdentityMismatch => "identity_mismatch",
            PollError::Transient(_) => "transient",
            PollError::Fatal(_) => "fatal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::Transient(_))
    }
}

impl From<sqlx::Error> for PollError {
    fn from(err: sqlx::Error) -> Self {
        PollError::Transient(format!("store: {err}"))
    }
}

impl From<redis::RedisError> for PollError {
    fn from(err: redis::RedisError) -> Self {
        PollError::Transient(format!("redis: {err}"))
    }
}

impl From<serde_json::Error> for PollError {
    fn from(err: serde_json::Error) -> Self {
        PollError::Transient(format!("encoding: {err}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl From<&PollError> for ErrorBody {
    fn from(err: &PollError) -> Self {
        ErrorBody {
            error: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}

impl ResponseError for PollError {
    fn status_code(&self) -> StatusCode {
        match self {
            PollError::InvalidInput(_) | PollError::InvalidOption => StatusCode::BAD_REQUEST,
            PollError::NotFound => StatusCode::NOT_FOUND,
            PollError::PollClosed => StatusCode::CONFLICT,
            PollError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            PollError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            PollError::IdentityMismatch => StatusCode::FORBIDDEN,
            PollError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            PollError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody::from(self))
    }
}

/// Runs an I/O bound call with an upper bound on how long it may suspend.
pub async fn bounded<T, F>(limit: Duration, what: &'static str, fut: F) -> PollResult<T>
where
    F: Future<Output = PollResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PollError::Transient(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(PollError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(PollError::PollClosed.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            PollError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PollError::Transient("db".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[actix_rt::test]
    async fn bounded_reports_timeout_as_transient() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, PollError>(())
        };
        let err = bounded(Duration::from_millis(10), "slow call", slow)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("slow call"));
    }
}
