//! Error types for the backend and price-feed clients.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("HTTP error: {status_code} - {message}")]
    Http { status_code: u16, message: String },

    #[error("Rate limited (retry after {retry_after}s)")]
    RateLimited { retry_after: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Missing field in response: {0}")]
    MissingField(&'static str),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Build an error from a non-success response.
    ///
    /// The backend wraps failures as `{"error": "..."}` or
    /// `{"error": {"message": "..."}}`; anything else keeps the raw body.
    pub fn from_response(status_code: u16, body: &str) -> Self {
        if status_code == 429 {
            return Self::RateLimited { retry_after: 1 };
        }

        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|json| {
                let error = json.get("error").unwrap_or(&json);
                error
                    .as_str()
                    .or_else(|| error.get("message").and_then(|v| v.as_str()))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.to_string());

        Self::Http {
            status_code,
            message,
        }
    }

    /// Whether this failure may clear up on a later attempt.
    ///
    /// Client errors other than 408/429 mean the request itself is wrong
    /// (unknown order, bad token) and repeating it cannot help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::Deserialization(_)
            | Self::MissingField(_) => true,
            Self::Http { status_code, .. } => {
                matches!(status_code, 408 | 429 | 500..=599)
            }
            Self::InvalidUrl(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Deserialization(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}
