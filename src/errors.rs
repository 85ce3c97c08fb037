use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

// ----------------------
// Client-facing errors
// ----------------------

/// Errors that surface to the caller as a vendor-neutral error body.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no provider available: {0}")]
    NoProviderAvailable(String),

    #[error("all providers exhausted: {0}")]
    UpstreamExhausted(String),

    #[error("limit exceeded on {scope} per {window}: {detail}")]
    LimitExceeded {
        scope: String,
        window: &'static str,
        detail: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NoProviderAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamExhausted(_) => StatusCode::BAD_GATEWAY,
            RelayError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request_error",
            RelayError::NoProviderAvailable(_) => "no_provider_available",
            RelayError::UpstreamExhausted(_) => "upstream_exhausted",
            RelayError::LimitExceeded { .. } => "limit_exceeded",
            RelayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

// ----------------------
// Upstream errors
// ----------------------

/// Classification of an upstream attempt failure. `Transient`, `Auth` and
/// `RateLimited` drive failover; `Request` surfaces to the caller since the
/// upstream judged the request itself malformed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Transient,
    Auth,
    RateLimited,
    Request,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::Transient => "transient",
            UpstreamErrorKind::Auth => "auth",
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::Request => "request",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn timeout() -> Self {
        Self {
            kind: UpstreamErrorKind::Transient,
            message: "upstream timeout".to_string(),
            status: None,
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Transient,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Build from a non-success HTTP status and a body snippet.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let kind = classify_status(status);
        Self {
            kind,
            message: format!("upstream status {}: {}", status, sanitize_snippet(body)),
            status: Some(status),
            retry_after,
        }
    }
}

pub fn classify_status(status: u16) -> UpstreamErrorKind {
    match status {
        401 | 403 => UpstreamErrorKind::Auth,
        429 => UpstreamErrorKind::RateLimited,
        408 | 500..=599 => UpstreamErrorKind::Transient,
        _ => UpstreamErrorKind::Request,
    }
}

/// Trim an upstream body for logs and error payloads: control characters
/// stripped, length capped.
pub fn sanitize_snippet(body: &str) -> String {
    const MAX: usize = 200;
    let mut out = String::with_capacity(MAX.min(body.len()));
    for ch in body.chars() {
        if out.len() >= MAX {
            out.push('…');
            break;
        }
        if ch.is_control() {
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401), UpstreamErrorKind::Auth);
        assert_eq!(classify_status(403), UpstreamErrorKind::Auth);
        assert_eq!(classify_status(429), UpstreamErrorKind::RateLimited);
        assert_eq!(classify_status(500), UpstreamErrorKind::Transient);
        assert_eq!(classify_status(503), UpstreamErrorKind::Transient);
        assert_eq!(classify_status(408), UpstreamErrorKind::Transient);
        assert_eq!(classify_status(400), UpstreamErrorKind::Request);
        assert_eq!(classify_status(404), UpstreamErrorKind::Request);
    }

    #[test]
    fn snippets_are_bounded_and_printable() {
        let noisy = format!("bad\nthings\thappened{}", "x".repeat(400));
        let s = sanitize_snippet(&noisy);
        assert!(s.len() <= 204);
        assert!(!s.contains('\n'));
        assert!(!s.contains('\t'));
    }
}
