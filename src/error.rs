//! Error taxonomy and HTTP error types.
//!
//! Every failure the dispatch pipeline can produce is classified as an
//! [`ErrorKind`]. The kind determines three things:
//!
//! - whether the retry loop may try again ([`ErrorKind::retryable`]),
//! - whether the failure counts against a key's circuit breaker
//!   ([`ErrorKind::counts_against_circuit`]),
//! - which HTTP status the client ultimately sees when the request cannot
//!   be served ([`Rejection`]).
//!
//! Handlers that fail for reasons outside the taxonomy (serialization bugs,
//! lock poisoning) return [`AppError`], which wraps [`anyhow::Error`] and
//! converts into a 500 automatically.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Classification of a request failure.
///
/// Serialized names (snake_case) appear in traces, logs, and 503 bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Upstream or transport deadline exceeded.
    Timeout,
    /// Connection closed mid-exchange.
    SocketHangup,
    /// TCP connect refused.
    ConnectionRefused,
    /// Name resolution failed.
    DnsFailure,
    /// Upstream HTTP 5xx (except 501).
    ServerError,
    /// Upstream HTTP 429.
    RateLimited,
    /// Upstream HTTP 4xx other than 429, or a malformed client request.
    BadRequest,
    /// Admission rejected: queue at capacity.
    QueueFull,
    /// Admission rejected: queued past its deadline.
    QueueTimeout,
    /// No key currently selectable (all busy, cooling, or open).
    PoolExhausted,
    /// Pool-wide cooldown after an upstream 429 storm.
    PoolCooldown,
    /// No key configured for the requested provider.
    ProviderNoKeysConfigured,
    /// Proxy is shutting down.
    Shutdown,
    /// Transport failure that fits no other category.
    Other,
}

impl ErrorKind {
    /// Whether the retry loop may attempt the request again.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::SocketHangup
                | Self::ConnectionRefused
                | Self::DnsFailure
                | Self::ServerError
                | Self::RateLimited
                | Self::PoolExhausted
                | Self::PoolCooldown
        )
    }

    /// Whether this failure advances a key's consecutive-failure counter.
    ///
    /// Only genuine upstream failures do. Local admission outcomes and
    /// client-side errors say nothing about the key's health.
    pub fn counts_against_circuit(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::SocketHangup
                | Self::ConnectionRefused
                | Self::DnsFailure
                | Self::ServerError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::SocketHangup => "socket_hangup",
            Self::ConnectionRefused => "connection_refused",
            Self::DnsFailure => "dns_failure",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::BadRequest => "bad_request",
            Self::QueueFull => "queue_full",
            Self::QueueTimeout => "queue_timeout",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolCooldown => "pool_cooldown",
            Self::ProviderNoKeysConfigured => "provider_no_keys_configured",
            Self::Shutdown => "shutdown",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal request rejection, rendered as a JSON error body.
///
/// `retry_after` is included (body field plus `retry-after` header, whole
/// seconds, rounded up) only when a wait estimate exists — pool cooldown
/// being the main producer. Non-retryable rejections never carry one.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Rejection {
    pub kind: ErrorKind,
    pub retry_after: Option<Duration>,
}

impl Rejection {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, retry_after: None }
    }

    pub fn with_retry_after(kind: ErrorKind, retry_after: Duration) -> Self {
        Self { kind, retry_after: Some(retry_after) }
    }

    /// HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // Upstream kept failing through the whole retry budget.
            ErrorKind::ServerError
            | ErrorKind::SocketHangup
            | ErrorKind::ConnectionRefused
            | ErrorKind::DnsFailure
            | ErrorKind::Other => StatusCode::BAD_GATEWAY,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::QueueFull
            | ErrorKind::QueueTimeout
            | ErrorKind::PoolExhausted
            | ErrorKind::PoolCooldown
            | ErrorKind::ProviderNoKeysConfigured
            | ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut body = json!({
            "errorType": self.kind.as_str(),
            "retryable": self.kind.retryable(),
        });
        if let Some(wait) = self.retry_after {
            let secs = wait.as_secs_f64().ceil().max(1.0) as u64;
            body["retryAfter"] = json!(secs);
            let mut response = (self.status(), Json(body)).into_response();
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
            response
        } else {
            (self.status(), Json(body)).into_response()
        }
    }
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any type that implements `Into<anyhow::Error>` (which includes `io::Error`,
/// `reqwest::Error`, and any `#[derive(thiserror::Error)]` type) can be
/// converted into an [`AppError`] via the blanket [`From`] implementation.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_matches_taxonomy() {
        let retryable = [
            ErrorKind::Timeout,
            ErrorKind::SocketHangup,
            ErrorKind::ConnectionRefused,
            ErrorKind::DnsFailure,
            ErrorKind::ServerError,
            ErrorKind::RateLimited,
            ErrorKind::PoolExhausted,
            ErrorKind::PoolCooldown,
        ];
        for kind in retryable {
            assert!(kind.retryable(), "{kind} should be retryable");
        }

        let terminal = [
            ErrorKind::BadRequest,
            ErrorKind::QueueFull,
            ErrorKind::QueueTimeout,
            ErrorKind::ProviderNoKeysConfigured,
            ErrorKind::Shutdown,
            ErrorKind::Other,
        ];
        for kind in terminal {
            assert!(!kind.retryable(), "{kind} should not be retryable");
        }
    }

    #[test]
    fn only_upstream_failures_count_against_circuit() {
        assert!(ErrorKind::Timeout.counts_against_circuit());
        assert!(ErrorKind::ServerError.counts_against_circuit());
        // Local classifications never count.
        assert!(!ErrorKind::QueueTimeout.counts_against_circuit());
        assert!(!ErrorKind::BadRequest.counts_against_circuit());
        assert!(!ErrorKind::RateLimited.counts_against_circuit());
    }

    #[test]
    fn rejection_maps_admission_kinds_to_503() {
        for kind in [
            ErrorKind::QueueFull,
            ErrorKind::QueueTimeout,
            ErrorKind::PoolExhausted,
            ErrorKind::PoolCooldown,
            ErrorKind::ProviderNoKeysConfigured,
            ErrorKind::Shutdown,
        ] {
            assert_eq!(Rejection::new(kind).status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[test]
    fn rejection_maps_deadline_to_504_and_upstream_to_502() {
        assert_eq!(Rejection::new(ErrorKind::Timeout).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(Rejection::new(ErrorKind::ServerError).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn rejection_body_includes_retry_after_only_when_present() {
        let with =
            Rejection::with_retry_after(ErrorKind::PoolCooldown, Duration::from_millis(2500));
        let response = with.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
            Some("3"),
            "2500ms rounds up to 3s"
        );

        let without = Rejection::new(ErrorKind::QueueFull).into_response();
        assert!(without.headers().get("retry-after").is_none());
    }
}
