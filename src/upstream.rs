//! Upstream HTTP relay.
//!
//! Forwards a buffered client request to the provider over pooled
//! keep-alive connections and hands the raw [`reqwest::Response`] back to
//! the handler, which decides between buffering and SSE streaming.
//!
//! Two clients are kept (the pattern from every streaming-capable gateway):
//! one with a per-attempt request timeout for buffered exchanges, one with
//! no total timeout for streams whose body arrives incrementally — the
//! connect timeout still applies to both. After three consecutive
//! connection hangups the pair is rebuilt, recycling the connection pool.
//!
//! Header policy: only an allowlist of end-to-end headers is forwarded.
//! Client auth is stripped and replaced with the selected key's credential
//! (provider-specific header), and a fresh `x-request-id` is minted per
//! attempt.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use reqwest::Client;

use crate::error::ErrorKind;
use crate::keypool::ApiKey;

/// End-to-end headers forwarded from the client request.
const FORWARDED_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "accept-encoding",
    "accept-language",
    "user-agent",
    "anthropic-version",
    "anthropic-beta",
];

/// Default `anthropic-version` when the client did not send one.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Consecutive hangups that trigger a connection-pool recycle.
const HANGUP_RECYCLE_THRESHOLD: u32 = 3;

/// How an upstream HTTP status is handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx — relay to the client.
    Success,
    /// 429 — cool the key and model, retry elsewhere.
    RateLimited,
    /// 5xx except 501 — count against the key, retry elsewhere.
    ServerError,
    /// Everything else (4xx, 501, 3xx) — relay verbatim, do not retry.
    ClientError,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 => StatusClass::RateLimited,
        501 => StatusClass::ClientError,
        500..=599 => StatusClass::ServerError,
        _ => StatusClass::ClientError,
    }
}

/// Map a transport failure into the error taxonomy.
///
/// reqwest does not expose a DNS variant, so resolution failures are
/// sniffed from the connect error's rendering; anything unrecognized in
/// the connect path counts as `connection_refused`, and a broken exchange
/// (reset, aborted body) as `socket_hangup`.
pub fn categorize_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    if err.is_connect() {
        let rendering = format!("{err:?}").to_lowercase();
        if rendering.contains("dns") {
            return ErrorKind::DnsFailure;
        }
        return ErrorKind::ConnectionRefused;
    }
    if err.is_body() || err.is_request() || err.is_decode() {
        return ErrorKind::SocketHangup;
    }
    ErrorKind::Other
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Origin including scheme, no trailing slash.
    pub target_host: String,
    /// Prefix prepended to every forwarded path.
    pub target_base_path: String,
    pub keep_alive_timeout: Duration,
    /// First-attempt timeout for buffered exchanges.
    pub initial_timeout: Duration,
    /// Per-attempt growth factor.
    pub timeout_multiplier: f64,
    pub max_timeout: Duration,
}

struct ClientPair {
    buffered: Client,
    streaming: Client,
}

/// Shared relay client. One per process.
pub struct UpstreamClient {
    config: UpstreamConfig,
    clients: RwLock<ClientPair>,
    consecutive_hangups: AtomicU32,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let clients = RwLock::new(build_clients(&config));
        Self { config, clients, consecutive_hangups: AtomicU32::new(0) }
    }

    /// Timeout for the given zero-based attempt index.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let grown = self.config.initial_timeout.as_millis() as f64
            * self.config.timeout_multiplier.powi(attempt as i32);
        Duration::from_millis(grown as u64).min(self.config.max_timeout)
    }

    /// Forward one attempt.
    ///
    /// `stream_hint` selects the no-timeout client for requests that asked
    /// for an SSE response. The per-attempt timeout still bounds buffered
    /// exchanges.
    pub async fn forward(
        &self,
        method: &Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
        body: Bytes,
        key: &ApiKey,
        attempt: u32,
        stream_hint: bool,
    ) -> Result<reqwest::Response, ErrorKind> {
        let url = format!(
            "{}{}{}",
            self.config.target_host, self.config.target_base_path, path_and_query
        );
        let headers = self.outbound_headers(client_headers, key);

        let client = {
            let pair = self.clients.read().expect("client lock poisoned");
            if stream_hint { pair.streaming.clone() } else { pair.buffered.clone() }
        };

        let mut request = client
            .request(method.clone(), &url)
            .headers(headers)
            .body(body);
        if !stream_hint {
            request = request.timeout(self.attempt_timeout(attempt));
        }

        match request.send().await {
            Ok(response) => {
                self.consecutive_hangups.store(0, Ordering::Relaxed);
                Ok(response)
            }
            Err(err) => {
                let kind = categorize_transport_error(&err);
                tracing::warn!(%url, error = %err, kind = %kind, "upstream attempt failed");
                if kind == ErrorKind::SocketHangup {
                    self.record_hangup();
                }
                Err(kind)
            }
        }
    }

    /// Build the outbound header set: allowlist, auth, fresh request id.
    fn outbound_headers(&self, client_headers: &HeaderMap, key: &ApiKey) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = client_headers.get(*name) {
                if let Ok(name) = axum::http::HeaderName::from_bytes(name.as_bytes()) {
                    headers.insert(name, value.clone());
                }
            }
        }

        match key.provider() {
            // Anthropic is the default dialect: key goes in x-api-key.
            None | Some("anthropic") => {
                if let Ok(value) = HeaderValue::from_str(key.credential()) {
                    headers.insert("x-api-key", value);
                }
                if !headers.contains_key("anthropic-version") {
                    headers.insert(
                        "anthropic-version",
                        HeaderValue::from_static(ANTHROPIC_VERSION),
                    );
                }
            }
            Some(_) => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key.credential())) {
                    headers.insert(axum::http::header::AUTHORIZATION, value);
                }
            }
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }

        headers
    }

    fn record_hangup(&self) {
        let count = self.consecutive_hangups.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= HANGUP_RECYCLE_THRESHOLD {
            self.consecutive_hangups.store(0, Ordering::Relaxed);
            let fresh = build_clients(&self.config);
            *self.clients.write().expect("client lock poisoned") = fresh;
            tracing::warn!(count, "recycled upstream connection pool after repeated hangups");
        }
    }
}

fn build_clients(config: &UpstreamConfig) -> ClientPair {
    let buffered = Client::builder()
        .pool_idle_timeout(config.keep_alive_timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build upstream client");
    // No request-level timeout for streaming — the response body arrives
    // incrementally. TCP connect timeout still applies.
    let streaming = Client::builder()
        .pool_idle_timeout(config.keep_alive_timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build streaming upstream client");
    ClientPair { buffered, streaming }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::{PoolCooldown, PoolCooldownConfig};
    use crate::keypool::{KeyPool, KeyPoolConfig};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn upstream_for(uri: &str) -> UpstreamClient {
        UpstreamClient::new(UpstreamConfig {
            target_host: uri.trim_end_matches('/').to_string(),
            target_base_path: String::new(),
            keep_alive_timeout: Duration::from_secs(30),
            initial_timeout: Duration::from_secs(5),
            timeout_multiplier: 2.0,
            max_timeout: Duration::from_secs(20),
        })
    }

    fn single_key(provider: Option<&str>) -> KeyPool {
        KeyPool::new(
            vec![("sk-test-credential".into(), provider.map(str::to_owned))],
            KeyPoolConfig::default(),
            Arc::new(PoolCooldown::new(PoolCooldownConfig::default())),
        )
    }

    // -----------------------------------------------------------------------
    // Status classification
    // -----------------------------------------------------------------------

    #[test]
    fn status_classes_follow_the_retry_table() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(204), StatusClass::Success);
        assert_eq!(classify_status(429), StatusClass::RateLimited);
        assert_eq!(classify_status(500), StatusClass::ServerError);
        assert_eq!(classify_status(503), StatusClass::ServerError);
        // 501 Not Implemented is permanent, never retried.
        assert_eq!(classify_status(501), StatusClass::ClientError);
        assert_eq!(classify_status(400), StatusClass::ClientError);
        assert_eq!(classify_status(404), StatusClass::ClientError);
    }

    // -----------------------------------------------------------------------
    // Timeout growth
    // -----------------------------------------------------------------------

    #[test]
    fn attempt_timeout_grows_and_caps() {
        let upstream = upstream_for("http://localhost:1");
        assert_eq!(upstream.attempt_timeout(0), Duration::from_secs(5));
        assert_eq!(upstream.attempt_timeout(1), Duration::from_secs(10));
        assert_eq!(upstream.attempt_timeout(2), Duration::from_secs(20));
        assert_eq!(upstream.attempt_timeout(5), Duration::from_secs(20), "capped");
    }

    // -----------------------------------------------------------------------
    // Forwarding & headers
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn forwards_body_and_allowlisted_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("content-type", "application/json"))
            .and(header("anthropic-beta", "tools-2024"))
            .and(header("x-api-key", "sk-test-credential"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server.uri());
        let pool = single_key(None);
        let (lease, _) = pool.acquire(None, false).unwrap();

        let mut client_headers = HeaderMap::new();
        client_headers.insert("content-type", HeaderValue::from_static("application/json"));
        client_headers.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        // Hop-by-hop and client auth must not reach upstream.
        client_headers.insert("authorization", HeaderValue::from_static("Bearer client-secret"));
        client_headers.insert("connection", HeaderValue::from_static("keep-alive"));

        let response = upstream
            .forward(
                &Method::POST,
                "/v1/messages",
                &client_headers,
                Bytes::from_static(b"{\"model\":\"m\"}"),
                lease.key(),
                0,
                false,
            )
            .await
            .expect("forward should succeed");
        assert_eq!(response.status(), 200);
        lease.complete_success(Duration::from_millis(1));
    }

    #[tokio::test]
    async fn client_auth_header_is_not_forwarded() {
        let server = MockServer::start().await;
        // The mock matches only when no authorization header is present.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server.uri());
        let pool = single_key(None);
        let (lease, _) = pool.acquire(None, false).unwrap();

        let mut client_headers = HeaderMap::new();
        client_headers.insert("authorization", HeaderValue::from_static("Bearer nope"));

        let response = upstream
            .forward(&Method::POST, "/v1/messages", &client_headers, Bytes::new(), lease.key(), 0, false)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let received = &server.received_requests().await.unwrap()[0];
        assert!(!received.headers.contains_key("authorization"));
        assert!(received.headers.contains_key("x-api-key"));
        assert!(received.headers.contains_key("x-request-id"));
        assert!(received.headers.contains_key("anthropic-version"));
        lease.complete_neutral();
    }

    #[tokio::test]
    async fn tagged_provider_gets_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-test-credential"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server.uri());
        let pool = single_key(Some("openai"));
        let (lease, _) = pool.acquire(None, false).unwrap();

        let response = upstream
            .forward(&Method::POST, "/v1/chat/completions", &HeaderMap::new(), Bytes::new(), lease.key(), 0, false)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        lease.complete_neutral();
    }

    #[tokio::test]
    async fn connect_failure_is_connection_refused() {
        // Nothing listens on this port.
        let upstream = upstream_for("http://127.0.0.1:9");
        let pool = single_key(None);
        let (lease, _) = pool.acquire(None, false).unwrap();

        let err = upstream
            .forward(&Method::POST, "/v1/messages", &HeaderMap::new(), Bytes::new(), lease.key(), 0, false)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorKind::ConnectionRefused);
        lease.complete_failure(err);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut upstream = upstream_for(&server.uri());
        upstream.config.initial_timeout = Duration::from_millis(50);
        let pool = single_key(None);
        let (lease, _) = pool.acquire(None, false).unwrap();

        let err = upstream
            .forward(&Method::POST, "/v1/messages", &HeaderMap::new(), Bytes::new(), lease.key(), 0, false)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorKind::Timeout);
        lease.complete_failure(err);
    }
}
