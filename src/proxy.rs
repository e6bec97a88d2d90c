//! Request handler — parse, admit, route, acquire, forward, retry, relay.
//!
//! One public entry point, [`proxy_handler`], wired as the catch-all
//! `/v1/{*path}` route. The flow per request:
//!
//! 1. Buffer the body (bounded; oversize is 413 before anything else).
//! 2. Extract routing features from the JSON body when there is one.
//! 3. Admission: over `max_in_flight` the request queues (FIFO) and waits
//!    for a slot or times out.
//! 4. Model routing reserves a tier slot (when routing is enabled).
//! 5. The attempt loop picks a key, forwards upstream, classifies the
//!    outcome, and retries transient failures on other keys until the
//!    budget runs out. A 429'd model may be swapped mid-request when the
//!    tier strategy permits; the old slot is always released before the
//!    new one is taken.
//! 6. 2xx responses relay to the client — SSE chunk-by-chunk with no
//!    buffering, everything else buffered. Non-429 4xx relay verbatim.
//!
//! Every exit path finalizes the request trace and releases whatever
//! leases are held; the SSE path carries its leases inside the relay
//! stream so they are released when the stream closes (or the client
//! disconnects).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::config::{Config, TierStrategy};
use crate::cooldown::PoolCooldown;
use crate::error::{ErrorKind, Rejection};
use crate::keypool::{AcquireError, KeyLease, KeyPool};
use crate::queue::BackpressureQueue;
use crate::router::{ModelLease, ModelRouter, RequestFeatures, RouteDecision, RouteOutcome};
use crate::trace::{AttemptRecord, RequestTrace, TraceLog};
use crate::upstream::{classify_status, StatusClass, UpstreamClient, UpstreamConfig};

/// Pool-cooldown waits at or below this are slept through in-request;
/// longer ones are surfaced to the client as a 503 with `retry-after`.
const SHORT_COOLDOWN_WAIT: Duration = Duration::from_millis(250);

/// Brief pause before re-trying key acquisition on `pool_exhausted`.
const EXHAUSTED_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Hop-by-hop headers never relayed from the upstream response.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Everything a request handler needs, owned for the process lifetime.
pub struct ProxyState {
    pub config: Arc<Config>,
    pub pool: KeyPool,
    pub router: Arc<ModelRouter>,
    pub upstream: UpstreamClient,
    pub traces: Arc<TraceLog>,
    pub queue: BackpressureQueue,
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    shutdown_notify: tokio::sync::Notify,
    pub started_at: Instant,
}

impl ProxyState {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let cooldown = Arc::new(PoolCooldown::new(config.pool_cooldown_config()));
        let pool = KeyPool::new(
            config
                .api_keys
                .iter()
                .map(|entry| {
                    (entry.credential().to_string(), entry.provider().map(str::to_owned))
                })
                .collect(),
            config.keypool_config(),
            cooldown,
        );
        let router = Arc::new(ModelRouter::new(config.model_routing.clone()));
        let upstream = UpstreamClient::new(UpstreamConfig {
            target_host: config.target_host.trim_end_matches('/').to_string(),
            target_base_path: config.target_base_path.clone(),
            keep_alive_timeout: Duration::from_millis(config.keep_alive_timeout_ms),
            initial_timeout: Duration::from_millis(config.adaptive_timeout.initial_ms),
            timeout_multiplier: config.adaptive_timeout.multiplier,
            max_timeout: Duration::from_millis(config.adaptive_timeout.max_ms),
        });
        let traces = Arc::new(TraceLog::new(config.trace_capacity));
        let queue = BackpressureQueue::new(config.queue_max_size);

        Arc::new(Self {
            config,
            pool,
            router,
            upstream,
            traces,
            queue,
            in_flight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: tokio::sync::Notify::new(),
            started_at: Instant::now(),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop admitting, clear the queue. In-flight requests keep draining.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.queue.clear(ErrorKind::Shutdown);
        self.shutdown_notify.notify_waiters();
        tracing::info!("admission closed, draining in-flight requests");
    }

    /// Resolves once [`begin_shutdown`][Self::begin_shutdown] has run.
    pub async fn shutdown_begun(&self) {
        let notified = self.shutdown_notify.notified();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    pub fn requests_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take an admission slot, queueing behind earlier arrivals when the
    /// proxy is at `max_in_flight`.
    async fn admit(self: &Arc<Self>) -> Result<AdmissionPermit, Rejection> {
        if self.is_shutting_down() {
            return Err(Rejection::new(ErrorKind::Shutdown));
        }
        loop {
            // Fresh arrivals may only slip in while nobody is queued,
            // otherwise they would jump the FIFO order.
            if self.queue.is_empty() {
                let current = self.in_flight.load(Ordering::Acquire);
                if current < self.config.max_in_flight {
                    if self
                        .in_flight
                        .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(AdmissionPermit { state: Arc::clone(self), from_queue: false });
                    }
                    continue; // lost the race, re-check
                }
            }

            let pending = self.queue.try_enqueue().map_err(Rejection::new)?;

            // A slot may have freed between the capacity check and the
            // enqueue; that release signalled an empty queue, so the wakeup
            // is gone. Recheck once as the queue head to close the window.
            if self.queue.len() == 1 {
                let current = self.in_flight.load(Ordering::Acquire);
                if current < self.config.max_in_flight
                    && self
                        .in_flight
                        .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    if self.queue.cancel(pending.id()) {
                        return Ok(AdmissionPermit { state: Arc::clone(self), from_queue: false });
                    }
                    // A grant raced the cancel; wait() below sees it.
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }

            return match pending.wait(self.config.queue_timeout()).await {
                Ok(()) => {
                    // The releasing request decremented before signalling,
                    // so this slot is ours outright.
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    Ok(AdmissionPermit { state: Arc::clone(self), from_queue: true })
                }
                Err(kind) => Err(Rejection::new(kind)),
            };
        }
    }
}

/// Held for the lifetime of an admitted request; releasing it hands the
/// slot to the queue head.
struct AdmissionPermit {
    state: Arc<ProxyState>,
    from_queue: bool,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.state.queue.signal_slot_available();
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// The catch-all proxy endpoint.
pub async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned());

    let mut trace = RequestTrace::new(uuid::Uuid::new_v4().to_string(), parts.uri.path());

    // 1. Bounded body buffering. Oversize never touches a key.
    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            trace.finalize(Some(StatusCode::PAYLOAD_TOO_LARGE.as_u16()));
            state.traces.push(trace);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(serde_json::json!({ "error": "payload too large" })),
            )
                .into_response();
        }
    };

    // 2. Feature extraction; a non-JSON or unparseable body falls back to
    // passthrough with no routing.
    let json_body = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(true);
    let parsed: Option<Value> =
        if json_body { serde_json::from_slice(&body_bytes).ok() } else { None };
    let features = parsed.as_ref().map(RequestFeatures::extract).unwrap_or_default();
    let stream_hint = parsed
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || parts
            .headers
            .get("accept")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/event-stream"));

    trace.client_model = features.model.clone();

    let deadline = Instant::now() + state.config.request_timeout();

    // 3. Admission.
    let permit = match state.admit().await {
        Ok(permit) => permit,
        Err(rejection) => return finish_rejected(&state, trace, rejection),
    };

    dispatch(
        state,
        permit,
        parts.method,
        path_and_query,
        parts.headers,
        body_bytes,
        parsed,
        features,
        stream_hint,
        trace,
        deadline,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: Arc<ProxyState>,
    permit: AdmissionPermit,
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    mut body: Bytes,
    mut parsed: Option<Value>,
    features: RequestFeatures,
    stream_hint: bool,
    mut trace: RequestTrace,
    deadline: Instant,
) -> Response {
    let from_queue = permit.from_queue;
    let mut excluded: Vec<String> = Vec::new();
    let mut switches = 0u32;

    // 4. Model reservation.
    let mut decision = match state.router.route(&features, &excluded) {
        Ok(RouteOutcome::Routed(decision)) => {
            note_decision(&mut trace, &decision);
            rewrite_model(&mut parsed, &mut body, decision.lease.model_name(), &features);
            Some(decision)
        }
        Ok(RouteOutcome::Passthrough) => None,
        Err(_saturated) => {
            return finish_rejected(&state, trace, Rejection::new(ErrorKind::PoolExhausted));
        }
    };

    // 5. Attempt loop.
    let max_attempts = state.config.max_retries + 1;
    let mut last_kind = ErrorKind::PoolExhausted;

    for attempt in 0..max_attempts {
        if Instant::now() >= deadline {
            return finish_rejected(&state, trace, Rejection::new(ErrorKind::Timeout));
        }

        let lease = match acquire_key(&state, from_queue && attempt == 0, deadline).await {
            Ok(lease) => lease,
            Err(rejection) => return finish_rejected(&state, trace, rejection),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let forwarded = tokio::time::timeout(
            remaining,
            state.upstream.forward(
                &method,
                &path_and_query,
                &headers,
                body.clone(),
                lease.key(),
                attempt,
                stream_hint,
            ),
        )
        .await;

        match forwarded {
            // Overall request deadline fired mid-attempt: the pending
            // upstream call is dropped (aborted) and the client gets 504.
            Err(_deadline) => {
                trace.push_attempt(attempt_record(&lease, &decision, None, Some(ErrorKind::Timeout)));
                lease.complete_failure(ErrorKind::Timeout);
                return finish_rejected(&state, trace, Rejection::new(ErrorKind::Timeout));
            }
            Ok(Err(kind)) => {
                trace.push_attempt(attempt_record(&lease, &decision, None, Some(kind)));
                lease.complete_failure(kind);
                last_kind = kind;
                if kind.retryable() && attempt + 1 < max_attempts {
                    continue;
                }
                return finish_rejected(&state, trace, Rejection::new(kind));
            }
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                match classify_status(status) {
                    StatusClass::Success => {
                        trace.push_attempt(attempt_record(&lease, &decision, Some(status), None));
                        return relay_success(state, permit, lease, decision, response, trace)
                            .await;
                    }
                    StatusClass::RateLimited => {
                        trace.push_attempt(attempt_record(
                            &lease,
                            &decision,
                            Some(status),
                            Some(ErrorKind::RateLimited),
                        ));
                        lease.complete_failure(ErrorKind::RateLimited);
                        if let Some(current) = &decision {
                            current
                                .lease
                                .model()
                                .record_rate_limited(state.router.cooldown_knobs());
                        }
                        last_kind = ErrorKind::RateLimited;
                        if attempt + 1 < max_attempts {
                            decision = maybe_switch_model(
                                &state,
                                decision,
                                &features,
                                &mut excluded,
                                &mut switches,
                                &mut parsed,
                                &mut body,
                                &mut trace,
                            );
                            continue;
                        }
                        // Budget exhausted — the upstream 429 goes through
                        // verbatim so the client sees the provider's own
                        // retry guidance.
                        return relay_verbatim(state, response, trace).await;
                    }
                    StatusClass::ServerError => {
                        trace.push_attempt(attempt_record(
                            &lease,
                            &decision,
                            Some(status),
                            Some(ErrorKind::ServerError),
                        ));
                        lease.complete_failure(ErrorKind::ServerError);
                        last_kind = ErrorKind::ServerError;
                        if attempt + 1 < max_attempts {
                            continue;
                        }
                        return finish_rejected(
                            &state,
                            trace,
                            Rejection::new(ErrorKind::ServerError),
                        );
                    }
                    StatusClass::ClientError => {
                        trace.push_attempt(attempt_record(
                            &lease,
                            &decision,
                            Some(status),
                            Some(ErrorKind::BadRequest),
                        ));
                        lease.complete_neutral();
                        return relay_verbatim(state, response, trace).await;
                    }
                }
            }
        }
    }

    finish_rejected(&state, trace, Rejection::new(last_kind))
}

/// Key acquisition with bounded in-request waiting.
///
/// `pool_exhausted` gets a couple of brief pauses (a slot usually frees
/// within milliseconds); `pool_cooldown` is slept through only when short,
/// otherwise surfaced with its `retry-after`.
async fn acquire_key(
    state: &ProxyState,
    from_queue: bool,
    deadline: Instant,
) -> Result<KeyLease, Rejection> {
    let mut tries = 0u32;
    loop {
        match state.pool.acquire(None, from_queue) {
            Ok((lease, reason)) => {
                tracing::debug!(
                    key = lease.key().fingerprint(),
                    reason = ?reason,
                    "key selected"
                );
                return Ok(lease);
            }
            Err(AcquireError::NoKeysForProvider) => {
                return Err(Rejection::new(ErrorKind::ProviderNoKeysConfigured));
            }
            Err(AcquireError::PoolExhausted) => {
                tries += 1;
                if tries > 2 || Instant::now() + EXHAUSTED_RETRY_PAUSE >= deadline {
                    return Err(Rejection::new(ErrorKind::PoolExhausted));
                }
                tokio::time::sleep(EXHAUSTED_RETRY_PAUSE).await;
            }
            Err(AcquireError::PoolCooldown(retry_after)) => {
                tries += 1;
                let can_wait = retry_after <= SHORT_COOLDOWN_WAIT
                    && Instant::now() + retry_after < deadline
                    && tries <= 2;
                if can_wait {
                    tokio::time::sleep(retry_after).await;
                } else {
                    return Err(Rejection::with_retry_after(
                        ErrorKind::PoolCooldown,
                        retry_after,
                    ));
                }
            }
        }
    }
}

/// Release the 429'd model's slot and, when the tier strategy permits,
/// reserve a different model for the next attempt. The old slot is freed
/// before the new reservation so single-slot tiers cannot deadlock.
#[allow(clippy::too_many_arguments)]
fn maybe_switch_model(
    state: &ProxyState,
    decision: Option<RouteDecision>,
    features: &RequestFeatures,
    excluded: &mut Vec<String>,
    switches: &mut u32,
    parsed: &mut Option<Value>,
    body: &mut Bytes,
    trace: &mut RequestTrace,
) -> Option<RouteDecision> {
    let current = decision?;
    let switchable = current.strategy == TierStrategy::Quality || state.router.failover_enabled();
    if !switchable || *switches >= state.router.max_model_switches() {
        return Some(current);
    }

    let previous = current.lease.model_name().to_string();
    excluded.push(previous.clone());
    drop(current); // release before re-reserving

    *switches += 1;
    match state.router.route(features, excluded) {
        Ok(RouteOutcome::Routed(next)) => {
            tracing::info!(from = %previous, to = %next.lease.model_name(), "model switched after 429");
            note_decision(trace, &next);
            rewrite_model(parsed, body, next.lease.model_name(), features);
            Some(next)
        }
        // Nothing else to offer — the next attempt reuses the original
        // model name already in the body (its cooldown may clear).
        Ok(RouteOutcome::Passthrough) | Err(_) => None,
    }
}

fn note_decision(trace: &mut RequestTrace, decision: &RouteDecision) {
    trace.resolved_model = Some(decision.lease.model_name().to_string());
    trace.tier = Some(decision.tier.to_string());
    if let Some(reason) = decision.upgraded {
        tracing::debug!(reason = reason.as_str(), "complexity upgrade applied");
    }
}

/// Rewrite the body's `model` field to the routed model. A body that needs
/// no remapping passes through byte-identical.
fn rewrite_model(
    parsed: &mut Option<Value>,
    body: &mut Bytes,
    resolved: &str,
    features: &RequestFeatures,
) {
    if features.model.as_deref() == Some(resolved) {
        return;
    }
    if let Some(value) = parsed {
        if let Some(object) = value.as_object_mut() {
            object.insert("model".into(), Value::String(resolved.to_string()));
            if let Ok(serialized) = serde_json::to_vec(value) {
                *body = Bytes::from(serialized);
            }
        }
    }
}

fn attempt_record(
    lease: &KeyLease,
    decision: &Option<RouteDecision>,
    status: Option<u16>,
    error: Option<ErrorKind>,
) -> AttemptRecord {
    AttemptRecord {
        key_index: Some(lease.key().index()),
        model: decision.as_ref().map(|d| d.lease.model_name().to_string()),
        status_code: status,
        duration_ms: lease.elapsed().as_millis() as u64,
        error_kind: error.map(|kind| kind.as_str().to_string()),
    }
}

fn finish_rejected(state: &ProxyState, mut trace: RequestTrace, rejection: Rejection) -> Response {
    trace.finalize(Some(rejection.status().as_u16()));
    state.traces.push(trace);
    rejection.into_response()
}

// ---------------------------------------------------------------------------
// Response relay
// ---------------------------------------------------------------------------

/// Relay a 2xx upstream response. SSE streams chunk-by-chunk with the
/// leases riding inside the stream; anything else is buffered.
async fn relay_success(
    state: Arc<ProxyState>,
    permit: AdmissionPermit,
    lease: KeyLease,
    decision: Option<RouteDecision>,
    response: reqwest::Response,
    mut trace: RequestTrace,
) -> Response {
    let status = response.status();
    let headers = relay_headers(response.headers());
    let is_sse = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_sse {
        let guard = StreamGuard {
            lease: Some(lease),
            model: decision.map(|d| d.lease),
            trace: Some(trace),
            status: status.as_u16(),
            traces: Arc::clone(&state.traces),
            _permit: permit,
        };
        let relay = RelayStream { inner: response.bytes_stream().boxed(), guard: Some(guard) };
        let mut out = Response::builder()
            .status(status)
            .body(Body::from_stream(relay))
            .expect("static response parts");
        *out.headers_mut() = headers;
        return out;
    }

    match response.bytes().await {
        Ok(bytes) => {
            let latency = lease.elapsed();
            lease.complete_success(latency);
            if let Some(decision) = &decision {
                decision.lease.model().record_success();
            }
            drop(decision);

            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                record_usage(&mut trace, &value);
            }
            trace.finalize(Some(status.as_u16()));
            state.traces.push(trace);

            let mut out = Response::builder()
                .status(status)
                .body(Body::from(bytes))
                .expect("static response parts");
            *out.headers_mut() = headers;
            out
        }
        Err(err) => {
            let kind = crate::upstream::categorize_transport_error(&err);
            lease.complete_failure(kind);
            drop(decision);
            finish_rejected(&state, trace, Rejection::new(kind))
        }
    }
}

/// Relay a non-retryable upstream response (4xx, final 429) verbatim.
async fn relay_verbatim(
    state: Arc<ProxyState>,
    response: reqwest::Response,
    mut trace: RequestTrace,
) -> Response {
    let status = response.status();
    let headers = relay_headers(response.headers());
    let bytes = response.bytes().await.unwrap_or_default();

    trace.finalize(Some(status.as_u16()));
    state.traces.push(trace);

    let mut out = Response::builder()
        .status(status)
        .body(Body::from(bytes))
        .expect("static response parts");
    *out.headers_mut() = headers;
    out
}

/// Upstream response headers minus hop-by-hop ones.
fn relay_headers(upstream: &HeaderMap<HeaderValue>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Pull token usage out of a buffered completion response. Understands
/// both the Anthropic (`usage.input_tokens`) and OpenAI
/// (`usage.prompt_tokens`) shapes.
fn record_usage(trace: &mut RequestTrace, body: &Value) {
    let usage = match body.get("usage") {
        Some(usage) => usage,
        None => return,
    };
    trace.input_tokens = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_u64);
    trace.output_tokens = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_u64);
}

/// Leases and trace carried by an in-progress SSE relay.
struct StreamGuard {
    lease: Option<KeyLease>,
    model: Option<ModelLease>,
    trace: Option<RequestTrace>,
    status: u16,
    traces: Arc<TraceLog>,
    _permit: AdmissionPermit,
}

impl StreamGuard {
    /// Stream ran to completion.
    fn finish_ok(&mut self) {
        if let Some(lease) = self.lease.take() {
            let latency = lease.elapsed();
            lease.complete_success(latency);
        }
        if let Some(model) = self.model.take() {
            model.model().record_success();
        }
        if let Some(mut trace) = self.trace.take() {
            trace.finalize(Some(self.status));
            self.traces.push(trace);
        }
    }

    /// Stream broke mid-relay.
    fn finish_broken(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.complete_failure(ErrorKind::SocketHangup);
        }
        self.model.take();
        if let Some(mut trace) = self.trace.take() {
            trace.finalize(None);
            self.traces.push(trace);
        }
    }

    /// Client went away before the stream ended. The upstream did nothing
    /// wrong, so the key is released without a health record.
    fn finish_cancelled(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.complete_neutral();
        }
        self.model.take();
        if let Some(mut trace) = self.trace.take() {
            trace.finalize(None);
            self.traces.push(trace);
        }
    }
}

/// SSE relay: forwards upstream chunks untouched and resolves the carried
/// leases exactly once, on whichever end the stream reaches first.
struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    guard: Option<StreamGuard>,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                if let Some(mut guard) = self.guard.take() {
                    guard.finish_broken();
                }
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                if let Some(mut guard) = self.guard.take() {
                    guard.finish_ok();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        // Dropping with the guard still armed means the client hung up
        // mid-stream; upstream is aborted by dropping `inner`.
        if let Some(mut guard) = self.guard.take() {
            guard.finish_cancelled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Body rewrite
    // -----------------------------------------------------------------------

    #[test]
    fn rewrite_replaces_model_when_remapped() {
        let original = json!({ "model": "client-model", "messages": [] });
        let mut body = Bytes::from(serde_json::to_vec(&original).unwrap());
        let mut parsed = Some(original);
        let features = RequestFeatures { model: Some("client-model".into()), ..Default::default() };

        rewrite_model(&mut parsed, &mut body, "routed-model", &features);
        let round: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(round["model"], "routed-model");
    }

    #[test]
    fn rewrite_is_a_noop_when_model_matches() {
        let original = json!({ "model": "same", "messages": [] });
        let bytes = Bytes::from(serde_json::to_vec(&original).unwrap());
        let mut body = bytes.clone();
        let mut parsed = Some(original);
        let features = RequestFeatures { model: Some("same".into()), ..Default::default() };

        rewrite_model(&mut parsed, &mut body, "same", &features);
        assert_eq!(body, bytes, "byte-identical passthrough when no remap happens");
    }

    // -----------------------------------------------------------------------
    // Header relay
    // -----------------------------------------------------------------------

    #[test]
    fn relay_headers_strip_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("connection", HeaderValue::from_static("keep-alive"));
        upstream.insert("x-custom", HeaderValue::from_static("kept"));

        let relayed = relay_headers(&upstream);
        assert!(relayed.contains_key("content-type"));
        assert!(relayed.contains_key("x-custom"));
        assert!(!relayed.contains_key("transfer-encoding"));
        assert!(!relayed.contains_key("connection"));
    }

    // -----------------------------------------------------------------------
    // Usage extraction
    // -----------------------------------------------------------------------

    #[test]
    fn usage_parses_anthropic_and_openai_shapes() {
        let mut trace = RequestTrace::new("t", "/v1/messages");
        record_usage(&mut trace, &json!({ "usage": { "input_tokens": 11, "output_tokens": 22 } }));
        assert_eq!(trace.input_tokens, Some(11));
        assert_eq!(trace.output_tokens, Some(22));

        let mut trace = RequestTrace::new("t", "/v1/chat/completions");
        record_usage(
            &mut trace,
            &json!({ "usage": { "prompt_tokens": 5, "completion_tokens": 7 } }),
        );
        assert_eq!(trace.input_tokens, Some(5));
        assert_eq!(trace.output_tokens, Some(7));
    }

    #[test]
    fn usage_absent_leaves_trace_untouched() {
        let mut trace = RequestTrace::new("t", "/v1/messages");
        record_usage(&mut trace, &json!({ "content": [] }));
        assert_eq!(trace.input_tokens, None);
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    fn tiny_state(max_in_flight: usize) -> Arc<ProxyState> {
        let config: Config = serde_json::from_str(&format!(
            r#"{{ "apiKeys": ["sk-test"], "maxInFlight": {max_in_flight},
                 "queueMaxSize": 1, "queueTimeoutMs": 50 }}"#
        ))
        .unwrap();
        ProxyState::new(Arc::new(config))
    }

    fn expect_rejection(outcome: Result<AdmissionPermit, Rejection>) -> Rejection {
        match outcome {
            Ok(_) => panic!("expected a rejection"),
            Err(rejection) => rejection,
        }
    }

    #[tokio::test]
    async fn admission_grants_up_to_max_in_flight() {
        let state = tiny_state(2);
        let a = state.admit().await.unwrap();
        let _b = state.admit().await.unwrap();
        assert_eq!(state.requests_in_flight(), 2);

        // Third must queue; with nobody releasing it times out.
        let err = expect_rejection(state.admit().await);
        assert_eq!(err.kind, ErrorKind::QueueTimeout);

        drop(a);
        assert_eq!(state.requests_in_flight(), 1);
    }

    #[tokio::test]
    async fn released_slot_wakes_the_queue_head() {
        let state = tiny_state(1);
        let held = state.admit().await.unwrap();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.admit().await.map(|permit| drop(permit)) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held); // hands the slot to the queued waiter

        waiter.await.unwrap().expect("queued admission should succeed");
    }

    #[tokio::test]
    async fn queue_overflow_is_queue_full() {
        let state = tiny_state(1);
        let _held = state.admit().await.unwrap();

        // One waiter fills the single queue slot.
        let state2 = Arc::clone(&state);
        let _waiter = tokio::spawn(async move { state2.admit().await.map(|p| drop(p)) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = expect_rejection(state.admit().await);
        assert_eq!(err.kind, ErrorKind::QueueFull);
    }

    #[tokio::test]
    async fn shutdown_refuses_admission() {
        let state = tiny_state(4);
        state.begin_shutdown();
        let err = expect_rejection(state.admit().await);
        assert_eq!(err.kind, ErrorKind::Shutdown);
    }
}
