//! In-memory request traces.
//!
//! Every proxied request produces one [`RequestTrace`] with a sub-record
//! per upstream attempt. Traces accumulate in a fixed-capacity ring-buffer:
//! once full, the oldest is evicted, giving a bounded memory footprint
//! regardless of request volume. [`TraceLog::query`] supports the filter
//! surface consumed by external tooling.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One upstream attempt within a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Index of the key used, `None` when no key was ever acquired.
    pub key_index: Option<usize>,
    /// Model the attempt was sent to, when routing resolved one.
    pub model: Option<String>,
    /// Upstream HTTP status, `None` on transport failure.
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    /// Error classification for failed attempts.
    pub error_kind: Option<String>,
}

/// A single request record, finalized once the response ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrace {
    pub trace_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub path: String,
    /// Model named by the client body, if any.
    pub client_model: Option<String>,
    /// Model the router actually dispatched to.
    pub resolved_model: Option<String>,
    pub tier: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub final_status: Option<u16>,
    pub total_duration_ms: u64,
    pub success: bool,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl RequestTrace {
    pub fn new(trace_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            start_time: Utc::now(),
            end_time: None,
            path: path.into(),
            client_model: None,
            resolved_model: None,
            tier: None,
            attempts: Vec::new(),
            final_status: None,
            total_duration_ms: 0,
            success: false,
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// Append one attempt sub-record.
    pub fn push_attempt(&mut self, attempt: AttemptRecord) {
        self.attempts.push(attempt);
    }

    /// Close the trace: stamp the end time, derive totals and the outcome.
    pub fn finalize(&mut self, final_status: Option<u16>) {
        let end = Utc::now();
        self.total_duration_ms =
            (end - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(end);
        self.final_status = final_status;
        self.success = final_status.is_some_and(|code| (200..300).contains(&code));
    }

    pub fn has_retries(&self) -> bool {
        self.attempts.len() > 1
    }
}

/// Filter for [`TraceLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceQuery {
    pub success: Option<bool>,
    pub model: Option<String>,
    pub has_retries: Option<bool>,
    pub min_duration_ms: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Fixed-capacity ring-buffer of finalized [`RequestTrace`] records.
///
/// Safe to share via `Arc<TraceLog>`. [`push`][Self::push] uses a
/// non-blocking `try_lock` so it never delays request handling; under lock
/// contention the trace is silently dropped.
pub struct TraceLog {
    capacity: usize,
    entries: Mutex<VecDeque<RequestTrace>>,
}

impl TraceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Record a finalized trace. Best-effort, non-blocking.
    pub fn push(&self, trace: RequestTrace) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(trace);
        }
    }

    /// Return matching traces, newest first.
    pub async fn query(&self, query: &TraceQuery) -> Vec<RequestTrace> {
        let entries = self.entries.lock().await;
        let limit = query.limit.unwrap_or(100);
        entries
            .iter()
            .rev()
            .filter(|t| query.success.is_none_or(|want| t.success == want))
            .filter(|t| {
                query.model.as_deref().is_none_or(|want| {
                    t.resolved_model.as_deref() == Some(want)
                        || t.client_model.as_deref() == Some(want)
                })
            })
            .filter(|t| query.has_retries.is_none_or(|want| t.has_retries() == want))
            .filter(|t| {
                query.min_duration_ms.is_none_or(|min| t.total_duration_ms >= min)
            })
            .filter(|t| query.since.is_none_or(|since| t.start_time >= since))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
