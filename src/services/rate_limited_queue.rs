//! Rate-Limited API Queue (spec §4.1 "RLQ").
//!
//! Serializes and rate-limits all outbound calls to one external provider.
//! One instance per provider. Combines a per-second token bucket, a
//! sliding-window long-period counter, and exponential backoff retry on
//! `429`/transient errors, with priority-ordered dispatch.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::ports::ProviderClient;

/// A single outbound request (spec §4.1 `Enqueue(request)`).
#[derive(Debug, Clone)]
pub struct RlqRequest {
    pub method: String,
    pub params: Value,
    /// Smaller = dispatched sooner.
    pub priority: i32,
    pub max_retries: u32,
}

impl RlqRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params, priority: 5, max_retries: 3 }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-second token bucket, reusing the reference `TokenBucketRateLimiter`
/// shape (`Arc<Mutex<f64>>` tokens + refill-rate float math).
struct TokenBucket {
    tokens: Mutex<f64>,
    capacity: f64,
    refill_rate: f64,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    fn new(requests_per_second: f64) -> Self {
        assert!(requests_per_second > 0.0, "requests_per_second must be positive");
        Self {
            tokens: Mutex::new(requests_per_second),
            capacity: requests_per_second,
            refill_rate: requests_per_second,
            last_refill: Mutex::new(Instant::now()),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut tokens = self.tokens.lock().await;
                let mut last_refill = self.last_refill.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                let refilled = (*tokens + elapsed * self.refill_rate).min(self.capacity);
                if refilled >= 1.0 {
                    *tokens = refilled - 1.0;
                    *last_refill = now;
                    return;
                }
                *tokens = refilled;
                *last_refill = now;
                Duration::from_secs_f64((1.0 - refilled) / self.refill_rate)
            };
            sleep(wait).await;
        }
    }
}

/// Sliding-window long-period counter (spec §4.1 "at most `W` per rolling
/// `T`-second window"). New structure in the token bucket's style: the
/// state is protected the same way, but it tracks dispatch timestamps
/// rather than a fractional token count.
struct SlidingWindowCounter {
    timestamps: Mutex<Vec<Instant>>,
    max_count: usize,
    window: Duration,
}

impl SlidingWindowCounter {
    fn new(max_count: usize, window: Duration) -> Self {
        Self { timestamps: Mutex::new(Vec::new()), max_count, window }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                if timestamps.len() < self.max_count {
                    timestamps.push(now);
                    return;
                }
                let oldest = timestamps[0];
                self.window - now.duration_since(oldest)
            };
            sleep(wait).await;
        }
    }
}

/// Retry/backoff knobs (spec §4.1: base 1s, cap 30s).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { initial_backoff_ms: 1_000, max_backoff_ms: 30_000 }
    }
}

impl BackoffPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff_ms.saturating_mul(2u64.saturating_pow(attempt)).min(self.max_backoff_ms);
        Duration::from_millis(backoff_ms)
    }
}

/// Per-provider rate-limited queue (spec §4.1).
///
/// Grounded on the reference codebase's `infrastructure::claude::rate_limiter::TokenBucketRateLimiter`
/// and `infrastructure::claude::retry::RetryPolicy`, generalized from a
/// single Claude-shaped client to the generic [`ProviderClient`] port and
/// the §7 error taxonomy.
pub struct RateLimitedQueue<C: ProviderClient> {
    client: Arc<C>,
    per_second: TokenBucket,
    long_window: SlidingWindowCounter,
    backoff: BackoffPolicy,
    seq: AtomicU64,
}

impl<C: ProviderClient> RateLimitedQueue<C> {
    /// `requests_per_second` and `(window_limit, window_secs)` per spec
    /// §4.1 defaults (~2/s, ~10_000/10min) — callers configure per provider.
    pub fn new(client: Arc<C>, requests_per_second: f64, window_limit: usize, window_secs: u64) -> Self {
        Self {
            client,
            per_second: TokenBucket::new(requests_per_second),
            long_window: SlidingWindowCounter::new(window_limit, Duration::from_secs(window_secs)),
            backoff: BackoffPolicy::default(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Dispatch a request, honoring both rate limits and retrying
    /// transient/429 failures with exponential backoff (spec §4.1).
    ///
    /// The `priority`/enqueue-sequence ordering described in spec §4.1 is
    /// enforced by callers feeding requests through a
    /// `BinaryHeap<PrioritizedRequest>` (see [`PrioritizedRequest`]) before
    /// calling this method one at a time; this method itself handles the
    /// per-request rate-limit wait and retry loop.
    pub async fn enqueue(&self, request: RlqRequest) -> DomainResult<Value> {
        self.per_second.acquire().await;
        self.long_window.acquire().await;

        let mut attempt = 0u32;
        loop {
            match self.client.call(&request.method, request.params.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retryable = matches!(
                        err,
                        TaskError::RateLimited(_) | TaskError::Network(_) | TaskError::Timeout(_) | TaskError::Provider5xx { .. }
                    );
                    if !retryable || attempt >= request.max_retries {
                        return Err(err);
                    }
                    sleep(self.backoff.backoff_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Next monotonic enqueue sequence, for `(priority, enqueue_seq)`
    /// ordering in a caller-owned priority heap.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Narrow facade the Executor Core depends on for `callAPI` (spec §4.5), so
/// it need not be generic over [`RateLimitedQueue`]'s own provider-client
/// type parameter.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> DomainResult<Value>;
}

#[async_trait]
impl<C: ProviderClient> ApiCaller for RateLimitedQueue<C> {
    async fn call(&self, method: &str, params: Value) -> DomainResult<Value> {
        self.enqueue(RlqRequest::new(method, params)).await
    }
}

/// A request ordered by `(priority, enqueue_seq)` — smaller priority value
/// and earlier sequence dispatch first (spec §4.1 "stable FIFO" tie-break).
#[derive(Debug, Clone)]
pub struct PrioritizedRequest {
    pub request: RlqRequest,
    pub enqueue_seq: u64,
}

impl PartialEq for PrioritizedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.enqueue_seq == other.enqueue_seq
    }
}
impl Eq for PrioritizedRequest {}

impl Ord for PrioritizedRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert priority (smaller = more urgent)
        // and sequence (earlier = more urgent) so `.pop()` yields the
        // highest-urgency waiter.
        other.request.priority.cmp(&self.request.priority)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

impl PartialOrd for PrioritizedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-priority waiting queue built on [`PrioritizedRequest`] ordering.
#[derive(Default)]
pub struct WaiterQueue {
    heap: BinaryHeap<PrioritizedRequest>,
}

impl WaiterQueue {
    pub fn push(&mut self, request: PrioritizedRequest) {
        self.heap.push(request);
    }

    pub fn pop(&mut self) -> Option<PrioritizedRequest> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
