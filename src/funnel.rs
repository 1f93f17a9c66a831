//! Admission funnel for outbound provider operations.
//!
//! Every network-touching operation flows through a [`Funnel`]: a FIFO
//! concurrency limiter with retroactive capacity changes and explicit
//! rejection of queued waiters at shutdown. Variants layer retry with
//! backoff, per-key memoization, and token-bucket rate limiting on top of
//! the same admission queue.
//!
//! Invariants:
//! - `running() <= max_concurrency` whenever the limit is nonzero.
//! - Admission is FIFO among waiters of one funnel.
//! - A permit is released when its task completes, errors, or is dropped
//!   mid-flight; slots cannot leak.

use crate::sleeper::{Sleeper, TokioSleeper};
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// First retry backoff delay; doubles per attempt up to [`RETRY_BACKOFF_CAP`].
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FunnelError<E> {
    /// The funnel was stopped while this task waited for admission.
    #[error("Rejected pending request")]
    Rejected,
    /// The admitted task failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> FunnelError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    // 0 = unlimited
    max: usize,
    running: usize,
    waiters: VecDeque<oneshot::Sender<FunnelPermit>>,
    closed: bool,
}

impl Inner {
    fn has_capacity(&self) -> bool {
        self.max == 0 || self.running < self.max
    }
}

/// FIFO concurrency limiter. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Funnel {
    inner: Arc<Mutex<Inner>>,
    sleeper: Arc<dyn Sleeper>,
}

/// Held for the duration of an admitted task; releases the slot on drop.
#[derive(Debug)]
pub struct FunnelPermit {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for FunnelPermit {
    fn drop(&mut self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.running -= 1;
        }
        Funnel::admit_waiters(&self.inner);
    }
}

impl Funnel {
    /// A funnel admitting at most `max_concurrency` tasks at once; 0 means
    /// unlimited.
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_sleeper(max_concurrency, Arc::new(TokioSleeper))
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn with_sleeper(max_concurrency: usize, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max: max_concurrency,
                running: 0,
                waiters: VecDeque::new(),
                closed: false,
            })),
            sleeper,
        }
    }

    pub fn running(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).running
    }

    /// Number of tasks waiting for admission.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).waiters.len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).max
    }

    /// Change the limit; raising it immediately admits queued waiters.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.max = max_concurrency;
        }
        Self::admit_waiters(&self.inner);
    }

    /// Fail every queued waiter with [`FunnelError::Rejected`]. Running tasks
    /// are unaffected.
    pub fn reject_pending(&self) {
        let dropped = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut inner.waiters)
        };
        drop(dropped);
    }

    /// Reject queued waiters and refuse all future admissions.
    pub fn close(&self) {
        let dropped = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.closed = true;
            std::mem::take(&mut inner.waiters)
        };
        drop(dropped);
    }

    // Hand permits to waiters while capacity allows. Runs without the lock
    // held across the channel send so an abandoned waiter's permit can drop
    // and release safely.
    fn admit_waiters(inner_arc: &Arc<Mutex<Inner>>) {
        loop {
            let tx = {
                let mut inner = inner_arc.lock().unwrap_or_else(|p| p.into_inner());
                if !inner.has_capacity() {
                    return;
                }
                match inner.waiters.pop_front() {
                    Some(tx) => {
                        inner.running += 1;
                        tx
                    }
                    None => return,
                }
            };
            let permit = FunnelPermit { inner: inner_arc.clone() };
            // A failed send means the waiter gave up; the permit drops here
            // and releases the slot for the next iteration.
            let _ = tx.send(permit);
        }
    }

    /// Wait for admission and hold the slot until the permit drops. The
    /// engine uses this on the queued path, where one permit spans the whole
    /// publish-to-response lifetime of a call.
    pub async fn admit<E>(&self) -> Result<FunnelPermit, FunnelError<E>> {
        let rx = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.closed {
                return Err(FunnelError::Rejected);
            }
            if inner.has_capacity() {
                inner.running += 1;
                return Ok(FunnelPermit { inner: self.inner.clone() });
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        rx.await.map_err(|_| FunnelError::Rejected)
    }

    /// Run `task` once admitted.
    pub async fn push<T, E, Fut>(&self, task: Fut) -> Result<T, FunnelError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.admit().await?;
        task.await.map_err(FunnelError::Inner)
    }

    /// Run `op` once admitted, retrying failures while `should_retry(err,
    /// attempt)` holds. Backoff is exponential from [`RETRY_BACKOFF_BASE`]
    /// capped at [`RETRY_BACKOFF_CAP`] with equal jitter. Retries hold the
    /// original permit; they never re-enter the admission queue.
    pub async fn push_retry<T, E, Fut, Op, P>(
        &self,
        should_retry: P,
        mut op: Op,
    ) -> Result<T, FunnelError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut(u32) -> Fut,
        P: Fn(&E, u32) -> bool,
    {
        let _permit = self.admit().await?;
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !should_retry(&e, attempt) {
                        return Err(FunnelError::Inner(e));
                    }
                    let delay = backoff_delay(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential delay for `attempt` (0-based) with equal jitter.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exact = RETRY_BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(RETRY_BACKOFF_CAP)
        .min(RETRY_BACKOFF_CAP);
    let millis = exact.as_millis() as u64;
    if millis == 0 {
        return exact;
    }
    let jittered = rand::rng().random_range(millis / 2..=millis);
    Duration::from_millis(jittered)
}

/// Funnel variant that collapses concurrent and repeated work per key onto
/// one shared future. Completed results stay memoized until [`forget`] or
/// [`clear`].
///
/// [`forget`]: MemoFunnel::forget
/// [`clear`]: MemoFunnel::clear
pub struct MemoFunnel<T, E> {
    funnel: Funnel,
    memo: Mutex<HashMap<String, Shared<BoxFuture<'static, Result<T, FunnelError<E>>>>>>,
}

impl<T, E> MemoFunnel<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(max_concurrency: usize) -> Self {
        Self { funnel: Funnel::new(max_concurrency), memo: Mutex::new(HashMap::new()) }
    }

    /// The single inflight-or-completed future for `key`. Distinct keys run
    /// concurrently, subject to the funnel limit.
    pub async fn push_memoized<Fut>(&self, key: &str, task: Fut) -> Result<T, FunnelError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut memo = self.memo.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = memo.get(key) {
                existing.clone()
            } else {
                let funnel = self.funnel.clone();
                let fut: BoxFuture<'static, Result<T, FunnelError<E>>> =
                    async move { funnel.push(task).await }.boxed();
                let shared = fut.shared();
                memo.insert(key.to_owned(), shared.clone());
                shared
            }
        };
        shared.await
    }

    pub fn forget(&self, key: &str) {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    pub fn clear(&self) {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn funnel(&self) -> &Funnel {
        &self.funnel
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Funnel variant that additionally gates admission behind a token bucket of
/// capacity `burst` refilled at `target_rps` tokens per second.
#[derive(Debug, Clone)]
pub struct RateLimitedFunnel {
    funnel: Funnel,
    bucket: Arc<Mutex<Bucket>>,
    target_rps: f64,
    burst: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimitedFunnel {
    pub fn new(max_concurrency: usize, target_rps: f64, burst: usize) -> Self {
        Self::with_sleeper(max_concurrency, target_rps, burst, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        max_concurrency: usize,
        target_rps: f64,
        burst: usize,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            funnel: Funnel::with_sleeper(max_concurrency, sleeper.clone()),
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            })),
            target_rps,
            burst: burst as f64,
            sleeper,
        }
    }

    pub fn funnel(&self) -> &Funnel {
        &self.funnel
    }

    async fn take_token(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.target_rps).min(self.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.target_rps))
                }
            };
            match wait {
                None => return,
                Some(delay) => self.sleeper.sleep(delay).await,
            }
        }
    }

    pub async fn push<T, E, Fut>(&self, task: Fut) -> Result<T, FunnelError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.take_token().await;
        self.funnel.push(task).await
    }

    /// Wait for one token without running a task; lets a caller apply the
    /// rate gate around work admitted elsewhere.
    pub async fn throttle(&self) {
        self.take_token().await;
    }
}
