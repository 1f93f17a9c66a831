//! Abstract boundary to per-cloud provider implementations.
//!
//! The core never talks to a cloud SDK directly. A provider crate provisions
//! its resources in its own constructor and hands the engine a ready
//! [`ProviderDriver`]; the engine only publishes calls, polls queues and
//! logs, and asks for teardown. Driver errors arrive pre-classified as
//! transient or fatal so the retry machinery never inspects provider SDK
//! error types.

use crate::error::DriverError;
use crate::log_stitcher::LogEvent;
use crate::stats::{FunctionCounters, FunctionStatsSummary};
use crate::wire::{Call, ControlKind, ReturnPayload};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One batch from the response queue. Bodies are raw JSON; the reconciler
/// owns decoding so malformed messages are dropped in one place.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub messages: Vec<RawMessage>,
    /// Hint that the queue likely has more messages ready right now.
    pub is_full: bool,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: String,
}

/// A leftover cloud resource discovered by a retention scan, reconstructed
/// deterministically from its provider-side name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualResource {
    pub name: String,
    /// Provider-reported creation time, epoch ms.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostItem {
    pub name: String,
    pub measured: f64,
    pub unit: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostSnapshot {
    pub total: f64,
    pub items: Vec<CostItem>,
}

#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Short identifier ("aws", "google", "local"); namespaces the
    /// persistent cache and the GC resource prefix.
    fn provider_name(&self) -> &str;

    /// Synchronous/HTTP path. `Ok(None)` means this provider only supports
    /// the queued path.
    async fn invoke_sync(
        &self,
        call: &Call,
        cancel: &CancellationToken,
    ) -> Result<Option<ReturnPayload>, DriverError>;

    /// Enqueue a call for the queued path.
    async fn publish_request(&self, call: &Call) -> Result<(), DriverError>;

    /// One long-poll batch from the response queue. Must return promptly
    /// (empty is fine) once `cancel` fires.
    async fn poll_response_queue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PollResult, DriverError>;

    /// Send a control message to this instance's own response queue.
    async fn publish_control(&self, kind: ControlKind) -> Result<(), DriverError>;

    /// Human-readable URL for the remote logs of this instance, if any.
    fn log_url(&self) -> Option<String>;

    /// Log events at or after `start_time` (epoch ms). Pages may overlap;
    /// the log stitcher deduplicates.
    async fn poll_logs(&self, start_time: i64) -> Result<Vec<LogEvent>, DriverError>;

    /// Response queue id when this provider supports the queued path.
    fn response_queue_id(&self) -> Option<String>;

    /// Tear down this instance's own resources. Idempotent.
    async fn delete_resources(&self) -> Result<(), DriverError>;

    /// Residual resources in this provider's namespace, live instances
    /// included; the garbage collector applies the retention filter.
    async fn scan_residual_resources(&self) -> Result<Vec<ResidualResource>, DriverError> {
        Ok(Vec::new())
    }

    /// Delete one residual resource. Idempotent.
    async fn delete_residual(&self, resource: &ResidualResource) -> Result<(), DriverError> {
        let _ = resource;
        Ok(())
    }

    /// Provider cost model over the observed counters and stats.
    fn cost_estimate(
        &self,
        counters: &FunctionCounters,
        stats: &FunctionStatsSummary,
    ) -> Option<CostSnapshot> {
        let _ = (counters, stats);
        None
    }
}
