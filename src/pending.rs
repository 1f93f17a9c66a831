//! Registry of outstanding calls, shared by the engine and the reconciler.
//!
//! Invariant: a `call_id` is present iff a caller is awaiting it and it has
//! not been completed or canceled. Entries are removed exactly once, by
//! whichever side observes the terminal outcome first.

use crate::error::InvokeError;
use crate::wire::{Call, CpuMetrics, ReturnPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type CallOutcome = Result<ReturnPayload, InvokeError>;

/// Take-once completion slot. The primary and its speculative duplicate hold
/// the same slot, so the first terminal response wins structurally.
#[derive(Debug, Clone)]
pub(crate) struct ResponderSlot {
    sender: Arc<Mutex<Option<oneshot::Sender<CallOutcome>>>>,
}

impl ResponderSlot {
    pub fn new() -> (Self, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: Arc::new(Mutex::new(Some(tx))) }, rx)
    }

    /// Deliver the outcome if nobody has yet. Returns whether this call won
    /// the slot.
    pub fn resolve(&self, outcome: CallOutcome) -> bool {
        match self.sender.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(tx) => {
                // A dropped receiver still counts as resolved: the outcome
                // is terminal even if nobody is listening anymore.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingCall {
    pub call: Call,
    pub sent_at: Instant,
    pub sent_epoch_ms: i64,
    pub deadline: Instant,
    pub started: bool,
    pub speculative: bool,
    pub cpu_metrics: Vec<CpuMetrics>,
    pub slot: ResponderSlot,
}

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: PendingCall) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let previous = map.insert(entry.call.call_id.clone(), entry);
        debug_assert!(previous.is_none(), "call id registered twice");
    }

    pub fn remove(&self, call_id: &str) -> Option<PendingCall> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).remove(call_id)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn deadline(&self, call_id: &str) -> Option<Instant> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(call_id).map(|e| e.deadline)
    }

    pub fn bump_attempt(&self, call_id: &str, deadline: Instant) -> Option<u32> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entry = map.get_mut(call_id)?;
        entry.call.attempt += 1;
        entry.deadline = deadline;
        Some(entry.call.attempt)
    }

    /// Record an out-of-band function-started notification: extend the
    /// deadline and return the local elapsed time for the start-latency
    /// sample. `None` when the call is unknown or already marked started.
    pub fn mark_started(&self, call_id: &str, extend_by: Duration) -> Option<(String, Duration)> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entry = map.get_mut(call_id)?;
        if entry.started {
            return None;
        }
        entry.started = true;
        entry.deadline = Instant::now() + extend_by;
        Some((entry.call.name.clone(), entry.sent_at.elapsed()))
    }

    pub fn push_cpu_metrics(&self, call_id: &str, metrics: CpuMetrics) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match map.get_mut(call_id) {
            Some(entry) => {
                entry.cpu_metrics.push(metrics);
                true
            }
            None => false,
        }
    }

    pub fn drain(&self) -> Vec<PendingCall> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.drain().map(|(_, entry)| entry).collect()
    }
}
