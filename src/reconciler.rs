//! Queue reconciler: one shared long poll over the response queue,
//! demultiplexed back onto outstanding calls.
//!
//! A supervisor keeps one poller per [`CALLS_PER_POLLER`] outstanding calls
//! (never fewer than [`MIN_POLLERS`], never more than the configured
//! maximum). Excess pollers exit after their in-flight poll completes.
//! Transient poll failures back off and retry indefinitely; undecodable
//! messages are logged and dropped. The `stopqueue` sentinel — published by
//! the instance to its own queue at shutdown — stops the pool: the poller
//! that observes it cancels the shared token so its siblings' long polls
//! return promptly.

use crate::driver::ProviderDriver;
use crate::engine::Settler;
use crate::error::InvokeError;
use crate::funnel::backoff_delay;
use crate::sleeper::Sleeper;
use crate::wire::ResponseMessage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) const CALLS_PER_POLLER: usize = 20;
pub(crate) const MIN_POLLERS: usize = 2;
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(200);

struct Shared {
    driver: Arc<dyn ProviderDriver>,
    settler: Arc<Settler>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    desired: AtomicUsize,
    active: AtomicUsize,
    stopped: AtomicBool,
    max_pollers: usize,
}

impl Shared {
    /// Route one decoded message. Returns true when the stop sentinel was
    /// observed.
    fn route(&self, msg: ResponseMessage) -> bool {
        match msg {
            ResponseMessage::Response { call_id, mut body } => {
                // The envelope id is authoritative for correlation.
                body.call_id = call_id;
                self.settler.settle_response(body);
                false
            }
            ResponseMessage::DeadLetter { call_id, message } => {
                self.settler.settle_error(
                    &call_id,
                    InvokeError::DeadLetter {
                        message: message
                            .unwrap_or_else(|| "provider reported delivery failure".to_owned()),
                        log_url: self.driver.log_url(),
                    },
                );
                false
            }
            ResponseMessage::FunctionStarted { call_id } => {
                self.settler.note_started(&call_id);
                false
            }
            ResponseMessage::CpuMetrics { call_id, metrics } => {
                self.settler.note_cpu_metrics(&call_id, metrics);
                false
            }
            ResponseMessage::StopQueue => true,
        }
    }
}

struct ActiveGuard(Arc<Shared>);

impl ActiveGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn poll_loop(shared: Arc<Shared>, guard: ActiveGuard) {
    let _guard = guard;
    let mut error_attempt: u32 = 0;
    loop {
        if shared.cancel.is_cancelled() || shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        match shared.driver.poll_response_queue(&shared.cancel).await {
            Ok(batch) => {
                error_attempt = 0;
                for raw in batch.messages {
                    match serde_json::from_str::<ResponseMessage>(&raw.body) {
                        Ok(msg) => {
                            if shared.route(msg) {
                                shared.stopped.store(true, Ordering::SeqCst);
                                shared.cancel.cancel();
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping undecodable queue message");
                        }
                    }
                }
            }
            Err(e) => {
                if shared.cancel.is_cancelled() {
                    return;
                }
                let delay = backoff_delay(error_attempt.min(8));
                tracing::warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "response queue poll failed, backing off"
                );
                shared.sleeper.sleep(delay).await;
                error_attempt = error_attempt.saturating_add(1);
            }
        }
        // Shrink when outstanding calls no longer justify this poller.
        if shared.active.load(Ordering::SeqCst) > shared.desired.load(Ordering::SeqCst) {
            return;
        }
    }
}

async fn supervise(shared: Arc<Shared>) {
    let mut pollers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shared.cancel.is_cancelled() || shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let outstanding = shared.settler.pending.len();
        let want = ((outstanding + CALLS_PER_POLLER - 1) / CALLS_PER_POLLER)
            .clamp(MIN_POLLERS, shared.max_pollers);
        shared.desired.store(want, Ordering::SeqCst);

        pollers.retain(|handle| !handle.is_finished());
        while shared.active.load(Ordering::SeqCst) < want {
            let guard = ActiveGuard::new(shared.clone());
            pollers.push(tokio::spawn(poll_loop(shared.clone(), guard)));
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => {}
            _ = tokio::time::sleep(SUPERVISE_INTERVAL) => {}
        }
    }
    for handle in pollers {
        let _ = handle.await;
    }
}

pub(crate) struct ReconcilerHandle {
    supervisor: JoinHandle<()>,
    shared: Arc<Shared>,
}

/// Start the poll pool. `parent_cancel` is the instance token; the pool runs
/// on a child token so observing the sentinel does not cancel the instance.
pub(crate) fn start(
    driver: Arc<dyn ProviderDriver>,
    settler: Arc<Settler>,
    sleeper: Arc<dyn Sleeper>,
    parent_cancel: &CancellationToken,
    max_pollers: usize,
) -> ReconcilerHandle {
    let shared = Arc::new(Shared {
        driver,
        settler,
        sleeper,
        cancel: parent_cancel.child_token(),
        desired: AtomicUsize::new(MIN_POLLERS),
        active: AtomicUsize::new(0),
        stopped: AtomicBool::new(false),
        max_pollers: max_pollers.max(MIN_POLLERS),
    });
    let supervisor = tokio::spawn(supervise(shared.clone()));
    ReconcilerHandle { supervisor, shared }
}

impl ReconcilerHandle {
    pub fn active_pollers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn observed_stop(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the supervisor and every poller have exited.
    pub async fn drain(self) {
        let _ = self.supervisor.await;
    }
}
