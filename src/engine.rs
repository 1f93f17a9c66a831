//! Invocation engine: the client-side state machine behind `invoke`.
//!
//! Routing: the synchronous path wraps `driver.invoke_sync` in the funnel's
//! retry loop; the queued path publishes a request and awaits the reconciler
//! through a take-once completion slot, re-publishing on deadline expiry
//! while the retry budget lasts and issuing at most one speculative
//! duplicate when a call's elapsed time crosses the statistical tail
//! threshold for its function. The first terminal response wins; everything
//! else is unregistered quietly.

use crate::clock::WallClock;
use crate::config::{Mode, Options, RESPONSE_GRACE};
use crate::driver::ProviderDriver;
use crate::error::InvokeError;
use crate::funnel::{backoff_delay, Funnel, FunnelError, RateLimitedFunnel};
use crate::pending::{CallOutcome, PendingCall, PendingCalls, ResponderSlot};
use crate::skew::{CallTiming, SkewEstimator};
use crate::sleeper::Sleeper;
use crate::stats::{estimated_billed_ms, CallLatencies, MetricsRegistry};
use crate::wire::{serialize_args_checked, Call, CpuMetrics, ErrorPayload, ReturnKind, ReturnPayload};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Settlement of terminal outcomes: correlation, skew-corrected timing,
/// counters. Shared by the sync path, the reconciler, and shutdown.
pub(crate) struct Settler {
    pub pending: Arc<PendingCalls>,
    pub metrics: Arc<MetricsRegistry>,
    skew: Mutex<SkewEstimator>,
    clock: Arc<dyn WallClock>,
    timeout: Duration,
    fallback_log_url: Option<String>,
}

impl Settler {
    pub fn new(
        pending: Arc<PendingCalls>,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn WallClock>,
        timeout: Duration,
        fallback_log_url: Option<String>,
    ) -> Self {
        Self {
            pending,
            metrics,
            skew: Mutex::new(SkewEstimator::new()),
            clock,
            timeout,
            fallback_log_url,
        }
    }

    /// Route a terminal response to its pending call. Unknown ids (already
    /// settled, canceled, or a speculative loser) are dropped quietly.
    pub fn settle_response(&self, payload: ReturnPayload) {
        let call_id = payload.call_id.clone();
        let Some(entry) = self.pending.remove(&call_id) else {
            tracing::debug!(call_id = %call_id, "response for unknown or settled call");
            return;
        };
        if entry.speculative {
            tracing::debug!(call_id = %call_id, "speculative attempt returned first");
        }

        let outcome: CallOutcome = match payload.kind {
            ReturnKind::Returned => Ok(payload.clone()),
            ReturnKind::Error => {
                let error = payload.error.clone().unwrap_or_else(|| ErrorPayload {
                    name: "Error".to_owned(),
                    message: "remote error with empty payload".to_owned(),
                    stack: None,
                    extra: Default::default(),
                });
                Err(InvokeError::from_payload(
                    error,
                    payload.log_url.clone().or_else(|| self.fallback_log_url.clone()),
                ))
            }
        };
        let succeeded = outcome.is_ok();
        if !entry.slot.resolve(outcome) {
            // A sibling attempt already delivered; this entry only needed
            // removal.
            return;
        }

        let name = &entry.call.name;
        let elapsed_ms = entry.sent_at.elapsed().as_secs_f64() * 1000.0;
        let mut lat = CallLatencies::default();
        match (payload.remote_execution_start, payload.remote_execution_end) {
            (Some(remote_start), Some(remote_end)) => {
                let corrected =
                    self.skew.lock().unwrap_or_else(|p| p.into_inner()).observe(&CallTiming {
                        local_sent: entry.sent_epoch_ms,
                        local_end: self.clock.now_millis(),
                        remote_start,
                        remote_end,
                        remote_response_sent: payload.remote_response_sent,
                    });
                lat.execution_time = Some(corrected.execution_time);
                lat.send_response_latency = Some(corrected.send_response_latency);
                lat.return_latency = Some(corrected.return_latency);
                lat.estimated_billed_time = Some(estimated_billed_ms(corrected.execution_time));
                if !entry.started {
                    lat.remote_start_latency = Some(corrected.remote_start_latency);
                }
            }
            _ => {
                // No remote timing reported; local round trip is the best
                // available execution measurement.
                lat.execution_time = Some(elapsed_ms);
                lat.estimated_billed_time = Some(estimated_billed_ms(elapsed_ms));
            }
        }
        self.metrics.record_latencies(name, &lat);
        self.metrics.record_completion_latency(name, elapsed_ms);
        if succeeded {
            self.metrics.record_completion(name);
        } else {
            self.metrics.record_error(name);
        }
    }

    /// Terminal failure (dead letter, exhausted retries, fatal transport).
    pub fn settle_error(&self, call_id: &str, err: InvokeError) {
        let Some(entry) = self.pending.remove(call_id) else {
            tracing::debug!(call_id = %call_id, "error for unknown or settled call");
            return;
        };
        let name = entry.call.name.clone();
        let elapsed_ms = entry.sent_at.elapsed().as_secs_f64() * 1000.0;
        if entry.slot.resolve(Err(err)) {
            self.metrics.record_completion_latency(&name, elapsed_ms);
            self.metrics.record_error(&name);
        }
    }

    /// Out-of-band function-started notification: start-latency sample plus
    /// a deadline extension. Arrivals after completion are ignored.
    pub fn note_started(&self, call_id: &str) {
        if let Some((name, elapsed)) =
            self.pending.mark_started(call_id, self.timeout + RESPONSE_GRACE)
        {
            self.metrics.record_remote_start(&name, elapsed.as_secs_f64() * 1000.0);
        }
    }

    pub fn note_cpu_metrics(&self, call_id: &str, metrics: CpuMetrics) {
        if !self.pending.push_cpu_metrics(call_id, metrics) {
            tracing::trace!(call_id = %call_id, "cpu metrics for unknown call");
        }
    }

    /// Fail every outstanding call with the cancellation error. Returns how
    /// many were canceled.
    pub fn cancel_all(&self) -> usize {
        let entries = self.pending.drain();
        let mut canceled = 0;
        for entry in entries {
            let name = entry.call.name.clone();
            if entry.slot.resolve(Err(InvokeError::RejectedPendingRequest)) {
                self.metrics.record_error(&name);
                canceled += 1;
            }
        }
        canceled
    }
}

pub(crate) struct InvocationEngine {
    driver: Arc<dyn ProviderDriver>,
    options: Options,
    mode: Mode,
    funnel: Funnel,
    throttle: Option<RateLimitedFunnel>,
    settler: Arc<Settler>,
    clock: Arc<dyn WallClock>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl InvocationEngine {
    pub fn new(
        driver: Arc<dyn ProviderDriver>,
        options: Options,
        settler: Arc<Settler>,
        clock: Arc<dyn WallClock>,
        sleeper: Arc<dyn Sleeper>,
        cancel: CancellationToken,
    ) -> Self {
        let mode = match options.mode {
            Mode::Auto => {
                if driver.response_queue_id().is_some() {
                    Mode::Queue
                } else {
                    Mode::Https
                }
            }
            mode => mode,
        };
        let funnel = Funnel::with_sleeper(options.concurrency, sleeper.clone());
        let throttle = options
            .rate_limit
            .map(|rl| RateLimitedFunnel::with_sleeper(0, rl.target_rps, rl.burst, sleeper.clone()));
        Self {
            driver,
            options,
            mode,
            funnel,
            throttle,
            settler,
            clock,
            sleeper,
            cancel,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn outstanding(&self) -> usize {
        self.settler.pending.len()
    }

    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, InvokeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(InvokeError::RejectedPendingRequest);
        }
        let (_wire, warnings) = serialize_args_checked(&args)?;
        for warning in &warnings {
            tracing::warn!(function = name, %warning, "argument round trip lost information");
        }
        match self.mode {
            Mode::Queue => self.invoke_queued(name, args).await,
            _ => self.invoke_sync(name, args).await,
        }
    }

    /// Refuse new calls, reject queued funnel waiters, and cancel every
    /// outstanding call.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.funnel.close();
        let canceled = self.settler.cancel_all();
        if canceled > 0 {
            tracing::debug!(canceled, "canceled outstanding calls at stop");
        }
    }

    fn fresh_call(&self, name: &str, args: Value, queued: bool) -> Call {
        Call {
            call_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            args,
            response_queue_id: if queued { self.driver.response_queue_id() } else { None },
            start: self.clock.now_millis(),
            attempt: 0,
        }
    }

    fn register(&self, call: &Call, sent_at: Instant, slot: ResponderSlot, speculative: bool) {
        self.settler.pending.register(PendingCall {
            call: call.clone(),
            sent_at,
            sent_epoch_ms: call.start,
            deadline: sent_at + self.options.timeout + RESPONSE_GRACE,
            started: false,
            speculative,
            cpu_metrics: Vec::new(),
            slot,
        });
        self.settler.metrics.record_invocation(&call.name);
    }

    async fn throttled_publish(&self, call: &Call) -> Result<(), InvokeError> {
        if let Some(throttle) = &self.throttle {
            throttle.throttle().await;
        }
        self.driver.publish_request(call).await.map_err(InvokeError::from)
    }

    async fn invoke_sync(&self, name: &str, args: Value) -> Result<Value, InvokeError> {
        let sent_at = Instant::now();
        let call = self.fresh_call(name, args, false);
        let call_id = call.call_id.clone();
        let (slot, rx) = ResponderSlot::new();
        self.register(&call, sent_at, slot, false);

        let deadline = self.options.timeout + RESPONSE_GRACE;
        let metrics = self.settler.metrics.clone();
        let retry_metrics = self.settler.metrics.clone();
        let max_retries = self.options.max_retries;
        let retry_name = name.to_owned();
        let driver = self.driver.clone();
        let cancel = self.cancel.clone();
        let throttle = self.throttle.clone();
        let timeout = self.options.timeout;

        let result = self
            .funnel
            .push_retry(
                move |e: &InvokeError, attempt| {
                    let retry = e.is_transient() && attempt < max_retries;
                    if retry {
                        retry_metrics.record_retry(&retry_name);
                    }
                    retry
                },
                |attempt| {
                    let mut call = call.clone();
                    call.attempt = attempt;
                    let driver = driver.clone();
                    let cancel = cancel.clone();
                    let throttle = throttle.clone();
                    let metrics = metrics.clone();
                    async move {
                        if let Some(throttle) = &throttle {
                            throttle.throttle().await;
                        }
                        if attempt == 0 {
                            metrics.record_latencies(
                                &call.name,
                                &CallLatencies {
                                    local_start_latency: Some(
                                        sent_at.elapsed().as_secs_f64() * 1000.0,
                                    ),
                                    ..Default::default()
                                },
                            );
                        }
                        match tokio::time::timeout(deadline, driver.invoke_sync(&call, &cancel))
                            .await
                        {
                            Ok(Ok(Some(payload))) => Ok(payload),
                            Ok(Ok(None)) => Err(InvokeError::Fatal(
                                "provider exposes no synchronous path".to_owned(),
                            )),
                            Ok(Err(e)) => Err(InvokeError::from(e)),
                            Err(_) => Err(InvokeError::FunctionTimeout {
                                elapsed: deadline,
                                timeout,
                            }),
                        }
                    }
                },
            )
            .await;

        match result {
            Ok(mut payload) => {
                // Correlate on our id even if the driver echoed stale state.
                payload.call_id = call_id.clone();
                self.settler.settle_response(payload);
            }
            Err(FunnelError::Rejected) => {
                self.settler.settle_error(&call_id, InvokeError::RejectedPendingRequest);
            }
            Err(FunnelError::Inner(e)) => {
                self.settler.settle_error(&call_id, e);
            }
        }
        finish(rx.await.map_err(|_| InvokeError::RejectedPendingRequest))
    }

    async fn invoke_queued(&self, name: &str, args: Value) -> Result<Value, InvokeError> {
        // One permit spans the whole publish-to-response lifetime.
        let _permit = self
            .funnel
            .admit::<InvokeError>()
            .await
            .map_err(|_| InvokeError::RejectedPendingRequest)?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(InvokeError::RejectedPendingRequest);
        }

        let sent_at = Instant::now();
        let call = self.fresh_call(name, args, true);
        let primary_id = call.call_id.clone();
        let (slot, mut rx) = ResponderSlot::new();
        self.register(&call, sent_at, slot.clone(), false);

        let mut attempt = 0u32;
        // Initial publish, retrying transient transport failures in place.
        loop {
            match self.throttled_publish(&call).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.options.max_retries => {
                    self.settler.metrics.record_retry(name);
                    self.sleeper.sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.settler.settle_error(&primary_id, e);
                    break;
                }
            }
        }
        self.settler.metrics.record_latencies(
            name,
            &CallLatencies {
                local_start_latency: Some(sent_at.elapsed().as_secs_f64() * 1000.0),
                ..Default::default()
            },
        );

        let mut speculative_at: Option<Instant> = self
            .settler
            .metrics
            .speculative_threshold_ms(
                name,
                self.options.speculative_retry_threshold,
                self.options.speculative_min_samples,
            )
            .map(|ms| sent_at + Duration::from_secs_f64(ms / 1000.0));
        let mut speculative_id: Option<String> = None;

        let outcome = loop {
            let primary_deadline = self.settler.pending.deadline(&primary_id);
            let sibling_deadline =
                speculative_id.as_deref().and_then(|id| self.settler.pending.deadline(id));
            // The call survives while its latest attempt survives.
            let next_deadline = match (primary_deadline, sibling_deadline) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                outcome = &mut rx => {
                    break outcome.map_err(|_| InvokeError::RejectedPendingRequest).and_then(|o| o);
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if next_deadline.is_some() => {
                    let now = Instant::now();
                    let still_live = self
                        .settler
                        .pending
                        .deadline(&primary_id)
                        .into_iter()
                        .chain(speculative_id.as_deref().and_then(|id| self.settler.pending.deadline(id)))
                        .any(|d| now < d);
                    if still_live {
                        // Extended by a functionstarted notification.
                        continue;
                    }
                    if attempt < self.options.max_retries {
                        self.settler.metrics.record_retry(name);
                        attempt += 1;
                        let new_deadline = now + self.options.timeout + RESPONSE_GRACE;
                        if self.settler.pending.bump_attempt(&primary_id, new_deadline).is_some() {
                            let mut retry_call = call.clone();
                            retry_call.attempt = attempt;
                            if let Err(e) = self.throttled_publish(&retry_call).await {
                                if !e.is_transient() {
                                    self.settler.settle_error(&primary_id, e);
                                }
                                // Transient republish failures wait for the
                                // next deadline expiry.
                            }
                        }
                    } else {
                        let err = InvokeError::FunctionTimeout {
                            elapsed: sent_at.elapsed(),
                            timeout: self.options.timeout,
                        };
                        if let Some(id) = speculative_id.as_deref() {
                            self.settler.pending.remove(id);
                        }
                        self.settler.settle_error(&primary_id, err);
                        // If the primary entry was already gone, resolve the
                        // slot directly so the caller cannot hang.
                        if slot.resolve(Err(InvokeError::FunctionTimeout {
                            elapsed: sent_at.elapsed(),
                            timeout: self.options.timeout,
                        })) {
                            self.settler.metrics.record_error(name);
                        }
                    }
                }
                _ = tokio::time::sleep_until(speculative_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if speculative_at.is_some() && speculative_id.is_none() => {
                    if !self.settler.pending.contains(&primary_id) {
                        // Already settled; the rx arm will observe it next.
                        speculative_at = None;
                        continue;
                    }
                    let mut sibling = self.fresh_call(name, call.args.clone(), true);
                    sibling.attempt = attempt;
                    tracing::debug!(
                        function = name,
                        primary = %primary_id,
                        sibling = %sibling.call_id,
                        "issuing speculative retry for tail latency"
                    );
                    self.register(&sibling, Instant::now(), slot.clone(), true);
                    self.settler.metrics.record_retry(name);
                    match self.throttled_publish(&sibling).await {
                        Ok(()) => speculative_id = Some(sibling.call_id),
                        Err(e) => {
                            tracing::warn!(error = %e, "speculative publish failed");
                            self.settler.pending.remove(&sibling.call_id);
                            speculative_id = Some(sibling.call_id); // do not re-issue
                        }
                    }
                }
            }
        };

        // Unregister whichever attempts lost.
        self.settler.pending.remove(&primary_id);
        if let Some(id) = speculative_id.as_deref() {
            self.settler.pending.remove(id);
        }
        finish(Ok(outcome))
    }
}

fn finish(
    outcome: Result<Result<ReturnPayload, InvokeError>, InvokeError>,
) -> Result<Value, InvokeError> {
    let payload = outcome??;
    match payload.kind {
        ReturnKind::Returned => Ok(payload.value.unwrap_or(Value::Null)),
        ReturnKind::Error => Err(InvokeError::from_payload(
            payload.error.unwrap_or_default(),
            payload.log_url,
        )),
    }
}
