//! In-memory provider for tests and examples.
//!
//! [`LoopbackDriver`] runs registered handler closures in-process over both
//! driver paths: `invoke_sync` executes inline, the queued path round-trips
//! through a real channel-backed response queue so the reconciler, deadline,
//! and speculation machinery are exercised for real. Failure behavior is
//! scripted per driver: transient sync failures, dead-lettered functions,
//! functions that never respond, and delayed function-started notifications.

use crate::driver::{PollResult, ProviderDriver, RawMessage, ResidualResource};
use crate::error::DriverError;
use crate::log_stitcher::LogEvent;
use crate::wire::{
    Call, ControlKind, CpuMetrics, ErrorPayload, ResponseMessage, ReturnPayload,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type HandlerFn = Arc<dyn Fn(Value) -> Result<Value, ErrorPayload> + Send + Sync>;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn encode(msg: &ResponseMessage) -> RawMessage {
    RawMessage { body: serde_json::to_string(msg).expect("encode response message") }
}

#[derive(Default)]
struct Behavior {
    handler_delay: Duration,
    emit_function_started: bool,
    dead_letter: HashSet<String>,
    never_respond: HashSet<String>,
    residual: Vec<ResidualResource>,
    log_pages: Vec<Vec<LogEvent>>,
}

pub struct LoopbackDriver {
    handlers: Mutex<HashMap<String, HandlerFn>>,
    behavior: Mutex<Behavior>,
    sync_transient_failures: AtomicU32,
    queue_tx: Option<mpsc::UnboundedSender<RawMessage>>,
    queue_rx: Option<tokio::sync::Mutex<mpsc::UnboundedReceiver<RawMessage>>>,
    resources_deleted: AtomicBool,
    residual_deleted: Mutex<Vec<String>>,
    invoke_count: AtomicU32,
}

impl LoopbackDriver {
    /// Driver exposing only the synchronous path.
    pub fn sync_only() -> Self {
        Self::build(false)
    }

    /// Driver exposing a response queue (and therefore the queued path).
    pub fn queued() -> Self {
        Self::build(true)
    }

    fn build(with_queue: bool) -> Self {
        let (queue_tx, queue_rx) = if with_queue {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(tokio::sync::Mutex::new(rx)))
        } else {
            (None, None)
        };
        Self {
            handlers: Mutex::new(HashMap::new()),
            behavior: Mutex::new(Behavior::default()),
            sync_transient_failures: AtomicU32::new(0),
            queue_tx,
            queue_rx,
            resources_deleted: AtomicBool::new(false),
            residual_deleted: Mutex::new(Vec::new()),
            invoke_count: AtomicU32::new(0),
        }
    }

    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, ErrorPayload> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_owned(), Arc::new(handler));
    }

    /// Fail the next `n` sync invocations with a transient driver error.
    pub fn fail_sync_transient(&self, n: u32) {
        self.sync_transient_failures.store(n, Ordering::SeqCst);
    }

    /// Delay handler execution to simulate remote latency.
    pub fn handler_delay(&self, delay: Duration) {
        self.behavior.lock().unwrap_or_else(|p| p.into_inner()).handler_delay = delay;
    }

    /// Emit a `functionstarted` message before executing queued handlers.
    pub fn emit_function_started(&self, emit: bool) {
        self.behavior.lock().unwrap_or_else(|p| p.into_inner()).emit_function_started = emit;
    }

    /// Queued calls to `name` produce a dead letter instead of a response.
    pub fn dead_letter(&self, name: &str) {
        self.behavior
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .dead_letter
            .insert(name.to_owned());
    }

    /// Queued calls to `name` never produce any response message.
    pub fn never_respond(&self, name: &str) {
        self.behavior
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .never_respond
            .insert(name.to_owned());
    }

    /// Stop dropping responses for `name`.
    pub fn respond_again(&self, name: &str) {
        self.behavior.lock().unwrap_or_else(|p| p.into_inner()).never_respond.remove(name);
    }

    pub fn script_residual(&self, resources: Vec<ResidualResource>) {
        self.behavior.lock().unwrap_or_else(|p| p.into_inner()).residual = resources;
    }

    pub fn script_log_pages(&self, pages: Vec<Vec<LogEvent>>) {
        self.behavior.lock().unwrap_or_else(|p| p.into_inner()).log_pages = pages;
    }

    /// Inject a raw message into the response queue, bypassing any handler.
    pub fn inject_message(&self, msg: &ResponseMessage) {
        if let Some(tx) = &self.queue_tx {
            let _ = tx.send(encode(msg));
        }
    }

    /// Inject a malformed body to exercise decode-error handling.
    pub fn inject_garbage(&self, body: &str) {
        if let Some(tx) = &self.queue_tx {
            let _ = tx.send(RawMessage { body: body.to_owned() });
        }
    }

    pub fn resources_deleted(&self) -> bool {
        self.resources_deleted.load(Ordering::SeqCst)
    }

    pub fn residual_deleted(&self) -> Vec<String> {
        self.residual_deleted.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Total invocations observed across both paths.
    pub fn invocations_observed(&self) -> u32 {
        self.invoke_count.load(Ordering::SeqCst)
    }

    fn handler(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.lock().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    fn run_handler(
        handler: Option<HandlerFn>,
        call: &Call,
        emit_timing: bool,
    ) -> ReturnPayload {
        let remote_start = now_ms();
        let result = match handler {
            Some(f) => f(call.args.clone()),
            None => Err(ErrorPayload {
                name: "FunctionNotFound".to_owned(),
                message: format!("no function registered under {:?}", call.name),
                stack: None,
                extra: Default::default(),
            }),
        };
        let remote_end = now_ms();
        let mut payload = match result {
            Ok(value) => ReturnPayload::returned(call.call_id.clone(), value),
            Err(error) => ReturnPayload::error(call.call_id.clone(), error),
        };
        if emit_timing {
            payload.remote_execution_start = Some(remote_start);
            payload.remote_execution_end = Some(remote_end);
            payload.remote_response_sent = Some(remote_end);
        }
        payload.instance_id = Some("loopback-0".to_owned());
        payload
    }
}

#[async_trait]
impl ProviderDriver for LoopbackDriver {
    fn provider_name(&self) -> &str {
        "loopback"
    }

    async fn invoke_sync(
        &self,
        call: &Call,
        cancel: &CancellationToken,
    ) -> Result<Option<ReturnPayload>, DriverError> {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        self.invoke_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.sync_transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.sync_transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Transient("injected transient failure".to_owned()));
        }
        let delay = self.behavior.lock().unwrap_or_else(|p| p.into_inner()).handler_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Some(Self::run_handler(self.handler(&call.name), call, true)))
    }

    async fn publish_request(&self, call: &Call) -> Result<(), DriverError> {
        let tx = self
            .queue_tx
            .clone()
            .ok_or_else(|| DriverError::Fatal("driver has no response queue".to_owned()))?;
        self.invoke_count.fetch_add(1, Ordering::SeqCst);

        let (delay, emit_started, drop_response, dead_letter) = {
            let behavior = self.behavior.lock().unwrap_or_else(|p| p.into_inner());
            (
                behavior.handler_delay,
                behavior.emit_function_started,
                behavior.never_respond.contains(&call.name),
                behavior.dead_letter.contains(&call.name),
            )
        };
        let handler = self.handler(&call.name);
        let call = call.clone();

        tokio::spawn(async move {
            if dead_letter {
                let _ = tx.send(encode(&ResponseMessage::DeadLetter {
                    call_id: call.call_id.clone(),
                    message: Some("delivery failed after provider retries".to_owned()),
                }));
                return;
            }
            if drop_response {
                return;
            }
            if emit_started {
                let _ = tx.send(encode(&ResponseMessage::FunctionStarted {
                    call_id: call.call_id.clone(),
                }));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let body = Self::run_handler(handler, &call, true);
            let _ = tx.send(encode(&ResponseMessage::Response {
                call_id: call.call_id.clone(),
                body,
            }));
        });
        Ok(())
    }

    async fn poll_response_queue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PollResult, DriverError> {
        let rx = self
            .queue_rx
            .as_ref()
            .ok_or_else(|| DriverError::Fatal("driver has no response queue".to_owned()))?;
        let mut rx = rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Ok(PollResult::default()),
            _ = tokio::time::sleep(Duration::from_millis(250)) => Ok(PollResult::default()),
            first = rx.recv() => {
                let mut messages = Vec::new();
                if let Some(msg) = first {
                    messages.push(msg);
                    while messages.len() < 10 {
                        match rx.try_recv() {
                            Ok(msg) => messages.push(msg),
                            Err(_) => break,
                        }
                    }
                }
                let is_full = messages.len() >= 10;
                Ok(PollResult { messages, is_full })
            }
        }
    }

    async fn publish_control(&self, kind: ControlKind) -> Result<(), DriverError> {
        let tx = self
            .queue_tx
            .clone()
            .ok_or_else(|| DriverError::Fatal("driver has no response queue".to_owned()))?;
        let msg = match kind {
            ControlKind::StopQueue => ResponseMessage::StopQueue,
        };
        tx.send(encode(&msg))
            .map_err(|_| DriverError::Fatal("response queue closed".to_owned()))
    }

    fn log_url(&self) -> Option<String> {
        Some("https://logs.invalid/loopback".to_owned())
    }

    async fn poll_logs(&self, start_time: i64) -> Result<Vec<LogEvent>, DriverError> {
        let mut behavior = self.behavior.lock().unwrap_or_else(|p| p.into_inner());
        if behavior.log_pages.is_empty() {
            return Ok(Vec::new());
        }
        let page = behavior.log_pages.remove(0);
        Ok(page.into_iter().filter(|e| e.timestamp >= start_time).collect())
    }

    fn response_queue_id(&self) -> Option<String> {
        self.queue_tx.as_ref().map(|_| "loopback-responses".to_owned())
    }

    async fn delete_resources(&self) -> Result<(), DriverError> {
        self.resources_deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn scan_residual_resources(&self) -> Result<Vec<ResidualResource>, DriverError> {
        Ok(self.behavior.lock().unwrap_or_else(|p| p.into_inner()).residual.clone())
    }

    async fn delete_residual(&self, resource: &ResidualResource) -> Result<(), DriverError> {
        self.residual_deleted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(resource.name.clone());
        Ok(())
    }
}

/// Latency-free cpu metrics sample for queue-path tests.
pub fn cpu_metrics_sample() -> CpuMetrics {
    CpuMetrics { utime: 1.0, stime: 0.5, elapsed: 2.5 }
}
