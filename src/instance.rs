//! Lifecycle controller: one live deployment on one provider.
//!
//! An [`Instance`] owns the invocation engine, the queue reconciler (queue
//! mode), the log follower, the stats ticker, and the garbage collection
//! pass. `stop` is idempotent and leaves cloud resources in place;
//! `cleanup` additionally tears them down, and may be called twice (first
//! without deletion for debugging, then with it).

use crate::cache::{CacheError, PersistentCache};
use crate::clock::{SystemClock, WallClock};
use crate::config::{Mode, Options};
use crate::driver::{CostSnapshot, ProviderDriver};
use crate::engine::{InvocationEngine, Settler};
use crate::error::{DriverError, InvokeError};
use crate::gc;
use crate::log_stitcher::{LogEvent, LogStitcher};
use crate::pending::PendingCalls;
use crate::reconciler::{self, ReconcilerHandle};
use crate::sleeper::TokioSleeper;
use crate::stats::{FunctionCounters, FunctionStatsEvent, FunctionStatsSummary, MetricsRegistry};
use crate::wire::ControlKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const GC_CACHE_CATEGORY: &str = "gc";

#[derive(Debug, Clone, Copy)]
pub struct CleanupOptions {
    pub delete_resources: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self { delete_resources: true }
    }
}

pub struct Instance {
    driver: Arc<dyn ProviderDriver>,
    engine: Arc<InvocationEngine>,
    metrics: Arc<MetricsRegistry>,
    options: Options,
    cancel: CancellationToken,
    reconciler: Mutex<Option<ReconcilerHandle>>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    log_task: Mutex<Option<JoinHandle<()>>>,
    gc_task: Mutex<Option<JoinHandle<usize>>>,
    stats_tx: broadcast::Sender<FunctionStatsEvent>,
    log_tx: broadcast::Sender<LogEvent>,
    stopped: AtomicBool,
}

impl Instance {
    /// Bring up an instance over an already-provisioned driver.
    pub async fn initialize(
        driver: Arc<dyn ProviderDriver>,
        options: Options,
    ) -> Result<Self, CacheError> {
        let clock: Arc<dyn WallClock> = Arc::new(SystemClock);
        let cancel = CancellationToken::new();
        let pending = Arc::new(PendingCalls::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let settler = Arc::new(Settler::new(
            pending,
            metrics.clone(),
            clock.clone(),
            options.timeout,
            driver.log_url(),
        ));
        let engine = Arc::new(InvocationEngine::new(
            driver.clone(),
            options.clone(),
            settler.clone(),
            clock.clone(),
            Arc::new(TokioSleeper),
            cancel.clone(),
        ));

        let reconciler = if engine.mode() == Mode::Queue {
            Some(reconciler::start(
                driver.clone(),
                settler,
                Arc::new(TokioSleeper),
                &cancel,
                options.max_pollers,
            ))
        } else {
            None
        };

        let (stats_tx, _) = broadcast::channel(256);
        let stats_task = spawn_stats_ticker(
            metrics.clone(),
            stats_tx.clone(),
            cancel.clone(),
            options.stats_interval,
        );

        let (log_tx, _) = broadcast::channel(1024);
        let log_task = spawn_log_follower(driver.clone(), log_tx.clone(), cancel.clone());

        let gc_task = if options.gc {
            let cache = PersistentCache::new(
                options.resolved_cache_root(),
                driver.provider_name(),
                GC_CACHE_CATEGORY,
                Duration::from_secs(7 * 24 * 60 * 60),
            )
            .await?;
            let driver = driver.clone();
            let retention = options.retention();
            Some(tokio::spawn(async move {
                gc::maybe_collect(driver, &cache, &SystemClock, retention).await
            }))
        } else {
            None
        };

        Ok(Self {
            driver,
            engine,
            metrics,
            options,
            cancel,
            reconciler: Mutex::new(reconciler),
            stats_task: Mutex::new(Some(stats_task)),
            log_task: Mutex::new(Some(log_task)),
            gc_task: Mutex::new(gc_task),
            stats_tx,
            log_tx,
            stopped: AtomicBool::new(false),
        })
    }

    /// Invoke a remote function with serializable arguments, deserializing
    /// the result.
    pub async fn invoke<A, R>(&self, name: &str, args: A) -> Result<R, InvokeError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let value = self.engine.invoke(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke with a pre-serialized argument payload.
    pub async fn invoke_raw(&self, name: &str, args: Value) -> Result<Value, InvokeError> {
        self.engine.invoke(name, args).await
    }

    /// Stop accepting and cancel everything outstanding. Cloud resources are
    /// left in place; see [`cleanup`](Self::cleanup). Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // Let the reconciler drain on its own sentinel first; a dead queue
        // just means the drain falls through to the hard cancellation below.
        let reconciler = self.reconciler.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = reconciler {
            if let Err(e) = self.driver.publish_control(ControlKind::StopQueue).await {
                tracing::debug!(error = %e, "stop sentinel publish failed");
            }
            if tokio::time::timeout(DRAIN_TIMEOUT, handle.drain()).await.is_err() {
                tracing::warn!("reconciler did not drain within {:?}", DRAIN_TIMEOUT);
            }
        }

        self.engine.stop().await;
        if let Some(task) = self.stats_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = task.await;
        }
        if let Some(task) = self.log_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = task.await;
        }
    }

    /// Stop, await the garbage collection pass, and optionally delete this
    /// instance's cloud resources. May be called twice.
    pub async fn cleanup(&self, opts: CleanupOptions) -> Result<(), DriverError> {
        self.stop().await;
        let gc_task = self.gc_task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = gc_task {
            match task.await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, "garbage collection finished");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "garbage collection task failed"),
            }
        }
        if opts.delete_resources {
            self.driver.delete_resources().await?;
        }
        Ok(())
    }

    pub fn cost_estimate(&self) -> Option<CostSnapshot> {
        self.driver
            .cost_estimate(&self.metrics.aggregate_counters(), &self.metrics.aggregate_stats())
    }

    /// Per-function stats deltas, emitted once per stats interval.
    pub fn stats_events(&self) -> broadcast::Receiver<FunctionStatsEvent> {
        self.stats_tx.subscribe()
    }

    /// Deduplicated remote log events.
    pub fn log_events(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    pub fn counters(&self, name: &str) -> FunctionCounters {
        self.metrics.counters(name)
    }

    pub fn aggregate_counters(&self) -> FunctionCounters {
        self.metrics.aggregate_counters()
    }

    pub fn stats(&self, name: &str) -> Option<FunctionStatsSummary> {
        self.metrics.stats(name)
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    pub fn log_url(&self) -> Option<String> {
        self.driver.log_url()
    }

    pub fn outstanding(&self) -> usize {
        self.engine.outstanding()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

fn spawn_stats_ticker(
    metrics: Arc<MetricsRegistry>,
    tx: broadcast::Sender<FunctionStatsEvent>,
    cancel: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for event in metrics.drain_window() {
                        let _ = tx.send(event);
                    }
                }
            }
        }
    })
}

fn spawn_log_follower(
    driver: Arc<dyn ProviderDriver>,
    tx: broadcast::Sender<LogEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stitcher = LogStitcher::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(LOG_POLL_INTERVAL) => {}
            }
            match driver.poll_logs(stitcher.start_time()).await {
                Ok(page) => {
                    for event in stitcher.ingest(page) {
                        let _ = tx.send(event);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "log poll failed"),
            }
        }
    })
}
