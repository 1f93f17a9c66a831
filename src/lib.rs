#![forbid(unsafe_code)]

//! # cloudburst
//!
//! Serverless function invocation engine: take a module of pure-compute
//! functions, deploy it behind a cloud provider, and call it like an
//! ordinary async function while the engine handles throttling, retries,
//! speculative tail-latency hedging, response-queue reconciliation, latency
//! accounting with clock-skew correction, and cloud-resource garbage
//! collection.
//!
//! ## Features
//!
//! - **Funnel admission** with FIFO concurrency limits, retroactive resizing,
//!   retry with backoff, per-key memoization, and token-bucket rate limiting
//! - **Two wire paths**: synchronous HTTP-style invocation and a
//!   request/response queue pair multiplexed by an adaptive poller pool
//! - **Speculative retries** that duplicate statistically slow calls and keep
//!   whichever response arrives first
//! - **Latency statistics** per function with EWMA clock-skew correction
//! - **Pluggable providers** behind one [`ProviderDriver`] trait, with an
//!   in-memory [`testing::LoopbackDriver`] for tests
//!
//! ## Quick start
//!
//! ```rust
//! use cloudburst::testing::LoopbackDriver;
//! use cloudburst::{CleanupOptions, Instance, Options};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Arc::new(LoopbackDriver::queued());
//!     driver.register("greet", |args| {
//!         let name = args[0].as_str().unwrap_or("world").to_owned();
//!         Ok(json!(format!("hello {name}")))
//!     });
//!
//!     let instance = Instance::initialize(driver, Options::new().gc(false)).await?;
//!     let greeting: String = instance.invoke("greet", json!(["cloud"])).await?;
//!     assert_eq!(greeting, "hello cloud");
//!     instance.cleanup(CleanupOptions::default()).await?;
//!     Ok(())
//! }
//! ```

mod cache;
mod clock;
mod config;
mod driver;
mod engine;
mod error;
mod funnel;
mod gc;
mod instance;
mod log_stitcher;
mod pending;
mod reconciler;
mod skew;
mod sleeper;
mod stats;
mod wire;

pub mod testing;

// Re-exports
pub use cache::{CacheError, PersistentCache};
pub use clock::{FixedClock, SystemClock, WallClock};
pub use config::{ConfigError, Mode, Options, RateLimit, RESPONSE_GRACE};
pub use driver::{
    CostItem, CostSnapshot, PollResult, ProviderDriver, RawMessage, ResidualResource,
};
pub use error::{DriverError, InvokeError};
pub use funnel::{
    Funnel, FunnelError, FunnelPermit, MemoFunnel, RateLimitedFunnel, RETRY_BACKOFF_BASE,
    RETRY_BACKOFF_CAP,
};
pub use instance::{CleanupOptions, Instance};
pub use log_stitcher::{LogEvent, LogStitcher, DEFAULT_SAFETY_WINDOW_MS};
pub use skew::{CallTiming, CorrectedLatencies, SkewEstimator};
pub use sleeper::{NoopSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use stats::{
    estimated_billed_ms, DecayingAverage, FunctionCounters, FunctionStats, FunctionStatsEvent,
    FunctionStatsSummary, SeriesSummary, Statistics,
};
pub use wire::{
    serialize_args_checked, Call, ControlKind, CpuMetrics, ErrorPayload, ResponseMessage,
    ReturnKind, ReturnPayload,
};

pub mod prelude;
