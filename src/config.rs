//! Instance configuration.
//!
//! Options use validating builder-style setters; anything that could make
//! the engine misbehave (zero timeout, negative retention, nonpositive rate)
//! is rejected at configuration time rather than deep inside a poll loop.

use std::path::PathBuf;
use std::time::Duration;

/// Grace added to the per-call deadline on the queued path.
pub const RESPONSE_GRACE: Duration = Duration::from_millis(200);

/// How the engine routes calls to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Queue when the driver exposes a response queue, https otherwise.
    #[default]
    Auto,
    /// Synchronous request/response through `invoke_sync`.
    Https,
    /// Request queue + response queue through the reconciler.
    Queue,
}

/// Token bucket applied to outbound publishes in addition to concurrency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub target_rps: f64,
    pub burst: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("timeout must be > 0")]
    ZeroTimeout,
    #[error("retention_in_days must be >= 0 (got {0})")]
    NegativeRetention(f64),
    #[error("speculative_retry_threshold must be > 0 (got {0})")]
    InvalidThreshold(f64),
    #[error("rate limit target_rps must be > 0 (got {0})")]
    InvalidRate(f64),
    #[error("rate limit burst must be > 0")]
    ZeroBurst,
    #[error("max_pollers must be >= 2")]
    TooFewPollers,
    #[error("stats interval must be > 0")]
    ZeroStatsInterval,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Max in-flight calls per instance; 0 means unlimited.
    pub concurrency: usize,
    pub mode: Mode,
    /// Per-invocation remote time limit.
    pub timeout: Duration,
    pub gc: bool,
    /// Residual resources older than this are collected. 0 is an explicit
    /// opt-in that also collects resources owned by live processes.
    pub retention_in_days: f64,
    pub max_retries: u32,
    /// Sigma multiplier for the speculative tail-latency retry trigger.
    pub speculative_retry_threshold: f64,
    /// Completions required before speculation activates for a function.
    pub speculative_min_samples: u64,
    /// Upper bound on concurrent response-queue pollers.
    pub max_pollers: usize,
    pub rate_limit: Option<RateLimit>,
    pub stats_interval: Duration,
    /// Root of the machine-wide persistent cache. Defaults to
    /// `~/.cache/cloudburst`, falling back to the system temp directory.
    pub cache_root: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            concurrency: 100,
            mode: Mode::Auto,
            timeout: Duration::from_secs(60),
            gc: true,
            retention_in_days: 1.0,
            max_retries: 2,
            speculative_retry_threshold: 3.0,
            speculative_min_samples: 5,
            max_pollers: 16,
            rate_limit: None,
            stats_interval: Duration::from_secs(1),
            cache_root: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn gc(mut self, gc: bool) -> Self {
        self.gc = gc;
        self
    }

    pub fn retention_in_days(mut self, days: f64) -> Result<Self, ConfigError> {
        if !days.is_finite() || days < 0.0 {
            return Err(ConfigError::NegativeRetention(days));
        }
        self.retention_in_days = days;
        Ok(self)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn speculative_retry_threshold(mut self, sigma: f64) -> Result<Self, ConfigError> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ConfigError::InvalidThreshold(sigma));
        }
        self.speculative_retry_threshold = sigma;
        Ok(self)
    }

    pub fn max_pollers(mut self, max_pollers: usize) -> Result<Self, ConfigError> {
        if max_pollers < 2 {
            return Err(ConfigError::TooFewPollers);
        }
        self.max_pollers = max_pollers;
        Ok(self)
    }

    pub fn rate_limit(mut self, target_rps: f64, burst: usize) -> Result<Self, ConfigError> {
        if !target_rps.is_finite() || target_rps <= 0.0 {
            return Err(ConfigError::InvalidRate(target_rps));
        }
        if burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        self.rate_limit = Some(RateLimit { target_rps, burst });
        Ok(self)
    }

    pub fn stats_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroStatsInterval);
        }
        self.stats_interval = interval;
        Ok(self)
    }

    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    /// Effective cache root for this process.
    pub fn resolved_cache_root(&self) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".cache").join("cloudburst"),
            None => std::env::temp_dir().join("cloudburst-cache"),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs_f64(self.retention_in_days * 24.0 * 60.0 * 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = Options::default();
        assert_eq!(opts.concurrency, 100);
        assert_eq!(opts.mode, Mode::Auto);
        assert_eq!(opts.timeout, Duration::from_secs(60));
        assert!(opts.gc);
        assert_eq!(opts.retention_in_days, 1.0);
        assert_eq!(opts.max_retries, 2);
        assert_eq!(opts.speculative_retry_threshold, 3.0);
    }

    #[test]
    fn invalid_values_rejected() {
        assert_eq!(
            Options::new().timeout(Duration::ZERO).unwrap_err(),
            ConfigError::ZeroTimeout
        );
        assert_eq!(
            Options::new().retention_in_days(-1.0).unwrap_err(),
            ConfigError::NegativeRetention(-1.0)
        );
        assert_eq!(
            Options::new().speculative_retry_threshold(0.0).unwrap_err(),
            ConfigError::InvalidThreshold(0.0)
        );
        assert_eq!(Options::new().rate_limit(10.0, 0).unwrap_err(), ConfigError::ZeroBurst);
        assert_eq!(Options::new().max_pollers(1).unwrap_err(), ConfigError::TooFewPollers);
    }

    #[test]
    fn zero_retention_is_allowed() {
        let opts = Options::new().retention_in_days(0.0).unwrap();
        assert_eq!(opts.retention(), Duration::ZERO);
    }

    #[test]
    fn builder_chains() {
        let opts = Options::new()
            .concurrency(0)
            .mode(Mode::Queue)
            .max_retries(5)
            .timeout(Duration::from_secs(10))
            .unwrap()
            .rate_limit(50.0, 5)
            .unwrap();
        assert_eq!(opts.concurrency, 0);
        assert_eq!(opts.mode, Mode::Queue);
        assert_eq!(opts.max_retries, 5);
        assert_eq!(opts.rate_limit, Some(RateLimit { target_rps: 50.0, burst: 5 }));
    }
}
