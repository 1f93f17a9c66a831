//! Garbage collection of residual cloud resources.
//!
//! Crashed or killed client processes leave functions, queues, and log
//! groups behind. At most once per hour per machine (gated through the
//! persistent cache), a scan enumerates the provider namespace and deletes
//! resources older than the retention threshold. Deletions flow through a
//! dedicated funnel so collection never competes with live invocations for
//! provider API quota.
//!
//! A retention of zero collects resources that may belong to live processes
//! on other machines. That is an explicit opt-in for wiping a namespace, not
//! a default anyone should run.

use crate::cache::PersistentCache;
use crate::clock::WallClock;
use crate::driver::ProviderDriver;
use crate::error::DriverError;
use crate::funnel::Funnel;
use std::sync::Arc;
use std::time::Duration;

const GC_LAST_RUN_KEY: &str = "gc-last-run";
const MIN_RUN_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DELETE_CONCURRENCY: usize = 5;

/// Run one collection pass if the hourly gate allows it. Returns the number
/// of resources deleted. Failures are logged, never propagated: collection
/// is best-effort housekeeping.
pub(crate) async fn maybe_collect(
    driver: Arc<dyn ProviderDriver>,
    cache: &PersistentCache,
    clock: &dyn WallClock,
    retention: Duration,
) -> usize {
    let now_ms = clock.now_millis();
    match cache.get(GC_LAST_RUN_KEY).await {
        Ok(Some(bytes)) => {
            let last = std::str::from_utf8(&bytes).ok().and_then(|s| s.trim().parse::<i64>().ok());
            if let Some(last) = last {
                if now_ms.saturating_sub(last) < MIN_RUN_INTERVAL.as_millis() as i64 {
                    tracing::debug!("skipping garbage collection, ran within the last hour");
                    return 0;
                }
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "could not read garbage collection marker"),
    }

    let candidates = match driver.scan_residual_resources().await {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::warn!(error = %e, "residual resource scan failed");
            return 0;
        }
    };

    if retention.is_zero() {
        tracing::warn!(
            "retention is zero: collecting resources that may belong to live instances"
        );
    }
    let cutoff = now_ms - retention.as_millis() as i64;
    let stale: Vec<_> = candidates.into_iter().filter(|r| r.created_at <= cutoff).collect();
    if stale.is_empty() {
        record_run(cache, now_ms).await;
        return 0;
    }
    tracing::info!(
        provider = driver.provider_name(),
        count = stale.len(),
        "collecting residual resources"
    );

    let funnel = Funnel::new(DELETE_CONCURRENCY);
    let deletions = stale.into_iter().map(|resource| {
        let funnel = funnel.clone();
        let driver = driver.clone();
        async move {
            let name = resource.name.clone();
            let result: Result<(), crate::funnel::FunnelError<DriverError>> = funnel
                .push(async move { driver.delete_residual(&resource).await })
                .await;
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(resource = %name, error = %e, "residual deletion failed");
                    false
                }
            }
        }
    });
    let deleted = futures::future::join_all(deletions)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

    record_run(cache, now_ms).await;
    deleted
}

async fn record_run(cache: &PersistentCache, now_ms: i64) {
    if let Err(e) = cache.set(GC_LAST_RUN_KEY, now_ms.to_string().as_bytes()).await {
        tracing::warn!(error = %e, "could not record garbage collection marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::driver::ResidualResource;
    use crate::testing::LoopbackDriver;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    async fn gc_cache() -> (tempfile::TempDir, PersistentCache) {
        let root = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(
            root.path(),
            "loopback",
            "gc",
            Duration::from_secs(7 * 24 * 60 * 60),
        )
        .await
        .unwrap();
        (root, cache)
    }

    #[tokio::test]
    async fn collects_only_resources_past_retention() {
        let (_root, cache) = gc_cache().await;
        let clock = FixedClock::new(10 * DAY_MS);
        let driver = Arc::new(LoopbackDriver::queued());
        driver.script_residual(vec![
            ResidualResource { name: "old-fn".into(), created_at: 8 * DAY_MS },
            ResidualResource { name: "fresh-fn".into(), created_at: 10 * DAY_MS - 1000 },
        ]);

        let deleted =
            maybe_collect(driver.clone(), &cache, &clock, Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(deleted, 1);
        assert_eq!(driver.residual_deleted(), vec!["old-fn".to_owned()]);
    }

    #[tokio::test]
    async fn second_run_within_an_hour_is_skipped() {
        let (_root, cache) = gc_cache().await;
        let clock = FixedClock::new(10 * DAY_MS);
        let driver = Arc::new(LoopbackDriver::queued());
        driver.script_residual(vec![ResidualResource {
            name: "old-fn".into(),
            created_at: 0,
        }]);

        let first =
            maybe_collect(driver.clone(), &cache, &clock, Duration::from_secs(60)).await;
        assert_eq!(first, 1);

        clock.advance(30 * 60 * 1000);
        let second =
            maybe_collect(driver.clone(), &cache, &clock, Duration::from_secs(60)).await;
        assert_eq!(second, 0, "gated by the hourly marker");
        assert_eq!(driver.residual_deleted().len(), 1);
    }

    #[tokio::test]
    async fn zero_retention_collects_everything() {
        let (_root, cache) = gc_cache().await;
        let clock = FixedClock::new(10 * DAY_MS);
        let driver = Arc::new(LoopbackDriver::queued());
        driver.script_residual(vec![
            ResidualResource { name: "a".into(), created_at: 10 * DAY_MS },
            ResidualResource { name: "b".into(), created_at: 0 },
        ]);

        let deleted = maybe_collect(driver.clone(), &cache, &clock, Duration::ZERO).await;
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn empty_scan_still_records_the_run() {
        let (_root, cache) = gc_cache().await;
        let clock = FixedClock::new(10 * DAY_MS);
        let driver = Arc::new(LoopbackDriver::queued());

        maybe_collect(driver.clone(), &cache, &clock, Duration::from_secs(60)).await;
        assert!(cache.get("gc-last-run").await.unwrap().is_some());
    }
}
