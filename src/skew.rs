//! Clock-skew estimation between remote function timestamps and the local
//! clock.
//!
//! Remote execution timestamps come from a machine whose clock we do not
//! control. The estimator decomposes each round trip into execution, response
//! publishing, and network halves, assumes the network is symmetric, and
//! folds the implied skew into a decaying average. Corrected latencies are
//! clamped to ≥ 1 ms so downstream statistics never see nonsense negatives.

use crate::stats::DecayingAverage;

const SKEW_SMOOTHING: f64 = 0.3;

/// Raw timestamps for one completed call. Local values are epoch ms from the
/// local clock, remote values are epoch ms from the remote function's clock.
#[derive(Debug, Clone, Copy)]
pub struct CallTiming {
    pub local_sent: i64,
    pub local_end: i64,
    pub remote_start: i64,
    pub remote_end: i64,
    /// When the remote reported the moment it published its response.
    pub remote_response_sent: Option<i64>,
}

/// Skew-corrected latency breakdown for one completed call, in ms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedLatencies {
    pub execution_time: f64,
    pub send_response_latency: f64,
    pub remote_start_latency: f64,
    pub return_latency: f64,
}

#[derive(Debug)]
pub struct SkewEstimator {
    skew: DecayingAverage,
}

impl SkewEstimator {
    pub fn new() -> Self {
        Self { skew: DecayingAverage::new(SKEW_SMOOTHING) }
    }

    /// Current skew estimate in ms (remote clock ahead of an idealized
    /// symmetric-network remote start when positive).
    pub fn skew_ms(&self) -> Option<f64> {
        self.skew.value()
    }

    /// Fold one completed call's timing into the estimate and return its
    /// corrected latencies.
    pub fn observe(&mut self, t: &CallTiming) -> CorrectedLatencies {
        let round_trip = (t.local_end - t.local_sent) as f64;
        let execution = (t.remote_end - t.remote_start) as f64;
        let send_response =
            (t.remote_response_sent.unwrap_or(t.remote_end) - t.remote_end).max(0) as f64;
        let network = round_trip - execution - send_response;
        let estimated_remote_start = t.local_sent as f64 + network / 2.0;
        let this_skew = estimated_remote_start - t.remote_start as f64;

        self.skew.update(this_skew);
        let skew = self.skew.value().unwrap_or(this_skew);

        CorrectedLatencies {
            execution_time: execution,
            send_response_latency: send_response,
            remote_start_latency: (t.remote_start as f64 + skew - t.local_sent as f64).max(1.0),
            return_latency: (t.local_end as f64 - (t.remote_end as f64 + skew)).max(1.0),
        }
    }
}

impl Default for SkewEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_clocks_split_network_evenly() {
        let mut est = SkewEstimator::new();
        // 100ms network each way, 300ms execution, clocks perfectly aligned.
        let lat = est.observe(&CallTiming {
            local_sent: 1_000,
            local_end: 1_500,
            remote_start: 1_100,
            remote_end: 1_400,
            remote_response_sent: None,
        });
        assert_eq!(lat.execution_time, 300.0);
        assert_eq!(lat.send_response_latency, 0.0);
        assert!((lat.remote_start_latency - 100.0).abs() < 1e-9);
        assert!((lat.return_latency - 100.0).abs() < 1e-9);
        assert!(est.skew_ms().unwrap().abs() < 1e-9);
    }

    #[test]
    fn first_call_adopts_skew_directly() {
        let mut est = SkewEstimator::new();
        // Remote clock 10s ahead of local.
        let lat = est.observe(&CallTiming {
            local_sent: 1_000,
            local_end: 1_500,
            remote_start: 11_100,
            remote_end: 11_400,
            remote_response_sent: None,
        });
        assert!((est.skew_ms().unwrap() + 10_000.0).abs() < 1e-9);
        // Corrected latencies look like the aligned case.
        assert!((lat.remote_start_latency - 100.0).abs() < 1e-9);
        assert!((lat.return_latency - 100.0).abs() < 1e-9);
    }

    #[test]
    fn later_calls_fold_into_ewma() {
        let mut est = SkewEstimator::new();
        let base = CallTiming {
            local_sent: 0,
            local_end: 400,
            remote_start: 100,
            remote_end: 300,
            remote_response_sent: None,
        };
        est.observe(&base);
        let first = est.skew_ms().unwrap();
        // Same shape shifted: remote clock drifts 1s ahead.
        est.observe(&CallTiming {
            remote_start: 1_100,
            remote_end: 1_300,
            ..base
        });
        let folded = est.skew_ms().unwrap();
        assert!((first - 0.0).abs() < 1e-9);
        assert!((folded - (0.3 * -1_000.0)).abs() < 1e-9);
    }

    #[test]
    fn corrected_latencies_never_below_one() {
        let mut est = SkewEstimator::new();
        // Pathological: remote claims it finished after we saw the response.
        let lat = est.observe(&CallTiming {
            local_sent: 1_000,
            local_end: 1_010,
            remote_start: 1_000,
            remote_end: 1_500,
            remote_response_sent: Some(1_700),
        });
        assert!(lat.remote_start_latency >= 1.0);
        assert!(lat.return_latency >= 1.0);
    }

    #[test]
    fn send_response_latency_is_clamped_non_negative() {
        let mut est = SkewEstimator::new();
        let lat = est.observe(&CallTiming {
            local_sent: 0,
            local_end: 500,
            remote_start: 100,
            remote_end: 400,
            remote_response_sent: Some(390),
        });
        assert_eq!(lat.send_response_latency, 0.0);
    }
}
