//! In-memory latency histogram for per-record scoring.
//! Records wall time from task submission to a finished risk row.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

/// p50/p95/p99/max in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyPercentiles {
    pub samples: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Shared latency stats. Workers record, the runner reads at the end.
/// Values stored in microseconds.
pub struct LatencyStats {
    inner: Mutex<Option<Histogram<u64>>>,
}

impl LatencyStats {
    /// Tracks 1us to 100s, 3 significant figures.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Histogram::new_with_bounds(1, 100_000_000, 3).ok()),
        }
    }

    pub fn record_us(&self, us: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                let _ = h.saturating_record(us.max(1));
            }
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        self.record_us(us);
    }

    /// None if no samples.
    pub fn percentiles(&self) -> Option<LatencyPercentiles> {
        let guard = self.inner.lock().ok()?;
        let h = guard.as_ref()?;
        if h.len() == 0 {
            return None;
        }
        Some(LatencyPercentiles {
            samples: h.len(),
            p50_us: h.value_at_quantile(0.5),
            p95_us: h.value_at_quantile(0.95),
            p99_us: h.value_at_quantile(0.99),
            max_us: h.max(),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                h.reset();
            }
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_percentiles() {
        let stats = LatencyStats::new();
        assert!(stats.percentiles().is_none());
        assert!(stats.is_empty());
    }

    #[test]
    fn percentiles_are_ordered() {
        let stats = LatencyStats::new();
        for us in 1..=1000 {
            stats.record(Duration::from_micros(us));
        }
        let p = stats.percentiles().unwrap();
        assert_eq!(p.samples, 1000);
        assert!(p.p50_us <= p.p95_us && p.p95_us <= p.p99_us && p.p99_us <= p.max_us);
        assert!((495..=505).contains(&p.p50_us), "{p:?}");
        stats.reset();
        assert!(stats.is_empty());
    }
}
