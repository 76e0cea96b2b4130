//! Transfer-rate export.
//!
//! Every live transfer holds a [`RateExporter`]; each exporter keeps
//! its own running byte total and folds the same increment into a
//! shared process-wide counter, so the counter equals the sum of all
//! exporters' totals at every observation point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use prometheus::IntCounter;

static TRANSFERRED: OnceLock<IntCounter> = OnceLock::new();

/// The process-wide transferred-bytes counter, registered in the
/// default registry on first use.
pub fn transferred_bytes() -> IntCounter {
    TRANSFERRED
        .get_or_init(|| {
            let c = IntCounter::new(
                "flowgrid_blob_transferred_bytes",
                "Bytes moved between blob stores and the repository",
            )
            .expect("counter construction cannot fail");
            // Registration only fails on duplicate names; the
            // OnceLock guarantees this runs once.
            let _ = prometheus::default_registry().register(Box::new(c.clone()));
            c
        })
        .clone()
}

/// One transfer's contribution to the shared counter.
pub struct RateExporter {
    counter: IntCounter,
    total: AtomicU64,
}

impl RateExporter {
    pub fn new(counter: IntCounter) -> Self {
        RateExporter {
            counter,
            total: AtomicU64::new(0),
        }
    }

    /// Record `n` transferred bytes against both this exporter and
    /// the shared counter.
    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        self.counter.inc_by(n);
    }

    /// This exporter's running total.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn exporter_totals_sum_to_counter() {
        let mut rng = rand::thread_rng();
        let counter = IntCounter::new("test_transferred_bytes", "test").unwrap();
        let n_exporters = 5 + rng.gen_range(0..10);
        let n_rounds = 5 + rng.gen_range(0..10);

        let exporters: Vec<RateExporter> = (0..n_exporters)
            .map(|_| RateExporter::new(counter.clone()))
            .collect();

        for _ in 0..n_rounds {
            for e in &exporters {
                e.add(rng.gen_range(1u64 << 20..10u64 << 20));
            }
            let sum: u64 = exporters.iter().map(|e| e.total()).sum();
            assert_eq!(counter.get(), sum);
        }
    }

    #[test]
    fn shared_counter_is_a_singleton() {
        let a = transferred_bytes();
        let b = transferred_bytes();
        let before = a.get();
        RateExporter::new(b).add(17);
        assert_eq!(a.get(), before + 17);
    }
}
