//! Instance-type selection with unavailability tracking.
//!
//! `SelectorState` keeps the catalog sorted by descending memory and
//! remembers, per type, when a launch last failed for capacity. A
//! marked type is excluded from selection for the configured sleep
//! interval; entries are never evicted, only superseded by a newer
//! mark.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flow_core::Resources;

use crate::catalog::InstanceConfig;

/// Extra EBS throughput (percent) required before paying a price
/// premium for an otherwise-equivalent type.
pub const EBS_THROUGHPUT_BENEFIT_PCT: f64 = 50.0;

/// Absolute premium (USD/hour) we are willing to pay for the
/// throughput benefit.
pub const EBS_THROUGHPUT_PREMIUM_COST: f64 = 0.03;

/// Relative premium (percent) we are willing to pay for the
/// throughput benefit.
pub const EBS_THROUGHPUT_PREMIUM_PCT: f64 = 15.0;

/// Tracks what is known about instance types and implements type
/// selection under runtime criteria. All operations serialize on one
/// internal mutex; no other lock is taken while it is held.
pub struct SelectorState {
    configs: Vec<InstanceConfig>,
    sleep_time: Duration,
    region: String,
    unavailable: Mutex<HashMap<String, Instant>>,
}

impl SelectorState {
    pub fn new(
        mut configs: Vec<InstanceConfig>,
        sleep_time: Duration,
        region: impl Into<String>,
    ) -> Self {
        configs.sort_by(|a, b| {
            b.resources
                .get("mem")
                .partial_cmp(&a.resources.get("mem"))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        SelectorState {
            configs,
            sleep_time,
            region: region.into(),
            unavailable: Mutex::new(HashMap::new()),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Record that launching `config` just failed for capacity. The
    /// type is excluded from selection for the sleep interval.
    pub fn mark_unavailable(&self, config: &InstanceConfig) {
        self.unavailable
            .lock()
            .unwrap()
            .insert(config.instance_type.clone(), Instant::now());
    }

    /// Whether any configuration can satisfy `need` at all,
    /// regardless of availability marks.
    pub fn available(&self, need: &Resources) -> bool {
        self.configs.iter().any(|c| c.resources.available(need))
    }

    /// The "largest" available configuration satisfying `need`,
    /// ranked by scaled distance from the requirement. With `spot`,
    /// only spot-eligible types are considered.
    pub fn max_available(&self, need: &Resources, spot: bool) -> Option<InstanceConfig> {
        let unavailable = self.unavailable.lock().unwrap();
        let mut best: Option<&InstanceConfig> = None;
        let mut distance = f64::NEG_INFINITY;
        for config in &self.configs {
            if marked(&unavailable, self.sleep_time, &config.instance_type)
                || (spot && !config.spot_ok)
            {
                continue;
            }
            if !config.resources.available(need) {
                continue;
            }
            let d = config.resources.scaled_distance(need);
            if d > distance {
                distance = d;
                best = Some(config);
            }
        }
        best.cloned()
    }

    /// The cheapest available configuration satisfying `need` in this
    /// region, adjusted for EBS throughput: a viable type with at
    /// least [`EBS_THROUGHPUT_BENEFIT_PCT`] more throughput is
    /// preferred when its price stays within the absolute or relative
    /// premium, after which a strictly cheaper type matching the
    /// upgraded throughput is adopted.
    pub fn min_available(&self, need: &Resources, spot: bool) -> Option<InstanceConfig> {
        let unavailable = self.unavailable.lock().unwrap();
        let mut viable: Vec<(&InstanceConfig, f64)> = Vec::new();
        let mut best: Option<&InstanceConfig> = None;
        let mut best_price = f64::MAX;
        for config in &self.configs {
            if marked(&unavailable, self.sleep_time, &config.instance_type)
                || (spot && !config.spot_ok)
            {
                continue;
            }
            if !config.resources.available(need) {
                continue;
            }
            let Some(&price) = config.price.get(&self.region) else {
                continue;
            };
            viable.push((config, price));
            if price < best_price {
                best_price = price;
                best = Some(config);
            }
        }

        // Pay a bounded premium for substantially better EBS
        // throughput, at most once; then adopt anything cheaper that
        // matches the upgraded throughput.
        let mut found = false;
        for (config, price) in &viable {
            let price = *price;
            let best_throughput = best.map(|b| b.ebs_throughput).unwrap_or_default();
            if !found
                && (price < best_price + EBS_THROUGHPUT_PREMIUM_COST
                    || price < best_price * (1.0 + EBS_THROUGHPUT_PREMIUM_PCT / 100.0))
                && config.ebs_throughput
                    > best_throughput * (1.0 + EBS_THROUGHPUT_BENEFIT_PCT / 100.0)
            {
                best_price = price;
                best = Some(config);
                found = true;
            }
            if found
                && price < best_price
                && config.ebs_throughput >= best.map(|b| b.ebs_throughput).unwrap_or_default()
            {
                best_price = price;
                best = Some(config);
            }
        }
        best.cloned()
    }

    /// The named configuration, iff it is not currently marked
    /// unavailable.
    pub fn type_named(&self, name: &str) -> Option<InstanceConfig> {
        let unavailable = self.unavailable.lock().unwrap();
        if marked(&unavailable, self.sleep_time, name) {
            return None;
        }
        self.configs
            .iter()
            .find(|c| c.instance_type == name)
            .cloned()
    }
}

fn marked(unavailable: &HashMap<String, Instant>, sleep_time: Duration, name: &str) -> bool {
    unavailable
        .get(name)
        .is_some_and(|t| t.elapsed() < sleep_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::resources::GIB;
    use std::collections::BTreeMap;

    fn config(name: &str, cpu: f64, mem_gib: f64, price: f64, throughput: f64) -> InstanceConfig {
        let mut prices = BTreeMap::new();
        prices.insert("us-east-1".to_string(), price);
        InstanceConfig {
            instance_type: name.to_string(),
            ebs_optimized: true,
            ebs_throughput: throughput,
            resources: Resources::with_cpu_mem(cpu, mem_gib * GIB),
            price: prices,
            spot_ok: true,
            nvme: false,
        }
    }

    fn need(cpu: f64, mem_gib: f64) -> Resources {
        Resources::with_cpu_mem(cpu, mem_gib * GIB)
    }

    fn selector(configs: Vec<InstanceConfig>, sleep: Duration) -> SelectorState {
        SelectorState::new(configs, sleep, "us-east-1")
    }

    #[test]
    fn max_available_satisfies_need_and_spot() {
        let mut b = config("b", 4.0, 16.0, 0.22, 200.0);
        b.spot_ok = false;
        let s = selector(
            vec![config("a", 4.0, 16.0, 0.20, 100.0), b, config("c", 2.0, 4.0, 0.05, 50.0)],
            Duration::from_secs(60),
        );
        let n = need(2.0, 8.0);

        let picked = s.max_available(&n, false).unwrap();
        assert!(picked.resources.available(&n));

        // Spot excludes b even though it satisfies the need.
        let picked = s.max_available(&n, true).unwrap();
        assert_eq!(picked.instance_type, "a");

        // An unsatisfiable need yields nothing.
        assert!(s.max_available(&need(64.0, 512.0), false).is_none());
    }

    #[test]
    fn max_available_prefers_largest_distance() {
        let s = selector(
            vec![
                config("small", 2.0, 8.0, 0.10, 100.0),
                config("large", 16.0, 64.0, 0.80, 250.0),
            ],
            Duration::from_secs(60),
        );
        let picked = s.max_available(&need(2.0, 8.0), false).unwrap();
        assert_eq!(picked.instance_type, "large");
    }

    #[test]
    fn min_available_pays_premium_for_ebs_throughput() {
        // Scenario: A at $0.20 with 100 MB/s, B at $0.22 with
        // 200 MB/s. The +10% premium is under both bounds and the
        // +100% throughput clears the benefit bar.
        let s = selector(
            vec![
                config("a", 4.0, 16.0, 0.20, 100.0),
                config("b", 4.0, 16.0, 0.22, 200.0),
            ],
            Duration::from_secs(60),
        );
        let picked = s.min_available(&need(2.0, 8.0), false).unwrap();
        assert_eq!(picked.instance_type, "b");
    }

    #[test]
    fn min_available_ignores_unjustified_premium() {
        // The upgrade exceeds both premium bounds.
        let s = selector(
            vec![
                config("a", 4.0, 16.0, 0.20, 100.0),
                config("b", 4.0, 16.0, 0.40, 200.0),
            ],
            Duration::from_secs(60),
        );
        let picked = s.min_available(&need(2.0, 8.0), false).unwrap();
        assert_eq!(picked.instance_type, "a");
    }

    #[test]
    fn min_available_adopts_cheaper_match_after_upgrade() {
        // b wins the throughput upgrade over a; c then matches b's
        // throughput (and more) at a lower price.
        let s = selector(
            vec![
                config("a", 4.0, 16.0, 0.20, 100.0),
                config("b", 4.0, 16.0, 0.22, 200.0),
                config("c", 4.0, 16.0, 0.21, 250.0),
            ],
            Duration::from_secs(60),
        );
        let picked = s.min_available(&need(2.0, 8.0), false).unwrap();
        assert_eq!(picked.instance_type, "c");
    }

    #[test]
    fn min_available_excludes_spot_ineligible() {
        let mut b = config("b", 4.0, 16.0, 0.22, 200.0);
        b.spot_ok = false;
        let s = selector(
            vec![config("a", 4.0, 16.0, 0.20, 100.0), b],
            Duration::from_secs(60),
        );
        let picked = s.min_available(&need(2.0, 8.0), true).unwrap();
        assert_eq!(picked.instance_type, "a");
    }

    #[test]
    fn min_available_requires_a_regional_price() {
        let mut b = config("b", 4.0, 16.0, 0.18, 200.0);
        b.price = BTreeMap::new(); // not offered anywhere
        let s = selector(
            vec![config("a", 4.0, 16.0, 0.20, 100.0), b],
            Duration::from_secs(60),
        );
        let picked = s.min_available(&need(2.0, 8.0), false).unwrap();
        assert_eq!(picked.instance_type, "a");
    }

    #[test]
    fn unavailable_marks_expire_after_sleep_window() {
        let s = selector(
            vec![
                config("a", 4.0, 16.0, 0.20, 100.0),
                config("b", 4.0, 16.0, 0.22, 200.0),
            ],
            Duration::from_millis(50),
        );
        let n = need(2.0, 8.0);

        assert_eq!(s.min_available(&n, false).unwrap().instance_type, "b");
        let b = s.type_named("b").unwrap();
        s.mark_unavailable(&b);

        // Within the sleep window b is excluded everywhere.
        assert_eq!(s.min_available(&n, false).unwrap().instance_type, "a");
        assert!(s.type_named("b").is_none());
        assert_ne!(s.max_available(&n, false).unwrap().instance_type, "b");

        std::thread::sleep(Duration::from_millis(60));
        // After the window the mark lapses (superseded, not evicted).
        assert_eq!(s.min_available(&n, false).unwrap().instance_type, "b");
        assert!(s.type_named("b").is_some());
    }

    #[test]
    fn min_available_never_picks_strictly_dominated_config() {
        // d is more expensive than c with lower throughput; it must
        // never be the result.
        let s = selector(
            vec![
                config("a", 4.0, 16.0, 0.20, 100.0),
                config("c", 4.0, 16.0, 0.21, 250.0),
                config("d", 4.0, 16.0, 0.23, 150.0),
            ],
            Duration::from_secs(60),
        );
        let picked = s.min_available(&need(2.0, 8.0), false).unwrap();
        let d_price = 0.23;
        let d_throughput = 150.0;
        let price = picked.price["us-east-1"];
        assert!(!(price > d_price && picked.ebs_throughput < d_throughput));
        assert_ne!(picked.instance_type, "d");
    }

    #[test]
    fn available_ignores_unavailability_marks() {
        let s = selector(vec![config("a", 4.0, 16.0, 0.20, 100.0)], Duration::from_secs(60));
        let a = s.type_named("a").unwrap();
        s.mark_unavailable(&a);
        assert!(s.available(&need(2.0, 8.0)));
    }
}
