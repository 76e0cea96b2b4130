//! Resource vectors.
//!
//! A [`Resources`] maps resource names (`cpu`, `mem`, CPU feature
//! flags) to non-negative scalars. Memory is carried in bytes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One GiB, the scale used for memory distances.
pub const GIB: f64 = (1u64 << 30) as f64;

/// A vector of named resource quantities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    pub fn new() -> Self {
        Resources(BTreeMap::new())
    }

    /// Convenience constructor for the two universal dimensions.
    pub fn with_cpu_mem(cpu: f64, mem_bytes: f64) -> Self {
        let mut r = Resources::new();
        r.set("cpu", cpu);
        r.set("mem", mem_bytes);
        r
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether this vector satisfies `need`: every component of `need`
    /// is covered. Missing components count as zero.
    pub fn available(&self, need: &Resources) -> bool {
        need.iter().all(|(name, want)| self.get(name) >= want)
    }

    /// A total, deterministic distance used to rank satisfying
    /// configurations: absolute memory distance in GiB plus absolute
    /// CPU distance.
    pub fn scaled_distance(&self, other: &Resources) -> f64 {
        (self.get("mem") - other.get("mem")).abs() / GIB
            + (self.get("cpu") - other.get("cpu")).abs()
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if name == "mem" {
                write!(f, "mem:{:.1}GiB", value / GIB)?;
            } else {
                write!(f, "{name}:{value}")?;
            }
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, f64)> for Resources {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Resources(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_is_componentwise() {
        let have = Resources::with_cpu_mem(4.0, 16.0 * GIB);
        let need = Resources::with_cpu_mem(2.0, 8.0 * GIB);
        assert!(have.available(&need));
        assert!(!need.available(&have));
    }

    #[test]
    fn missing_components_count_as_zero() {
        let have = Resources::with_cpu_mem(4.0, 16.0 * GIB);
        let mut need = Resources::with_cpu_mem(2.0, 8.0 * GIB);
        need.set("intel_avx512", 2.0);
        assert!(!have.available(&need));

        let mut have2 = have.clone();
        have2.set("intel_avx512", 4.0);
        assert!(have2.available(&need));
    }

    #[test]
    fn zero_need_always_available() {
        let have = Resources::new();
        let need = Resources::new();
        assert!(have.available(&need));
    }

    #[test]
    fn scaled_distance_is_symmetric_and_zero_on_equal() {
        let a = Resources::with_cpu_mem(4.0, 16.0 * GIB);
        let b = Resources::with_cpu_mem(2.0, 8.0 * GIB);
        assert_eq!(a.scaled_distance(&b), b.scaled_distance(&a));
        assert_eq!(a.scaled_distance(&a), 0.0);
        // 8 GiB of memory distance + 2 cpus.
        assert!((a.scaled_distance(&b) - 10.0).abs() < 1e-9);
    }
}
