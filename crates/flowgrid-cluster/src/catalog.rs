//! The instance-type catalog.
//!
//! Entries come from the public cloud instance reference dataset,
//! filtered to x86_64 architecture, Linux HVM virtualization,
//! non-bare-metal types whose network performance is not classified
//! "Low". Prices are on-demand USD/hour keyed by region; a region
//! absent from the map means the type is not offered there.

use std::collections::BTreeMap;

use flow_core::resources::GIB;
use flow_core::Resources;

/// Fraction of nominal memory withheld when deriving resources:
/// 5% reserved for the worker, and hypervisor overhead runs a little
/// shy of 2%.
pub const MEMORY_DISCOUNT: f64 = 0.05 + 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Current,
    Previous,
}

/// A catalog entry.
pub struct InstanceType {
    pub name: &'static str,
    pub vcpu: u32,
    pub memory_gib: f64,
    pub ebs_optimized: bool,
    /// Max sustained EBS throughput, MB/s.
    pub ebs_throughput: f64,
    /// On-demand USD/hour by region.
    pub price: &'static [(&'static str, f64)],
    pub generation: Generation,
    /// EBS volumes exposed as NVMe devices.
    pub nvme: bool,
    /// CPU feature flags; each is allocated as one resource unit per
    /// vCPU.
    pub cpu_features: &'static [&'static str],
}

const AVX: &[&str] = &["intel_avx"];
const AVX2: &[&str] = &["intel_avx", "intel_avx2"];
const AVX512: &[&str] = &["intel_avx", "intel_avx2", "intel_avx512"];

use Generation::{Current, Previous};

macro_rules! itype {
    ($name:literal, $vcpu:literal, $mem:literal, $opt:literal, $tp:literal,
     [$(($region:literal, $price:literal)),* $(,)?], $gen:expr, $nvme:literal, $feat:expr) => {
        InstanceType {
            name: $name,
            vcpu: $vcpu,
            memory_gib: $mem,
            ebs_optimized: $opt,
            ebs_throughput: $tp,
            price: &[$(($region, $price)),*],
            generation: $gen,
            nvme: $nvme,
            cpu_features: $feat,
        }
    };
}

/// Known instance types.
pub static TYPES: &[InstanceType] = &[
    itype!("t2.large", 2, 8.0, false, 0.0,
        [("us-east-1", 0.0928), ("us-west-2", 0.0928), ("eu-west-1", 0.101)],
        Current, false, AVX),
    itype!("t2.2xlarge", 8, 32.0, false, 0.0,
        [("us-east-1", 0.3712), ("us-west-2", 0.3712), ("eu-west-1", 0.404)],
        Current, false, AVX),
    itype!("m3.2xlarge", 8, 30.0, true, 125.0,
        [("us-east-1", 0.532), ("us-west-2", 0.532), ("eu-west-1", 0.585)],
        Previous, false, AVX),
    itype!("m4.large", 2, 8.0, true, 56.25,
        [("us-east-1", 0.10), ("us-west-2", 0.10), ("eu-west-1", 0.111)],
        Current, false, AVX2),
    itype!("m4.xlarge", 4, 16.0, true, 93.75,
        [("us-east-1", 0.20), ("us-west-2", 0.20), ("eu-west-1", 0.222)],
        Current, false, AVX2),
    itype!("m4.2xlarge", 8, 32.0, true, 125.0,
        [("us-east-1", 0.40), ("us-west-2", 0.40), ("eu-west-1", 0.444)],
        Current, false, AVX2),
    itype!("m4.4xlarge", 16, 64.0, true, 250.0,
        [("us-east-1", 0.80), ("us-west-2", 0.80), ("eu-west-1", 0.888)],
        Current, false, AVX2),
    itype!("m4.16xlarge", 64, 256.0, true, 1250.0,
        [("us-east-1", 3.20), ("us-west-2", 3.20), ("eu-west-1", 3.552)],
        Current, false, AVX2),
    itype!("m5.xlarge", 4, 16.0, true, 143.75,
        [("us-east-1", 0.192), ("us-west-2", 0.192), ("eu-west-1", 0.214)],
        Current, true, AVX512),
    itype!("m5.2xlarge", 8, 32.0, true, 287.5,
        [("us-east-1", 0.384), ("us-west-2", 0.384), ("eu-west-1", 0.428)],
        Current, true, AVX512),
    itype!("m5.4xlarge", 16, 64.0, true, 287.5,
        [("us-east-1", 0.768), ("us-west-2", 0.768), ("eu-west-1", 0.856)],
        Current, true, AVX512),
    itype!("m5.12xlarge", 48, 192.0, true, 875.0,
        [("us-east-1", 2.304), ("us-west-2", 2.304), ("eu-west-1", 2.568)],
        Current, true, AVX512),
    itype!("c4.2xlarge", 8, 15.0, true, 125.0,
        [("us-east-1", 0.398), ("us-west-2", 0.398), ("eu-west-1", 0.453)],
        Current, false, AVX2),
    itype!("c4.4xlarge", 16, 30.0, true, 250.0,
        [("us-east-1", 0.796), ("us-west-2", 0.796), ("eu-west-1", 0.905)],
        Current, false, AVX2),
    itype!("c5.2xlarge", 8, 16.0, true, 287.5,
        [("us-east-1", 0.34), ("us-west-2", 0.34), ("eu-west-1", 0.384)],
        Current, true, AVX512),
    itype!("c5.4xlarge", 16, 32.0, true, 287.5,
        [("us-east-1", 0.68), ("us-west-2", 0.68), ("eu-west-1", 0.768)],
        Current, true, AVX512),
    itype!("c5.9xlarge", 36, 72.0, true, 1187.5,
        [("us-east-1", 1.53), ("us-west-2", 1.53), ("eu-west-1", 1.728)],
        Current, true, AVX512),
    itype!("r4.2xlarge", 8, 61.0, true, 218.75,
        [("us-east-1", 0.532), ("us-west-2", 0.532), ("eu-west-1", 0.5928)],
        Current, false, AVX2),
    itype!("r4.8xlarge", 32, 244.0, true, 875.0,
        [("us-east-1", 2.128), ("us-west-2", 2.128), ("eu-west-1", 2.3712)],
        Current, false, AVX2),
    itype!("i3.4xlarge", 16, 122.0, true, 437.5,
        [("us-east-1", 1.248), ("us-west-2", 1.248), ("eu-west-1", 1.376)],
        Current, true, AVX2),
];

/// An instance type with the memory discount applied, ready for
/// selection and launch.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub instance_type: String,
    pub ebs_optimized: bool,
    pub ebs_throughput: f64,
    /// Discounted resources presented by this configuration. Disk
    /// sizes are not included; they are dynamic.
    pub resources: Resources,
    pub price: BTreeMap<String, f64>,
    pub spot_ok: bool,
    pub nvme: bool,
}

impl InstanceConfig {
    pub fn from_type(t: &InstanceType) -> Self {
        let mut resources =
            Resources::with_cpu_mem(t.vcpu as f64, (1.0 - MEMORY_DISCOUNT) * t.memory_gib * GIB);
        // One feature unit per vCPU.
        for feature in t.cpu_features {
            resources.set(*feature, t.vcpu as f64);
        }
        InstanceConfig {
            instance_type: t.name.to_string(),
            ebs_optimized: t.ebs_optimized,
            ebs_throughput: t.ebs_throughput,
            resources,
            price: t.price.iter().map(|(r, p)| (r.to_string(), *p)).collect(),
            // Burst-credit types are the only current-generation
            // instances the spot market does not support.
            spot_ok: t.generation == Current && !t.name.starts_with("t2."),
            nvme: t.nvme,
        }
    }
}

/// All catalog entries as launchable configurations.
pub fn configs() -> Vec<InstanceConfig> {
    TYPES.iter().map(InstanceConfig::from_type).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> InstanceConfig {
        configs()
            .into_iter()
            .find(|c| c.instance_type == name)
            .unwrap_or_else(|| panic!("no catalog entry {name}"))
    }

    #[test]
    fn memory_discount_applies() {
        let c = config("m4.xlarge");
        let want = (1.0 - MEMORY_DISCOUNT) * 16.0 * GIB;
        assert!((c.resources.get("mem") - want).abs() < 1.0);
        assert_eq!(c.resources.get("cpu"), 4.0);
    }

    #[test]
    fn cpu_features_are_one_unit_per_vcpu() {
        let c = config("c5.9xlarge");
        assert_eq!(c.resources.get("intel_avx512"), 36.0);
        assert_eq!(c.resources.get("intel_avx"), 36.0);

        let m4 = config("m4.xlarge");
        assert_eq!(m4.resources.get("intel_avx512"), 0.0);
    }

    #[test]
    fn burst_and_previous_generation_are_not_spot_eligible() {
        assert!(!config("t2.large").spot_ok);
        assert!(!config("t2.2xlarge").spot_ok);
        assert!(!config("m3.2xlarge").spot_ok);
        assert!(config("m4.xlarge").spot_ok);
        assert!(config("c5.2xlarge").spot_ok);
    }

    #[test]
    fn absent_region_means_not_offered() {
        let c = config("m4.xlarge");
        assert!(c.price.contains_key("us-east-1"));
        assert!(!c.price.contains_key("ap-northeast-3"));
    }
}
