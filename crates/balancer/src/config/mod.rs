pub mod cli;

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

pub use cli::Cli;

const KIB_PER_MIB: u64 = 1024;

/// Thresholds and step size for the memory balancer, all in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Below this much unused memory a guest is considered hungry.
    pub min_unused_kb: u64,
    /// A guest's allocation is never ballooned below this floor.
    pub min_alloc_kb: u64,
    /// Fixed adjustment step for grow/shrink actions.
    pub step_kb: u64,
    /// Host free memory is never drawn below this floor.
    pub host_floor_kb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_unused_kb: 100 * KIB_PER_MIB,
            min_alloc_kb: 100 * KIB_PER_MIB,
            step_kb: 64 * KIB_PER_MIB,
            host_floor_kb: 200 * KIB_PER_MIB,
        }
    }
}

/// Top-level balancer configuration, loadable from a YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalancerConfig {
    pub memory: MemoryConfig,
}

impl BalancerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
