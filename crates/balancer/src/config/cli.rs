use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use super::BalancerConfig;
use super::MemoryConfig;

/// Rebalance vCPU placement and guest memory across one physical host.
#[derive(Parser, Debug, Clone)]
#[command(name = "balancer", version, about)]
pub struct Cli {
    #[arg(
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Sampling interval in whole seconds between balancing ticks"
    )]
    pub interval_secs: u64,

    #[arg(
        long,
        env = "VM_BALANCER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file with threshold overrides, e.g. /etc/vm-balancer/config.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "VM_BALANCER_MEMORY_THRESHOLDS",
        value_parser = parse_memory_thresholds,
        help = "Memory thresholds as a JSON string (takes precedence over --config)"
    )]
    pub memory_thresholds: Option<MemoryConfig>,

    #[arg(
        long,
        env = "VM_BALANCER_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Write decision logs to a daily rolling file in addition to stderr"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "LIBVIRT_DEFAULT_URI",
        default_value = "qemu:///system",
        help = "Management connection URI"
    )]
    pub connect_uri: String,
}

/// Parse a JSON string into memory balancer thresholds
fn parse_memory_thresholds(s: &str) -> Result<MemoryConfig, String> {
    serde_json::from_str(s).map_err(|e| format!("failed to parse memory thresholds JSON: {e}"))
}

impl Cli {
    /// Resolve the effective configuration: file (if any), then inline
    /// threshold overrides on top.
    pub fn balancer_config(&self) -> anyhow::Result<BalancerConfig> {
        let mut cfg = match &self.config {
            Some(path) => BalancerConfig::load(path).context("loading --config file")?,
            None => BalancerConfig::default(),
        };
        if let Some(thresholds) = self.memory_thresholds {
            cfg.memory = thresholds;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_the_single_positional_argument() {
        let cli = Cli::try_parse_from(["balancer", "5"]).expect("interval should parse");
        assert_eq!(cli.interval_secs, 5);
        assert_eq!(cli.connect_uri, "qemu:///system");
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(
            Cli::try_parse_from(["balancer", "0"]).is_err(),
            "a zero-second interval should be rejected"
        );
    }

    #[test]
    fn memory_thresholds_from_json_string() {
        let cli = Cli::try_parse_from([
            "balancer",
            "2",
            "--memory-thresholds",
            r#"{"minUnusedKb": 51200, "stepKb": 16384}"#,
        ])
        .expect("thresholds JSON should parse");

        let cfg = cli.balancer_config().expect("config should resolve");
        assert_eq!(cfg.memory.min_unused_kb, 51_200);
        assert_eq!(cfg.memory.step_kb, 16_384);
        assert_eq!(
            cfg.memory.host_floor_kb, 204_800,
            "unset threshold fields keep defaults"
        );
    }

    #[test]
    fn invalid_thresholds_json_is_rejected() {
        assert!(Cli::try_parse_from(["balancer", "2", "--memory-thresholds", "not-json"]).is_err());
    }
}
