//! Tick orchestration and the cooperative run loop.
//!
//! One tick is one full pass of sampling, aggregation, and both balancers,
//! run to completion; the loop only checks for cancellation between ticks so
//! a guest is never left in a partially-applied state.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use virt_types::VmId;

use super::cpu_balancer;
use super::load_model::LoadModel;
use super::mem_balancer;
use super::sampler;
use super::types::DomainState;
use super::types::HostMemoryState;
use super::types::TickReport;
use crate::config::BalancerConfig;
use crate::virt::VirtError;
use crate::virt::VirtHost;

/// Owns the load model and all per-domain derived state for the process
/// lifetime and drives both balancers once per tick.
#[derive(Debug)]
pub struct Scheduler<H: VirtHost> {
    host: H,
    cfg: BalancerConfig,
    interval: Duration,
    pcpu_count: u32,
    domains: BTreeMap<VmId, DomainState>,
    host_mem: Option<HostMemoryState>,
}

impl<H: VirtHost> Scheduler<H> {
    /// Queries the physical CPU count once; a connection failure here is
    /// fatal to startup.
    pub fn new(host: H, cfg: BalancerConfig, interval: Duration) -> Result<Self, VirtError> {
        let pcpu_count = host.physical_cpu_count()?;
        tracing::info!(pcpu_count, interval_secs = interval.as_secs(), "scheduler initialized");
        Ok(Self {
            host,
            cfg,
            interval,
            pcpu_count,
            domains: BTreeMap::new(),
            host_mem: None,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn pcpu_count(&self) -> u32 {
        self.pcpu_count
    }

    /// Derived state of one active domain, if any.
    pub fn domain_state(&self, vm: &VmId) -> Option<&DomainState> {
        self.domains.get(vm)
    }

    /// Host memory view left by the last completed tick.
    pub fn host_memory_state(&self) -> Option<HostMemoryState> {
        self.host_mem
    }

    /// Run one full tick. `Err` means a connection-level failure; the tick
    /// is abandoned and per-domain state is left as it was.
    pub fn tick(&mut self) -> Result<TickReport, VirtError> {
        let active = self.host.list_active_vms()?;
        let mut report = TickReport {
            active_domains: active.len(),
            ..TickReport::default()
        };

        self.reconcile_domains(&active);

        for vm in &active {
            let Some(domain) = self.domains.get_mut(vm) else {
                continue;
            };
            if !sampler::sample_domain_cpu(&self.host, vm, domain, self.interval) {
                report.sample_skips += 1;
            }
            if !sampler::sample_domain_memory(&self.host, vm, domain) {
                report.sample_skips += 1;
            }
        }

        let totals = self.host.host_memory()?;
        let baseline_free_ratio = match self.host_mem {
            Some(prev) => prev.baseline_free_ratio,
            None => {
                let ratio = if totals.total_kb == 0 {
                    0.0
                } else {
                    totals.free_kb as f64 / totals.total_kb as f64
                };
                tracing::info!(free_kb = totals.free_kb, total_kb = totals.total_kb,
                    ratio, "captured baseline host free-memory ratio");
                ratio
            }
        };
        let mut host_mem = HostMemoryState {
            total_kb: totals.total_kb,
            free_kb: totals.free_kb,
            baseline_free_ratio,
        };
        tracing::debug!(
            free_kb = host_mem.free_kb,
            current_ratio = host_mem.free_ratio(),
            baseline_ratio = host_mem.baseline_free_ratio,
            "host memory sampled"
        );

        let mut model = LoadModel::compute(
            self.pcpu_count,
            self.domains
                .values()
                .flat_map(|d| d.vcpus.iter().map(|v| (v.pcpu, v.utilization))),
        );

        cpu_balancer::balance(&self.host, &mut model, &mut self.domains, &mut report);
        mem_balancer::balance(
            &self.cfg.memory,
            &self.host,
            &mut host_mem,
            &mut self.domains,
            &mut report,
        );

        self.host_mem = Some(host_mem);
        Ok(report)
    }

    /// Align the derived-state map with the active listing: drop vanished
    /// domains, create state for newcomers, and enable balloon statistics on
    /// first sight.
    fn reconcile_domains(&mut self, active: &[VmId]) {
        self.domains.retain(|vm, _| {
            let keep = active.contains(vm);
            if !keep {
                tracing::info!(vm = %vm, "domain no longer active, discarding derived state");
            }
            keep
        });

        for vm in active {
            let domain = self.domains.entry(vm.clone()).or_insert_with(|| {
                tracing::info!(vm = %vm, "tracking newly observed domain");
                DomainState::default()
            });
            if !domain.stats_enabled {
                match self.host.enable_memory_stats(vm, self.interval.as_secs() as u32) {
                    Ok(()) => domain.stats_enabled = true,
                    Err(e) => {
                        tracing::warn!(vm = %vm, error = %e, "failed to enable balloon statistics");
                    }
                }
            }
        }
    }

    /// Drive ticks until cancelled. Connection-level failures skip the tick
    /// and the loop retries on the next interval; cancellation is only
    /// honored between ticks.
    pub async fn run(&mut self, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("shutdown requested, stopping scheduler loop");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick() {
                        Ok(report) => {
                            tracing::info!(
                                domains = report.active_domains,
                                migrations = report.migrations.len(),
                                memory_actions = report.memory_actions.len(),
                                sample_skips = report.sample_skips,
                                action_failures = report.action_failures,
                                "tick complete"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "tick skipped: management connection failure");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::mock::MockVirtHost;

    const MIB: u64 = 1024;

    fn quiet_memory() -> virt_types::DomainMemoryCounters {
        virt_types::DomainMemoryCounters {
            unused_kb: 150 * MIB,
            available_kb: 900 * MIB,
            actual_kb: 1024 * MIB,
            swap_in_kb: 0,
            swap_out_kb: 0,
        }
    }

    fn scheduler_with_mock(pcpus: u32) -> Scheduler<MockVirtHost> {
        let host = MockVirtHost::new(pcpus, 8 * 1024 * 1024 * MIB, 500 * MIB);
        Scheduler::new(host, BalancerConfig::default(), Duration::from_secs(1))
            .expect("mock scheduler should initialize")
    }

    #[test]
    fn startup_queries_pcpu_count_once() {
        let scheduler = scheduler_with_mock(6);
        assert_eq!(scheduler.pcpu_count(), 6);
    }

    #[test]
    fn startup_fails_on_connection_error() {
        let host = MockVirtHost::new(4, 1 << 20, 1 << 19);
        host.fail_listing(true);
        let err = Scheduler::new(host, BalancerConfig::default(), Duration::from_secs(1))
            .expect_err("startup should surface connection failure");
        assert!(err.is_connection());
    }

    #[test]
    fn connection_failure_aborts_tick_and_keeps_state() {
        let mut scheduler = scheduler_with_mock(2);
        scheduler.host().add_domain("vm-a", 1, 2048 * MIB);
        let vm = VmId::new("vm-a");
        scheduler.host().set_memory_counters(&vm, quiet_memory());
        scheduler.tick().expect("first tick");
        assert!(scheduler.domain_state(&vm).is_some());

        scheduler.host().fail_listing(true);
        let err = scheduler.tick().expect_err("listing failure aborts the tick");
        assert!(err.is_connection());
        assert!(
            scheduler.domain_state(&vm).is_some(),
            "derived state survives a skipped tick"
        );
    }

    #[test]
    fn enables_balloon_stats_once_per_domain() {
        let mut scheduler = scheduler_with_mock(2);
        scheduler.host().add_domain("vm-a", 1, 2048 * MIB);
        let vm = VmId::new("vm-a");
        scheduler.host().set_memory_counters(&vm, quiet_memory());

        scheduler.tick().expect("tick");
        assert_eq!(scheduler.host().stats_period(&vm), Some(1));
    }

    #[test]
    fn vanished_domain_state_is_discarded() {
        let mut scheduler = scheduler_with_mock(2);
        scheduler.host().add_domain("vm-a", 1, 2048 * MIB);
        let vm = VmId::new("vm-a");
        scheduler.host().set_memory_counters(&vm, quiet_memory());
        scheduler.tick().expect("tick");
        assert!(scheduler.domain_state(&vm).is_some());

        scheduler.host().remove_domain(&vm);
        scheduler.tick().expect("tick");
        assert!(scheduler.domain_state(&vm).is_none());
    }
}
