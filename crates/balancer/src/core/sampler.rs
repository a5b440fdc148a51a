//! Delta-based utilization sampling from monotonic counters.
//!
//! Counters are cumulative nanoseconds of vCPU run time; one sample turns
//! the delta against the previous tick into a percentage of the nominal
//! interval. Per-entity read failures never abort a tick: the entity keeps
//! its last derived state and is retried next tick.

use std::time::Duration;

use virt_types::VmId;

use super::types::DomainState;
use crate::virt::VirtHost;

/// Utilization percentage from a cumulative nanosecond counter delta.
///
/// Returns `None` when the counter moved backwards (reset), which callers
/// must treat as "no signal this tick" rather than negative utilization.
pub fn utilization_from_delta(prev_ns: u64, curr_ns: u64, interval: Duration) -> Option<f64> {
    let delta = curr_ns.checked_sub(prev_ns)?;
    Some(delta as f64 * 100.0 / interval.as_nanos() as f64)
}

/// Sample one domain's vCPU counters into its derived state.
///
/// Returns `false` when the read failed and the domain was skipped.
pub fn sample_domain_cpu(
    host: &dyn VirtHost,
    vm: &VmId,
    state: &mut DomainState,
    interval: Duration,
) -> bool {
    let samples = match host.vcpu_counters(vm) {
        Ok(samples) => samples,
        Err(e) => {
            tracing::warn!(vm = %vm, error = %e, "vCPU counters unavailable, keeping last derived state");
            return false;
        }
    };

    for sample in samples {
        let slot = state.vcpu_mut(sample.vcpu);

        if let Some(pcpu) = sample.pcpu {
            slot.pcpu = Some(pcpu);
        } else if slot.pcpu.is_none() {
            // No placement in the counter read; seed from the pin mask.
            match host.vcpu_pin_mask(vm, sample.vcpu) {
                Ok(mask) => slot.pcpu = mask.first_set(),
                Err(e) => {
                    tracing::debug!(vm = %vm, vcpu = sample.vcpu, error = %e,
                        "no pin info, vCPU stays out of per-pCPU aggregation");
                }
            }
        }

        match slot.prev_time_ns {
            None => slot.utilization = 0.0,
            Some(prev) => {
                match utilization_from_delta(prev, sample.cpu_time_ns, interval) {
                    Some(utilization) => slot.utilization = utilization,
                    None => {
                        tracing::debug!(vm = %vm, vcpu = sample.vcpu,
                            "run-time counter reset, keeping last utilization");
                    }
                }
            }
        }
        slot.prev_time_ns = Some(sample.cpu_time_ns);
    }
    true
}

/// Sample one domain's balloon counters and maximum allocation.
///
/// Returns `false` when a read failed and the domain was skipped.
pub fn sample_domain_memory(host: &dyn VirtHost, vm: &VmId, state: &mut DomainState) -> bool {
    let counters = match host.memory_counters(vm) {
        Ok(counters) => counters,
        Err(e) => {
            tracing::warn!(vm = %vm, error = %e, "memory counters unavailable, keeping last derived state");
            return false;
        }
    };
    let max_kb = match host.max_memory_kb(vm) {
        Ok(max_kb) => max_kb,
        Err(e) => {
            tracing::warn!(vm = %vm, error = %e, "max memory unavailable, keeping last derived state");
            return false;
        }
    };

    let mem = &mut state.memory;
    if mem.sampled {
        let prev = mem.unused_kb;
        mem.prev_unused_kb = Some(prev);
        mem.down_streak = if counters.unused_kb < prev {
            mem.down_streak + 1
        } else {
            0
        };
        mem.swap_delta_kb = counters.swap_in_kb.saturating_sub(mem.swap_in_total_kb)
            + counters.swap_out_kb.saturating_sub(mem.swap_out_total_kb);
    }
    mem.unused_kb = counters.unused_kb;
    mem.available_kb = counters.available_kb;
    mem.actual_kb = counters.actual_kb;
    mem.swap_in_total_kb = counters.swap_in_kb;
    mem.swap_out_total_kb = counters.swap_out_kb;
    mem.max_kb = max_kb;
    mem.sampled = true;

    tracing::debug!(vm = %vm, actual_kb = mem.actual_kb, unused_kb = mem.unused_kb,
        available_kb = mem.available_kb, max_kb = mem.max_kb,
        swap_delta_kb = mem.swap_delta_kb, "memory counters sampled");
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use virt_types::CpuMask;
    use virt_types::DomainMemoryCounters;

    use super::*;
    use crate::virt::mock::MockVirtHost;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn utilization_is_delta_over_interval() {
        let util = utilization_from_delta(0, 500_000_000, SECOND).expect("forward delta");
        assert_eq!(util, 50.0, "0.5s busy in a 1s interval is 50%");

        let util = utilization_from_delta(1_000_000_000, 5_000_000_000, Duration::from_secs(2))
            .expect("forward delta");
        assert_eq!(util, 200.0, "two fully-busy vCPUs worth of time is not clamped");
    }

    #[test]
    fn counter_reset_yields_no_signal() {
        assert!(utilization_from_delta(500, 400, SECOND).is_none());
    }

    #[test]
    fn first_observation_reports_zero_utilization() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 20);
        let vm = VmId::new("vm-a");
        host.set_vcpu_counter(&vm, 0, 7_000_000_000, Some(0));

        let mut state = DomainState::default();
        assert!(sample_domain_cpu(&host, &vm, &mut state, SECOND));

        assert_eq!(state.vcpus[0].utilization, 0.0, "no previous counter means 0");
        assert_eq!(state.vcpus[0].prev_time_ns, Some(7_000_000_000));
    }

    #[test]
    fn second_sample_computes_rate_from_delta() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 20);
        let vm = VmId::new("vm-a");

        let mut state = DomainState::default();
        host.set_vcpu_counter(&vm, 0, 1_000_000_000, Some(1));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);
        host.set_vcpu_counter(&vm, 0, 1_250_000_000, Some(1));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);

        assert_eq!(state.vcpus[0].utilization, 25.0);
        assert_eq!(state.vcpus[0].pcpu, Some(1));
    }

    #[test]
    fn reset_counter_retains_last_utilization() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 20);
        let vm = VmId::new("vm-a");

        let mut state = DomainState::default();
        host.set_vcpu_counter(&vm, 0, 1_000_000_000, Some(0));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);
        host.set_vcpu_counter(&vm, 0, 1_600_000_000, Some(0));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);
        assert_eq!(state.vcpus[0].utilization, 60.0);

        // Counter went backwards: utilization survives, baseline re-anchors.
        host.set_vcpu_counter(&vm, 0, 200_000_000, Some(0));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);
        assert_eq!(state.vcpus[0].utilization, 60.0, "reset keeps last value");
        assert_eq!(state.vcpus[0].prev_time_ns, Some(200_000_000));
    }

    #[test]
    fn missing_placement_falls_back_to_pin_mask() {
        let host = MockVirtHost::new(4, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 2, 1 << 20);
        let vm = VmId::new("vm-a");
        host.set_vcpu_counter(&vm, 0, 100, None);
        host.set_vcpu_counter(&vm, 1, 100, None);
        host.set_pin_mask(&vm, 0, CpuMask::single(4, 2));
        // vcpu 1 has no pin info at all.

        let mut state = DomainState::default();
        sample_domain_cpu(&host, &vm, &mut state, SECOND);

        assert_eq!(state.vcpus[0].pcpu, Some(2), "seeded from the pin mask");
        assert_eq!(state.vcpus[1].pcpu, None, "stays unassigned without pin info");
    }

    #[test]
    fn failed_cpu_read_keeps_previous_state() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 20);
        let vm = VmId::new("vm-a");

        let mut state = DomainState::default();
        host.set_vcpu_counter(&vm, 0, 1_000_000_000, Some(0));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);
        host.set_vcpu_counter(&vm, 0, 1_900_000_000, Some(0));
        sample_domain_cpu(&host, &vm, &mut state, SECOND);

        host.fail_vcpu_counters(&vm, true);
        assert!(!sample_domain_cpu(&host, &vm, &mut state, SECOND));
        assert_eq!(state.vcpus[0].utilization, 90.0, "derived state retained");
    }

    #[test]
    fn failed_memory_read_keeps_previous_state() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 21);
        let vm = VmId::new("vm-a");
        let mut state = DomainState::default();

        host.set_memory_counters(
            &vm,
            DomainMemoryCounters {
                unused_kb: 250_000,
                available_kb: 900_000,
                actual_kb: 1_000_000,
                swap_in_kb: 0,
                swap_out_kb: 0,
            },
        );
        sample_domain_memory(&host, &vm, &mut state);

        host.fail_memory_counters(&vm, true);
        assert!(!sample_domain_memory(&host, &vm, &mut state));
        assert_eq!(state.memory.unused_kb, 250_000, "derived state retained");
        assert!(state.memory.sampled);
    }

    #[test]
    fn memory_trend_tracks_consecutive_drops() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 21);
        let vm = VmId::new("vm-a");
        let mut state = DomainState::default();

        for (tick, unused) in [400_000u64, 350_000, 300_000, 310_000].into_iter().enumerate() {
            host.set_memory_counters(
                &vm,
                DomainMemoryCounters {
                    unused_kb: unused,
                    available_kb: 900_000,
                    actual_kb: 1_000_000,
                    swap_in_kb: 0,
                    swap_out_kb: 0,
                },
            );
            sample_domain_memory(&host, &vm, &mut state);
            match tick {
                0 => assert_eq!(state.memory.down_streak, 0, "first sample has no trend"),
                1 => assert_eq!(state.memory.down_streak, 1),
                2 => assert_eq!(state.memory.down_streak, 2),
                _ => assert_eq!(state.memory.down_streak, 0, "growth resets the streak"),
            }
        }
        assert_eq!(state.memory.prev_unused_kb, Some(300_000));
        assert_eq!(state.memory.max_kb, 1 << 21);
    }

    #[test]
    fn swap_delta_is_per_tick_not_cumulative() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 21);
        let vm = VmId::new("vm-a");
        let mut state = DomainState::default();

        let mut counters = DomainMemoryCounters {
            unused_kb: 200_000,
            available_kb: 900_000,
            actual_kb: 1_000_000,
            swap_in_kb: 5_000,
            swap_out_kb: 0,
        };
        host.set_memory_counters(&vm, counters);
        sample_domain_memory(&host, &vm, &mut state);
        assert_eq!(state.memory.swap_delta_kb, 0, "first sample has no delta");

        counters.swap_in_kb = 5_000;
        host.set_memory_counters(&vm, counters);
        sample_domain_memory(&host, &vm, &mut state);
        assert_eq!(state.memory.swap_delta_kb, 0, "unchanged totals mean no traffic");

        counters.swap_out_kb = 1_024;
        host.set_memory_counters(&vm, counters);
        sample_domain_memory(&host, &vm, &mut state);
        assert_eq!(state.memory.swap_delta_kb, 1_024);
    }
}
