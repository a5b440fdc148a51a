//! Derived state persisted across ticks for every managed guest.

use virt_types::VmId;

/// Per-vCPU derived state.
///
/// Created on first observation and kept while the owning domain stays
/// active; raw counters live here so the next tick can compute a delta.
#[derive(Debug, Clone, Default)]
pub struct VcpuState {
    /// Index of the vCPU within its domain.
    pub vcpu: u32,
    /// Physical CPU this vCPU is known to run on; `None` when the host
    /// never reported a placement, which keeps the vCPU out of per-pCPU
    /// aggregation.
    pub pcpu: Option<u32>,
    /// Cumulative run-time counter from the previous sample, nanoseconds.
    pub prev_time_ns: Option<u64>,
    /// Share of the last interval spent running, in percent.
    pub utilization: f64,
    /// Migration hysteresis: non-zero right after a repin, decremented once
    /// per balancing pass; the vCPU is not a migration candidate until it
    /// reaches zero again.
    pub settle_ticks: u8,
}

/// Ticks a vCPU sits out of candidacy after a migration. One full tick of
/// destination observation plus the tick the decrement happens in.
pub const SETTLE_TICKS_AFTER_MIGRATION: u8 = 2;

/// Per-domain memory state derived from balloon-driver counters.
#[derive(Debug, Clone, Default)]
pub struct DomainMemoryState {
    /// Balloon size, i.e. the domain's current allocation, KiB. Updated
    /// in-tick after a confirmed grow/shrink so later decisions in the same
    /// tick see the adjusted value.
    pub actual_kb: u64,
    /// Hard upper bound for the allocation, KiB.
    pub max_kb: u64,
    /// Memory the guest currently leaves unused, KiB.
    pub unused_kb: u64,
    /// Guest-visible total, KiB.
    pub available_kb: u64,
    /// Unused value of the previous tick; `None` until the domain has been
    /// sampled twice, which keeps freshly appeared domains out of balancing.
    pub prev_unused_kb: Option<u64>,
    /// Consecutive ticks the unused figure has fallen.
    pub down_streak: u32,
    /// Cumulative swap counters from the last sample, KiB.
    pub swap_in_total_kb: u64,
    pub swap_out_total_kb: u64,
    /// Swap traffic observed this tick (delta of the cumulative counters).
    pub swap_delta_kb: u64,
    /// Whether at least one sample has been recorded.
    pub sampled: bool,
}

/// Everything the balancer remembers about one active domain.
#[derive(Debug, Clone, Default)]
pub struct DomainState {
    pub vcpus: Vec<VcpuState>,
    pub memory: DomainMemoryState,
    /// Balloon statistics collection has been enabled on the domain.
    pub stats_enabled: bool,
}

impl DomainState {
    /// State slot for a vCPU index, created on first observation. Slots are
    /// kept ordered by index.
    pub fn vcpu_mut(&mut self, vcpu: u32) -> &mut VcpuState {
        let pos = match self.vcpus.binary_search_by_key(&vcpu, |v| v.vcpu) {
            Ok(pos) => pos,
            Err(pos) => {
                self.vcpus.insert(
                    pos,
                    VcpuState {
                        vcpu,
                        ..VcpuState::default()
                    },
                );
                pos
            }
        };
        &mut self.vcpus[pos]
    }
}

/// Host-wide memory view for one tick.
///
/// `free_kb` is read once at tick start and afterwards only adjusted by the
/// memory balancer's own bookkeeping, never re-read mid-tick.
#[derive(Debug, Clone, Copy)]
pub struct HostMemoryState {
    pub total_kb: u64,
    pub free_kb: u64,
    /// Free/total ratio captured on the first tick and held fixed, reported
    /// alongside the current ratio for drift comparison.
    pub baseline_free_ratio: f64,
}

impl HostMemoryState {
    pub fn free_ratio(&self) -> f64 {
        if self.total_kb == 0 {
            0.0
        } else {
            self.free_kb as f64 / self.total_kb as f64
        }
    }
}

/// One applied vCPU migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub vm: VmId,
    pub vcpu: u32,
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryActionKind {
    Grow,
    Shrink,
}

/// One applied memory-target change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAction {
    pub vm: VmId,
    pub kind: MemoryActionKind,
    pub from_kb: u64,
    pub to_kb: u64,
}

/// Outcome of one tick, for logging and assertions.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub active_domains: usize,
    pub migrations: Vec<Migration>,
    pub memory_actions: Vec<MemoryAction>,
    /// Entities skipped this tick because a counter read failed.
    pub sample_skips: u32,
    /// Pin or memory-target calls the hypervisor rejected.
    pub action_failures: u32,
}
