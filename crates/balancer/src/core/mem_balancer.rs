//! Memory balancing: grow pressured guests, shrink idle ones.
//!
//! Guests are classified from balloon counters into hungry (unused below
//! the floor, swap traffic this tick, or unused falling two ticks in a row)
//! and donors (comfortable headroom with a flat or growing trend). Hungry
//! and donor guests are paired greedily in stable name order; leftovers are
//! served from, or returned to, host free memory while the host floor
//! holds. Tracked allocations and the host free figure are only advanced
//! after the hypervisor confirms an action.

use std::collections::BTreeMap;

use virt_types::VmId;

use super::types::DomainMemoryState;
use super::types::DomainState;
use super::types::HostMemoryState;
use super::types::MemoryAction;
use super::types::MemoryActionKind;
use super::types::TickReport;
use crate::config::MemoryConfig;
use crate::virt::VirtHost;

fn is_hungry(cfg: &MemoryConfig, mem: &DomainMemoryState) -> bool {
    mem.unused_kb < cfg.min_unused_kb || mem.swap_delta_kb > 0 || mem.down_streak >= 2
}

fn is_donor(cfg: &MemoryConfig, mem: &DomainMemoryState) -> bool {
    mem.unused_kb > cfg.min_unused_kb + cfg.step_kb && mem.down_streak == 0
}

/// How much a donor can give up this tick without dropping below its unused
/// floor or its allocation floor.
fn spare_kb(cfg: &MemoryConfig, mem: &DomainMemoryState) -> u64 {
    cfg.step_kb
        .min(mem.unused_kb.saturating_sub(cfg.min_unused_kb))
        .min(mem.actual_kb.saturating_sub(cfg.min_alloc_kb))
}

/// Room left before a guest hits its maximum allocation.
fn headroom_kb(mem: &DomainMemoryState) -> u64 {
    mem.max_kb.saturating_sub(mem.actual_kb)
}

/// One balancing pass: classify, pair, and apply memory-target changes.
pub fn balance(
    cfg: &MemoryConfig,
    host: &dyn VirtHost,
    host_mem: &mut HostMemoryState,
    domains: &mut BTreeMap<VmId, DomainState>,
    report: &mut TickReport,
) {
    let mut hungry: Vec<VmId> = Vec::new();
    let mut donors: Vec<VmId> = Vec::new();
    for (vm, domain) in domains.iter() {
        let mem = &domain.memory;
        // A domain needs two samples before it has a trend to act on.
        if mem.prev_unused_kb.is_none() {
            continue;
        }
        if is_hungry(cfg, mem) {
            hungry.push(vm.clone());
        } else if is_donor(cfg, mem) {
            donors.push(vm.clone());
        }
    }

    if !hungry.is_empty() || !donors.is_empty() {
        tracing::debug!(
            hungry = hungry.len(),
            donors = donors.len(),
            host_free_kb = host_mem.free_kb,
            "memory pressure classified"
        );
    }

    let (mut i, mut j) = (0, 0);
    let mut floor_reached = false;

    // Pair hungry guests with donors while both sides last.
    while i < hungry.len() && j < donors.len() {
        let donor_spare = spare_kb(cfg, &domains[&donors[j]].memory);
        if donor_spare == 0 {
            j += 1;
            continue;
        }
        let amount = donor_spare.min(headroom_kb(&domains[&hungry[i]].memory));
        if amount == 0 {
            tracing::debug!(vm = %hungry[i], "hungry guest already at maximum allocation");
            i += 1;
            continue;
        }
        if host_mem.free_kb.saturating_sub(amount) < cfg.host_floor_kb {
            floor_reached = true;
            break;
        }

        if !apply_grow(host, host_mem, &hungry[i], amount, domains, report) {
            // Donor untouched; it stays available for the next hungry guest.
            i += 1;
            continue;
        }
        apply_shrink(cfg, host, &donors[j], amount, false, domains, host_mem, report);
        i += 1;
        j += 1;
    }

    // Leftover hungry guests draw directly from host free memory.
    while !floor_reached && i < hungry.len() {
        let amount = cfg.step_kb.min(headroom_kb(&domains[&hungry[i]].memory));
        if amount == 0 {
            i += 1;
            continue;
        }
        if host_mem.free_kb.saturating_sub(amount) < cfg.host_floor_kb {
            floor_reached = true;
            break;
        }
        apply_grow(host, host_mem, &hungry[i], amount, domains, report);
        i += 1;
    }

    if floor_reached {
        tracing::info!(
            host_free_kb = host_mem.free_kb,
            host_floor_kb = cfg.host_floor_kb,
            "host free-memory floor reached, leaving remaining hungry guests as-is"
        );
    }

    // Leftover donors still shrink: reclaiming only adds to host free memory.
    while j < donors.len() {
        let amount = spare_kb(cfg, &domains[&donors[j]].memory);
        if amount > 0 {
            apply_shrink(cfg, host, &donors[j], amount, true, domains, host_mem, report);
        }
        j += 1;
    }
}

/// Raise a guest's target by `amount`, deducting from tracked host free
/// memory on confirmation. Returns whether the action was applied.
fn apply_grow(
    host: &dyn VirtHost,
    host_mem: &mut HostMemoryState,
    vm: &VmId,
    amount: u64,
    domains: &mut BTreeMap<VmId, DomainState>,
    report: &mut TickReport,
) -> bool {
    let from_kb = domains[vm].memory.actual_kb;
    let target_kb = from_kb + amount;
    match host.set_memory_kb(vm, target_kb) {
        Ok(()) => {
            tracing::info!(vm = %vm, from_kb, to_kb = target_kb, "grew memory for pressured guest");
            if let Some(domain) = domains.get_mut(vm) {
                domain.memory.actual_kb = target_kb;
            }
            host_mem.free_kb = host_mem.free_kb.saturating_sub(amount);
            report.memory_actions.push(MemoryAction {
                vm: vm.clone(),
                kind: MemoryActionKind::Grow,
                from_kb,
                to_kb: target_kb,
            });
            true
        }
        Err(e) => {
            tracing::warn!(vm = %vm, from_kb, to_kb = target_kb, error = %e,
                "memory grow rejected, previous allocation stays authoritative");
            report.action_failures += 1;
            false
        }
    }
}

/// Lower a donor's target by `amount`. Only an unpaired shrink credits the
/// reclaimed memory back to the tracked host free figure; in a pair the
/// memory has already been handed to the hungry guest.
#[allow(clippy::too_many_arguments)]
fn apply_shrink(
    cfg: &MemoryConfig,
    host: &dyn VirtHost,
    vm: &VmId,
    amount: u64,
    credit_host: bool,
    domains: &mut BTreeMap<VmId, DomainState>,
    host_mem: &mut HostMemoryState,
    report: &mut TickReport,
) {
    let from_kb = domains[vm].memory.actual_kb;
    let target_kb = from_kb.saturating_sub(amount).max(cfg.min_alloc_kb);
    if target_kb == from_kb {
        return;
    }
    match host.set_memory_kb(vm, target_kb) {
        Ok(()) => {
            tracing::info!(vm = %vm, from_kb, to_kb = target_kb, "shrank memory of idle guest");
            if let Some(domain) = domains.get_mut(vm) {
                domain.memory.actual_kb = target_kb;
            }
            if credit_host {
                host_mem.free_kb += from_kb - target_kb;
            }
            report.memory_actions.push(MemoryAction {
                vm: vm.clone(),
                kind: MemoryActionKind::Shrink,
                from_kb,
                to_kb: target_kb,
            });
        }
        Err(e) => {
            tracing::warn!(vm = %vm, from_kb, to_kb = target_kb, error = %e,
                "memory shrink rejected, previous allocation stays authoritative");
            report.action_failures += 1;
        }
    }
}
