//! vCPU placement balancing: threshold decisions and repinning.
//!
//! A pCPU is overloaded when its total load exceeds `mean + stddev` and may
//! receive vCPUs while strictly below `mean - stddev`. Candidates are
//! processed in a stable order (ascending source pCPU, then domain name,
//! then vCPU index) and every confirmed move is folded back into the load
//! model so later candidates in the same tick decide on the updated picture.

use std::collections::BTreeMap;

use virt_types::VmId;

use super::load_model::LoadModel;
use super::types::DomainState;
use super::types::Migration;
use super::types::TickReport;
use super::types::SETTLE_TICKS_AFTER_MIGRATION;
use crate::virt::VirtHost;

struct Candidate {
    vm: VmId,
    vcpu: u32,
    source: u32,
    utilization: f64,
}

/// One balancing pass: decide and apply vCPU migrations.
pub fn balance(
    host: &dyn VirtHost,
    model: &mut LoadModel,
    domains: &mut BTreeMap<VmId, DomainState>,
    report: &mut TickReport,
) {
    // Hysteresis counters age once per pass, before candidacy is evaluated.
    for domain in domains.values_mut() {
        for vcpu in &mut domain.vcpus {
            vcpu.settle_ticks = vcpu.settle_ticks.saturating_sub(1);
        }
    }

    let over = model.over_threshold();
    let under = model.under_threshold();
    tracing::debug!(
        mean = model.mean(),
        stddev = model.stddev(),
        over_threshold = over,
        under_threshold = under,
        "pCPU load thresholds"
    );

    let candidates = collect_candidates(model, domains, over);

    for candidate in candidates {
        // Earlier migrations may have relieved the source already.
        let source_load = match model.load_of(candidate.source) {
            Some(load) if load > over => load,
            _ => continue,
        };
        let Some(dest) = model.coldest_below_threshold(candidate.source) else {
            tracing::debug!(
                vm = %candidate.vm, vcpu = candidate.vcpu, source = candidate.source,
                "no pCPU below the under-utilization threshold, leaving vCPU in place"
            );
            continue;
        };

        match host.pin_vcpu(&candidate.vm, candidate.vcpu, dest.id) {
            Ok(()) => {
                tracing::info!(
                    vm = %candidate.vm,
                    vcpu = candidate.vcpu,
                    from = candidate.source,
                    to = dest.id,
                    utilization = candidate.utilization,
                    source_load = source_load,
                    dest_load = dest.load,
                    "migrated vCPU off overloaded pCPU"
                );
                model.apply_migration(candidate.source, dest.id, candidate.utilization);
                if let Some(domain) = domains.get_mut(&candidate.vm) {
                    let slot = domain.vcpu_mut(candidate.vcpu);
                    slot.pcpu = Some(dest.id);
                    slot.settle_ticks = SETTLE_TICKS_AFTER_MIGRATION;
                }
                report.migrations.push(Migration {
                    vm: candidate.vm,
                    vcpu: candidate.vcpu,
                    from: candidate.source,
                    to: dest.id,
                });
            }
            Err(e) => {
                tracing::warn!(
                    vm = %candidate.vm, vcpu = candidate.vcpu,
                    from = candidate.source, to = dest.id, error = %e,
                    "repin rejected, assignment unchanged"
                );
                report.action_failures += 1;
            }
        }
    }
}

/// Migration candidates in deterministic order: ascending overloaded pCPU
/// id, then domain name, then vCPU index. Settling vCPUs are not eligible.
fn collect_candidates(
    model: &LoadModel,
    domains: &BTreeMap<VmId, DomainState>,
    over: f64,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for pcpu in model.pcpus().iter().filter(|p| p.load > over) {
        for (vm, domain) in domains.iter() {
            for vcpu in &domain.vcpus {
                if vcpu.pcpu == Some(pcpu.id) && vcpu.settle_ticks == 0 {
                    candidates.push(Candidate {
                        vm: vm.clone(),
                        vcpu: vcpu.vcpu,
                        source: pcpu.id,
                        utilization: vcpu.utilization,
                    });
                }
            }
        }
    }
    candidates
}
