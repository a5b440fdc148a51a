//! In-memory host implementing [`VirtHost`] for tests
//!
//! Counters are scripted by the test; successful actions are recorded and,
//! where it keeps scenarios simple, reflected back into the scripted state
//! (a pin updates the vCPU's reported placement, a memory target updates the
//! domain's balloon size). Failure injection flags cover every per-entity
//! and connection-level error path.

use std::collections::BTreeMap;
use std::sync::Mutex;

use virt_types::CpuMask;
use virt_types::DomainMemoryCounters;
use virt_types::HostMemoryTotals;
use virt_types::VcpuCounterSample;
use virt_types::VmId;

use super::Result;
use super::VirtError;
use super::VirtHost;

/// One recorded `pin_vcpu` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinCall {
    pub vm: VmId,
    pub vcpu: u32,
    pub pcpu: u32,
}

/// One recorded `set_memory_kb` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMemoryCall {
    pub vm: VmId,
    pub target_kb: u64,
}

#[derive(Debug, Default, Clone)]
struct MockDomain {
    vcpus: Vec<VcpuCounterSample>,
    pin_masks: BTreeMap<u32, CpuMask>,
    memory: DomainMemoryCounters,
    max_memory_kb: u64,
    stats_period: Option<u32>,
    fail_vcpu_counters: bool,
    fail_memory_counters: bool,
    fail_pin: bool,
    fail_set_memory: bool,
}

#[derive(Debug, Default)]
struct MockState {
    pcpu_count: u32,
    host: HostMemoryTotals,
    domains: BTreeMap<VmId, MockDomain>,
    fail_listing: bool,
    fail_host_memory: bool,
    pins: Vec<PinCall>,
    memory_sets: Vec<SetMemoryCall>,
}

/// Scriptable in-memory virtualization host.
#[derive(Debug, Default)]
pub struct MockVirtHost {
    state: Mutex<MockState>,
}

impl MockVirtHost {
    pub fn new(pcpu_count: u32, host_total_kb: u64, host_free_kb: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                pcpu_count,
                host: HostMemoryTotals {
                    total_kb: host_total_kb,
                    free_kb: host_free_kb,
                },
                ..MockState::default()
            }),
        }
    }

    /// Register a domain with `vcpus` vCPUs, all counters zeroed.
    pub fn add_domain(&self, vm: impl Into<VmId>, vcpus: u32, max_memory_kb: u64) {
        let mut state = self.state.lock().unwrap();
        let domain = MockDomain {
            vcpus: (0..vcpus)
                .map(|vcpu| VcpuCounterSample {
                    vcpu,
                    cpu_time_ns: 0,
                    pcpu: None,
                })
                .collect(),
            max_memory_kb,
            ..MockDomain::default()
        };
        state.domains.insert(vm.into(), domain);
    }

    pub fn remove_domain(&self, vm: &VmId) {
        self.state.lock().unwrap().domains.remove(vm);
    }

    /// Script one vCPU's cumulative counter and reported placement.
    pub fn set_vcpu_counter(&self, vm: &VmId, vcpu: u32, cpu_time_ns: u64, pcpu: Option<u32>) {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(vm).expect("unknown mock domain");
        let slot = domain
            .vcpus
            .iter_mut()
            .find(|s| s.vcpu == vcpu)
            .expect("unknown mock vcpu");
        slot.cpu_time_ns = cpu_time_ns;
        slot.pcpu = pcpu;
    }

    pub fn set_pin_mask(&self, vm: &VmId, vcpu: u32, mask: CpuMask) {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(vm).expect("unknown mock domain");
        domain.pin_masks.insert(vcpu, mask);
    }

    pub fn set_memory_counters(&self, vm: &VmId, counters: DomainMemoryCounters) {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(vm).expect("unknown mock domain");
        domain.memory = counters;
    }

    pub fn set_host_free_kb(&self, free_kb: u64) {
        self.state.lock().unwrap().host.free_kb = free_kb;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn fail_host_memory(&self, fail: bool) {
        self.state.lock().unwrap().fail_host_memory = fail;
    }

    pub fn fail_vcpu_counters(&self, vm: &VmId, fail: bool) {
        let mut state = self.state.lock().unwrap();
        state.domains.get_mut(vm).expect("unknown mock domain").fail_vcpu_counters = fail;
    }

    pub fn fail_memory_counters(&self, vm: &VmId, fail: bool) {
        let mut state = self.state.lock().unwrap();
        state.domains.get_mut(vm).expect("unknown mock domain").fail_memory_counters = fail;
    }

    pub fn fail_pin(&self, vm: &VmId, fail: bool) {
        let mut state = self.state.lock().unwrap();
        state.domains.get_mut(vm).expect("unknown mock domain").fail_pin = fail;
    }

    pub fn fail_set_memory(&self, vm: &VmId, fail: bool) {
        let mut state = self.state.lock().unwrap();
        state.domains.get_mut(vm).expect("unknown mock domain").fail_set_memory = fail;
    }

    /// All successfully applied pin calls, in order.
    pub fn pins(&self) -> Vec<PinCall> {
        self.state.lock().unwrap().pins.clone()
    }

    /// All successfully applied memory-target calls, in order.
    pub fn memory_sets(&self) -> Vec<SetMemoryCall> {
        self.state.lock().unwrap().memory_sets.clone()
    }

    pub fn stats_period(&self, vm: &VmId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.domains.get(vm).and_then(|d| d.stats_period)
    }
}

impl VirtHost for MockVirtHost {
    fn list_active_vms(&self) -> Result<Vec<VmId>> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(VirtError::Connection("listing unavailable".to_string()));
        }
        Ok(state.domains.keys().cloned().collect())
    }

    fn physical_cpu_count(&self) -> Result<u32> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(VirtError::Connection("node info unavailable".to_string()));
        }
        Ok(state.pcpu_count)
    }

    fn enable_memory_stats(&self, vm: &VmId, period_secs: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(vm)
            .ok_or_else(|| VirtError::sample_unavailable(vm, "domain not found"))?;
        domain.stats_period = Some(period_secs);
        Ok(())
    }

    fn vcpu_counters(&self, vm: &VmId) -> Result<Vec<VcpuCounterSample>> {
        let state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get(vm)
            .ok_or_else(|| VirtError::sample_unavailable(vm, "domain not found"))?;
        if domain.fail_vcpu_counters {
            return Err(VirtError::sample_unavailable(vm, "injected counter failure"));
        }
        Ok(domain.vcpus.clone())
    }

    fn vcpu_pin_mask(&self, vm: &VmId, vcpu: u32) -> Result<CpuMask> {
        let state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get(vm)
            .ok_or_else(|| VirtError::sample_unavailable(vm, "domain not found"))?;
        domain
            .pin_masks
            .get(&vcpu)
            .cloned()
            .ok_or_else(|| VirtError::sample_unavailable(vm, "no pin info"))
    }

    fn pin_vcpu(&self, vm: &VmId, vcpu: u32, pcpu: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let count = state.pcpu_count;
        let domain = state
            .domains
            .get_mut(vm)
            .ok_or_else(|| VirtError::action_failed(vm, "domain not found"))?;
        if domain.fail_pin {
            return Err(VirtError::action_failed(vm, "injected pin failure"));
        }
        if let Some(slot) = domain.vcpus.iter_mut().find(|s| s.vcpu == vcpu) {
            slot.pcpu = Some(pcpu);
        }
        domain.pin_masks.insert(vcpu, CpuMask::single(count, pcpu));
        state.pins.push(PinCall {
            vm: vm.clone(),
            vcpu,
            pcpu,
        });
        Ok(())
    }

    fn memory_counters(&self, vm: &VmId) -> Result<DomainMemoryCounters> {
        let state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get(vm)
            .ok_or_else(|| VirtError::sample_unavailable(vm, "domain not found"))?;
        if domain.fail_memory_counters {
            return Err(VirtError::sample_unavailable(vm, "injected stats failure"));
        }
        Ok(domain.memory)
    }

    fn max_memory_kb(&self, vm: &VmId) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get(vm)
            .ok_or_else(|| VirtError::sample_unavailable(vm, "domain not found"))?;
        Ok(domain.max_memory_kb)
    }

    fn set_memory_kb(&self, vm: &VmId, target_kb: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(vm)
            .ok_or_else(|| VirtError::action_failed(vm, "domain not found"))?;
        if domain.fail_set_memory {
            return Err(VirtError::action_failed(vm, "injected balloon failure"));
        }
        domain.memory.actual_kb = target_kb;
        state.memory_sets.push(SetMemoryCall {
            vm: vm.clone(),
            target_kb,
        });
        Ok(())
    }

    fn host_memory(&self) -> Result<HostMemoryTotals> {
        let state = self.state.lock().unwrap();
        if state.fail_host_memory {
            return Err(VirtError::Connection(
                "host memory stats unavailable".to_string(),
            ));
        }
        Ok(state.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_updates_reported_placement_and_mask() {
        let host = MockVirtHost::new(4, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 20);
        let vm = VmId::new("vm-a");

        host.pin_vcpu(&vm, 0, 3).expect("pin should succeed");

        let counters = host.vcpu_counters(&vm).expect("counters");
        assert_eq!(counters[0].pcpu, Some(3));
        let mask = host.vcpu_pin_mask(&vm, 0).expect("mask");
        assert!(mask.contains(3));
        assert_eq!(host.pins().len(), 1);
    }

    #[test]
    fn injected_pin_failure_records_nothing() {
        let host = MockVirtHost::new(4, 1 << 20, 1 << 19);
        host.add_domain("vm-a", 1, 1 << 20);
        let vm = VmId::new("vm-a");
        host.fail_pin(&vm, true);

        let err = host.pin_vcpu(&vm, 0, 2).expect_err("pin should fail");
        assert!(matches!(err, VirtError::ActionFailed { .. }));
        assert!(host.pins().is_empty());
    }

    #[test]
    fn listing_failure_is_a_connection_error() {
        let host = MockVirtHost::new(2, 1 << 20, 1 << 19);
        host.fail_listing(true);
        let err = host.list_active_vms().expect_err("listing should fail");
        assert!(err.is_connection());
    }
}
