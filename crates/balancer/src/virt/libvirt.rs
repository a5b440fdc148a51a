//! Production connector backed by a local libvirt daemon.
//!
//! Domains are resolved by name on every call; no `Domain` handle outlives
//! the call that created it, so the balancing core can never act through a
//! handle the hypervisor has already invalidated.

use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use virt_types::CpuMask;
use virt_types::DomainMemoryCounters;
use virt_types::HostMemoryTotals;
use virt_types::VcpuCounterSample;
use virt_types::VmId;

use super::Result;
use super::VirtError;
use super::VirtHost;

pub struct LibvirtHost {
    conn: Connect,
    pcpu_count: u32,
}

impl LibvirtHost {
    /// Open a management connection, e.g. to `qemu:///system`.
    pub fn connect(uri: &str) -> Result<Self> {
        let conn = Connect::open(Some(uri))
            .map_err(|e| VirtError::Connection(format!("open {uri}: {e}")))?;
        let node = conn
            .get_node_info()
            .map_err(|e| VirtError::Connection(format!("node info: {e}")))?;
        Ok(Self {
            conn,
            pcpu_count: node.cpus,
        })
    }

    fn domain(&self, vm: &VmId) -> Result<Domain> {
        Domain::lookup_by_name(&self.conn, vm.as_str())
            .map_err(|e| VirtError::sample_unavailable(vm, e))
    }
}

impl VirtHost for LibvirtHost {
    fn list_active_vms(&self) -> Result<Vec<VmId>> {
        let domains = self
            .conn
            .list_all_domains(sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE)
            .map_err(|e| VirtError::Connection(format!("list domains: {e}")))?;
        let mut vms = Vec::with_capacity(domains.len());
        for domain in domains {
            let name = domain
                .get_name()
                .map_err(|e| VirtError::Connection(format!("domain name: {e}")))?;
            vms.push(VmId::new(name));
        }
        Ok(vms)
    }

    fn physical_cpu_count(&self) -> Result<u32> {
        Ok(self.pcpu_count)
    }

    fn enable_memory_stats(&self, vm: &VmId, period_secs: u32) -> Result<()> {
        self.domain(vm)?
            .set_memory_stats_period(period_secs as i32, 0)
            .map_err(|e| VirtError::sample_unavailable(vm, e))?;
        Ok(())
    }

    fn vcpu_counters(&self, vm: &VmId) -> Result<Vec<VcpuCounterSample>> {
        let infos = self
            .domain(vm)?
            .get_vcpus()
            .map_err(|e| VirtError::sample_unavailable(vm, e))?;
        Ok(infos
            .into_iter()
            .map(|info| VcpuCounterSample {
                vcpu: info.number,
                cpu_time_ns: info.cpu_time,
                pcpu: u32::try_from(info.cpu).ok(),
            })
            .collect())
    }

    fn vcpu_pin_mask(&self, vm: &VmId, vcpu: u32) -> Result<CpuMask> {
        // libvirt reports the placement per vCPU alongside the counters; the
        // pin mask is reconstructed from the vCPU's current physical CPU.
        let infos = self
            .domain(vm)?
            .get_vcpus()
            .map_err(|e| VirtError::sample_unavailable(vm, e))?;
        let info = infos
            .into_iter()
            .find(|info| info.number == vcpu)
            .ok_or_else(|| VirtError::sample_unavailable(vm, format!("no vcpu {vcpu}")))?;
        match u32::try_from(info.cpu) {
            Ok(pcpu) => Ok(CpuMask::single(self.pcpu_count, pcpu)),
            Err(_) => Ok(CpuMask::new(self.pcpu_count)),
        }
    }

    fn pin_vcpu(&self, vm: &VmId, vcpu: u32, pcpu: u32) -> Result<()> {
        let mask = CpuMask::single(self.pcpu_count, pcpu);
        self.domain(vm)?
            .pin_vcpu(vcpu, mask.as_bytes())
            .map_err(|e| VirtError::action_failed(vm, e))?;
        Ok(())
    }

    fn memory_counters(&self, vm: &VmId) -> Result<DomainMemoryCounters> {
        let stats = self
            .domain(vm)?
            .memory_stats(0)
            .map_err(|e| VirtError::sample_unavailable(vm, e))?;
        let mut counters = DomainMemoryCounters::default();
        for stat in stats {
            match stat.tag as u32 {
                sys::VIR_DOMAIN_MEMORY_STAT_UNUSED => counters.unused_kb = stat.val,
                sys::VIR_DOMAIN_MEMORY_STAT_AVAILABLE => counters.available_kb = stat.val,
                sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON => counters.actual_kb = stat.val,
                sys::VIR_DOMAIN_MEMORY_STAT_SWAP_IN => counters.swap_in_kb = stat.val,
                sys::VIR_DOMAIN_MEMORY_STAT_SWAP_OUT => counters.swap_out_kb = stat.val,
                _ => {}
            }
        }
        Ok(counters)
    }

    fn max_memory_kb(&self, vm: &VmId) -> Result<u64> {
        self.domain(vm)?
            .get_max_memory()
            .map_err(|e| VirtError::sample_unavailable(vm, e))
    }

    fn set_memory_kb(&self, vm: &VmId, target_kb: u64) -> Result<()> {
        self.domain(vm)?
            .set_memory(target_kb)
            .map_err(|e| VirtError::action_failed(vm, e))?;
        Ok(())
    }

    fn host_memory(&self) -> Result<HostMemoryTotals> {
        let node = self
            .conn
            .get_node_info()
            .map_err(|e| VirtError::Connection(format!("node info: {e}")))?;
        let free_bytes = self
            .conn
            .get_free_memory()
            .map_err(|e| VirtError::Connection(format!("free memory: {e}")))?;
        Ok(HostMemoryTotals {
            total_kb: node.memory,
            free_kb: free_bytes / 1024,
        })
    }
}

impl Drop for LibvirtHost {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            tracing::warn!(error = %e, "failed to close management connection");
        }
    }
}
