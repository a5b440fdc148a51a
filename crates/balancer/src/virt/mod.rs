//! Management-API boundary: the host trait, its error taxonomy, and the
//! available connectors.
//!
//! The balancing core is written against [`VirtHost`] so it can be driven by
//! the in-memory [`mock::MockVirtHost`] in tests and by the libvirt-backed
//! connector (feature `libvirt`) in production.

#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod mock;

use virt_types::CpuMask;
use virt_types::DomainMemoryCounters;
use virt_types::HostMemoryTotals;
use virt_types::VcpuCounterSample;
use virt_types::VmId;

/// Errors crossing the management-API boundary.
///
/// The three variants carry the recovery policy: `Connection` aborts the
/// tick, the per-entity variants are logged and the entity is skipped with
/// its last derived state retained.
#[derive(Debug, thiserror::Error)]
pub enum VirtError {
    /// The management connection itself is unusable; the whole tick is
    /// skipped and retried on the next interval.
    #[error("hypervisor connection failure: {0}")]
    Connection(String),

    /// A counter read failed or the entity vanished mid-tick.
    #[error("sample unavailable for {entity}: {reason}")]
    SampleUnavailable { entity: String, reason: String },

    /// A pin or memory-target call was rejected by the hypervisor.
    #[error("action failed for {entity}: {reason}")]
    ActionFailed { entity: String, reason: String },
}

impl VirtError {
    pub fn sample_unavailable(entity: impl ToString, reason: impl ToString) -> Self {
        Self::SampleUnavailable {
            entity: entity.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn action_failed(entity: impl ToString, reason: impl ToString) -> Self {
        Self::ActionFailed {
            entity: entity.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type for management-API operations
pub type Result<T> = std::result::Result<T, VirtError>;

/// Contract with the virtualization host's management API.
///
/// Domains are addressed by their stable [`VmId`]; implementations resolve
/// handles internally per call and never hand them out, so no caller can
/// hold a stale handle across ticks.
pub trait VirtHost: Send + Sync {
    /// List the currently active domains. Fails only with
    /// [`VirtError::Connection`].
    fn list_active_vms(&self) -> Result<Vec<VmId>>;

    /// Number of physical CPUs on the host, ids `0..N`.
    fn physical_cpu_count(&self) -> Result<u32>;

    /// Ask the guest balloon driver to refresh its memory statistics every
    /// `period_secs` seconds.
    fn enable_memory_stats(&self, vm: &VmId, period_secs: u32) -> Result<()>;

    /// Cumulative run-time counters for every vCPU of a domain.
    fn vcpu_counters(&self, vm: &VmId) -> Result<Vec<VcpuCounterSample>>;

    /// Current pin mask of one vCPU.
    fn vcpu_pin_mask(&self, vm: &VmId, vcpu: u32) -> Result<CpuMask>;

    /// Restrict a vCPU's allowed CPUs to exactly `pcpu`.
    fn pin_vcpu(&self, vm: &VmId, vcpu: u32, pcpu: u32) -> Result<()>;

    /// Balloon-driver memory counters for a domain.
    fn memory_counters(&self, vm: &VmId) -> Result<DomainMemoryCounters>;

    /// Maximum memory the domain may ever be ballooned up to, in KiB.
    fn max_memory_kb(&self, vm: &VmId) -> Result<u64>;

    /// Set the domain's memory target (balloon), in KiB.
    fn set_memory_kb(&self, vm: &VmId, target_kb: u64) -> Result<()>;

    /// Host-wide memory totals. Fails only with [`VirtError::Connection`].
    fn host_memory(&self) -> Result<HostMemoryTotals>;
}
