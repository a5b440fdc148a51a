//! Shared type definitions crossing the virtualization-host boundary.
//!
//! This crate contains the plain data types exchanged with the host
//! management API: guest identity, raw per-vCPU counter samples, domain and
//! host memory counters, and CPU pin masks. No balancing logic lives here.

use derive_more::Display;
use serde::Deserialize;
use serde::Serialize;

/// Stable identity of a managed guest: its domain name.
///
/// Raw management-API handles are never retained across ticks; derived state
/// is correlated by this key and handles are re-resolved per call.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmId(String);

impl VmId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VmId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// One vCPU's raw counter reading for a single tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VcpuCounterSample {
    /// Index of the vCPU within its domain.
    pub vcpu: u32,
    /// Cumulative run time in nanoseconds since the domain started.
    pub cpu_time_ns: u64,
    /// Physical CPU the vCPU was last scheduled on, when the host reports it.
    pub pcpu: Option<u32>,
}

/// Balloon-driver memory counters for one domain, in KiB.
///
/// `swap_in_kb`/`swap_out_kb` are cumulative totals as reported by the
/// guest; consumers interested in swap activity must diff successive samples.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DomainMemoryCounters {
    /// Memory the guest currently leaves unused.
    pub unused_kb: u64,
    /// Memory usable by the guest (roughly its view of total).
    pub available_kb: u64,
    /// Current balloon size, i.e. the domain's effective allocation.
    pub actual_kb: u64,
    /// Cumulative memory swapped in by the guest.
    pub swap_in_kb: u64,
    /// Cumulative memory swapped out by the guest.
    pub swap_out_kb: u64,
}

/// Host-wide memory totals, in KiB.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HostMemoryTotals {
    pub total_kb: u64,
    pub free_kb: u64,
}

/// Bitmask over physical CPU ids, one bit per pCPU.
///
/// Stored as a byte map in the same layout the hypervisor consumes, so a
/// mask built for `n` CPUs occupies `(n + 7) / 8` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuMask {
    bits: Vec<u8>,
}

impl CpuMask {
    /// An all-clear mask sized for `num_cpus` physical CPUs.
    pub fn new(num_cpus: u32) -> Self {
        Self {
            bits: vec![0; (num_cpus as usize).div_ceil(8)],
        }
    }

    /// A mask sized for `num_cpus` with exactly one CPU allowed.
    pub fn single(num_cpus: u32, cpu: u32) -> Self {
        let mut mask = Self::new(num_cpus.max(cpu + 1));
        mask.set(cpu);
        mask
    }

    pub fn set(&mut self, cpu: u32) {
        let byte = cpu as usize / 8;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (cpu % 8);
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.bits
            .get(cpu as usize / 8)
            .is_some_and(|b| b & (1 << (cpu % 8)) != 0)
    }

    /// Lowest CPU id present in the mask.
    pub fn first_set(&self) -> Option<u32> {
        self.bits.iter().enumerate().find_map(|(i, b)| {
            if *b == 0 {
                None
            } else {
                Some(i as u32 * 8 + b.trailing_zeros())
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Raw byte map, laid out least-significant CPU first.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_mask_set_and_query() {
        let mut mask = CpuMask::new(16);
        assert_eq!(mask.as_bytes().len(), 2);
        assert!(mask.is_empty());

        mask.set(0);
        mask.set(9);
        assert!(mask.contains(0));
        assert!(mask.contains(9));
        assert!(!mask.contains(1));
        assert_eq!(mask.first_set(), Some(0));
    }

    #[test]
    fn cpu_mask_single_allows_exactly_one_cpu() {
        let mask = CpuMask::single(8, 5);
        assert!(mask.contains(5));
        assert_eq!(mask.first_set(), Some(5));
        assert_eq!((0..8).filter(|c| mask.contains(*c)).count(), 1);
    }

    #[test]
    fn cpu_mask_grows_when_setting_out_of_range() {
        let mut mask = CpuMask::new(4);
        mask.set(21);
        assert!(mask.contains(21));
        assert_eq!(mask.first_set(), Some(21));
    }

    #[test]
    fn first_set_on_empty_mask_is_none() {
        assert_eq!(CpuMask::new(8).first_set(), None);
        assert_eq!(CpuMask::default().first_set(), None);
    }

    #[test]
    fn vm_id_display_uses_domain_name() {
        let id = VmId::new("guest-01");
        assert_eq!(id.to_string(), "guest-01");
        assert_eq!(id.as_str(), "guest-01");
    }
}
