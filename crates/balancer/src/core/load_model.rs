//! Aggregation of vCPU utilization onto physical CPUs.
//!
//! A pure reduction: given every vCPU's placement and utilization it yields
//! per-pCPU totals plus mean and population standard deviation over exactly
//! `N` CPUs, idle ones included. The only mutation is the balancer's own
//! in-tick self-update after a confirmed migration.

use std::cmp::Ordering;

/// Aggregate load on one physical CPU, recomputed every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcpuLoad {
    pub id: u32,
    /// Sum of assigned vCPUs' utilization, percent.
    pub load: f64,
    pub vcpu_count: u32,
}

/// Per-tick view of physical CPU load.
#[derive(Debug, Clone)]
pub struct LoadModel {
    pcpus: Vec<PcpuLoad>,
    mean: f64,
    stddev: f64,
}

impl LoadModel {
    /// Reduce `(placement, utilization)` pairs onto exactly `pcpu_count`
    /// buckets. Unassigned or out-of-range placements are excluded from
    /// aggregation.
    pub fn compute<I>(pcpu_count: u32, vcpus: I) -> Self
    where
        I: IntoIterator<Item = (Option<u32>, f64)>,
    {
        let mut pcpus: Vec<PcpuLoad> = (0..pcpu_count)
            .map(|id| PcpuLoad {
                id,
                load: 0.0,
                vcpu_count: 0,
            })
            .collect();

        for (placement, utilization) in vcpus {
            let Some(id) = placement else { continue };
            let Some(pcpu) = pcpus.get_mut(id as usize) else {
                continue;
            };
            pcpu.load += utilization;
            pcpu.vcpu_count += 1;
        }

        let n = pcpu_count.max(1) as f64;
        let mean = pcpus.iter().map(|p| p.load).sum::<f64>() / n;
        let variance = pcpus.iter().map(|p| (p.load - mean).powi(2)).sum::<f64>() / n;

        Self {
            pcpus,
            mean,
            stddev: variance.sqrt(),
        }
    }

    pub fn pcpus(&self) -> &[PcpuLoad] {
        &self.pcpus
    }

    pub fn load_of(&self, pcpu: u32) -> Option<f64> {
        self.pcpus.get(pcpu as usize).map(|p| p.load)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        self.stddev
    }

    /// Load above which a pCPU is considered overloaded.
    pub fn over_threshold(&self) -> f64 {
        self.mean + self.stddev
    }

    /// Load below which a pCPU may receive migrated vCPUs.
    pub fn under_threshold(&self) -> f64 {
        self.mean - self.stddev
    }

    /// Least-loaded pCPU strictly below the under-utilization threshold,
    /// ties broken by lowest id. `exclude` keeps the candidate's own source
    /// out of consideration.
    pub fn coldest_below_threshold(&self, exclude: u32) -> Option<PcpuLoad> {
        let under = self.under_threshold();
        self.pcpus
            .iter()
            .filter(|p| p.id != exclude && p.load < under)
            .min_by(|a, b| {
                a.load
                    .partial_cmp(&b.load)
                    .unwrap_or(Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .copied()
    }

    /// Reflect a confirmed migration so later decisions in the same tick see
    /// the updated picture. Thresholds stay frozen for the tick.
    pub fn apply_migration(&mut self, from: u32, to: u32, utilization: f64) {
        if let Some(pcpu) = self.pcpus.get_mut(from as usize) {
            pcpu.load -= utilization;
            pcpu.vcpu_count = pcpu.vcpu_count.saturating_sub(1);
        }
        if let Some(pcpu) = self.pcpus.get_mut(to as usize) {
            pcpu.load += utilization;
            pcpu.vcpu_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_sum_per_assigned_pcpu() {
        let model = LoadModel::compute(
            3,
            vec![
                (Some(0), 30.0),
                (Some(0), 20.0),
                (Some(1), 40.0),
                (None, 99.0),    // unassigned: excluded
                (Some(7), 10.0), // out of range: excluded
            ],
        );

        assert_eq!(model.load_of(0), Some(50.0));
        assert_eq!(model.load_of(1), Some(40.0));
        assert_eq!(model.load_of(2), Some(0.0));
        assert_eq!(model.pcpus()[0].vcpu_count, 2);
        assert_eq!(model.pcpus()[2].vcpu_count, 0);

        let total: f64 = model.pcpus().iter().map(|p| p.load).sum();
        assert_eq!(total, 90.0, "totals cover exactly the assigned vCPUs");
    }

    #[test]
    fn statistics_cover_idle_pcpus() {
        // 90 / 10 over two CPUs: mean 50, population stddev 40.
        let model = LoadModel::compute(2, vec![(Some(0), 90.0), (Some(1), 10.0)]);
        assert_eq!(model.mean(), 50.0);
        assert_eq!(model.stddev(), 40.0);
        assert_eq!(model.over_threshold(), 90.0);
        assert_eq!(model.under_threshold(), 10.0);

        // Same load over four CPUs: idle CPUs pull the mean down.
        let model = LoadModel::compute(4, vec![(Some(0), 90.0), (Some(1), 10.0)]);
        assert_eq!(model.mean(), 25.0);
    }

    #[test]
    fn coldest_destination_requires_strictly_under_threshold() {
        // Thresholds 90/10: pCPU1 at exactly 10 is not a destination.
        let model = LoadModel::compute(2, vec![(Some(0), 90.0), (Some(1), 10.0)]);
        assert!(model.coldest_below_threshold(0).is_none());
    }

    #[test]
    fn coldest_destination_prefers_lowest_load_then_lowest_id() {
        let model = LoadModel::compute(
            4,
            vec![(Some(0), 80.0), (Some(1), 50.0), (Some(2), 5.0), (Some(3), 5.0)],
        );
        // mean 35, stddev ~31.8 => under ~3.2: nothing qualifies.
        assert!(model.coldest_below_threshold(0).is_none());

        let model = LoadModel::compute(
            5,
            vec![
                (Some(0), 50.0),
                (Some(1), 50.0),
                (Some(2), 50.0),
                (Some(3), 10.0),
                (Some(4), 10.0),
            ],
        );
        // mean 34, stddev ~19.6 => under ~14.4: both quiet CPUs qualify, tie
        // on load resolves to the lower id.
        let dest = model.coldest_below_threshold(0).expect("a destination exists");
        assert_eq!(dest.id, 3);
    }

    #[test]
    fn apply_migration_moves_load_between_buckets() {
        let mut model = LoadModel::compute(2, vec![(Some(0), 70.0), (Some(1), 10.0)]);
        let over = model.over_threshold();

        model.apply_migration(0, 1, 30.0);
        assert_eq!(model.load_of(0), Some(40.0));
        assert_eq!(model.load_of(1), Some(40.0));
        assert_eq!(model.pcpus()[0].vcpu_count, 0);
        assert_eq!(model.pcpus()[1].vcpu_count, 2);
        assert_eq!(model.over_threshold(), over, "thresholds stay frozen");
    }

    #[test]
    fn zero_pcpus_does_not_divide_by_zero() {
        let model = LoadModel::compute(0, vec![(Some(0), 50.0)]);
        assert!(model.pcpus().is_empty());
        assert_eq!(model.mean(), 0.0);
        assert_eq!(model.stddev(), 0.0);
    }
}
