use crate::resource::{ResourceKind, ResourceSnapshot};

const GB: u64 = 1024 * 1024 * 1024;

/// Size-tiered pressure thresholds, selected once at startup from a
/// resource's total capacity. Larger pools tolerate a higher fill
/// fraction before reacting because their absolute headroom is bigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionThreshold {
    pub name: &'static str,
    /// Totals up to this capacity select the tier.
    pub ceiling: u64,
    /// Enter "eviction needed" when `used / total >= evict_at`.
    pub evict_at: f64,
    /// Enter "throttle needed" when `used / total >= throttle_at`.
    pub throttle_at: f64,
    /// Enter "stop needed" when `used / total >= stop_at`.
    pub stop_at: f64,
}

const TIERS: [EvictionThreshold; 6] = [
    EvictionThreshold { name: "1g", ceiling: GB, evict_at: 0.75, throttle_at: 0.85, stop_at: 0.95 },
    EvictionThreshold { name: "8g", ceiling: 8 * GB, evict_at: 0.78, throttle_at: 0.87, stop_at: 0.96 },
    EvictionThreshold { name: "16g", ceiling: 16 * GB, evict_at: 0.80, throttle_at: 0.88, stop_at: 0.97 },
    EvictionThreshold { name: "32g", ceiling: 32 * GB, evict_at: 0.82, throttle_at: 0.90, stop_at: 0.97 },
    EvictionThreshold { name: "64g", ceiling: 64 * GB, evict_at: 0.84, throttle_at: 0.91, stop_at: 0.98 },
    EvictionThreshold { name: "128g", ceiling: 128 * GB, evict_at: 0.86, throttle_at: 0.92, stop_at: 0.98 },
];

/// Independent boolean transitions produced by classifying one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PressureFlags {
    pub evict: bool,
    pub throttle: bool,
    pub stop: bool,
}

impl EvictionThreshold {
    /// Selects the smallest tier whose ceiling covers `total`; totals
    /// beyond the largest tier use the largest.
    pub fn for_total(total: u64) -> EvictionThreshold {
        for tier in TIERS {
            if total <= tier.ceiling {
                return tier;
            }
        }
        TIERS[TIERS.len() - 1]
    }

    /// Classifies one sample. Heap pools use the used fraction; offheap
    /// pools trip on vital-memory-remaining; disk pools trip on the
    /// reserved fraction.
    pub fn classify(&self, kind: ResourceKind, sample: ResourceSnapshot) -> PressureFlags {
        let fraction = match kind {
            ResourceKind::Heap => sample.used_fraction(),
            ResourceKind::Offheap => {
                if sample.vital_remaining() <= sample.vital {
                    // Reservations ate into the vital floor: behave as full.
                    1.0
                } else {
                    sample.reserved_fraction()
                }
            }
            ResourceKind::Disk => sample.reserved_fraction(),
        };
        PressureFlags {
            evict: fraction >= self.evict_at,
            throttle: fraction >= self.throttle_at,
            stop: fraction >= self.stop_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, used: u64) -> ResourceSnapshot {
        ResourceSnapshot { total, used, reserved: used, vital: 0 }
    }

    #[test]
    fn tier_selection_is_by_total_capacity() {
        assert_eq!(EvictionThreshold::for_total(GB / 2).name, "1g");
        assert_eq!(EvictionThreshold::for_total(10 * GB).name, "16g");
        assert_eq!(EvictionThreshold::for_total(500 * GB).name, "128g");
    }

    #[test]
    fn heap_classification_uses_used_fraction() {
        let tier = EvictionThreshold::for_total(GB);
        let calm = tier.classify(ResourceKind::Heap, sample(GB, GB / 2));
        assert_eq!(calm, PressureFlags::default());

        let critical = tier.classify(ResourceKind::Heap, sample(GB, GB - GB / 100));
        assert!(critical.evict && critical.throttle && critical.stop);
    }

    #[test]
    fn offheap_trips_when_vital_floor_is_breached() {
        let tier = EvictionThreshold::for_total(GB);
        let snap = ResourceSnapshot {
            total: GB,
            used: GB / 2,
            reserved: GB - 1024,
            vital: 4096,
        };
        let flags = tier.classify(ResourceKind::Offheap, snap);
        assert!(flags.stop);
    }
}
