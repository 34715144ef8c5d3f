use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// What kind of memory traffic an access belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
pub enum AccessKind {
    Load,
    Rfo,
    Prefetch,
    Writeback,
    Translation,
}

/// Outcome of one access as seen by the stat tables.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
pub enum AccessStatus {
    Hit,
    /// Sectored only: tag matched but the word was invalid.
    WordHit,
    /// Sectored only: tag matched, sector partially valid, word invalid.
    HoleMiss,
    Miss,
    MshrMerge,
    /// Queue or MSHR capacity rejected the access this cycle.
    ReservationFail,
}

/// Per-cache access counter matrix, keyed by `(kind, status)`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub accesses: IndexMap<(AccessKind, AccessStatus), u64>,
    pub prefetch_issued: u64,
    pub prefetch_useful: u64,
    pub prefetch_dropped: u64,
    pub evictions: u64,
    pub writebacks_sent: u64,
}

impl Cache {
    pub fn inc(&mut self, kind: AccessKind, status: AccessStatus, count: u64) {
        *self.accesses.entry((kind, status)).or_insert(0) += count;
    }

    #[must_use]
    pub fn count(&self, kind: AccessKind, status: AccessStatus) -> u64 {
        self.accesses.get(&(kind, status)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total(&self, status: AccessStatus) -> u64 {
        self.accesses
            .iter()
            .filter(|((_, s), _)| *s == status)
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn demand_hit_rate(&self) -> f64 {
        let hits: u64 = [AccessKind::Load, AccessKind::Rfo]
            .into_iter()
            .map(|kind| {
                self.count(kind, AccessStatus::Hit) + self.count(kind, AccessStatus::WordHit)
            })
            .sum();
        let misses: u64 = [AccessKind::Load, AccessKind::Rfo]
            .into_iter()
            .map(|kind| {
                self.count(kind, AccessStatus::Miss)
                    + self.count(kind, AccessStatus::HoleMiss)
                    + self.count(kind, AccessStatus::MshrMerge)
            })
            .sum();
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut accesses: Vec<_> = self
            .accesses
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|((kind, status), count)| (format!("{kind}[{status}]"), count))
            .collect();
        accesses.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut out = f.debug_struct("Cache");
        for (key, count) in accesses {
            out.field(&key, count);
        }
        out.field("prefetch_issued", &self.prefetch_issued)
            .field("prefetch_useful", &self.prefetch_useful)
            .field("evictions", &self.evictions)
            .finish()
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        for (key, count) in other.accesses {
            *self.accesses.entry(key).or_insert(0) += count;
        }
        self.prefetch_issued += other.prefetch_issued;
        self.prefetch_useful += other.prefetch_useful;
        self.prefetch_dropped += other.prefetch_dropped;
        self.evictions += other.evictions;
        self.writebacks_sent += other.writebacks_sent;
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, AccessStatus, Cache};

    #[test]
    fn counters_fold() {
        let mut a = Cache::default();
        a.inc(AccessKind::Load, AccessStatus::Hit, 2);
        let mut b = Cache::default();
        b.inc(AccessKind::Load, AccessStatus::Hit, 3);
        b.inc(AccessKind::Rfo, AccessStatus::Miss, 1);

        a += b;
        assert_eq!(a.count(AccessKind::Load, AccessStatus::Hit), 5);
        assert_eq!(a.total(AccessStatus::Miss), 1);
    }

    #[test]
    fn hit_rate_ignores_prefetches() {
        let mut stats = Cache::default();
        stats.inc(AccessKind::Load, AccessStatus::Hit, 3);
        stats.inc(AccessKind::Load, AccessStatus::Miss, 1);
        stats.inc(AccessKind::Prefetch, AccessStatus::Miss, 100);
        assert!((stats.demand_hit_rate() - 0.75).abs() < 1e-9);
    }
}
