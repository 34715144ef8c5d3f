use crate::cache::Footprint;
use indexmap::IndexMap;

/// Per-cache word-usage histogram: on every access the touched words of
/// the block are marked; on eviction the popcount of the victim's bitmap
/// lands in `counters[popcount]` and the bitmap resets.
pub struct UsageTracker {
    bitmaps: Vec<Vec<Footprint>>,
    word_granularity: usize,
    block_size: usize,
    counters: IndexMap<usize, u64>,
}

impl UsageTracker {
    #[must_use]
    pub fn new(sets: usize, ways: usize, block_size: usize, word_granularity: usize) -> Self {
        let words = block_size / word_granularity;
        Self {
            bitmaps: vec![vec![Footprint::new(words); ways]; sets],
            word_granularity,
            block_size,
            counters: IndexMap::new(),
        }
    }

    /// Marks the `size`-byte run starting at `offset` within the block.
    pub fn touch(&mut self, set: usize, way: usize, offset: usize, size: usize) {
        debug_assert!(offset < self.block_size);
        self.bitmaps[set][way].touch(offset, size, self.word_granularity);
    }

    /// Accounts the victim's word usage and resets its bitmap.
    ///
    /// `record` is false during warmup so the histogram only reflects the
    /// measured window.
    pub fn evict(&mut self, set: usize, way: usize, record: bool) {
        let bitmap = &mut self.bitmaps[set][way];
        if record {
            *self.counters.entry(bitmap.count()).or_insert(0) += 1;
        }
        bitmap.clear();
    }

    #[must_use]
    pub fn counters(&self) -> &IndexMap<usize, u64> {
        &self.counters
    }

    pub fn report(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        let mut entries: Vec<_> = self.counters.iter().collect();
        entries.sort_by_key(|(words, _)| **words);
        for (words, count) in entries {
            writeln!(out, "{words:<4}{count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::UsageTracker;

    #[test]
    fn eviction_records_popcount_and_clears() {
        // 64-byte block, 4-byte words; offsets 0, 8, 40 -> 3 words used.
        let mut usage = UsageTracker::new(1, 1, 64, 4);
        for offset in [0usize, 8, 40] {
            usage.touch(0, 0, offset, 4);
        }
        usage.evict(0, 0, true);
        assert_eq!(usage.counters().get(&3), Some(&1));

        // bitmap was reset
        usage.evict(0, 0, true);
        assert_eq!(usage.counters().get(&0), Some(&1));
    }

    #[test]
    fn warmup_evictions_stay_out_of_the_histogram() {
        let mut usage = UsageTracker::new(1, 1, 64, 4);
        usage.touch(0, 0, 0, 4);
        usage.evict(0, 0, false);
        assert!(usage.counters().is_empty());
    }
}
