use crate::address;
use indexmap::IndexMap;
use std::io::Write;
use std::path::PathBuf;

const HEATMAP_FLUSH_SIZE: usize = 4096;

/// Usage record of one live physical block.
#[derive(Debug, Clone)]
pub struct BlockUsageDescriptor {
    pub paddr: address,
    pub vaddr: address,
    pub ip: u64,
    pub cache_hit: bool,
    pub stack_distance: u64,
    pub reuses: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReuseMetrics {
    pub cache_friendly: u64,
    pub cache_averse: u64,
}

/// Stack-distance tracker over block-aligned physical addresses.
///
/// Exactly one descriptor exists per live block; an access zeroes its own
/// distance and ages every other descriptor by one. Reuses inside the
/// distance limit count as cache friendly; a heatmap of per-block reuse
/// flushes to the report file once it grows past a threshold.
pub struct ReuseTracker {
    usages: Vec<BlockUsageDescriptor>,
    metrics: ReuseMetrics,
    heatmap: IndexMap<u64, i64>,
    distance_limit: u64,
    report_path: Option<PathBuf>,
    pub total_usages: u64,
}

impl ReuseTracker {
    #[must_use]
    pub fn new(distance_limit: u64, report_path: Option<PathBuf>) -> Self {
        Self {
            usages: Vec::new(),
            metrics: ReuseMetrics::default(),
            heatmap: IndexMap::new(),
            distance_limit,
            report_path,
            total_usages: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.usages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.usages.is_empty()
    }

    #[must_use]
    pub fn metrics(&self) -> &ReuseMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn descriptor(&self, paddr: address) -> Option<&BlockUsageDescriptor> {
        let block = crate::block_addr(paddr);
        self.usages.iter().find(|d| d.paddr == block)
    }

    pub fn add_usage(&mut self, vaddr: address, paddr: address, ip: u64, cache_hit: bool, record: bool) {
        let block = crate::block_addr(paddr);
        self.total_usages += 1;

        let found = self.usages.iter().position(|d| d.paddr == block);

        // Every live descriptor ages, whether or not the block was known.
        for descriptor in &mut self.usages {
            descriptor.stack_distance += 1;
        }

        match found {
            None => self.usages.push(BlockUsageDescriptor {
                paddr: block,
                vaddr,
                ip,
                cache_hit,
                stack_distance: 0,
                reuses: 0,
            }),
            Some(at) => {
                let (friendly, block_id) = {
                    let descriptor = &mut self.usages[at];
                    if cache_hit {
                        descriptor.reuses += 1;
                    } else {
                        descriptor.reuses = 0;
                    }
                    let friendly = descriptor.stack_distance <= self.distance_limit;
                    descriptor.stack_distance = 0;
                    descriptor.cache_hit = cache_hit;
                    (friendly, descriptor.paddr >> crate::LOG2_BLOCK_SIZE)
                };
                if record {
                    if friendly {
                        self.metrics.cache_friendly += 1;
                        *self.heatmap.entry(block_id).or_insert(0) += 1;
                    } else {
                        self.metrics.cache_averse += 1;
                        *self.heatmap.entry(block_id).or_insert(0) -= 1;
                    }
                    self.maybe_flush_heatmap();
                }
            }
        }
    }

    fn maybe_flush_heatmap(&mut self) {
        if self.heatmap.len() < HEATMAP_FLUSH_SIZE {
            return;
        }
        if let Err(err) = self.flush_heatmap() {
            log::warn!("reuse heatmap flush failed: {err}");
        }
        self.heatmap.clear();
    }

    /// Appends `<block_id> <count>` lines to the report file.
    pub fn flush_heatmap(&self) -> std::io::Result<()> {
        let Some(path) = &self.report_path else {
            return Ok(());
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for (block_id, count) in &self.heatmap {
            writeln!(file, "{block_id} {count}")?;
        }
        Ok(())
    }

    pub fn clear_stats(&mut self) {
        self.metrics = ReuseMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::ReuseTracker;

    #[test]
    fn access_zeroes_self_and_ages_others() {
        let mut tracker = ReuseTracker::new(16, None);
        tracker.add_usage(0x1000, 0x1000, 0x400, false, true);
        tracker.add_usage(0x2000, 0x2000, 0x400, false, true);
        tracker.add_usage(0x3000, 0x3000, 0x400, false, true);

        let before: Vec<u64> = [0x1000u64, 0x2000]
            .iter()
            .map(|&a| tracker.descriptor(a).unwrap().stack_distance)
            .collect();

        tracker.add_usage(0x3000, 0x3000, 0x400, true, true);

        assert_eq!(tracker.descriptor(0x3000).unwrap().stack_distance, 0);
        for (i, &addr) in [0x1000u64, 0x2000].iter().enumerate() {
            assert_eq!(
                tracker.descriptor(addr).unwrap().stack_distance,
                before[i] + 1
            );
        }
    }

    #[test]
    fn one_descriptor_per_block() {
        let mut tracker = ReuseTracker::new(16, None);
        tracker.add_usage(0x1000, 0x1000, 0x400, false, true);
        tracker.add_usage(0x1008, 0x1008, 0x404, true, true);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn distance_limit_classifies_reuse() {
        let mut tracker = ReuseTracker::new(1, None);
        tracker.add_usage(0x1000, 0x1000, 0x400, false, true);
        tracker.add_usage(0x2000, 0x2000, 0x400, false, true);
        tracker.add_usage(0x3000, 0x3000, 0x400, false, true);
        // 0x1000 aged three times since insertion -> averse at limit 1
        tracker.add_usage(0x1000, 0x1000, 0x400, true, true);
        assert_eq!(tracker.metrics().cache_averse, 1);
        // back-to-back reuse ages by exactly one -> friendly
        tracker.add_usage(0x1000, 0x1000, 0x400, true, true);
        assert_eq!(tracker.metrics().cache_friendly, 1);
    }
}
