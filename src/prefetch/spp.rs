use super::{Descriptor, FillEvent, IssueBuffer, Prefetcher, Request};
use crate::hash::jenkins;
use crate::packet::FillLevel;
use crate::{BLOCK_SIZE, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE, PAGE_SIZE};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Knobs {
    pub st_sets: usize,
    pub st_ways: usize,
    pub st_tag_bits: u32,
    pub sig_shift: u32,
    pub sig_bits: u32,
    pub sig_delta_bits: u32,
    pub pt_sets: usize,
    pub pt_ways: usize,
    pub c_sig_bits: u32,
    pub c_delta_bits: u32,
    pub quotient_bits: u32,
    pub remainder_bits: u32,
    pub fill_threshold: u32,
    pub pf_threshold: u32,
    pub global_counter_bits: u32,
    pub ghr_size: usize,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            st_sets: 1,
            st_ways: 256,
            st_tag_bits: 16,
            sig_shift: 3,
            sig_bits: 12,
            sig_delta_bits: 7,
            pt_sets: 512,
            pt_ways: 4,
            c_sig_bits: 4,
            c_delta_bits: 4,
            quotient_bits: 10,
            remainder_bits: 6,
            fill_threshold: 90,
            pf_threshold: 25,
            global_counter_bits: 10,
            ghr_size: 8,
        }
    }
}

impl Knobs {
    fn sig_mask(&self) -> u32 {
        (1 << self.sig_bits) - 1
    }
    fn st_tag_mask(&self) -> u32 {
        (1 << self.st_tag_bits) - 1
    }
    fn c_sig_max(&self) -> u32 {
        (1 << self.c_sig_bits) - 1
    }
    fn global_counter_max(&self) -> u64 {
        (1 << self.global_counter_bits) - 1
    }
    fn filter_sets(&self) -> usize {
        1 << self.quotient_bits
    }
}

/// Per-page rolling delta signatures.
struct SignatureTable {
    valid: Vec<Vec<bool>>,
    tag: Vec<Vec<u32>>,
    last_offset: Vec<Vec<u32>>,
    sig: Vec<Vec<u32>>,
    lru: Vec<Vec<u32>>,
}

impl SignatureTable {
    fn new(knobs: &Knobs) -> Self {
        Self {
            valid: vec![vec![false; knobs.st_ways]; knobs.st_sets],
            tag: vec![vec![0; knobs.st_ways]; knobs.st_sets],
            last_offset: vec![vec![0; knobs.st_ways]; knobs.st_sets],
            sig: vec![vec![0; knobs.st_ways]; knobs.st_sets],
            lru: vec![vec![knobs.st_ways as u32 - 1; knobs.st_ways]; knobs.st_sets],
        }
    }

    /// Reads the signature of `page`, folds the new delta in, and reports
    /// `(last_sig, curr_sig, delta)` for pattern-table training/lookup.
    fn read_and_update(
        &mut self,
        knobs: &Knobs,
        ghr: &GlobalRegister,
        page: u64,
        page_offset: u32,
    ) -> (u32, u32, i32) {
        let set = jenkins(page) as usize % self.valid.len();
        let partial_page = (page as u32) & knobs.st_tag_mask();
        let ways = self.valid[set].len();

        let mut last_sig = 0;
        let mut curr_sig = 0;
        let mut delta = 0i32;

        let mut match_way = ways;
        for way in 0..ways {
            if self.valid[set][way] && self.tag[set][way] == partial_page {
                last_sig = self.sig[set][way];
                delta = page_offset as i32 - self.last_offset[set][way] as i32;
                if delta != 0 {
                    let sig_delta = sign_magnitude(delta, knobs.sig_delta_bits);
                    self.sig[set][way] =
                        ((last_sig << knobs.sig_shift) ^ sig_delta) & knobs.sig_mask();
                    self.last_offset[set][way] = page_offset;
                    curr_sig = self.sig[set][way];
                } else {
                    // Same line again; nothing to learn.
                    last_sig = 0;
                }
                match_way = way;
                break;
            }
        }

        if match_way == ways {
            // Invalid way first, LRU way otherwise.
            match_way = (0..ways)
                .find(|&way| !self.valid[set][way])
                .unwrap_or_else(|| {
                    (0..ways)
                        .find(|&way| self.lru[set][way] == ways as u32 - 1)
                        .unwrap()
                });
            self.valid[set][match_way] = true;
            self.tag[set][match_way] = partial_page;
            self.sig[set][match_way] = 0;
            self.last_offset[set][match_way] = page_offset;
            curr_sig = 0;

            // Bootstrap the signature from the global register when a
            // cross-page prefetch predicted this very first offset.
            if let Some(boot) = ghr.check_entry(page_offset) {
                let sig_delta = sign_magnitude(ghr.delta[boot], knobs.sig_delta_bits);
                self.sig[set][match_way] =
                    ((ghr.sig[boot] << knobs.sig_shift) ^ sig_delta) & knobs.sig_mask();
                curr_sig = self.sig[set][match_way];
            }
        }

        let touched = self.lru[set][match_way];
        for way in 0..ways {
            if self.lru[set][way] < touched {
                self.lru[set][way] += 1;
            }
        }
        self.lru[set][match_way] = 0;

        (last_sig, curr_sig, delta)
    }
}

/// Per-signature delta candidates with saturating counters.
struct PatternTable {
    delta: Vec<Vec<i32>>,
    counter_delta: Vec<Vec<u32>>,
    counter_sig: Vec<u32>,
}

impl PatternTable {
    fn new(knobs: &Knobs) -> Self {
        Self {
            delta: vec![vec![0; knobs.pt_ways]; knobs.pt_sets],
            counter_delta: vec![vec![0; knobs.pt_ways]; knobs.pt_sets],
            counter_sig: vec![0; knobs.pt_sets],
        }
    }

    fn update_pattern(&mut self, knobs: &Knobs, last_sig: u32, curr_delta: i32) {
        let set = jenkins(u64::from(last_sig)) as usize % self.delta.len();

        if let Some(way) = self.delta[set].iter().position(|&d| d == curr_delta) {
            self.counter_delta[set][way] += 1;
        } else {
            // Replace the least confident delta.
            let way = (0..self.delta[set].len())
                .min_by_key(|&way| self.counter_delta[set][way])
                .unwrap();
            self.delta[set][way] = curr_delta;
            self.counter_delta[set][way] = 0;
        }
        self.counter_sig[set] += 1;

        if self.counter_sig[set] > knobs.c_sig_max() {
            for counter in &mut self.counter_delta[set] {
                *counter >>= 1;
            }
            self.counter_sig[set] >>= 1;
        }
    }

    /// Candidate deltas above the prefetch threshold plus the most
    /// confident way to follow on the lookahead path.
    fn read_pattern(
        &self,
        knobs: &Knobs,
        ghr: &GlobalRegister,
        curr_sig: u32,
        lookahead_conf: u32,
        depth: u32,
    ) -> (Vec<(i32, u32)>, Option<(usize, u32)>) {
        let set = jenkins(u64::from(curr_sig)) as usize % self.delta.len();
        let mut candidates = Vec::new();
        let mut best: Option<(usize, u32)> = None;

        if self.counter_sig[set] == 0 {
            return (candidates, None);
        }
        for way in 0..self.delta[set].len() {
            let local_conf = (100 * self.counter_delta[set][way]) / self.counter_sig[set];
            let pf_conf = if depth > 0 {
                (ghr.accuracy() as u32)
                    .saturating_mul(self.counter_delta[set][way])
                    / self.counter_sig[set]
                    * lookahead_conf
                    / 100
            } else {
                local_conf
            };
            if pf_conf >= knobs.pf_threshold {
                candidates.push((self.delta[set][way], pf_conf));
                if best.map_or(true, |(_, conf)| pf_conf > conf) {
                    best = Some((way, pf_conf));
                }
            }
        }
        (candidates, best)
    }

    fn delta_at(&self, curr_sig: u32, way: usize) -> i32 {
        let set = jenkins(u64::from(curr_sig)) as usize % self.delta.len();
        self.delta[set][way]
    }
}

/// Cross-page bootstrap entries plus the global accuracy counters.
struct GlobalRegister {
    valid: Vec<bool>,
    sig: Vec<u32>,
    confidence: Vec<u32>,
    offset: Vec<u32>,
    delta: Vec<i32>,
    pf_issued: u64,
    pf_useful: u64,
}

impl GlobalRegister {
    fn new(knobs: &Knobs) -> Self {
        Self {
            valid: vec![false; knobs.ghr_size],
            sig: vec![0; knobs.ghr_size],
            confidence: vec![0; knobs.ghr_size],
            offset: vec![0; knobs.ghr_size],
            delta: vec![0; knobs.ghr_size],
            pf_issued: 0,
            pf_useful: 0,
        }
    }

    fn accuracy(&self) -> u64 {
        if self.pf_issued == 0 {
            return 0;
        }
        (100 * self.pf_useful) / self.pf_issued
    }

    fn check_entry(&self, page_offset: u32) -> Option<usize> {
        (0..self.valid.len())
            .filter(|&i| self.valid[i] && self.offset[i] == page_offset)
            .max_by_key(|&i| self.confidence[i])
    }

    fn update_entry(&mut self, pf_sig: u32, pf_confidence: u32, pf_offset: u32, pf_delta: i32) {
        // Same offset gets refreshed in place.
        if let Some(i) = (0..self.valid.len()).find(|&i| self.valid[i] && self.offset[i] == pf_offset)
        {
            self.sig[i] = pf_sig;
            self.confidence[i] = pf_confidence;
            self.delta[i] = pf_delta;
            return;
        }
        // Evict the least confident entry.
        let victim = (0..self.valid.len())
            .min_by_key(|&i| self.confidence[i])
            .unwrap();
        self.valid[victim] = true;
        self.sig[victim] = pf_sig;
        self.confidence[victim] = pf_confidence;
        self.offset[victim] = pf_offset;
        self.delta[victim] = pf_delta;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterRequest {
    L2cPrefetch,
    LlcPrefetch,
    Demand,
    Evict,
}

/// Quotient/remainder filter deduplicating prefetches and measuring their
/// usefulness.
struct PrefetchFilter {
    remainder_tag: Vec<u64>,
    valid: Vec<bool>,
    useful: Vec<bool>,
}

impl PrefetchFilter {
    fn new(knobs: &Knobs) -> Self {
        Self {
            remainder_tag: vec![0; knobs.filter_sets()],
            valid: vec![false; knobs.filter_sets()],
            useful: vec![false; knobs.filter_sets()],
        }
    }

    fn check(
        &mut self,
        knobs: &Knobs,
        ghr: &mut GlobalRegister,
        check_addr: u64,
        request: FilterRequest,
    ) -> bool {
        let cache_line = check_addr >> LOG2_BLOCK_SIZE;
        let hash = jenkins(cache_line);
        let quotient = ((hash >> knobs.remainder_bits) & ((1 << knobs.quotient_bits) - 1)) as usize;
        let remainder = hash % (1 << knobs.remainder_bits);

        match request {
            FilterRequest::L2cPrefetch => {
                if (self.valid[quotient] || self.useful[quotient])
                    && self.remainder_tag[quotient] == remainder
                {
                    return false;
                }
                self.valid[quotient] = true;
                self.useful[quotient] = false;
                self.remainder_tag[quotient] = remainder;
            }
            // Low-confidence prefetches park in the large LLC without
            // claiming a filter slot, so a later confident L2C prefetch
            // still goes out and hits there.
            FilterRequest::LlcPrefetch => {
                if (self.valid[quotient] || self.useful[quotient])
                    && self.remainder_tag[quotient] == remainder
                {
                    return false;
                }
            }
            FilterRequest::Demand => {
                if self.remainder_tag[quotient] == remainder && !self.useful[quotient] {
                    self.useful[quotient] = true;
                    if self.valid[quotient] {
                        ghr.pf_useful += 1;
                    }
                }
            }
            FilterRequest::Evict => {
                if self.valid[quotient] && !self.useful[quotient] && ghr.pf_useful > 0 {
                    ghr.pf_useful -= 1;
                }
                self.valid[quotient] = false;
                self.useful[quotient] = false;
                self.remainder_tag[quotient] = 0;
            }
        }
        true
    }
}

fn sign_magnitude(delta: i32, bits: u32) -> u32 {
    if delta < 0 {
        (-delta) as u32 + (1 << (bits - 1))
    } else {
        delta as u32
    }
}

/// Signature Path Prefetcher: follows learned per-page delta paths with
/// confidence-scaled lookahead, filling into L2 above `fill_threshold`
/// and into the LLC below it.
pub struct Spp {
    knobs: Knobs,
    st: SignatureTable,
    pt: PatternTable,
    filter: PrefetchFilter,
    ghr: GlobalRegister,
}

impl Spp {
    #[must_use]
    pub fn new(knobs: Knobs) -> Self {
        Self {
            st: SignatureTable::new(&knobs),
            pt: PatternTable::new(&knobs),
            filter: PrefetchFilter::new(&knobs),
            ghr: GlobalRegister::new(&knobs),
            knobs,
        }
    }
}

impl Prefetcher for Spp {
    fn name(&self) -> &'static str {
        "spp"
    }

    fn operate(&mut self, desc: &Descriptor, issue: &mut IssueBuffer) {
        let page = desc.addr >> LOG2_PAGE_SIZE;
        let page_offset = ((desc.addr >> LOG2_BLOCK_SIZE) & (PAGE_SIZE / BLOCK_SIZE - 1)) as u32;

        // Stage 1: read and roll the page signature.
        let (last_sig, mut curr_sig, delta) =
            self.st
                .read_and_update(&self.knobs, &self.ghr, page, page_offset);

        self.filter
            .check(&self.knobs, &mut self.ghr, desc.addr, FilterRequest::Demand);

        // Stage 2: train the pattern table on the completed delta.
        if last_sig != 0 {
            self.pt.update_pattern(&self.knobs, last_sig, delta);
        }

        // Stage 3: walk the lookahead path while confidence holds.
        let mut base_addr = desc.addr;
        let mut lookahead_conf = 100u32;
        let mut depth = 0u32;
        let budget = desc.mshr_size.max(1);

        loop {
            let (candidates, best) =
                self.pt
                    .read_pattern(&self.knobs, &self.ghr, curr_sig, lookahead_conf, depth);
            if candidates.is_empty() || issue.requests.len() >= budget {
                break;
            }

            for (delta, conf) in &candidates {
                let pf_addr = ((base_addr & !(BLOCK_SIZE - 1)) as i64
                    + (i64::from(*delta) << LOG2_BLOCK_SIZE)) as u64;

                if base_addr & !(PAGE_SIZE - 1) == pf_addr & !(PAGE_SIZE - 1) {
                    let to_l2 = *conf >= self.knobs.fill_threshold;
                    let request = if to_l2 {
                        FilterRequest::L2cPrefetch
                    } else {
                        FilterRequest::LlcPrefetch
                    };
                    if self.filter.check(&self.knobs, &mut self.ghr, pf_addr, request) {
                        issue.push(Request {
                            cpu: desc.cpu,
                            size: BLOCK_SIZE as u32,
                            ip: desc.ip,
                            base_addr,
                            pf_addr,
                            fill_level: if to_l2 { FillLevel::L2 } else { FillLevel::Llc },
                            offchip_pred: desc.offchip_pred,
                        });
                    }
                    if to_l2 {
                        self.ghr.pf_issued += 1;
                        if self.ghr.pf_issued > self.knobs.global_counter_max() {
                            self.ghr.pf_issued >>= 1;
                            self.ghr.pf_useful >>= 1;
                        }
                    }
                } else {
                    // Crossing the page: stash for cross-page bootstrap.
                    let pf_offset = ((pf_addr >> LOG2_BLOCK_SIZE) & 0x3F) as u32;
                    self.ghr.update_entry(curr_sig, *conf, pf_offset, *delta);
                }
            }

            let Some((way, conf)) = best else { break };
            if conf < self.knobs.pf_threshold {
                break;
            }
            let step = self.pt.delta_at(curr_sig, way);
            base_addr = (base_addr as i64 + (i64::from(step) << LOG2_BLOCK_SIZE)) as u64;
            let sig_delta = sign_magnitude(step, self.knobs.sig_delta_bits);
            curr_sig = ((curr_sig << self.knobs.sig_shift) ^ sig_delta) & self.knobs.sig_mask();
            lookahead_conf = conf;
            depth += 1;
        }
    }

    fn fill(&mut self, event: &FillEvent) {
        if let Some(victim) = event.victim_addr {
            self.filter
                .check(&self.knobs, &mut self.ghr, victim, FilterRequest::Evict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Knobs, Spp};
    use crate::prefetch::{Descriptor, IssueBuffer, Prefetcher};
    use crate::packet::AccessKind;

    fn desc(addr: u64) -> Descriptor {
        Descriptor {
            hit: false,
            offchip_pred: false,
            kind: AccessKind::Load,
            cpu: 0,
            addr,
            v_addr: addr,
            ip: 0x400,
            size: 8,
            cycle: 0,
            mshr_size: 8,
            mshr_occupancy: 0,
            pq_size: 16,
            pq_occupancy: 0,
        }
    }

    #[test]
    fn learns_a_unit_stride_within_a_page() {
        let mut spp = Spp::new(Knobs::default());
        let mut issue = IssueBuffer::default();
        for i in 0..16u64 {
            spp.operate(&desc(0x40000 + i * 0x40), &mut issue);
        }
        assert!(!issue.requests.is_empty());
        // all prefetches stay inside the page
        assert!(issue
            .requests
            .iter()
            .all(|r| r.pf_addr >> 12 == r.base_addr >> 12));
    }

    #[test]
    fn filter_suppresses_duplicate_prefetches() {
        let mut spp = Spp::new(Knobs::default());
        let mut issue = IssueBuffer::default();
        for _ in 0..3 {
            for i in 0..8u64 {
                spp.operate(&desc(0x80000 + i * 0x40), &mut issue);
            }
        }
        let mut addrs: Vec<_> = issue.requests.iter().map(|r| r.pf_addr).collect();
        let total = addrs.len();
        addrs.sort_unstable();
        addrs.dedup();
        assert!(addrs.len() >= total / 2, "filter should keep most issues unique");
    }
}
