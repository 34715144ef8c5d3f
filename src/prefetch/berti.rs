use super::{Descriptor, FillEvent, IssueBuffer, Prefetcher, Request};
use crate::packet::FillLevel;
use crate::{BLOCK_SIZE, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE, PAGE_SIZE};
use serde::Deserialize;

const PAGE_BLOCKS: u64 = PAGE_SIZE / BLOCK_SIZE;
const TIME_MASK: u64 = (1 << 16) - 1;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Knobs {
    pub current_pages: usize,
    pub num_berti: usize,
    pub prev_requests: usize,
    pub latency_entries: usize,
    pub record_pages: usize,
    pub ip_entries: usize,
    pub throttling: usize,
    /// Follow the record table's page link when a page is revisited.
    pub linnea: bool,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            current_pages: 63,
            num_berti: 8,
            prev_requests: 1024,
            latency_entries: 1024,
            record_pages: 1024,
            ip_entries: 4096,
            throttling: 1,
            linnea: true,
        }
    }
}

/// A page currently being learned: seen offsets and candidate deltas.
#[derive(Debug, Clone)]
struct CurrentPage {
    page_addr: u64,
    u_vector: u64,
    berti: Vec<i32>,
    berti_score: Vec<u32>,
    current_berti: i32,
    lru: u64,
}

impl CurrentPage {
    fn new(page_addr: u64, num_berti: usize) -> Self {
        Self {
            page_addr,
            u_vector: 0,
            berti: vec![0; num_berti],
            berti_score: vec![0; num_berti],
            current_berti: 0,
            lru: 0,
        }
    }

    fn best_berti(&self) -> i32 {
        self.berti
            .iter()
            .zip(&self.berti_score)
            .max_by_key(|(_, &score)| score)
            .filter(|(_, &score)| score > 0)
            .map_or(0, |(&delta, _)| delta)
    }
}

/// Timestamped request ring approximating the MSHR for latency learning.
#[derive(Debug, Clone, Copy, Default)]
struct TimedEntry {
    page_addr: u64,
    offset: u64,
    time: u64,
    completed: bool,
}

/// A retired page remembered for the next visit.
#[derive(Debug, Clone, Copy, Default)]
struct RecordPage {
    page_addr: u64,
    /// Page that followed this one the last time (Linnea link).
    linnea: u64,
    last_offset: u64,
    lru: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LearnedBerti {
    berti: i32,
}

/// Berti: learns, per page and per IP, the delta ("berti") that would have
/// hidden the observed fill latency, and prefetches at that delta.
pub struct Berti {
    knobs: Knobs,
    current: Vec<CurrentPage>,
    prev_requests: Vec<TimedEntry>,
    prev_head: usize,
    latencies: Vec<TimedEntry>,
    latency_head: usize,
    records: Vec<RecordPage>,
    page_berti: Vec<LearnedBerti>,
    clock: u64,
}

impl Berti {
    #[must_use]
    pub fn new(knobs: Knobs) -> Self {
        Self {
            current: Vec::with_capacity(knobs.current_pages),
            prev_requests: vec![TimedEntry::default(); knobs.prev_requests.max(1)],
            prev_head: 0,
            latencies: vec![TimedEntry::default(); knobs.latency_entries.max(1)],
            latency_head: 0,
            records: vec![RecordPage::default(); knobs.record_pages.max(1)],
            page_berti: vec![LearnedBerti::default(); knobs.ip_entries.max(1)],
            clock: 0,
            knobs,
        }
    }

    fn current_index(&self, page_addr: u64) -> Option<usize> {
        self.current.iter().position(|p| p.page_addr == page_addr)
    }

    fn touch_current(&mut self, idx: usize) {
        self.clock += 1;
        self.current[idx].lru = self.clock;
    }

    /// Makes room for a new page, recording the evicted one.
    fn insert_current(&mut self, page_addr: u64, last_offset: u64) -> usize {
        if let Some(idx) = self.current_index(page_addr) {
            return idx;
        }
        if self.current.len() >= self.knobs.current_pages {
            let victim = self
                .current
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.lru)
                .map(|(i, _)| i)
                .unwrap();
            let evicted = self.current.swap_remove(victim);
            self.record_page(evicted.page_addr, page_addr, last_offset);
            let ip_berti = evicted.best_berti();
            if ip_berti != 0 {
                let idx = (evicted.page_addr as usize) % self.page_berti.len();
                self.page_berti[idx].berti = ip_berti;
            }
        }
        self.current
            .push(CurrentPage::new(page_addr, self.knobs.num_berti));
        self.current.len() - 1
    }

    fn record_page(&mut self, page_addr: u64, next_page: u64, last_offset: u64) {
        self.clock += 1;
        if let Some(entry) = self.records.iter_mut().find(|r| r.page_addr == page_addr) {
            entry.linnea = next_page;
            entry.last_offset = last_offset;
            entry.lru = self.clock;
            return;
        }
        let victim = self
            .records
            .iter_mut()
            .min_by_key(|r| r.lru)
            .unwrap();
        *victim = RecordPage {
            page_addr,
            linnea: next_page,
            last_offset,
            lru: self.clock,
        };
    }

    fn push_timed(ring: &mut [TimedEntry], head: &mut usize, entry: TimedEntry) {
        ring[*head] = entry;
        *head = (*head + 1) % ring.len();
    }

    /// Offsets demanded `latency` cycles before `req_time` vote for their
    /// delta to the just-completed offset.
    fn score_berti(&mut self, idx: usize, offset: u64, latency: u64, req_time: u64) {
        let cutoff = req_time.wrapping_sub(latency) & TIME_MASK;
        let page_addr = self.current[idx].page_addr;
        let mut votes: Vec<i32> = Vec::new();
        for entry in &self.prev_requests {
            if entry.page_addr != page_addr {
                continue;
            }
            let age = cutoff.wrapping_sub(entry.time) & TIME_MASK;
            if age < TIME_MASK / 2 {
                let delta = offset as i32 - entry.offset as i32;
                if delta != 0 && delta.unsigned_abs() < PAGE_BLOCKS as u32 {
                    votes.push(delta);
                }
            }
        }

        let page = &mut self.current[idx];
        for delta in votes {
            if let Some(slot) = page.berti.iter().position(|&b| b == delta) {
                page.berti_score[slot] += 1;
            } else if let Some(slot) = page
                .berti_score
                .iter()
                .position(|&score| score == 0)
            {
                page.berti[slot] = delta;
                page.berti_score[slot] = 1;
            }
        }
        page.current_berti = page.best_berti();
    }

    fn issue(&self, desc: &Descriptor, berti: i32, issue: &mut IssueBuffer) {
        if berti == 0 {
            return;
        }
        for i in 1..=self.knobs.throttling as i64 {
            let pf_cl = (desc.addr >> LOG2_BLOCK_SIZE) as i64 + i64::from(berti) * i;
            if pf_cl < 0 {
                break;
            }
            let pf_addr = (pf_cl as u64) << LOG2_BLOCK_SIZE;
            if pf_addr >> LOG2_PAGE_SIZE != desc.addr >> LOG2_PAGE_SIZE {
                break;
            }
            issue.push(Request {
                cpu: desc.cpu,
                size: BLOCK_SIZE as u32,
                ip: desc.ip,
                base_addr: desc.addr,
                pf_addr,
                fill_level: FillLevel::L1,
                offchip_pred: desc.offchip_pred,
            });
        }
    }
}

impl Prefetcher for Berti {
    fn name(&self) -> &'static str {
        "berti"
    }

    fn operate(&mut self, desc: &Descriptor, issue: &mut IssueBuffer) {
        let page_addr = desc.addr >> LOG2_PAGE_SIZE;
        let offset = (desc.addr >> LOG2_BLOCK_SIZE) & (PAGE_BLOCKS - 1);
        let now = desc.cycle & TIME_MASK;

        let idx = match self.current_index(page_addr) {
            Some(idx) => idx,
            None => {
                let idx = self.insert_current(page_addr, offset);
                // A recorded previous visit seeds the burst; with Linnea
                // the recorded follower page gets warmed too.
                let record = self
                    .records
                    .iter()
                    .find(|r| r.page_addr == page_addr)
                    .copied();
                if let Some(record) = record {
                    if self.knobs.linnea && record.linnea != 0 {
                        let berti =
                            self.page_berti[(record.linnea as usize) % self.page_berti.len()].berti;
                        if berti != 0 {
                            let base = (record.linnea << LOG2_PAGE_SIZE)
                                | (record.last_offset << LOG2_BLOCK_SIZE);
                            let linnea_desc = Descriptor { addr: base, ..*desc };
                            self.issue(&linnea_desc, berti, issue);
                        }
                    }
                }
                idx
            }
        };
        self.touch_current(idx);

        self.current[idx].u_vector |= 1 << offset;
        Self::push_timed(
            &mut self.prev_requests,
            &mut self.prev_head,
            TimedEntry {
                page_addr,
                offset,
                time: now,
                completed: false,
            },
        );

        if !desc.hit {
            Self::push_timed(
                &mut self.latencies,
                &mut self.latency_head,
                TimedEntry {
                    page_addr,
                    offset,
                    time: now,
                    completed: false,
                },
            );
        }

        let berti = match self.current[idx].current_berti {
            0 => self.page_berti[(page_addr as usize) % self.page_berti.len()].berti,
            b => b,
        };
        self.issue(desc, berti, issue);
    }

    fn fill(&mut self, event: &FillEvent) {
        let page_addr = event.addr >> LOG2_PAGE_SIZE;
        let offset = (event.addr >> LOG2_BLOCK_SIZE) & (PAGE_BLOCKS - 1);
        let now = event.cycle & TIME_MASK;

        // Close the latency measurement for this block.
        let latency = self
            .latencies
            .iter_mut()
            .find(|e| e.page_addr == page_addr && e.offset == offset && !e.completed)
            .map(|e| {
                e.completed = true;
                let latency = now.wrapping_sub(e.time) & TIME_MASK;
                e.time = latency;
                latency
            });

        if let (Some(latency), Some(idx)) = (latency, self.current_index(page_addr)) {
            self.score_berti(idx, offset, latency, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Berti, Knobs};
    use crate::prefetch::{Descriptor, FillEvent, IssueBuffer, Prefetcher};
    use crate::packet::AccessKind;

    fn desc(addr: u64, cycle: u64, hit: bool) -> Descriptor {
        Descriptor {
            hit,
            offchip_pred: false,
            kind: AccessKind::Load,
            cpu: 0,
            addr,
            v_addr: addr,
            ip: 0x400,
            size: 8,
            cycle,
            mshr_size: 8,
            mshr_occupancy: 0,
            pq_size: 16,
            pq_occupancy: 0,
        }
    }

    fn fill(addr: u64, cycle: u64) -> FillEvent {
        FillEvent {
            cpu: 0,
            addr,
            v_addr: addr,
            ip: 0x400,
            set: 0,
            way: 0,
            prefetch: false,
            victim_addr: None,
            cycle,
        }
    }

    #[test]
    fn learns_delta_from_timed_fills() {
        let mut berti = Berti::new(Knobs::default());
        let mut issue = IssueBuffer::default();

        // Misses at stride 1 with a 20-cycle fill latency.
        let mut cycle = 100;
        for i in 0..8u64 {
            let addr = 0x40000 + i * 0x40;
            berti.operate(&desc(addr, cycle, false), &mut issue);
            berti.fill(&fill(addr, cycle + 20));
            cycle += 30;
        }
        assert!(
            issue.requests.iter().any(|r| r.pf_addr > r.base_addr),
            "expected forward prefetches after latency-covered deltas"
        );
    }
}
