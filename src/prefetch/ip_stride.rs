use super::{Descriptor, IssueBuffer, Prefetcher, Request};
use crate::packet::FillLevel;
use crate::{BLOCK_SIZE, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Knobs {
    pub prefetch_degree: u64,
    pub ip_tracker_size: usize,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            prefetch_degree: 2,
            ip_tracker_size: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tracker {
    ip: u64,
    last_cl_addr: u64,
    last_stride: i64,
    lru: usize,
}

/// Classic per-PC stride prefetcher: issues `degree` prefetches along the
/// stride once the same stride is seen twice in a row. Never crosses a
/// page boundary.
pub struct IpStride {
    degree: u64,
    trackers: Vec<Tracker>,
}

impl IpStride {
    #[must_use]
    pub fn new(knobs: Knobs) -> Self {
        let mut trackers = vec![Tracker::default(); knobs.ip_tracker_size.max(1)];
        for (i, tracker) in trackers.iter_mut().enumerate() {
            tracker.lru = i;
        }
        Self {
            degree: knobs.prefetch_degree.max(1),
            trackers,
        }
    }

    fn touch(&mut self, idx: usize) {
        let touched = self.trackers[idx].lru;
        for tracker in &mut self.trackers {
            if tracker.lru < touched {
                tracker.lru += 1;
            }
        }
        self.trackers[idx].lru = 0;
    }
}

impl Prefetcher for IpStride {
    fn name(&self) -> &'static str {
        "ip_stride"
    }

    fn operate(&mut self, desc: &Descriptor, issue: &mut IssueBuffer) {
        let cl_addr = desc.addr >> LOG2_BLOCK_SIZE;

        let Some(idx) = self.trackers.iter().position(|t| t.ip == desc.ip) else {
            let victim = self
                .trackers
                .iter()
                .position(|t| t.lru == self.trackers.len() - 1)
                .unwrap();
            self.trackers[victim] = Tracker {
                ip: desc.ip,
                last_cl_addr: cl_addr,
                last_stride: 0,
                lru: self.trackers[victim].lru,
            };
            self.touch(victim);
            return;
        };

        let stride = cl_addr as i64 - self.trackers[idx].last_cl_addr as i64;
        if stride == 0 {
            return;
        }

        // Only issue on a repeated stride.
        if stride == self.trackers[idx].last_stride {
            for i in 0..self.degree {
                let pf_cl = cl_addr as i64 + stride * (i as i64 + 1);
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

        self.trackers[idx].last_cl_addr = cl_addr;
        self.trackers[idx].last_stride = stride;
        self.touch(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::{IpStride, Knobs};
    use crate::prefetch::{Descriptor, IssueBuffer, Prefetcher};
    use crate::packet::AccessKind;

    fn desc(ip: u64, addr: u64) -> Descriptor {
        Descriptor {
            hit: false,
            offchip_pred: false,
            kind: AccessKind::Load,
            cpu: 0,
            addr,
            v_addr: addr,
            ip,
            size: 8,
            cycle: 0,
            mshr_size: 8,
            mshr_occupancy: 0,
            pq_size: 8,
            pq_occupancy: 0,
        }
    }

    #[test]
    fn needs_two_identical_strides() {
        let mut pf = IpStride::new(Knobs::default());
        let mut issue = IssueBuffer::default();

        pf.operate(&desc(0x400, 0x10000), &mut issue);
        pf.operate(&desc(0x400, 0x10040), &mut issue);
        assert!(issue.requests.is_empty());

        pf.operate(&desc(0x400, 0x10080), &mut issue);
        assert_eq!(issue.requests.len(), 2);
        assert_eq!(issue.requests[0].pf_addr, 0x100C0);
        assert_eq!(issue.requests[1].pf_addr, 0x10100);
    }

    #[test]
    fn never_crosses_the_page() {
        let mut pf = IpStride::new(Knobs::default());
        let mut issue = IssueBuffer::default();

        pf.operate(&desc(0x400, 0x10F40), &mut issue);
        pf.operate(&desc(0x400, 0x10F80), &mut issue);
        pf.operate(&desc(0x400, 0x10FC0), &mut issue);
        // next line would land in the next page
        assert!(issue.requests.is_empty());
    }
}
