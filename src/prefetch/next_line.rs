use super::{Descriptor, IssueBuffer, Prefetcher, Request};
use crate::packet::{FillLevel, Level};
use crate::{BLOCK_SIZE, LOG2_BLOCK_SIZE};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Knobs {
    pub degree: u64,
}

impl Default for Knobs {
    fn default() -> Self {
        Self { degree: 1 }
    }
}

/// Prefetches the next `degree` sequential lines on every opportunity.
pub struct NextLine {
    fill_level: FillLevel,
    degree: u64,
}

impl NextLine {
    #[must_use]
    pub fn new(level: Level, knobs: Knobs) -> Self {
        let fill_level = match level {
            Level::L2C => FillLevel::L2,
            Level::Llc => FillLevel::Llc,
            _ => FillLevel::L1,
        };
        Self {
            fill_level,
            degree: knobs.degree.max(1),
        }
    }
}

impl Prefetcher for NextLine {
    fn name(&self) -> &'static str {
        "next_line"
    }

    fn operate(&mut self, desc: &Descriptor, issue: &mut IssueBuffer) {
        for i in 1..=self.degree {
            let pf_addr = ((desc.addr >> LOG2_BLOCK_SIZE) + i) << LOG2_BLOCK_SIZE;
            issue.push(Request {
                cpu: desc.cpu,
                size: BLOCK_SIZE as u32,
                ip: desc.ip,
                base_addr: desc.addr,
                pf_addr,
                fill_level: self.fill_level,
                offchip_pred: desc.offchip_pred,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Knobs, NextLine};
    use crate::prefetch::{Descriptor, IssueBuffer, Prefetcher};
    use crate::packet::{AccessKind, Level};

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
            pq_size: 8,
            pq_occupancy: 0,
        }
    }

    #[test]
    fn issues_following_lines() {
        let mut nl = NextLine::new(Level::L2C, Knobs { degree: 2 });
        let mut issue = IssueBuffer::default();
        nl.operate(&desc(0x1000), &mut issue);
        let addrs: Vec<_> = issue.requests.iter().map(|r| r.pf_addr).collect();
        assert_eq!(addrs, vec![0x1040, 0x1080]);
    }
}
