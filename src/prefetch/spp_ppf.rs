use super::{Descriptor, FillEvent, IssueBuffer, Prefetcher, Request};
use crate::hash::{folded_xor, jenkins};
use crate::packet::FillLevel;
use crate::{BLOCK_SIZE, LOG2_BLOCK_SIZE, PAGE_SIZE};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Knobs {
    pub spp: super::spp::Knobs,
    pub perc_entries: usize,
    pub perc_threshold_hi: i32,
    pub perc_threshold_lo: i32,
    pub counter_max: i32,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            spp: super::spp::Knobs::default(),
            perc_entries: 4096,
            perc_threshold_hi: 75,
            perc_threshold_lo: -15,
            counter_max: 15,
        }
    }
}

/// Features the perceptron filter sums over for one prefetch proposal.
#[derive(Debug, Clone, Copy)]
struct Features {
    ip: u64,
    ip_xor_delta: u64,
    page_offset: u64,
    signature: u64,
    confidence: u64,
}

impl Features {
    fn new(ip: u64, delta: i32, addr: u64, signature: u32, confidence: u32) -> Self {
        let page_offset = (addr >> LOG2_BLOCK_SIZE) & (PAGE_SIZE / BLOCK_SIZE - 1);
        Self {
            ip,
            ip_xor_delta: ip ^ (delta.unsigned_abs() as u64),
            page_offset,
            signature: u64::from(signature),
            confidence: u64::from(confidence / 10),
        }
    }

    fn each(self) -> [u64; 5] {
        [
            self.ip,
            self.ip_xor_delta,
            self.page_offset,
            self.signature,
            self.confidence,
        ]
    }
}

/// Saturating weight tables of the perceptron prefetch filter.
struct Perceptron {
    weights: Vec<Vec<i32>>,
    counter_max: i32,
}

impl Perceptron {
    fn new(features: usize, entries: usize, counter_max: i32) -> Self {
        Self {
            weights: vec![vec![0; entries]; features],
            counter_max,
        }
    }

    fn index(&self, value: u64) -> usize {
        jenkins(u64::from(folded_xor(value, 2))) as usize % self.weights[0].len()
    }

    fn sum(&self, features: Features) -> i32 {
        features
            .each()
            .iter()
            .enumerate()
            .map(|(i, &value)| self.weights[i][self.index(value)])
            .sum()
    }

    fn train(&mut self, features: Features, useful: bool) {
        for (i, value) in features.each().into_iter().enumerate() {
            let idx = self.index(value);
            let weight = &mut self.weights[i][idx];
            *weight = if useful {
                (*weight + 1).min(self.counter_max)
            } else {
                (*weight - 1).max(-self.counter_max - 1)
            };
        }
    }
}

/// Proposal remembered until its block fills or gets evicted, at which
/// point the perceptron trains on whether issuing it was right.
#[derive(Debug, Clone, Copy)]
struct PendingTrain {
    block_addr: u64,
    features: Features,
    issued: bool,
}

/// SPP with a Perceptron Prefetch Filter: SPP proposes, the perceptron
/// decides between L2 fill, LLC fill, and suppression.
pub struct SppPpf {
    knobs: Knobs,
    inner: super::spp::Spp,
    perceptron: Perceptron,
    pending: Vec<PendingTrain>,
}

impl SppPpf {
    #[must_use]
    pub fn new(knobs: Knobs) -> Self {
        Self {
            inner: super::spp::Spp::new(knobs.spp.clone()),
            perceptron: Perceptron::new(5, knobs.perc_entries.max(1), knobs.counter_max),
            pending: Vec::new(),
            knobs,
        }
    }

    fn remember(&mut self, block_addr: u64, features: Features, issued: bool) {
        if self.pending.len() >= 1024 {
            self.pending.remove(0);
        }
        self.pending.push(PendingTrain {
            block_addr,
            features,
            issued,
        });
    }
}

impl Prefetcher for SppPpf {
    fn name(&self) -> &'static str {
        "spp_ppf"
    }

    fn operate(&mut self, desc: &Descriptor, issue: &mut IssueBuffer) {
        // A demand touching a remembered suppressed block means the filter
        // was wrong; one touching an issued block confirms it.
        let block = desc.addr & !(BLOCK_SIZE - 1);
        if let Some(at) = self.pending.iter().position(|p| p.block_addr == block) {
            let pending = self.pending.remove(at);
            self.perceptron.train(pending.features, true);
            let _ = pending.issued;
        }

        let mut proposals = IssueBuffer::default();
        self.inner.operate(desc, &mut proposals);

        for request in proposals.requests {
            let delta =
                ((request.pf_addr >> LOG2_BLOCK_SIZE) as i64 - (request.base_addr >> LOG2_BLOCK_SIZE) as i64) as i32;
            let confidence = if request.fill_level == FillLevel::L2 { 100 } else { 50 };
            let features = Features::new(desc.ip, delta, request.pf_addr, 0, confidence);
            let sum = self.perceptron.sum(features);

            if sum >= self.knobs.perc_threshold_hi {
                issue.push(Request {
                    fill_level: FillLevel::L2,
                    ..request
                });
                self.remember(request.pf_addr & !(BLOCK_SIZE - 1), features, true);
            } else if sum >= self.knobs.perc_threshold_lo {
                issue.push(Request {
                    fill_level: FillLevel::Llc,
                    ..request
                });
                self.remember(request.pf_addr & !(BLOCK_SIZE - 1), features, true);
            } else {
                // Suppressed; remember so a later demand can correct us.
                self.remember(request.pf_addr & !(BLOCK_SIZE - 1), features, false);
            }
        }
    }

    fn fill(&mut self, event: &FillEvent) {
        self.inner.fill(event);
        // An eviction of a still-pending issued prefetch went unused.
        if let Some(victim) = event.victim_addr {
            let block = victim & !(BLOCK_SIZE - 1);
            if let Some(at) = self.pending.iter().position(|p| p.block_addr == block) {
                let pending = self.pending.remove(at);
                if pending.issued {
                    self.perceptron.train(pending.features, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Knobs, SppPpf};
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
    fn fresh_filter_routes_proposals_to_llc() {
        // Zero weights sit between the two thresholds.
        let mut pf = SppPpf::new(Knobs::default());
        let mut issue = IssueBuffer::default();
        for i in 0..16u64 {
            pf.operate(&desc(0x40000 + i * 0x40), &mut issue);
        }
        assert!(!issue.requests.is_empty());
        assert!(issue
            .requests
            .iter()
            .all(|r| r.fill_level == crate::packet::FillLevel::Llc));
    }
}
