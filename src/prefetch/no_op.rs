use super::{Descriptor, IssueBuffer, Prefetcher};

/// Baseline: never prefetches.
pub struct NoOp;

impl Prefetcher for NoOp {
    fn name(&self) -> &'static str {
        "no"
    }

    fn operate(&mut self, _desc: &Descriptor, _issue: &mut IssueBuffer) {}
}
