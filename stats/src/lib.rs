pub mod cache;
pub mod pred;
pub mod sim;

pub use cache::Cache;
pub use pred::{Lmp, OffchipPrediction, Routing};
pub use sim::Sim;

use serde::{Deserialize, Serialize};

/// All statistics of one simulated core, reset at the warmup boundary.
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerCore {
    pub sim: Sim,
    pub l1i: Cache,
    pub l1d: Cache,
    pub l2c: Cache,
    pub sdc: Cache,
    pub offchip_demand: OffchipPrediction,
    pub offchip_prefetch: OffchipPrediction,
    pub lmp: Lmp,
    pub routing: Routing,
    pub minor_faults: u64,
    pub major_faults: u64,
}

impl PerCore {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl std::ops::AddAssign for PerCore {
    fn add_assign(&mut self, other: Self) {
        self.sim += other.sim;
        self.l1i += other.l1i;
        self.l1d += other.l1d;
        self.l2c += other.l2c;
        self.sdc += other.sdc;
        self.offchip_demand += other.offchip_demand;
        self.offchip_prefetch += other.offchip_prefetch;
        self.lmp += other.lmp;
        self.minor_faults += other.minor_faults;
        self.major_faults += other.major_faults;
    }
}
