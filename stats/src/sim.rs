use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    pub cycles: u64,
    pub instructions: u64,
    pub loads_issued: u64,
    pub stores_issued: u64,
    pub elapsed_millis: u128,
    pub is_release_build: bool,
}

impl Sim {
    #[must_use]
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.instructions as f64 / self.cycles as f64
    }
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.instructions += other.instructions;
        self.loads_issued += other.loads_issued;
        self.stores_issued += other.stores_issued;
        self.elapsed_millis += other.elapsed_millis;
    }
}
