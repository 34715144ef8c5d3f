use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Confusion counters of a binary off-chip predictor.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffchipPrediction {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl OffchipPrediction {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, true) => self.false_negatives += 1,
            (false, false) => self.true_negatives += 1,
        }
    }

    #[must_use]
    pub fn accuracy(&self) -> f64 {
        let correct = self.true_positives + self.true_negatives;
        let total = correct + self.false_positives + self.false_negatives;
        if total == 0 {
            return 0.0;
        }
        correct as f64 / total as f64
    }
}

impl std::ops::AddAssign for OffchipPrediction {
    fn add_assign(&mut self, other: Self) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.true_negatives += other.true_negatives;
        self.false_negatives += other.false_negatives;
    }
}

/// Two-level load-miss predictor counters.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lmp {
    pub accurate: u64,
    pub inaccurate: u64,
}

impl std::ops::AddAssign for Lmp {
    fn add_assign(&mut self, other: Self) {
        self.accurate += other.accurate;
        self.inaccurate += other.inaccurate;
    }
}

/// Routing-engine counters: sniffs and prediction quality per route plus
/// the prediction-change matrix.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub accurate: u64,
    pub inaccurate: u64,
    pub sniffs: IndexMap<String, u64>,
    pub accurate_per_route: IndexMap<String, (u64, u64)>,
    pub optimal_per_route: IndexMap<String, u64>,
    pub prediction_changes: IndexMap<(String, String), u64>,
}

impl Routing {
    pub fn clear(&mut self) {
        self.accurate = 0;
        self.inaccurate = 0;
        for count in self.sniffs.values_mut() {
            *count = 0;
        }
        for counts in self.accurate_per_route.values_mut() {
            *counts = (0, 0);
        }
        for count in self.optimal_per_route.values_mut() {
            *count = 0;
        }
        for count in self.prediction_changes.values_mut() {
            *count = 0;
        }
    }
}

impl std::fmt::Debug for Routing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routing")
            .field("accurate", &self.accurate)
            .field("inaccurate", &self.inaccurate)
            .field("sniffs", &self.sniffs)
            .field("optimal_per_route", &self.optimal_per_route)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::OffchipPrediction;

    #[test]
    fn confusion_accounting() {
        let mut stats = OffchipPrediction::default();
        stats.record(true, true);
        stats.record(true, false);
        stats.record(false, false);
        stats.record(false, false);
        assert_eq!(stats.true_positives, 1);
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.true_negatives, 2);
        assert!((stats.accuracy() - 0.75).abs() < 1e-9);
    }
}
