use gradeline_types::{CheckResult, Task};

/// Reduces a submission's results to one score and decides eligibility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatePolicy {
    /// Minimum aggregate (inclusive) needed to advance.
    pub threshold: f64,
}

impl Default for AggregatePolicy {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl AggregatePolicy {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Weighted mean of scored results, weights taken from the task's check
    /// entries. Skipped checks do not count. No scored results gives 0.0.
    pub fn aggregate(&self, task: &Task, results: &[CheckResult]) -> f64 {
        let (weighted, total) = results
            .iter()
            .filter(|r| r.is_scored())
            .fold((0.0, 0.0), |(weighted, total), r| {
                let weight = task
                    .checks
                    .get(r.check_index)
                    .map(|c| c.weight)
                    .unwrap_or(1.0);
                (weighted + weight * r.score, total + weight)
            });
        if total <= 0.0 { 0.0 } else { weighted / total }
    }

    pub fn is_eligible(&self, aggregate: f64) -> bool {
        aggregate >= self.threshold
    }
}
