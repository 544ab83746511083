//! Schedules and small numeric helpers shared by the trainers

use serde::{Deserialize, Serialize};

/// Trait for step-indexed schedules (learning rate, epsilon)
pub trait Schedule: Send + Sync {
    /// Get value at step t
    fn value(&self, t: usize) -> f64;
}

/// Linear schedule that moves from start to end over `steps`, then holds `end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSchedule {
    /// Starting value
    pub start: f64,
    /// Ending value
    pub end: f64,
    /// Number of steps for decay
    pub steps: usize,
}

impl LinearSchedule {
    /// Create a new linear schedule
    #[must_use]
    pub fn new(start: f64, end: f64, steps: usize) -> Self {
        Self { start, end, steps }
    }
}

impl Schedule for LinearSchedule {
    fn value(&self, t: usize) -> f64 {
        if t >= self.steps {
            self.end
        } else {
            let progress = t as f64 / self.steps as f64;
            self.start + (self.end - self.start) * progress
        }
    }
}

/// Polyak averaging for a single target weight
#[must_use]
pub fn polyak_update(target_weight: f32, source_weight: f32, tau: f32) -> f32 {
    tau * source_weight + (1.0 - tau) * target_weight
}

/// Index of the largest value, first one on ties
#[must_use]
pub fn argmax<'a, I>(values: I) -> usize
where
    I: IntoIterator<Item = &'a f32>,
{
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &v) in values.into_iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_schedule() {
        let schedule = LinearSchedule::new(5e-4, 0.0, 1000);
        assert_relative_eq!(schedule.value(0), 5e-4);
        assert_relative_eq!(schedule.value(250), 3.75e-4);
        assert_relative_eq!(schedule.value(1000), 0.0);
        assert_relative_eq!(schedule.value(5000), 0.0);
    }

    #[test]
    fn test_polyak_update() {
        assert_relative_eq!(polyak_update(0.0, 1.0, 0.25), 0.25);
        assert_relative_eq!(polyak_update(2.0, 2.0, 0.7), 2.0);
    }

    #[test]
    fn test_argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.5, 0.5, -1.0]), 1);
        assert_eq!(argmax(&[-3.0]), 0);
    }
}
