//! Capability samples and the weighted host-fitness score

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::SPEC_DATA;

pub const CPU_WEIGHT: f64 = 0.4;
pub const MEMORY_WEIGHT: f64 = 0.3;
pub const GPU_WEIGHT: f64 = 0.2;
pub const BATTERY_WEIGHT: f64 = 0.1;

/// One snapshot of local machine capability, every field in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySample {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
    pub battery: f64,
}

impl CapabilitySample {
    /// Build a sample, clamping every field into [0, 1]
    pub fn new(cpu: f64, memory: f64, gpu: f64, battery: f64) -> Self {
        Self {
            cpu: clamp_unit(cpu),
            memory: clamp_unit(memory),
            gpu: clamp_unit(gpu),
            battery: clamp_unit(battery),
        }
    }

    /// Weighted host-fitness score
    pub fn score(&self) -> f64 {
        CPU_WEIGHT * self.cpu
            + MEMORY_WEIGHT * self.memory
            + GPU_WEIGHT * self.gpu
            + BATTERY_WEIGHT * self.battery
    }

    /// Validate a sample received from a peer
    ///
    /// Non-finite values are rejected; finite values outside [0, 1]
    /// are clamped.
    pub fn validated(self) -> Result<Self> {
        let fields = [self.cpu, self.memory, self.gpu, self.battery];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(Error::malformed(SPEC_DATA, "non-finite capability value"));
        }
        Ok(Self::new(self.cpu, self.memory, self.gpu, self.battery))
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_weights_sum_to_one() {
        let sum = CPU_WEIGHT + MEMORY_WEIGHT + GPU_WEIGHT + BATTERY_WEIGHT;
        assert!((sum - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_full_and_empty_scores() {
        assert!((CapabilitySample::new(1.0, 1.0, 1.0, 1.0).score() - 1.0).abs() < EPSILON);
        assert_eq!(CapabilitySample::new(0.0, 0.0, 0.0, 0.0).score(), 0.0);
    }

    #[test]
    fn test_score_uses_fixed_weights() {
        let sample = CapabilitySample::new(0.5, 0.25, 1.0, 0.0);
        let expected = 0.4 * 0.5 + 0.3 * 0.25 + 0.2 * 1.0;
        assert!((sample.score() - expected).abs() < EPSILON);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let sample = CapabilitySample {
            cpu: 3.0,
            memory: -1.0,
            gpu: 0.5,
            battery: 1.5,
        }
        .validated()
        .unwrap();

        assert_eq!(sample, CapabilitySample::new(1.0, 0.0, 0.5, 1.0));
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let sample = CapabilitySample {
            cpu: f64::INFINITY,
            memory: 0.5,
            gpu: 0.5,
            battery: 0.5,
        };
        assert!(matches!(
            sample.validated(),
            Err(Error::MalformedMessage { .. })
        ));
    }
}
