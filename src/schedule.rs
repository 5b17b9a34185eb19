//! Learning Rate Schedules
//!
//! Every schedule ramps linearly from 0 to 1 over the warmup fraction, then
//! follows its decay shape over the remaining steps:
//!
//! ```text
//! x = step / total_steps          w = warmup fraction
//!
//! x < w:   x / w
//! x ≥ w:   q = (x - w) / (1 - w)
//!          cosine:   0.5 × (1 + cos(π q))    1 → 0
//!          linear:   1 - q                   1 → 0
//!          constant: 1
//! ```
//!
//! The multiplier scales the base learning rate:
//! `lr_t = lr × schedule.multiplier(t / total, warmup)`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Learning-rate curve selected by name in the run configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[serde(alias = "cosine")]
    WarmupCosine,
    #[serde(alias = "linear")]
    WarmupLinear,
    #[serde(alias = "constant")]
    WarmupConstant,
}

impl FromStr for LrSchedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warmup_cosine" | "cosine" => Ok(LrSchedule::WarmupCosine),
            "warmup_linear" | "linear" => Ok(LrSchedule::WarmupLinear),
            "warmup_constant" | "constant" => Ok(LrSchedule::WarmupConstant),
            _ => Err(ConfigError::UnknownSchedule(s.to_string())),
        }
    }
}

impl fmt::Display for LrSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LrSchedule::WarmupCosine => "warmup_cosine",
            LrSchedule::WarmupLinear => "warmup_linear",
            LrSchedule::WarmupConstant => "warmup_constant",
        };
        f.write_str(name)
    }
}

impl LrSchedule {
    /// Multiplier at training progress `x ∈ [0, 1]`
    ///
    /// # Arguments
    ///
    /// * `x` - Fraction of total updates completed
    /// * `warmup` - Fraction of total updates spent ramping up
    pub fn multiplier(self, x: f32, warmup: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        if x < warmup {
            return x / warmup;
        }
        if warmup >= 1.0 {
            return 1.0;
        }

        let progress = (x - warmup) / (1.0 - warmup);
        match self {
            LrSchedule::WarmupCosine => 0.5 * (1.0 + (std::f32::consts::PI * progress).cos()),
            LrSchedule::WarmupLinear => 1.0 - progress,
            LrSchedule::WarmupConstant => 1.0,
        }
    }

    /// Learning rate for the 0-based update index `step`
    pub fn learning_rate(self, base_lr: f32, step: usize, total_steps: usize, warmup: f32) -> f32 {
        let x = step as f32 / total_steps.max(1) as f32;
        base_lr * self.multiplier(x, warmup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LrSchedule; 3] = [
        LrSchedule::WarmupCosine,
        LrSchedule::WarmupLinear,
        LrSchedule::WarmupConstant,
    ];

    #[test]
    fn test_boundaries() {
        let total = 1000;
        let warmup = 0.1;
        for schedule in ALL {
            assert_eq!(schedule.learning_rate(1.0, 0, total, warmup), 0.0);
            assert!((schedule.learning_rate(1.0, 100, total, warmup) - 1.0).abs() < 1e-6);
        }
        assert!(LrSchedule::WarmupCosine.learning_rate(1.0, total, total, warmup).abs() < 1e-6);
        assert!(LrSchedule::WarmupLinear.learning_rate(1.0, total, total, warmup).abs() < 1e-6);
        assert_eq!(LrSchedule::WarmupConstant.learning_rate(1.0, total, total, warmup), 1.0);
    }

    #[test]
    fn test_warmup_is_linear_ramp() {
        for schedule in ALL {
            assert!((schedule.multiplier(0.05, 0.1) - 0.5).abs() < 1e-6);
            assert!((schedule.multiplier(0.025, 0.1) - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_decay_is_monotone() {
        for schedule in [LrSchedule::WarmupCosine, LrSchedule::WarmupLinear] {
            let mut prev = f32::INFINITY;
            for step in (2..=100).map(|i| i as f32 / 100.0) {
                let m = schedule.multiplier(step, 0.02);
                assert!(m <= prev + 1e-6);
                prev = m;
            }
        }
        assert!((LrSchedule::WarmupCosine.multiplier(0.55, 0.1) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_warmup_starts_at_full_rate() {
        for schedule in ALL {
            assert_eq!(schedule.multiplier(0.0, 0.0), 1.0);
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("cosine".parse::<LrSchedule>(), Ok(LrSchedule::WarmupCosine));
        assert_eq!("warmup_linear".parse::<LrSchedule>(), Ok(LrSchedule::WarmupLinear));
        assert!(matches!(
            "step".parse::<LrSchedule>(),
            Err(ConfigError::UnknownSchedule(_))
        ));
    }
}
