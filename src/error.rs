//! Error Types
//!
//! Two layers of errors:
//!
//! - [`ConfigError`]: the run is misconfigured. Raised while validating a
//!   [`TrainingConfig`](crate::config::TrainingConfig) or building a component,
//!   always before any device work starts.
//! - [`TrainError`]: everything that can stop a running job (I/O, malformed
//!   checkpoints, non-finite losses), plus configuration errors bubbled up.

use std::fmt;
use std::io;

/// A fatal configuration problem detected before training begins
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Context length cannot fit `start + delimiter + classify`
    ContextTooSmall { n_ctx: usize },
    /// Global batch does not split evenly across devices
    IndivisibleBatch { batch: usize, n_device: usize },
    /// Embedding width is not a multiple of the head count
    HeadsDontDivide { n_embd: usize, n_head: usize },
    UnknownActivation(String),
    UnknownOptimizer(String),
    UnknownSchedule(String),
    /// Dropout probability outside `[0, 1)`
    InvalidDropout { name: &'static str, rate: f32 },
    /// A size that must be positive was zero
    Zero(&'static str),
    /// A split produced no usable examples
    EmptyDataset(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ContextTooSmall { n_ctx } => write!(
                f,
                "context length {} is too small, need at least 3 slots for start/delimiter/classify",
                n_ctx
            ),
            ConfigError::IndivisibleBatch { batch, n_device } => write!(
                f,
                "batch of {} examples cannot be split evenly across {} devices",
                batch, n_device
            ),
            ConfigError::HeadsDontDivide { n_embd, n_head } => write!(
                f,
                "n_embd ({}) must be divisible by n_head ({})",
                n_embd, n_head
            ),
            ConfigError::UnknownActivation(name) => {
                write!(f, "unknown activation '{}' (expected relu, gelu or swish)", name)
            }
            ConfigError::UnknownOptimizer(name) => {
                write!(f, "unknown optimizer '{}' (expected adam)", name)
            }
            ConfigError::UnknownSchedule(name) => write!(
                f,
                "unknown lr schedule '{}' (expected warmup_cosine, warmup_linear or warmup_constant)",
                name
            ),
            ConfigError::InvalidDropout { name, rate } => {
                write!(f, "{} must be in [0, 1), got {}", name, rate)
            }
            ConfigError::Zero(name) => write!(f, "{} must be at least 1", name),
            ConfigError::EmptyDataset(split) => write!(f, "{} split has no usable examples", split),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors surfaced by training, evaluation, and persistence
#[derive(Debug)]
pub enum TrainError {
    Config(ConfigError),
    Io(io::Error),
    Json(serde_json::Error),
    /// Checkpoint file is malformed or does not match the model
    Checkpoint(String),
    /// Input data could not be interpreted
    Data(String),
    /// Combined loss became NaN or infinite
    NonFiniteLoss { update: usize, loss: f32 },
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Config(e) => write!(f, "configuration error: {}", e),
            TrainError::Io(e) => write!(f, "I/O error: {}", e),
            TrainError::Json(e) => write!(f, "JSON error: {}", e),
            TrainError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
            TrainError::Data(msg) => write!(f, "data error: {}", msg),
            TrainError::NonFiniteLoss { update, loss } => {
                write!(f, "loss became non-finite ({}) at update {}", loss, update)
            }
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainError::Config(e) => Some(e),
            TrainError::Io(e) => Some(e),
            TrainError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for TrainError {
    fn from(e: ConfigError) -> Self {
        TrainError::Config(e)
    }
}

impl From<io::Error> for TrainError {
    fn from(e: io::Error) -> Self {
        TrainError::Io(e)
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(e: serde_json::Error) -> Self {
        TrainError::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: TrainError = ConfigError::ContextTooSmall { n_ctx: 2 }.into();
        assert!(matches!(err, TrainError::Config(ConfigError::ContextTooSmall { n_ctx: 2 })));
        assert!(err.to_string().contains("context length 2"));
    }

    #[test]
    fn test_io_error_has_source() {
        let err: TrainError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
