//! baike-gpt: Dual-Objective Transformer for QA Pair Matching
//!
//! A GPT-style transformer trained jointly on next-token prediction and a
//! pairwise classifier that picks which of two candidate answers belongs to
//! a question. Everything is implemented from scratch on a small tensor
//! type with hand-derived backward passes.
//!
//! # Modules
//!
//! - [`tensor`] - Dense `f32` tensors with parallel matmul
//! - [`layers`] - Attention, MLP, layer norm, dropout and the transformer block
//! - [`encoder`] - Packs (question, answer, answer) triples into model input
//! - [`model`] - The dual-head model: forward, loss and backward
//! - [`parallel`] - Synchronous data-parallel training across devices
//! - [`optimizer`], [`schedule`], [`gradients`] - Adam, learning-rate schedules, clipping
//! - [`trainer`] - Training loop, evaluation, best-model tracking
//! - [`checkpoint`], [`training_logger`] - Persistence and result logs
//! - [`corpus`], [`tokenizer`] - The Baike QA reader and character vocabulary
//!
//! # Example
//!
//! ```rust
//! use baike_gpt::{BatchEncoder, DualHeadModel, ModelConfig};
//!
//! let config = ModelConfig::tiny(20);
//! let model = DualHeadModel::new(&config, 42);
//! let encoder = BatchEncoder::from_config(&config).unwrap();
//!
//! let batch = encoder.encode(&[vec![1, 2, 3]], &[vec![4, 5]], &[vec![6]]);
//! let (output, _) = model.forward(&batch, None);
//! assert_eq!(output.clf_logits.shape, vec![1, 2]);
//! assert_eq!(output.lm_losses.len(), 2);
//! ```

pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod encoder;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod parallel;
pub mod schedule;
pub mod tensor;
pub mod tokenizer;
pub mod trainer;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
pub use config::{ModelConfig, TrainingConfig};
pub use corpus::{BaikeQaCorpus, CorpusProvider, Split, TextExample};
pub use encoder::{BatchEncoder, EncodedBatch, QaExample};
pub use error::{ConfigError, Result, TrainError};
pub use model::{DualHeadModel, ModelOutput};
pub use optimizer::{AdamOptimizer, OptimizerState};
pub use parallel::DataParallel;
pub use schedule::LrSchedule;
pub use tensor::Tensor;
pub use tokenizer::{CharTokenizer, Tokenizer};
pub use trainer::{predict, train, write_predictions, TrainSummary, Trainer, TrainerState};
pub use training_logger::{EvalRecord, ResultLogger};
