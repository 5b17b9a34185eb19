//! Run Configuration
//!
//! Two plain structs describe a run:
//!
//! - [`ModelConfig`]: the architecture. Saved inside every checkpoint so a
//!   model can be rebuilt from disk.
//! - [`TrainingConfig`]: everything else (optimizer, schedule, batch layout,
//!   paths), plus the model config. Built once, validated once, then passed
//!   by reference to every component.
//!
//! ## Parameter Count
//!
//! ```text
//! table     = (n_vocab + 3 + n_ctx) × n_embd
//! per_layer ≈ 12 × n_embd²
//! total     ≈ table + n_layer × per_layer + n_embd + 1
//! ```
//!
//! ## Example
//!
//! ```rust
//! use baike_gpt::config::{ModelConfig, TrainingConfig};
//!
//! let mut config = TrainingConfig::default();
//! config.model = ModelConfig::tiny(100);
//! config.n_device = 2;
//! config.validate().unwrap();
//! assert_eq!(config.global_batch(), 16);
//! ```

use crate::error::{ConfigError, Result};
use crate::layers::{Activation, BlockConfig};
use crate::optimizer::OptimizerKind;
use crate::schedule::LrSchedule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of special tokens appended after the vocabulary
pub const N_SPECIAL: usize = 3;

/// Transformer architecture
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Vocabulary size excluding special tokens (set from the tokenizer)
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub afn: Activation,
    pub embd_pdrop: f32,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
    pub clf_pdrop: f32,
    /// Longest context or candidate kept when packing; `n_ctx / 2 - 2` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_vocab: 0,
            n_ctx: 64,
            n_embd: 128,
            n_head: 2,
            n_layer: 2,
            afn: Activation::Gelu,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
            clf_pdrop: 0.1,
            max_len: None,
        }
    }
}

impl ModelConfig {
    /// A very small model with dropout disabled, for quick experiments and tests
    pub fn tiny(n_vocab: usize) -> Self {
        Self {
            n_vocab,
            n_ctx: 8,
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            afn: Activation::Gelu,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            resid_pdrop: 0.0,
            clf_pdrop: 0.0,
            max_len: None,
        }
    }

    /// Id of the `start` token
    pub fn start_token(&self) -> usize {
        self.n_vocab
    }

    /// Id of the `delimiter` token
    pub fn delimiter_token(&self) -> usize {
        self.n_vocab + 1
    }

    /// Id of the `classify` token
    pub fn classify_token(&self) -> usize {
        self.n_vocab + 2
    }

    /// Rows in the shared embedding table: vocabulary, specials, positions
    pub fn table_size(&self) -> usize {
        self.n_vocab + N_SPECIAL + self.n_ctx
    }

    /// Truncation limit for each context and candidate
    pub fn truncation_len(&self) -> usize {
        self.max_len.unwrap_or((self.n_ctx / 2).saturating_sub(2))
    }

    /// Shrink `n_ctx` to the longest packed row
    ///
    /// `lengths` yields `(context, longest candidate)` token counts. Both are
    /// truncated with the current limit, which is then pinned in `max_len`
    /// so rows pack the same way in the smaller context. Never grows `n_ctx`.
    pub fn fit_context(&mut self, lengths: impl IntoIterator<Item = (usize, usize)>) {
        let limit = self.truncation_len();
        let longest = lengths
            .into_iter()
            .map(|(context, candidate)| context.min(limit) + candidate.min(limit))
            .max()
            .unwrap_or(0);
        let fitted = (longest + N_SPECIAL).min(self.n_ctx);
        if fitted < self.n_ctx {
            self.max_len = Some(limit);
            self.n_ctx = fitted;
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn block_config(&self) -> BlockConfig {
        BlockConfig {
            n_embd: self.n_embd,
            n_head: self.n_head,
            activation: self.afn,
            attn_pdrop: self.attn_pdrop,
            resid_pdrop: self.resid_pdrop,
        }
    }

    /// Approximate number of trainable parameters
    pub fn num_parameters(&self) -> usize {
        let d = self.n_embd;
        let per_layer = d * 3 * d + 3 * d + d * d + d + 2 * d + d * 4 * d + 4 * d + 4 * d * d + d + 2 * d;
        self.table_size() * d + self.n_layer * per_layer + d + 1
    }

    /// Check architecture constraints
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.n_ctx < N_SPECIAL {
            return Err(ConfigError::ContextTooSmall { n_ctx: self.n_ctx });
        }
        if self.n_head == 0 {
            return Err(ConfigError::Zero("n_head"));
        }
        if self.n_embd == 0 || self.n_embd % self.n_head != 0 {
            return Err(ConfigError::HeadsDontDivide {
                n_embd: self.n_embd,
                n_head: self.n_head,
            });
        }
        if self.n_layer == 0 {
            return Err(ConfigError::Zero("n_layer"));
        }
        for (name, rate) in [
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
            ("resid_pdrop", self.resid_pdrop),
            ("clf_pdrop", self.clf_pdrop),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ConfigError::InvalidDropout { name, rate });
            }
        }
        Ok(())
    }
}

/// Complete, immutable description of a training run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run name used for log, checkpoint and submission file names
    pub desc: String,
    pub seed: u64,
    /// Number of epochs
    pub n_iter: usize,
    /// Examples per device per update
    pub n_batch: usize,
    /// Number of data-parallel replicas
    pub n_device: usize,

    pub opt: OptimizerKind,
    pub lr: f32,
    /// Fraction of total updates spent warming up
    pub lr_warmup: f32,
    pub lr_schedule: LrSchedule,
    pub l2: f32,
    pub vector_l2: bool,
    pub max_grad_norm: f32,
    pub b1: f32,
    pub b2: f32,
    pub e: f32,
    /// Weight of the classification loss; 0 trains the language model alone
    pub clf_coef: f32,

    /// Keep this many most frequent characters when building a vocabulary
    pub vocab_size: usize,
    pub data_dir: PathBuf,
    pub encoder_path: PathBuf,
    pub log_dir: PathBuf,
    pub save_dir: PathBuf,
    pub submission_dir: PathBuf,

    pub model: ModelConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            desc: "gpt-baike-qa".to_string(),
            seed: 42,
            n_iter: 1,
            n_batch: 8,
            n_device: 4,
            opt: OptimizerKind::Adam,
            lr: 6.25e-5,
            lr_warmup: 0.002,
            lr_schedule: LrSchedule::WarmupLinear,
            l2: 0.01,
            vector_l2: false,
            max_grad_norm: 1.0,
            b1: 0.9,
            b2: 0.999,
            e: 1e-8,
            clf_coef: 0.5,
            vocab_size: 50_000,
            data_dir: PathBuf::from("baike_qa2019"),
            encoder_path: PathBuf::from("baike_qa2019/vocab.json"),
            log_dir: PathBuf::from("log"),
            save_dir: PathBuf::from("save"),
            submission_dir: PathBuf::from("submission"),
            model: ModelConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Examples consumed by one optimizer update across all devices
    pub fn global_batch(&self) -> usize {
        self.n_batch * self.n_device
    }

    /// Full global batches in one epoch (the tail is dropped)
    pub fn updates_per_epoch(&self, n_train: usize) -> usize {
        n_train / self.global_batch().max(1)
    }

    /// Total optimizer updates, fixed before training starts
    pub fn total_updates(&self, n_train: usize) -> usize {
        self.updates_per_epoch(n_train) * self.n_iter
    }

    /// Updates between periodic evaluations: a tenth of an epoch, at least 1
    pub fn eval_interval(&self, n_train: usize) -> usize {
        (self.updates_per_epoch(n_train) / 10).max(1)
    }

    /// Check the whole configuration before any work starts
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.model.validate()?;
        if self.n_device == 0 {
            return Err(ConfigError::Zero("n_device"));
        }
        if self.n_batch == 0 {
            return Err(ConfigError::Zero("n_batch"));
        }
        if self.n_iter == 0 {
            return Err(ConfigError::Zero("n_iter"));
        }
        Ok(())
    }

    /// Path of the JSON Lines result log for this run
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", self.desc))
    }

    /// Path of the prediction file for this run
    pub fn submission_path(&self) -> PathBuf {
        self.submission_dir.join(format!("{}.tsv", self.desc))
    }
}
