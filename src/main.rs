//! Command-line entry point
//!
//! ```bash
//! # Build the character vocabulary from the training split
//! cargo run --release -- vocab --data-dir baike_qa2019
//!
//! # Train with defaults, overriding a few settings
//! cargo run --release -- train --n-device 4 --n-iter 3 --lr 6.25e-5
//!
//! # Start from a saved configuration
//! cargo run --release -- train --config runs/small.json --desc small
//!
//! # Predict the test split with the best checkpoint
//! cargo run --release -- predict --desc small
//! ```
//!
//! Set `RUST_LOG=baike_gpt=debug` to see per-update losses.

use anyhow::{Context, Result};
use baike_gpt::corpus::{BaikeQaCorpus, Split};
use baike_gpt::layers::Activation;
use baike_gpt::optimizer::OptimizerKind;
use baike_gpt::{trainer, CharTokenizer, LrSchedule, Tokenizer, TrainingConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::Directive;

#[derive(Parser)]
#[command(
    name = "baike-gpt",
    about = "Train a transformer on language modeling and QA pair matching"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the character vocabulary from the training split
    Vocab(RunArgs),
    /// Train the model, evaluating and checkpointing along the way
    Train(RunArgs),
    /// Write test-split predictions from the best checkpoint
    Predict(RunArgs),
}

/// Flags shared by every subcommand; each one overrides the loaded config
#[derive(Args)]
struct RunArgs {
    /// JSON file with a serialized TrainingConfig
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run name used for logs, checkpoints and predictions
    #[arg(long)]
    desc: Option<String>,
    #[arg(long)]
    seed: Option<u64>,

    // Data and output locations
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Vocabulary JSON file
    #[arg(long)]
    encoder_path: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    save_dir: Option<PathBuf>,
    #[arg(long)]
    submission_dir: Option<PathBuf>,
    /// Keep this many most frequent characters (vocab subcommand)
    #[arg(long)]
    vocab_size: Option<usize>,

    // Training
    /// Number of epochs
    #[arg(long)]
    n_iter: Option<usize>,
    /// Examples per device per update
    #[arg(long)]
    n_batch: Option<usize>,
    /// Number of data-parallel replicas
    #[arg(long)]
    n_device: Option<usize>,
    /// Optimizer name (adam)
    #[arg(long)]
    opt: Option<OptimizerKind>,
    #[arg(long)]
    lr: Option<f32>,
    /// Fraction of updates spent warming up
    #[arg(long)]
    lr_warmup: Option<f32>,
    /// warmup_cosine, warmup_linear or warmup_constant
    #[arg(long)]
    lr_schedule: Option<LrSchedule>,
    #[arg(long)]
    l2: Option<f32>,
    /// Also apply weight decay to biases and gains
    #[arg(long)]
    vector_l2: Option<bool>,
    #[arg(long)]
    max_grad_norm: Option<f32>,
    /// Adam β₁
    #[arg(long)]
    b1: Option<f32>,
    /// Adam β₂
    #[arg(long)]
    b2: Option<f32>,
    /// Adam ε
    #[arg(long)]
    e: Option<f32>,
    /// Weight of the classification loss
    #[arg(long)]
    clf_coef: Option<f32>,

    // Model
    #[arg(long)]
    n_ctx: Option<usize>,
    #[arg(long)]
    n_embd: Option<usize>,
    #[arg(long)]
    n_head: Option<usize>,
    #[arg(long)]
    n_layer: Option<usize>,
    /// relu, gelu or swish
    #[arg(long)]
    afn: Option<Activation>,
    #[arg(long)]
    embd_pdrop: Option<f32>,
    #[arg(long)]
    attn_pdrop: Option<f32>,
    #[arg(long)]
    resid_pdrop: Option<f32>,
    #[arg(long)]
    clf_pdrop: Option<f32>,
}

impl RunArgs {
    /// Load the base config (file or defaults) and apply explicit flags
    fn resolve(self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => TrainingConfig::default(),
        };

        macro_rules! apply {
            ($($field:ident).+ = $flag:expr) => {
                if let Some(value) = $flag {
                    config.$($field).+ = value;
                }
            };
        }
        apply!(desc = self.desc);
        apply!(seed = self.seed);
        apply!(data_dir = self.data_dir);
        apply!(encoder_path = self.encoder_path);
        apply!(log_dir = self.log_dir);
        apply!(save_dir = self.save_dir);
        apply!(submission_dir = self.submission_dir);
        apply!(vocab_size = self.vocab_size);
        apply!(n_iter = self.n_iter);
        apply!(n_batch = self.n_batch);
        apply!(n_device = self.n_device);
        apply!(opt = self.opt);
        apply!(lr = self.lr);
        apply!(lr_warmup = self.lr_warmup);
        apply!(lr_schedule = self.lr_schedule);
        apply!(l2 = self.l2);
        apply!(vector_l2 = self.vector_l2);
        apply!(max_grad_norm = self.max_grad_norm);
        apply!(b1 = self.b1);
        apply!(b2 = self.b2);
        apply!(e = self.e);
        apply!(clf_coef = self.clf_coef);
        apply!(model.n_ctx = self.n_ctx);
        apply!(model.n_embd = self.n_embd);
        apply!(model.n_head = self.n_head);
        apply!(model.n_layer = self.n_layer);
        apply!(model.afn = self.afn);
        apply!(model.embd_pdrop = self.embd_pdrop);
        apply!(model.attn_pdrop = self.attn_pdrop);
        apply!(model.resid_pdrop = self.resid_pdrop);
        apply!(model.clf_pdrop = self.clf_pdrop);

        Ok(config)
    }
}

fn build_vocab(config: &TrainingConfig) -> Result<()> {
    let corpus = BaikeQaCorpus::new(&config.data_dir, config.seed);
    let pairs = corpus
        .read_pairs(Split::Train)
        .with_context(|| format!("failed to read {}", corpus.path(Split::Train).display()))?;
    let tokenizer = CharTokenizer::build(
        pairs.iter().flat_map(|(q, a)| [q.as_str(), a.as_str()]),
        config.vocab_size,
    );
    tokenizer
        .save(&config.encoder_path)
        .with_context(|| format!("failed to write {}", config.encoder_path.display()))?;
    tracing::info!(
        path = %config.encoder_path.display(),
        characters = tokenizer.len(),
        vocab_size = tokenizer.vocab_size(),
        "saved vocabulary"
    );
    Ok(())
}

fn main() -> Result<()> {
    let directive: Directive = "baike_gpt=info".parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Vocab(args) => build_vocab(&args.resolve()?),
        Command::Train(args) => {
            let config = args.resolve()?;
            let summary = trainer::train(&config).context("training failed")?;
            tracing::info!(
                n_updates = summary.state.n_updates,
                n_epochs = summary.state.n_epochs,
                best_va_ppl = summary.state.best_score,
                "training complete"
            );
            if let Some(path) = summary.best_checkpoint {
                tracing::info!(path = %path.display(), "best checkpoint");
            }
            Ok(())
        }
        Command::Predict(args) => {
            let config = args.resolve()?;
            trainer::predict_test_split(&config).context("prediction failed")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: &[&str]) -> TrainingConfig {
        let cli = Cli::try_parse_from(args.iter().copied()).unwrap();
        match cli.command {
            Command::Train(args) | Command::Vocab(args) | Command::Predict(args) => args.resolve().unwrap(),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = resolve(&[
            "baike-gpt", "train", "--opt", "adam", "--b1", "0.8", "--b2", "0.99", "--e", "1e-6",
            "--vector-l2", "true", "--embd-pdrop", "0.2", "--attn-pdrop", "0.3",
            "--resid-pdrop", "0.0", "--clf-pdrop", "0.5", "--afn", "relu",
        ]);
        assert_eq!(config.opt, OptimizerKind::Adam);
        assert_eq!(config.b1, 0.8);
        assert_eq!(config.b2, 0.99);
        assert_eq!(config.e, 1e-6);
        assert!(config.vector_l2);
        assert_eq!(config.model.embd_pdrop, 0.2);
        assert_eq!(config.model.attn_pdrop, 0.3);
        assert_eq!(config.model.resid_pdrop, 0.0);
        assert_eq!(config.model.clf_pdrop, 0.5);
        assert_eq!(config.model.afn, Activation::Relu);
    }

    #[test]
    fn test_absent_flags_keep_defaults() {
        let config = resolve(&["baike-gpt", "predict"]);
        assert_eq!(config, TrainingConfig::default());
    }

    #[test]
    fn test_unknown_optimizer_is_rejected() {
        assert!(Cli::try_parse_from(["baike-gpt", "train", "--opt", "sgd"]).is_err());
    }
}
