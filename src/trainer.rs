//! Training and Evaluation Loop
//!
//! ```text
//! for epoch in 0..n_iter:
//!     shuffle train (run-seeded rng)
//!     for each full global batch:            (tail dropped)
//!         encode → DataParallel::train_step → n_updates += 1
//!         every eval_interval updates:
//!             evaluate, save {desc}-{n_updates}.ckpt
//!     n_epochs += 1
//!     evaluate
//! ```
//!
//! ## Evaluation
//!
//! Each evaluation scores the first `len(valid)` training examples and the
//! whole validation set. Examples are processed in sub-batches of the global
//! batch size: full sub-batches are sharded across devices, the trailing
//! partial one runs on a single replica. Losses are weighted by sub-batch
//! size, so every example counts equally.
//!
//! ```text
//! ppl = exp(mean lm loss)
//! acc = 100 × mean(argmax(clf_logits) == label)
//! ```
//!
//! A `{desc}-best.ckpt` is written whenever validation perplexity improves,
//! and always on the first evaluation of a fresh run.
//!
//! ## Resuming
//!
//! Numbered checkpoints carry the optimizer moments. [`Trainer::resume`]
//! restores them together with the update and epoch counters and the best
//! score, so a resumed run keeps numbering upward and only replaces the best
//! checkpoint with a better one. `n_iter` then counts the additional epochs,
//! and the learning-rate schedule stretches over the old and new updates.

use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
use crate::config::TrainingConfig;
use crate::corpus::{BaikeQaCorpus, CorpusProvider, Split, TextExample};
use crate::encoder::{BatchEncoder, QaExample};
use crate::error::{ConfigError, Result, TrainError};
use crate::model::{DualHeadModel, ModelOutput};
use crate::optimizer::AdamOptimizer;
use crate::parallel::DataParallel;
use crate::tokenizer::{CharTokenizer, Tokenizer};
use crate::training_logger::{EvalRecord, ResultLogger};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Mutable progress of a run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainerState {
    pub n_updates: usize,
    pub n_epochs: usize,
    /// Lowest validation perplexity so far
    pub best_score: Option<f32>,
}

/// Aggregate metrics over one evaluated set
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalSummary {
    pub lm_loss: f32,
    pub clf_loss: f32,
    pub perplexity: f32,
    /// Percentage of examples whose argmax matches the label
    pub accuracy: f32,
}

/// What a finished run leaves behind
#[derive(Clone, Debug)]
pub struct TrainSummary {
    pub state: TrainerState,
    pub last_eval: Option<EvalRecord>,
    pub best_checkpoint: Option<PathBuf>,
}

/// Score `examples` in sub-batches of `batch_size`
///
/// Full sub-batches go through `parallel`; the trailing partial one runs on a
/// single replica.
pub fn iter_apply(
    model: &DualHeadModel,
    parallel: &DataParallel,
    encoder: &BatchEncoder,
    examples: &[QaExample],
    batch_size: usize,
) -> Result<(ModelOutput, EvalSummary)> {
    let mut parts = Vec::new();
    let mut lm_total = 0.0f64;
    let mut clf_total = 0.0f64;
    let mut correct = 0usize;

    for chunk in examples.chunks(batch_size.max(1)) {
        let (batch, labels) = encoder.encode_examples(chunk);
        let output = if chunk.len() == batch_size {
            parallel.predict(model, &batch)?
        } else {
            model.forward(&batch, None).0
        };
        let n = chunk.len() as f64;
        lm_total += output.mean_lm_loss() as f64 * n;
        clf_total += output.mean_clf_loss(&labels) as f64 * n;
        correct += output
            .predictions()
            .iter()
            .zip(&labels)
            .filter(|(p, y)| p == y)
            .count();
        parts.push(output);
    }

    let count = examples.len().max(1) as f64;
    let lm_loss = (lm_total / count) as f32;
    let summary = EvalSummary {
        lm_loss,
        clf_loss: (clf_total / count) as f32,
        perplexity: lm_loss.exp(),
        accuracy: (100.0 * correct as f64 / count) as f32,
    };
    Ok((ModelOutput::concat(&parts), summary))
}

/// Tokenize text examples into model-ready id sequences
pub fn tokenize<T: Tokenizer>(tokenizer: &T, examples: &[TextExample]) -> Vec<QaExample> {
    let questions: Vec<String> = examples.iter().map(|e| e.question.clone()).collect();
    let first: Vec<String> = examples.iter().map(|e| e.candidates[0].clone()).collect();
    let second: Vec<String> = examples.iter().map(|e| e.candidates[1].clone()).collect();
    let questions = tokenizer.encode_all(&questions);
    let first = tokenizer.encode_all(&first);
    let second = tokenizer.encode_all(&second);

    questions
        .into_iter()
        .zip(first)
        .zip(second)
        .zip(examples)
        .map(|(((context, a), b), example)| QaExample {
            context,
            candidates: [a, b],
            label: example.label,
        })
        .collect()
}

/// Owns everything a training run mutates
pub struct Trainer {
    config: TrainingConfig,
    encoder: BatchEncoder,
    parallel: DataParallel,
    model: DualHeadModel,
    optimizer: AdamOptimizer,
    store: CheckpointStore,
    logger: Option<ResultLogger>,
    state: TrainerState,
    rng: StdRng,
}

impl Trainer {
    /// Validate the configuration and set up devices, optimizer and storage
    pub fn new(config: TrainingConfig, model: DualHeadModel) -> Result<Self> {
        config.validate()?;
        if model.config != config.model {
            return Err(TrainError::Checkpoint(
                "model architecture does not match the run configuration".to_string(),
            ));
        }
        let encoder = BatchEncoder::from_config(&config.model)?;
        let parallel = DataParallel::new(config.n_device)?;
        let optimizer = AdamOptimizer::new(&model, &config);
        let store = CheckpointStore::new(&config.save_dir, &config.desc);
        let rng = shuffle_rng(config.seed, 0);

        Ok(Self {
            config,
            encoder,
            parallel,
            model,
            optimizer,
            store,
            logger: None,
            state: TrainerState::default(),
            rng,
        })
    }

    /// Continue a run from a checkpoint
    ///
    /// Counters and the best score come from the checkpoint metadata, and
    /// Adam moments are restored when the checkpoint has them.
    pub fn resume(config: TrainingConfig, checkpoint: Checkpoint) -> Result<Self> {
        let Checkpoint {
            model,
            optimizer,
            metadata,
        } = checkpoint;
        let mut trainer = Self::new(config, model)?;
        match optimizer {
            Some(state) => trainer.optimizer.restore_state(state)?,
            None => tracing::warn!("checkpoint has no optimizer state, moments start at zero"),
        }
        trainer.state = TrainerState {
            n_updates: metadata.n_updates,
            n_epochs: metadata.n_epochs,
            best_score: metadata.best_score,
        };
        trainer.rng = shuffle_rng(trainer.config.seed, metadata.n_epochs);
        Ok(trainer)
    }

    /// Append evaluation records to a JSON Lines log
    pub fn with_logger(mut self, logger: ResultLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &DualHeadModel {
        &self.model
    }

    pub fn into_model(self) -> DualHeadModel {
        self.model
    }

    /// Train for `n_iter` epochs, evaluating at the configured cadence
    pub fn run(&mut self, train: &[QaExample], valid: &[QaExample]) -> Result<TrainSummary> {
        let global_batch = self.config.global_batch();
        let updates_per_epoch = self.config.updates_per_epoch(train.len());
        if updates_per_epoch == 0 {
            return Err(ConfigError::EmptyDataset(format!(
                "train ({} examples, global batch {})",
                train.len(),
                global_batch
            ))
            .into());
        }
        let total_updates = self.state.n_updates + self.config.total_updates(train.len());
        let eval_interval = self.config.eval_interval(train.len());

        tracing::info!(
            n_train = train.len(),
            n_valid = valid.len(),
            n_updates = self.state.n_updates,
            global_batch,
            total_updates,
            eval_interval,
            parameters = self.model.num_parameters(),
            "starting training"
        );

        let mut last_eval = None;
        let mut order: Vec<usize> = (0..train.len()).collect();
        for _ in 0..self.config.n_iter {
            order.shuffle(&mut self.rng);
            for batch_idx in order.chunks_exact(global_batch) {
                let examples: Vec<QaExample> = batch_idx.iter().map(|&i| train[i].clone()).collect();
                self.step(&examples, total_updates)?;

                if self.state.n_updates % eval_interval == 0 {
                    last_eval = Some(self.evaluate(train, valid)?);
                    let metadata = self.metadata();
                    let path = self.store.save_numbered(&self.model, &self.optimizer, &metadata)?;
                    tracing::info!(path = %path.display(), "saved checkpoint");
                }
            }
            self.state.n_epochs += 1;
            last_eval = Some(self.evaluate(train, valid)?);
        }

        let best_checkpoint = self.state.best_score.map(|_| self.store.best_path());
        Ok(TrainSummary {
            state: self.state.clone(),
            last_eval,
            best_checkpoint,
        })
    }

    /// One synchronized update on a global batch
    pub fn step(&mut self, examples: &[QaExample], total_updates: usize) -> Result<f32> {
        let (batch, labels) = self.encoder.encode_examples(examples);
        let lr = self.config.lr_schedule.learning_rate(
            self.config.lr,
            self.state.n_updates,
            total_updates,
            self.config.lr_warmup,
        );

        let output = self.parallel.train_step(
            &mut self.model,
            &mut self.optimizer,
            &batch,
            &labels,
            self.config.clf_coef,
            lr,
            self.config.seed,
        );
        let output = match output {
            Ok(output) => output,
            Err(e @ TrainError::NonFiniteLoss { .. }) => {
                tracing::error!(n_updates = self.state.n_updates, "{}", e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.state.n_updates += 1;
        tracing::debug!(
            n_updates = self.state.n_updates,
            loss = output.loss,
            lm_loss = output.output.mean_lm_loss(),
            grad_norm = output.grad_norm,
            lr,
            "update"
        );
        Ok(output.loss)
    }

    /// Score the train subsample and the validation set, log, and track the best model
    pub fn evaluate(&mut self, train: &[QaExample], valid: &[QaExample]) -> Result<EvalRecord> {
        let batch_size = self.config.global_batch();
        let subsample = &train[..valid.len().min(train.len())];
        let (_, tr) = iter_apply(&self.model, &self.parallel, &self.encoder, subsample, batch_size)?;
        let (_, va) = iter_apply(&self.model, &self.parallel, &self.encoder, valid, batch_size)?;

        let record = EvalRecord {
            epoch: self.state.n_epochs,
            n_updates: self.state.n_updates,
            tr_cost: tr.perplexity,
            va_cost: va.perplexity,
            tr_acc: tr.accuracy,
            va_acc: va.accuracy,
        };
        tracing::info!(
            n_epochs = record.epoch,
            n_updates = record.n_updates,
            tr_ppl = record.tr_cost,
            va_ppl = record.va_cost,
            tr_acc = record.tr_acc,
            va_acc = record.va_acc,
            "evaluation"
        );
        if let Some(logger) = self.logger.as_mut() {
            logger.log(&record)?;
        }

        let improved = match self.state.best_score {
            Some(best) => va.perplexity < best,
            None => true,
        };
        if improved {
            self.state.best_score = Some(va.perplexity);
            let metadata = self.metadata();
            let path = self.store.save_best(&self.model, &metadata)?;
            tracing::info!(path = %path.display(), va_ppl = va.perplexity, "new best model");
        }

        Ok(record)
    }

    fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            n_updates: self.state.n_updates,
            n_epochs: self.state.n_epochs,
            best_score: self.state.best_score,
        }
    }
}

/// Shuffle stream for a run that has completed `n_epochs`
fn shuffle_rng(seed: u64, n_epochs: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(n_epochs as u64))
}

/// Load the vocabulary and all three splits, tokenized
fn load_data(
    config: &TrainingConfig,
) -> Result<(CharTokenizer, Vec<QaExample>, Vec<QaExample>, Vec<QaExample>)> {
    let tokenizer = CharTokenizer::load(&config.encoder_path)?;
    let corpus = BaikeQaCorpus::new(&config.data_dir, config.seed);
    let mut splits = Vec::with_capacity(3);
    for split in [Split::Train, Split::Valid, Split::Test] {
        let examples = corpus.load(split)?;
        if examples.is_empty() {
            return Err(ConfigError::EmptyDataset(split.name().to_string()).into());
        }
        splits.push(tokenize(&tokenizer, &examples));
    }
    let test = splits.pop().unwrap_or_default();
    let valid = splits.pop().unwrap_or_default();
    let train = splits.pop().unwrap_or_default();
    Ok((tokenizer, train, valid, test))
}

/// Train a model end to end from the files named in `config`
///
/// The vocabulary size is taken from the tokenizer, and `n_ctx` shrinks to
/// the longest packed example across all three splits. If `save_dir`
/// already holds numbered checkpoints for this run, training resumes from
/// the latest one.
pub fn train(config: &TrainingConfig) -> Result<TrainSummary> {
    let (tokenizer, train, valid, test) = load_data(config)?;
    let mut config = config.clone();
    config.model.n_vocab = tokenizer.vocab_size();
    config.model.fit_context(
        train
            .iter()
            .chain(&valid)
            .chain(&test)
            .map(|e| (e.context.len(), e.candidates[0].len().max(e.candidates[1].len()))),
    );
    config.validate()?;
    tracing::info!(n_ctx = config.model.n_ctx, n_vocab = config.model.n_vocab, "fitted model input");

    let store = CheckpointStore::new(&config.save_dir, &config.desc);
    let logger = ResultLogger::new(&config.log_path(), &config)?;
    let mut trainer = match store.latest()? {
        Some(path) => {
            tracing::warn!(path = %path.display(), "resuming from existing checkpoint");
            let mut checkpoint = store.restore(&path)?;
            // an epoch-end evaluation may have improved the best after the last numbered save
            checkpoint.metadata.best_score = match (checkpoint.metadata.best_score, store.best_score()?) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            Trainer::resume(config, checkpoint)?
        }
        None => {
            tracing::info!("created model with fresh parameters");
            let model = DualHeadModel::new(&config.model, config.seed);
            Trainer::new(config, model)?
        }
    };
    trainer = trainer.with_logger(logger);
    trainer.run(&train, &valid)
}

/// Predicted candidate index for each example
pub fn predict(
    model: &DualHeadModel,
    config: &TrainingConfig,
    examples: &[QaExample],
) -> Result<Vec<usize>> {
    let encoder = BatchEncoder::from_config(&model.config)?;
    let parallel = DataParallel::new(config.n_device)?;
    let (output, _) = iter_apply(model, &parallel, &encoder, examples, config.global_batch())?;
    Ok(output.predictions())
}

/// Predict the test split with the best (or latest) checkpoint and write the submission file
pub fn predict_test_split(config: &TrainingConfig) -> Result<PathBuf> {
    let (_, _, _, test) = load_data(config)?;
    let store = CheckpointStore::new(&config.save_dir, &config.desc);
    let best = store.best_path();
    let path = if best.exists() {
        best
    } else {
        tracing::warn!("no best checkpoint found, falling back to the latest");
        store
            .latest()?
            .ok_or_else(|| TrainError::Checkpoint(format!("no checkpoints in {}", config.save_dir.display())))?
    };
    let checkpoint = store.restore(&path)?;
    let labels = predict(&checkpoint.model, config, &test)?;

    let out = config.submission_path();
    write_predictions(&out, &labels)?;
    tracing::info!(path = %out.display(), predictions = labels.len(), "wrote predictions");
    Ok(out)
}

/// Write `index\tprediction` lines with a header
pub fn write_predictions(path: &Path, labels: &[usize]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "index\tprediction")?;
    for (i, label) in labels.iter().enumerate() {
        writeln!(out, "{}\t{}", i, label)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn examples(n: usize) -> Vec<QaExample> {
        (0..n)
            .map(|i| QaExample {
                context: vec![1 + i % 5, 2],
                candidates: [vec![3, 1 + i % 7], vec![4]],
                label: i % 2,
            })
            .collect()
    }

    #[test]
    fn test_iter_apply_weights_by_example() {
        let config = ModelConfig::tiny(10);
        let model = DualHeadModel::new(&config, 4);
        let encoder = BatchEncoder::from_config(&config).unwrap();
        let parallel = DataParallel::new(2).unwrap();
        let data = examples(7);

        let (output, summary) = iter_apply(&model, &parallel, &encoder, &data, 4).unwrap();
        let (batch, labels) = encoder.encode_examples(&data);
        let (direct, _) = model.forward(&batch, None);

        assert_eq!(output.len(), 7);
        assert!((summary.lm_loss - direct.mean_lm_loss()).abs() < 1e-5);
        assert!((summary.clf_loss - direct.mean_clf_loss(&labels)).abs() < 1e-5);
        assert!((summary.perplexity - summary.lm_loss.exp()).abs() < 1e-3);
        assert_eq!(output.predictions(), direct.predictions());
    }

    #[test]
    fn test_tokenize_keeps_labels() {
        let tokenizer = CharTokenizer::build(["问答题"], 10);
        let text = vec![TextExample {
            question: "问题".to_string(),
            candidates: ["答".to_string(), "题答".to_string()],
            label: 1,
        }];
        let tokens = tokenize(&tokenizer, &text);
        assert_eq!(tokens[0].context, vec![1, 3]);
        assert_eq!(tokens[0].candidates, [vec![2], vec![3, 2]]);
        assert_eq!(tokens[0].label, 1);
    }

    #[test]
    fn test_write_predictions_format() {
        let path = std::env::temp_dir()
            .join(format!("baike-gpt-sub-{}", std::process::id()))
            .join("run.tsv");
        write_predictions(&path, &[1, 0, 1]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "index\tprediction\n0\t1\n1\t0\n2\t1\n");
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_resume_keeps_counters_and_better_best() {
        let dir = std::env::temp_dir().join(format!("baike-gpt-resume-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut config = TrainingConfig::default();
        config.model = ModelConfig::tiny(10);
        config.n_device = 1;
        config.n_batch = 2;
        config.n_iter = 1;
        config.save_dir = dir.clone();

        let model = DualHeadModel::new(&config.model, 0);
        let checkpoint = Checkpoint {
            model,
            optimizer: None,
            metadata: CheckpointMetadata {
                n_updates: 30,
                n_epochs: 5,
                // perplexity never drops to 1, so no evaluation can beat this
                best_score: Some(1.0),
            },
        };
        let mut trainer = Trainer::resume(config, checkpoint).unwrap();
        assert_eq!(trainer.state().n_updates, 30);

        let summary = trainer.run(&examples(4), &examples(2)).unwrap();
        assert_eq!(summary.state.n_updates, 32);
        assert_eq!(summary.state.n_epochs, 6);
        assert_eq!(summary.state.best_score, Some(1.0));
        assert!(!trainer.store.best_path().exists());
        assert_eq!(trainer.store.latest().unwrap(), Some(trainer.store.numbered_path(32)));
        assert_eq!(trainer.optimizer.step, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_training_set_is_rejected() {
        let mut config = TrainingConfig::default();
        config.model = ModelConfig::tiny(10);
        config.n_device = 1;
        config.n_batch = 4;
        let model = DualHeadModel::new(&config.model, 0);
        let mut trainer = Trainer::new(config, model).unwrap();
        let result = trainer.run(&examples(3), &examples(2));
        assert!(matches!(
            result,
            Err(TrainError::Config(ConfigError::EmptyDataset(_)))
        ));
    }
}
