//! Synchronous Data Parallelism
//!
//! Each global batch is split into `n_device` equal shards. Every shard runs
//! forward and backward against the same parameters on its own worker, the
//! per-shard gradients are averaged, and a single optimizer update is
//! applied. All replicas therefore hold identical parameters at every step.
//!
//! ```text
//!            ┌─ shard 0 ─→ forward/backward ─→ grads 0 ─┐
//! batch ─────┼─ shard 1 ─→ forward/backward ─→ grads 1 ─┼─→ mean ─→ clip ─→ Adam
//!            └─ shard k ─→ forward/backward ─→ grads k ─┘
//! ```
//!
//! Since every shard loss is a mean over an equal number of examples, the
//! averaged gradient is exactly the gradient of the global-batch loss, and
//! the result does not depend on `n_device` beyond floating-point rounding.
//!
//! Workers are the threads of a dedicated rayon pool sized to `n_device`.
//! Outputs are returned in shard order, so row `i` of every output belongs
//! to example `i` of the global batch.

use crate::encoder::EncodedBatch;
use crate::error::{ConfigError, Result, TrainError};
use crate::gradients::{average_gradients, ModelGradients};
use crate::model::{DualHeadModel, ModelOutput};
use crate::optimizer::AdamOptimizer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::io;

/// Result of one synchronous update
pub struct StepOutput {
    /// Concatenated outputs of every shard, in example order
    pub output: ModelOutput,
    /// Combined loss of the global batch
    pub loss: f32,
    /// Gradient norm before clipping
    pub grad_norm: f32,
}

/// A pool of `n_device` workers sharing one set of parameters
pub struct DataParallel {
    n_device: usize,
    pool: rayon::ThreadPool,
}

impl DataParallel {
    pub fn new(n_device: usize) -> Result<Self> {
        if n_device == 0 {
            return Err(ConfigError::Zero("n_device").into());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_device)
            .thread_name(|i| format!("device-{}", i))
            .build()
            .map_err(|e| TrainError::Io(io::Error::other(e)))?;
        Ok(Self { n_device, pool })
    }

    pub fn n_device(&self) -> usize {
        self.n_device
    }

    /// Run one training update over a global batch
    ///
    /// # Arguments
    ///
    /// * `model` - Parameters, updated in place on success
    /// * `optimizer` - Adam state, advanced by one step on success
    /// * `batch` - Global batch; its size must be a multiple of `n_device`
    /// * `labels` - True candidate index per example
    /// * `clf_coef` - Classification loss weight
    /// * `lr` - Learning rate for this update
    /// * `seed` - Run seed; dropout masks derive from (seed, step, shard)
    ///
    /// # Errors
    ///
    /// `IndivisibleBatch` if the batch cannot be sharded, and
    /// `NonFiniteLoss` (with parameters left untouched) if the loss is NaN
    /// or infinite.
    #[allow(clippy::too_many_arguments)]
    pub fn train_step(
        &self,
        model: &mut DualHeadModel,
        optimizer: &mut AdamOptimizer,
        batch: &EncodedBatch,
        labels: &[usize],
        clf_coef: f32,
        lr: f32,
        seed: u64,
    ) -> Result<StepOutput> {
        let shards = batch.shards(self.n_device)?;
        let shard_size = batch.len() / self.n_device;
        let step = optimizer.step;

        let shared: &DualHeadModel = model;
        let results: Vec<(ModelOutput, ModelGradients)> = self.pool.install(|| {
            shards
                .par_iter()
                .enumerate()
                .map(|(shard_idx, shard)| {
                    let shard_labels = &labels[shard_idx * shard_size..(shard_idx + 1) * shard_size];
                    let mut rng = StdRng::seed_from_u64(shard_seed(seed, step, shard_idx));
                    let (output, cache) = shared.forward(shard, Some(&mut rng));
                    let grads = shared.backward(&cache, shard_labels, clf_coef);
                    (output, grads)
                })
                .collect()
        });

        let (outputs, grads): (Vec<ModelOutput>, Vec<ModelGradients>) = results.into_iter().unzip();
        let output = ModelOutput::concat(&outputs);
        let loss = output.combined_loss(labels, clf_coef);
        if !loss.is_finite() {
            return Err(TrainError::NonFiniteLoss { update: step, loss });
        }

        let mut grads = average_gradients(grads);
        let grad_norm = optimizer.update(model, &mut grads, lr);

        Ok(StepOutput {
            output,
            loss,
            grad_norm,
        })
    }

    /// Evaluation-mode forward pass sharded across devices
    pub fn predict(&self, model: &DualHeadModel, batch: &EncodedBatch) -> Result<ModelOutput> {
        let shards = batch.shards(self.n_device)?;
        let outputs: Vec<ModelOutput> = self.pool.install(|| {
            shards
                .par_iter()
                .map(|shard| model.forward(shard, None).0)
                .collect()
        });
        Ok(ModelOutput::concat(&outputs))
    }
}

/// Per-shard dropout seed, distinct for every (update, shard) pair
fn shard_seed(seed: u64, step: usize, shard: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ ((step as u64) << 20)
        ^ shard as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, TrainingConfig};
    use crate::encoder::BatchEncoder;
    use crate::schedule::LrSchedule;
    use crate::tensor::Tensor;

    fn setup() -> (TrainingConfig, EncodedBatch, Vec<usize>) {
        let mut config = TrainingConfig::default();
        config.model = ModelConfig::tiny(10);
        config.e = 1e-3;
        config.lr = 1e-2;
        config.lr_warmup = 0.0;
        config.lr_schedule = LrSchedule::WarmupConstant;

        let encoder = BatchEncoder::from_config(&config.model).unwrap();
        let batch = encoder.encode(
            &[vec![1, 2], vec![3], vec![4, 5, 6], vec![7]],
            &[vec![8], vec![9, 1], vec![2], vec![3, 4]],
            &[vec![5, 6], vec![7], vec![8, 9], vec![1]],
        );
        (config, batch, vec![1, 0, 0, 1])
    }

    #[test]
    fn test_shard_gradients_average_to_full_batch() {
        let (config, batch, labels) = setup();
        let model = DualHeadModel::new(&config.model, 1);

        let (_, cache) = model.forward(&batch, None);
        let full = model.backward(&cache, &labels, 0.5);

        let halves: Vec<ModelGradients> = batch
            .shards(2)
            .unwrap()
            .iter()
            .zip(labels.chunks(2))
            .map(|(shard, y)| {
                let (_, cache) = model.forward(shard, None);
                model.backward(&cache, y, 0.5)
            })
            .collect();
        let averaged = average_gradients(halves);

        for (a, b) in averaged.tensors.iter().zip(&full.tensors) {
            for (x, y) in a.data.iter().zip(&b.data) {
                assert!((x - y).abs() <= 1e-5 + 1e-4 * y.abs(), "{} vs {}", x, y);
            }
        }
    }

    #[test]
    fn test_device_count_does_not_change_update() {
        let (config, batch, labels) = setup();
        let mut results = Vec::new();
        for n_device in [1, 2] {
            let parallel = DataParallel::new(n_device).unwrap();
            let mut model = DualHeadModel::new(&config.model, 7);
            let mut optimizer = AdamOptimizer::new(&model, &config);
            let step = parallel
                .train_step(&mut model, &mut optimizer, &batch, &labels, 0.5, config.lr, config.seed)
                .unwrap();
            results.push((model, step.loss));
        }

        let (one, loss_one) = &results[0];
        let (two, loss_two) = &results[1];
        assert!((loss_one - loss_two).abs() < 1e-5);
        for (a, b) in one.parameters().iter().zip(two.parameters()) {
            for (x, y) in a.data.iter().zip(&b.data) {
                assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
            }
        }
    }

    #[test]
    fn test_indivisible_batch_is_rejected() {
        let (config, batch, labels) = setup();
        let parallel = DataParallel::new(3).unwrap();
        let mut model = DualHeadModel::new(&config.model, 7);
        let mut optimizer = AdamOptimizer::new(&model, &config);
        let result = parallel.train_step(&mut model, &mut optimizer, &batch, &labels, 0.5, 1e-3, 0);
        assert!(matches!(
            result,
            Err(TrainError::Config(ConfigError::IndivisibleBatch { batch: 4, n_device: 3 }))
        ));
        assert_eq!(optimizer.step, 0);
    }

    #[test]
    fn test_non_finite_loss_leaves_state_untouched() {
        let (config, batch, labels) = setup();
        let parallel = DataParallel::new(2).unwrap();
        let mut model = DualHeadModel::new(&config.model, 7);
        model.parameters_mut()[0].data[0] = f32::NAN;
        let mut optimizer = AdamOptimizer::new(&model, &config);
        let before: Vec<Tensor> = model.parameters().into_iter().cloned().collect();

        let result = parallel.train_step(&mut model, &mut optimizer, &batch, &labels, 0.5, config.lr, config.seed);
        match result {
            Err(TrainError::NonFiniteLoss { update, loss }) => {
                assert_eq!(update, 0);
                assert!(!loss.is_finite());
            }
            other => panic!("expected NonFiniteLoss, got {:?}", other.map(|s| s.loss)),
        }

        assert_eq!(optimizer.step, 0);
        assert!(optimizer.m.iter().chain(&optimizer.v).all(|t| t.data.iter().all(|&x| x == 0.0)));
        for (after, before) in model.parameters().iter().zip(&before) {
            let same = after.data.iter().zip(&before.data).all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same);
        }
    }

    #[test]
    fn test_predict_matches_single_replica() {
        let (config, batch, _) = setup();
        let model = DualHeadModel::new(&config.model, 2);
        let parallel = DataParallel::new(2).unwrap();
        let sharded = parallel.predict(&model, &batch).unwrap();
        let (single, _) = model.forward(&batch, None);
        for (a, b) in sharded.clf_logits.data.iter().zip(&single.clf_logits.data) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(sharded.predictions(), single.predictions());
    }

    #[test]
    fn test_zero_devices_is_a_config_error() {
        assert!(matches!(
            DataParallel::new(0),
            Err(TrainError::Config(ConfigError::Zero("n_device")))
        ));
    }
}
