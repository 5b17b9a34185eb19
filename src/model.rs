//! Dual-Head Transformer
//!
//! A GPT-style stack with two heads that share every parameter below them:
//!
//! - **Language-model head**: next-token logits through the transpose of the
//!   shared embedding table (tied weights)
//! - **Classification head**: one scalar per candidate, pooled at the
//!   `classify` token, compared across the pair
//!
//! ## Forward Pass
//!
//! ```text
//! tokens [N, 2, L, 2] → rows [2N, L]
//! we' = dropout(we)                                 we: [vocab + 3 + L, d]
//! h   = we'[token] + we'[position]                  [2N·L, d]
//! h   = block_n(... block_1(h))
//!
//! LM:  logits = h[:, :L-1] @ we'^T                  [2N·(L-1), vocab + 3 + L]
//!      lm[r]  = Σ_p ce(logits[r,p], token[r,p+1]) · mask[r,p+1] / Σ_p mask[r,p+1]
//!
//! CLF: pooled = h[r, first classify position]       [2N, d]
//!      pooled = pair_dropout(pooled)                same mask for both candidates
//!      logits = (pooled @ w + b).reshape(N, 2)
//!      clf[i] = ce(logits[i], y[i])
//! ```
//!
//! ## Objective
//!
//! ```text
//! loss = mean(lm) + clf_coef × mean(clf)      (clf_coef > 0)
//! loss = mean(lm)                             (clf_coef = 0)
//! ```
//!
//! ## Parameter Order
//!
//! [`DualHeadModel::parameters`] lists tensors in a fixed order shared by
//! gradients, optimizer moments and checkpoints:
//!
//! ```text
//! we, [c_attn.w, c_attn.b, c_proj.w, c_proj.b, ln_1.g, ln_1.b,
//!      c_fc.w, c_fc.b, mlp.c_proj.w, mlp.c_proj.b, ln_2.g, ln_2.b] × n_layer,
//! clf.w, clf.b
//! ```
//!
//! The model is immutable during forward and backward passes, so any number
//! of shards can run against one `&DualHeadModel` at once.

use crate::config::ModelConfig;
use crate::encoder::EncodedBatch;
use crate::error::{Result, TrainError};
use crate::gradients::ModelGradients;
use crate::layers::{
    BlockCache, DropoutCache, LinearCache, TrainableDropout, TrainableLinear,
    TrainableTransformerBlock, INIT_STD,
};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// Transformer with a tied language-model head and a pairwise classifier
#[derive(Clone, Debug)]
pub struct DualHeadModel {
    pub config: ModelConfig,
    /// Shared token, special-token and position embeddings
    pub we: Tensor,
    pub blocks: Vec<TrainableTransformerBlock>,
    pub clf: TrainableLinear,
    pub embd_dropout: TrainableDropout,
    pub clf_dropout: TrainableDropout,
}

impl DualHeadModel {
    /// Build a model with seeded random initialization
    ///
    /// The table and all weight matrices are drawn from `Normal(0, 0.02)`;
    /// biases start at zero and layer-norm gains at one. The same
    /// `(config, seed)` always produces the same parameters.
    pub fn new(config: &ModelConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let we = Tensor::random_normal(vec![config.table_size(), config.n_embd], INIT_STD, &mut rng);
        let block_config = config.block_config();
        let blocks = (0..config.n_layer)
            .map(|_| TrainableTransformerBlock::new(&block_config, &mut rng))
            .collect();
        let clf = TrainableLinear::new(config.n_embd, 1, &mut rng);

        Self {
            config: config.clone(),
            we,
            blocks,
            clf,
            embd_dropout: TrainableDropout::new(config.embd_pdrop),
            clf_dropout: TrainableDropout::new(config.clf_pdrop),
        }
    }

    /// Rebuild a model from a flat list of tensors in canonical order
    ///
    /// Fails if the count or any shape disagrees with `config`.
    pub fn from_parameters(config: &ModelConfig, tensors: Vec<Tensor>) -> Result<Self> {
        let mut model = Self::new(config, 0);
        let slots = model.parameters_mut();
        if slots.len() != tensors.len() {
            return Err(TrainError::Checkpoint(format!(
                "expected {} parameter tensors, found {}",
                slots.len(),
                tensors.len()
            )));
        }
        for (i, (slot, tensor)) in slots.into_iter().zip(tensors).enumerate() {
            if slot.shape != tensor.shape {
                return Err(TrainError::Checkpoint(format!(
                    "parameter {} has shape {:?}, expected {:?}",
                    i, tensor.shape, slot.shape
                )));
            }
            *slot = tensor;
        }
        Ok(model)
    }

    /// All parameters in canonical order
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::with_capacity(3 + 12 * self.blocks.len());
        params.push(&self.we);
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.push(&self.clf.weight);
        params.push(&self.clf.bias);
        params
    }

    /// All parameters in canonical order, mutably
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::with_capacity(3 + 12 * self.blocks.len());
        params.push(&mut self.we);
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params.push(&mut self.clf.weight);
        params.push(&mut self.clf.bias);
        params
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Forward pass over a packed batch
    ///
    /// # Arguments
    ///
    /// * `batch` - Packed examples; `batch.n_ctx` must equal `config.n_ctx`
    /// * `rng` - `Some` for a training pass (dropout active), `None` for evaluation
    ///
    /// # Returns
    ///
    /// Tuple of (outputs for both heads, cache for the backward pass)
    pub fn forward(
        &self,
        batch: &EncodedBatch,
        mut rng: Option<&mut StdRng>,
    ) -> (ModelOutput, ModelCache) {
        assert_eq!(
            batch.n_ctx, self.config.n_ctx,
            "Batch was packed for a different context length"
        );
        let n = batch.len();
        let rows = 2 * n;
        let seq_len = batch.n_ctx;

        // Embedding: the dropped-out table feeds both the lookup and the LM head
        let (we, embd_cache) = self.embd_dropout.forward(&self.we, rng.as_deref_mut());
        let token_idx: Vec<usize> = batch.tokens.iter().step_by(2).copied().collect();
        let position_idx: Vec<usize> = batch.tokens.iter().skip(1).step_by(2).copied().collect();
        let mut h = we.gather_rows(&token_idx);
        h.add_assign(&we.gather_rows(&position_idx));

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (out, cache) = block.forward(&h, seq_len, rng.as_deref_mut());
            h = out;
            block_caches.push(cache);
        }

        // Language-model head
        let lm_rows: Vec<usize> = (0..rows)
            .flat_map(|r| (0..seq_len - 1).map(move |p| r * seq_len + p))
            .collect();
        let lm_targets: Vec<usize> = (0..rows)
            .flat_map(|r| (1..seq_len).map(move |p| batch.token(r, p)))
            .collect();
        let lm_h = h.gather_rows(&lm_rows);
        let mut lm_probs = lm_h.matmul(&we.transpose(-2, -1));
        let ce = softmax_cross_entropy(&mut lm_probs, &lm_targets);

        let mut lm_losses = Vec::with_capacity(rows);
        let mut lm_row_weights = Vec::with_capacity(rows);
        for r in 0..rows {
            let next_mask = &batch.row_mask(r)[1..];
            let ce_row = &ce[r * (seq_len - 1)..(r + 1) * (seq_len - 1)];
            let denom: f32 = next_mask.iter().sum();
            let total: f32 = ce_row.iter().zip(next_mask).map(|(c, m)| c * m).sum();
            if denom > 0.0 {
                lm_losses.push(total / denom);
                lm_row_weights.push(1.0 / denom);
            } else {
                lm_losses.push(0.0);
                lm_row_weights.push(0.0);
            }
        }

        // Classification head, pooled at the first classify token
        let classify = self.config.classify_token();
        let pool_idx: Vec<usize> = (0..rows)
            .map(|r| {
                let p = (0..seq_len)
                    .find(|&p| batch.token(r, p) == classify)
                    .unwrap_or(0);
                r * seq_len + p
            })
            .collect();
        let pooled = h.gather_rows(&pool_idx);
        let (pooled, clf_dropout_cache) = self.clf_dropout.forward_grouped(&pooled, 2, rng);
        let (clf_out, clf_linear_cache) = self.clf.forward(&pooled);
        let clf_logits = clf_out.reshape(&[n, 2]);

        let output = ModelOutput {
            clf_logits,
            lm_losses,
        };
        let cache = ModelCache {
            seq_len,
            token_idx,
            position_idx,
            we,
            embd_cache,
            block_caches,
            lm_rows,
            lm_targets,
            lm_h,
            lm_probs,
            lm_row_weights,
            mask: batch.mask.clone(),
            pool_idx,
            clf_dropout_cache,
            clf_linear_cache,
            clf_logits: output.clf_logits.clone(),
        };

        (output, cache)
    }

    /// Backward pass of the combined objective
    ///
    /// # Arguments
    ///
    /// * `cache` - Cache from the matching forward pass
    /// * `labels` - Index of the true candidate for each example
    /// * `clf_coef` - Weight of the classification loss; 0 skips that head
    ///
    /// # Returns
    ///
    /// Gradients of `mean(lm) + clf_coef × mean(clf)` in canonical order
    pub fn backward(&self, cache: &ModelCache, labels: &[usize], clf_coef: f32) -> ModelGradients {
        let seq_len = cache.seq_len;
        let rows = cache.token_idx.len() / seq_len;
        let n = rows / 2;
        let table_rows = self.we.shape[0];

        // d mean(lm) / d ce[r, p] = mask[r, p+1] / (rows × Σ mask[r, 1:])
        let mut grad_logits = cache.lm_probs.clone();
        let vocab = grad_logits.last_dim();
        let row_scale = 1.0 / rows as f32;
        grad_logits
            .data
            .par_chunks_mut(vocab)
            .enumerate()
            .for_each(|(i, g_row)| {
                let r = i / (seq_len - 1);
                let p = i % (seq_len - 1);
                let weight = cache.mask[r * seq_len + p + 1] * cache.lm_row_weights[r] * row_scale;
                g_row[cache.lm_targets[i]] -= 1.0;
                for g in g_row.iter_mut() {
                    *g *= weight;
                }
            });

        let grad_lm_h = grad_logits.matmul(&cache.we);
        let mut grad_we = grad_logits.transpose(-2, -1).matmul(&cache.lm_h);
        let mut grad_h = grad_lm_h.scatter_add_rows(&cache.lm_rows, rows * seq_len);

        let (clf_weight, clf_bias) = if clf_coef != 0.0 {
            let mut grad_clf = vec![0.0; rows];
            let scale = clf_coef / n as f32;
            for (i, &y) in labels.iter().enumerate() {
                let probs = pair_softmax(cache.clf_logits.row(i));
                for j in 0..2 {
                    let target = if j == y { 1.0 } else { 0.0 };
                    grad_clf[2 * i + j] = scale * (probs[j] - target);
                }
            }
            let grad_clf = Tensor::new(grad_clf, vec![rows, 1]);
            let linear = self.clf.backward(&grad_clf, &cache.clf_linear_cache);
            let grad_pooled = self.clf_dropout.backward(&linear.x, &cache.clf_dropout_cache);
            grad_h.index_add_rows(&cache.pool_idx, &grad_pooled);
            (linear.weight, linear.bias)
        } else {
            (
                Tensor::zeros(self.clf.weight.shape.clone()),
                Tensor::zeros(self.clf.bias.shape.clone()),
            )
        };

        let mut block_params = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.block_caches).rev() {
            let (params, grad_x) = block.backward(&grad_h, block_cache).into_parts();
            block_params.push(params);
            grad_h = grad_x;
        }
        block_params.reverse();

        grad_we.index_add_rows(&cache.token_idx, &grad_h);
        grad_we.index_add_rows(&cache.position_idx, &grad_h);
        debug_assert_eq!(grad_we.shape[0], table_rows);
        let grad_we = self.embd_dropout.backward(&grad_we, &cache.embd_cache);

        let mut tensors = Vec::with_capacity(3 + 12 * self.blocks.len());
        tensors.push(grad_we);
        for params in block_params {
            tensors.extend(params);
        }
        tensors.push(clf_weight);
        tensors.push(clf_bias);
        ModelGradients::new(tensors)
    }
}

/// Softmax each row of `logits` in place and return `-log p[target]` per row
fn softmax_cross_entropy(logits: &mut Tensor, targets: &[usize]) -> Vec<f32> {
    let cols = logits.last_dim();
    logits
        .data
        .par_chunks_mut(cols)
        .zip(targets.par_iter())
        .map(|(row, &target)| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            let target_shifted = row[target].ln();
            for v in row.iter_mut() {
                *v /= sum;
            }
            sum.ln() - target_shifted
        })
        .collect()
}

/// Softmax over a candidate pair
fn pair_softmax(logits: &[f32]) -> [f32; 2] {
    let max = logits[0].max(logits[1]);
    let e0 = (logits[0] - max).exp();
    let e1 = (logits[1] - max).exp();
    let sum = e0 + e1;
    [e0 / sum, e1 / sum]
}

/// Outputs of a forward pass
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// `[N, 2]` candidate scores
    pub clf_logits: Tensor,
    /// `[2N]` mean next-token loss per packed row
    pub lm_losses: Vec<f32>,
}

impl ModelOutput {
    /// Number of examples
    pub fn len(&self) -> usize {
        self.clf_logits.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-example cross-entropy of the classification logits
    pub fn clf_losses(&self, labels: &[usize]) -> Vec<f32> {
        labels
            .iter()
            .enumerate()
            .map(|(i, &y)| {
                let logits = self.clf_logits.row(i);
                let max = logits[0].max(logits[1]);
                let lse = max + ((logits[0] - max).exp() + (logits[1] - max).exp()).ln();
                lse - logits[y]
            })
            .collect()
    }

    /// Mean language-model loss over all packed rows
    pub fn mean_lm_loss(&self) -> f32 {
        mean(&self.lm_losses)
    }

    /// Mean classification loss over examples
    pub fn mean_clf_loss(&self, labels: &[usize]) -> f32 {
        mean(&self.clf_losses(labels))
    }

    /// The scalar training objective
    pub fn combined_loss(&self, labels: &[usize], clf_coef: f32) -> f32 {
        if clf_coef != 0.0 {
            self.mean_lm_loss() + clf_coef * self.mean_clf_loss(labels)
        } else {
            self.mean_lm_loss()
        }
    }

    /// Predicted candidate index per example (ties go to candidate 0)
    pub fn predictions(&self) -> Vec<usize> {
        (0..self.len())
            .map(|i| {
                let logits = self.clf_logits.row(i);
                if logits[1] > logits[0] {
                    1
                } else {
                    0
                }
            })
            .collect()
    }

    /// Stack outputs of consecutive sub-batches
    pub fn concat(parts: &[ModelOutput]) -> ModelOutput {
        let logits: Vec<Tensor> = parts.iter().map(|p| p.clf_logits.clone()).collect();
        ModelOutput {
            clf_logits: if logits.is_empty() {
                Tensor::zeros(vec![0, 2])
            } else {
                Tensor::concat_rows(&logits)
            },
            lm_losses: parts.iter().flat_map(|p| p.lm_losses.iter().copied()).collect(),
        }
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Everything the backward pass needs from a forward pass
pub struct ModelCache {
    pub seq_len: usize,
    pub token_idx: Vec<usize>,
    pub position_idx: Vec<usize>,
    /// Embedding table after dropout
    pub we: Tensor,
    pub embd_cache: DropoutCache,
    pub block_caches: Vec<BlockCache>,
    pub lm_rows: Vec<usize>,
    pub lm_targets: Vec<usize>,
    pub lm_h: Tensor,
    /// Softmax of the LM logits
    pub lm_probs: Tensor,
    /// `1 / Σ mask[r, 1:]` per row (0 for empty rows)
    pub lm_row_weights: Vec<f32>,
    pub mask: Vec<f32>,
    pub pool_idx: Vec<usize>,
    pub clf_dropout_cache: DropoutCache,
    pub clf_linear_cache: LinearCache,
    pub clf_logits: Tensor,
}
