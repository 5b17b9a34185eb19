//! Masked Multi-Head Self-Attention
//!
//! One affine map produces queries, keys and values together; they are split
//! into `n_head` heads of width `d / n_head`:
//!
//! ```text
//! [q | k | v] = x @ W_attn + b_attn                 x: [B*L, d] → [B*L, 3d]
//! q, k, v     → [B, H, L, d/H]
//! scores      = q @ k^T / √(d/H)
//! masked      = scores * band - 1e9 * (1 - band)    band[p, q] = 1 iff q ≤ p
//! weights     = softmax(masked)                      over the key axis
//! out         = merge_heads(dropout(weights) @ v)    → [B*L, d]
//! y           = dropout(out @ W_proj + b_proj)
//! ```
//!
//! Masked entries land at `-1e9 - max`, whose exponent underflows to exactly
//! zero, so position `p` never receives weight from any `q > p`.
//!
//! ## Backward Pass
//!
//! 1. Residual dropout, output projection
//! 2. `grad_v = dropped_weights^T @ grad_out`, `grad_w = grad_out @ v^T`
//! 3. Attention dropout
//! 4. Softmax, per row: `grad_s = w * (grad_w - sum(grad_w * w))`
//! 5. Band mask and scale, then `grad_q = grad_s @ k`, `grad_k = grad_s^T @ q`
//! 6. Heads merged back into the fused `[B*L, 3d]` gradient for `W_attn`

use super::dropout::{DropoutCache, TrainableDropout};
use super::linear::{LinearCache, TrainableLinear};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;

/// Value written to masked scores before the softmax
const MASK_FILL: f32 = 1e9;

/// Multi-head causal self-attention with a fused QKV projection
#[derive(Clone, Debug)]
pub struct TrainableAttention {
    pub c_attn: TrainableLinear,
    pub c_proj: TrainableLinear,
    pub attn_dropout: TrainableDropout,
    pub resid_dropout: TrainableDropout,
    pub n_head: usize,
    pub n_embd: usize,
}

impl TrainableAttention {
    /// Create a new attention layer
    ///
    /// `n_embd` must be divisible by `n_head`; configuration validation
    /// guarantees this before any layer is built.
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        n_head: usize,
        attn_pdrop: f32,
        resid_pdrop: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            c_attn: TrainableLinear::new(n_embd, 3 * n_embd, rng),
            c_proj: TrainableLinear::new(n_embd, n_embd, rng),
            attn_dropout: TrainableDropout::new(attn_pdrop),
            resid_dropout: TrainableDropout::new(resid_pdrop),
            n_head,
            n_embd,
        }
    }

    fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input [batch * seq_len, n_embd], sequences stored back to back
    /// * `seq_len` - Length of each sequence
    /// * `rng` - `Some` in training mode (dropout active), `None` for evaluation
    pub fn forward(
        &self,
        x: &Tensor,
        seq_len: usize,
        mut rng: Option<&mut StdRng>,
    ) -> (Tensor, AttentionCache) {
        let batch = x.rows() / seq_len;
        let head_dim = self.head_dim();

        let (qkv, c_attn_cache) = self.c_attn.forward(x);
        let q = split_heads(&qkv, 0, self.n_embd, batch, seq_len, self.n_head);
        let k = split_heads(&qkv, self.n_embd, self.n_embd, batch, seq_len, self.n_head);
        let v = split_heads(&qkv, 2 * self.n_embd, self.n_embd, batch, seq_len, self.n_head);

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut scores = q.matmul(&k.transpose(-2, -1));
        scores
            .data
            .par_chunks_mut(seq_len * seq_len)
            .for_each(|square| {
                for p in 0..seq_len {
                    for q_pos in 0..seq_len {
                        let s = &mut square[p * seq_len + q_pos];
                        let band = if q_pos <= p { 1.0 } else { 0.0 };
                        *s = *s * scale * band - MASK_FILL * (1.0 - band);
                    }
                }
            });

        let attn_weights = scores.softmax_last();
        let (attn_dropped, attn_dropout_cache) =
            self.attn_dropout.forward(&attn_weights, rng.as_deref_mut());

        let attn_out = attn_dropped.matmul(&v);
        let merged = merge_heads(&[(&attn_out, 0)], self.n_embd, batch, seq_len, self.n_head);

        let (y_proj, c_proj_cache) = self.c_proj.forward(&merged);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&y_proj, rng);

        let cache = AttentionCache {
            seq_len,
            q,
            k,
            v,
            attn_weights,
            attn_dropped,
            c_attn_cache,
            c_proj_cache,
            attn_dropout_cache,
            resid_dropout_cache,
        };

        (y, cache)
    }

    /// Backward pass through attention
    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let seq_len = cache.seq_len;
        let batch = grad_out.rows() / seq_len;
        let scale = 1.0 / (self.head_dim() as f32).sqrt();

        let grad_y_proj = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let proj_grads = self.c_proj.backward(&grad_y_proj, &cache.c_proj_cache);

        let grad_attn_out = split_heads(&proj_grads.x, 0, self.n_embd, batch, seq_len, self.n_head);

        let grad_v = cache.attn_dropped.transpose(-2, -1).matmul(&grad_attn_out);
        let grad_dropped = grad_attn_out.matmul(&cache.v.transpose(-2, -1));
        let grad_weights = self
            .attn_dropout
            .backward(&grad_dropped, &cache.attn_dropout_cache);

        // Softmax backward per row, then the band mask and score scale
        let mut grad_scores = grad_weights;
        grad_scores
            .data
            .par_chunks_mut(seq_len)
            .zip(cache.attn_weights.data.par_chunks(seq_len))
            .enumerate()
            .for_each(|(row_idx, (g_row, w_row))| {
                let p = row_idx % seq_len;
                let dot: f32 = g_row.iter().zip(w_row).map(|(g, w)| g * w).sum();
                for (q_pos, (g, &w)) in g_row.iter_mut().zip(w_row).enumerate() {
                    *g = if q_pos <= p { w * (*g - dot) * scale } else { 0.0 };
                }
            });

        let grad_q = grad_scores.matmul(&cache.k);
        let grad_k = grad_scores.transpose(-2, -1).matmul(&cache.q);

        let grad_qkv = merge_heads(
            &[(&grad_q, 0), (&grad_k, self.n_embd), (&grad_v, 2 * self.n_embd)],
            3 * self.n_embd,
            batch,
            seq_len,
            self.n_head,
        );
        let attn_grads = self.c_attn.backward(&grad_qkv, &cache.c_attn_cache);

        AttentionGradients {
            c_attn_weight: attn_grads.weight,
            c_attn_bias: attn_grads.bias,
            c_proj_weight: proj_grads.weight,
            c_proj_bias: proj_grads.bias,
            x: attn_grads.x,
        }
    }
}

/// Pull `n_embd` columns starting at `offset` out of `x` and lay them out as
/// `[batch, n_head, seq_len, head_dim]`
fn split_heads(
    x: &Tensor,
    offset: usize,
    n_embd: usize,
    batch: usize,
    seq_len: usize,
    n_head: usize,
) -> Tensor {
    let head_dim = n_embd / n_head;
    let mut out = vec![0.0; batch * n_head * seq_len * head_dim];

    out.par_chunks_mut(seq_len * head_dim)
        .enumerate()
        .for_each(|(bh, chunk)| {
            let b = bh / n_head;
            let h = bh % n_head;
            for l in 0..seq_len {
                let row = x.row(b * seq_len + l);
                let start = offset + h * head_dim;
                chunk[l * head_dim..(l + 1) * head_dim]
                    .copy_from_slice(&row[start..start + head_dim]);
            }
        });

    Tensor::new(out, vec![batch, n_head, seq_len, head_dim])
}

/// Inverse of [`split_heads`]: write each `[batch, n_head, seq_len, head_dim]`
/// part into a `[batch * seq_len, width]` matrix at its column offset
fn merge_heads(
    parts: &[(&Tensor, usize)],
    width: usize,
    batch: usize,
    seq_len: usize,
    n_head: usize,
) -> Tensor {
    let mut out = vec![0.0; batch * seq_len * width];

    out.par_chunks_mut(width)
        .enumerate()
        .for_each(|(row_idx, row)| {
            let b = row_idx / seq_len;
            let l = row_idx % seq_len;
            for (part, offset) in parts {
                let head_dim = part.shape[3];
                for h in 0..n_head {
                    let src = ((b * n_head + h) * seq_len + l) * head_dim;
                    let dst = offset + h * head_dim;
                    row[dst..dst + head_dim].copy_from_slice(&part.data[src..src + head_dim]);
                }
            }
        });

    Tensor::new(out, vec![batch * seq_len, width])
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub seq_len: usize,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Post-softmax weights [batch, n_head, seq_len, seq_len]
    pub attn_weights: Tensor,
    pub attn_dropped: Tensor,
    pub c_attn_cache: LinearCache,
    pub c_proj_cache: LinearCache,
    pub attn_dropout_cache: DropoutCache,
    pub resid_dropout_cache: DropoutCache,
}

/// Gradients for attention
pub struct AttentionGradients {
    pub c_attn_weight: Tensor,
    pub c_attn_bias: Tensor,
    pub c_proj_weight: Tensor,
    pub c_proj_bias: Tensor,
    pub x: Tensor,
}
