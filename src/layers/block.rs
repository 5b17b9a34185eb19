//! Transformer Block
//!
//! Combines attention and the feed-forward network with residual
//! connections, normalizing after each residual sum (post-norm):
//!
//! ```text
//! x ──→ Attention ──→ (+) ──→ LN1 ──→ n ──→ MLP ──→ (+) ──→ LN2 ──→ h
//! │                    ↑               │             ↑
//! └────────────────────┘               └─────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! Each residual sum sends its gradient down both branches, so the gradient
//! reaching `n` is the LN2 gradient plus the MLP input gradient, and the
//! gradient reaching `x` is the LN1 gradient plus the attention input
//! gradient.

use super::activation::Activation;
use super::attention::{AttentionCache, AttentionGradients, TrainableAttention};
use super::layer_norm::{LayerNormCache, TrainableLayerNorm};
use super::mlp::{MLPCache, MLPGradients, TrainableMLP};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Hyperparameters shared by every block in the stack
#[derive(Clone, Copy, Debug)]
pub struct BlockConfig {
    pub n_embd: usize,
    pub n_head: usize,
    pub activation: Activation,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
}

/// Post-norm transformer block
#[derive(Clone, Debug)]
pub struct TrainableTransformerBlock {
    pub attn: TrainableAttention,
    pub ln_1: TrainableLayerNorm,
    pub mlp: TrainableMLP,
    pub ln_2: TrainableLayerNorm,
}

impl TrainableTransformerBlock {
    /// Create a new transformer block with freshly initialized parameters
    pub fn new<R: Rng + ?Sized>(config: &BlockConfig, rng: &mut R) -> Self {
        Self {
            attn: TrainableAttention::new(
                config.n_embd,
                config.n_head,
                config.attn_pdrop,
                config.resid_pdrop,
                rng,
            ),
            ln_1: TrainableLayerNorm::new(config.n_embd),
            mlp: TrainableMLP::new(config.n_embd, config.activation, config.resid_pdrop, rng),
            ln_2: TrainableLayerNorm::new(config.n_embd),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch * seq_len, n_embd]
    /// * `seq_len` - Length of each sequence in the batch
    /// * `rng` - `Some` in training mode, `None` for evaluation
    ///
    /// # Returns
    ///
    /// Tuple of (output with the same shape as `x`, cache)
    pub fn forward(
        &self,
        x: &Tensor,
        seq_len: usize,
        mut rng: Option<&mut StdRng>,
    ) -> (Tensor, BlockCache) {
        let (a, attn_cache) = self.attn.forward(x, seq_len, rng.as_deref_mut());
        let (n, ln_1_cache) = self.ln_1.forward(&x.add(&a));
        let (m, mlp_cache) = self.mlp.forward(&n, rng);
        let (h, ln_2_cache) = self.ln_2.forward(&n.add(&m));

        let cache = BlockCache {
            attn_cache,
            ln_1_cache,
            mlp_cache,
            ln_2_cache,
        };

        (h, cache)
    }

    /// Backward pass through transformer block
    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        // h = LN2(n + m)
        let ln_2_grads = self.ln_2.backward(grad_out, &cache.ln_2_cache);
        let mlp_grads = self.mlp.backward(&ln_2_grads.x, &cache.mlp_cache);
        let mut grad_n = ln_2_grads.x;
        grad_n.add_assign(&mlp_grads.x);

        // n = LN1(x + a)
        let ln_1_grads = self.ln_1.backward(&grad_n, &cache.ln_1_cache);
        let attn_grads = self.attn.backward(&ln_1_grads.x, &cache.attn_cache);
        let mut grad_x = ln_1_grads.x;
        grad_x.add_assign(&attn_grads.x);

        BlockGradients {
            attn: attn_grads,
            ln_1_gamma: ln_1_grads.gamma,
            ln_1_beta: ln_1_grads.beta,
            mlp: mlp_grads,
            ln_2_gamma: ln_2_grads.gamma,
            ln_2_beta: ln_2_grads.beta,
            x: grad_x,
        }
    }

    /// Parameters in canonical checkpoint order
    pub fn parameters(&self) -> [&Tensor; 12] {
        [
            &self.attn.c_attn.weight,
            &self.attn.c_attn.bias,
            &self.attn.c_proj.weight,
            &self.attn.c_proj.bias,
            &self.ln_1.gamma,
            &self.ln_1.beta,
            &self.mlp.c_fc.weight,
            &self.mlp.c_fc.bias,
            &self.mlp.c_proj.weight,
            &self.mlp.c_proj.bias,
            &self.ln_2.gamma,
            &self.ln_2.beta,
        ]
    }

    /// Mutable parameters in canonical checkpoint order
    pub fn parameters_mut(&mut self) -> [&mut Tensor; 12] {
        [
            &mut self.attn.c_attn.weight,
            &mut self.attn.c_attn.bias,
            &mut self.attn.c_proj.weight,
            &mut self.attn.c_proj.bias,
            &mut self.ln_1.gamma,
            &mut self.ln_1.beta,
            &mut self.mlp.c_fc.weight,
            &mut self.mlp.c_fc.bias,
            &mut self.mlp.c_proj.weight,
            &mut self.mlp.c_proj.bias,
            &mut self.ln_2.gamma,
            &mut self.ln_2.beta,
        ]
    }
}

/// Cache for transformer block backward pass
pub struct BlockCache {
    pub attn_cache: AttentionCache,
    pub ln_1_cache: LayerNormCache,
    pub mlp_cache: MLPCache,
    pub ln_2_cache: LayerNormCache,
}

/// Gradients for transformer block
pub struct BlockGradients {
    pub attn: AttentionGradients,
    pub ln_1_gamma: Tensor,
    pub ln_1_beta: Tensor,
    pub mlp: MLPGradients,
    pub ln_2_gamma: Tensor,
    pub ln_2_beta: Tensor,
    pub x: Tensor,
}

impl BlockGradients {
    /// Split into (parameter gradients in canonical order, input gradient)
    pub fn into_parts(self) -> ([Tensor; 12], Tensor) {
        let params = [
            self.attn.c_attn_weight,
            self.attn.c_attn_bias,
            self.attn.c_proj_weight,
            self.attn.c_proj_bias,
            self.ln_1_gamma,
            self.ln_1_beta,
            self.mlp.c_fc_weight,
            self.mlp.c_fc_bias,
            self.mlp.c_proj_weight,
            self.mlp.c_proj_bias,
            self.ln_2_gamma,
            self.ln_2_beta,
        ];
        (params, self.x)
    }
}
