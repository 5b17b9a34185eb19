//! Position-wise Feed-Forward Network
//!
//! ```text
//! x → c_fc (d → 4d) → activation → c_proj (4d → d) → dropout → y
//! ```
//!
//! The activation is configurable (ReLU, GELU, Swish). Every row is
//! transformed independently, so the layer works on the flattened
//! `[sequences * n_ctx, n_embd]` activation.

use super::activation::Activation;
use super::dropout::{DropoutCache, TrainableDropout};
use super::linear::{LinearCache, TrainableLinear};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Feed-forward sublayer with 4× expansion
#[derive(Clone, Debug)]
pub struct TrainableMLP {
    pub c_fc: TrainableLinear,
    pub c_proj: TrainableLinear,
    pub activation: Activation,
    pub resid_dropout: TrainableDropout,
}

impl TrainableMLP {
    /// Create a new MLP
    ///
    /// # Arguments
    ///
    /// * `n_embd` - Embedding dimension
    /// * `activation` - Nonlinearity between the two projections
    /// * `resid_pdrop` - Dropout probability on the output
    /// * `rng` - Source of randomness for the weights
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        activation: Activation,
        resid_pdrop: f32,
        rng: &mut R,
    ) -> Self {
        let hidden = n_embd * 4;
        Self {
            c_fc: TrainableLinear::new(n_embd, hidden, rng),
            c_proj: TrainableLinear::new(hidden, n_embd, rng),
            activation,
            resid_dropout: TrainableDropout::new(resid_pdrop),
        }
    }

    /// Forward pass: x → c_fc → activation → c_proj → dropout
    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, MLPCache) {
        let (h, fc_cache) = self.c_fc.forward(x);
        let h_activated = self.activation.forward(&h);
        let (y_proj, proj_cache) = self.c_proj.forward(&h_activated);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&y_proj, rng);

        let cache = MLPCache {
            fc_cache,
            h,
            proj_cache,
            resid_dropout_cache,
        };

        (y, cache)
    }

    /// Backward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &MLPCache) -> MLPGradients {
        let grad_y_proj = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let proj_grads = self.c_proj.backward(&grad_y_proj, &cache.proj_cache);
        let grad_h = self.activation.backward(&proj_grads.x, &cache.h);
        let fc_grads = self.c_fc.backward(&grad_h, &cache.fc_cache);

        MLPGradients {
            c_fc_weight: fc_grads.weight,
            c_fc_bias: fc_grads.bias,
            c_proj_weight: proj_grads.weight,
            c_proj_bias: proj_grads.bias,
            x: fc_grads.x,
        }
    }
}

/// Cache for MLP backward pass
pub struct MLPCache {
    pub fc_cache: LinearCache,
    /// Pre-activation hidden state
    pub h: Tensor,
    pub proj_cache: LinearCache,
    pub resid_dropout_cache: DropoutCache,
}

/// Gradients for MLP
pub struct MLPGradients {
    pub c_fc_weight: Tensor,
    pub c_fc_bias: Tensor,
    pub c_proj_weight: Tensor,
    pub c_proj_bias: Tensor,
    pub x: Tensor,
}
