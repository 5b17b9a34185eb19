//! Affine Layer
//!
//! Performs `y = x @ W + b` over every row of a 2D activation. The attention
//! projections, the feed-forward layers, and the classification head are all
//! instances of this layer.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [rows, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y = x @ W + b [rows, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! ## Initialization
//!
//! Weights are drawn from `Normal(0, 0.02)` and biases start at zero.

use crate::tensor::Tensor;
use rand::Rng;

/// Standard deviation of the weight initializer
pub const INIT_STD: f32 = 0.02;

/// Affine layer (fully connected)
#[derive(Clone, Debug)]
pub struct TrainableLinear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl TrainableLinear {
    /// Create a new layer with `Normal(0, 0.02)` weights and zero bias
    ///
    /// # Arguments
    ///
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `rng` - Source of randomness for the weights
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: Tensor::random_normal(vec![in_features, out_features], INIT_STD, rng),
            bias: Tensor::zeros(vec![out_features]),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [rows, in_features]
    ///
    /// # Returns
    ///
    /// Tuple of (output [rows, out_features], cache holding x)
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = self.apply(x);
        let cache = LinearCache { x: x.clone() };
        (y, cache)
    }

    /// Forward pass without caching
    pub fn apply(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.weight).add(&self.bias)
    }

    /// Backward pass
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient from next layer [rows, out_features]
    /// * `cache` - Cached values from forward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        let grad_weight = cache.x.transpose(-2, -1).matmul(grad_out);
        let grad_bias = grad_out.sum_rows();
        let grad_x = grad_out.matmul(&self.weight.transpose(-2, -1));

        LinearGradients {
            weight: grad_weight,
            bias: grad_bias,
            x: grad_x,
        }
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for linear layer
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Tensor,
    pub x: Tensor, // Gradient to pass to previous layer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_shapes_and_values() {
        let layer = TrainableLinear {
            weight: Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]),
            bias: Tensor::new(vec![0.5, 0.0, -0.5], vec![3]),
        };
        let x = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        let (y, cache) = layer.forward(&x);
        assert_eq!(y.data, vec![1.5, 2.0, 2.5, 4.5, 5.0, 5.5]);

        let grads = layer.backward(&Tensor::full(vec![2, 3], 1.0), &cache);
        assert_eq!(grads.bias.data, vec![2.0, 2.0, 2.0]);
        assert_eq!(grads.weight.data, vec![1.0; 6]);
        assert_eq!(grads.x.data, vec![6.0, 15.0, 6.0, 15.0]);
    }
}
