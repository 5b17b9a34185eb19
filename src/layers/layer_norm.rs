//! Layer Normalization
//!
//! Normalizes each row over the feature axis, then applies a learned gain
//! `g` and shift `b`:
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N
//! x_norm = (x - mean) / √(var + ε)      ε = 1e-5
//! y      = g * x_norm + b
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_g = sum_rows(grad_y * x_norm)
//! grad_b = sum_rows(grad_y)
//! grad_x_norm = grad_y * g
//! grad_x = (grad_x_norm - mean(grad_x_norm) - x_norm * mean(grad_x_norm * x_norm)) / √(var + ε)
//! ```
//!
//! The two mean terms account for every element's influence on the row
//! statistics.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Layer normalization over the last dimension
#[derive(Clone, Debug)]
pub struct TrainableLayerNorm {
    pub gamma: Tensor, // Scale parameter [n_embd]
    pub beta: Tensor,  // Shift parameter [n_embd]
    pub eps: f32,
}

impl TrainableLayerNorm {
    /// Create a layer norm with gain 1, shift 0 and ε = 1e-5
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![normalized_shape], 1.0),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: 1e-5,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [rows, n_embd]
    ///
    /// # Returns
    ///
    /// Tuple of (output [rows, n_embd], cache with normalized input and row std)
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n_embd = x.last_dim();
        let rows = x.rows();

        let mut x_norm = vec![0.0; x.data.len()];
        let mut std = vec![0.0; rows];

        x_norm
            .par_chunks_mut(n_embd)
            .zip(std.par_iter_mut())
            .enumerate()
            .for_each(|(i, (norm_row, std_val))| {
                let row = x.row(i);
                let mean = row.iter().sum::<f32>() / n_embd as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n_embd as f32;
                *std_val = (var + self.eps).sqrt();
                for (n, &v) in norm_row.iter_mut().zip(row) {
                    *n = (v - mean) / *std_val;
                }
            });

        let mut y = x_norm.clone();
        y.par_chunks_mut(n_embd).for_each(|row| {
            for ((v, &g), &b) in row.iter_mut().zip(&self.gamma.data).zip(&self.beta.data) {
                *v = *v * g + b;
            }
        });

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            std,
        };

        (Tensor::new(y, x.shape.clone()), cache)
    }

    /// Backward pass
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient from next layer [rows, n_embd]
    /// * `cache` - Cached values from forward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let n_embd = self.gamma.data.len();

        let mut grad_gamma = vec![0.0; n_embd];
        let mut grad_beta = vec![0.0; n_embd];
        for (g_row, n_row) in grad_out.data.chunks(n_embd).zip(cache.x_norm.data.chunks(n_embd)) {
            for j in 0..n_embd {
                grad_gamma[j] += g_row[j] * n_row[j];
                grad_beta[j] += g_row[j];
            }
        }

        let mut grad_x = vec![0.0; grad_out.data.len()];
        grad_x
            .par_chunks_mut(n_embd)
            .enumerate()
            .for_each(|(i, out_row)| {
                let g_row = grad_out.row(i);
                let n_row = cache.x_norm.row(i);

                // grad_x_norm = grad_out * gamma
                let gxn: Vec<f32> = g_row
                    .iter()
                    .zip(&self.gamma.data)
                    .map(|(g, gamma)| g * gamma)
                    .collect();
                let mean_gxn = gxn.iter().sum::<f32>() / n_embd as f32;
                let mean_gxn_xn = gxn
                    .iter()
                    .zip(n_row)
                    .map(|(g, n)| g * n)
                    .sum::<f32>()
                    / n_embd as f32;

                for j in 0..n_embd {
                    out_row[j] = (gxn[j] - mean_gxn - n_row[j] * mean_gxn_xn) / cache.std[i];
                }
            });

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![n_embd]),
            beta: Tensor::new(grad_beta, vec![n_embd]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

/// Cache for layer norm backward pass
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row `√(var + ε)`
    pub std: Vec<f32>,
}

/// Gradients for layer norm
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_normalized() {
        let ln = TrainableLayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 8.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for row in y.data.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        let mut ln = TrainableLayerNorm::new(3);
        ln.gamma = Tensor::new(vec![1.5, -0.5, 2.0], vec![3]);
        let x = Tensor::new(vec![0.3, -1.2, 0.8], vec![1, 3]);
        let weights = [0.7f32, -1.1, 0.4];
        let loss = |x: &Tensor| -> f32 {
            let (y, _) = ln.forward(x);
            y.data.iter().zip(&weights).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grad = ln.backward(&Tensor::new(weights.to_vec(), vec![1, 3]), &cache);

        let eps = 1e-2;
        for j in 0..3 {
            let mut plus = x.clone();
            plus.data[j] += eps;
            let mut minus = x.clone();
            minus.data[j] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - grad.x.data[j]).abs() < 1e-2);
        }
    }
}
