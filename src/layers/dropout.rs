//! Dropout Layer
//!
//! Randomly zeros activations during training and rescales survivors by
//! `1 / (1 - rate)`. In evaluation the input passes through unchanged.
//!
//! Whether dropout is active is decided per call: a training forward pass
//! supplies an RNG, an evaluation pass supplies `None`. The layer itself holds
//! no mutable state, so every data-parallel replica can share one model.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Dropout with a fixed rate
#[derive(Clone, Debug)]
pub struct TrainableDropout {
    pub rate: f32,
}

impl TrainableDropout {
    /// Create a new dropout layer
    ///
    /// # Arguments
    ///
    /// * `rate` - Dropout probability in `[0, 1)`
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    /// Forward pass with an independent mask per element
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor
    /// * `rng` - `Some` in training mode, `None` for evaluation
    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, DropoutCache) {
        self.forward_grouped(x, 1, rng)
    }

    /// Forward pass sharing one mask across `group` consecutive rows
    ///
    /// With `group = 2` on a `[2N, d]` input, the two candidates of each pair
    /// see the same mask, so their pooled vectors stay directly comparable.
    pub fn forward_grouped(
        &self,
        x: &Tensor,
        group: usize,
        rng: Option<&mut StdRng>,
    ) -> (Tensor, DropoutCache) {
        let rng = match rng {
            Some(rng) if self.rate > 0.0 => rng,
            _ => {
                let cache = DropoutCache {
                    mask: None,
                    scale: 1.0,
                };
                return (x.clone(), cache);
            }
        };

        let cols = x.last_dim();
        let rows = x.rows();
        let scale = 1.0 / (1.0 - self.rate);

        let mut mask = vec![false; x.data.len()];
        for g in (0..rows).step_by(group.max(1)) {
            let row_mask: Vec<bool> = (0..cols).map(|_| rng.random::<f32>() >= self.rate).collect();
            for r in g..(g + group).min(rows) {
                mask[r * cols..(r + 1) * cols].copy_from_slice(&row_mask);
            }
        }

        let data = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        let cache = DropoutCache {
            mask: Some(mask),
            scale,
        };
        (Tensor::new(data, x.shape.clone()), cache)
    }

    /// Backward pass: route gradients through the kept elements only
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
pub struct DropoutCache {
    /// Dropout mask (true = kept), `None` if dropout was disabled
    pub mask: Option<Vec<bool>>,
    /// Scaling factor applied to kept values
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_eval_mode_is_identity() {
        let dropout = TrainableDropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let (y, cache) = dropout.forward(&x, None);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_grouped_rows_share_mask() {
        let dropout = TrainableDropout::new(0.5);
        let mut rng = StdRng::seed_from_u64(3);
        let x = Tensor::full(vec![6, 16], 1.0);
        let (y, _) = dropout.forward_grouped(&x, 2, Some(&mut rng));
        for pair in y.data.chunks(32) {
            assert_eq!(pair[..16], pair[16..]);
        }
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));
    }

    #[test]
    fn test_backward_uses_forward_mask() {
        let dropout = TrainableDropout::new(0.25);
        let mut rng = StdRng::seed_from_u64(11);
        let x = Tensor::full(vec![4, 8], 1.0);
        let (y, cache) = dropout.forward(&x, Some(&mut rng));
        let grad = dropout.backward(&Tensor::full(vec![4, 8], 1.0), &cache);
        assert_eq!(grad, y);
    }
}
