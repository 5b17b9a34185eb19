//! Gradient Utilities
//!
//! Gradients are kept as a flat list of tensors in the model's canonical
//! parameter order (see [`DualHeadModel::parameters`]). That makes the
//! operations here independent of the network's structure:
//!
//! - **Averaging**: combine per-shard gradients after a data-parallel pass
//! - **Global norm**: `√(Σ g²)` over every parameter
//! - **Clipping**: rescale everything when the global norm exceeds a limit
//!
//! ## Clipping Algorithm
//!
//! ```text
//! norm = √(Σ gradient²)
//! if norm > max_norm:
//!     gradients *= (max_norm / norm)
//! ```
//!
//! All gradients are scaled by the same factor, preserving the update's
//! direction.
//!
//! [`DualHeadModel::parameters`]: crate::model::DualHeadModel::parameters

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Gradients for every model parameter, in canonical order
#[derive(Clone, Debug)]
pub struct ModelGradients {
    pub tensors: Vec<Tensor>,
}

impl ModelGradients {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// Iterate over every gradient value
    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.tensors.iter().flat_map(|t| t.data.iter().copied())
    }
}

/// Arithmetic mean of equally weighted shard gradients
///
/// Shards are equal-sized, so the mean of per-shard mean-loss gradients is
/// the gradient of the mean loss over the whole batch.
///
/// # Panics
///
/// Panics if `shards` is empty or the shards disagree on parameter layout.
pub fn average_gradients(shards: Vec<ModelGradients>) -> ModelGradients {
    let k = shards.len();
    assert!(k > 0, "Cannot average an empty set of gradients");

    let mut iter = shards.into_iter();
    let Some(mut total) = iter.next() else {
        unreachable!("checked non-empty above");
    };
    for shard in iter {
        assert_eq!(
            shard.tensors.len(),
            total.tensors.len(),
            "Shard gradients have different parameter counts"
        );
        total
            .tensors
            .par_iter_mut()
            .zip(&shard.tensors)
            .for_each(|(acc, g)| acc.add_assign(g));
    }

    if k > 1 {
        let inv = 1.0 / k as f32;
        total.tensors.par_iter_mut().for_each(|t| t.scale(inv));
    }
    total
}

/// Compute the global L2 norm of all gradients
pub fn compute_grad_norm(grads: &ModelGradients) -> f32 {
    grads
        .tensors
        .par_iter()
        .map(|t| t.sum_sq())
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients to a maximum global norm
///
/// # Arguments
///
/// * `grads` - Gradients to clip (modified in place)
/// * `max_norm` - Maximum allowed norm; values ≤ 0 disable clipping
///
/// # Returns
///
/// The norm before clipping
pub fn clip_gradients(grads: &mut ModelGradients, max_norm: f32) -> f32 {
    let norm = compute_grad_norm(grads);

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / norm;
        grads.tensors.par_iter_mut().for_each(|t| t.scale(scale));
    }

    norm
}
