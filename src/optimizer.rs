//! Adam Optimizer with Decoupled Weight Decay
//!
//! ## Algorithm
//!
//! Gradients are first clipped to a global norm. Then for each parameter θ
//! with gradient g, at 1-based step t:
//!
//! ```text
//! m = β₁ m + (1 - β₁) g
//! v = β₂ v + (1 - β₂) g²
//! m̂ = m / (1 - β₁^t)
//! v̂ = v / (1 - β₂^t)
//! θ = θ - lr_t × (m̂ / (√v̂ + ε) + λ θ)
//! ```
//!
//! The decay term `λ θ` is scaled by the current learning rate and kept out
//! of the moment estimates.
//!
//! ## Selective Weight Decay
//!
//! By default decay only touches matrices (the embedding table and the
//! projection weights). Biases and layer-norm gains/shifts are 1D and are
//! exempt unless `vector_l2` is set.

use crate::config::TrainingConfig;
use crate::error::{ConfigError, TrainError};
use crate::gradients::{clip_gradients, ModelGradients};
use crate::model::DualHeadModel;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Optimizer selected by name in the run configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" | "adamw" => Ok(OptimizerKind::Adam),
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

/// Moments and step count carried across a resume
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerState {
    pub step: usize,
    pub m: Vec<Tensor>,
    pub v: Vec<Tensor>,
}

/// Adam state and hyperparameters
///
/// `m` and `v` hold one tensor per model parameter, in canonical order.
pub struct AdamOptimizer {
    pub m: Vec<Tensor>,
    pub v: Vec<Tensor>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Decoupled weight decay coefficient λ
    pub l2: f32,
    /// Also decay 1D parameters
    pub vector_l2: bool,
    /// Global clipping threshold; ≤ 0 disables clipping
    pub max_grad_norm: f32,
    /// Number of updates applied so far
    pub step: usize,
}

impl AdamOptimizer {
    /// Zero-initialized moments shaped like the model's parameters
    pub fn new(model: &DualHeadModel, config: &TrainingConfig) -> Self {
        let zeros = || -> Vec<Tensor> {
            model
                .parameters()
                .iter()
                .map(|p| Tensor::zeros(p.shape.clone()))
                .collect()
        };
        Self {
            m: zeros(),
            v: zeros(),
            beta1: config.b1,
            beta2: config.b2,
            epsilon: config.e,
            l2: config.l2,
            vector_l2: config.vector_l2,
            max_grad_norm: config.max_grad_norm,
            step: 0,
        }
    }

    /// Continue from saved moments
    ///
    /// Fails if the saved tensors do not line up with this optimizer's
    /// parameters.
    pub fn restore_state(&mut self, state: OptimizerState) -> Result<(), TrainError> {
        let shapes_match = |saved: &[Tensor], current: &[Tensor]| {
            saved.len() == current.len() && saved.iter().zip(current).all(|(a, b)| a.shape == b.shape)
        };
        if !shapes_match(&state.m, &self.m) || !shapes_match(&state.v, &self.v) {
            return Err(TrainError::Checkpoint(
                "optimizer moments do not match the model parameters".to_string(),
            ));
        }
        self.step = state.step;
        self.m = state.m;
        self.v = state.v;
        Ok(())
    }

    /// Clip `grads`, then apply one Adam update at learning rate `lr`
    ///
    /// # Returns
    ///
    /// The global gradient norm before clipping
    pub fn update(&mut self, model: &mut DualHeadModel, grads: &mut ModelGradients, lr: f32) -> f32 {
        let norm = clip_gradients(grads, self.max_grad_norm);

        self.step += 1;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let params = model.parameters_mut();
        assert_eq!(
            params.len(),
            grads.tensors.len(),
            "Gradient count does not match parameter count"
        );

        for (((param, grad), m), v) in params
            .into_iter()
            .zip(&grads.tensors)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let decay = if self.l2 > 0.0 && (param.shape.len() > 1 || self.vector_l2) {
                self.l2
            } else {
                0.0
            };
            let hyper = StepHyper {
                lr,
                beta1: self.beta1,
                beta2: self.beta2,
                epsilon: self.epsilon,
                bias_correction1,
                bias_correction2,
                decay,
            };
            adam_update_param(&mut param.data, &grad.data, &mut m.data, &mut v.data, &hyper);
        }

        norm
    }
}

struct StepHyper {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias_correction1: f32,
    bias_correction2: f32,
    decay: f32,
}

#[inline]
fn adam_element(p: &mut f32, g: f32, m: &mut f32, v: &mut f32, h: &StepHyper) {
    *m = h.beta1 * *m + (1.0 - h.beta1) * g;
    *v = h.beta2 * *v + (1.0 - h.beta2) * g * g;
    let m_hat = *m / h.bias_correction1;
    let v_hat = *v / h.bias_correction2;
    *p -= h.lr * (m_hat / (v_hat.sqrt() + h.epsilon) + h.decay * *p);
}

/// Update one parameter tensor, in parallel when it is large
fn adam_update_param(param: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32], h: &StepHyper) {
    if param.len() > 1000 {
        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(m.par_iter_mut())
            .zip(v.par_iter_mut())
            .for_each(|(((p, &g), m), v)| adam_element(p, g, m, v, h));
    } else {
        for (((p, &g), m), v) in param.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
            adam_element(p, g, m, v, h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, TrainingConfig};

    fn tiny() -> (DualHeadModel, TrainingConfig) {
        let mut config = TrainingConfig::default();
        config.model = ModelConfig::tiny(10);
        config.l2 = 0.0;
        config.max_grad_norm = -1.0;
        (DualHeadModel::new(&config.model, 1), config)
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let (mut model, config) = tiny();
        let mut opt = AdamOptimizer::new(&model, &config);
        let before = model.parameters()[0].data[0];

        let mut grads = ModelGradients::new(
            model
                .parameters()
                .iter()
                .map(|p| Tensor::full(p.shape.clone(), 0.5))
                .collect(),
        );
        opt.update(&mut model, &mut grads, 0.01);

        // m̂ / √v̂ = g / |g| = 1 on the first step
        let after = model.parameters()[0].data[0];
        assert!((before - after - 0.01).abs() < 1e-5);
        assert_eq!(opt.step, 1);
    }

    #[test]
    fn test_vector_parameters_skip_decay() {
        let (mut model, mut config) = tiny();
        config.l2 = 0.5;
        let mut opt = AdamOptimizer::new(&model, &config);

        let mut grads = ModelGradients::new(
            model
                .parameters()
                .iter()
                .map(|p| Tensor::zeros(p.shape.clone()))
                .collect(),
        );
        let gain_idx = 5; // ln_1.gamma of the first block, initialized to 1
        let table_before = model.parameters()[0].data[3];
        opt.update(&mut model, &mut grads, 0.1);

        assert_eq!(model.parameters()[gain_idx].data[0], 1.0);
        let expected = table_before - 0.1 * 0.5 * table_before;
        assert!((model.parameters()[0].data[3] - expected).abs() < 1e-7);
    }

    #[test]
    fn test_restored_state_continues_identically() {
        let (mut model, config) = tiny();
        let shapes: Vec<Vec<usize>> = model.parameters().iter().map(|p| p.shape.clone()).collect();
        let grads = || ModelGradients::new(shapes.iter().map(|s| Tensor::full(s.clone(), 0.25)).collect());
        let mut opt = AdamOptimizer::new(&model, &config);
        opt.update(&mut model, &mut grads(), 0.01);

        let mut resumed_model = model.clone();
        let mut resumed = AdamOptimizer::new(&resumed_model, &config);
        resumed
            .restore_state(OptimizerState {
                step: opt.step,
                m: opt.m.clone(),
                v: opt.v.clone(),
            })
            .unwrap();

        opt.update(&mut model, &mut grads(), 0.01);
        resumed.update(&mut resumed_model, &mut grads(), 0.01);
        assert_eq!(resumed.step, 2);
        assert_eq!(model.parameters(), resumed_model.parameters());
    }

    #[test]
    fn test_restore_rejects_mismatched_moments() {
        let (model, config) = tiny();
        let mut opt = AdamOptimizer::new(&model, &config);
        let state = OptimizerState {
            step: 3,
            m: opt.m[1..].to_vec(),
            v: opt.v.clone(),
        };
        assert!(matches!(opt.restore_state(state), Err(TrainError::Checkpoint(_))));
        assert_eq!(opt.step, 0);
    }

    #[test]
    fn test_parse_optimizer() {
        assert_eq!("adam".parse::<OptimizerKind>(), Ok(OptimizerKind::Adam));
        assert!(matches!(
            "sgd".parse::<OptimizerKind>(),
            Err(ConfigError::UnknownOptimizer(_))
        ));
    }
}
