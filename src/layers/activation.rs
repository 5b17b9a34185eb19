//! Activation Functions
//!
//! The feed-forward sublayer applies one of three nonlinearities, chosen by
//! name in the run configuration and resolved once into [`Activation`].
//!
//! ## GELU
//!
//! We use the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! ## Swish
//!
//! ```text
//! swish(x)  = x × σ(x)
//! swish'(x) = σ(x) + x × σ(x) × (1 − σ(x))
//! ```
//!
//! ## ReLU
//!
//! ```text
//! relu(x) = max(x, 0)
//! ```

use crate::error::ConfigError;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Feed-forward nonlinearity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
    Swish,
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "swish" => Ok(Activation::Swish),
            _ => Err(ConfigError::UnknownActivation(s.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Swish => "swish",
        };
        f.write_str(name)
    }
}

impl Activation {
    /// Apply the activation element-wise
    pub fn forward(self, x: &Tensor) -> Tensor {
        let result = x.data.par_iter().map(|&v| self.apply(v)).collect();
        Tensor::new(result, x.shape.clone())
    }

    /// Gradient with respect to the activation's input
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient from the next layer
    /// * `x` - Pre-activation input saved during the forward pass
    pub fn backward(self, grad_out: &Tensor, x: &Tensor) -> Tensor {
        let result = x
            .data
            .par_iter()
            .zip(&grad_out.data)
            .map(|(&v, &g)| g * self.derivative(v))
            .collect();
        Tensor::new(result, x.shape.clone())
    }

    #[inline]
    fn apply(self, v: f32) -> f32 {
        match self {
            Activation::Relu => v.max(0.0),
            Activation::Gelu => {
                let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * v * (1.0 + (sqrt_2_pi * (v + 0.044715 * v.powi(3))).tanh())
            }
            Activation::Swish => v * sigmoid(v),
        }
    }

    #[inline]
    fn derivative(self, v: f32) -> f32 {
        match self {
            Activation::Relu => {
                if v > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Gelu => {
                let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
                let tanh_inner = (sqrt_2_pi * (v + 0.044715 * v.powi(3))).tanh();
                let sech_sq = 1.0 - tanh_inner * tanh_inner;
                0.5 * (1.0 + tanh_inner)
                    + 0.5 * v * sech_sq * sqrt_2_pi * (1.0 + 3.0 * 0.044715 * v * v)
            }
            Activation::Swish => {
                let s = sigmoid(v);
                s + v * s * (1.0 - s)
            }
        }
    }
}

#[inline]
fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("gelu".parse::<Activation>(), Ok(Activation::Gelu));
        assert_eq!("ReLU".parse::<Activation>(), Ok(Activation::Relu));
        assert_eq!(
            "tanh".parse::<Activation>(),
            Err(ConfigError::UnknownActivation("tanh".to_string()))
        );
    }

    #[test]
    fn test_known_values() {
        let x = Tensor::new(vec![-1.0, 0.0, 2.0], vec![3]);
        assert_eq!(Activation::Relu.forward(&x).data, vec![0.0, 0.0, 2.0]);

        let gelu = Activation::Gelu.forward(&x);
        assert!(gelu.data[1].abs() < 1e-7);
        assert!((gelu.data[2] - 1.9546).abs() < 1e-3);

        let swish = Activation::Swish.forward(&x);
        assert!((swish.data[0] + 0.26894).abs() < 1e-4);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let eps = 1e-3;
        for act in [Activation::Gelu, Activation::Swish, Activation::Relu] {
            for &v in &[-1.7f32, -0.3, 0.4, 1.9] {
                let numeric = (act.apply(v + eps) - act.apply(v - eps)) / (2.0 * eps);
                assert!(
                    (numeric - act.derivative(v)).abs() < 1e-2,
                    "{} derivative mismatch at {}",
                    act,
                    v
                );
            }
        }
    }
}
