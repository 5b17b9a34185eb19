//! Neural Network Layers
//!
//! Every layer of the transformer stack, each with a forward and a backward
//! pass.
//!
//! ## Layers
//!
//! - **activation**: ReLU, GELU and Swish (forward and backward)
//! - **linear**: Affine projection
//! - **layer_norm**: Layer normalization
//! - **dropout**: Dropout, including the pair-shared variant
//! - **mlp**: Position-wise feed-forward network
//! - **attention**: Masked multi-head self-attention
//! - **block**: Post-norm transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl TrainableLayer {
//!     pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache) -> Gradients { }
//! }
//! ```
//!
//! Layers take `&self` in both passes. All mutable state produced by a pass
//! lives in its cache, which lets many shards run through one model
//! concurrently.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

pub use activation::Activation;
pub use attention::{AttentionCache, AttentionGradients, TrainableAttention};
pub use block::{BlockCache, BlockConfig, BlockGradients, TrainableTransformerBlock};
pub use dropout::{DropoutCache, TrainableDropout};
pub use layer_norm::{LayerNormCache, LayerNormGradients, TrainableLayerNorm};
pub use linear::{LinearCache, LinearGradients, TrainableLinear, INIT_STD};
pub use mlp::{MLPCache, MLPGradients, TrainableMLP};
