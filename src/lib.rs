//! # wavae
//!
//! A hierarchical variational autoencoder for sequential (audio-like) data,
//! built on the Candle ML framework.
//!
//! This crate provides:
//! - A multi-scale latent hierarchy coupling a bottom-up encoder tower with a
//!   top-down decoder tower (`model::Autoencoder`)
//! - Optional autoregressive normalizing flows refining each latent group
//! - Weight-normalized convolutions with an amortized spectral-norm
//!   regularizer
//! - A discretized mixture-of-logistics output distribution
//!
//! ## Architecture Overview
//!
//! A forward pass runs the signal through a stem and pre-process stack, then
//! up the encoder tower. Encoder features are cached at every combiner
//! position and consumed in reverse order on the way down: at each latent
//! group the decoder stream produces a learned prior, the cached encoder
//! feature produces the approximate posterior, a latent is sampled (and
//! optionally refined by autoregressive flows), and the latent is injected
//! back into the decoder stream. Generation runs the same top-down pass with
//! the posterior branch skipped.
//!
//! ## Example
//!
//! ```no_run
//! use candle_core::Device;
//! use candle_nn::{VarBuilder, VarMap};
//! use wavae::config::ModelConfig;
//! use wavae::model::{Autoencoder, LossSchedule};
//!
//! # fn main() -> candle_core::Result<()> {
//! let device = Device::Cpu;
//! let config = ModelConfig::default();
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &device);
//! let model = Autoencoder::new(config, vb)?;
//! let samples = model.generate(2, 0.8)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod model;
pub mod nn;

pub use config::ModelConfig;
pub use model::{Autoencoder, ForwardMetrics, LossSchedule};
