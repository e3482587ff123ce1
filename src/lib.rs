//! Candle-UniDiffuser: joint image-text diffusion sampling for Candle.
//!
//! This crate drives a UniDiffuser-style shared denoising network over a
//! packed joint latent, supporting text-to-image, image-to-text, joint,
//! unconditional and round-trip generation modes. The network, scheduler,
//! autoencoder, embedding encoders and caption decoder are external
//! collaborators supplied behind the traits in [`components`].

pub mod codec;
pub mod components;
pub mod config;
pub mod guidance;
pub mod mock;
pub mod mode;
pub mod pipeline;
pub mod sampler;
pub mod utils;

pub use codec::{LatentCodec, LatentSet};
pub use config::{ConfigError, LatentConfig, OutputKind, SamplingConfig};
pub use mode::Mode;
pub use pipeline::{ImageTextOutput, PromptInput, SamplingInputs, UniDiffuserPipeline};
pub use utils::rng::{NoiseRng, SampleRngs};
