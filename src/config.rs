//! Configuration structures for the joint diffusion sampler

use serde::{Deserialize, Serialize};

use crate::mode::Mode;

/// Geometry of the three sub-latents handled by the shared denoising network.
///
/// The defaults correspond to the UniDiffuser-v1 checkpoint family: a 4-channel
/// VAE latent at 1/8 resolution, a single 512-dim CLIP image token and a
/// 77-token text embedding projected down to 64 dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentConfig {
    /// VAE latent channels (usually 4)
    pub latent_channels: usize,
    /// Spatial downscale factor of the image autoencoder (usually 8)
    pub vae_scale_factor: usize,
    /// Width of the CLIP image embedding (usually 512)
    pub clip_img_dim: usize,
    /// Token count of the text embedding (usually 77)
    pub text_seq_len: usize,
    /// Per-token width of the projected text embedding (usually 64)
    pub text_dim: usize,
    /// Length of the training noise schedule; also the "fully masked" sentinel
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    /// Latent side length used when height/width are left at their defaults
    #[serde(default = "default_sample_size")]
    pub default_sample_size: usize,
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_sample_size() -> usize {
    64
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            vae_scale_factor: 8,
            clip_img_dim: 512,
            text_seq_len: 77,
            text_dim: 64,
            num_train_timesteps: 1000,
            default_sample_size: 64,
        }
    }
}

impl LatentConfig {
    /// Timestep index signalling "this modality is pure noise" to the network.
    pub fn sentinel_timestep(&self) -> i64 {
        self.num_train_timesteps as i64
    }

    pub fn default_height(&self) -> usize {
        self.default_sample_size * self.vae_scale_factor
    }

    pub fn default_width(&self) -> usize {
        self.default_sample_size * self.vae_scale_factor
    }
}

/// What the pipeline hands back for each modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Raw sub-latents, no decode pass
    Latent,
    /// Decoded pixel tensor in [0, 1] and generated caption strings
    Decoded,
}

/// Per-call sampling options.
///
/// This is the closed set of knobs recognized by
/// [`crate::pipeline::UniDiffuserPipeline::generate`]; there is no
/// catch-all parameter channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Generation task to run
    pub mode: Mode,
    /// Output image height in pixels; must divide by the VAE scale factor
    pub height: usize,
    /// Output image width in pixels; must divide by the VAE scale factor
    pub width: usize,
    /// Number of scheduler iterations
    pub num_inference_steps: usize,
    /// Classifier-free guidance weight; 0 disables the unconditioned pass
    pub guidance_scale: f64,
    /// Batch size for modes that do not infer it from an input
    pub num_samples: usize,
    /// DDIM-style eta forwarded to the scheduler step
    #[serde(default)]
    pub eta: f64,
    /// Dataset tag forwarded to the network (1 for the released checkpoints)
    #[serde(default = "default_data_type")]
    pub data_type: u32,
    /// Invoke the step callback every `callback_steps` iterations
    #[serde(default = "default_callback_steps")]
    pub callback_steps: usize,
    /// Whether to decode final latents or return them as-is
    #[serde(default = "default_output_kind")]
    pub output: OutputKind,
    /// Ask the text encoder for classifier-free (negative) embeddings when
    /// `guidance_scale > 1`. The upstream UniDiffuser pipeline computes this
    /// and then forces it off; off is therefore the default here.
    #[serde(default)]
    pub cfg_text_encoding: bool,
}

fn default_data_type() -> u32 {
    1
}

fn default_callback_steps() -> usize {
    1
}

fn default_output_kind() -> OutputKind {
    OutputKind::Decoded
}

impl SamplingConfig {
    pub fn new(mode: Mode) -> Self {
        let latent = LatentConfig::default();
        Self {
            mode,
            height: latent.default_height(),
            width: latent.default_width(),
            num_inference_steps: 50,
            guidance_scale: 7.0,
            num_samples: 1,
            eta: 0.0,
            data_type: 1,
            callback_steps: 1,
            output: OutputKind::Decoded,
            cfg_text_encoding: false,
        }
    }

    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn with_num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }

    pub fn with_output(mut self, output: OutputKind) -> Self {
        self.output = output;
        self
    }

    /// Checks the option values that do not depend on call inputs.
    pub fn validate(&self, vae_scale_factor: usize) -> Result<(), ConfigError> {
        if !self.height.is_multiple_of(vae_scale_factor)
            || !self.width.is_multiple_of(vae_scale_factor)
        {
            return Err(ConfigError::InvalidDimensions {
                height: self.height,
                width: self.width,
                factor: vae_scale_factor,
            });
        }
        if self.callback_steps == 0 {
            return Err(ConfigError::InvalidCallbackInterval);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`height` and `width` must be divisible by {factor}, got {height}x{width}")]
    InvalidDimensions {
        height: usize,
        width: usize,
        factor: usize,
    },
    #[error("`callback_steps` must be a positive integer")]
    InvalidCallbackInterval,
    #[error("got {generators} per-sample generators for a batch of {batch}")]
    GeneratorCountMismatch { generators: usize, batch: usize },
    #[error("unknown sampling mode `{0}`")]
    UnknownMode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_released_checkpoints() {
        let latent = LatentConfig::default();
        assert_eq!(latent.latent_channels, 4);
        assert_eq!(latent.clip_img_dim, 512);
        assert_eq!(latent.text_seq_len, 77);
        assert_eq!(latent.text_dim, 64);
        assert_eq!(latent.sentinel_timestep(), 1000);
        assert_eq!(latent.default_height(), 512);
    }

    #[test]
    fn validate_rejects_indivisible_dimensions() {
        let config = SamplingConfig::new(Mode::TextToImage).with_size(500, 512);
        assert!(matches!(
            config.validate(8),
            Err(ConfigError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_callback_interval() {
        let mut config = SamplingConfig::new(Mode::TextToImage);
        config.callback_steps = 0;
        assert!(matches!(
            config.validate(8),
            Err(ConfigError::InvalidCallbackInterval)
        ));
    }
}
