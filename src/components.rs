//! External model interfaces consumed by the sampling pipeline.
//!
//! The orchestrator never owns the numerics: the denoising network, the
//! scheduler update rule, the image autoencoder, the embedding encoders and
//! the caption decoder are all supplied by the caller behind these traits.
//! Errors from any collaborator propagate unmodified; the sampler performs
//! no retries.

use candle_core::{Result, Tensor};

use crate::utils::rng::NoiseRng;

/// The shared denoising network over all three sub-latents.
///
/// `t_img` and `t_text` are independent `(B,)` I64 timestep tensors; either
/// may carry the sentinel value (the training-schedule length) to mark its
/// modality as fully masked. The network always returns all three output
/// channels; callers discard the ones their mode does not target.
pub trait JointNetwork {
    fn forward(
        &mut self,
        img_vae: &Tensor,
        img_clip: &Tensor,
        text: &Tensor,
        t_img: &Tensor,
        t_text: &Tensor,
        data_type: u32,
    ) -> Result<(Tensor, Tensor, Tensor)>;
}

/// Per-step inputs that not every scheduler consumes.
pub struct StepExtras<'a> {
    /// DDIM-style eta; ignored by deterministic solvers
    pub eta: f64,
    /// Random source for stochastic solvers
    pub rng: &'a mut NoiseRng,
}

/// The iterative solver driving `x_t -> x_{t-1}`.
pub trait Scheduler {
    /// Solver order; used for progress granularity only.
    fn order(&self) -> usize;

    /// Standard deviation the initial noise must be scaled by.
    fn init_noise_sigma(&self) -> f64;

    /// Store the inference schedule internally and return the ordered
    /// (descending) timestep sequence.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<Vec<i64>>;

    /// One solver update on the current sample.
    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: i64,
        sample: &Tensor,
        extras: &mut StepExtras,
    ) -> Result<Tensor>;
}

/// Diagonal Gaussian returned by the image autoencoder's encode pass.
///
/// The caller samples it with its own random source so that encoding stays
/// reproducible under a fixed seed.
pub struct LatentDistribution {
    pub mean: Tensor,
    pub std: Tensor,
}

impl LatentDistribution {
    pub fn new(mean: Tensor, std: Tensor) -> Self {
        Self { mean, std }
    }

    /// `mean + std * eps` with `eps ~ N(0, 1)` drawn from `rng`.
    pub fn sample(&self, rng: &mut NoiseRng) -> Result<Tensor> {
        let eps = rng.randn_like(&self.mean)?;
        self.mean.add(&self.std.mul(&eps)?)
    }

    /// `mean + std * eps` for a caller-supplied `eps` of matching shape.
    pub fn sample_with(&self, eps: &Tensor) -> Result<Tensor> {
        self.mean.add(&self.std.mul(eps)?)
    }
}

/// Image autoencoder pair.
pub trait ImageVae {
    /// `(B, 3, H, W)` pixels in [-1, 1] to a latent posterior over
    /// `(B, C, H/f, W/f)`.
    fn encode(&mut self, image: &Tensor) -> Result<LatentDistribution>;

    /// `(B, C, H/f, W/f)` latents (already un-scaled) to `(B, 3, H, W)`
    /// pixels in [-1, 1].
    fn decode(&mut self, latents: &Tensor) -> Result<Tensor>;

    /// Factor applied to sampled latents after encode and divided out before
    /// decode.
    fn scaling_factor(&self) -> f64;
}

/// CLIP-style image embedder.
pub trait VisionEncoder {
    /// `(B, 3, H, W)` pixels to a `(B, clip_img_dim)` embedding.
    fn embed(&mut self, image: &Tensor) -> Result<Tensor>;
}

/// Text encoder producing hidden states for prompt conditioning.
///
/// Tokenization lives behind this trait. `do_classifier_free_guidance`
/// requests additional negative-prompt embeddings; implementations may
/// ignore it.
pub trait TextEncoder {
    fn encode(&mut self, prompts: &[String], do_classifier_free_guidance: bool) -> Result<Tensor>;
}

/// Caption model: projects encoder hidden states down to the text latent
/// width, and decodes finished text latents into strings.
pub trait CaptionDecoder {
    /// `(B, seq, hidden)` to `(B, seq, text_dim)`.
    fn encode_prefix(&mut self, embeds: &Tensor) -> Result<Tensor>;

    /// One caption per batch row.
    fn generate_captions(&mut self, text_latents: &Tensor) -> Result<Vec<String>>;
}
