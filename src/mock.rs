//! Mock collaborators for running the pipeline without loaded model weights.
//!
//! Every trait in [`crate::components`] gets a deterministic, shape-faithful
//! stand-in. The mocks double as instrumentation: they count their
//! invocations and record the timesteps they were called with, which the
//! tests use to pin down the sampling contract (call counts, sentinel
//! timesteps, guidance behavior).

use std::sync::{Arc, Mutex};

use candle_core::{Result, Tensor};

use crate::components::{
    CaptionDecoder, ImageVae, JointNetwork, LatentDistribution, Scheduler, StepExtras, TextEncoder,
    VisionEncoder,
};

/// Deterministic network stub: every output channel is its input scaled by
/// `gain`, plus `masked_bias` whenever either timestep carries the sentinel.
///
/// The bias makes conditioned and unconditioned passes differ, so guidance
/// arithmetic is observable.
pub struct MockJointNetwork {
    pub gain: f64,
    pub masked_bias: f64,
    pub sentinel: i64,
    /// Total forward passes
    pub calls: usize,
    /// `(t_img, t_text)` of each forward pass, first batch element
    pub timesteps: Vec<(i64, i64)>,
}

impl MockJointNetwork {
    pub fn identity(sentinel: i64) -> Self {
        Self {
            gain: 1.0,
            masked_bias: 0.0,
            sentinel,
            calls: 0,
            timesteps: Vec::new(),
        }
    }

    pub fn with_gain(sentinel: i64, gain: f64, masked_bias: f64) -> Self {
        Self {
            gain,
            masked_bias,
            sentinel,
            calls: 0,
            timesteps: Vec::new(),
        }
    }
}

impl JointNetwork for MockJointNetwork {
    fn forward(
        &mut self,
        img_vae: &Tensor,
        img_clip: &Tensor,
        text: &Tensor,
        t_img: &Tensor,
        t_text: &Tensor,
        _data_type: u32,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let ti = t_img.to_vec1::<i64>()?[0];
        let tt = t_text.to_vec1::<i64>()?[0];
        self.calls += 1;
        self.timesteps.push((ti, tt));

        let bias = if ti == self.sentinel || tt == self.sentinel {
            self.masked_bias
        } else {
            0.0
        };
        Ok((
            img_vae.affine(self.gain, bias)?,
            img_clip.affine(self.gain, bias)?,
            text.affine(self.gain, bias)?,
        ))
    }
}

/// Linear-blend scheduler stub: `x <- (1 - blend) * x + blend * model_output`
/// over an evenly spaced descending integer schedule.
pub struct MockScheduler {
    pub num_train_timesteps: usize,
    pub blend: f64,
    pub sigma: f64,
    /// Step invocations across the scheduler's lifetime
    pub steps_taken: usize,
    /// `set_timesteps` invocations
    pub schedules_requested: usize,
}

impl MockScheduler {
    pub fn new(num_train_timesteps: usize) -> Self {
        Self {
            num_train_timesteps,
            blend: 0.5,
            sigma: 1.0,
            steps_taken: 0,
            schedules_requested: 0,
        }
    }
}

impl Scheduler for MockScheduler {
    fn order(&self) -> usize {
        1
    }

    fn init_noise_sigma(&self) -> f64 {
        self.sigma
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<Vec<i64>> {
        if num_inference_steps == 0 {
            candle_core::bail!("`num_inference_steps` must be positive");
        }
        self.schedules_requested += 1;
        let n = self.num_train_timesteps;
        Ok((0..num_inference_steps)
            .rev()
            .map(|i| ((i + 1) * n / num_inference_steps - 1) as i64)
            .collect())
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        _timestep: i64,
        sample: &Tensor,
        _extras: &mut StepExtras,
    ) -> Result<Tensor> {
        self.steps_taken += 1;
        sample
            .affine(1.0 - self.blend, 0.0)?
            .add(&model_output.affine(self.blend, 0.0)?)
    }
}

/// Shape-faithful autoencoder stub with a deterministic (zero-variance)
/// posterior: encode average-pools to the latent grid, decode
/// nearest-neighbor upsamples back.
pub struct MockImageVae {
    pub latent_channels: usize,
    pub scale_factor: usize,
    pub scaling: f64,
    pub encodes: usize,
    pub decodes: usize,
}

impl MockImageVae {
    pub fn new(latent_channels: usize, scale_factor: usize) -> Self {
        Self {
            latent_channels,
            scale_factor,
            scaling: 0.18215,
            encodes: 0,
            decodes: 0,
        }
    }
}

impl ImageVae for MockImageVae {
    fn encode(&mut self, image: &Tensor) -> Result<LatentDistribution> {
        self.encodes += 1;
        let pooled = image.avg_pool2d(self.scale_factor)?;
        // Widen 3 pixel channels to the latent channel count by cycling.
        let mut channels = Vec::with_capacity(self.latent_channels);
        for c in 0..self.latent_channels {
            channels.push(pooled.narrow(1, c % 3, 1)?);
        }
        let mean = Tensor::cat(&channels, 1)?;
        let std = mean.zeros_like()?;
        Ok(LatentDistribution::new(mean, std))
    }

    fn decode(&mut self, latents: &Tensor) -> Result<Tensor> {
        self.decodes += 1;
        let (_b, _c, h, w) = latents.dims4()?;
        latents
            .narrow(1, 0, 3)?
            .upsample_nearest2d(h * self.scale_factor, w * self.scale_factor)?
            .clamp(-1f32, 1f32)
    }

    fn scaling_factor(&self) -> f64 {
        self.scaling
    }
}

/// Embeds an image as its per-sample mean pixel value, repeated.
pub struct MockVisionEncoder {
    pub clip_img_dim: usize,
    pub embeds: usize,
}

impl MockVisionEncoder {
    pub fn new(clip_img_dim: usize) -> Self {
        Self {
            clip_img_dim,
            embeds: 0,
        }
    }
}

impl VisionEncoder for MockVisionEncoder {
    fn embed(&mut self, image: &Tensor) -> Result<Tensor> {
        self.embeds += 1;
        image
            .flatten_from(1)?
            .mean_keepdim(1)?
            .repeat((1, self.clip_img_dim))
    }
}

/// Encodes each prompt as a constant tensor derived from its length, and
/// records the classifier-free-guidance flag of every call.
pub struct MockTextEncoder {
    pub seq_len: usize,
    pub hidden_dim: usize,
    pub calls: usize,
    pub cfg_flags: Arc<Mutex<Vec<bool>>>,
}

impl MockTextEncoder {
    pub fn new(seq_len: usize, hidden_dim: usize) -> Self {
        Self {
            seq_len,
            hidden_dim,
            calls: 0,
            cfg_flags: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode(&mut self, prompts: &[String], do_classifier_free_guidance: bool) -> Result<Tensor> {
        self.calls += 1;
        self.cfg_flags
            .lock()
            .expect("cfg flag log poisoned")
            .push(do_classifier_free_guidance);

        let device = candle_core::Device::Cpu;
        let per_prompt: Vec<Tensor> = prompts
            .iter()
            .map(|p| {
                let value = 0.01 * (1 + p.len() % 97) as f64;
                Tensor::full(value as f32, (1, self.seq_len, self.hidden_dim), &device)
            })
            .collect::<Result<_>>()?;
        Tensor::cat(&per_prompt, 0)
    }
}

/// Projects hidden states by truncating the feature axis; captions report the
/// mean activation of each sample's latent.
pub struct MockCaptionDecoder {
    pub text_dim: usize,
    pub projections: usize,
    pub generations: usize,
}

impl MockCaptionDecoder {
    pub fn new(text_dim: usize) -> Self {
        Self {
            text_dim,
            projections: 0,
            generations: 0,
        }
    }
}

impl CaptionDecoder for MockCaptionDecoder {
    fn encode_prefix(&mut self, embeds: &Tensor) -> Result<Tensor> {
        self.projections += 1;
        embeds.narrow(2, 0, self.text_dim)?.contiguous()
    }

    fn generate_captions(&mut self, text_latents: &Tensor) -> Result<Vec<String>> {
        self.generations += 1;
        let batch = text_latents.dim(0)?;
        let mut captions = Vec::with_capacity(batch);
        for i in 0..batch {
            let mean = text_latents
                .narrow(0, i, 1)?
                .mean_all()?
                .to_scalar::<f32>()?;
            captions.push(format!("sample {i}: mean latent {mean:.4}"));
        }
        Ok(captions)
    }
}
