//! Joint image-text sampling pipeline.
//!
//! This module implements the mode dispatcher sitting on top of the denoising
//! loop: it validates inputs, infers the batch size, prepares the three
//! sub-latents (encoding real inputs where the mode provides them, sampling
//! noise otherwise), sequences one or two loop runs, and decodes the results.
//!
//! # Architecture Overview
//!
//! ```text
//! Prompt  → Text Encoder → prefix projection ┐
//! Image   → VAE encode + CLIP embed          ├→ LatentSet → Denoising Loop → LatentSet
//! (noise) → seeded PCG32 draws               ┘                 │
//!                                                VAE decode ← ─┴─ → caption decode
//! ```
//!
//! All models are external collaborators behind the traits in
//! [`crate::components`]; the pipeline owns them as boxed trait objects and
//! holds no other state, so independent calls never share anything mutable.

use candle_core::{Result, Tensor};
use tracing::info;

use crate::codec::{LatentCodec, LatentSet};
use crate::components::{
    CaptionDecoder, ImageVae, JointNetwork, Scheduler, TextEncoder, VisionEncoder,
};
use crate::config::{ConfigError, LatentConfig, OutputKind, SamplingConfig};
use crate::guidance::NoisePredictor;
use crate::mode::Mode;
use crate::sampler::{DenoisingLoop, StepCallback};
use crate::utils::rng::SampleRngs;

// =============================================================================
// Call inputs and outputs
// =============================================================================

/// A single prompt or a batch of prompts.
#[derive(Debug, Clone)]
pub enum PromptInput {
    Single(String),
    Batch(Vec<String>),
}

impl PromptInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            PromptInput::Single(s) => vec![s],
            PromptInput::Batch(v) => v,
        }
    }

    fn count(&self) -> usize {
        match self {
            PromptInput::Single(_) => 1,
            PromptInput::Batch(v) => v.len(),
        }
    }
}

/// Per-call data inputs. Which fields are required (or allowed) depends on
/// the mode; everything else must stay `None`.
#[derive(Debug, Clone, Default)]
pub struct SamplingInputs {
    /// Conditioning prompt for text-conditioned modes
    pub prompt: Option<PromptInput>,
    /// Pre-computed text-encoder hidden states, exclusive with `prompt`
    pub prompt_embeds: Option<Tensor>,
    /// Conditioning image `(B, 3, H, W)` in [-1, 1] for image-conditioned modes
    pub image: Option<Tensor>,
    /// Explicit initial text latent override `(B, seq, text_dim)`
    pub prompt_latents: Option<Tensor>,
    /// Explicit initial VAE latent override `(B, C, H/f, W/f)`
    pub vae_latents: Option<Tensor>,
    /// Explicit initial CLIP latent override `(B, 1, clip_img_dim)`
    pub clip_latents: Option<Tensor>,
}

impl SamplingInputs {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(PromptInput::Single(prompt.into())),
            ..Self::default()
        }
    }

    pub fn from_image(image: Tensor) -> Self {
        Self {
            image: Some(image),
            ..Self::default()
        }
    }
}

/// What a sampling call hands back; at least one field is populated.
#[derive(Debug)]
pub struct ImageTextOutput {
    /// Decoded pixels `(B, 3, H, W)` in [0, 1], or the raw VAE latents when
    /// the output kind is [`OutputKind::Latent`]
    pub images: Option<Tensor>,
    /// Generated captions, one per batch row
    pub texts: Option<Vec<String>>,
    /// Raw text latents when the output kind is [`OutputKind::Latent`]
    pub text_latents: Option<Tensor>,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Orchestrates the collaborators for all seven generation modes.
pub struct UniDiffuserPipeline<'a> {
    network: Box<dyn JointNetwork + 'a>,
    scheduler: Box<dyn Scheduler + 'a>,
    vae: Box<dyn ImageVae + 'a>,
    vision_encoder: Box<dyn VisionEncoder + 'a>,
    text_encoder: Box<dyn TextEncoder + 'a>,
    caption_decoder: Box<dyn CaptionDecoder + 'a>,
    latent: LatentConfig,
    device: candle_core::Device,
}

impl<'a> UniDiffuserPipeline<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: Box<dyn JointNetwork + 'a>,
        scheduler: Box<dyn Scheduler + 'a>,
        vae: Box<dyn ImageVae + 'a>,
        vision_encoder: Box<dyn VisionEncoder + 'a>,
        text_encoder: Box<dyn TextEncoder + 'a>,
        caption_decoder: Box<dyn CaptionDecoder + 'a>,
        latent: LatentConfig,
        device: candle_core::Device,
    ) -> Self {
        Self {
            network,
            scheduler,
            vae,
            vision_encoder,
            text_encoder,
            caption_decoder,
            latent,
            device,
        }
    }

    pub fn latent_config(&self) -> &LatentConfig {
        &self.latent
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn check_inputs(&self, config: &SamplingConfig, inputs: &SamplingInputs) -> Result<()> {
        config
            .validate(self.latent.vae_scale_factor)
            .map_err(|e| candle_core::Error::wrap(e))?;

        if config.mode.requires_text_input() {
            if inputs.prompt.is_some() && inputs.prompt_embeds.is_some() {
                candle_core::bail!("cannot forward both `prompt` and `prompt_embeds`");
            }
            if inputs.prompt.is_none() && inputs.prompt_embeds.is_none() {
                candle_core::bail!("provide either `prompt` or `prompt_embeds`");
            }
        }

        if config.mode.requires_image_input() && inputs.image.is_none() {
            candle_core::bail!("mode `{}` requires an input `image`", config.mode);
        }

        Ok(())
    }

    /// Batch size depends on the mode: `t2i` reads it off the prompt, `i2t`
    /// off the image, everything else uses the explicit sample count.
    fn infer_batch_size(
        &self,
        mode: Mode,
        inputs: &SamplingInputs,
        num_samples: usize,
    ) -> Result<usize> {
        match mode {
            Mode::TextToImage => match (&inputs.prompt, &inputs.prompt_embeds) {
                (Some(prompt), _) => Ok(prompt.count()),
                (None, Some(embeds)) => embeds.dim(0),
                (None, None) => {
                    candle_core::bail!("provide either `prompt` or `prompt_embeds`")
                }
            },
            Mode::ImageToText => inputs.image.as_ref().expect("validated").dim(0),
            _ => Ok(num_samples),
        }
    }

    // =========================================================================
    // Latent preparation
    // =========================================================================

    /// Encode the prompt and project it down to the text latent width.
    fn encode_prompt(
        &mut self,
        inputs: &SamplingInputs,
        batch_size: usize,
        do_classifier_free_guidance: bool,
    ) -> Result<Tensor> {
        let embeds = match (&inputs.prompt, &inputs.prompt_embeds) {
            (Some(prompt), None) => {
                let prompts = prompt.clone().into_vec();
                self.text_encoder
                    .encode(&prompts, do_classifier_free_guidance)?
            }
            (None, Some(embeds)) => embeds.clone(),
            _ => candle_core::bail!("provide either `prompt` or `prompt_embeds`"),
        };
        let text = self.caption_decoder.encode_prefix(&embeds)?;

        let dims = text.dims3()?;
        let expected = (batch_size, self.latent.text_seq_len, self.latent.text_dim);
        if dims != expected {
            candle_core::bail!(
                "projected prompt embedding has shape {dims:?}, expected {expected:?} \
                 (does the prompt count match the requested batch size?)"
            );
        }
        Ok(text)
    }

    /// Encode the conditioning image into its VAE latent (posterior sampled
    /// under the caller's generators, then scaled) and its CLIP embedding.
    fn encode_image(
        &mut self,
        image: &Tensor,
        batch_size: usize,
        codec: &LatentCodec,
        rngs: &mut SampleRngs,
    ) -> Result<(Tensor, Tensor)> {
        if image.dim(0)? != batch_size {
            candle_core::bail!(
                "input image has batch size {}, expected {batch_size}",
                image.dim(0)?
            );
        }

        let posterior = self.vae.encode(image)?;
        let eps = rngs.randn_batch(batch_size, &posterior.mean.dims()[1..], &self.device)?;
        let img_vae = posterior
            .sample_with(&eps)?
            .affine(self.vae.scaling_factor(), 0.0)?;
        if img_vae.dims4()? != codec.img_vae_shape(batch_size) {
            candle_core::bail!(
                "encoded VAE latent has shape {:?}, expected {:?}",
                img_vae.dims4()?,
                codec.img_vae_shape(batch_size)
            );
        }

        let embedding = self.vision_encoder.embed(image)?;
        let (embed_batch, embed_dim) = embedding.dims2()?;
        if embed_batch != batch_size || embed_dim != self.latent.clip_img_dim {
            candle_core::bail!(
                "vision embedding has shape ({embed_batch}, {embed_dim}), expected ({batch_size}, {})",
                self.latent.clip_img_dim
            );
        }
        let img_clip = embedding.unsqueeze(1)?;

        Ok((img_vae, img_clip))
    }

    /// Initial text latent: the explicit override (shape-checked) or fresh
    /// noise, either way scaled by the scheduler's initial noise sigma.
    fn prepare_text_latents(
        &self,
        batch_size: usize,
        override_latents: Option<&Tensor>,
        rngs: &mut SampleRngs,
    ) -> Result<Tensor> {
        let shape = [self.latent.text_seq_len, self.latent.text_dim];
        let latents = match override_latents {
            Some(latents) => {
                let dims = latents.dims3()?;
                if dims != (batch_size, shape[0], shape[1]) {
                    candle_core::bail!(
                        "`prompt_latents` has shape {dims:?}, expected ({batch_size}, {}, {})",
                        shape[0],
                        shape[1]
                    );
                }
                latents.clone()
            }
            None => rngs.randn_batch(batch_size, &shape, &self.device)?,
        };
        latents.affine(self.scheduler.init_noise_sigma(), 0.0)
    }

    fn prepare_image_vae_latents(
        &self,
        batch_size: usize,
        codec: &LatentCodec,
        override_latents: Option<&Tensor>,
        rngs: &mut SampleRngs,
    ) -> Result<Tensor> {
        let expected = codec.img_vae_shape(batch_size);
        let latents = match override_latents {
            Some(latents) => {
                if latents.dims4()? != expected {
                    candle_core::bail!(
                        "`vae_latents` has shape {:?}, expected {expected:?}",
                        latents.dims4()?
                    );
                }
                latents.clone()
            }
            None => rngs.randn_batch(
                batch_size,
                &[expected.1, expected.2, expected.3],
                &self.device,
            )?,
        };
        latents.affine(self.scheduler.init_noise_sigma(), 0.0)
    }

    fn prepare_image_clip_latents(
        &self,
        batch_size: usize,
        override_latents: Option<&Tensor>,
        rngs: &mut SampleRngs,
    ) -> Result<Tensor> {
        let expected = (batch_size, 1, self.latent.clip_img_dim);
        let latents = match override_latents {
            Some(latents) => {
                if latents.dims3()? != expected {
                    candle_core::bail!(
                        "`clip_latents` has shape {:?}, expected {expected:?}",
                        latents.dims3()?
                    );
                }
                latents.clone()
            }
            None => rngs.randn_batch(batch_size, &[1, self.latent.clip_img_dim], &self.device)?,
        };
        latents.affine(self.scheduler.init_noise_sigma(), 0.0)
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    /// One denoising-loop run for a single-stage mode.
    fn run_stage(
        &mut self,
        mode: Mode,
        codec: &LatentCodec,
        config: &SamplingConfig,
        init: &LatentSet,
        rngs: &mut SampleRngs,
        callback: &mut Option<StepCallback>,
    ) -> Result<LatentSet> {
        info!(
            "sampling stage `{mode}` ({} steps, guidance {})",
            config.num_inference_steps, config.guidance_scale
        );
        let mut predictor = NoisePredictor::new(
            self.network.as_mut(),
            codec,
            self.latent.sentinel_timestep(),
            config.guidance_scale,
            config.data_type,
        );
        let mut denoising = DenoisingLoop::new(
            self.scheduler.as_mut(),
            codec,
            config.eta,
            config.callback_steps,
        );
        denoising.run(
            mode,
            &mut predictor,
            init,
            config.num_inference_steps,
            rngs.primary(),
            callback.as_mut().map(|cb| &mut **cb as StepCallback),
        )
    }

    /// Run one full sampling call.
    ///
    /// Validates everything before the first network call, prepares the
    /// latent set, sequences one loop run (single-stage modes) or two
    /// (round-trip modes), and post-processes the result.
    pub fn generate(
        &mut self,
        config: &SamplingConfig,
        inputs: &SamplingInputs,
        rngs: &mut SampleRngs,
        mut callback: Option<StepCallback>,
    ) -> Result<ImageTextOutput> {
        let mode = config.mode;
        self.check_inputs(config, inputs)?;

        let batch_size = self.infer_batch_size(mode, inputs, config.num_samples)?;
        if let Some(count) = rngs.per_sample_count() {
            if count != batch_size {
                return Err(candle_core::Error::wrap(
                    ConfigError::GeneratorCountMismatch {
                        generators: count,
                        batch: batch_size,
                    },
                ));
            }
        }

        // Image-conditioned modes take their geometry from the input image.
        let (height, width) = match (mode.requires_image_input(), &inputs.image) {
            (true, Some(image)) => (image.dim(2)?, image.dim(3)?),
            _ => (config.height, config.width),
        };
        let codec = LatentCodec::new(&self.latent, height, width)
            .map_err(|e| candle_core::Error::wrap(e))?;

        let do_cfg_text_encoding = config.cfg_text_encoding && config.guidance_scale > 1.0;

        let text = if mode.requires_text_input() {
            self.encode_prompt(inputs, batch_size, do_cfg_text_encoding)?
        } else {
            self.prepare_text_latents(batch_size, inputs.prompt_latents.as_ref(), rngs)?
        };

        let (img_vae, img_clip) = if mode.requires_image_input() {
            let image = inputs.image.as_ref().expect("validated").clone();
            self.encode_image(&image, batch_size, &codec, rngs)?
        } else {
            let img_vae = self.prepare_image_vae_latents(
                batch_size,
                &codec,
                inputs.vae_latents.as_ref(),
                rngs,
            )?;
            let img_clip =
                self.prepare_image_clip_latents(batch_size, inputs.clip_latents.as_ref(), rngs)?;
            (img_vae, img_clip)
        };

        let init = LatentSet {
            img_vae,
            img_clip,
            text,
        };

        let finished = match mode {
            Mode::TextToImageToText => {
                let stage1 =
                    self.run_stage(Mode::TextToImage, &codec, config, &init, rngs, &mut callback)?;
                // The caption stage diffuses the text from scratch, conditioned
                // on the image the first stage produced.
                let text = self.prepare_text_latents(batch_size, None, rngs)?;
                let seeded = LatentSet {
                    img_vae: stage1.img_vae,
                    img_clip: stage1.img_clip,
                    text,
                };
                self.run_stage(
                    Mode::ImageToText,
                    &codec,
                    config,
                    &seeded,
                    rngs,
                    &mut callback,
                )?
            }
            Mode::ImageToTextToImage => {
                let stage1 =
                    self.run_stage(Mode::ImageToText, &codec, config, &init, rngs, &mut callback)?;
                // The image stage diffuses a new image pair from scratch,
                // conditioned on the caption the first stage produced.
                let img_vae = self.prepare_image_vae_latents(batch_size, &codec, None, rngs)?;
                let img_clip = self.prepare_image_clip_latents(batch_size, None, rngs)?;
                let seeded = LatentSet {
                    img_vae,
                    img_clip,
                    text: stage1.text,
                };
                self.run_stage(
                    Mode::TextToImage,
                    &codec,
                    config,
                    &seeded,
                    rngs,
                    &mut callback,
                )?
            }
            single_stage => {
                self.run_stage(single_stage, &codec, config, &init, rngs, &mut callback)?
            }
        };

        self.post_process(mode, config.output, finished)
    }

    // =========================================================================
    // Post-processing
    // =========================================================================

    fn post_process(
        &mut self,
        mode: Mode,
        output: OutputKind,
        finished: LatentSet,
    ) -> Result<ImageTextOutput> {
        let mut images = None;
        let mut texts = None;
        let mut text_latents = None;

        if mode.produces_image() {
            images = Some(match output {
                OutputKind::Latent => finished.img_vae.clone(),
                OutputKind::Decoded => {
                    let latents = finished
                        .img_vae
                        .affine(1.0 / self.vae.scaling_factor(), 0.0)?;
                    let pixels = self.vae.decode(&latents)?;
                    // [-1, 1] -> [0, 1]
                    pixels.affine(0.5, 0.5)?.clamp(0f32, 1f32)?
                }
            });
        }

        if mode.produces_text() {
            match output {
                OutputKind::Latent => text_latents = Some(finished.text.clone()),
                OutputKind::Decoded => {
                    texts = Some(self.caption_decoder.generate_captions(&finished.text)?)
                }
            }
        }

        Ok(ImageTextOutput {
            images,
            texts,
            text_latents,
        })
    }
}
