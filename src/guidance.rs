//! Guided noise prediction.
//!
//! One predictor invocation produces the model output the scheduler steps on.
//! Classifier-free guidance runs the network twice: once with the real
//! conditioning, once with the conditioning modality replaced by fresh
//! standard-normal noise at the sentinel timestep, then amplifies the
//! conditioned prediction away from the unconditioned one:
//!
//! ```text
//! out = x_cond + guidance_scale * (x_cond - x_uncond)
//! ```
//!
//! For text-target modes the "noise" output is the predicted text signal;
//! same interface, different target. The two passes run sequentially and
//! observe the same input latent.

use candle_core::{Device, Result, Tensor};

use crate::codec::{LatentCodec, LatentSet};
use crate::components::JointNetwork;
use crate::mode::{DiffusionTarget, GuidanceSource, Mode};
use crate::utils::rng::NoiseRng;

/// Per-mode guided forward pass over the shared denoising network.
pub struct NoisePredictor<'a> {
    network: &'a mut dyn JointNetwork,
    codec: &'a LatentCodec,
    /// Sentinel timestep marking a modality as fully masked
    sentinel: i64,
    guidance_scale: f64,
    data_type: u32,
}

impl<'a> NoisePredictor<'a> {
    pub fn new(
        network: &'a mut dyn JointNetwork,
        codec: &'a LatentCodec,
        sentinel: i64,
        guidance_scale: f64,
        data_type: u32,
    ) -> Self {
        Self {
            network,
            codec,
            sentinel,
            guidance_scale,
            data_type,
        }
    }

    /// Predict the model output for the current scheduler latent.
    ///
    /// `cond` supplies the fixed conditioning content for modalities the mode
    /// does not diffuse; which members are read depends on the mode. Fresh
    /// unconditioned-branch noise is drawn from `rng` on every call.
    pub fn predict(
        &mut self,
        mode: Mode,
        latent: &Tensor,
        t: i64,
        cond: &LatentSet,
        rng: &mut NoiseRng,
    ) -> Result<Tensor> {
        let Some(spec) = mode.spec() else {
            candle_core::bail!("mode `{mode}` is compound; it must be sequenced by the pipeline");
        };
        match spec.target {
            DiffusionTarget::Joint => self.predict_joint(latent, t, rng),
            DiffusionTarget::Image => self.predict_image(latent, t, cond, spec.guidance, rng),
            DiffusionTarget::Text => self.predict_text(latent, t, cond, spec.guidance, rng),
        }
    }

    /// Image-target modes: the latent is the packed (VAE, CLIP) pair; text is
    /// conditioning (`t_text = 0`) or masked noise (`t_text = sentinel`).
    fn predict_image(
        &mut self,
        latent: &Tensor,
        t: i64,
        cond: &LatentSet,
        guidance: GuidanceSource,
        rng: &mut NoiseRng,
    ) -> Result<Tensor> {
        let (img_vae, img_clip) = self.codec.split(latent)?;
        let batch = img_vae.dim(0)?;
        let device = latent.device();

        let t_img = self.timestep(t, batch, device)?;
        let t_text = match guidance {
            GuidanceSource::Text => self.timestep(0, batch, device)?,
            GuidanceSource::None => self.timestep(self.sentinel, batch, device)?,
            _ => candle_core::bail!("image-target mode with unexpected guidance source"),
        };

        let (vae_out, clip_out, _text_out) = self.network.forward(
            &img_vae,
            &img_clip,
            &cond.text,
            &t_img,
            &t_text,
            self.data_type,
        )?;
        let x_out = self.codec.combine(&vae_out, &clip_out)?;

        if guidance == GuidanceSource::None || self.guidance_scale == 0.0 {
            return Ok(x_out);
        }

        // Unconditioned branch: text becomes fresh noise at the sentinel.
        let text_noise = rng.randn_like(&cond.text)?;
        let t_masked = self.timestep(self.sentinel, batch, device)?;
        let (vae_uncond, clip_uncond, _) = self.network.forward(
            &img_vae,
            &img_clip,
            &text_noise,
            &t_img,
            &t_masked,
            self.data_type,
        )?;
        let x_uncond = self.codec.combine(&vae_uncond, &clip_uncond)?;
        self.apply_guidance(&x_out, &x_uncond)
    }

    /// Text-target modes: the latent is the text embedding; the image pair is
    /// conditioning (`t_img = 0`) or masked noise (`t_img = sentinel`).
    fn predict_text(
        &mut self,
        latent: &Tensor,
        t: i64,
        cond: &LatentSet,
        guidance: GuidanceSource,
        rng: &mut NoiseRng,
    ) -> Result<Tensor> {
        let batch = latent.dim(0)?;
        let device = latent.device();

        let t_text = self.timestep(t, batch, device)?;
        let t_img = match guidance {
            GuidanceSource::Image => self.timestep(0, batch, device)?,
            GuidanceSource::None => self.timestep(self.sentinel, batch, device)?,
            _ => candle_core::bail!("text-target mode with unexpected guidance source"),
        };

        let (_, _, text_out) = self.network.forward(
            &cond.img_vae,
            &cond.img_clip,
            latent,
            &t_img,
            &t_text,
            self.data_type,
        )?;

        if guidance == GuidanceSource::None || self.guidance_scale == 0.0 {
            return Ok(text_out);
        }

        // Unconditioned branch: both image components become fresh noise.
        let vae_noise = rng.randn_like(&cond.img_vae)?;
        let clip_noise = rng.randn_like(&cond.img_clip)?;
        let t_masked = self.timestep(self.sentinel, batch, device)?;
        let (_, _, text_uncond) = self.network.forward(
            &vae_noise,
            &clip_noise,
            latent,
            &t_masked,
            &t_text,
            self.data_type,
        )?;
        self.apply_guidance(&text_out, &text_uncond)
    }

    /// Joint mode: both modalities advance at the scheduled timestep, and each
    /// is guided against a pass in which the other is masked noise. Three
    /// network calls per step when guidance is active.
    fn predict_joint(&mut self, latent: &Tensor, t: i64, rng: &mut NoiseRng) -> Result<Tensor> {
        let (img_vae, img_clip, text) = self.codec.split_joint(latent)?;
        let batch = img_vae.dim(0)?;
        let device = latent.device();

        let t_img = self.timestep(t, batch, device)?;
        let t_text = self.timestep(t, batch, device)?;

        let (vae_out, clip_out, text_out) = self.network.forward(
            &img_vae,
            &img_clip,
            &text,
            &t_img,
            &t_text,
            self.data_type,
        )?;
        let x_out = self.codec.combine_joint(&vae_out, &clip_out, &text_out)?;

        if self.guidance_scale == 0.0 {
            return Ok(x_out);
        }

        let t_masked = self.timestep(self.sentinel, batch, device)?;

        // Text guided by masking the image pair.
        let vae_noise = rng.randn_like(&img_vae)?;
        let clip_noise = rng.randn_like(&img_clip)?;
        let (_, _, text_uncond) = self.network.forward(
            &vae_noise,
            &clip_noise,
            &text,
            &t_masked,
            &t_text,
            self.data_type,
        )?;

        // Image pair guided by masking the text.
        let text_noise = rng.randn_like(&text)?;
        let (vae_uncond, clip_uncond, _) = self.network.forward(
            &img_vae,
            &img_clip,
            &text_noise,
            &t_img,
            &t_masked,
            self.data_type,
        )?;

        let x_uncond = self
            .codec
            .combine_joint(&vae_uncond, &clip_uncond, &text_uncond)?;
        self.apply_guidance(&x_out, &x_uncond)
    }

    /// `x_out + guidance_scale * (x_out - x_uncond)`
    fn apply_guidance(&self, x_out: &Tensor, x_uncond: &Tensor) -> Result<Tensor> {
        let diff = x_out.sub(x_uncond)?;
        x_out.add(&diff.affine(self.guidance_scale, 0.0)?)
    }

    fn timestep(&self, t: i64, batch: usize, device: &Device) -> Result<Tensor> {
        Tensor::full(t, (batch,), device)
    }
}
