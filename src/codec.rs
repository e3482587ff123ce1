//! Packing and unpacking of the joint latent vector.
//!
//! The shared network diffuses up to three sub-latents at once; the scheduler
//! only ever sees one tensor. [`LatentCodec`] flattens the active sub-latents
//! into a single `(B, total_dim)` row per sample and splits it back, with the
//! feature axis always ordered (image-VAE, image-CLIP, text). Both directions
//! are exact reshapes: `split(combine(a, b)) == (a, b)` elementwise.
//!
//! The VAE block is flattened in row-major channel-height-width order; the
//! CLIP and text blocks are flattened token-major. Text-only modes bypass
//! packing entirely and hand the `(B, seq, text_dim)` latent to the scheduler
//! as-is.

use candle_core::{Result, Tensor};

use crate::config::{ConfigError, LatentConfig};
use crate::mode::{DiffusionTarget, Mode};

/// The three sub-latents of one sampling call, always fully populated.
///
/// Depending on the mode, each member is either being diffused or held fixed
/// as conditioning; members that are neither hold fresh noise.
#[derive(Debug, Clone)]
pub struct LatentSet {
    /// `(B, C, H/f, W/f)` image VAE latent
    pub img_vae: Tensor,
    /// `(B, 1, clip_img_dim)` CLIP image embedding
    pub img_clip: Tensor,
    /// `(B, seq, text_dim)` projected text embedding
    pub text: Tensor,
}

/// Pack/unpack between typed sub-latents and the flat joint vector, for one
/// fixed (geometry, height, width).
#[derive(Debug, Clone)]
pub struct LatentCodec {
    channels: usize,
    latent_height: usize,
    latent_width: usize,
    clip_img_dim: usize,
    text_seq_len: usize,
    text_dim: usize,
}

impl LatentCodec {
    /// Fails before any network call if `height` or `width` does not divide
    /// by the autoencoder scale factor.
    pub fn new(
        config: &LatentConfig,
        height: usize,
        width: usize,
    ) -> std::result::Result<Self, ConfigError> {
        let factor = config.vae_scale_factor;
        if !height.is_multiple_of(factor) || !width.is_multiple_of(factor) {
            return Err(ConfigError::InvalidDimensions {
                height,
                width,
                factor,
            });
        }
        Ok(Self {
            channels: config.latent_channels,
            latent_height: height / factor,
            latent_width: width / factor,
            clip_img_dim: config.clip_img_dim,
            text_seq_len: config.text_seq_len,
            text_dim: config.text_dim,
        })
    }

    pub fn latent_height(&self) -> usize {
        self.latent_height
    }

    pub fn latent_width(&self) -> usize {
        self.latent_width
    }

    /// Flattened width of the VAE block.
    pub fn img_vae_dim(&self) -> usize {
        self.channels * self.latent_height * self.latent_width
    }

    /// Flattened width of the image pair (VAE + CLIP).
    pub fn image_dim(&self) -> usize {
        self.img_vae_dim() + self.clip_img_dim
    }

    /// Flattened width of the text block.
    pub fn text_flat_dim(&self) -> usize {
        self.text_seq_len * self.text_dim
    }

    /// Flattened width of the full joint vector.
    pub fn joint_dim(&self) -> usize {
        self.image_dim() + self.text_flat_dim()
    }

    /// Shape of the 4D VAE latent for a given batch size.
    pub fn img_vae_shape(&self, batch: usize) -> (usize, usize, usize, usize) {
        (batch, self.channels, self.latent_height, self.latent_width)
    }

    /// `(B, C, H, W)` + `(B, 1, D_clip)` -> `(B, C*H*W + D_clip)`.
    pub fn combine(&self, img_vae: &Tensor, img_clip: &Tensor) -> Result<Tensor> {
        let batch = img_vae.dim(0)?;
        let vae_flat = img_vae.reshape((batch, self.img_vae_dim()))?;
        let clip_flat = img_clip.reshape((batch, self.clip_img_dim))?;
        Tensor::cat(&[&vae_flat, &clip_flat], 1)
    }

    /// Inverse of [`combine`](Self::combine).
    pub fn split(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, dim) = x.dims2()?;
        if dim != self.image_dim() {
            candle_core::bail!(
                "image latent has width {dim}, expected {} (vae {} + clip {})",
                self.image_dim(),
                self.img_vae_dim(),
                self.clip_img_dim
            );
        }
        let img_vae = x
            .narrow(1, 0, self.img_vae_dim())?
            .contiguous()?
            .reshape(self.img_vae_shape(batch))?;
        let img_clip = x
            .narrow(1, self.img_vae_dim(), self.clip_img_dim)?
            .contiguous()?
            .reshape((batch, 1, self.clip_img_dim))?;
        Ok((img_vae, img_clip))
    }

    /// `(B, C, H, W)` + `(B, 1, D_clip)` + `(B, L, D_text)` ->
    /// `(B, C*H*W + D_clip + L*D_text)`.
    pub fn combine_joint(
        &self,
        img_vae: &Tensor,
        img_clip: &Tensor,
        text: &Tensor,
    ) -> Result<Tensor> {
        let batch = img_vae.dim(0)?;
        let vae_flat = img_vae.reshape((batch, self.img_vae_dim()))?;
        let clip_flat = img_clip.reshape((batch, self.clip_img_dim))?;
        let text_flat = text.reshape((batch, self.text_flat_dim()))?;
        Tensor::cat(&[&vae_flat, &clip_flat, &text_flat], 1)
    }

    /// Inverse of [`combine_joint`](Self::combine_joint).
    pub fn split_joint(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, dim) = x.dims2()?;
        if dim != self.joint_dim() {
            candle_core::bail!(
                "joint latent has width {dim}, expected {}",
                self.joint_dim()
            );
        }
        let img_vae = x
            .narrow(1, 0, self.img_vae_dim())?
            .contiguous()?
            .reshape(self.img_vae_shape(batch))?;
        let img_clip = x
            .narrow(1, self.img_vae_dim(), self.clip_img_dim)?
            .contiguous()?
            .reshape((batch, 1, self.clip_img_dim))?;
        let text = x
            .narrow(1, self.image_dim(), self.text_flat_dim())?
            .contiguous()?
            .reshape((batch, self.text_seq_len, self.text_dim))?;
        Ok((img_vae, img_clip, text))
    }

    /// Assemble the scheduler-facing latent for a single-stage mode.
    pub fn pack(&self, mode: Mode, set: &LatentSet) -> Result<Tensor> {
        let Some(spec) = mode.spec() else {
            candle_core::bail!("mode `{mode}` is compound and cannot be packed directly");
        };
        match spec.target {
            DiffusionTarget::Joint => self.combine_joint(&set.img_vae, &set.img_clip, &set.text),
            DiffusionTarget::Image => self.combine(&set.img_vae, &set.img_clip),
            DiffusionTarget::Text => Ok(set.text.clone()),
        }
    }

    /// Disassemble the final scheduler latent back into sub-latents. Members
    /// the mode did not diffuse are carried over from `prev` unchanged.
    pub fn unpack(&self, mode: Mode, x: &Tensor, prev: &LatentSet) -> Result<LatentSet> {
        let Some(spec) = mode.spec() else {
            candle_core::bail!("mode `{mode}` is compound and cannot be unpacked directly");
        };
        match spec.target {
            DiffusionTarget::Joint => {
                let (img_vae, img_clip, text) = self.split_joint(x)?;
                Ok(LatentSet {
                    img_vae,
                    img_clip,
                    text,
                })
            }
            DiffusionTarget::Image => {
                let (img_vae, img_clip) = self.split(x)?;
                Ok(LatentSet {
                    img_vae,
                    img_clip,
                    text: prev.text.clone(),
                })
            }
            DiffusionTarget::Text => Ok(LatentSet {
                img_vae: prev.img_vae.clone(),
                img_clip: prev.img_clip.clone(),
                text: x.clone(),
            }),
        }
    }
}
