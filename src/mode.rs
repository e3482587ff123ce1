//! Generation modes and their sampling configuration records.
//!
//! Every task the sampler supports is a variant of [`Mode`]; each single-stage
//! variant maps to a fixed [`ModeSpec`] record describing which sub-latents
//! are diffused and where classifier-free guidance draws its conditioning
//! from. The noise predictor and loop controller are written once against
//! that record rather than branching on the mode by name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// The seven supported generation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Sample a paired image and caption from the joint distribution
    Joint,
    /// Text-conditioned image generation
    TextToImage,
    /// Image-conditioned caption generation
    ImageToText,
    /// Unconditional caption generation
    Text,
    /// Unconditional image generation
    Image,
    /// Round trip: generate an image from a prompt, then caption it
    TextToImageToText,
    /// Round trip: caption an image, then re-generate an image from the caption
    ImageToTextToImage,
}

/// Which sub-latents a single-stage mode runs diffusion over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffusionTarget {
    /// All three sub-latents, packed together
    Joint,
    /// The VAE/CLIP image pair
    Image,
    /// The text embedding alone
    Text,
}

/// Where the unconditioned guidance branch injects noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceSource {
    /// Marginal sampling, no guidance possible
    None,
    /// Conditioned on text; guidance replaces the text latent with noise
    Text,
    /// Conditioned on an image; guidance replaces the image pair with noise
    Image,
    /// Joint sampling; each modality is guided against the other
    Mutual,
}

/// Sampling configuration record for one single-stage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSpec {
    pub target: DiffusionTarget,
    pub guidance: GuidanceSource,
}

impl Mode {
    /// The configuration record driving the predictor and the loop, or `None`
    /// for compound modes, which only the orchestrator may sequence.
    pub fn spec(&self) -> Option<ModeSpec> {
        let spec = match self {
            Mode::Joint => ModeSpec {
                target: DiffusionTarget::Joint,
                guidance: GuidanceSource::Mutual,
            },
            Mode::TextToImage => ModeSpec {
                target: DiffusionTarget::Image,
                guidance: GuidanceSource::Text,
            },
            Mode::ImageToText => ModeSpec {
                target: DiffusionTarget::Text,
                guidance: GuidanceSource::Image,
            },
            Mode::Text => ModeSpec {
                target: DiffusionTarget::Text,
                guidance: GuidanceSource::None,
            },
            Mode::Image => ModeSpec {
                target: DiffusionTarget::Image,
                guidance: GuidanceSource::None,
            },
            Mode::TextToImageToText | Mode::ImageToTextToImage => return None,
        };
        Some(spec)
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, Mode::TextToImageToText | Mode::ImageToTextToImage)
    }

    /// Modes whose conditioning comes from a prompt or prompt embedding.
    pub fn requires_text_input(&self) -> bool {
        matches!(self, Mode::TextToImage | Mode::TextToImageToText)
    }

    /// Modes whose conditioning comes from an input image.
    pub fn requires_image_input(&self) -> bool {
        matches!(self, Mode::ImageToText | Mode::ImageToTextToImage)
    }

    /// Whether the final output of the mode includes an image.
    pub fn produces_image(&self) -> bool {
        matches!(
            self,
            Mode::Joint | Mode::TextToImage | Mode::Image | Mode::ImageToTextToImage
        )
    }

    /// Whether the final output of the mode includes text.
    pub fn produces_text(&self) -> bool {
        matches!(
            self,
            Mode::Joint | Mode::ImageToText | Mode::Text | Mode::TextToImageToText
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Joint => "joint",
            Mode::TextToImage => "t2i",
            Mode::ImageToText => "i2t",
            Mode::Text => "t",
            Mode::Image => "i",
            Mode::TextToImageToText => "t2i2t",
            Mode::ImageToTextToImage => "i2t2i",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joint" => Ok(Mode::Joint),
            "t2i" => Ok(Mode::TextToImage),
            "i2t" => Ok(Mode::ImageToText),
            "t" => Ok(Mode::Text),
            "i" => Ok(Mode::Image),
            "t2i2t" => Ok(Mode::TextToImageToText),
            "i2t2i" => Ok(Mode::ImageToTextToImage),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}
