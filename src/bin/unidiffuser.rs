//! UniDiffuser sampling demo.
//!
//! Drives the full sampling pipeline end-to-end with mock collaborators, so
//! the mode dispatch, guidance and scheduler loop can be exercised without
//! model weights. Swap the mocks for real implementations of the component
//! traits to run an actual checkpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin unidiffuser -- \
//!     --mode t2i --prompt "an elephant under the sea" --output-dir out
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use tracing::info;

use candle_unidiffuser::mock::{
    MockCaptionDecoder, MockImageVae, MockJointNetwork, MockScheduler, MockTextEncoder,
    MockVisionEncoder,
};
use candle_unidiffuser::{
    LatentConfig, Mode, SampleRngs, SamplingConfig, SamplingInputs, UniDiffuserPipeline,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Joint image-text diffusion sampling (mock-model demo)"
)]
struct Args {
    /// Generation mode: joint, t2i, i2t, t, i, t2i2t, i2t2i
    #[arg(long, default_value = "t2i")]
    mode: String,

    /// Conditioning prompt for text-conditioned modes
    #[arg(long, default_value = "an elephant under the sea")]
    prompt: String,

    /// Conditioning image for image-conditioned modes
    #[arg(long)]
    image: Option<PathBuf>,

    #[arg(long, default_value_t = 512)]
    height: usize,

    #[arg(long, default_value_t = 512)]
    width: usize,

    #[arg(long, default_value_t = 20)]
    steps: usize,

    #[arg(long, default_value_t = 7.0)]
    guidance_scale: f64,

    /// Batch size for unconditional and joint modes
    #[arg(long, default_value_t = 1)]
    num_samples: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// One independent generator per sample instead of a shared one
    #[arg(long)]
    per_sample_seeds: bool,

    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
}

/// Load an image file as a `(1, 3, H, W)` tensor in [-1, 1].
fn load_image(path: &PathBuf, device: &Device) -> Result<Tensor> {
    let img = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    let data: Vec<f32> = img.into_raw().iter().map(|&v| v as f32).collect();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .contiguous()?
        .unsqueeze(0)?;
    // [0, 255] -> [-1, 1]
    Ok(tensor.affine(1.0 / 127.5, -1.0)?)
}

/// Write a `(B, 3, H, W)` tensor in [0, 1] as PNG files.
fn save_images(images: &Tensor, dir: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let (batch, _c, height, width) = images.dims4()?;
    for i in 0..batch {
        let rgb = images
            .narrow(0, i, 1)?
            .squeeze(0)?
            .affine(255.0, 0.0)?
            .to_dtype(candle_core::DType::U8)?
            .permute((1, 2, 0))?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<u8>()?;
        let path = dir.join(format!("sample_{i}.png"));
        image::RgbImage::from_raw(width as u32, height as u32, rgb)
            .context("image buffer size mismatch")?
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_unidiffuser=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let device = Device::Cpu;
    let mode: Mode = args.mode.parse()?;

    let latent = LatentConfig::default();
    let sentinel = latent.sentinel_timestep();

    let mut pipeline = UniDiffuserPipeline::new(
        Box::new(MockJointNetwork::identity(sentinel)),
        Box::new(MockScheduler::new(latent.num_train_timesteps)),
        Box::new(MockImageVae::new(
            latent.latent_channels,
            latent.vae_scale_factor,
        )),
        Box::new(MockVisionEncoder::new(latent.clip_img_dim)),
        Box::new(MockTextEncoder::new(latent.text_seq_len, 768)),
        Box::new(MockCaptionDecoder::new(latent.text_dim)),
        latent,
        device.clone(),
    );

    let config = SamplingConfig::new(mode)
        .with_size(args.height, args.width)
        .with_steps(args.steps)
        .with_guidance_scale(args.guidance_scale)
        .with_num_samples(args.num_samples);

    let mut inputs = SamplingInputs::default();
    if mode.requires_text_input() {
        inputs.prompt = Some(candle_unidiffuser::PromptInput::Single(args.prompt.clone()));
    }
    if mode.requires_image_input() {
        let path = args
            .image
            .as_ref()
            .context("image-conditioned modes require --image")?;
        inputs.image = Some(load_image(path, &device)?);
    }

    let mut rngs = if args.per_sample_seeds {
        SampleRngs::per_sample(args.seed, args.num_samples)
    } else {
        SampleRngs::seeded(args.seed)
    };

    info!("running mode `{mode}` for {} steps", args.steps);
    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;

    if let Some(images) = &output.images {
        save_images(images, &args.output_dir)?;
    }
    if let Some(texts) = &output.texts {
        for (i, text) in texts.iter().enumerate() {
            println!("caption {i}: {text}");
        }
    }

    Ok(())
}
