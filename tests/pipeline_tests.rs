//! End-to-end tests for the sampling pipeline with mock collaborators.

use std::sync::{Arc, Mutex};

use candle_core::{Device, Result, Tensor};
use candle_unidiffuser::guidance::NoisePredictor;
use candle_unidiffuser::mock::{
    MockCaptionDecoder, MockImageVae, MockJointNetwork, MockScheduler, MockTextEncoder,
    MockVisionEncoder,
};
use candle_unidiffuser::sampler::DenoisingLoop;
use candle_unidiffuser::utils::rng::NoiseRng;
use candle_unidiffuser::{
    LatentCodec, LatentConfig, LatentSet, Mode, OutputKind, PromptInput, SampleRngs,
    SamplingConfig, SamplingInputs, UniDiffuserPipeline,
};

const TEXT_HIDDEN_DIM: usize = 768;

// =============================================================================
// Helper functions
// =============================================================================

fn small_latent_config() -> LatentConfig {
    LatentConfig {
        latent_channels: 4,
        vae_scale_factor: 8,
        clip_img_dim: 16,
        text_seq_len: 5,
        text_dim: 8,
        ..LatentConfig::default()
    }
}

fn build_pipeline(
    latent: LatentConfig,
) -> (UniDiffuserPipeline<'static>, Arc<Mutex<Vec<bool>>>) {
    let text_encoder = MockTextEncoder::new(latent.text_seq_len, TEXT_HIDDEN_DIM);
    let cfg_flags = text_encoder.cfg_flags.clone();
    let pipeline = UniDiffuserPipeline::new(
        Box::new(MockJointNetwork::with_gain(
            latent.sentinel_timestep(),
            0.5,
            0.0,
        )),
        Box::new(MockScheduler::new(latent.num_train_timesteps)),
        Box::new(MockImageVae::new(
            latent.latent_channels,
            latent.vae_scale_factor,
        )),
        Box::new(MockVisionEncoder::new(latent.clip_img_dim)),
        Box::new(text_encoder),
        Box::new(MockCaptionDecoder::new(latent.text_dim)),
        latent,
        Device::Cpu,
    );
    (pipeline, cfg_flags)
}

fn small_config(mode: Mode) -> SamplingConfig {
    SamplingConfig::new(mode)
        .with_size(32, 32)
        .with_steps(2)
        .with_guidance_scale(0.0)
}

fn test_image(batch: usize, height: usize, width: usize) -> Result<Tensor> {
    NoiseRng::seeded(99)
        .randn((batch, 3, height, width), &Device::Cpu)?
        .clamp(-1f32, 1f32)
}

fn tensor_values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

// =============================================================================
// End-to-end shapes
// =============================================================================

#[test]
fn t2i_produces_the_documented_latent_shapes() -> Result<()> {
    // Full-size geometry: batch 1 at 512x512 must yield a (1, 4, 64, 64) VAE
    // latent and a packed width including the (1, 1, 512) CLIP block.
    let (mut pipeline, _) = build_pipeline(LatentConfig::default());
    let config = SamplingConfig::new(Mode::TextToImage)
        .with_size(512, 512)
        .with_steps(1)
        .with_guidance_scale(0.0)
        .with_output(OutputKind::Latent);
    let inputs = SamplingInputs::from_prompt("an elephant under the sea");
    let mut rngs = SampleRngs::seeded(0);

    let mut packed_widths: Vec<usize> = Vec::new();
    let mut callback = |_i: usize, _t: i64, x: &Tensor| -> Result<()> {
        packed_widths.push(x.dim(1)?);
        Ok(())
    };
    let output = pipeline.generate(&config, &inputs, &mut rngs, Some(&mut callback))?;

    let latents = output.images.expect("image latents");
    assert_eq!(latents.dims(), &[1, 4, 64, 64]);
    // VAE block (4*64*64) + CLIP block (512).
    assert_eq!(packed_widths, vec![4 * 64 * 64 + 512]);
    assert!(output.texts.is_none());
    Ok(())
}

#[test]
fn i2t_produces_one_text_latent_per_image() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(LatentConfig::default());
    let config = SamplingConfig::new(Mode::ImageToText)
        .with_steps(1)
        .with_guidance_scale(0.0)
        .with_output(OutputKind::Latent);
    let inputs = SamplingInputs::from_image(test_image(1, 512, 512)?);
    let mut rngs = SampleRngs::seeded(0);

    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    let text_latents = output.text_latents.expect("text latents");
    assert_eq!(text_latents.dims(), &[1, 77, 64]);
    assert!(output.images.is_none());
    Ok(())
}

#[test]
fn decoded_outputs_are_pixel_range_images_and_captions() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::Joint).with_num_samples(2);
    let mut rngs = SampleRngs::seeded(1);

    let output = pipeline.generate(&config, &SamplingInputs::default(), &mut rngs, None)?;

    let images = output.images.expect("decoded images");
    assert_eq!(images.dims(), &[2, 3, 32, 32]);
    let values = tensor_values(&images);
    assert!(values.iter().all(|&v| (0.0..=1.0).contains(&v)));

    let texts = output.texts.expect("captions");
    assert_eq!(texts.len(), 2);
    Ok(())
}

#[test]
fn unconditional_modes_populate_exactly_one_side() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let mut rngs = SampleRngs::seeded(2);

    let output = pipeline.generate(
        &small_config(Mode::Text).with_num_samples(2),
        &SamplingInputs::default(),
        &mut rngs,
        None,
    )?;
    assert!(output.images.is_none());
    assert_eq!(output.texts.expect("captions").len(), 2);

    let output = pipeline.generate(
        &small_config(Mode::Image),
        &SamplingInputs::default(),
        &mut rngs,
        None,
    )?;
    assert!(output.texts.is_none());
    assert_eq!(output.images.expect("images").dims(), &[1, 3, 32, 32]);
    Ok(())
}

#[test]
fn i2t2i_round_trip_returns_an_image() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::ImageToTextToImage).with_num_samples(2);
    let inputs = SamplingInputs::from_image(test_image(2, 32, 32)?);
    let mut rngs = SampleRngs::seeded(3);

    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(output.images.expect("images").dims(), &[2, 3, 32, 32]);
    assert!(output.texts.is_none());
    Ok(())
}

// =============================================================================
// Batch size inference
// =============================================================================

#[test]
fn t2i_batch_follows_the_prompt() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImage).with_output(OutputKind::Latent);

    let inputs = SamplingInputs {
        prompt: Some(PromptInput::Batch(vec![
            "a house".to_string(),
            "a boat".to_string(),
        ])),
        ..SamplingInputs::default()
    };
    let mut rngs = SampleRngs::seeded(4);
    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(output.images.expect("latents").dim(0)?, 2);
    Ok(())
}

#[test]
fn t2i_batch_follows_the_embedding_when_no_prompt_is_given() -> Result<()> {
    let latent = small_latent_config();
    let (mut pipeline, _) = build_pipeline(latent.clone());
    let config = small_config(Mode::TextToImage).with_output(OutputKind::Latent);

    let embeds = NoiseRng::seeded(5).randn(
        (3, latent.text_seq_len, TEXT_HIDDEN_DIM),
        &Device::Cpu,
    )?;
    let inputs = SamplingInputs {
        prompt_embeds: Some(embeds),
        ..SamplingInputs::default()
    };
    let mut rngs = SampleRngs::seeded(5);
    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(output.images.expect("latents").dim(0)?, 3);
    Ok(())
}

#[test]
fn i2t_batch_follows_the_image() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::ImageToText).with_output(OutputKind::Latent);
    let inputs = SamplingInputs::from_image(test_image(3, 32, 32)?);
    let mut rngs = SampleRngs::seeded(6);

    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(output.text_latents.expect("latents").dim(0)?, 3);
    Ok(())
}

// =============================================================================
// Round-trip sequencing
// =============================================================================

#[test]
fn t2i2t_equals_manually_chained_stages() -> Result<()> {
    let latent = small_latent_config();
    let seed = 1234;
    let steps = 3;
    let sentinel = latent.sentinel_timestep();

    // Pipeline run.
    let (mut pipeline, _) = build_pipeline(latent.clone());
    let config = small_config(Mode::TextToImageToText)
        .with_steps(steps)
        .with_output(OutputKind::Latent);
    let inputs = SamplingInputs::from_prompt("a deterministic elephant");
    let mut rngs = SampleRngs::seeded(seed);
    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    let pipeline_text = output.text_latents.expect("text latents");

    // Manual chain with identical collaborators and generator stream.
    let device = Device::Cpu;
    let codec = LatentCodec::new(&latent, 32, 32).unwrap();
    let mut text_encoder = MockTextEncoder::new(latent.text_seq_len, TEXT_HIDDEN_DIM);
    let mut caption_decoder = MockCaptionDecoder::new(latent.text_dim);
    let mut network = MockJointNetwork::with_gain(sentinel, 0.5, 0.0);
    let mut scheduler = MockScheduler::new(latent.num_train_timesteps);
    let mut rngs = SampleRngs::seeded(seed);

    use candle_unidiffuser::components::{CaptionDecoder, TextEncoder};
    let embeds = text_encoder.encode(&["a deterministic elephant".to_string()], false)?;
    let text_cond = caption_decoder.encode_prefix(&embeds)?;

    let init = LatentSet {
        img_vae: rngs.randn_batch(1, &[latent.latent_channels, 4, 4], &device)?,
        img_clip: rngs.randn_batch(1, &[1, latent.clip_img_dim], &device)?,
        text: text_cond,
    };
    let stage1 = {
        let mut predictor = NoisePredictor::new(&mut network, &codec, sentinel, 0.0, 1);
        let mut denoising = DenoisingLoop::new(&mut scheduler, &codec, 0.0, 1);
        denoising.run(
            Mode::TextToImage,
            &mut predictor,
            &init,
            steps,
            rngs.primary(),
            None,
        )?
    };

    let seeded = LatentSet {
        img_vae: stage1.img_vae,
        img_clip: stage1.img_clip,
        text: rngs.randn_batch(1, &[latent.text_seq_len, latent.text_dim], &device)?,
    };
    let stage2 = {
        let mut predictor = NoisePredictor::new(&mut network, &codec, sentinel, 0.0, 1);
        let mut denoising = DenoisingLoop::new(&mut scheduler, &codec, 0.0, 1);
        denoising.run(
            Mode::ImageToText,
            &mut predictor,
            &seeded,
            steps,
            rngs.primary(),
            None,
        )?
    };

    assert_eq!(tensor_values(&pipeline_text), tensor_values(&stage2.text));
    Ok(())
}

// =============================================================================
// Reproducibility
// =============================================================================

#[test]
fn fixed_seeds_reproduce_outputs() -> Result<()> {
    let run = |seed: u64| -> Result<Vec<f32>> {
        let (mut pipeline, _) = build_pipeline(small_latent_config());
        let config = small_config(Mode::TextToImage).with_output(OutputKind::Latent);
        let inputs = SamplingInputs::from_prompt("same every time");
        let mut rngs = SampleRngs::seeded(seed);
        let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
        Ok(tensor_values(&output.images.expect("latents")))
    };

    assert_eq!(run(7)?, run(7)?);
    assert_ne!(run(7)?, run(8)?);
    Ok(())
}

// =============================================================================
// Text-encoder guidance flag
// =============================================================================

#[test]
fn text_encoder_cfg_flag_defaults_off() -> Result<()> {
    let (mut pipeline, cfg_flags) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImage).with_guidance_scale(7.0);
    let inputs = SamplingInputs::from_prompt("hello");
    let mut rngs = SampleRngs::seeded(0);

    pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(*cfg_flags.lock().unwrap(), vec![false]);
    Ok(())
}

#[test]
fn text_encoder_cfg_flag_tracks_guidance_when_enabled() -> Result<()> {
    let (mut pipeline, cfg_flags) = build_pipeline(small_latent_config());
    let mut config = small_config(Mode::TextToImage).with_guidance_scale(7.0);
    config.cfg_text_encoding = true;
    let inputs = SamplingInputs::from_prompt("hello");
    let mut rngs = SampleRngs::seeded(0);
    pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(*cfg_flags.lock().unwrap(), vec![true]);

    // Guidance at or below 1 never requests negative embeddings.
    let (mut pipeline, cfg_flags) = build_pipeline(small_latent_config());
    let mut config = small_config(Mode::TextToImage).with_guidance_scale(0.5);
    config.cfg_text_encoding = true;
    pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(*cfg_flags.lock().unwrap(), vec![false]);
    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn indivisible_dimensions_are_rejected_before_sampling() {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImage).with_size(500, 512);
    let inputs = SamplingInputs::from_prompt("hello");
    let mut rngs = SampleRngs::seeded(0);
    assert!(pipeline.generate(&config, &inputs, &mut rngs, None).is_err());
}

#[test]
fn prompt_and_embeds_are_mutually_exclusive() -> Result<()> {
    let latent = small_latent_config();
    let (mut pipeline, _) = build_pipeline(latent.clone());
    let config = small_config(Mode::TextToImage);
    let mut rngs = SampleRngs::seeded(0);

    let both = SamplingInputs {
        prompt: Some(PromptInput::Single("hello".to_string())),
        prompt_embeds: Some(NoiseRng::seeded(0).randn(
            (1, latent.text_seq_len, TEXT_HIDDEN_DIM),
            &Device::Cpu,
        )?),
        ..SamplingInputs::default()
    };
    assert!(pipeline.generate(&config, &both, &mut rngs, None).is_err());

    let neither = SamplingInputs::default();
    assert!(pipeline
        .generate(&config, &neither, &mut rngs, None)
        .is_err());
    Ok(())
}

#[test]
fn image_conditioned_modes_require_an_image() {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let mut rngs = SampleRngs::seeded(0);
    for mode in [Mode::ImageToText, Mode::ImageToTextToImage] {
        let config = small_config(mode);
        assert!(pipeline
            .generate(&config, &SamplingInputs::default(), &mut rngs, None)
            .is_err());
    }
}

#[test]
fn zero_callback_interval_is_rejected() {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let mut config = small_config(Mode::TextToImage);
    config.callback_steps = 0;
    let inputs = SamplingInputs::from_prompt("hello");
    let mut rngs = SampleRngs::seeded(0);
    assert!(pipeline.generate(&config, &inputs, &mut rngs, None).is_err());
}

#[test]
fn per_sample_generator_count_must_match_the_batch() {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImage);
    let inputs = SamplingInputs::from_prompt("hello");
    // One prompt, three generators.
    let mut rngs = SampleRngs::per_sample(0, 3);
    assert!(pipeline.generate(&config, &inputs, &mut rngs, None).is_err());
}

#[test]
fn matching_per_sample_generators_are_accepted() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImage).with_output(OutputKind::Latent);
    let inputs = SamplingInputs {
        prompt: Some(PromptInput::Batch(vec![
            "one".to_string(),
            "two".to_string(),
        ])),
        ..SamplingInputs::default()
    };
    let mut rngs = SampleRngs::per_sample(0, 2);
    let output = pipeline.generate(&config, &inputs, &mut rngs, None)?;
    assert_eq!(output.images.expect("latents").dim(0)?, 2);
    Ok(())
}

#[test]
fn wrong_shape_latent_overrides_are_rejected() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImage);
    let mut rngs = SampleRngs::seeded(0);

    // 8x8 latent grid where the 32x32 call needs 4x4.
    let inputs = SamplingInputs {
        prompt: Some(PromptInput::Single("hello".to_string())),
        vae_latents: Some(NoiseRng::seeded(0).randn((1, 4, 8, 8), &Device::Cpu)?),
        ..SamplingInputs::default()
    };
    assert!(pipeline.generate(&config, &inputs, &mut rngs, None).is_err());
    Ok(())
}

#[test]
fn compound_image_mode_rejects_mismatched_sample_count() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    // Two images but one requested sample.
    let config = small_config(Mode::ImageToTextToImage).with_num_samples(1);
    let inputs = SamplingInputs::from_image(test_image(2, 32, 32)?);
    let mut rngs = SampleRngs::seeded(0);
    assert!(pipeline.generate(&config, &inputs, &mut rngs, None).is_err());
    Ok(())
}

#[test]
fn compound_text_mode_rejects_mismatched_prompt_count() -> Result<()> {
    let (mut pipeline, _) = build_pipeline(small_latent_config());
    let config = small_config(Mode::TextToImageToText).with_num_samples(1);
    let inputs = SamplingInputs {
        prompt: Some(PromptInput::Batch(vec![
            "one".to_string(),
            "two".to_string(),
        ])),
        ..SamplingInputs::default()
    };
    let mut rngs = SampleRngs::seeded(0);
    assert!(pipeline.generate(&config, &inputs, &mut rngs, None).is_err());
    Ok(())
}
