//! Explicit, seedable random sources for latent preparation.
//!
//! Sampling reproducibility hinges on every random draw flowing through a
//! caller-owned generator rather than process-wide state. [`NoiseRng`] is a
//! PCG32 generator with Box-Muller Gaussian output; [`SampleRngs`] mirrors the
//! "one generator, or one generator per sample" contract of the reference
//! pipelines.

use candle_core::{Device, Result, Tensor};

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const DEFAULT_STREAM: u64 = 0xda3e39cb94b95bdb;

/// PCG32 (XSH-RR) random number generator producing Gaussian noise tensors.
pub struct NoiseRng {
    state: u64,
    inc: u64,
}

impl NoiseRng {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Seed with the default stream constant.
    pub fn seeded(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate.wrapping_mul(PCG_MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        (xorshifted >> rot) | (xorshifted << ((0u32).wrapping_sub(rot) & 31))
    }

    fn next_f32(&mut self) -> f32 {
        // 2^-24
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Two standard normal samples via the Box-Muller transform.
    fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let z0 = mag * (2.0 * std::f32::consts::PI * u2).cos();
        let z1 = mag * (2.0 * std::f32::consts::PI * u2).sin();
        (z0, z1)
    }

    /// Standard-normal tensor of the given shape.
    pub fn randn(&mut self, shape: impl Into<candle_core::Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count);

        let mut i = 0;
        while i < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            if i + 1 < elem_count {
                data.push(z1);
            }
            i += 2;
        }

        Tensor::from_vec(data, shape, device)
    }

    /// Standard-normal tensor matching `reference` in shape, device and dtype.
    pub fn randn_like(&mut self, reference: &Tensor) -> Result<Tensor> {
        self.randn(reference.shape().clone(), reference.device())?
            .to_dtype(reference.dtype())
    }
}

/// Either one shared generator for the whole batch, or one per sample.
///
/// Per-sample generators make each sample's noise stream independent of the
/// batch size it is generated in.
pub enum SampleRngs {
    Shared(NoiseRng),
    PerSample(Vec<NoiseRng>),
}

impl SampleRngs {
    pub fn seeded(seed: u64) -> Self {
        SampleRngs::Shared(NoiseRng::seeded(seed))
    }

    /// One generator per sample, seeded `seed, seed+1, ..`.
    pub fn per_sample(seed: u64, count: usize) -> Self {
        SampleRngs::PerSample(
            (0..count as u64)
                .map(|i| NoiseRng::seeded(seed.wrapping_add(i)))
                .collect(),
        )
    }

    /// Number of per-sample generators, if that variant is in use.
    pub fn per_sample_count(&self) -> Option<usize> {
        match self {
            SampleRngs::Shared(_) => None,
            SampleRngs::PerSample(v) => Some(v.len()),
        }
    }

    /// Generator used for draws that are not tied to a specific sample
    /// (unconditioned-branch noise, stochastic scheduler steps).
    pub fn primary(&mut self) -> &mut NoiseRng {
        match self {
            SampleRngs::Shared(rng) => rng,
            SampleRngs::PerSample(v) => &mut v[0],
        }
    }

    /// Standard-normal batch of shape `[batch] + sample_shape`, drawing each
    /// sample from its own generator when per-sample generators are in use.
    pub fn randn_batch(
        &mut self,
        batch: usize,
        sample_shape: &[usize],
        device: &Device,
    ) -> Result<Tensor> {
        let mut shape = Vec::with_capacity(sample_shape.len() + 1);
        shape.push(batch);
        shape.extend_from_slice(sample_shape);

        match self {
            SampleRngs::Shared(rng) => rng.randn(shape.as_slice(), device),
            SampleRngs::PerSample(rngs) => {
                if rngs.len() != batch {
                    candle_core::bail!(
                        "got {} per-sample generators for a batch of {batch}",
                        rngs.len()
                    );
                }
                shape[0] = 1;
                let per_sample: Vec<Tensor> = rngs
                    .iter_mut()
                    .map(|rng| rng.randn(shape.as_slice(), device))
                    .collect::<Result<_>>()?;
                Tensor::cat(&per_sample, 0)
            }
        }
    }
}
