//! The iterative denoising loop.
//!
//! Packs the initial sub-latents once, then walks the scheduler's timestep
//! sequence: predict, step, optionally report. The loop itself is mode-blind
//! beyond pack/unpack; all per-mode behavior lives in the predictor.

use candle_core::{Result, Tensor};
use tracing::debug;

use crate::codec::{LatentCodec, LatentSet};
use crate::components::{Scheduler, StepExtras};
use crate::guidance::NoisePredictor;
use crate::mode::Mode;
use crate::utils::rng::NoiseRng;

/// Step callback: `(step_index, timestep, current_latent)`. Returning an
/// error aborts the run.
pub type StepCallback<'a> = &'a mut dyn FnMut(usize, i64, &Tensor) -> Result<()>;

/// Drives one fixed-length scheduler iteration over a packed joint latent.
pub struct DenoisingLoop<'a> {
    scheduler: &'a mut dyn Scheduler,
    codec: &'a LatentCodec,
    eta: f64,
    callback_steps: usize,
}

impl<'a> DenoisingLoop<'a> {
    pub fn new(
        scheduler: &'a mut dyn Scheduler,
        codec: &'a LatentCodec,
        eta: f64,
        callback_steps: usize,
    ) -> Self {
        Self {
            scheduler,
            codec,
            eta,
            callback_steps,
        }
    }

    /// Run `num_inference_steps` denoising iterations for a single-stage mode.
    ///
    /// `init` provides both the initial values of the diffused sub-latents and
    /// the fixed conditioning content for the others; it is returned with the
    /// diffused members replaced by their final values.
    ///
    /// The callback fires after iterations `k-1, 2k-1, ..` for interval `k`,
    /// and always after the final iteration, at most once per iteration.
    /// Errors from the network, the scheduler or the callback propagate
    /// immediately; there are no retries.
    pub fn run(
        &mut self,
        mode: Mode,
        predictor: &mut NoisePredictor,
        init: &LatentSet,
        num_inference_steps: usize,
        rng: &mut NoiseRng,
        mut callback: Option<StepCallback>,
    ) -> Result<LatentSet> {
        if mode.spec().is_none() {
            candle_core::bail!(
                "mode `{mode}` is compound; only the pipeline may sequence its stages"
            );
        }

        let mut latents = self.codec.pack(mode, init)?;
        let timesteps = self.scheduler.set_timesteps(num_inference_steps)?;

        // Multi-order solvers may hand back a longer sequence; the surplus
        // only affects progress reporting.
        let num_warmup_steps = timesteps
            .len()
            .saturating_sub(num_inference_steps * self.scheduler.order());

        for (i, &t) in timesteps.iter().enumerate() {
            let model_output = predictor.predict(mode, &latents, t, init, rng)?;

            let mut extras = StepExtras {
                eta: self.eta,
                rng: &mut *rng,
            };
            latents = self.scheduler.step(&model_output, t, &latents, &mut extras)?;

            let last = i == timesteps.len() - 1;
            if last || ((i + 1) > num_warmup_steps && (i + 1).is_multiple_of(self.scheduler.order()))
            {
                debug!("{mode}: step {}/{} (t={t})", i + 1, timesteps.len());
            }

            if let Some(cb) = callback.as_mut() {
                if (i + 1).is_multiple_of(self.callback_steps) || last {
                    cb(i, t, &latents)?;
                }
            }
        }

        self.codec.unpack(mode, &latents, init)
    }
}
