/* ------------------------------------------------------------------ */
/* Optimization step controller: accumulation, scaling, clipping      */
/* ------------------------------------------------------------------ */
//
// One optimizer step consumes gradient_accumulation_steps micro-batches.
// Each forward/backward contributes loss scaled by 1/accum, so the summed
// gradient equals the true large-batch gradient. Under float16 a dynamic
// loss scale is folded into the same factor and divided back out before
// clipping and the parameter update.

use thiserror::Error;
use tracing::debug;

use crate::batch::{BatchSource, Split};
use crate::config::RunConfig;
use crate::model::TrainableModel;
use crate::optim::{clip_grad_norm, AdamW, OptimError, OptimState};
use crate::ops::{global_grad_norm, scale_in_place};
use crate::rng::Rng;

#[derive(Error, Debug)]
#[error("non-finite loss at step {step}: training diverged (loss scale {scale})")]
pub struct NumericalInstabilityError {
    pub step: usize,
    pub scale: f32,
}

/* ── Dynamic loss scaling ────────────────────────────────────────── */
//
// float16 gradients underflow without scaling. Start high, halve on
// overflow (skipping that update), double again after a long clean run.

const SCALE_INIT: f32 = 65536.0; // 2^16
const SCALE_GROWTH: f32 = 2.0;
const SCALE_BACKOFF: f32 = 0.5;
const SCALE_MIN: f32 = 1.0;
const GROWTH_INTERVAL: u32 = 2000;

struct LossScaler {
    scale: f32,
    enabled: bool,
    good_steps: u32,
}

impl LossScaler {
    fn new(enabled: bool) -> Self {
        Self { scale: if enabled { SCALE_INIT } else { 1.0 }, enabled, good_steps: 0 }
    }

    fn scale(&self) -> f32 {
        self.scale
    }

    /// Halve the scale after an overflow. Returns false once the scale
    /// has bottomed out and the overflow must escalate.
    fn backoff(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.good_steps = 0;
        self.scale *= SCALE_BACKOFF;
        if self.scale < SCALE_MIN {
            return false;
        }
        debug!(scale = self.scale, "loss scale reduced after overflow");
        true
    }

    fn on_good_step(&mut self) {
        if !self.enabled {
            return;
        }
        self.good_steps += 1;
        if self.good_steps >= GROWTH_INTERVAL {
            self.scale *= SCALE_GROWTH;
            self.good_steps = 0;
            debug!(scale = self.scale, "loss scale increased");
        }
    }
}

/* ── Controller ──────────────────────────────────────────────────── */

#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    pub loss: f32,
    pub lr: f32,
    /// Pre-clip global gradient norm; None when clipping is disabled.
    pub grad_norm: Option<f32>,
    /// True when a float16 overflow discarded this step's gradients.
    pub skipped: bool,
}

pub struct StepController {
    optim: AdamW,
    scaler: LossScaler,
    grad_clip: f32,
    accum_steps: usize,
}

impl StepController {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            optim: AdamW::new(&cfg.optim),
            scaler: LossScaler::new(cfg.dtype.needs_loss_scaling()),
            grad_clip: cfg.optim.grad_clip,
            accum_steps: cfg.gradient_accumulation_steps,
        }
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.scale()
    }

    pub fn optim_state(&self) -> OptimState {
        self.optim.export()
    }

    pub fn restore_optim<M: TrainableModel>(
        &mut self,
        state: OptimState,
        model: &mut M,
    ) -> Result<(), OptimError> {
        let views = model.params();
        self.optim.import(state, &views)
    }

    /// Run one full optimization step: accumulate, unscale, clip, update.
    pub fn run_step<M, S>(
        &mut self,
        model: &mut M,
        source: &S,
        rng: &mut Rng,
        lr: f32,
        step: usize,
    ) -> Result<StepOutcome, NumericalInstabilityError>
    where
        M: TrainableModel,
        S: BatchSource + ?Sized,
    {
        model.zero_grads();

        // accumulation: each micro-pass contributes loss * scale / accum
        let micro_scale = self.scaler.scale() / self.accum_steps as f32;
        let mut loss_sum = 0.0f32;
        for _ in 0..self.accum_steps {
            let micro = source.fetch_micro_batch(Split::Train, rng);
            let loss = model.forward_backward(&micro, micro_scale);
            if !loss.is_finite() {
                return self.overflow(model, step, lr);
            }
            loss_sum += loss;
        }
        let loss = loss_sum / self.accum_steps as f32;

        let grad_norm = {
            let mut views = model.params();

            // float16 overflow can surface in the gradients alone
            if self.scaler.enabled {
                let raw_norm = global_grad_norm(views.iter().map(|p| &*p.grads));
                if !raw_norm.is_finite() {
                    drop(views);
                    return self.overflow(model, step, lr);
                }
                let inv = 1.0 / self.scaler.scale();
                if inv != 1.0 {
                    for view in views.iter_mut() {
                        scale_in_place(view.grads, inv);
                    }
                }
            }

            // grad_clip = 0 disables clipping outright: the gradients reach
            // the optimizer untouched, not rescaled by 1.0
            let grad_norm = if self.grad_clip > 0.0 {
                Some(clip_grad_norm(&mut views, self.grad_clip))
            } else {
                None
            };

            self.optim.update(&mut views, lr);
            grad_norm
        };

        self.scaler.on_good_step();
        model.zero_grads();
        Ok(StepOutcome { loss, lr, grad_norm, skipped: false })
    }

    fn overflow<M: TrainableModel>(
        &mut self,
        model: &mut M,
        step: usize,
        lr: f32,
    ) -> Result<StepOutcome, NumericalInstabilityError> {
        model.zero_grads();
        if self.scaler.backoff() {
            // retryable: the update is skipped, the next step runs at the
            // reduced scale
            Ok(StepOutcome { loss: f32::NAN, lr, grad_norm: None, skipped: true })
        } else {
            Err(NumericalInstabilityError { step, scale: self.scaler.scale() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchPlan, BatchSource, MicroBatch, RowDataset, Split};
    use crate::config::{resolve, ConfigPatch};
    use crate::model::{LogitTable, ParamState, ParamView, TrainableModel};

    fn row_source(batch_size: usize) -> RowDataset {
        let train: Vec<u16> = (0..60).map(|i| (i % 6) as u16).collect();
        let val = train.clone();
        let plan = BatchPlan { micro_batch_rows: batch_size, seq_len: 4, grad_accum_steps: 1 };
        RowDataset::from_tokens(train, val, 6, plan).unwrap()
    }

    fn cfg_with(patch: ConfigPatch) -> crate::config::RunConfig {
        resolve("cube_structure", None, &patch).unwrap()
    }

    #[test]
    fn accumulated_gradient_matches_large_batch() {
        let mb_all = row_source(8).fetch_micro_batch(Split::Train, &mut Rng::for_run(5));
        // split the 8 rows into two micro-batches of 4
        let half = 4 * mb_all.seq_len;
        let mb1 = MicroBatch {
            tokens: mb_all.tokens[..half].to_vec(),
            targets: mb_all.targets[..half].to_vec(),
            batch_size: 4,
            seq_len: mb_all.seq_len,
        };
        let mb2 = MicroBatch {
            tokens: mb_all.tokens[half..].to_vec(),
            targets: mb_all.targets[half..].to_vec(),
            batch_size: 4,
            seq_len: mb_all.seq_len,
        };

        let mut accum = LogitTable::new(6, false, &mut Rng::for_run(1));
        let mut whole = LogitTable::new(6, false, &mut Rng::for_run(1));

        accum.forward_backward(&mb1, 0.5);
        accum.forward_backward(&mb2, 0.5);
        whole.forward_backward(&mb_all, 1.0);

        let ga = accum.export_params();
        let gw = whole.export_params();
        assert_eq!(ga, gw); // weights untouched so far
        for (a, w) in accum.params().iter().zip(whole.params().iter()) {
            for (x, y) in a.grads.iter().zip(w.grads.iter()) {
                assert!((x - y).abs() < 1e-5, "{x} vs {y}");
            }
        }
    }

    #[test]
    fn zero_grad_clip_and_huge_clip_agree_exactly() {
        let cfg_off = cfg_with(ConfigPatch { grad_clip: Some(0.0), ..ConfigPatch::default() });
        let cfg_loose =
            cfg_with(ConfigPatch { grad_clip: Some(f32::MAX), ..ConfigPatch::default() });
        let source = row_source(4);

        let mut m1 = LogitTable::new(6, false, &mut Rng::for_run(2));
        let mut m2 = LogitTable::new(6, false, &mut Rng::for_run(2));
        let mut c1 = StepController::new(&cfg_off);
        let mut c2 = StepController::new(&cfg_loose);

        for step in 0..3 {
            c1.run_step(&mut m1, &source, &mut Rng::for_run(step as u64 + 10), 1e-2, step)
                .unwrap();
            c2.run_step(&mut m2, &source, &mut Rng::for_run(step as u64 + 10), 1e-2, step)
                .unwrap();
        }
        // a clip threshold that never fires and no clipping at all must be
        // indistinguishable, bit for bit
        assert_eq!(m1.export_params(), m2.export_params());
    }

    #[test]
    fn disabled_clip_reports_no_norm() {
        let cfg = cfg_with(ConfigPatch { grad_clip: Some(0.0), ..ConfigPatch::default() });
        let source = row_source(4);
        let mut model = LogitTable::new(6, false, &mut Rng::for_run(3));
        let mut ctl = StepController::new(&cfg);
        let out = ctl.run_step(&mut model, &source, &mut Rng::for_run(0), 1e-2, 0).unwrap();
        assert!(out.grad_norm.is_none());
        assert!(!out.skipped);
    }

    #[test]
    fn tight_clip_changes_the_update() {
        let cfg_tight =
            cfg_with(ConfigPatch { grad_clip: Some(1e-4), ..ConfigPatch::default() });
        let cfg_off = cfg_with(ConfigPatch { grad_clip: Some(0.0), ..ConfigPatch::default() });
        let source = row_source(4);

        let mut m1 = LogitTable::new(6, false, &mut Rng::for_run(4));
        let mut m2 = LogitTable::new(6, false, &mut Rng::for_run(4));
        let mut c1 = StepController::new(&cfg_tight);
        let mut c2 = StepController::new(&cfg_off);
        c1.run_step(&mut m1, &source, &mut Rng::for_run(0), 1e-2, 0).unwrap();
        c2.run_step(&mut m2, &source, &mut Rng::for_run(0), 1e-2, 0).unwrap();
        assert_ne!(m1.export_params(), m2.export_params());
    }

    /* float16 path: a model whose loss explodes on demand */
    struct ExplodingModel {
        explode: bool,
    }

    impl TrainableModel for ExplodingModel {
        fn forward_backward(&mut self, _b: &MicroBatch, _s: f32) -> f32 {
            if self.explode {
                f32::INFINITY
            } else {
                1.0
            }
        }
        fn eval_loss(&self, _b: &MicroBatch) -> f32 {
            1.0
        }
        fn zero_grads(&mut self) {}
        fn params(&mut self) -> Vec<ParamView<'_>> {
            Vec::new()
        }
        fn export_params(&self) -> Vec<ParamState> {
            Vec::new()
        }
        fn import_params(&mut self, _p: &[ParamState]) -> Result<(), crate::model::ModelError> {
            Ok(())
        }
        fn param_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn float16_overflow_halves_scale_and_skips() {
        let cfg = resolve("puzzle_structure", None, &ConfigPatch::default()).unwrap();
        assert!(cfg.dtype.needs_loss_scaling());
        let source = row_source(2);
        let mut model = ExplodingModel { explode: true };
        let mut ctl = StepController::new(&cfg);

        let before = ctl.loss_scale();
        let out = ctl.run_step(&mut model, &source, &mut Rng::for_run(0), 1e-3, 0).unwrap();
        assert!(out.skipped);
        assert_eq!(ctl.loss_scale(), before * 0.5);
    }

    #[test]
    fn float16_overflow_escalates_once_scale_bottoms_out() {
        let cfg = resolve("puzzle_structure", None, &ConfigPatch::default()).unwrap();
        let source = row_source(2);
        let mut model = ExplodingModel { explode: true };
        let mut ctl = StepController::new(&cfg);

        // 2^16 halves to below 1.0 after 17 overflows
        let mut failed = false;
        for step in 0..32 {
            match ctl.run_step(&mut model, &source, &mut Rng::for_run(0), 1e-3, step) {
                Ok(out) => assert!(out.skipped),
                Err(NumericalInstabilityError { .. }) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "scaler never escalated");
    }

    #[test]
    fn full_precision_overflow_is_immediately_fatal() {
        let cfg = cfg_with(ConfigPatch::default()); // cube profile: float32
        let source = row_source(2);
        let mut model = ExplodingModel { explode: true };
        let mut ctl = StepController::new(&cfg);
        let err = ctl.run_step(&mut model, &source, &mut Rng::for_run(0), 1e-3, 7);
        assert!(err.is_err());
        assert_eq!(err.unwrap_err().step, 7);
    }
}
