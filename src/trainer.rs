/* ------------------------------------------------------------------ */
/* Training loop, loss estimation, run control                        */
/* ------------------------------------------------------------------ */
//
// The loop threads an explicit IterationState through each step instead of
// leaning on globals: the scheduler and the save policy are pure functions
// of state.step, so a data-parallel deployment where every worker holds
// the same step agrees on rate and saves without coordination.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{BatchPlan, BatchSource, Split};
use crate::checkpoint::{decide_save, CheckpointError, CheckpointRecord, CKPT_FILE};
use crate::config::RunConfig;
use crate::model::{ModelError, TrainableModel};
use crate::optim::OptimError;
use crate::rng::Rng;
use crate::schedule::{eval_tick, log_tick, LrSchedule};
use crate::step::{NumericalInstabilityError, StepController};

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Instability(#[from] NumericalInstabilityError),
    #[error("eval_only requested but no checkpoint was loaded (expected {path})")]
    EvalOnlyNoCheckpointFound { path: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Mutable per-process loop state. Created fresh at run start or restored
/// from a checkpoint, advanced once per optimization step, dropped at exit.
#[derive(Debug, Clone, Copy)]
pub struct IterationState {
    pub step: usize,
    /// None is the policy's NO_CHECKPOINT_YET state.
    pub best_val_loss: Option<f32>,
}

impl IterationState {
    fn fresh() -> Self {
        Self { step: 0, best_val_loss: None }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalReport {
    pub train_loss: f32,
    pub val_loss: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub final_step: usize,
    pub best_val_loss: Option<f32>,
    pub interrupted: bool,
}

pub struct Trainer<M, S> {
    cfg: RunConfig,
    model: M,
    source: S,
    controller: StepController,
    schedule: LrSchedule,
    state: IterationState,
    rng: Rng,
    out_dir: PathBuf,
    interrupt: Arc<AtomicBool>,
    resumed: bool,
}

impl<M: TrainableModel, S: BatchSource> Trainer<M, S> {
    pub fn new(cfg: RunConfig, model: M, source: S, out_dir: PathBuf) -> Self {
        let controller = StepController::new(&cfg);
        let schedule = LrSchedule::new(&cfg.optim);
        let rng = Rng::for_run(cfg.seed_offset);
        Self {
            cfg,
            model,
            source,
            controller,
            schedule,
            state: IterationState::fresh(),
            rng,
            out_dir,
            interrupt: Arc::new(AtomicBool::new(false)),
            resumed: false,
        }
    }

    /// Flag checked once per iteration; typically wired to Ctrl-C.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    /// Restore weights, optimizer moments and loop state from a checkpoint.
    pub fn resume_from(&mut self, record: &CheckpointRecord) -> Result<(), TrainError> {
        record.check_dataset(&self.cfg)?;
        self.model.import_params(&record.params)?;
        self.controller.restore_optim(record.optimizer.clone(), &mut self.model)?;
        self.state = IterationState {
            step: record.step,
            best_val_loss: Some(record.best_val_loss),
        };
        self.resumed = true;
        info!(
            step = record.step,
            best_val_loss = record.best_val_loss,
            "resumed from checkpoint"
        );
        Ok(())
    }

    /// Loss averaged over eval_iters micro-batches per split.
    pub fn estimate_loss(&mut self) -> EvalReport {
        let iters = self.cfg.schedule.eval_iters;
        let mut sums = [0.0f32; 2];
        for (slot, split) in [(0, Split::Train), (1, Split::Val)] {
            for _ in 0..iters {
                let mb = self.source.fetch_micro_batch(split, &mut self.rng);
                sums[slot] += self.model.eval_loss(&mb);
            }
        }
        EvalReport {
            train_loss: sums[0] / iters as f32,
            val_loss: sums[1] / iters as f32,
        }
    }

    pub fn run(&mut self) -> Result<Summary, TrainError> {
        if self.cfg.schedule.eval_only {
            return self.run_eval_only();
        }

        let plan = BatchPlan::from_config(&self.cfg);
        info!(
            dataset = %self.cfg.dataset_id,
            params = self.model.param_count(),
            effective_batch_size = plan.effective_batch_size(),
            tokens_per_step = plan.tokens_per_step(),
            device = %self.cfg.device_id,
            dtype = self.cfg.dtype.as_str(),
            "starting training"
        );

        let mut interrupted = false;
        let mut t0 = Instant::now();

        while self.state.step < self.cfg.schedule.max_iters {
            let step = self.state.step;
            let lr = self.schedule.lr_at(step);

            if eval_tick(step, self.cfg.schedule.eval_interval) {
                self.eval_and_maybe_save(step);
            }

            let outcome =
                self.controller
                    .run_step(&mut self.model, &self.source, &mut self.rng, lr, step)?;

            let dt = t0.elapsed();
            t0 = Instant::now();
            if outcome.skipped {
                warn!(step, loss_scale = self.controller.loss_scale(), "overflow, step skipped");
            } else if log_tick(step, self.cfg.schedule.log_interval) {
                info!(
                    step,
                    loss = outcome.loss,
                    lr = outcome.lr,
                    ms = dt.as_millis() as u64,
                    "train"
                );
            }

            self.state.step += 1;

            if self.interrupt.load(Ordering::Relaxed) {
                info!(step = self.state.step, "interrupted, flushing checkpoint");
                self.save_checkpoint();
                interrupted = true;
                break;
            }
        }

        if !interrupted {
            info!(
                best_val_loss = self.state.best_val_loss,
                steps = self.state.step,
                "training complete"
            );
        }

        Ok(Summary {
            final_step: self.state.step,
            best_val_loss: self.state.best_val_loss,
            interrupted,
        })
    }

    /// One evaluation pass, a possible save, no parameter updates.
    fn run_eval_only(&mut self) -> Result<Summary, TrainError> {
        if !self.resumed {
            return Err(TrainError::EvalOnlyNoCheckpointFound {
                path: self.out_dir.join(CKPT_FILE).display().to_string(),
            });
        }
        let report = self.estimate_loss();
        info!(
            step = self.state.step,
            train_loss = report.train_loss,
            val_loss = report.val_loss,
            "eval_only pass"
        );
        let decision = decide_save(
            self.state.best_val_loss,
            report.val_loss,
            self.cfg.schedule.always_save_checkpoint,
        );
        self.state.best_val_loss = Some(decision.best_val_loss);
        if decision.save {
            self.save_checkpoint();
        }
        Ok(Summary {
            final_step: self.state.step,
            best_val_loss: self.state.best_val_loss,
            interrupted: false,
        })
    }

    fn eval_and_maybe_save(&mut self, step: usize) {
        let report = self.estimate_loss();
        info!(
            step,
            train_loss = report.train_loss,
            val_loss = report.val_loss,
            "eval"
        );
        let decision = decide_save(
            self.state.best_val_loss,
            report.val_loss,
            self.cfg.schedule.always_save_checkpoint,
        );
        self.state.best_val_loss = Some(decision.best_val_loss);
        if decision.save {
            self.save_checkpoint();
        }
    }

    /// Blocking, durable write. A failed save is logged and training goes
    /// on: best_val_loss stays in memory, so a later healthy save still
    /// captures the right policy state.
    fn save_checkpoint(&mut self) {
        let record = CheckpointRecord {
            config: self.cfg.clone(),
            step: self.state.step,
            best_val_loss: self.state.best_val_loss.unwrap_or(f32::INFINITY),
            params: self.model.export_params(),
            optimizer: self.controller.optim_state(),
        };
        let path = self.out_dir.join(CKPT_FILE);
        match record.save(&path) {
            Ok(()) => info!(path = %path.display(), step = record.step, "checkpoint saved"),
            Err(e) => warn!(error = %e, "checkpoint save failed, continuing"),
        }
    }
}
