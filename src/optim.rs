/* ------------------------------------------------------------------ */
/* AdamW optimizer and gradient clipping                              */
/* ------------------------------------------------------------------ */
//
// AdamW step: Adam with decoupled weight decay. Decay touches only the
// parameter tensors flagged `decay` by the model (2-D and up); bias-style
// vectors are updated without it. Bias corrections are computed once per
// call, not per element.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OptimConfig;
use crate::model::ParamView;
use crate::ops::global_grad_norm;

pub const EPSILON: f32 = 1e-8;

#[derive(Error, Debug)]
pub enum OptimError {
    #[error("optimizer state does not match model: {0}")]
    StateMismatch(String),
}

/// First/second moment buffers for one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments {
    name: String,
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Serializable optimizer state, persisted inside CheckpointRecord.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimState {
    step: usize,
    moments: Vec<Moments>,
}

pub struct AdamW {
    beta1: f32,
    beta2: f32,
    weight_decay: f32,
    step: usize,
    moments: Vec<Moments>,
}

impl AdamW {
    pub fn new(cfg: &OptimConfig) -> Self {
        Self {
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            weight_decay: cfg.weight_decay,
            step: 0,
            moments: Vec::new(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// One parameter update from the accumulated (already unscaled,
    /// already clipped) gradients.
    pub fn update(&mut self, params: &mut [ParamView<'_>], lr: f32) {
        if self.moments.is_empty() {
            self.moments = params
                .iter()
                .map(|p| Moments {
                    name: p.name.to_string(),
                    m: vec![0.0; p.values.len()],
                    v: vec![0.0; p.values.len()],
                })
                .collect();
        }

        self.step += 1;
        let t = self.step as f32;
        let bc1 = 1.0 - self.beta1.powf(t);
        let bc2 = 1.0 - self.beta2.powf(t);
        let one_m_b1 = 1.0 - self.beta1;
        let one_m_b2 = 1.0 - self.beta2;

        for (view, mom) in params.iter_mut().zip(self.moments.iter_mut()) {
            debug_assert_eq!(view.name, mom.name);
            let wd = if view.decay { self.weight_decay } else { 0.0 };
            for i in 0..view.values.len() {
                let g = view.grads[i];
                mom.m[i] = self.beta1 * mom.m[i] + one_m_b1 * g;
                mom.v[i] = self.beta2 * mom.v[i] + one_m_b2 * g * g;
                let m_hat = mom.m[i] / bc1;
                let v_hat = mom.v[i] / bc2;
                view.values[i] -= lr * (m_hat / (v_hat.sqrt() + EPSILON) + wd * view.values[i]);
            }
        }
    }

    pub fn export(&self) -> OptimState {
        OptimState { step: self.step, moments: self.moments.clone() }
    }

    pub fn import(&mut self, state: OptimState, params: &[ParamView<'_>]) -> Result<(), OptimError> {
        if state.moments.len() != params.len() {
            return Err(OptimError::StateMismatch(format!(
                "{} moment buffers for {} parameters",
                state.moments.len(),
                params.len()
            )));
        }
        for (mom, view) in state.moments.iter().zip(params.iter()) {
            if mom.name != view.name || mom.m.len() != view.values.len() {
                return Err(OptimError::StateMismatch(format!(
                    "buffer {:?} ({} values) vs parameter {:?} ({} values)",
                    mom.name,
                    mom.m.len(),
                    view.name,
                    view.values.len()
                )));
            }
        }
        self.step = state.step;
        self.moments = state.moments;
        Ok(())
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the pre-clip norm. Callers must skip this entirely when
/// clipping is disabled (grad_clip = 0): the gradients are left untouched,
/// not rescaled by 1.0.
pub fn clip_grad_norm(params: &mut [ParamView<'_>], max_norm: f32) -> f32 {
    let norm = global_grad_norm(params.iter().map(|p| &*p.grads));
    if norm > max_norm {
        let scale = max_norm / norm;
        for view in params.iter_mut() {
            for g in view.grads.iter_mut() {
                *g *= scale;
            }
        }
    }
    norm
}
