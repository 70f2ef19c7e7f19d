/* ------------------------------------------------------------------ */
/* Model seam: parameter views, state export, reference backend       */
/* ------------------------------------------------------------------ */
//
// The transformer proper lives outside this crate. The engine only needs a
// way to run forward/backward over a micro-batch, to walk the parameter and
// gradient buffers, and to snapshot/restore weights for checkpoints —
// that's the TrainableModel trait.
//
// LogitTable is the shipped reference backend: a next-token logit table
// (one logit row per current token). It is enough to overfit the synthetic
// row datasets and to drive the engine end to end; it implements none of
// the attention stack on purpose.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::MicroBatch;
use crate::config::RunConfig;
use crate::ops::{cross_entropy_loss, softmax_fwd};
use crate::rng::Rng;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("checkpoint does not match model: {0}")]
    ParamMismatch(String),
}

/// Mutable window onto one parameter tensor and its gradient buffer.
///
/// `decay` carries the optimizer's weight-decay classification: true for
/// 2-D+ tensors, false for vectors (biases, norm scales). The model owns
/// this decision; the optimizer just obeys it.
pub struct ParamView<'a> {
    pub name: &'static str,
    pub values: &'a mut [f32],
    pub grads: &'a mut [f32],
    pub decay: bool,
}

/// Serializable snapshot of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamState {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

pub trait TrainableModel {
    /// One forward/backward pass. Returns the mean (unscaled) loss over the
    /// micro-batch; gradients accumulate into the model's buffers scaled by
    /// `loss_scale` — the step controller folds 1/accum and any float16
    /// loss scale into that factor.
    fn forward_backward(&mut self, batch: &MicroBatch, loss_scale: f32) -> f32;

    /// Mean loss without touching gradients (dropout off).
    fn eval_loss(&self, batch: &MicroBatch) -> f32;

    fn zero_grads(&mut self);

    /// Parameter/gradient windows in a stable order.
    fn params(&mut self) -> Vec<ParamView<'_>>;

    fn export_params(&self) -> Vec<ParamState>;
    fn import_params(&mut self, params: &[ParamState]) -> Result<(), ModelError>;

    fn param_count(&self) -> usize;
}

/* ── Reference backend ───────────────────────────────────────────── */

pub struct LogitTable {
    vocab: usize,
    table: Vec<f32>,        // vocab × vocab, row = current token
    bias: Option<Vec<f32>>, // vocab, present iff config bias = true
    d_table: Vec<f32>,
    d_bias: Option<Vec<f32>>,
}

impl LogitTable {
    pub fn new(vocab: usize, with_bias: bool, rng: &mut Rng) -> Self {
        let table: Vec<f32> = (0..vocab * vocab).map(|_| rng.gauss(0.0, 0.02)).collect();
        Self {
            vocab,
            table,
            bias: with_bias.then(|| vec![0.0; vocab]),
            d_table: vec![0.0; vocab * vocab],
            d_bias: with_bias.then(|| vec![0.0; vocab]),
        }
    }

    pub fn from_config(cfg: &RunConfig, vocab: usize, rng: &mut Rng) -> Self {
        Self::new(vocab, cfg.model.bias, rng)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn logits_for(&self, token: u16, out: &mut [f32]) {
        let base = token as usize * self.vocab;
        out.copy_from_slice(&self.table[base..base + self.vocab]);
        if let Some(bias) = &self.bias {
            for (o, b) in out.iter_mut().zip(bias.iter()) {
                *o += b;
            }
        }
    }

    fn row_loss(&self, x: &[u16], y: &[u16]) -> f32 {
        let mut logits = vec![0.0f32; self.vocab];
        let mut probs = vec![0.0f32; self.vocab];
        let mut loss = 0.0f32;
        for (&tok, &target) in x.iter().zip(y.iter()) {
            self.logits_for(tok, &mut logits);
            softmax_fwd(&logits, &mut probs);
            loss += cross_entropy_loss(&probs, target as usize);
        }
        loss
    }
}

struct RowGrads {
    d_table: Vec<f32>,
    d_bias: Option<Vec<f32>>,
    loss: f32,
}

impl TrainableModel for LogitTable {
    fn forward_backward(&mut self, batch: &MicroBatch, loss_scale: f32) -> f32 {
        let positions = (batch.batch_size * batch.seq_len) as f32;
        // gradient of the mean loss, pre-multiplied by the controller's scale
        let grad_scale = loss_scale / positions;

        // per-row forward/backward in parallel, sequential aggregation
        let this = &*self;
        let results: Vec<RowGrads> = (0..batch.batch_size)
            .into_par_iter()
            .map(|i| {
                let (x, y) = batch.row(i);
                let mut logits = vec![0.0f32; this.vocab];
                let mut probs = vec![0.0f32; this.vocab];
                let mut d_table = vec![0.0f32; this.vocab * this.vocab];
                let mut d_bias = this.bias.as_ref().map(|_| vec![0.0f32; this.vocab]);
                let mut loss = 0.0f32;

                for (&tok, &target) in x.iter().zip(y.iter()) {
                    this.logits_for(tok, &mut logits);
                    softmax_fwd(&logits, &mut probs);
                    loss += cross_entropy_loss(&probs, target as usize);

                    // d_logits = probs - one_hot(target)
                    let base = tok as usize * this.vocab;
                    for v in 0..this.vocab {
                        let mut d = probs[v];
                        if v == target as usize {
                            d -= 1.0;
                        }
                        d *= grad_scale;
                        d_table[base + v] += d;
                        if let Some(db) = d_bias.as_mut() {
                            db[v] += d;
                        }
                    }
                }

                RowGrads { d_table, d_bias, loss }
            })
            .collect();

        let mut total_loss = 0.0f32;
        for r in results {
            total_loss += r.loss;
            for (g, rg) in self.d_table.iter_mut().zip(r.d_table.iter()) {
                *g += rg;
            }
            if let (Some(db), Some(rdb)) = (self.d_bias.as_mut(), r.d_bias.as_ref()) {
                for (g, rg) in db.iter_mut().zip(rdb.iter()) {
                    *g += rg;
                }
            }
        }

        total_loss / positions
    }

    fn eval_loss(&self, batch: &MicroBatch) -> f32 {
        let positions = (batch.batch_size * batch.seq_len) as f32;
        let total: f32 = (0..batch.batch_size)
            .into_par_iter()
            .map(|i| {
                let (x, y) = batch.row(i);
                self.row_loss(x, y)
            })
            .sum();
        total / positions
    }

    fn zero_grads(&mut self) {
        self.d_table.fill(0.0);
        if let Some(db) = self.d_bias.as_mut() {
            db.fill(0.0);
        }
    }

    fn params(&mut self) -> Vec<ParamView<'_>> {
        let mut views = vec![ParamView {
            name: "table",
            values: &mut self.table,
            grads: &mut self.d_table,
            decay: true, // 2-D
        }];
        if let (Some(bias), Some(d_bias)) = (self.bias.as_mut(), self.d_bias.as_mut()) {
            views.push(ParamView {
                name: "bias",
                values: bias,
                grads: d_bias,
                decay: false, // 1-D
            });
        }
        views
    }

    fn export_params(&self) -> Vec<ParamState> {
        let mut out = vec![ParamState {
            name: "table".to_string(),
            shape: vec![self.vocab, self.vocab],
            data: self.table.clone(),
        }];
        if let Some(bias) = &self.bias {
            out.push(ParamState {
                name: "bias".to_string(),
                shape: vec![self.vocab],
                data: bias.clone(),
            });
        }
        out
    }

    fn import_params(&mut self, params: &[ParamState]) -> Result<(), ModelError> {
        for p in params {
            match p.name.as_str() {
                "table" => {
                    if p.data.len() != self.table.len() {
                        return Err(ModelError::ParamMismatch(format!(
                            "table has {} values, expected {}",
                            p.data.len(),
                            self.table.len()
                        )));
                    }
                    self.table.copy_from_slice(&p.data);
                }
                "bias" => {
                    let bias = self.bias.as_mut().ok_or_else(|| {
                        ModelError::ParamMismatch("checkpoint has a bias, model does not".into())
                    })?;
                    if p.data.len() != bias.len() {
                        return Err(ModelError::ParamMismatch(format!(
                            "bias has {} values, expected {}",
                            p.data.len(),
                            bias.len()
                        )));
                    }
                    bias.copy_from_slice(&p.data);
                }
                other => {
                    return Err(ModelError::ParamMismatch(format!(
                        "unexpected parameter {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn param_count(&self) -> usize {
        self.table.len() + self.bias.as_ref().map_or(0, Vec::len)
    }
}
