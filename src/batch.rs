/* ------------------------------------------------------------------ */
/* Batch composition: row sampling and micro-batch shape              */
/* ------------------------------------------------------------------ */
//
// Token files hold fixed-width rows of u16 ids (little-endian), one row per
// recorded action sequence. Sampling is with replacement: each micro-batch
// draws batch_size independent row indices, so there is no ordering
// guarantee inside an accumulation window.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::config::RunConfig;
use crate::rng::Rng;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {len} tokens is not a multiple of the {row_width}-token row width")]
    RowWidthMismatch { path: String, len: usize, row_width: usize },
    #[error("{path} holds no rows")]
    Empty { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

/// One forward/backward pass worth of rows, flattened batch-major.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    pub tokens: Vec<u16>,
    pub targets: Vec<u16>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl MicroBatch {
    pub fn row(&self, i: usize) -> (&[u16], &[u16]) {
        let s = i * self.seq_len;
        (&self.tokens[s..s + self.seq_len], &self.targets[s..s + self.seq_len])
    }
}

/// What the engine needs from a dataset collaborator.
pub trait BatchSource {
    fn fetch_micro_batch(&self, split: Split, rng: &mut Rng) -> MicroBatch;
    fn vocab_size(&self) -> usize;
    fn seq_len(&self) -> usize;
}

/* ── Shape accounting ────────────────────────────────────────────── */

/// Derived batch geometry. The effective size, not batch_size, is the
/// statistically meaningful quantity and the one that gets logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub micro_batch_rows: usize,
    pub seq_len: usize,
    pub grad_accum_steps: usize,
}

impl BatchPlan {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            micro_batch_rows: cfg.batch_size,
            seq_len: usable_seq_len(
                cfg.block_size,
                cfg.num_tokens_row_train,
                cfg.row_terminator,
            ),
            grad_accum_steps: cfg.gradient_accumulation_steps,
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.micro_batch_rows * self.grad_accum_steps
    }

    pub fn tokens_per_step(&self) -> usize {
        self.effective_batch_size() * self.seq_len
    }
}

/// Positions a row can supply: terminator tokens are dropped and targets
/// are shifted one token right. block_size caps the rest.
fn usable_seq_len(block_size: usize, row_width: usize, row_terminator: usize) -> usize {
    block_size.min(row_width - row_terminator - 1)
}

/* ── Row-file dataset ────────────────────────────────────────────── */

pub struct RowDataset {
    train: Vec<u16>,
    val: Vec<u16>,
    row_width: usize,
    batch_size: usize,
    seq_len: usize,
    vocab: usize,
}

impl RowDataset {
    /// Load train.bin / val.bin from a data directory, checking that both
    /// files honor the configured row width exactly.
    pub fn open(dir: &Path, cfg: &RunConfig) -> Result<Self, DataError> {
        let train = read_u16_file(&dir.join("train.bin"))?;
        let val = read_u16_file(&dir.join("val.bin"))?;
        Self::from_tokens(train, val, cfg.num_tokens_row_train, BatchPlan::from_config(cfg))
    }

    pub fn from_tokens(
        train: Vec<u16>,
        val: Vec<u16>,
        row_width: usize,
        plan: BatchPlan,
    ) -> Result<Self, DataError> {
        debug_assert!(plan.seq_len + 1 <= row_width);
        check_rows("train.bin", &train, row_width)?;
        check_rows("val.bin", &val, row_width)?;
        let vocab = train
            .iter()
            .chain(val.iter())
            .map(|&t| t as usize + 1)
            .max()
            .unwrap_or(1);
        Ok(Self {
            train,
            val,
            row_width,
            batch_size: plan.micro_batch_rows,
            seq_len: plan.seq_len,
            vocab,
        })
    }

    fn tokens(&self, split: Split) -> &[u16] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        }
    }

    pub fn rows(&self, split: Split) -> usize {
        self.tokens(split).len() / self.row_width
    }
}

impl BatchSource for RowDataset {
    fn fetch_micro_batch(&self, split: Split, rng: &mut Rng) -> MicroBatch {
        let data = self.tokens(split);
        let rows = data.len() / self.row_width;
        let mut tokens = Vec::with_capacity(self.batch_size * self.seq_len);
        let mut targets = Vec::with_capacity(self.batch_size * self.seq_len);

        for _ in 0..self.batch_size {
            let row = rng.choice(rows);
            let base = row * self.row_width;
            tokens.extend_from_slice(&data[base..base + self.seq_len]);
            targets.extend_from_slice(&data[base + 1..base + 1 + self.seq_len]);
        }

        MicroBatch { tokens, targets, batch_size: self.batch_size, seq_len: self.seq_len }
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn seq_len(&self) -> usize {
        self.seq_len
    }
}

fn check_rows(path: &str, tokens: &[u16], row_width: usize) -> Result<(), DataError> {
    if tokens.len() % row_width != 0 {
        return Err(DataError::RowWidthMismatch {
            path: path.to_string(),
            len: tokens.len(),
            row_width,
        });
    }
    if tokens.is_empty() {
        return Err(DataError::Empty { path: path.to_string() });
    }
    Ok(())
}

fn read_u16_file(path: &Path) -> Result<Vec<u16>, DataError> {
    let mut raw = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .map_err(|source| DataError::Io { path: path.display().to_string(), source })?;
    Ok(raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect())
}
