/* ------------------------------------------------------------------ */
/* Layered run configuration: defaults → profile → file → CLI         */
/* ------------------------------------------------------------------ */
//
// The resolver merges four layers, later layers winning:
//
//   built-in defaults  →  named dataset profile  →  TOML file  →  CLI
//
// and produces one validated, immutable RunConfig. Every worker reads the
// same RunConfig; nothing mutates it after resolve().

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("token-row mismatch: num_tokens_row_train is {actual}, but \
             (1 + {state_tokens} + 1 + 1) * ({num_actions} + 1) + {row_terminator} \
             = {expected}")]
    TokenRowMismatch {
        state_tokens: usize,
        num_actions: usize,
        row_terminator: usize,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported dtype {0:?} (expected float32, bfloat16 or float16)")]
    UnsupportedDtype(String),
    #[error("unknown dataset {0:?} (expected cube_structure or puzzle_structure)")]
    UnknownDataset(String),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField { field, reason: reason.into() }
}

/* ── Numeric precision ───────────────────────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
    Bfloat16,
    Float16,
}

impl Dtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float32",
            Dtype::Bfloat16 => "bfloat16",
            Dtype::Float16 => "float16",
        }
    }

    /// float16 is the only dtype that needs dynamic loss scaling.
    pub fn needs_loss_scaling(&self) -> bool {
        matches!(self, Dtype::Float16)
    }
}

impl FromStr for Dtype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "float32" => Ok(Dtype::Float32),
            "bfloat16" => Ok(Dtype::Bfloat16),
            "float16" => Ok(Dtype::Float16),
            other => Err(ConfigError::UnsupportedDtype(other.to_string())),
        }
    }
}

/* ── Resolved configuration ──────────────────────────────────────── */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDims {
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub dropout: f32,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub grad_clip: f32,
    pub decay_lr: bool,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub min_lr: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub max_iters: usize,
    pub eval_interval: usize,
    pub eval_iters: usize,
    pub log_interval: usize,
    pub always_save_checkpoint: bool,
    pub eval_only: bool,
}

/// The immutable record every component consults. Created once by
/// `resolve()`, shared read-only for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset_id: String,
    pub seed_offset: u64,

    // token-row geometry
    pub state_tokens: usize,
    pub num_actions_train: usize,
    pub num_tokens_row_train: usize,
    /// Trailing tokens per row after the last action group (the newline,
    /// where the dataset writes one).
    pub row_terminator: usize,
    pub block_size: usize,

    // batch composition
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,

    pub model: ModelDims,
    pub optim: OptimConfig,
    pub schedule: ScheduleConfig,

    // hardware hints — opaque to the engine, passed through to the backend
    pub device_id: String,
    pub dtype: Dtype,
    pub compile: bool,

    // run-directory template inputs
    pub output_root: String,
    pub run_id: String,
}

impl RunConfig {
    /// The statistically meaningful batch size: what one optimizer step sees.
    pub fn effective_batch_size(&self, world_size: usize) -> usize {
        self.batch_size * self.gradient_accumulation_steps * world_size
    }

    /// Tokens consumed per optimizer step, for the startup banner.
    pub fn tokens_per_iter(&self) -> usize {
        self.effective_batch_size(1) * self.block_size
    }
}

/// Row width the dataset must emit: per action group one separator, the
/// state tokens, the action token and a delimiter, for the initial state
/// plus one group per action, plus any trailing terminator tokens.
pub fn expected_row_tokens(
    state_tokens: usize,
    num_actions: usize,
    row_terminator: usize,
) -> usize {
    (1 + state_tokens + 1 + 1) * (num_actions + 1) + row_terminator
}

/* ── Patch layers ────────────────────────────────────────────────── */

/// One configuration layer. Every field optional; unknown keys in the TOML
/// file are ignored rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub seed_offset: Option<u64>,

    pub state_tokens: Option<usize>,
    pub num_actions_train: Option<usize>,
    pub num_tokens_row_train: Option<usize>,
    pub row_terminator: Option<usize>,
    pub block_size: Option<usize>,

    pub batch_size: Option<usize>,
    pub gradient_accumulation_steps: Option<usize>,

    pub n_layer: Option<usize>,
    pub n_head: Option<usize>,
    pub n_embd: Option<usize>,
    pub dropout: Option<f32>,
    pub bias: Option<bool>,

    pub learning_rate: Option<f32>,
    pub weight_decay: Option<f32>,
    pub beta1: Option<f32>,
    pub beta2: Option<f32>,
    pub grad_clip: Option<f32>,
    pub decay_lr: Option<bool>,
    pub warmup_iters: Option<usize>,
    pub lr_decay_iters: Option<usize>,
    pub min_lr: Option<f32>,

    pub max_iters: Option<usize>,
    pub eval_interval: Option<usize>,
    pub eval_iters: Option<usize>,
    pub log_interval: Option<usize>,
    pub always_save_checkpoint: Option<bool>,
    pub eval_only: Option<bool>,

    pub device: Option<String>,
    pub dtype: Option<String>,
    pub compile: Option<bool>,

    pub output_root: Option<String>,
    pub run_id: Option<String>,
}

impl ConfigPatch {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/* ── Dataset profiles ────────────────────────────────────────────── */
//
// The two shipped variants live here as patches over the shared defaults,
// not as duplicated files. cube_structure rows carry a 26-token cube state,
// puzzle_structure a 16-token tile state.

fn profile(dataset_id: &str) -> Result<ConfigPatch, ConfigError> {
    match dataset_id {
        "cube_structure" => Ok(ConfigPatch {
            state_tokens: Some(26),
            num_actions_train: Some(10),
            num_tokens_row_train: Some(319),
            // cube rows carry no trailing newline token
            row_terminator: Some(0),
            block_size: Some(318),
            batch_size: Some(8),
            gradient_accumulation_steps: Some(5),
            max_iters: Some(6000),
            lr_decay_iters: Some(6000),
            dtype: Some("float32".to_string()),
            compile: Some(false),
            ..ConfigPatch::default()
        }),
        "puzzle_structure" => Ok(ConfigPatch {
            state_tokens: Some(16),
            num_actions_train: Some(5),
            num_tokens_row_train: Some(115),
            row_terminator: Some(1),
            block_size: Some(113),
            batch_size: Some(64),
            gradient_accumulation_steps: Some(5),
            n_layer: Some(4),
            n_head: Some(4),
            n_embd: Some(256),
            max_iters: Some(8000),
            lr_decay_iters: Some(8000),
            always_save_checkpoint: Some(true),
            dtype: Some("float16".to_string()),
            compile: Some(true),
            ..ConfigPatch::default()
        }),
        other => Err(ConfigError::UnknownDataset(other.to_string())),
    }
}

/* ── Resolver ────────────────────────────────────────────────────── */

// Built-in defaults. Dataset geometry is deliberately absent — only a
// profile (or explicit overrides) can supply it.
struct Draft {
    seed_offset: u64,
    state_tokens: usize,
    num_actions_train: usize,
    num_tokens_row_train: usize,
    row_terminator: usize,
    block_size: usize,
    batch_size: usize,
    gradient_accumulation_steps: usize,
    n_layer: usize,
    n_head: usize,
    n_embd: usize,
    dropout: f32,
    bias: bool,
    learning_rate: f32,
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    grad_clip: f32,
    decay_lr: bool,
    warmup_iters: usize,
    lr_decay_iters: usize,
    min_lr: f32,
    max_iters: usize,
    eval_interval: usize,
    eval_iters: usize,
    log_interval: usize,
    always_save_checkpoint: bool,
    eval_only: bool,
    device: String,
    dtype: String,
    compile: bool,
    output_root: String,
    run_id: Option<String>,
}

impl Default for Draft {
    fn default() -> Self {
        Self {
            seed_offset: 0,
            state_tokens: 0,
            num_actions_train: 0,
            num_tokens_row_train: 0,
            row_terminator: 1,
            block_size: 256,
            batch_size: 32,
            gradient_accumulation_steps: 1,
            n_layer: 6,
            n_head: 6,
            n_embd: 384,
            dropout: 0.1,
            bias: false,
            learning_rate: 1e-3,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.99,
            grad_clip: 1.0,
            decay_lr: true,
            warmup_iters: 100,
            lr_decay_iters: 5000,
            min_lr: 1e-4,
            max_iters: 5000,
            eval_interval: 250,
            eval_iters: 200,
            log_interval: 10,
            always_save_checkpoint: false,
            eval_only: false,
            device: "cuda".to_string(),
            dtype: "float32".to_string(),
            compile: false,
            output_root: "out".to_string(),
            run_id: None,
        }
    }
}

impl Draft {
    fn apply(&mut self, p: &ConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = &p.$field {
                    self.$field = v.clone();
                }
            };
        }
        take!(seed_offset);
        take!(state_tokens);
        take!(num_actions_train);
        take!(num_tokens_row_train);
        take!(row_terminator);
        take!(block_size);
        take!(batch_size);
        take!(gradient_accumulation_steps);
        take!(n_layer);
        take!(n_head);
        take!(n_embd);
        take!(dropout);
        take!(bias);
        take!(learning_rate);
        take!(weight_decay);
        take!(beta1);
        take!(beta2);
        take!(grad_clip);
        take!(decay_lr);
        take!(warmup_iters);
        take!(lr_decay_iters);
        take!(min_lr);
        take!(max_iters);
        take!(eval_interval);
        take!(eval_iters);
        take!(log_interval);
        take!(always_save_checkpoint);
        take!(eval_only);
        take!(device);
        take!(dtype);
        take!(compile);
        take!(output_root);
        if p.run_id.is_some() {
            self.run_id = p.run_id.clone();
        }
    }
}

/// Merge all layers and validate. Deterministic: identical inputs always
/// produce an identical RunConfig or the same error.
pub fn resolve(
    dataset_id: &str,
    file: Option<&Path>,
    cli: &ConfigPatch,
) -> Result<RunConfig, ConfigError> {
    let mut draft = Draft::default();
    draft.apply(&profile(dataset_id)?);
    if let Some(path) = file {
        draft.apply(&ConfigPatch::from_toml_file(path)?);
    }
    draft.apply(cli);
    validate(dataset_id, draft)
}

fn validate(dataset_id: &str, d: Draft) -> Result<RunConfig, ConfigError> {
    let expected =
        expected_row_tokens(d.state_tokens, d.num_actions_train, d.row_terminator);
    if d.num_tokens_row_train != expected {
        return Err(ConfigError::TokenRowMismatch {
            state_tokens: d.state_tokens,
            num_actions: d.num_actions_train,
            row_terminator: d.row_terminator,
            expected,
            actual: d.num_tokens_row_train,
        });
    }
    if d.block_size < 1 {
        return Err(invalid("block_size", "must be at least 1"));
    }
    if d.batch_size < 1 {
        return Err(invalid("batch_size", "must be at least 1"));
    }
    if d.gradient_accumulation_steps < 1 {
        return Err(invalid("gradient_accumulation_steps", "must be at least 1"));
    }
    if !(0.0..1.0).contains(&d.dropout) {
        return Err(invalid("dropout", format!("{} is outside [0, 1)", d.dropout)));
    }
    if d.min_lr > d.learning_rate {
        return Err(invalid(
            "min_lr",
            format!("{} exceeds learning_rate {}", d.min_lr, d.learning_rate),
        ));
    }
    if d.warmup_iters > d.lr_decay_iters {
        return Err(invalid(
            "warmup_iters",
            format!("{} exceeds lr_decay_iters {}", d.warmup_iters, d.lr_decay_iters),
        ));
    }
    if d.grad_clip < 0.0 {
        return Err(invalid("grad_clip", "must be zero (disabled) or positive"));
    }
    if d.eval_interval < 1 {
        return Err(invalid("eval_interval", "must be at least 1"));
    }
    if d.log_interval < 1 {
        return Err(invalid("log_interval", "must be at least 1"));
    }
    if d.eval_iters < 1 {
        return Err(invalid("eval_iters", "must be at least 1"));
    }
    let dtype: Dtype = d.dtype.parse()?;

    Ok(RunConfig {
        dataset_id: dataset_id.to_string(),
        seed_offset: d.seed_offset,
        state_tokens: d.state_tokens,
        num_actions_train: d.num_actions_train,
        num_tokens_row_train: d.num_tokens_row_train,
        row_terminator: d.row_terminator,
        block_size: d.block_size,
        batch_size: d.batch_size,
        gradient_accumulation_steps: d.gradient_accumulation_steps,
        model: ModelDims {
            n_layer: d.n_layer,
            n_head: d.n_head,
            n_embd: d.n_embd,
            dropout: d.dropout,
            bias: d.bias,
        },
        optim: OptimConfig {
            learning_rate: d.learning_rate,
            weight_decay: d.weight_decay,
            beta1: d.beta1,
            beta2: d.beta2,
            grad_clip: d.grad_clip,
            decay_lr: d.decay_lr,
            warmup_iters: d.warmup_iters,
            lr_decay_iters: d.lr_decay_iters,
            min_lr: d.min_lr,
        },
        schedule: ScheduleConfig {
            max_iters: d.max_iters,
            eval_interval: d.eval_interval,
            eval_iters: d.eval_iters,
            log_interval: d.log_interval,
            always_save_checkpoint: d.always_save_checkpoint,
            eval_only: d.eval_only,
        },
        device_id: d.device,
        dtype,
        compile: d.compile,
        output_root: d.output_root,
        run_id: d.run_id.unwrap_or_else(|| dataset_id.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_profile_resolves() {
        let cfg = resolve("cube_structure", None, &ConfigPatch::default()).unwrap();
        assert_eq!(cfg.num_tokens_row_train, 319);
        assert_eq!(cfg.effective_batch_size(1), 40);
        assert_eq!(cfg.dtype, Dtype::Float32);
        assert!(!cfg.compile);
    }

    #[test]
    fn puzzle_profile_resolves() {
        let cfg = resolve("puzzle_structure", None, &ConfigPatch::default()).unwrap();
        assert_eq!(cfg.num_tokens_row_train, 115);
        assert_eq!(cfg.effective_batch_size(1), 320);
        assert_eq!(cfg.dtype, Dtype::Float16);
        assert!(cfg.compile);
        assert!(cfg.schedule.always_save_checkpoint);
    }

    #[test]
    fn row_formula_matches_both_datasets() {
        assert_eq!(expected_row_tokens(26, 10, 0), 319);
        assert_eq!(expected_row_tokens(16, 5, 1), 115);
    }

    #[test]
    fn token_row_mismatch_names_the_field() {
        let cli = ConfigPatch { num_actions_train: Some(9), ..ConfigPatch::default() };
        let err = resolve("cube_structure", None, &cli).unwrap_err();
        match err {
            ConfigError::TokenRowMismatch { expected, actual, .. } => {
                assert_eq!(expected, 290);
                assert_eq!(actual, 319);
            }
            other => panic!("expected TokenRowMismatch, got {other}"),
        }
    }

    #[test]
    fn unknown_dtype_rejected() {
        let cli = ConfigPatch { dtype: Some("float64".to_string()), ..ConfigPatch::default() };
        let err = resolve("cube_structure", None, &cli).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedDtype(_)));
    }

    #[test]
    fn unknown_dataset_rejected() {
        let err = resolve("sudoku_structure", None, &ConfigPatch::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDataset(_)));
    }

    #[test]
    fn min_lr_above_peak_rejected() {
        let cli = ConfigPatch { min_lr: Some(0.5), ..ConfigPatch::default() };
        assert!(resolve("cube_structure", None, &cli).is_err());
    }

    #[test]
    fn warmup_past_decay_rejected() {
        let cli = ConfigPatch {
            warmup_iters: Some(7000),
            lr_decay_iters: Some(6000),
            ..ConfigPatch::default()
        };
        assert!(resolve("cube_structure", None, &cli).is_err());
    }

    #[test]
    fn zero_accumulation_rejected() {
        let cli = ConfigPatch {
            gradient_accumulation_steps: Some(0),
            ..ConfigPatch::default()
        };
        assert!(resolve("cube_structure", None, &cli).is_err());
    }

    #[test]
    fn dropout_of_one_rejected() {
        let cli = ConfigPatch { dropout: Some(1.0), ..ConfigPatch::default() };
        assert!(resolve("cube_structure", None, &cli).is_err());
    }

    #[test]
    fn cli_wins_over_profile() {
        let cli = ConfigPatch { batch_size: Some(4), ..ConfigPatch::default() };
        let cfg = resolve("cube_structure", None, &cli).unwrap();
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.effective_batch_size(1), 20);
    }

    #[test]
    fn unknown_toml_keys_ignored() {
        let patch: ConfigPatch =
            toml::from_str("batch_size = 2\nnum_gpus = 8\n").unwrap();
        assert_eq!(patch.batch_size, Some(2));
    }
}
