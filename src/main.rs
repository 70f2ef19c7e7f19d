/* ------------------------------------------------------------------ */
/* CLI entry point: train / resume / eval                             */
/* ------------------------------------------------------------------ */

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use structgpt::batch::{BatchSource, RowDataset};
use structgpt::checkpoint::{run_dir, CheckpointRecord, CKPT_FILE};
use structgpt::config::{self, ConfigPatch, RunConfig};
use structgpt::model::LogitTable;
use structgpt::rng::Rng;
use structgpt::trainer::Trainer;

#[derive(Parser)]
#[command(name = "structgpt", version, about = "Train baby GPTs on structured token-row datasets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI layer of the configuration stack; wins over profile and file values.
#[derive(Args, Debug, Clone)]
struct Overrides {
    /// Optional TOML file merged between the dataset profile and these flags
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long)]
    max_iters: Option<usize>,
    #[arg(long)]
    eval_interval: Option<usize>,
    #[arg(long)]
    seed_offset: Option<u64>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    dtype: Option<String>,
    #[arg(long)]
    compile: Option<bool>,
    #[arg(long)]
    always_save_checkpoint: Option<bool>,
    #[arg(long)]
    output_root: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
}

impl Overrides {
    fn to_patch(&self) -> ConfigPatch {
        ConfigPatch {
            batch_size: self.batch_size,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            learning_rate: self.learning_rate,
            max_iters: self.max_iters,
            eval_interval: self.eval_interval,
            seed_offset: self.seed_offset,
            device: self.device.clone(),
            dtype: self.dtype.clone(),
            compile: self.compile,
            always_save_checkpoint: self.always_save_checkpoint,
            output_root: self.output_root.clone(),
            run_id: self.run_id.clone(),
            ..ConfigPatch::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Train a dataset profile from scratch
    Train {
        /// cube_structure or puzzle_structure
        dataset: String,
        /// Directory holding <dataset>/train.bin and <dataset>/val.bin
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Resume training from a run directory's checkpoint
    Resume {
        run_dir: PathBuf,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Evaluate a run directory's checkpoint without training
    Eval {
        run_dir: PathBuf,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("structgpt=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train { dataset, data_dir, overrides } => {
            let cfg = config::resolve(&dataset, overrides.config.as_deref(), &overrides.to_patch())?;
            let out_dir = run_dir(&cfg.output_root, &cfg.run_id, chrono::Local::now());
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("cannot create run directory {}", out_dir.display()))?;
            info!(run_dir = %out_dir.display(), "new run");
            run(cfg, data_dir, out_dir, None)
        }
        Command::Resume { run_dir, data_dir, overrides } => {
            let ckpt_path = run_dir.join(CKPT_FILE);
            let record = CheckpointRecord::load(&ckpt_path)
                .with_context(|| format!("cannot load checkpoint {}", ckpt_path.display()))?;
            let cfg = config::resolve(
                &record.config.dataset_id.clone(),
                overrides.config.as_deref(),
                &overrides.to_patch(),
            )?;
            run(cfg, data_dir, run_dir, Some(record))
        }
        Command::Eval { run_dir, data_dir, overrides } => {
            let mut patch = overrides.to_patch();
            patch.eval_only = Some(true);
            let ckpt_path = run_dir.join(CKPT_FILE);
            // a missing checkpoint is reported by the trainer as
            // EvalOnlyNoCheckpointFound rather than silently evaluating a
            // fresh model
            let record = match CheckpointRecord::load(&ckpt_path) {
                Ok(rec) => Some(rec),
                Err(e) => {
                    warn!(error = %e, "no usable checkpoint");
                    None
                }
            };
            let dataset = record
                .as_ref()
                .map(|r| r.config.dataset_id.clone())
                .unwrap_or_else(|| "cube_structure".to_string());
            let cfg = config::resolve(&dataset, overrides.config.as_deref(), &patch)?;
            run(cfg, data_dir, run_dir, record)
        }
    }
}

fn run(
    cfg: RunConfig,
    data_dir: PathBuf,
    out_dir: PathBuf,
    record: Option<CheckpointRecord>,
) -> Result<()> {
    if cfg.compile {
        // acceleration is a backend concern; the reference backend runs as-is
        info!("compile requested; reference backend ignores it");
    }

    let source = RowDataset::open(&data_dir.join(&cfg.dataset_id), &cfg)
        .with_context(|| format!("cannot load dataset {}", cfg.dataset_id))?;
    info!(
        vocab = source.vocab_size(),
        seq_len = source.seq_len(),
        "dataset loaded"
    );

    let mut rng = Rng::for_run(cfg.seed_offset);
    let model = LogitTable::from_config(&cfg, source.vocab_size(), &mut rng);

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("cannot install Ctrl-C handler")?;
    }

    let mut trainer = Trainer::new(cfg, model, source, out_dir).with_interrupt(interrupt);
    if let Some(record) = &record {
        trainer.resume_from(record)?;
    }

    let summary = trainer.run()?;
    info!(
        steps = summary.final_step,
        best_val_loss = summary.best_val_loss,
        interrupted = summary.interrupted,
        "done"
    );
    Ok(())
}
