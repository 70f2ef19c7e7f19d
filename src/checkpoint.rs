/* ------------------------------------------------------------------ */
/* Checkpoint record, atomic persistence, and save policy             */
/* ------------------------------------------------------------------ */
//
// File format:
//   [0..8]  magic  b"SGPT0001"
//   [8..]   bincode-encoded CheckpointRecord
//
// Writes are atomic (tmp file + fsync + rename) and block the training
// loop until the bytes are durable: losing best_val_loss on a crash would
// corrupt the save-on-improvement policy.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunConfig;
use crate::model::ParamState;
use crate::optim::OptimState;

pub const CKPT_FILE: &str = "ckpt.bin";
const MAGIC: &[u8; 8] = b"SGPT0001";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("{path} is not a structgpt checkpoint (bad magic bytes)")]
    BadMagic { path: String },
    #[error("checkpoint was written for dataset {found:?}, run is {expected:?}")]
    DatasetMismatch { expected: String, found: String },
}

/// Everything needed to resume or evaluate a run. Immutable once written;
/// a later save replaces the file atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub config: RunConfig,
    pub step: usize,
    pub best_val_loss: f32,
    pub params: Vec<ParamState>,
    pub optimizer: OptimState,
}

impl CheckpointRecord {
    pub fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(MAGIC);
        bincode::serialize_into(&mut buf, self)?;
        Ok(buf)
    }

    pub fn decode(raw: &[u8], path: &Path) -> Result<Self, CheckpointError> {
        if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
            return Err(CheckpointError::BadMagic { path: path.display().to_string() });
        }
        Ok(bincode::deserialize(&raw[MAGIC.len()..])?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let buf = self.encode()?;
        flush_checkpoint(path, &buf)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        Self::decode(&raw, path)
    }

    /// Resuming under a different dataset is always a mistake.
    pub fn check_dataset(&self, cfg: &RunConfig) -> Result<(), CheckpointError> {
        if self.config.dataset_id != cfg.dataset_id {
            return Err(CheckpointError::DatasetMismatch {
                expected: cfg.dataset_id.clone(),
                found: self.config.dataset_id.clone(),
            });
        }
        Ok(())
    }
}

/// Write-to-tmp, fsync, rename. A crash mid-write leaves the previous
/// checkpoint intact; rename makes the new one visible all at once.
pub fn flush_checkpoint(path: &Path, buf: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("bin.tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(buf)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/* ── Run directory template ──────────────────────────────────────── */

/// {output_root}/{run_id}/{date}/{time} — resolved once at process start.
pub fn run_dir(output_root: &str, run_id: &str, now: DateTime<Local>) -> PathBuf {
    Path::new(output_root)
        .join(run_id)
        .join(now.format("%Y-%m-%d").to_string())
        .join(now.format("%H-%M-%S").to_string())
}

/* ── Save policy ─────────────────────────────────────────────────── */
//
// Two states: no checkpoint yet (best = None) and has-best (best = Some).
// The first evaluation always saves; afterwards only strict improvement
// does, unless always_save_checkpoint turns every eval tick into a save.
// Pure in its inputs so every worker reaches the same decision.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaveDecision {
    pub save: bool,
    pub best_val_loss: f32,
}

pub fn decide_save(
    best_val_loss: Option<f32>,
    val_loss: f32,
    always_save: bool,
) -> SaveDecision {
    let improved = best_val_loss.map_or(true, |best| val_loss < best);
    SaveDecision {
        save: always_save || improved,
        best_val_loss: if improved {
            val_loss
        } else {
            best_val_loss.unwrap_or(val_loss)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ConfigPatch};
    use crate::model::ParamState;

    #[test]
    fn first_eval_always_saves() {
        let d = decide_save(None, 0.9, false);
        assert!(d.save);
        assert_eq!(d.best_val_loss, 0.9);
    }

    #[test]
    fn improvement_sequence_saves_at_ticks_one_and_three() {
        let losses = [0.9f32, 0.95, 0.8, 0.8];
        let mut best = None;
        let mut saved = Vec::new();
        for (tick, &val) in losses.iter().enumerate() {
            let d = decide_save(best, val, false);
            if d.save {
                saved.push(tick + 1);
            }
            best = Some(d.best_val_loss);
        }
        assert_eq!(saved, vec![1, 3]);
        assert_eq!(best, Some(0.8));
    }

    #[test]
    fn always_save_saves_every_tick_but_best_only_improves() {
        let losses = [0.9f32, 0.95, 0.8, 0.8];
        let mut best = None;
        for &val in &losses {
            let d = decide_save(best, val, true);
            assert!(d.save);
            best = Some(d.best_val_loss);
        }
        assert_eq!(best, Some(0.8));
    }

    #[test]
    fn equal_loss_is_not_an_improvement() {
        let d = decide_save(Some(0.8), 0.8, false);
        assert!(!d.save);
        assert_eq!(d.best_val_loss, 0.8);
    }

    fn record() -> CheckpointRecord {
        let config = resolve("cube_structure", None, &ConfigPatch::default()).unwrap();
        CheckpointRecord {
            config,
            step: 1500,
            best_val_loss: 0.42,
            params: vec![ParamState {
                name: "table".to_string(),
                shape: vec![2, 2],
                data: vec![1.0, 2.0, 3.0, 4.0],
            }],
            optimizer: OptimState::default(),
        }
    }

    #[test]
    fn round_trip_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CKPT_FILE);
        let rec = record();
        rec.save(&path).unwrap();

        let loaded = CheckpointRecord::load(&path).unwrap();
        assert_eq!(loaded.step, 1500);
        assert_eq!(loaded.best_val_loss, 0.42);
        assert_eq!(loaded.params, rec.params);
        assert_eq!(loaded.config, rec.config);
    }

    #[test]
    fn corrupt_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CKPT_FILE);
        std::fs::write(&path, b"not a checkpoint at all").unwrap();
        assert!(matches!(
            CheckpointRecord::load(&path),
            Err(CheckpointError::BadMagic { .. })
        ));
    }

    #[test]
    fn dataset_mismatch_rejected() {
        let rec = record();
        let other = resolve("puzzle_structure", None, &ConfigPatch::default()).unwrap();
        assert!(matches!(
            rec.check_dataset(&other),
            Err(CheckpointError::DatasetMismatch { .. })
        ));
    }

    #[test]
    fn save_replaces_previous_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CKPT_FILE);
        let mut rec = record();
        rec.save(&path).unwrap();
        rec.step = 3000;
        rec.save(&path).unwrap();
        assert_eq!(CheckpointRecord::load(&path).unwrap().step, 3000);
        assert!(!path.with_extension("bin.tmp").exists());
    }

    #[test]
    fn run_dir_follows_the_template() {
        use chrono::TimeZone;
        let now = Local.with_ymd_and_hms(2026, 8, 6, 14, 30, 5).unwrap();
        let dir = run_dir("out", "cube_structure", now);
        assert_eq!(
            dir,
            Path::new("out").join("cube_structure").join("2026-08-06").join("14-30-05")
        );
    }
}
