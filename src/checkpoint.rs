//! Persisted search state for resuming interrupted runs.
//!
//! A checkpoint holds the excluded set, the candidate space (incumbent,
//! strategy state, visited and failed sets) and the ledger. It is tied to
//! the configuration it was written for by a fingerprint.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::schema::{LedgerEntry, ProblemConfig};
use crate::select::{CandidateSpace, Model, ModelId};

/// Current on-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Checkpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid checkpoint JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported checkpoint version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("Checkpoint was written for a different configuration ({found}, expected {expected})")]
    ConfigMismatch { expected: String, found: String },
}

/// Resumable search state at an iteration boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// [`ProblemConfig::fingerprint`] of the run that wrote it.
    pub config_fingerprint: String,
    pub iteration: usize,
    pub excluded: BTreeSet<ModelId>,
    pub candidates: CandidateSpace,
    pub ledger: Vec<LedgerEntry>,
    /// Calibrated models, in ledger order.
    pub models: Vec<Model>,
}

impl Checkpoint {
    /// Check that this checkpoint can resume a run of `config`.
    pub fn verify(&self, config: &ProblemConfig) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        let expected = config.fingerprint();
        if self.config_fingerprint != expected {
            return Err(CheckpointError::ConfigMismatch {
                expected,
                found: self.config_fingerprint.clone(),
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Checkpoint file in a directory, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Write `checkpoint`, replacing any previous one.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let tmp = path.with_extension("json.tmp");

        // Write then rename so a crash never leaves a torn file.
        fs::write(&tmp, checkpoint.to_json()?)?;
        fs::rename(&tmp, &path)?;

        debug!(
            "Saved checkpoint at iteration {} to {}",
            checkpoint.iteration,
            path.display()
        );
        Ok(path)
    }

    /// Load the stored checkpoint, if there is one.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = Checkpoint::from_json(&content)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(Some(checkpoint))
    }
}
