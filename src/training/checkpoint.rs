/// Model checkpointing with safetensors
///
/// A checkpoint is a `<stem>.safetensors` file holding the model parameters
/// (keys prefixed `model.`) and optimizer buffers (prefixed `optim.`), plus a
/// `<stem>.json` metadata sidecar. The stem is `{model}_{epoch}_{timestamp}`
/// so concurrent experiments never collide. Checkpoints are immutable once
/// written.
use candle_core::{Device, Tensor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Model kind name
    pub model: String,
    /// Index of the epoch this checkpoint completed
    pub epoch: usize,
    /// Validation loss at checkpoint
    pub loss: f64,
    /// Validation accuracy at checkpoint
    pub acc: f64,
    /// Learning rate of the last update before the checkpoint
    pub lr: f64,
}

/// A full training snapshot
#[derive(Debug)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    /// Model parameters by name
    pub model_state: HashMap<String, Tensor>,
    /// Optimizer buffers by name
    pub optimizer_state: HashMap<String, Tensor>,
}

const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

impl Checkpoint {
    pub fn new(
        metadata: CheckpointMetadata,
        model_state: HashMap<String, Tensor>,
        optimizer_state: HashMap<String, Tensor>,
    ) -> Self {
        Self {
            metadata,
            model_state,
            optimizer_state,
        }
    }

    /// Save under `dir`, creating it if needed. Returns the tensor-file path.
    pub fn save(&self, dir: &Path) -> crate::Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let stem = format!(
            "{}_{}_{}",
            self.metadata.model,
            self.metadata.epoch,
            Utc::now().timestamp()
        );
        let tensor_path = dir.join(format!("{}.safetensors", stem));
        let meta_path = dir.join(format!("{}.json", stem));

        let mut tensors = HashMap::new();
        for (name, tensor) in &self.model_state {
            tensors.insert(format!("{}{}", MODEL_PREFIX, name), tensor.clone());
        }
        for (name, tensor) in &self.optimizer_state {
            tensors.insert(format!("{}{}", OPTIM_PREFIX, name), tensor.clone());
        }
        candle_core::safetensors::save(&tensors, &tensor_path)?;
        fs::write(&meta_path, serde_json::to_string_pretty(&self.metadata)?)?;

        Ok(tensor_path)
    }

    /// Load a checkpoint pair from the `.safetensors` path
    pub fn load(path: &Path, device: &Device) -> crate::Result<Self> {
        if !path.exists() {
            return Err(crate::TrainError::Checkpoint(format!(
                "checkpoint not found: {:?}",
                path
            )));
        }

        let meta_path = path.with_extension("json");
        let meta_bytes = fs::read(&meta_path).map_err(|e| {
            crate::TrainError::Checkpoint(format!(
                "missing checkpoint metadata {:?}: {}",
                meta_path, e
            ))
        })?;
        let metadata: CheckpointMetadata = serde_json::from_slice(&meta_bytes).map_err(|e| {
            crate::TrainError::Checkpoint(format!("corrupt checkpoint metadata {:?}: {}", meta_path, e))
        })?;

        let tensors = candle_core::safetensors::load(path, device)?;

        let mut model_state = HashMap::new();
        let mut optimizer_state = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
                model_state.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OPTIM_PREFIX) {
                optimizer_state.insert(name.to_string(), tensor);
            } else {
                return Err(crate::TrainError::Checkpoint(format!(
                    "unexpected tensor '{}' in checkpoint {:?}",
                    key, path
                )));
            }
        }

        Ok(Self {
            metadata,
            model_state,
            optimizer_state,
        })
    }
}

/// Delete the oldest checkpoints beyond `keep` in `dir`
///
/// Age is taken from filesystem modification time; each pruned tensor file
/// takes its metadata sidecar with it.
pub fn prune_history(dir: &Path, keep: usize) -> crate::Result<()> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            let modified = fs::metadata(&path)?.modified()?;
            entries.push((modified, path));
        }
    }

    if entries.len() <= keep {
        return Ok(());
    }

    // path as tie-break for same-second saves
    entries.sort_by(|a, b| a.cmp(b));
    let excess = entries.len() - keep;
    for (_, path) in entries.into_iter().take(excess) {
        log::info!("Pruning checkpoint {:?}", path);
        fs::remove_file(&path)?;
        let meta = path.with_extension("json");
        if meta.exists() {
            fs::remove_file(&meta)?;
        }
    }

    Ok(())
}
