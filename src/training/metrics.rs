/// Per-epoch training metrics, exported as JSON at run end
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Metrics of one completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub lr: f64,
    /// Wall-clock epoch duration in seconds
    pub t_epoch: f64,
}

/// Epoch-indexed metrics accumulated over a run
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetricsLog {
    records: BTreeMap<usize, EpochRecord>,
}

impl MetricsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, epoch: usize, record: EpochRecord) {
        self.records.insert(epoch, record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, epoch: usize) -> Option<&EpochRecord> {
        self.records.get(&epoch)
    }

    /// Write the accumulated records to `path` as a JSON object keyed by
    /// epoch index.
    pub fn export<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        fs::write(path.as_ref(), serde_json::to_string(&self.records)?)?;
        Ok(())
    }
}
