use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const METRICS_FILE: &str = "metrics.csv";

/// One row of `metrics.csv`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean NT-Xent loss over the epoch's batches
    pub train_loss: f64,
    pub min_batch_loss: f64,
    pub max_batch_loss: f64,
    pub batches: usize,
    /// Learning rate used for the last step of the epoch
    pub learning_rate: f64,
    pub elapsed_secs: f64,
}

/// Running loss statistics for the epoch in progress
#[derive(Debug, Clone, Default)]
pub struct LossTracker {
    sum: f64,
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
}

impl LossTracker {
    pub fn update(&mut self, loss: f64) {
        self.sum += loss;
        self.count += 1;
        self.min = Some(self.min.map_or(loss, |m| m.min(loss)));
        self.max = Some(self.max.map_or(loss, |m| m.max(loss)));
    }

    /// NaN when no batch was seen
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(&self, epoch: usize, learning_rate: f64, elapsed_secs: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: self.mean(),
            min_batch_loss: self.min.unwrap_or(f64::NAN),
            max_batch_loss: self.max.unwrap_or(f64::NAN),
            batches: self.count,
            learning_rate,
            elapsed_secs,
        }
    }
}

/// Appends one CSV row per epoch
pub struct MetricsLogger {
    path: PathBuf,
}

impl MetricsLogger {
    /// Start a fresh `metrics.csv` in `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(METRICS_FILE);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Cannot reset {}", path.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, metrics: &EpochMetrics) -> Result<()> {
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Cannot open {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(metrics)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<EpochMetrics>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Cannot read {}", self.path.display()))?;
        let rows = reader.deserialize().collect::<Result<Vec<EpochMetrics>, _>>()?;
        Ok(rows)
    }
}
