//! SLURM batch script for a single pretraining run.
//!
//! The script requests resources, activates the environment, optionally exports
//! `TRANSFORMER_MODEL`, and invokes `train` once with the config path, the serialization
//! directory and a JSON overrides object.

use crate::config::TRANSFORMER_MODEL_ENV;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Resource request for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub job_name: String,
    pub ntasks: usize,
    pub cpus_per_task: usize,
    pub gpus: usize,
    /// Wall-clock limit as `HH:MM:SS`
    pub time: String,
    pub memory: String,
    pub partition: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            job_name: "contrastive-pretrain".to_string(),
            ntasks: 1,
            cpus_per_task: 4,
            gpus: 1,
            time: "01:00:00".to_string(),
            memory: "32G".to_string(),
            partition: None,
        }
    }
}

impl ResourceRequest {
    pub fn validate(&self) -> Result<()> {
        if self.ntasks == 0 || self.cpus_per_task == 0 {
            bail!("ntasks and cpus_per_task must be at least 1");
        }
        let parts: Vec<&str> = self.time.split(':').collect();
        let well_formed = parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
        if !well_formed {
            bail!("Wall-clock limit '{}' is not HH:MM:SS", self.time);
        }
        Ok(())
    }
}

/// Everything needed to render one job script
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub resources: ResourceRequest,
    /// Shell lines run before the trainer, e.g. `source activate declutr`
    pub activation: Vec<String>,
    /// Trainer executable
    pub trainer: String,
    pub config_path: PathBuf,
    pub serialization_dir: PathBuf,
    pub overrides: Value,
    pub transformer_model: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl LaunchPlan {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(config_path: P, serialization_dir: Q) -> Self {
        Self {
            resources: ResourceRequest::default(),
            activation: Vec::new(),
            trainer: "contrastive-pretrain".to_string(),
            config_path: config_path.into(),
            serialization_dir: serialization_dir.into(),
            overrides: Value::Object(Map::new()),
            transformer_model: None,
            log_dir: None,
        }
    }

    /// Set one key of the overrides object
    pub fn with_override(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.overrides {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Shorthand for the `train_data_path` override
    pub fn with_train_data_path<P: AsRef<Path>>(self, path: P) -> Self {
        let path = path.as_ref().display().to_string();
        self.with_override("train_data_path", Value::String(path))
    }

    /// Render the batch script
    pub fn render(&self) -> Result<String> {
        self.resources.validate()?;
        let r = &self.resources;

        let mut script = String::new();
        writeln!(script, "#!/bin/bash")?;
        writeln!(script, "#SBATCH --job-name={}", r.job_name)?;
        writeln!(script, "#SBATCH --ntasks={}", r.ntasks)?;
        writeln!(script, "#SBATCH --cpus-per-task={}", r.cpus_per_task)?;
        if r.gpus > 0 {
            writeln!(script, "#SBATCH --gres=gpu:{}", r.gpus)?;
        }
        writeln!(script, "#SBATCH --time={}", r.time)?;
        writeln!(script, "#SBATCH --mem={}", r.memory)?;
        if let Some(partition) = &r.partition {
            writeln!(script, "#SBATCH --partition={partition}")?;
        }
        if let Some(log_dir) = &self.log_dir {
            writeln!(script, "#SBATCH --output={}/%x-%j.out", log_dir.display())?;
        }
        writeln!(script)?;
        writeln!(script, "set -euo pipefail")?;
        writeln!(script)?;

        for line in &self.activation {
            writeln!(script, "{line}")?;
        }
        if let Some(model) = &self.transformer_model {
            writeln!(script, "export {}={}", TRANSFORMER_MODEL_ENV, shell_quote(model))?;
        }
        if !self.activation.is_empty() || self.transformer_model.is_some() {
            writeln!(script)?;
        }

        let overrides = serde_json::to_string(&self.overrides)?;
        writeln!(
            script,
            "{} train {} \\\n    --serialization-dir {} \\\n    --overrides {}",
            self.trainer,
            shell_quote(&self.config_path.display().to_string()),
            shell_quote(&self.serialization_dir.display().to_string()),
            shell_quote(&overrides)
        )?;
        Ok(script)
    }

    /// Write the script to `path` and return its contents
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<String> {
        let path = path.as_ref();
        let script = self.render()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, &script)
            .with_context(|| format!("Failed to write job script {}", path.display()))?;
        tracing::info!("Wrote job script to {}", path.display());
        Ok(script)
    }
}

/// Single-quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Submit a written script with `sbatch` and return the scheduler's job id
pub fn submit(script_path: &Path) -> Result<String> {
    let output = Command::new("sbatch")
        .arg(script_path)
        .output()
        .context("Failed to run sbatch; is SLURM available on this machine?")?;
    if !output.status.success() {
        bail!(
            "sbatch exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let job_id = parse_job_id(&stdout)
        .with_context(|| format!("Unexpected sbatch output: {}", stdout.trim()))?;
    tracing::info!("Submitted batch job {}", job_id);
    Ok(job_id)
}

/// Extract the id from `Submitted batch job 12345`
pub fn parse_job_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .last()
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
