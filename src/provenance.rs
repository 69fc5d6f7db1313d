//! Per-run provenance: a scratch `temp.json` kept current while stages run,
//! turned into a timestamped `dados_*.json` once the run ends.
use crate::config::RunConfig;
use crate::fasta::SequenceStats;
use crate::host::HostSummary;
use crate::store::StoreSummary;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const SCRATCH_NAME: &str = "temp.json";

#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub inicio: DateTime<Local>,
    pub fim: DateTime<Local>,
    pub elapsed_secs: f64,
    pub num_procs: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSummary>,
}

pub struct Provenance {
    dir: PathBuf,
    record: Value,
}

impl Provenance {
    /// Starts the record from the run configuration and writes the scratch
    /// copy.
    pub fn begin(dir: &Path, config: &RunConfig) -> Result<Self> {
        let record = serde_json::to_value(config).context("serialize run configuration")?;
        let p = Self {
            dir: dir.to_path_buf(),
            record,
        };
        p.write_scratch()?;
        Ok(p)
    }

    pub fn scratch_path(&self) -> PathBuf {
        self.dir.join(SCRATCH_NAME)
    }

    fn write_scratch(&self) -> Result<()> {
        let path = self.scratch_path();
        let text = serde_json::to_string_pretty(&self.record)?;
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))
    }

    /// Replaces the input file names with their statistics.
    pub fn set_inputs(&mut self, stats: &[SequenceStats]) -> Result<()> {
        self.record["entradas"] = serde_json::to_value(stats)?;
        self.write_scratch()
    }

    /// Appends `resultado` and `host`, writes `dados_<timestamp>.json` and
    /// removes the scratch copy. Returns the final path.
    pub fn finish(mut self, outcome: &RunOutcome, host: &HostSummary) -> Result<PathBuf> {
        self.record["resultado"] = serde_json::to_value(outcome)?;
        self.record["host"] = json!(host);

        let stamp = outcome.fim.format("%Y%m%d_%H%M%S");
        let mut path = self.dir.join(format!("dados_{stamp}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("dados_{stamp}_{n}.json"));
            n += 1;
        }
        let text = serde_json::to_string_pretty(&self.record)?;
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;

        let scratch = self.scratch_path();
        if scratch.exists() {
            fs::remove_file(&scratch).with_context(|| format!("remove {}", scratch.display()))?;
        }
        Ok(path)
    }
}
