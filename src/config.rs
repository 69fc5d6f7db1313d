//! Run configuration and on-disk layout of a run.
use crate::align::Aligner;
use crate::error::PipelineError;
use anyhow::{Context, Result};
use log::info;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Serialization format of tree and subtree artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeFormat {
    Newick,
    Nexus,
}

impl TreeFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TreeFormat::Newick => "newick",
            TreeFormat::Nexus => "nexus",
        }
    }
}

/// Distance-based tree construction method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeMethod {
    #[default]
    Nj,
    Upgma,
}

/// Parameters of one run. Read-only once loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(alias = "algoritmo")]
    pub algorithm: Aligner,
    #[serde(alias = "parametros", default)]
    pub parameters: Map<String, Value>,
    pub tree_format: TreeFormat,
    #[serde(default)]
    pub tree_method: TreeMethod,
    pub entradas: Vec<String>,
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        let cfg: RunConfig =
            serde_json::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        if let Some(bad) = cfg.entradas.iter().find(|f| f.trim().is_empty() || f.contains('/')) {
            return Err(PipelineError::Config(format!(
                "input entry {bad:?} must be a plain file name"
            )));
        }
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("write {}", path.display()))
    }

    /// Random ClustalW configuration over the `.fasta` files of
    /// `input_dir`: a random pick of between two and all of them.
    pub fn random<R: Rng>(input_dir: &Path, rng: &mut R) -> Result<Self, PipelineError> {
        let mut fasta: Vec<String> = fs::read_dir(input_dir)
            .map_err(|e| PipelineError::Config(format!("cannot list {}: {e}", input_dir.display())))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".fasta"))
            .collect();
        if fasta.len() < 2 {
            return Err(PipelineError::Config(format!(
                "{} holds {} .fasta file(s), need at least 2",
                input_dir.display(),
                fasta.len()
            )));
        }
        // directory order is platform dependent
        fasta.sort();

        let gap_open: f64 = rng.gen_range(5.0..=20.0);
        let gap_ext: f64 = rng.gen_range(0.0..=1.0);
        let outorder = ["ALIGNED", "INPUT"].choose(rng).copied().unwrap_or("ALIGNED");
        let params = json!({
            "-TYPE": "PROTEIN",
            "-ALIGN": true,
            "-OUTPUT": "CLUSTAL",
            "-OUTORDER": outorder,
            "-GAPOPEN": round_to(gap_open, 1),
            "-GAPEXT": round_to(gap_ext, 2),
            "-QUIET": rng.gen_bool(0.5),
        });
        let tree_format = if rng.gen_bool(0.5) {
            TreeFormat::Nexus
        } else {
            TreeFormat::Newick
        };
        let n = rng.gen_range(2..=fasta.len());
        let entradas = fasta.choose_multiple(rng, n).cloned().collect();

        Ok(RunConfig {
            algorithm: Aligner::ClustalW,
            parameters: params.as_object().cloned().unwrap_or_default(),
            tree_format,
            tree_method: TreeMethod::Nj,
            entradas,
        })
    }
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (x * f).round() / f
}

/// Directory layout of a run, rooted at the data directory.
#[derive(Clone, Debug)]
pub struct RunPaths {
    pub data: PathBuf,
    pub input: PathBuf,
    pub out: PathBuf,
    /// Deduplicated copies of inputs that carried repeated records.
    pub unique: PathBuf,
    pub aligned: PathBuf,
    pub trees: PathBuf,
    pub subtrees: PathBuf,
    pub similarity: PathBuf,
    pub provenance: PathBuf,
}

impl RunPaths {
    pub fn new(data: &Path, input: Option<&Path>) -> Self {
        let out = data.join("out");
        Self {
            data: data.to_path_buf(),
            input: input
                .map(Path::to_path_buf)
                .unwrap_or_else(|| data.join("full_dataset_plasmodium")),
            unique: out.join("unique"),
            aligned: out.join("tmp"),
            trees: out.join("Trees"),
            subtrees: out.join("Subtrees"),
            similarity: out.join("Similaridades"),
            provenance: data.join("provenance"),
            out,
        }
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [
            &self.out,
            &self.unique,
            &self.aligned,
            &self.trees,
            &self.subtrees,
            &self.similarity,
            &self.provenance,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Empties the scratch directories. Placeholder `file.gitkeep` files
    /// are left alone.
    pub fn clean_scratch(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in [&self.unique, &self.aligned, &self.trees, &self.subtrees] {
            let entries = match fs::read_dir(dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("list {}", dir.display())),
            };
            for entry in entries {
                let entry = entry?;
                if entry.file_name() == "file.gitkeep" || !entry.file_type()?.is_file() {
                    continue;
                }
                fs::remove_file(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("removed {removed} scratch file(s)");
        }
        Ok(removed)
    }
}
