//! FASTA inputs: per-file statistics, protein alphabet validation and
//! duplicate removal ahead of alignment.
use crate::error::PipelineError;
use anyhow::{Context, Result};
use bio::io::fasta;
use log::{info, warn};
use serde::Serialize;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

pub const PROTEIN_ALPHABET: &[u8] = b"ACDEFGHIKLMNPQRSTVWY";

/// Summary of one input file as recorded in provenance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SequenceStats {
    pub arquivo: String,
    pub quantidade: usize,
    pub maior: usize,
    pub menor: usize,
    pub media: f64,
    pub size_bytes: u64,
}

fn read_records(path: &Path) -> Result<Vec<fasta::Record>> {
    let reader = fasta::Reader::from_file(path)
        .map_err(|e| anyhow::anyhow!("open {}: {e}", path.display()))?;
    reader
        .records()
        .map(|r| r.with_context(|| format!("read record from {}", path.display())))
        .collect()
}

pub fn analyze(path: &Path) -> Result<SequenceStats> {
    let records = read_records(path)?;
    let size_bytes = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let lens: Vec<usize> = records.iter().map(|r| r.seq().len()).collect();
    let media = if lens.is_empty() {
        0.0
    } else {
        let mean = lens.iter().sum::<usize>() as f64 / lens.len() as f64;
        (mean * 100.0).round() / 100.0
    };
    Ok(SequenceStats {
        arquivo: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        quantidade: lens.len(),
        maior: lens.iter().copied().max().unwrap_or(0),
        menor: lens.iter().copied().min().unwrap_or(0),
        media,
        size_bytes,
    })
}

/// Counts records by header lines only, without parsing sequences.
pub fn count_records(path: &Path) -> Result<usize> {
    let text = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(text.iter().filter(|&&b| b == b'>').count())
}

/// Checks structure and that every residue is an upper-case amino acid.
pub fn validate_protein(path: &Path) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::Validation {
        path: path.to_path_buf(),
        reason,
    };
    if !path.exists() {
        return Err(invalid("file not found".into()));
    }
    let records = read_records(path).map_err(|e| invalid(format!("{e:#}")))?;
    if records.is_empty() {
        return Err(invalid("no records".into()));
    }
    for record in &records {
        record
            .check()
            .map_err(|e| invalid(format!("record {:?}: {e}", record.id())))?;
        if let Some(&b) = record.seq().iter().find(|b| !PROTEIN_ALPHABET.contains(b)) {
            return Err(invalid(format!(
                "record {} has residue {:?}",
                record.id(),
                b as char
            )));
        }
    }
    Ok(())
}

pub fn has_duplicate_ids(path: &Path) -> Result<bool> {
    let mut seen = HashSet::new();
    for record in read_records(path)? {
        if !seen.insert(record.id().to_owned()) {
            warn!("duplicate id {} in {}", record.id(), path.display());
            return Ok(true);
        }
    }
    Ok(false)
}

/// Writes `out_dir/<file name>` keeping the first record of every id and
/// of every distinct sequence. Returns the new path.
pub fn remove_duplicates(path: &Path, out_dir: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let out = out_dir.join(name);
    let mut ids = HashSet::new();
    let mut seqs = HashSet::new();
    let mut writer = fasta::Writer::to_file(&out)
        .with_context(|| format!("create {}", out.display()))?;
    let (mut kept, mut dropped) = (0usize, 0usize);
    for record in read_records(path)? {
        let fresh_id = ids.insert(record.id().to_owned());
        let fresh_seq = seqs.insert(record.seq().to_vec());
        if fresh_id && fresh_seq {
            writer.write_record(&record)?;
            kept += 1;
        } else {
            dropped += 1;
        }
    }
    writer.flush()?;
    info!("{}: kept {kept}, dropped {dropped} duplicate record(s)", out.display());
    Ok(out)
}
