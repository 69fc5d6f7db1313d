//! Error kinds surfaced by the pipeline.
//!
//! Orchestration code works with `anyhow::Result`; these typed kinds exist
//! for the places where a caller has to branch on *what* went wrong
//! (exclude a file, skip a comparison, abort the run).
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or missing run configuration. Aborts before any stage.
    #[error("configuration error: {0}")]
    Config(String),

    /// An input file failed structural or alphabet checks. The file is
    /// excluded from later stages, the run goes on.
    #[error("invalid sequence file {}: {reason}", path.display())]
    Validation { path: PathBuf, reason: String },

    #[error("{aligner} failed on {}: {message}", input.display())]
    ExternalProcess {
        aligner: String,
        input: PathBuf,
        message: String,
    },

    /// A tree or subtree artifact expected by a later stage is absent.
    #[error("missing artifact {}", .0.display())]
    MissingDependency(PathBuf),

    /// A tree could not be read, inferred or written.
    #[error("tree error: {0}")]
    Tree(String),

    /// The result sink could not be opened or flushed.
    #[error("result store error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The store writer thread went away before the stream ended.
    #[error("result store writer closed: {0}")]
    WriterClosed(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this kind stops the run. Validation and missing-artifact
    /// errors only shrink the item set.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation { .. } | PipelineError::MissingDependency(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_item_kinds_are_not_fatal() {
        let v = PipelineError::Validation {
            path: "a.fasta".into(),
            reason: "bad residue".into(),
        };
        assert!(!v.is_fatal());
        assert!(!PipelineError::MissingDependency("t.newick".into()).is_fatal());
        assert!(PipelineError::Config("no entradas".into()).is_fatal());
        assert!(PipelineError::WriterClosed("gone".into()).is_fatal());
    }

    #[test]
    fn messages_name_the_file() {
        let e = PipelineError::ExternalProcess {
            aligner: "clustalw".into(),
            input: "/data/x.fasta".into(),
            message: "exit status 1".into(),
        };
        assert_eq!(e.to_string(), "clustalw failed on /data/x.fasta: exit status 1");
    }
}
