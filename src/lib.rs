//! Subtree similarity across per-file protein phylogenies.
//!
//! FASTA inputs are validated and aligned with an external aligner, one
//! distance tree is inferred per alignment, every clade is written out as
//! its own subtree, and subtrees of different trees are scored pairwise by
//! leaf-set agreement into a SQLite table.
pub mod align;
pub mod config;
pub mod error;
pub mod fasta;
pub mod host;
pub mod matrix;
pub mod phylo;
pub mod pipeline;
pub mod pool;
pub mod provenance;
pub mod similarity;
pub mod store;
pub mod subtree;
pub mod tree_io;

pub use config::{RunConfig, RunPaths};
pub use error::PipelineError;
pub use pipeline::{Pipeline, RunContext, RunReport, Stage, StageError};
