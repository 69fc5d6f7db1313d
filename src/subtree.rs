//! Materializes every discriminative clade of a tree as its own artifact.
use crate::config::TreeFormat;
use crate::similarity::LeafNameSet;
use crate::tree_io;
use anyhow::{Context, Result};
use log::{debug, warn};
use newick::{Newick, NewickTree};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

/// A clade written out as a standalone tree. Identity is
/// `(origin, clade)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Subtree {
    pub origin: String,
    pub clade: String,
    pub path: PathBuf,
    pub leaves: LeafNameSet,
}

impl Subtree {
    pub fn new(
        origin: impl Into<String>,
        clade: impl Into<String>,
        path: impl Into<PathBuf>,
        leaves: LeafNameSet,
    ) -> Self {
        Self {
            origin: origin.into(),
            clade: clade.into(),
            path: path.into(),
            leaves,
        }
    }

    /// Record identifier: the artifact file name.
    pub fn id(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_{}", self.origin, self.clade))
    }
}

pub fn artifact_name(origin: &str, clade: &str, format: TreeFormat) -> String {
    format!("{origin}_{clade}.{}", format.extension())
}

/// Walks `tree` in pre-order and writes one artifact per clade with at
/// least two leaves. Unnamed clades are called `clade{node id}`.
pub fn extract(
    tree: &NewickTree,
    origin: &str,
    format: TreeFormat,
    out_dir: &Path,
) -> Result<Vec<Subtree>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        stack.extend(tree[id].children().iter().rev().copied());
        if tree[id].is_leaf() {
            continue;
        }
        let names = tree_io::leaf_names(tree, id);
        if names.len() < 2 {
            continue;
        }
        let clade = tree
            .name(id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("clade{id}"));
        if !seen.insert(clade.clone()) {
            warn!("{origin}: clade name {clade} repeats, its artifact gets overwritten");
        }
        let path = out_dir.join(artifact_name(origin, &clade, format));
        tree_io::write_tree(&path, &tree_io::clade_to_newick(tree, id), format)?;
        out.push(Subtree::new(origin, clade, path, LeafNameSet::new(names)));
    }
    debug!("{origin}: {} subtree(s)", out.len());
    Ok(out)
}

/// Reads the tree at `path` and extracts it with the file stem as origin.
pub fn extract_file(path: &Path, format: TreeFormat, out_dir: &Path) -> Result<Vec<Subtree>> {
    let origin = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file stem", path.display()))?;
    let tree = tree_io::read_tree(path, format)?;
    extract(&tree, &origin, format, out_dir)
}
