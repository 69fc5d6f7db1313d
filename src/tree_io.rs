//! Newick / NEXUS tree files and clade-level helpers over `NewickTree`.
use crate::config::TreeFormat;
use crate::error::PipelineError;
use anyhow::{anyhow, Context, Result};
use newick::{Newick, NewickTree, NodeID};
use std::{fs, path::Path};

pub fn parse_newick(text: &str) -> Result<NewickTree> {
    newick::one_from_string(text.trim()).map_err(|e| anyhow!("parse newick: {e}"))
}

/// Pulls the first `TREE name = ...;` statement out of a NEXUS `TREES`
/// block. Bracketed comments such as `[&R]` are dropped.
pub fn nexus_tree_statement(text: &str) -> Option<String> {
    let mut in_trees = false;
    let mut collecting: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if let Some(buf) = collecting.as_mut() {
            buf.push_str(trimmed);
        } else if lower.starts_with("begin trees") {
            in_trees = true;
            continue;
        } else if in_trees && lower.starts_with("end") {
            in_trees = false;
            continue;
        } else if in_trees && lower.starts_with("tree ") {
            let (_, rhs) = trimmed.split_once('=')?;
            collecting = Some(rhs.trim().to_owned());
        } else {
            continue;
        }
        if collecting.as_deref().is_some_and(|b| b.contains(';')) {
            break;
        }
    }
    let body = strip_comments(&collecting?);
    let end = body.find(';')?;
    Some(format!("{};", body[..end].trim()))
}

fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

pub fn to_nexus(newick: &str, name: &str) -> String {
    format!("#NEXUS\nBegin Trees;\n Tree {name}={newick}\nEnd;\n")
}

pub fn read_tree(path: &Path, format: TreeFormat) -> Result<NewickTree> {
    if !path.exists() {
        return Err(PipelineError::MissingDependency(path.to_path_buf()).into());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let newick = match format {
        TreeFormat::Newick => text,
        TreeFormat::Nexus => nexus_tree_statement(&text)
            .ok_or_else(|| PipelineError::Tree(format!("{}: no TREE statement", path.display())))?,
    };
    parse_newick(&newick).with_context(|| format!("tree {}", path.display()))
}

/// Writes Newick text (ending in `;`) in the requested format.
pub fn write_tree(path: &Path, newick: &str, format: TreeFormat) -> Result<()> {
    let body = match format {
        TreeFormat::Newick => format!("{newick}\n"),
        TreeFormat::Nexus => to_nexus(newick, "tree1"),
    };
    fs::write(path, body).with_context(|| format!("write {}", path.display()))
}

/// Replaces characters that carry meaning in Newick labels.
pub fn sanitize_label(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '(' | ')' | '[' | ']' | ',' | ':' | ';' | '\'' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn leaf_label(t: &NewickTree, id: NodeID) -> String {
    t.name(id)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("L{id}"))
}

/// Names of every leaf at or below `node`, in left-to-right order. Unnamed
/// leaves get `L{node id}`.
pub fn leaf_names(t: &NewickTree, node: NodeID) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        if t[id].is_leaf() {
            out.push(leaf_label(t, id));
        } else {
            stack.extend(t[id].children().iter().rev().copied());
        }
    }
    out
}

enum Step {
    Enter(NodeID),
    Comma,
    Exit(NodeID),
}

/// Serializes the clade rooted at `node` as a standalone Newick tree. The
/// clade's own branch length is dropped since it becomes the root.
pub fn clade_to_newick(t: &NewickTree, node: NodeID) -> String {
    let mut out = String::new();
    let mut buf = ryu::Buffer::new();
    let mut stack = vec![Step::Enter(node)];
    let mut label = |out: &mut String, id: NodeID, leaf: bool| {
        match t.name(id) {
            Some(name) => out.push_str(name),
            None if leaf => out.push_str(&leaf_label(t, id)),
            None => {}
        }
        if id != node {
            if let Some(len) = t[id].branch() {
                out.push(':');
                out.push_str(buf.format(*len));
            }
        }
    };
    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(id) if t[id].is_leaf() => label(&mut out, id, true),
            Step::Enter(id) => {
                out.push('(');
                stack.push(Step::Exit(id));
                for (k, &c) in t[id].children().iter().enumerate().rev() {
                    stack.push(Step::Enter(c));
                    if k > 0 {
                        stack.push(Step::Comma);
                    }
                }
            }
            Step::Comma => out.push(','),
            Step::Exit(id) => {
                out.push(')');
                label(&mut out, id, false);
            }
        }
    }
    out.push(';');
    out
}
