//! Distance-based tree inference from an alignment.
//!
//! Identity distance between aligned rows, then neighbor-joining or UPGMA.
//! Trees come out as Newick text with every internal clade named
//! `Inner{n}` (`n` counting joins from 1), so clade names are unique within
//! a tree and subtree artifacts never collide.
use crate::align::Alignment;
use crate::config::TreeMethod;
use crate::tree_io;
use anyhow::{bail, Result};
use newick::NewickTree;

/// Symmetric distance matrix, row-major `n * n`.
#[derive(Clone, Debug, PartialEq)]
pub struct DistanceMatrix {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl DistanceMatrix {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.names.len() + j]
    }
}

/// Fraction of aligned columns where the two rows differ (gaps included).
pub fn identity_distance(a: &[u8], b: &[u8]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let same = a.iter().zip(b).filter(|(x, y)| x.eq_ignore_ascii_case(*y)).count();
    1.0 - same as f64 / n as f64
}

pub fn distance_matrix(aln: &Alignment) -> DistanceMatrix {
    let n = aln.len();
    let mut values = vec![0.0f64; n * n];
    for i in 0..n {
        for j in i + 1..n {
            let d = identity_distance(&aln.rows[i], &aln.rows[j]);
            values[i * n + j] = d;
            values[j * n + i] = d;
        }
    }
    DistanceMatrix {
        names: aln.ids.iter().map(|s| tree_io::sanitize_label(s)).collect(),
        values,
    }
}

fn branch(len: f64) -> String {
    let mut buf = ryu::Buffer::new();
    buf.format(len.max(0.0)).to_owned()
}

/// Neighbor-joining (Saitou & Nei). The last two active nodes are joined
/// under the root clade.
pub fn neighbor_joining(dm: &DistanceMatrix) -> Result<String> {
    let n = dm.len();
    match n {
        0 => bail!("cannot build a tree from an empty alignment"),
        1 => return Ok(format!("{};", dm.names[0])),
        _ => {}
    }

    let cap = 2 * n;
    let mut d = vec![0.0f64; cap * cap];
    for i in 0..n {
        for j in 0..n {
            d[i * cap + j] = dm.get(i, j);
        }
    }
    let mut labels: Vec<String> = dm.names.clone();
    let mut active: Vec<usize> = (0..n).collect();
    let mut inner = 0usize;

    while active.len() > 2 {
        let r = active.len() as f64;
        let mut sums = vec![0.0f64; cap];
        for &i in &active {
            sums[i] = active.iter().filter(|&&j| j != i).map(|&j| d[i * cap + j]).sum();
        }

        let mut best = (f64::INFINITY, active[0], active[1]);
        for (ai, &i) in active.iter().enumerate() {
            for &j in &active[ai + 1..] {
                let q = (r - 2.0) * d[i * cap + j] - sums[i] - sums[j];
                if q < best.0 {
                    best = (q, i, j);
                }
            }
        }
        let (_, bi, bj) = best;
        let dij = d[bi * cap + bj];
        let delta = (sums[bi] - sums[bj]) / (r - 2.0);
        let li = 0.5 * (dij + delta);
        let lj = 0.5 * (dij - delta);

        inner += 1;
        let node = labels.len();
        labels.push(format!(
            "({}:{},{}:{})Inner{inner}",
            labels[bi],
            branch(li),
            labels[bj],
            branch(lj)
        ));
        for &k in &active {
            if k != bi && k != bj {
                let dk = 0.5 * (d[bi * cap + k] + d[bj * cap + k] - dij);
                d[node * cap + k] = dk;
                d[k * cap + node] = dk;
            }
        }
        active.retain(|&x| x != bi && x != bj);
        active.push(node);
    }

    let (a, b) = (active[0], active[1]);
    let half = d[a * cap + b] / 2.0;
    inner += 1;
    Ok(format!(
        "({}:{},{}:{})Inner{inner};",
        labels[a],
        branch(half),
        labels[b],
        branch(half)
    ))
}

/// UPGMA: average-linkage clustering with ultrametric branch lengths.
pub fn upgma(dm: &DistanceMatrix) -> Result<String> {
    let n = dm.len();
    match n {
        0 => bail!("cannot build a tree from an empty alignment"),
        1 => return Ok(format!("{};", dm.names[0])),
        _ => {}
    }

    struct Cluster {
        label: String,
        size: usize,
        height: f64,
    }
    let mut clusters: Vec<Option<Cluster>> = dm
        .names
        .iter()
        .map(|name| {
            Some(Cluster {
                label: name.clone(),
                size: 1,
                height: 0.0,
            })
        })
        .collect();
    let cap = 2 * n;
    let mut d = vec![0.0f64; cap * cap];
    for i in 0..n {
        for j in 0..n {
            d[i * cap + j] = dm.get(i, j);
        }
    }
    let mut active: Vec<usize> = (0..n).collect();
    let mut inner = 0usize;

    while active.len() > 1 {
        let mut best = (f64::INFINITY, active[0], active[1]);
        for (ai, &i) in active.iter().enumerate() {
            for &j in &active[ai + 1..] {
                if d[i * cap + j] < best.0 {
                    best = (d[i * cap + j], i, j);
                }
            }
        }
        let (dij, bi, bj) = best;
        let (Some(ci), Some(cj)) = (clusters[bi].take(), clusters[bj].take()) else {
            bail!("cluster {bi} or {bj} joined twice");
        };
        let height = dij / 2.0;
        inner += 1;
        let node = clusters.len();
        let size = ci.size + cj.size;
        for &k in &active {
            if k != bi && k != bj {
                let dk = (d[bi * cap + k] * ci.size as f64 + d[bj * cap + k] * cj.size as f64)
                    / size as f64;
                d[node * cap + k] = dk;
                d[k * cap + node] = dk;
            }
        }
        clusters.push(Some(Cluster {
            label: format!(
                "({}:{},{}:{})Inner{inner}",
                ci.label,
                branch(height - ci.height),
                cj.label,
                branch(height - cj.height)
            ),
            size,
            height,
        }));
        active.retain(|&x| x != bi && x != bj);
        active.push(node);
    }

    let last = active[0];
    match clusters[last].take() {
        Some(c) => Ok(format!("{};", c.label)),
        None => bail!("no root cluster"),
    }
}

/// Infers a tree for `aln` and returns it both as Newick text and parsed.
pub fn infer(aln: &Alignment, method: TreeMethod) -> Result<(String, NewickTree)> {
    let dm = distance_matrix(aln);
    let text = match method {
        TreeMethod::Nj => neighbor_joining(&dm)?,
        TreeMethod::Upgma => upgma(&dm)?,
    };
    let tree = tree_io::parse_newick(&text)?;
    Ok((text, tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use newick::Newick;
    use std::collections::HashSet;

    fn aln(rows: &[(&str, &str)]) -> Alignment {
        Alignment {
            ids: rows.iter().map(|(id, _)| id.to_string()).collect(),
            rows: rows.iter().map(|(_, s)| s.as_bytes().to_vec()).collect(),
        }
    }

    fn sample() -> Alignment {
        aln(&[
            ("a", "MKVLAAGG"),
            ("b", "MKVLAAGA"),
            ("c", "MKVQSAGA"),
            ("d", "LKTQSWGA"),
            ("e", "LRTQSWYA"),
        ])
    }

    fn inner_names(tree: &NewickTree) -> Vec<String> {
        tree.nodes()
            .filter(|&n| !tree[n].is_leaf())
            .filter_map(|n| tree.name(n).map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn identity_counts_gaps_as_columns() {
        assert_eq!(identity_distance(b"MKV-", b"MKV-"), 0.0);
        assert_eq!(identity_distance(b"MKVL", b"MKAA"), 0.5);
        assert_eq!(identity_distance(b"", b""), 0.0);
    }

    #[test]
    fn distance_matrix_is_symmetric_with_zero_diagonal() {
        let dm = distance_matrix(&sample());
        for i in 0..dm.len() {
            assert_eq!(dm.get(i, i), 0.0);
            for j in 0..dm.len() {
                assert_eq!(dm.get(i, j), dm.get(j, i));
            }
        }
    }

    #[test]
    fn both_methods_keep_every_leaf_and_name_clades_uniquely() {
        for method in [TreeMethod::Nj, TreeMethod::Upgma] {
            let (_, tree) = infer(&sample(), method).unwrap();
            let leaves: HashSet<String> =
                tree_io::leaf_names(&tree, tree.root()).into_iter().collect();
            let want: HashSet<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
            assert_eq!(leaves, want, "{method:?}");

            let names = inner_names(&tree);
            // binary tree over 5 leaves
            assert_eq!(names.len(), 4, "{method:?}");
            let unique: HashSet<&String> = names.iter().collect();
            assert_eq!(unique.len(), names.len());
        }
    }

    #[test]
    fn upgma_joins_closest_pair_first() {
        let text = upgma(&distance_matrix(&sample())).unwrap();
        assert!(text.starts_with('('));
        assert!(text.contains("(a:0.0625,b:0.0625)Inner1"), "{text}");
    }

    #[test]
    fn degenerate_inputs() {
        assert!(neighbor_joining(&distance_matrix(&aln(&[]))).is_err());
        assert_eq!(neighbor_joining(&distance_matrix(&aln(&[("x", "MK")]))).unwrap(), "x;");
        let two = neighbor_joining(&distance_matrix(&aln(&[("x", "MK"), ("y", "MA")]))).unwrap();
        assert_eq!(two, "(x:0.25,y:0.25)Inner1;");
    }
}
