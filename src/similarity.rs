//! Pairwise agreement between subtrees of different originating trees.
//!
//! The score is the overlap coefficient of the two leaf-name sets,
//! `|A ∩ B| / max(|A|, |B|)`. It stands in for topological agreement; no
//! agreement forest is computed.
use crate::matrix::{CandidateMatrix, Cell};
use crate::pool::{balanced_ranges, StageFailure, TaskPool};
use crate::store::RecordSink;
use log::info;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Above this many leaves a single intersection is split across the
/// nested pool.
pub const PARALLEL_THRESHOLD: usize = 10_000;

/// Sorted, de-duplicated leaf names of one subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafNameSet {
    names: Vec<String>,
}

impl LeafNameSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort_unstable();
        names.dedup();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .binary_search_by(|n| n.as_str().cmp(name))
            .is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimilarityRecord {
    pub seq_1: String,
    pub seq_2: String,
    pub score: f64,
}

fn count_members(chunk: &[String], other: &LeafNameSet) -> usize {
    chunk.iter().filter(|n| other.contains(n)).count()
}

/// `|A ∩ B|` in the calling thread.
pub fn sequential_intersection(a: &LeafNameSet, b: &LeafNameSet) -> usize {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    count_members(&small.names, large)
}

/// `|A ∩ B|` with the larger set cut into `pool.workers()` balanced
/// contiguous chunks, each counted against the smaller set on `pool`.
pub fn chunked_intersection(a: &LeafNameSet, b: &LeafNameSet, pool: &TaskPool) -> usize {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let ranges = balanced_ranges(large.len(), pool.workers());
    pool.install(|| {
        ranges
            .into_par_iter()
            .map(|r| count_members(&large.names[r], small))
            .sum::<usize>()
    })
}

/// Picks chunked counting only when it can pay off: a set above
/// [`PARALLEL_THRESHOLD`] and more than one nested worker.
pub fn intersection_count(a: &LeafNameSet, b: &LeafNameSet, nested: Option<&TaskPool>) -> usize {
    match nested {
        Some(pool) if pool.workers() > 1 && a.len().max(b.len()) > PARALLEL_THRESHOLD => {
            chunked_intersection(a, b, pool)
        }
        _ => sequential_intersection(a, b),
    }
}

/// Overlap coefficient; 0 when either set is empty.
pub fn agreement(a: &LeafNameSet, b: &LeafNameSet) -> f64 {
    agreement_in(a, b, None)
}

pub fn agreement_in(a: &LeafNameSet, b: &LeafNameSet, nested: Option<&TaskPool>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    intersection_count(a, b, nested) as f64 / a.len().max(b.len()) as f64
}

/// `None` when either cell is padding: no comparison took place.
pub fn cell_agreement(
    matrix: &CandidateMatrix,
    x: Cell,
    y: Cell,
    nested: Option<&TaskPool>,
) -> Option<f64> {
    let (a, b) = (matrix.subtree(x)?, matrix.subtree(y)?);
    Some(agreement_in(&a.leaves, &b.leaves, nested))
}

/// Work done by one row of the all-pairs sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonSummary {
    pub compared: u64,
    pub emitted: u64,
}

impl std::ops::Add for ComparisonSummary {
    type Output = Self;

    fn add(self, o: Self) -> Self {
        Self {
            compared: self.compared + o.compared,
            emitted: self.emitted + o.emitted,
        }
    }
}

/// Compares every present cell of row `i` with every present cell of the
/// rows after it. Rows are originating trees, so same-origin pairs never
/// meet. Only positive scores are returned.
pub fn compare_row(
    matrix: &CandidateMatrix,
    i: usize,
    nested: Option<&TaskPool>,
) -> (Vec<SimilarityRecord>, ComparisonSummary) {
    let mut records = Vec::new();
    let mut summary = ComparisonSummary::default();
    let columns = matrix.columns();
    for j in 0..columns {
        let Some(a) = matrix.subtree(matrix.cell(i, j)) else {
            continue;
        };
        let a_id = a.id();
        for k in i + 1..matrix.rows() {
            for l in 0..columns {
                let Some(score) = cell_agreement(matrix, matrix.cell(i, j), matrix.cell(k, l), nested)
                else {
                    continue;
                };
                summary.compared += 1;
                if score > 0.0 {
                    if let Some(b) = matrix.subtree(matrix.cell(k, l)) {
                        records.push(SimilarityRecord {
                            seq_1: a_id.clone(),
                            seq_2: b.id(),
                            score,
                        });
                    }
                }
            }
        }
    }
    summary.emitted = records.len() as u64;
    (records, summary)
}

/// Fans the sweep out one task per row on `pool`; tasks push their records
/// into `sink` and the call returns once every row is joined.
pub fn compare_all(
    pool: &TaskPool,
    nested: Arc<TaskPool>,
    matrix: Arc<CandidateMatrix>,
    sink: RecordSink,
) -> Result<ComparisonSummary, StageFailure> {
    let t0 = Instant::now();
    let rows = matrix.rows();
    let handles: Vec<_> = (0..rows.saturating_sub(1))
        .map(|i| {
            let matrix = Arc::clone(&matrix);
            let nested = Arc::clone(&nested);
            let sink = sink.clone();
            pool.submit(format!("compare row {i} ({})", matrix.origin(i)), move || {
                let (records, summary) = compare_row(&matrix, i, Some(&nested));
                if !records.is_empty() {
                    sink.send(records)?;
                }
                Ok(summary)
            })
        })
        .collect();
    let total = TaskPool::await_all(handles)?
        .into_iter()
        .fold(ComparisonSummary::default(), |acc, s| acc + s);
    info!(
        "compared {} pair(s), {} above zero in {:>6} ms",
        total.compared,
        total.emitted,
        t0.elapsed().as_millis()
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ResultStore, StoreWriter};
    use crate::subtree::Subtree;
    use approx::assert_relative_eq;

    fn set(names: &[&str]) -> LeafNameSet {
        LeafNameSet::new(names.iter().copied())
    }

    fn sub(origin: &str, clade: &str, leaves: &[&str]) -> Subtree {
        Subtree::new(origin, clade, format!("{origin}_{clade}.newick"), set(leaves))
    }

    fn numbered(prefix: &str, range: std::ops::Range<usize>) -> LeafNameSet {
        LeafNameSet::new(range.map(|i| format!("{prefix}{i:06}")))
    }

    #[test]
    fn agreement_is_symmetric_and_bounded() {
        let cases = [
            (set(&["a", "b", "c"]), set(&["b", "c", "d"])),
            (set(&["a"]), set(&["a", "b", "c", "d"])),
            (set(&["x", "y"]), set(&["y", "x"])),
            (set(&["p", "q"]), set(&["r"])),
        ];
        for (a, b) in &cases {
            let ab = agreement(a, b);
            assert_eq!(ab, agreement(b, a));
            assert!((0.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn self_agreement_is_one_and_disjoint_is_zero() {
        let a = set(&["a", "b", "c"]);
        assert_eq!(agreement(&a, &a), 1.0);
        assert_eq!(agreement(&a, &set(&["d", "e"])), 0.0);
        assert_eq!(agreement(&a, &LeafNameSet::default()), 0.0);
    }

    #[test]
    fn duplicate_names_collapse() {
        let a = LeafNameSet::new(["b", "a", "b"]);
        assert_eq!(a.names(), ["a", "b"]);
        assert!(a.contains("a") && !a.contains("c"));
    }

    #[test]
    fn chunked_count_matches_sequential_for_any_worker_count() {
        let a = numbered("s", 0..12_000);
        let b = numbered("s", 6_000..30_000);
        let expect = sequential_intersection(&a, &b);
        assert_eq!(expect, 6_000);
        for w in [1, 2, 3, 8] {
            let pool = TaskPool::new(w, "nested").unwrap();
            assert_eq!(chunked_intersection(&a, &b, &pool), expect, "W={w}");
            assert_eq!(intersection_count(&a, &b, Some(&pool)), expect, "W={w}");
        }
    }

    #[test]
    fn twenty_thousand_leaves_w1_equals_w4() {
        let a = numbered("t", 0..20_000);
        let b = LeafNameSet::new((0..20_000).step_by(3).map(|i| format!("t{i:06}")));
        let one = TaskPool::new(1, "w1").unwrap();
        let four = TaskPool::new(4, "w4").unwrap();
        let x = intersection_count(&a, &b, Some(&one));
        let y = intersection_count(&a, &b, Some(&four));
        assert_eq!(x, y);
        assert_eq!(x, b.len());
    }

    #[test]
    fn two_tree_scenario() {
        let matrix = CandidateMatrix::build(vec![
            sub("T1", "X", &["a", "b", "c"]),
            sub("T1", "Y", &["a", "b"]),
            sub("T2", "Z", &["b", "c", "d"]),
        ])
        .pad();
        let (records, summary) = compare_row(&matrix, 0, None);
        assert_eq!(summary.compared, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq_1, "T1_X.newick");
        assert_eq!(records[0].seq_2, "T2_Z.newick");
        assert_relative_eq!(records[0].score, 2.0 / 3.0);
        assert_eq!(records[1].seq_1, "T1_Y.newick");
        assert_eq!(records[1].seq_2, "T2_Z.newick");
        // |{b}| / max(2, 3)
        assert_relative_eq!(records[1].score, 1.0 / 3.0);
        // last row has nothing after it
        assert!(compare_row(&matrix, 1, None).0.is_empty());
    }

    #[test]
    fn padding_never_reaches_the_metric() {
        let matrix = CandidateMatrix::build(vec![
            sub("T1", "A", &["a", "b"]),
            sub("T1", "B", &["a", "c"]),
            sub("T1", "C", &["b", "c"]),
            sub("T2", "D", &["a", "b"]),
            sub("T3", "E", &["x", "y"]),
        ])
        .pad();
        assert_eq!(cell_agreement(&matrix, matrix.cell(1, 1), matrix.cell(0, 0), None), None);
        let (_, s0) = compare_row(&matrix, 0, None);
        let (_, s1) = compare_row(&matrix, 1, None);
        // T1 x {T2, T3}, then T2 x T3; padded cells skipped
        assert_eq!(s0.compared, 6);
        assert_eq!(s1.compared, 1);
    }

    #[test]
    fn same_origin_pairs_are_never_emitted() {
        let matrix = CandidateMatrix::build(vec![
            sub("T1", "A", &["a", "b"]),
            sub("T2", "B", &["a", "b"]),
            sub("T1", "C", &["a", "b"]),
            sub("T2", "D", &["a", "b"]),
        ])
        .pad();
        let (records, _) = compare_row(&matrix, 0, None);
        assert_eq!(records.len(), 4);
        for r in &records {
            assert_ne!(&r.seq_1[..2], &r.seq_2[..2]);
        }
    }

    #[test]
    fn disjoint_pairs_are_counted_but_never_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.db");
        let matrix = Arc::new(
            CandidateMatrix::build(vec![
                sub("T1", "A", &["a", "b"]),
                sub("T2", "B", &["a", "c"]),
                sub("T3", "C", &["x", "y"]),
            ])
            .pad(),
        );
        let (records, s0) = compare_row(&matrix, 0, None);
        assert_eq!(s0, ComparisonSummary { compared: 2, emitted: 1 });
        assert!(records.iter().all(|r| r.seq_2 != "T3_C.newick"));

        let pool = TaskPool::new(2, "cmp").unwrap();
        let nested = Arc::new(TaskPool::new(1, "nested").unwrap());
        let writer = StoreWriter::spawn(ResultStore::open(&path, 10).unwrap(), 2).unwrap();
        let total = compare_all(&pool, nested, Arc::clone(&matrix), writer.sink()).unwrap();
        assert_eq!(total, ComparisonSummary { compared: 3, emitted: 1 });
        assert_eq!(writer.finish().unwrap().rows, 1);

        let store = ResultStore::open(&path, 1).unwrap();
        assert_eq!(store.score("T1_A.newick", "T2_B.newick").unwrap(), Some(0.5));
        assert_eq!(store.score("T1_A.newick", "T3_C.newick").unwrap(), None);
        assert_eq!(store.score("T2_B.newick", "T3_C.newick").unwrap(), None);
    }
}
