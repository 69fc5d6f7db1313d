//! Subtrees grouped by originating tree, rectangularized for indexed
//! `(row, column)` access.
use crate::subtree::Subtree;
use std::collections::HashMap;

/// One matrix cell. `Absent` marks padding and is never a comparison
/// operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cell {
    /// Index into the matrix's subtree arena.
    Present(usize),
    Absent,
}

/// Rows are originating trees in first-seen order; a row lists that
/// tree's subtrees in extraction order.
#[derive(Clone, Debug, Default)]
pub struct CandidateMatrix {
    arena: Vec<Subtree>,
    origins: Vec<String>,
    cells: Vec<Vec<Cell>>,
}

impl CandidateMatrix {
    pub fn build(subtrees: Vec<Subtree>) -> Self {
        let mut row_of: HashMap<String, usize> = HashMap::new();
        let mut origins = Vec::new();
        let mut cells: Vec<Vec<Cell>> = Vec::new();
        for (idx, s) in subtrees.iter().enumerate() {
            let row = *row_of.entry(s.origin.clone()).or_insert_with(|| {
                origins.push(s.origin.clone());
                cells.push(Vec::new());
                cells.len() - 1
            });
            cells[row].push(Cell::Present(idx));
        }
        Self {
            arena: subtrees,
            origins,
            cells,
        }
    }

    /// Extends every row to [`max_row_len`](Self::max_row_len) with
    /// `Cell::Absent`, keeping row and cell order.
    pub fn pad(mut self) -> Self {
        let width = self.max_row_len();
        for row in &mut self.cells {
            row.resize(width, Cell::Absent);
        }
        self
    }

    pub fn max_row_len(&self) -> usize {
        self.cells.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_padded(&self) -> bool {
        let width = self.max_row_len();
        self.cells.iter().all(|r| r.len() == width)
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn columns(&self) -> usize {
        self.max_row_len()
    }

    /// `Absent` for padding and for coordinates outside a ragged row.
    pub fn cell(&self, row: usize, col: usize) -> Cell {
        self.cells
            .get(row)
            .and_then(|r| r.get(col))
            .copied()
            .unwrap_or(Cell::Absent)
    }

    pub fn row(&self, row: usize) -> &[Cell] {
        &self.cells[row]
    }

    pub fn origin(&self, row: usize) -> &str {
        &self.origins[row]
    }

    pub fn subtree(&self, cell: Cell) -> Option<&Subtree> {
        match cell {
            Cell::Present(i) => self.arena.get(i),
            Cell::Absent => None,
        }
    }

    pub fn subtree_count(&self) -> usize {
        self.arena.len()
    }
}

/// Upper bound on comparisons for `m` trees of up to `n` subtrees each:
/// `C(m, 2) * n^2`.
pub fn comparison_count(m: u64, n: u64) -> u128 {
    let m = m as u128;
    let n = n as u128;
    m * m.saturating_sub(1) / 2 * n * n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::LeafNameSet;

    fn sub(origin: &str, clade: &str) -> Subtree {
        Subtree::new(
            origin,
            clade,
            format!("{origin}_{clade}.newick"),
            LeafNameSet::new(["a", "b"]),
        )
    }

    #[test]
    fn groups_by_origin_in_first_seen_order() {
        let m = CandidateMatrix::build(vec![
            sub("T2", "I1"),
            sub("T1", "I1"),
            sub("T2", "I2"),
            sub("T2", "I3"),
        ]);
        assert_eq!(m.rows(), 2);
        assert_eq!(m.origin(0), "T2");
        assert_eq!(m.origin(1), "T1");
        let clades: Vec<&str> = m
            .row(0)
            .iter()
            .filter_map(|&c| m.subtree(c))
            .map(|s| s.clade.as_str())
            .collect();
        assert_eq!(clades, vec!["I1", "I2", "I3"]);
        assert!(!m.is_padded());
    }

    #[test]
    fn padding_makes_rows_equal_length() {
        let m = CandidateMatrix::build(vec![
            sub("A", "1"),
            sub("B", "1"),
            sub("B", "2"),
            sub("B", "3"),
            sub("C", "1"),
            sub("C", "2"),
        ])
        .pad();
        assert!(m.is_padded());
        assert_eq!(m.columns(), 3);
        for r in 0..m.rows() {
            assert_eq!(m.row(r).len(), 3);
        }
        assert_eq!(m.cell(0, 1), Cell::Absent);
        assert_eq!(m.cell(0, 2), Cell::Absent);
        assert_eq!(m.cell(2, 2), Cell::Absent);
        assert!(m.subtree(Cell::Absent).is_none());
        assert_eq!(m.subtree(m.cell(1, 2)).unwrap().clade, "3");
    }

    #[test]
    fn empty_input_gives_empty_matrix() {
        let m = CandidateMatrix::build(Vec::new()).pad();
        assert_eq!(m.rows(), 0);
        assert_eq!(m.columns(), 0);
        assert!(m.is_padded());
    }

    #[test]
    fn comparison_bound() {
        assert_eq!(comparison_count(0, 5), 0);
        assert_eq!(comparison_count(1, 5), 0);
        assert_eq!(comparison_count(2, 3), 9);
        assert_eq!(comparison_count(4, 10), 600);
    }
}
