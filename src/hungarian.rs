//! Minimum-cost bipartite assignment between tracks and detections.

use ndarray::ArrayView2;
use pathfinding::prelude::{kuhn_munkres_min, Matrix};

/// Costs are scaled to integers for the solver.
const COST_SCALE: f32 = 1000.0;

/// Padding cost for dummy rows/columns and infeasible pairs. Large enough
/// to lose against any real pair, small enough not to overflow the solver's
/// running sums.
const PAD_COST: i64 = 1_000_000_000;

#[derive(Debug, Clone, Default)]
pub struct Assignment {
    /// Accepted `(row, col)` pairs.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Solve the assignment over `cost`. Entries at or above `infeasible` are
/// never matched; the matrix is padded to square so rectangular problems
/// yield partial matchings. Tie order between equal-cost pairs follows the
/// solver's internal scan order and is not specified.
pub fn assign(cost: ArrayView2<'_, f32>, infeasible: f32) -> Assignment {
    let rows = cost.nrows();
    let cols = cost.ncols();

    if rows == 0 || cols == 0 {
        return Assignment {
            matches: Vec::new(),
            unmatched_rows: (0..rows).collect(),
            unmatched_cols: (0..cols).collect(),
        };
    }

    let size = rows.max(cols);
    let mut weights = Matrix::new(size, size, PAD_COST);
    for i in 0..rows {
        for j in 0..cols {
            let entry = cost[[i, j]];
            if entry < infeasible {
                weights[(i, j)] = (entry * COST_SCALE) as i64;
            }
        }
    }

    let (_, row_to_col) = kuhn_munkres_min(&weights);

    let mut matches = Vec::new();
    let mut unmatched_rows = Vec::new();
    let mut col_taken = vec![false; cols];
    for (row, &col) in row_to_col.iter().enumerate().take(rows) {
        if col < cols && cost[[row, col]] < infeasible {
            matches.push((row, col));
            col_taken[col] = true;
        } else {
            unmatched_rows.push(row);
        }
    }
    let unmatched_cols = col_taken
        .iter()
        .enumerate()
        .filter_map(|(j, &taken)| (!taken).then_some(j))
        .collect();

    Assignment {
        matches,
        unmatched_rows,
        unmatched_cols,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const INF: f32 = 1e6;

    #[test]
    fn test_square_optimum() {
        let cost = array![[0.9, 0.1], [0.1, 0.9]];
        let result = assign(cost.view(), INF);
        let mut matches = result.matches.clone();
        matches.sort_unstable();
        assert_eq!(matches, vec![(0, 1), (1, 0)]);
        assert!(result.unmatched_rows.is_empty());
        assert!(result.unmatched_cols.is_empty());
    }

    #[test]
    fn test_rectangular_leaves_extra_cols_unmatched() {
        let cost = array![[0.2, 0.8, 0.5], [0.9, 0.1, 0.5]];
        let result = assign(cost.view(), INF);
        let mut matches = result.matches.clone();
        matches.sort_unstable();
        assert_eq!(matches, vec![(0, 0), (1, 1)]);
        assert_eq!(result.unmatched_cols, vec![2]);
    }

    #[test]
    fn test_more_rows_than_cols() {
        let cost = array![[0.1], [0.2], [0.3]];
        let result = assign(cost.view(), INF);
        assert_eq!(result.matches, vec![(0, 0)]);
        assert_eq!(result.unmatched_rows, vec![1, 2]);
        assert!(result.unmatched_cols.is_empty());
    }

    #[test]
    fn test_infeasible_pairs_never_match() {
        let cost = array![[INF, 0.3], [INF, INF]];
        let result = assign(cost.view(), INF);
        assert_eq!(result.matches, vec![(0, 1)]);
        assert_eq!(result.unmatched_rows, vec![1]);
        assert_eq!(result.unmatched_cols, vec![0]);
    }

    #[test]
    fn test_empty_inputs() {
        let cost = ndarray::Array2::<f32>::zeros((0, 3));
        let result = assign(cost.view(), INF);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_cols, vec![0, 1, 2]);
    }
}
