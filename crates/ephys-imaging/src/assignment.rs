//! Rectangular minimum-cost assignment.
//!
//! Kuhn-Munkres (Hungarian) algorithm with row/column potentials, O(n²·m) for
//! an `n × m` cost matrix with `n <= m`. Every row is assigned a distinct
//! column; surplus columns stay unassigned.

use ephys_core::{EphysError, Result};
use ndarray::ArrayView2;

/// Assign each row of `cost` to a distinct column, minimizing the total cost.
///
/// Returns `assignment[row] = column`. Requires `rows <= columns` and finite costs.
pub fn solve_rectangular(cost: ArrayView2<'_, f64>) -> Result<Vec<usize>> {
    let (n, m) = cost.dim();
    if n == 0 {
        return Ok(Vec::new());
    }
    if n > m {
        return Err(EphysError::InvalidInput(format!(
            "assignment needs at least as many columns as rows, got {n}x{m}"
        )));
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(EphysError::InvalidInput("assignment costs must be finite".into()));
    }

    // 1-based indices; row/column 0 is the virtual start node.
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; m + 1];
    let mut owner = vec![0_usize; m + 1];
    let mut way = vec![0_usize; m + 1];

    for row in 1..=n {
        owner[0] = row;
        let mut j0 = 0;
        let mut min_slack = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if reduced < min_slack[j] {
                    min_slack[j] = reduced;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }
            if j1 == 0 {
                return Err(EphysError::ProtocolViolation(
                    "assignment found no augmenting column".into(),
                ));
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }
        // Flip the augmenting path.
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0; n];
    for j in 1..=m {
        if owner[j] != 0 {
            assignment[owner[j] - 1] = j - 1;
        }
    }
    Ok(assignment)
}

/// Total cost of `assignment` under `cost`.
pub fn total_cost(cost: ArrayView2<'_, f64>, assignment: &[usize]) -> f64 {
    assignment
        .iter()
        .enumerate()
        .map(|(row, &col)| cost[[row, col]])
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn brute_force(cost: &Array2<f64>) -> f64 {
        fn go(cost: &Array2<f64>, row: usize, used: &mut Vec<bool>) -> f64 {
            if row == cost.nrows() {
                return 0.0;
            }
            let mut best = f64::INFINITY;
            for col in 0..cost.ncols() {
                if !used[col] {
                    used[col] = true;
                    best = best.min(cost[[row, col]] + go(cost, row + 1, used));
                    used[col] = false;
                }
            }
            best
        }
        go(cost, 0, &mut vec![false; cost.ncols()])
    }

    #[test]
    fn test_square_known_optimum() {
        let cost = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let a = solve_rectangular(cost.view()).unwrap();
        assert_eq!(total_cost(cost.view(), &a), 5.0);
        assert_eq!(a, vec![1, 0, 2]);
    }

    #[test]
    fn test_rectangular_leaves_surplus_columns() {
        let cost = array![[5.0, 0.1, 9.0, 9.0], [9.0, 0.2, 9.0, 0.3]];
        let a = solve_rectangular(cost.view()).unwrap();
        assert_eq!(a, vec![1, 3]);
    }

    #[test]
    fn test_matches_brute_force() {
        let mut seed: u64 = 12345;
        for _ in 0..20 {
            let cost = Array2::from_shape_fn((4, 6), |_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((seed >> 33) % 100) as f64
            });
            let a = solve_rectangular(cost.view()).unwrap();
            let mut cols = a.clone();
            cols.sort_unstable();
            cols.dedup();
            assert_eq!(cols.len(), 4);
            assert_eq!(total_cost(cost.view(), &a), brute_force(&cost));
        }
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let tall = Array2::<f64>::zeros((3, 2));
        assert!(solve_rectangular(tall.view()).is_err());
        let nan = array![[f64::NAN]];
        assert!(solve_rectangular(nan.view()).is_err());
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(solve_rectangular(empty.view()).unwrap().is_empty());
    }
}
