use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::matrix::invert_gauss_jordan;

/// Hard cap on simplex pivots, shared across both phases.
pub const MAX_SIMPLEX_ITERATIONS: usize = 1000;

/// Basic solutions and reduced costs within this tolerance of zero are
/// treated as zero.
const FEASIBILITY_TOLERANCE: f64 = 1e-12;
/// Looser floor for declaring a recomputed basic solution infeasible; the
/// basis inverse is rebuilt every pivot and carries that much roundoff on
/// hundred-row systems.
const BASIC_INFEASIBILITY_TOLERANCE: f64 = 1e-9;
/// Tolerance for recognizing a unit column during basis initialization.
const UNIT_COLUMN_TOLERANCE: f64 = 1e-9;
/// Residual artificial mass above this threshold after phase one means the
/// constraint system has no feasible point.
const PHASE_ONE_TOLERANCE: f64 = 1e-7;

/// Terminal state of an LP solve. Every failure mode is a value; the solver
/// never panics on bad geometry.
#[derive(Clone, Debug, PartialEq)]
pub enum LpOutcome {
    /// Minimizer of `c.x` over `A x <= b`, `x >= 0`.
    Optimal(Array1<f64>),
    Infeasible,
    Unbounded,
    /// A probed basis matrix was singular beyond recovery.
    Singular,
    MaxIter,
}

enum CoreStatus {
    /// No entering candidate remains; carries the basic values.
    Finished(Array1<f64>),
    Singular,
    Infeasible,
    Unbounded,
    MaxIter,
}

/// Minimizes `c.x` subject to `A x <= b` and `x >= 0` with a revised primal
/// simplex over dense matrices.
///
/// The problem is brought to standard form by appending one slack column per
/// row; rows with a negative right-hand side are negated so `b >= 0`. The
/// initial basis comes from a unit-column scan (which picks up the slack
/// identity wherever it survived the negation); rows left without a unit
/// column receive an artificial variable that a phase-one objective drives
/// out. The basis inverse is recomputed from scratch each pivot, so a
/// singular basis surfaces as an outcome rather than drifting numerics.
pub fn solve_lp(a: ArrayView2<f64>, b: ArrayView1<f64>, c: ArrayView1<f64>) -> LpOutcome {
    let m = a.nrows();
    let n = a.ncols();
    debug_assert_eq!(b.len(), m);
    debug_assert_eq!(c.len(), n);

    if m == 0 {
        // Nothing constrains x; the minimum-cost nonnegative point is zero.
        return LpOutcome::Optimal(Array1::zeros(n));
    }

    // Standard form: [A | I] with slacks, rows flipped to keep b nonnegative.
    let mut work = Array2::<f64>::zeros((m, n + m));
    let mut rhs = Array1::<f64>::zeros(m);
    for i in 0..m {
        let flip = if b[i] < 0.0 { -1.0 } else { 1.0 };
        for j in 0..n {
            work[[i, j]] = flip * a[[i, j]];
        }
        work[[i, n + i]] = flip;
        rhs[i] = flip * b[i];
    }

    // Unit-column scan: leftmost unit column claims its row.
    let mut basis_for_row: Vec<Option<usize>> = vec![None; m];
    'columns: for j in 0..(n + m) {
        let mut unit_row = None;
        for i in 0..m {
            let v = work[[i, j]];
            if (v - 1.0).abs() <= UNIT_COLUMN_TOLERANCE {
                if unit_row.is_some() {
                    continue 'columns;
                }
                unit_row = Some(i);
            } else if v.abs() > UNIT_COLUMN_TOLERANCE {
                continue 'columns;
            }
        }
        if let Some(i) = unit_row {
            if basis_for_row[i].is_none() {
                basis_for_row[i] = Some(j);
            }
        }
    }

    let artificial_rows: Vec<usize> = (0..m).filter(|&i| basis_for_row[i].is_none()).collect();
    let structural = n + m;
    let total = structural + artificial_rows.len();

    let mut tableau = Array2::<f64>::zeros((m, total));
    tableau.slice_mut(ndarray::s![.., ..structural]).assign(&work);
    for (k, &row) in artificial_rows.iter().enumerate() {
        tableau[[row, structural + k]] = 1.0;
        basis_for_row[row] = Some(structural + k);
    }

    let mut basis: Vec<usize> = basis_for_row
        .into_iter()
        .map(|slot| slot.expect("every row was assigned a basic column"))
        .collect();
    let in_basis: std::collections::HashSet<usize> = basis.iter().copied().collect();
    let mut nonbasis: Vec<usize> = (0..total).filter(|j| !in_basis.contains(j)).collect();

    let mut iterations = 0usize;

    if !artificial_rows.is_empty() {
        let mut phase_one_cost = Array1::<f64>::zeros(total);
        for j in structural..total {
            phase_one_cost[j] = 1.0;
        }
        match simplex_core(
            &tableau,
            &rhs,
            &phase_one_cost,
            &mut basis,
            &mut nonbasis,
            total,
            &mut iterations,
        ) {
            CoreStatus::Finished(basic_values) => {
                let residual: f64 = basis
                    .iter()
                    .zip(basic_values.iter())
                    .filter(|(&col, _)| col >= structural)
                    .map(|(_, &v)| v.max(0.0))
                    .sum();
                if residual > PHASE_ONE_TOLERANCE {
                    log::debug!("phase one left artificial mass {residual:.3e}; LP is infeasible");
                    return LpOutcome::Infeasible;
                }
            }
            CoreStatus::Singular => return LpOutcome::Singular,
            CoreStatus::Infeasible => return LpOutcome::Infeasible,
            CoreStatus::Unbounded => return LpOutcome::Unbounded,
            CoreStatus::MaxIter => return LpOutcome::MaxIter,
        }
    }

    let mut cost = Array1::<f64>::zeros(total);
    for j in 0..n {
        cost[j] = c[j];
    }

    // Artificials are barred from re-entering in phase two.
    match simplex_core(
        &tableau,
        &rhs,
        &cost,
        &mut basis,
        &mut nonbasis,
        structural,
        &mut iterations,
    ) {
        CoreStatus::Finished(basic_values) => {
            // A leftover artificial that regained mass means the original
            // system was never satisfied.
            for (slot, &col) in basis.iter().enumerate() {
                if col >= structural && basic_values[slot] > PHASE_ONE_TOLERANCE {
                    return LpOutcome::Infeasible;
                }
            }
            let mut x = Array1::<f64>::zeros(n);
            for (slot, &col) in basis.iter().enumerate() {
                if col < n {
                    x[col] = basic_values[slot].max(0.0);
                }
            }
            LpOutcome::Optimal(x)
        }
        CoreStatus::Singular => {
            log::debug!("basis matrix became singular after {iterations} pivots");
            LpOutcome::Singular
        }
        CoreStatus::Infeasible => LpOutcome::Infeasible,
        CoreStatus::Unbounded => LpOutcome::Unbounded,
        CoreStatus::MaxIter => {
            log::debug!("simplex stopped at the {MAX_SIMPLEX_ITERATIONS}-pivot limit");
            LpOutcome::MaxIter
        }
    }
}

/// One simplex phase: Dantzig entering rule, minimum-ratio leaving rule,
/// slot-preserving pivot bookkeeping. Columns at or beyond `entering_limit`
/// never enter the basis.
fn simplex_core(
    tableau: &Array2<f64>,
    rhs: &Array1<f64>,
    cost: &Array1<f64>,
    basis: &mut [usize],
    nonbasis: &mut [usize],
    entering_limit: usize,
    iterations: &mut usize,
) -> CoreStatus {
    let m = basis.len();

    loop {
        if *iterations >= MAX_SIMPLEX_ITERATIONS {
            return CoreStatus::MaxIter;
        }
        *iterations += 1;

        let mut basis_matrix = Array2::<f64>::zeros((m, m));
        for (slot, &col) in basis.iter().enumerate() {
            basis_matrix.column_mut(slot).assign(&tableau.column(col));
        }
        let basis_inverse = match invert_gauss_jordan(basis_matrix.view()) {
            Some(inverse) => inverse,
            None => return CoreStatus::Singular,
        };

        let basic_values = basis_inverse.dot(rhs);
        if basic_values
            .iter()
            .any(|&v| v < -BASIC_INFEASIBILITY_TOLERANCE)
        {
            return CoreStatus::Infeasible;
        }

        let basic_cost = Array1::from_iter(basis.iter().map(|&col| cost[col]));
        let duals = basic_cost.dot(&basis_inverse);

        let mut entering_slot = None;
        let mut most_negative = -FEASIBILITY_TOLERANCE;
        for (slot, &col) in nonbasis.iter().enumerate() {
            if col >= entering_limit {
                continue;
            }
            let reduced = cost[col] - duals.dot(&tableau.column(col));
            if reduced < most_negative {
                most_negative = reduced;
                entering_slot = Some(slot);
            }
        }
        let Some(slot) = entering_slot else {
            return CoreStatus::Finished(basic_values);
        };
        let entering = nonbasis[slot];

        let direction = basis_inverse.dot(&tableau.column(entering));
        let mut leaving = None;
        let mut best_ratio = f64::INFINITY;
        for i in 0..m {
            if direction[i] > FEASIBILITY_TOLERANCE {
                let ratio = basic_values[i].max(0.0) / direction[i];
                if ratio < best_ratio {
                    best_ratio = ratio;
                    leaving = Some(i);
                }
            }
        }
        let Some(leave) = leaving else {
            return CoreStatus::Unbounded;
        };

        nonbasis[slot] = basis[leave];
        basis[leave] = entering;
    }
}
