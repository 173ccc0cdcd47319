use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::basis::{generate_knot_vector, validate_knot_vector, BSplineBasis, BasisError};
use crate::constraints::{build_constraint_system, Constraint};
use crate::matrix::solve_regularized_least_squares;
use crate::simplex::{solve_lp, LpOutcome};

/// Spline order used when the caller does not choose one.
pub const DEFAULT_ORDER: usize = 4;

/// Step for the central-difference second-derivative evaluator on the result.
const CENTRAL_DIFFERENCE_STEP: f64 = 1e-6;

/// Coefficients are rounded to this many decimal places before the result is
/// assembled, to stabilize reported values across platforms.
const COEFFICIENT_SCALE: f64 = 1e12;

/// A comprehensive error type for everything that can end a fit call.
///
/// Internal solver failures (infeasible, unbounded, singular basis, iteration
/// limit) are not represented here: they are recovered by falling back to the
/// unconstrained least-squares path and never reach the caller.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid knot vector: {0}")]
    InvalidKnots(String),

    #[error("Unsupported pointwise operator {0:?}; expected \"=\", \"<=\" or \">=\".")]
    UnsupportedOperator(String),

    #[error("The regularized normal equations are singular; the design matrix is degenerate.")]
    SingularMatrix,

    #[error("Basis construction failed: {0}")]
    Basis(#[from] BasisError),
}

/// Options accepted by [`fit`]. Unknown JSON fields are ignored; every field
/// has a default so partial configurations deserialize cleanly.
///
/// `tau` is echoed into the result but does not alter the squared-error loss.
/// `weights`, `lambda`, `ic`, `num_knots`, `maxiter`, `tolerance` and
/// `degree` are accepted for interface compatibility and are currently inert.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FitOptions {
    pub order: usize,
    pub knots: Option<Vec<f64>>,
    pub constraints: Vec<Constraint>,
    pub tau: Option<f64>,
    pub weights: Option<Vec<f64>>,
    pub lambda: Option<f64>,
    pub ic: Option<String>,
    pub num_knots: Option<usize>,
    pub maxiter: Option<usize>,
    pub tolerance: Option<f64>,
    pub degree: Option<usize>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            order: DEFAULT_ORDER,
            knots: None,
            constraints: Vec::new(),
            tau: None,
            weights: None,
            lambda: None,
            ic: None,
            num_knots: None,
            maxiter: None,
            tolerance: None,
            degree: None,
        }
    }
}

/// The fitted piecewise polynomial: knots, order and coefficients, immutable
/// after the fit. The basis row machinery is rebuilt on demand from the
/// stored knot vector, so evaluation borrows nothing from the fitter.
#[derive(Clone, Debug, Serialize)]
pub struct Spline {
    basis: BSplineBasis,
    coefficients: Array1<f64>,
}

impl Spline {
    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.basis.knots()
    }

    pub fn order(&self) -> usize {
        self.basis.order()
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    /// s(x): one basis row dotted with the coefficients.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.basis.evaluate(x).dot(&self.coefficients)
    }

    /// s'(x) through the exact derivative basis.
    pub fn evaluate_derivative(&self, x: f64) -> f64 {
        self.basis.evaluate_derivative(x).dot(&self.coefficients)
    }

    /// s''(x) by central differences with h = 1e-6.
    ///
    /// This mirrors the reporting behavior of the original interface; the
    /// exact curvature is available from
    /// [`Spline::evaluate_second_derivative_exact`].
    pub fn evaluate_second_derivative(&self, x: f64) -> f64 {
        let h = CENTRAL_DIFFERENCE_STEP;
        (self.evaluate(x + h) - 2.0 * self.evaluate(x) + self.evaluate(x - h)) / (h * h)
    }

    /// s''(x) through the exact second-derivative basis.
    pub fn evaluate_second_derivative_exact(&self, x: f64) -> f64 {
        self.basis
            .evaluate_second_derivative(x)
            .dot(&self.coefficients)
    }
}

/// Outcome of a fit: the spline plus per-sample diagnostics. `error` is the
/// sum of squared residuals. `tau` and `lambda` echo the request; `sic` is
/// reserved for information-criterion smoothing selection and is not
/// populated.
#[derive(Clone, Debug, Serialize)]
pub struct FitResult {
    pub spline: Spline,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub error: f64,
    pub tau: Option<f64>,
    pub lambda: Option<f64>,
    pub sic: Option<f64>,
}

impl FitResult {
    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.spline.coefficients()
    }

    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.spline.knots()
    }

    pub fn order(&self) -> usize {
        self.spline.order()
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.spline.evaluate(x)
    }

    pub fn evaluate_second_derivative(&self, x: f64) -> f64 {
        self.spline.evaluate_second_derivative(x)
    }
}

/// Fits a constrained regression B-spline to the samples `(x[i], y[i])`.
///
/// The abscissae must be non-decreasing. When `options.knots` is absent a
/// clamped knot vector is generated so the basis has one coefficient per
/// sample. With no constraints (or an empty constraint system) the
/// coefficients come from ridged normal equations; with constraints they come
/// from a linear program minimizing the summed absolute residuals subject to
/// the constraint rows, and any solver failure falls back to the
/// unconstrained path.
pub fn fit(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    options: &FitOptions,
) -> Result<FitResult, FitError> {
    validate_data(x, y, options.order)?;

    let order = options.order;
    let knots = match &options.knots {
        Some(user_knots) => {
            validate_knot_vector(user_knots, order)?;
            Array1::from_vec(user_knots.clone())
        }
        None => generate_knot_vector(x, order),
    };
    let basis = BSplineBasis::new(knots, order)?;

    let design = basis.design_matrix(x)?;
    let design_dense = design.to_dense();

    let mut coefficients = None;
    if !options.constraints.is_empty() {
        let x_min = x[0];
        let x_max = x[x.len() - 1];
        let (constraint_matrix, constraint_rhs) =
            build_constraint_system(&basis, &options.constraints, x_min, x_max);
        if constraint_matrix.nrows() > 0 {
            coefficients =
                solve_constrained(&design_dense, y, &constraint_matrix, &constraint_rhs);
        }
    }

    let mut coefficients = match coefficients {
        Some(solution) => solution,
        None => solve_regularized_least_squares(design_dense.view(), y)
            .ok_or(FitError::SingularMatrix)?,
    };
    coefficients.mapv_inplace(|v| (v * COEFFICIENT_SCALE).round() / COEFFICIENT_SCALE);

    let fitted = design.matrix_vector_multiply(&coefficients);
    let residuals = &y.to_owned() - &fitted;
    let error = residuals.dot(&residuals);

    Ok(FitResult {
        spline: Spline {
            basis,
            coefficients,
        },
        fitted,
        residuals,
        error,
        tau: options.tau,
        lambda: options.lambda,
        sic: None,
    })
}

fn validate_data(x: ArrayView1<f64>, y: ArrayView1<f64>, order: usize) -> Result<(), FitError> {
    if x.len() != y.len() {
        return Err(FitError::InvalidInput(format!(
            "x and y must have the same length ({} != {})",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 2 {
        return Err(FitError::InvalidInput(format!(
            "at least 2 data points are required, got {}",
            x.len()
        )));
    }
    if order < 1 {
        return Err(FitError::InvalidInput(
            "spline order must be at least 1".to_string(),
        ));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::InvalidInput(
            "data contains non-finite values".to_string(),
        ));
    }
    for i in 0..(x.len() - 1) {
        if x[i] > x[i + 1] {
            return Err(FitError::InvalidInput(
                "data abscissae must be non-decreasing".to_string(),
            ));
        }
    }
    Ok(())
}

/// Solves the constrained fit as a linear program over split coefficients and
/// per-sample residual bounds.
///
/// Variables are [c+, c-, r] with c = c+ - c- free in sign and r >= 0
/// bounding the absolute residuals from both sides; the objective minimizes
/// the residual sum, and the shape rows act on c+ - c-. Returns `None` on any
/// non-optimal outcome, which sends the fitter down the least-squares path.
fn solve_constrained(
    design: &Array2<f64>,
    y: ArrayView1<f64>,
    constraint_matrix: &Array2<f64>,
    constraint_rhs: &Array1<f64>,
) -> Option<Array1<f64>> {
    let num_samples = design.nrows();
    let num_coefficients = design.ncols();
    let num_constraint_rows = constraint_matrix.nrows();

    let num_variables = 2 * num_coefficients + num_samples;
    let num_rows = 2 * num_samples + num_constraint_rows;

    let mut lp_matrix = Array2::<f64>::zeros((num_rows, num_variables));
    let mut lp_rhs = Array1::<f64>::zeros(num_rows);

    for i in 0..num_samples {
        for j in 0..num_coefficients {
            let v = design[[i, j]];
            lp_matrix[[i, j]] = v;
            lp_matrix[[i, num_coefficients + j]] = -v;
            lp_matrix[[num_samples + i, j]] = -v;
            lp_matrix[[num_samples + i, num_coefficients + j]] = v;
        }
        lp_matrix[[i, 2 * num_coefficients + i]] = -1.0;
        lp_matrix[[num_samples + i, 2 * num_coefficients + i]] = -1.0;
        lp_rhs[i] = y[i];
        lp_rhs[num_samples + i] = -y[i];
    }
    for q in 0..num_constraint_rows {
        for j in 0..num_coefficients {
            let v = constraint_matrix[[q, j]];
            lp_matrix[[2 * num_samples + q, j]] = v;
            lp_matrix[[2 * num_samples + q, num_coefficients + j]] = -v;
        }
        lp_rhs[2 * num_samples + q] = constraint_rhs[q];
    }

    let mut lp_cost = Array1::<f64>::zeros(num_variables);
    for i in 0..num_samples {
        lp_cost[2 * num_coefficients + i] = 1.0;
    }

    match solve_lp(lp_matrix.view(), lp_rhs.view(), lp_cost.view()) {
        LpOutcome::Optimal(solution) if solution.len() == num_variables => {
            let mut coefficients = Array1::<f64>::zeros(num_coefficients);
            for j in 0..num_coefficients {
                coefficients[j] = solution[j] - solution[num_coefficients + j];
            }
            Some(coefficients)
        }
        outcome => {
            log::warn!(
                "constrained solve fell back to least squares: {}",
                outcome_label(&outcome)
            );
            None
        }
    }
}

fn outcome_label(outcome: &LpOutcome) -> &'static str {
    match outcome {
        LpOutcome::Optimal(_) => "unexpected solution shape",
        LpOutcome::Infeasible => "constraint system is infeasible",
        LpOutcome::Unbounded => "objective is unbounded",
        LpOutcome::Singular => "basis matrix became singular",
        LpOutcome::MaxIter => "iteration limit reached",
    }
}
