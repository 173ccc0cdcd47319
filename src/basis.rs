use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use thiserror::Error;

use crate::estimate::FitError;
use crate::matrix::{DesignMatrix, ASSEMBLY_EPSILON};

/// Minimum number of evaluation points before design-matrix assembly fans out
/// across threads.
const PAR_THRESHOLD: usize = 128;
/// Rows handled per parallel work item during triplet collection.
const PAR_CHUNK: usize = 256;
/// Denominators below this magnitude are coincident-knot artifacts; the
/// affected quotient is taken as zero (0/0 -> 0).
const KNOT_SPAN_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline order must be at least 1, but was {0}.")]
    InvalidOrder(usize),

    #[error(
        "Insufficient knots for order {order}: need at least {required} knots but only {provided} were provided."
    )]
    InsufficientKnots {
        order: usize,
        required: usize,
        provided: usize,
    },

    #[error(
        "The provided knot vector is invalid: {0}. It must be non-decreasing and contain only finite values."
    )]
    InvalidKnotVector(String),

    #[error("Unsupported derivative order {0}; only 1 and 2 are supported.")]
    UnsupportedDerivativeOrder(usize),

    #[error("Failed to build sparse basis matrix: {0}")]
    SparseCreation(String),
}

/// Which quantity a basis row evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasisEvalKind {
    Value,
    FirstDerivative,
    SecondDerivative,
}

impl BasisEvalKind {
    fn derivative_order(self) -> usize {
        match self {
            Self::Value => 0,
            Self::FirstDerivative => 1,
            Self::SecondDerivative => 2,
        }
    }
}

/// Scratch buffers reused across evaluation points to keep the row loops
/// allocation-free. `left`/`right`/`values` drive the de Boor triangle; `ndu`
/// and the alternating `a` rows drive the derivative cascade.
#[derive(Clone, Debug)]
pub struct BasisScratch {
    left: Vec<f64>,
    right: Vec<f64>,
    values: Vec<f64>,
    ndu: Vec<f64>,
    a_prev: Vec<f64>,
    a_next: Vec<f64>,
}

impl BasisScratch {
    pub fn new(order: usize) -> Self {
        let len = order + 1;
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
            values: vec![0.0; len],
            ndu: vec![0.0; len * len],
            a_prev: vec![0.0; len],
            a_next: vec![0.0; len],
        }
    }
}

/// Generates the clamped knot vector the fitter uses when the caller supplies
/// none.
///
/// For `n` abscissae and order `k`: k+1 copies of `x[0]`, then (when
/// n > k+1) n-k-1 interior knots equally spaced strictly inside
/// (x[0], x[n-1]), then k+1 copies of `x[n-1]`. With enough data the result
/// has length n+k+1, so the basis carries exactly n coefficients and the
/// unconstrained fit interpolates.
pub fn generate_knot_vector(x: ArrayView1<f64>, order: usize) -> Array1<f64> {
    let n = x.len();
    let x_min = x[0];
    let x_max = x[n - 1];

    let interior = n.saturating_sub(order + 1);
    let mut knots = Vec::with_capacity(2 * (order + 1) + interior);

    for _ in 0..=order {
        knots.push(x_min);
    }
    if interior > 0 {
        let step = (x_max - x_min) / (n - order) as f64;
        for i in 1..=interior {
            knots.push(x_min + i as f64 * step);
        }
    }
    for _ in 0..=order {
        knots.push(x_max);
    }

    Array1::from_vec(knots)
}

/// Validates a caller-supplied knot vector before it backs a fit.
///
/// Requires at least 2·order knots, all finite and non-decreasing; anything
/// else is a [`FitError::InvalidKnots`].
pub fn validate_knot_vector(knots: &[f64], order: usize) -> Result<(), FitError> {
    if knots.len() < 2 * order {
        return Err(FitError::InvalidKnots(format!(
            "need at least {} knots for order {}, got {}",
            2 * order,
            order,
            knots.len()
        )));
    }
    if knots.iter().any(|k| !k.is_finite()) {
        return Err(FitError::InvalidKnots(
            "knot vector contains non-finite values".to_string(),
        ));
    }
    for i in 0..(knots.len() - 1) {
        if knots[i] > knots[i + 1] {
            return Err(FitError::InvalidKnots(
                "knot vector is not non-decreasing".to_string(),
            ));
        }
    }
    Ok(())
}

/// An immutable B-spline basis backed by a knot vector and an order.
///
/// `order` is the recurrence depth: at any point of the domain exactly
/// order+1 basis functions are active, and the basis of function `i` is
/// supported on [T\[i\], T\[i+order+1\]]. The number of coefficients is
/// |T| - order - 1.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BSplineBasis {
    knots: Array1<f64>,
    order: usize,
}

impl BSplineBasis {
    pub fn new(knots: Array1<f64>, order: usize) -> Result<Self, BasisError> {
        if order < 1 {
            return Err(BasisError::InvalidOrder(order));
        }
        let required = order + 2;
        if knots.len() < required {
            return Err(BasisError::InsufficientKnots {
                order,
                required,
                provided: knots.len(),
            });
        }
        if knots.iter().any(|k| !k.is_finite()) {
            return Err(BasisError::InvalidKnotVector(
                "knot vector contains non-finite values".to_string(),
            ));
        }
        for i in 0..(knots.len() - 1) {
            if knots[i] > knots[i + 1] {
                return Err(BasisError::InvalidKnotVector(
                    "knot vector is not non-decreasing".to_string(),
                ));
            }
        }
        Ok(Self { knots, order })
    }

    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.knots.view()
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn num_coefficients(&self) -> usize {
        self.knots.len() - self.order - 1
    }

    /// Active evaluation interval [T\[order\], T\[N\]].
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[self.order], self.knots[self.num_coefficients()])
    }

    /// Binary search for the span index s with T\[s\] <= x < T\[s+1\].
    ///
    /// Boundary policy: x >= T\[N\] selects N-1, x <= T\[order\] selects
    /// `order`. Ties at an interior knot resolve to the left span.
    pub fn find_span(&self, x: f64) -> usize {
        let n = self.num_coefficients();
        if x >= self.knots[n] {
            return n - 1;
        }
        if x <= self.knots[self.order] {
            return self.order;
        }
        let mut low = self.order;
        let mut high = n;
        let mut mid = (low + high) / 2;
        while x < self.knots[mid] || x >= self.knots[mid + 1] {
            if x < self.knots[mid] {
                high = mid;
            } else {
                low = mid;
            }
            mid = (low + high) / 2;
        }
        mid
    }

    /// De Boor triangular recurrence. Fills `scratch.values[0..=order]` with
    /// the active functions (B_{span-order}, ..., B_{span}) at `x`.
    fn active_basis_into(&self, span: usize, x: f64, scratch: &mut BasisScratch) {
        let k = self.order;
        let left = &mut scratch.left;
        let right = &mut scratch.right;
        let values = &mut scratch.values;

        values[0] = 1.0;
        for j in 1..=k {
            left[j] = x - self.knots[span + 1 - j];
            right[j] = self.knots[span + j] - x;

            let mut saved = 0.0;
            for r in 0..j {
                let den = right[r + 1] + left[j - r];
                let temp = if den.abs() > KNOT_SPAN_TOLERANCE {
                    values[r] / den
                } else {
                    0.0
                };
                values[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            values[j] = saved;
        }
    }

    /// Derivative form of the recurrence (Piegl & Tiller A2.3, restricted to
    /// one target order). Fills `scratch.values[0..=order]` with the
    /// derivative-`d` values of the active functions at `x`.
    ///
    /// Builds the upper-triangular `ndu` table of intermediate basis values
    /// and knot differences, then runs the divided-difference cascade over the
    /// two alternating `a` rows, finalized by the falling factorial
    /// k(k-1)...(k-d+1). The j1/j2 bounds on the inner loop keep every `ndu`
    /// access in range even at the edges of the active window.
    fn active_derivative_into(&self, span: usize, x: f64, d: usize, scratch: &mut BasisScratch) {
        let k = self.order;
        let width = k + 1;
        debug_assert!(d >= 1 && d <= k);

        let left = &mut scratch.left;
        let right = &mut scratch.right;
        let ndu = &mut scratch.ndu;

        // ndu[j][r] (j > r): knot-difference right[r+1] + left[j-r].
        // ndu[r][j] (r <= j): intermediate basis value of degree j.
        ndu[0] = 1.0;
        for j in 1..=k {
            left[j] = x - self.knots[span + 1 - j];
            right[j] = self.knots[span + j] - x;

            let mut saved = 0.0;
            for r in 0..j {
                let den = right[r + 1] + left[j - r];
                ndu[j * width + r] = den;
                let temp = if den.abs() > KNOT_SPAN_TOLERANCE {
                    ndu[r * width + (j - 1)] / den
                } else {
                    0.0
                };
                ndu[r * width + j] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            ndu[j * width + j] = saved;
        }

        let a_prev = &mut scratch.a_prev;
        let a_next = &mut scratch.a_next;
        let values = &mut scratch.values;

        let divide = |num: f64, den: f64| {
            if den.abs() > KNOT_SPAN_TOLERANCE {
                num / den
            } else {
                0.0
            }
        };

        for r in 0..=k {
            a_prev.fill(0.0);
            a_next.fill(0.0);
            a_prev[0] = 1.0;

            let mut der = 0.0;
            for kk in 1..=d {
                let mut dsum = 0.0;
                let rk = r as i64 - kk as i64;
                let pk = k - kk;

                if r >= kk {
                    let rk_u = rk as usize;
                    a_next[0] = divide(a_prev[0], ndu[(pk + 1) * width + rk_u]);
                    dsum += a_next[0] * ndu[rk_u * width + pk];
                }

                let j1 = if rk >= -1 { 1usize } else { (-rk) as usize };
                let j2 = if r as i64 - 1 <= pk as i64 { kk - 1 } else { k - r };
                for j in j1..=j2 {
                    let col = (rk + j as i64) as usize;
                    a_next[j] = divide(a_prev[j] - a_prev[j - 1], ndu[(pk + 1) * width + col]);
                    dsum += a_next[j] * ndu[col * width + pk];
                }

                if r <= pk {
                    a_next[kk] = divide(-a_prev[kk - 1], ndu[(pk + 1) * width + r]);
                    dsum += a_next[kk] * ndu[r * width + pk];
                }

                der = dsum;
                std::mem::swap(a_prev, a_next);
            }
            values[r] = der;
        }

        // Falling factorial k * (k-1) * ... * (k-d+1).
        let mut factor = 1.0;
        for i in 0..d {
            factor *= (k - i) as f64;
        }
        for v in values.iter_mut() {
            *v *= factor;
        }
    }

    /// Emits the non-zero entries of one basis row through `emit(column,
    /// value)`. Entries at or below the assembly epsilon are dropped.
    fn row_entries<F: FnMut(usize, f64)>(
        &self,
        x: f64,
        kind: BasisEvalKind,
        scratch: &mut BasisScratch,
        mut emit: F,
    ) {
        let span = self.find_span(x);
        match kind.derivative_order() {
            0 => self.active_basis_into(span, x, scratch),
            d if d <= self.order => self.active_derivative_into(span, x, d, scratch),
            // Derivatives beyond the polynomial order vanish identically.
            _ => return,
        }
        let start = span - self.order;
        for (i, &value) in scratch.values.iter().enumerate() {
            if value.abs() > ASSEMBLY_EPSILON {
                emit(start + i, value);
            }
        }
    }

    fn dense_row(&self, x: f64, kind: BasisEvalKind) -> Array1<f64> {
        let mut scratch = BasisScratch::new(self.order);
        let mut row = Array1::<f64>::zeros(self.num_coefficients());
        self.row_entries(x, kind, &mut scratch, |col, value| row[col] = value);
        row
    }

    /// Dense basis row at `x`: (B_0(x), ..., B_{N-1}(x)), at most order+1
    /// entries non-zero.
    pub fn evaluate(&self, x: f64) -> Array1<f64> {
        self.dense_row(x, BasisEvalKind::Value)
    }

    /// Dense first-derivative row at `x`.
    pub fn evaluate_derivative(&self, x: f64) -> Array1<f64> {
        self.dense_row(x, BasisEvalKind::FirstDerivative)
    }

    /// Dense second-derivative row at `x`. Identically zero when the order
    /// is 1.
    pub fn evaluate_second_derivative(&self, x: f64) -> Array1<f64> {
        self.dense_row(x, BasisEvalKind::SecondDerivative)
    }

    fn assemble(&self, points: &[f64], kind: BasisEvalKind) -> Result<DesignMatrix, BasisError> {
        let nrows = points.len();
        let num_basis = self.num_coefficients();
        let support = self.order + 1;

        let triplets: Vec<Triplet<usize, usize, f64>> = if nrows >= PAR_THRESHOLD {
            let chunks: Vec<Vec<Triplet<usize, usize, f64>>> = points
                .par_chunks(PAR_CHUNK)
                .enumerate()
                .map_init(
                    || BasisScratch::new(self.order),
                    |scratch, (chunk_idx, chunk)| {
                        let base_row = chunk_idx * PAR_CHUNK;
                        let mut local = Vec::with_capacity(chunk.len() * support);
                        for (i, &x) in chunk.iter().enumerate() {
                            let row = base_row + i;
                            self.row_entries(x, kind, scratch, |col, value| {
                                local.push(Triplet::new(row, col, value));
                            });
                        }
                        local
                    },
                )
                .collect();

            let mut flattened = Vec::with_capacity(nrows * support);
            for mut chunk in chunks {
                flattened.append(&mut chunk);
            }
            flattened
        } else {
            let mut scratch = BasisScratch::new(self.order);
            let mut triplets = Vec::with_capacity(nrows * support);
            for (row, &x) in points.iter().enumerate() {
                self.row_entries(x, kind, &mut scratch, |col, value| {
                    triplets.push(Triplet::new(row, col, value));
                });
            }
            triplets
        };

        let sparse = SparseColMat::try_new_from_triplets(nrows, num_basis, &triplets)
            .map_err(|err| BasisError::SparseCreation(format!("{err:?}")))?;
        Ok(DesignMatrix::from(sparse))
    }

    /// Builds the m x N design matrix whose row i is the basis row at
    /// `xs[i]`. Assembled as triplets and stored sparse until a dense solve
    /// materializes it.
    pub fn design_matrix(&self, xs: ArrayView1<f64>) -> Result<DesignMatrix, BasisError> {
        let owned;
        let points: &[f64] = match xs.as_slice() {
            Some(slice) => slice,
            None => {
                owned = xs.to_vec();
                &owned
            }
        };
        self.assemble(points, BasisEvalKind::Value)
    }

    /// Builds a derivative design matrix over `xs` interleaved with the
    /// midpoints of consecutive abscissae, giving 2m-1 rows: row 2i is
    /// `xs[i]`, row 2i+1 the midpoint of `xs[i]` and `xs[i+1]`.
    ///
    /// The midpoint interleaving is a preserved quirk of the original
    /// interface; the shape-constraint path samples its own grid instead.
    pub fn derivative_matrix(
        &self,
        xs: ArrayView1<f64>,
        derivative_order: usize,
    ) -> Result<DesignMatrix, BasisError> {
        let kind = match derivative_order {
            1 => BasisEvalKind::FirstDerivative,
            2 => BasisEvalKind::SecondDerivative,
            other => return Err(BasisError::UnsupportedDerivativeOrder(other)),
        };

        let mut points = Vec::with_capacity(xs.len().saturating_mul(2).saturating_sub(1));
        for i in 0..xs.len() {
            points.push(xs[i]);
            if i + 1 < xs.len() {
                points.push(0.5 * (xs[i] + xs[i + 1]));
            }
        }
        self.assemble(&points, kind)
    }
}
