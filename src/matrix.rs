use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Entries with magnitude at or below this threshold are dropped during
/// triplet assembly.
pub const ASSEMBLY_EPSILON: f64 = 1e-10;

/// Pivot magnitudes below this threshold signal a singular matrix during
/// Gauss-Jordan elimination.
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Tikhonov ridge added to the normal-equations diagonal. Keeps the solve
/// well-posed for near-rank-deficient design matrices (coincident knots,
/// near-collinear abscissae).
const RIDGE_LAMBDA: f64 = 1e-10;

/// Design-matrix representation shared by the basis and fitting layers.
///
/// Matrices built from triplets enter as `Sparse`; callers that need a dense
/// factorization materialize once with [`DesignMatrix::to_dense`]. Sparsity is
/// a construction-time concept here: at most order+1 entries per row survive
/// assembly, but all downstream solves are dense.
#[derive(Clone)]
pub enum DesignMatrix {
    Dense(Array2<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.nrows(),
            Self::Sparse(matrix) => matrix.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.ncols(),
            Self::Sparse(matrix) => matrix.ncols(),
        }
    }

    /// Materializes the matrix as a dense row-major `Array2`.
    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.clone(),
            Self::Sparse(matrix) => {
                let mut out = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
                let (symbolic, values) = matrix.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..matrix.ncols() {
                    let start = col_ptr[col];
                    let end = col_ptr[col + 1];
                    for idx in start..end {
                        out[[row_idx[idx], col]] = values[idx];
                    }
                }
                out
            }
        }
    }

    /// Computes `self * vector` without densifying the sparse representation.
    pub fn matrix_vector_multiply(&self, vector: &Array1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.dot(vector),
            Self::Sparse(matrix) => {
                let mut output = Array1::<f64>::zeros(matrix.nrows());
                let (symbolic, values) = matrix.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..matrix.ncols() {
                    let start = col_ptr[col];
                    let end = col_ptr[col + 1];
                    let x = vector[col];
                    for idx in start..end {
                        output[row_idx[idx]] += values[idx] * x;
                    }
                }
                output
            }
        }
    }
}

impl From<Array2<f64>> for DesignMatrix {
    fn from(value: Array2<f64>) -> Self {
        Self::Dense(value)
    }
}

impl From<SparseColMat<usize, f64>> for DesignMatrix {
    fn from(value: SparseColMat<usize, f64>) -> Self {
        Self::Sparse(value)
    }
}

/// Inverts a square matrix by Gauss-Jordan elimination with partial pivoting
/// on the augmented system (A | I).
///
/// Returns `None` when the largest available pivot in some column drops below
/// the pivot tolerance. Singularity is an expected value here, not an error:
/// the simplex solver probes bases that are frequently singular.
pub fn invert_gauss_jordan(a: ArrayView2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return None;
    }
    if n == 0 {
        return Some(Array2::zeros((0, 0)));
    }

    let mut aug = Array2::<f64>::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_mag = aug[[col, col]].abs();
        for row in (col + 1)..n {
            let mag = aug[[row, col]].abs();
            if mag > pivot_mag {
                pivot_mag = mag;
                pivot_row = row;
            }
        }
        if pivot_mag < PIVOT_TOLERANCE {
            return None;
        }

        if pivot_row != col {
            for j in 0..(2 * n) {
                aug.swap([col, j], [pivot_row, j]);
            }
        }

        let pivot = aug[[col, col]];
        for j in 0..(2 * n) {
            aug[[col, j]] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..(2 * n) {
                aug[[row, j]] -= factor * aug[[col, j]];
            }
        }
    }

    let mut inverse = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            inverse[[i, j]] = aug[[i, n + j]];
        }
    }
    Some(inverse)
}

/// Solves the least-squares problem `min ||A x - b||` through ridged normal
/// equations: `(A^T A + lambda I) x = A^T b` with a tiny Tikhonov lambda.
///
/// Accepts rectangular `A` (m rows, n columns) and returns an n-vector.
/// Returns `None` only when the ridged normal matrix is itself singular.
pub fn solve_regularized_least_squares(
    a: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Option<Array1<f64>> {
    let n = a.ncols();
    let at = a.t();
    let mut normal = at.dot(&a);
    for i in 0..n {
        normal[[i, i]] += RIDGE_LAMBDA;
    }
    let rhs = at.dot(&b);
    let inverse = invert_gauss_jordan(normal.view())?;
    Some(inverse.dot(&rhs))
}
