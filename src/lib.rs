#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod constraints;
pub mod estimate;
pub mod matrix;
pub mod simplex;

pub use basis::{
    generate_knot_vector, validate_knot_vector, BSplineBasis, BasisError, BasisEvalKind,
    BasisScratch,
};
pub use constraints::{
    build_constraint_system, Constraint, PointwiseOperator, SHAPE_GRID_POINTS,
};
pub use estimate::{fit, FitError, FitOptions, FitResult, Spline, DEFAULT_ORDER};
pub use matrix::{
    invert_gauss_jordan, solve_regularized_least_squares, DesignMatrix, ASSEMBLY_EPSILON,
};
pub use simplex::{solve_lp, LpOutcome, MAX_SIMPLEX_ITERATIONS};
