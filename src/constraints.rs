use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::basis::BSplineBasis;
use crate::estimate::FitError;

/// Number of interior sample points used to discretize monotonicity and
/// curvature constraints. Sufficient for the supported orders and smooth knot
/// spacing; a hyperparameter, not a natural law.
pub const SHAPE_GRID_POINTS: usize = 100;

/// Comparison operator of a pointwise constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointwiseOperator {
    Equal,
    LessEq,
    GreaterEq,
}

impl fmt::Display for PointwiseOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Equal => "=",
            Self::LessEq => "<=",
            Self::GreaterEq => ">=",
        };
        f.write_str(token)
    }
}

impl FromStr for PointwiseOperator {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Self::Equal),
            "<=" => Ok(Self::LessEq),
            ">=" => Ok(Self::GreaterEq),
            other => Err(FitError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl Serialize for PointwiseOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PointwiseOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        token.parse().map_err(serde::de::Error::custom)
    }
}

/// A qualitative shape requirement on the fitted spline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Constraint {
    /// s'(x) >= 0 (increasing) or s'(x) <= 0 over the data range.
    Monotone { increasing: bool },
    /// s''(x) >= 0 when `convex`, s''(x) <= 0 otherwise.
    Convex {
        #[serde(default = "default_convex")]
        convex: bool,
    },
    /// Shorthand for `Convex { convex: false }`.
    Concave,
    /// s and s' agree at the two ends of the data range.
    Periodic,
    /// s(x) compared against y under `operator`.
    Pointwise {
        x: f64,
        y: f64,
        operator: PointwiseOperator,
    },
}

fn default_convex() -> bool {
    true
}

/// The interior constraint grid: `SHAPE_GRID_POINTS` equally spaced samples
/// strictly inside (x_min, x_max).
pub(crate) fn shape_grid(x_min: f64, x_max: f64) -> Vec<f64> {
    let step = (x_max - x_min) / (SHAPE_GRID_POINTS as f64 + 1.0);
    (1..=SHAPE_GRID_POINTS)
        .map(|i| x_min + i as f64 * step)
        .collect()
}

/// Builds the stacked inequality system `A c <= b` over the spline
/// coefficients for the given constraints.
///
/// One block per constraint, vertically concatenated; every equality is
/// realized as a pair of opposite-sign inequality rows so the solver sees a
/// single uniform (A, b). An empty constraint list yields a 0 x N system.
pub fn build_constraint_system(
    basis: &BSplineBasis,
    constraints: &[Constraint],
    x_min: f64,
    x_max: f64,
) -> (Array2<f64>, Array1<f64>) {
    let num_coefficients = basis.num_coefficients();
    let mut rows: Vec<Array1<f64>> = Vec::new();
    let mut rhs: Vec<f64> = Vec::new();

    let mut push = |row: Array1<f64>, bound: f64| {
        rows.push(row);
        rhs.push(bound);
    };

    for constraint in constraints {
        match constraint {
            Constraint::Monotone { increasing } => {
                for xi in shape_grid(x_min, x_max) {
                    let derivative = basis.evaluate_derivative(xi);
                    // increasing: s'(xi) >= 0  <=>  -B'(xi).c <= 0
                    let row = if *increasing { -derivative } else { derivative };
                    push(row, 0.0);
                }
            }
            Constraint::Convex { convex } => {
                push_curvature_rows(basis, *convex, x_min, x_max, &mut push);
            }
            Constraint::Concave => {
                push_curvature_rows(basis, false, x_min, x_max, &mut push);
            }
            Constraint::Periodic => {
                let value_gap = basis.evaluate(x_min) - basis.evaluate(x_max);
                let slope_gap =
                    basis.evaluate_derivative(x_min) - basis.evaluate_derivative(x_max);
                push(value_gap.clone(), 0.0);
                push(-value_gap, 0.0);
                push(slope_gap.clone(), 0.0);
                push(-slope_gap, 0.0);
            }
            Constraint::Pointwise { x, y, operator } => {
                let row = basis.evaluate(*x);
                match operator {
                    PointwiseOperator::Equal => {
                        push(row.clone(), *y);
                        push(-row, -*y);
                    }
                    PointwiseOperator::LessEq => push(row, *y),
                    PointwiseOperator::GreaterEq => push(-row, -*y),
                }
            }
        }
    }

    let mut a = Array2::<f64>::zeros((rows.len(), num_coefficients));
    for (i, row) in rows.iter().enumerate() {
        a.row_mut(i).assign(row);
    }
    (a, Array1::from_vec(rhs))
}

fn push_curvature_rows<F: FnMut(Array1<f64>, f64)>(
    basis: &BSplineBasis,
    convex: bool,
    x_min: f64,
    x_max: f64,
    push: &mut F,
) {
    for xi in shape_grid(x_min, x_max) {
        let curvature = basis.evaluate_second_derivative(xi);
        // convex: s''(xi) >= 0  <=>  -B''(xi).c <= 0
        let row = if convex { -curvature } else { curvature };
        push(row, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn basis_on_unit_interval() -> BSplineBasis {
        let knots = array![0.0, 0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0, 1.0];
        BSplineBasis::new(knots, 3).expect("valid basis")
    }

    #[test]
    fn operator_parsing_round_trip() {
        assert_eq!("=".parse::<PointwiseOperator>().unwrap(), PointwiseOperator::Equal);
        assert_eq!("<=".parse::<PointwiseOperator>().unwrap(), PointwiseOperator::LessEq);
        assert_eq!(">=".parse::<PointwiseOperator>().unwrap(), PointwiseOperator::GreaterEq);
        assert_eq!(PointwiseOperator::GreaterEq.to_string(), ">=");
    }

    #[test]
    fn operator_rejects_unknown_token() {
        let err = "!=".parse::<PointwiseOperator>().unwrap_err();
        assert!(matches!(err, FitError::UnsupportedOperator(token) if token == "!="));
    }

    #[test]
    fn operator_deserialization_surfaces_unsupported_token() {
        let parsed: Result<PointwiseOperator, _> = serde_json::from_str("\"<\"");
        let message = parsed.unwrap_err().to_string();
        assert!(message.contains("<"), "unexpected message: {message}");
    }

    #[test]
    fn constraint_json_shapes() {
        let monotone: Constraint =
            serde_json::from_str(r#"{"type": "monotone", "increasing": true}"#).unwrap();
        assert_eq!(monotone, Constraint::Monotone { increasing: true });

        // The convex flag defaults to true when omitted.
        let convex: Constraint = serde_json::from_str(r#"{"type": "convex"}"#).unwrap();
        assert_eq!(convex, Constraint::Convex { convex: true });

        let concave: Constraint =
            serde_json::from_str(r#"{"type": "convex", "convex": false}"#).unwrap();
        assert_eq!(concave, Constraint::Convex { convex: false });

        let pointwise: Constraint =
            serde_json::from_str(r#"{"type": "pointwise", "x": 3.0, "y": 9.0, "operator": "="}"#)
                .unwrap();
        assert_eq!(
            pointwise,
            Constraint::Pointwise {
                x: 3.0,
                y: 9.0,
                operator: PointwiseOperator::Equal
            }
        );

        let unknown: Result<Constraint, _> = serde_json::from_str(r#"{"type": "wiggly"}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn shape_grid_stays_interior() {
        let grid = shape_grid(1.0, 5.0);
        assert_eq!(grid.len(), SHAPE_GRID_POINTS);
        assert!(grid.iter().all(|&x| x > 1.0 && x < 5.0));
        for pair in grid.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn empty_constraints_yield_empty_system() {
        let basis = basis_on_unit_interval();
        let (a, b) = build_constraint_system(&basis, &[], 0.0, 1.0);
        assert_eq!(a.nrows(), 0);
        assert_eq!(a.ncols(), basis.num_coefficients());
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn monotone_rows_negate_derivative_rows() {
        let basis = basis_on_unit_interval();
        let (a, b) = build_constraint_system(
            &basis,
            &[Constraint::Monotone { increasing: true }],
            0.0,
            1.0,
        );
        assert_eq!(a.nrows(), SHAPE_GRID_POINTS);
        assert!(b.iter().all(|&v| v == 0.0));

        let grid = shape_grid(0.0, 1.0);
        let derivative = basis.evaluate_derivative(grid[0]);
        for j in 0..basis.num_coefficients() {
            assert_abs_diff_eq!(a[[0, j]], -derivative[j], epsilon = 1e-14);
        }
    }

    #[test]
    fn decreasing_rows_flip_sign() {
        let basis = basis_on_unit_interval();
        let (increasing, _) = build_constraint_system(
            &basis,
            &[Constraint::Monotone { increasing: true }],
            0.0,
            1.0,
        );
        let (decreasing, _) = build_constraint_system(
            &basis,
            &[Constraint::Monotone { increasing: false }],
            0.0,
            1.0,
        );
        for j in 0..basis.num_coefficients() {
            assert_abs_diff_eq!(increasing[[3, j]], -decreasing[[3, j]], epsilon = 1e-14);
        }
    }

    #[test]
    fn concave_matches_convex_false() {
        let basis = basis_on_unit_interval();
        let (from_flag, _) = build_constraint_system(
            &basis,
            &[Constraint::Convex { convex: false }],
            0.0,
            1.0,
        );
        let (from_variant, _) =
            build_constraint_system(&basis, &[Constraint::Concave], 0.0, 1.0);
        assert_eq!(from_flag, from_variant);
    }

    #[test]
    fn periodic_emits_two_opposed_equality_pairs() {
        let basis = basis_on_unit_interval();
        let (a, b) = build_constraint_system(&basis, &[Constraint::Periodic], 0.0, 1.0);
        assert_eq!(a.nrows(), 4);
        assert!(b.iter().all(|&v| v == 0.0));

        let expected = basis.evaluate(0.0) - basis.evaluate(1.0);
        for j in 0..basis.num_coefficients() {
            assert_abs_diff_eq!(a[[0, j]], expected[j], epsilon = 1e-14);
            assert_abs_diff_eq!(a[[1, j]], -expected[j], epsilon = 1e-14);
        }
    }

    #[test]
    fn pointwise_rows_per_operator() {
        let basis = basis_on_unit_interval();

        let (eq, eq_rhs) = build_constraint_system(
            &basis,
            &[Constraint::Pointwise {
                x: 0.5,
                y: 2.0,
                operator: PointwiseOperator::Equal,
            }],
            0.0,
            1.0,
        );
        assert_eq!(eq.nrows(), 2);
        assert_abs_diff_eq!(eq_rhs[0], 2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(eq_rhs[1], -2.0, epsilon = 1e-15);

        let (le, le_rhs) = build_constraint_system(
            &basis,
            &[Constraint::Pointwise {
                x: 0.5,
                y: 2.0,
                operator: PointwiseOperator::LessEq,
            }],
            0.0,
            1.0,
        );
        assert_eq!(le.nrows(), 1);
        assert_abs_diff_eq!(le_rhs[0], 2.0, epsilon = 1e-15);

        let (ge, ge_rhs) = build_constraint_system(
            &basis,
            &[Constraint::Pointwise {
                x: 0.5,
                y: 2.0,
                operator: PointwiseOperator::GreaterEq,
            }],
            0.0,
            1.0,
        );
        assert_eq!(ge.nrows(), 1);
        assert_abs_diff_eq!(ge_rhs[0], -2.0, epsilon = 1e-15);
        let row = basis.evaluate(0.5);
        for j in 0..basis.num_coefficients() {
            assert_abs_diff_eq!(ge[[0, j]], -row[j], epsilon = 1e-14);
        }
    }

    #[test]
    fn blocks_stack_with_running_offsets() {
        let basis = basis_on_unit_interval();
        let (a, b) = build_constraint_system(
            &basis,
            &[
                Constraint::Monotone { increasing: true },
                Constraint::Pointwise {
                    x: 0.25,
                    y: 1.0,
                    operator: PointwiseOperator::Equal,
                },
            ],
            0.0,
            1.0,
        );
        assert_eq!(a.nrows(), SHAPE_GRID_POINTS + 2);
        assert_eq!(b.len(), SHAPE_GRID_POINTS + 2);
        // The pointwise pair lands after the monotone block.
        assert_abs_diff_eq!(b[SHAPE_GRID_POINTS], 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(b[SHAPE_GRID_POINTS + 1], -1.0, epsilon = 1e-15);
    }
}
