use cobs::{fit, Constraint, FitOptions, PointwiseOperator};
use ndarray::array;

fn options_with(constraints: Vec<Constraint>) -> FitOptions {
    FitOptions {
        constraints,
        ..FitOptions::default()
    }
}

#[test]
fn monotone_decreasing_fit_is_ordered() {
    let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![11.0, 7.0, 4.0, 2.0, 1.0];
    let options = options_with(vec![Constraint::Monotone { increasing: false }]);
    let result = fit(x.view(), y.view(), &options).expect("fit");

    let probes = [1.5, 2.5, 3.5, 4.5];
    for pair in probes.windows(2) {
        assert!(
            result.evaluate(pair[0]) >= result.evaluate(pair[1]) - 1e-6,
            "fit not decreasing between {} and {}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn concave_fit_keeps_curvature_nonpositive() {
    let x = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![0.0, 1.0, 1.8, 2.4, 2.8, 3.0];
    let options = options_with(vec![Constraint::Concave]);
    let result = fit(x.view(), y.view(), &options).expect("fit");

    let step = 5.0 / 101.0;
    for i in 1..=100 {
        let xi = i as f64 * step;
        let curvature = result.spline.evaluate_second_derivative_exact(xi);
        assert!(
            curvature <= 1e-6,
            "positive curvature {curvature} at x={xi}"
        );
    }
}

#[test]
fn convex_false_behaves_like_concave() {
    let x = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![0.0, 1.0, 1.8, 2.4, 2.8, 3.0];

    let via_flag = fit(
        x.view(),
        y.view(),
        &options_with(vec![Constraint::Convex { convex: false }]),
    )
    .expect("fit");
    let via_variant = fit(x.view(), y.view(), &options_with(vec![Constraint::Concave]))
        .expect("fit");

    for i in 0..=20 {
        let p = 5.0 * i as f64 / 20.0;
        assert!(
            (via_flag.evaluate(p) - via_variant.evaluate(p)).abs() < 1e-8,
            "fits diverge at {p}"
        );
    }
}

#[test]
fn pointwise_lower_bound_lifts_the_curve() {
    let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![1.0, 4.0, 9.0, 16.0, 25.0];
    let options = options_with(vec![Constraint::Pointwise {
        x: 3.0,
        y: 15.0,
        operator: PointwiseOperator::GreaterEq,
    }]);
    let result = fit(x.view(), y.view(), &options).expect("fit");
    assert!(
        result.evaluate(3.0) >= 15.0 - 1e-6,
        "fit(3) = {} below the bound",
        result.evaluate(3.0)
    );
}

#[test]
fn pointwise_upper_bound_caps_the_curve() {
    let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![1.0, 4.0, 9.0, 16.0, 25.0];
    let options = options_with(vec![Constraint::Pointwise {
        x: 3.0,
        y: 5.0,
        operator: PointwiseOperator::LessEq,
    }]);
    let result = fit(x.view(), y.view(), &options).expect("fit");
    assert!(
        result.evaluate(3.0) <= 5.0 + 1e-6,
        "fit(3) = {} above the cap",
        result.evaluate(3.0)
    );
}

#[test]
fn contradictory_equalities_fall_back_to_least_squares() {
    // s(3) cannot equal both 0 and 5; the LP is infeasible and the fitter
    // recovers with the unconstrained solution, which interpolates here.
    let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![1.0, 4.0, 9.0, 16.0, 25.0];
    let options = options_with(vec![
        Constraint::Pointwise {
            x: 3.0,
            y: 0.0,
            operator: PointwiseOperator::Equal,
        },
        Constraint::Pointwise {
            x: 3.0,
            y: 5.0,
            operator: PointwiseOperator::Equal,
        },
    ]);
    let result = fit(x.view(), y.view(), &options).expect("fit must not fail");
    assert!(result.error.is_finite());
    assert!(
        (result.evaluate(3.0) - 9.0).abs() < 1e-3,
        "fallback fit should interpolate: fit(3) = {}",
        result.evaluate(3.0)
    );
}

#[test]
fn json_request_drives_a_constrained_fit() {
    let options: FitOptions = serde_json::from_str(
        r#"{
            "order": 4,
            "constraints": [{"type": "monotone", "increasing": true}],
            "tau": 0.5,
            "ignoredByThisVersion": 1
        }"#,
    )
    .expect("options parse");

    let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
    let y = array![1.0, 2.0, 4.0, 7.0, 11.0];
    let result = fit(x.view(), y.view(), &options).expect("fit");

    assert_eq!(result.tau, Some(0.5));
    assert!(result.evaluate(1.5) <= result.evaluate(4.5) + 1e-6);
}

#[test]
fn user_supplied_knots_are_respected() {
    let x = array![0.0, 1.0, 2.0, 3.0, 4.0];
    let y = array![0.0, 1.0, 4.0, 9.0, 16.0];
    let knots = vec![0.0, 0.0, 0.0, 0.0, 0.0, 4.0, 4.0, 4.0, 4.0, 4.0];
    let options = FitOptions {
        knots: Some(knots.clone()),
        ..FitOptions::default()
    };
    let result = fit(x.view(), y.view(), &options).expect("fit");
    assert_eq!(result.knots().len(), knots.len());
    assert_eq!(result.coefficients().len(), knots.len() - 4 - 1);
    for (stored, provided) in result.knots().iter().zip(knots.iter()) {
        assert_eq!(stored, provided);
    }
    // Five Bernstein coefficients against five samples: the fit interpolates.
    assert!(result.error < 1e-5, "error {}", result.error);
}
