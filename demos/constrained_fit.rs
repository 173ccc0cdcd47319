use cobs::{fit, Constraint, FitOptions, PointwiseOperator};
use ndarray::Array1;
use std::time::Instant;

#[derive(Clone, Copy)]
struct LcgRng {
    state: u64,
}

impl LcgRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next_f64(&mut self) -> f64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let x = self.state >> 11;
        (x as f64) * (1.0 / ((1u64 << 53) as f64))
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let n = args
        .windows(2)
        .find(|w| w[0] == "--n")
        .and_then(|w| w[1].parse::<usize>().ok())
        .unwrap_or(25);

    let mut rng = LcgRng::new(42);
    let x = Array1::linspace(0.0, 10.0, n);
    // Noisy increasing signal with a deliberate dip in the middle.
    let y = x.mapv(|v: f64| {
        let dip = if (4.0..5.0).contains(&v) { -0.8 } else { 0.0 };
        (v * 0.8).sqrt() * 2.0 + dip
    }) + Array1::from_iter((0..n).map(|_| (rng.next_f64() - 0.5) * 0.4));

    let unconstrained = fit(x.view(), y.view(), &FitOptions::default()).expect("fit");
    println!(
        "unconstrained: error = {:.4}, fit(4.5) = {:.4}",
        unconstrained.error,
        unconstrained.evaluate(4.5)
    );

    let options = FitOptions {
        constraints: vec![
            Constraint::Monotone { increasing: true },
            Constraint::Pointwise {
                x: 0.0,
                y: 0.0,
                operator: PointwiseOperator::GreaterEq,
            },
        ],
        ..FitOptions::default()
    };
    let start = Instant::now();
    let monotone = fit(x.view(), y.view(), &options).expect("constrained fit");
    println!(
        "monotone:      error = {:.4}, fit(4.5) = {:.4}  ({:.1?})",
        monotone.error,
        monotone.evaluate(4.5),
        start.elapsed()
    );

    for probe in [1.0, 3.0, 5.0, 7.0, 9.0] {
        println!(
            "  s({probe:>4.1}) = {:>7.4}   s'({probe:>4.1}) = {:>7.4}",
            monotone.evaluate(probe),
            monotone.spline.evaluate_derivative(probe)
        );
    }
}
