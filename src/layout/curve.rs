//! Shape constants of the low-dimensional similarity `1 / (1 + a·d^{2b})`.
//!
//! `a` and `b` are fitted so the curve matches the target membership
//! `1` for `d < min_dist` and `exp(-(d - min_dist) / spread)` beyond it,
//! sampled on `[0, 3·spread]`, using damped Gauss-Newton (Levenberg-Marquardt).

use serde::{Deserialize, Serialize};

const SAMPLES: usize = 300;
const MAX_ITERATIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveShape {
    pub a: f32,
    pub b: f32,
}

impl CurveShape {
    /// Fits `a` and `b` for the given `spread` and `min_dist`.
    pub fn fit(spread: f32, min_dist: f32) -> Self {
        let spread = f64::from(spread.max(1e-3));
        let min_dist = f64::from(min_dist.max(0.0));

        let xs: Vec<f64> = (0..SAMPLES)
            .map(|i| 3.0 * spread * i as f64 / (SAMPLES - 1) as f64)
            .collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| {
                if x < min_dist {
                    1.0
                } else {
                    (-(x - min_dist) / spread).exp()
                }
            })
            .collect();

        let (mut a, mut b) = (1.0f64, 1.0f64);
        let mut lambda = 1e-3;
        let mut cost = sum_squares(&xs, &ys, a, b);

        for _ in 0..MAX_ITERATIONS {
            // Normal equations of the 2-parameter problem
            let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for (&x, &y) in xs.iter().zip(&ys) {
                let (r, da, db) = residual_and_gradient(x, y, a, b);
                jaa += da * da;
                jab += da * db;
                jbb += db * db;
                ga += da * r;
                gb += db * r;
            }

            let haa = jaa * (1.0 + lambda);
            let hbb = jbb * (1.0 + lambda);
            let det = haa * hbb - jab * jab;
            if det.abs() < f64::EPSILON {
                break;
            }
            let step_a = -(hbb * ga - jab * gb) / det;
            let step_b = -(haa * gb - jab * ga) / det;

            let next_a = (a + step_a).max(1e-3);
            let next_b = (b + step_b).max(1e-2);
            let next_cost = sum_squares(&xs, &ys, next_a, next_b);

            if next_cost < cost {
                let improvement = cost - next_cost;
                a = next_a;
                b = next_b;
                cost = next_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement < 1e-14 {
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
            }
        }

        Self {
            a: a as f32,
            b: b as f32,
        }
    }

    /// Low-dimensional similarity at squared distance `dist_sq`.
    #[inline]
    pub fn similarity(&self, dist_sq: f32) -> f32 {
        1.0 / (1.0 + self.a * dist_sq.powf(self.b))
    }
}

fn model(x: f64, a: f64, b: f64) -> f64 {
    1.0 / (1.0 + a * x.powf(2.0 * b))
}

fn sum_squares(xs: &[f64], ys: &[f64], a: f64, b: f64) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = model(x, a, b) - y;
            r * r
        })
        .sum()
}

/// Residual and its partial derivatives with respect to `a` and `b`.
fn residual_and_gradient(x: f64, y: f64, a: f64, b: f64) -> (f64, f64, f64) {
    if x <= 0.0 {
        return (1.0 - y, 0.0, 0.0);
    }
    let p = x.powf(2.0 * b);
    let denom = 1.0 + a * p;
    let r = 1.0 / denom - y;
    let d_a = -p / (denom * denom);
    let d_b = -a * p * 2.0 * x.ln() / (denom * denom);
    (r, d_a, d_b)
}
