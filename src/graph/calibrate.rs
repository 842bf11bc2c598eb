//! Local scale calibration of k-nearest-neighbor distances.
//!
//! For a neighbor list sorted by distance, `ρ` is the distance to the nearest
//! neighbor and `σ` is found by bisection so that
//! `Σ exp(-max(0, dᵢ - ρ) / σ) = log₂(k)`. The nearest neighbor therefore
//! always receives weight 1, and dense and sparse regions end up with
//! comparable total membership.

const BISECTION_STEPS: usize = 64;
const TOLERANCE: f64 = 1e-5;
/// Lower bound of `σ` relative to the mean neighbor distance.
const MIN_SCALE: f64 = 1e-3;

/// Result of calibrating one neighbor list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub rho: f32,
    pub sigma: f32,
}

impl Calibration {
    /// Membership weight of a neighbor at `distance`, in (0, 1].
    #[inline]
    pub fn weight(&self, distance: f32) -> f32 {
        let excess = f64::from((distance - self.rho).max(0.0));
        let w = (-excess / f64::from(self.sigma)).exp() as f32;
        w.clamp(f32::MIN_POSITIVE, 1.0)
    }
}

/// Calibrates `ρ` and `σ` for distances sorted ascending.
///
/// Returns `None` for an empty list.
pub fn calibrate(distances: &[f32]) -> Option<Calibration> {
    let rho = *distances.first()?;
    let k = distances.len();
    let target = (k as f64).log2();

    let mut lo = 0.0f64;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0f64;

    for _ in 0..BISECTION_STEPS {
        let psum: f64 = distances
            .iter()
            .map(|&d| {
                let excess = f64::from((d - rho).max(0.0));
                (-excess / mid).exp()
            })
            .sum();

        if (psum - target).abs() < TOLERANCE {
            break;
        }

        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }

    let mean = distances.iter().map(|&d| f64::from(d)).sum::<f64>() / k as f64;
    let floor = (MIN_SCALE * mean).max(f64::from(f32::MIN_POSITIVE));
    let sigma = mid.max(floor);

    Some(Calibration {
        rho,
        sigma: sigma as f32,
    })
}
