//! Principal-component projection of a small set of embeddings.
//!
//! Used to plot search results on their own axes instead of the corpus
//! layout. Works on the `n x n` Gram matrix of the centered rows, so the cost
//! depends on the number of results rather than the embedding dimension.

/// Power-iteration steps per component.
const MAX_ITERATIONS: usize = 500;

/// Convergence threshold on the change of the unit eigenvector.
const TOLERANCE: f64 = 1e-10;

/// Eigenvalues below this carry no variance.
const EIGEN_FLOOR: f64 = 1e-12;

/// Projects `rows` onto their top `dims` principal components.
///
/// Each output row has `dims` coordinates. Components are extracted by power
/// iteration with deflation and oriented so their largest score is positive,
/// which makes repeated calls on the same rows agree. Components without
/// variance (fewer distinct rows than `dims`) come out as zeros.
#[must_use]
pub fn project(rows: &[&[f32]], dims: usize) -> Vec<Vec<f32>> {
    let n = rows.len();
    let mut out = vec![vec![0.0f32; dims]; n];
    if n < 2 {
        return out;
    }

    let width = rows[0].len();
    let mut mean = vec![0.0f64; width];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row.iter()) {
            *m += f64::from(*v);
        }
    }
    mean.iter_mut().for_each(|m| *m /= n as f64);

    let centered: Vec<Vec<f64>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .zip(&mean)
                .map(|(v, m)| f64::from(*v) - m)
                .collect()
        })
        .collect();

    let mut gram = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in i..n {
            let dot: f64 = centered[i]
                .iter()
                .zip(&centered[j])
                .map(|(a, b)| a * b)
                .sum();
            gram[i][j] = dot;
            gram[j][i] = dot;
        }
    }

    for component in 0..dims {
        let Some((eigenvalue, vector)) = dominant_eigenpair(&gram) else {
            break;
        };
        // Scores along the component are sqrt(λ)·u for the Gram eigenvector u
        let scale = eigenvalue.sqrt();
        for (row, u) in out.iter_mut().zip(&vector) {
            row[component] = (scale * u) as f32;
        }
        for i in 0..n {
            for j in 0..n {
                gram[i][j] -= eigenvalue * vector[i] * vector[j];
            }
        }
    }
    out
}

/// Largest eigenvalue of the symmetric matrix `m` with its unit eigenvector,
/// or `None` once no variance is left.
fn dominant_eigenpair(m: &[Vec<f64>]) -> Option<(f64, Vec<f64>)> {
    let n = m.len();
    // Uneven start so it is never orthogonal to a symmetric eigenvector
    let mut u: Vec<f64> = (0..n).map(|i| 1.0 + (i as f64 + 1.0).sqrt()).collect();
    normalize(&mut u)?;

    for _ in 0..MAX_ITERATIONS {
        let mut next = multiply(m, &u);
        normalize(&mut next)?;
        let delta: f64 = next.iter().zip(&u).map(|(a, b)| (a - b).abs()).sum();
        u = next;
        if delta < TOLERANCE {
            break;
        }
    }

    let eigenvalue: f64 = multiply(m, &u).iter().zip(&u).map(|(a, b)| a * b).sum();
    if eigenvalue <= EIGEN_FLOOR {
        return None;
    }

    let largest = u
        .iter()
        .copied()
        .fold(0.0f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
    if largest < 0.0 {
        u.iter_mut().for_each(|v| *v = -*v);
    }
    Some((eigenvalue, u))
}

fn multiply(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter()
        .map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum())
        .collect()
}

fn normalize(v: &mut [f64]) -> Option<()> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm < EIGEN_FLOOR {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar_rows() -> Vec<Vec<f32>> {
        // A 2-D point cloud embedded in 5 dimensions
        [[0.0, 0.0], [1.0, 0.2], [2.5, -0.4], [3.0, 1.1], [-1.5, 0.7], [0.4, -1.3]]
            .iter()
            .map(|[a, b]| vec![*a, *b, 0.5 * a, 0.0, -0.25 * b])
            .collect()
    }

    fn distance(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }

    #[test]
    fn test_full_rank_projection_preserves_distances() {
        let rows = planar_rows();
        let refs: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        let projected = project(&refs, 2);

        for i in 0..rows.len() {
            for j in 0..rows.len() {
                let original = distance(&rows[i], &rows[j]);
                let reduced = distance(&projected[i], &projected[j]);
                assert!(
                    (original - reduced).abs() < 1e-3,
                    "pair ({i}, {j}): {original} vs {reduced}"
                );
            }
        }
    }

    #[test]
    fn test_first_axis_carries_most_variance() {
        let rows = planar_rows();
        let refs: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        let projected = project(&refs, 3);

        let variance = |axis: usize| projected.iter().map(|p| p[axis] * p[axis]).sum::<f32>();
        assert!(variance(0) >= variance(1));
        // Planar data has nothing left for a third axis
        assert!(projected.iter().all(|p| p.len() == 3 && p[2].abs() < 1e-3));
    }

    #[test]
    fn test_repeated_calls_agree() {
        let rows = planar_rows();
        let refs: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        assert_eq!(project(&refs, 2), project(&refs, 2));
    }

    #[test]
    fn test_degenerate_inputs_give_zeros() {
        assert!(project(&[], 2).is_empty());
        assert_eq!(project(&[&[1.0, 2.0][..]], 2), vec![vec![0.0, 0.0]]);

        let same = [1.0f32, 1.0];
        assert_eq!(project(&[&same[..], &same[..]], 3), vec![vec![0.0; 3]; 2]);
    }
}
