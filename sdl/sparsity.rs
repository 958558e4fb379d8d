//! Hoyer sparseness: the measure and the projection onto a prescribed level.
//!
//! The sparseness of a vector of length `n` is
//! `(sqrt(n) − ||x||₁ / ||x||₂) / (sqrt(n) − 1)`: 1 for a single non-zero entry,
//! 0 when all entries have equal magnitude.

use ndarray::{Array1, ArrayView1};

/// Hoyer sparseness of `x`. Vectors shorter than two entries, and zero vectors,
/// count as maximally sparse.
pub fn sparseness(x: ArrayView1<f64>) -> f64 {
    let n = x.len() as f64;
    let l2 = x.dot(&x).sqrt();
    if x.len() < 2 || l2 == 0.0 {
        return 1.0;
    }
    let l1 = x.iter().map(|v| v.abs()).sum::<f64>();
    (n.sqrt() - l1 / l2) / (n.sqrt() - 1.0)
}

/// Closest non-negative vector to `x` with L1 norm `l1` and L2 norm `l2`.
///
/// Alternates between projecting onto the hyperplane `Σ s = l1` and the sphere
/// `||s|| = l2`, zeroing entries that turn negative, until the result is non-negative.
pub fn hoyer_projection(x: ArrayView1<f64>, l1: f64, l2: f64) -> Array1<f64> {
    let n = x.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mut zeroed = vec![false; n];
    let mut s = x.mapv(|v| v + (l1 - x.sum()) / n as f64);

    for _ in 0..n {
        let free = zeroed.iter().filter(|z| !**z).count().max(1) as f64;
        let midpoint = Array1::from_shape_fn(n, |i| if zeroed[i] { 0.0 } else { l1 / free });
        let w = &s - &midpoint;

        // Solve ||midpoint + a·w||² = l2² for a ≥ 0.
        let a = w.dot(&w);
        let b = 2.0 * midpoint.dot(&w);
        let c = midpoint.dot(&midpoint) - l2 * l2;
        let alpha = if a == 0.0 {
            0.0
        } else {
            let discriminant = (b * b - 4.0 * a * c).max(0.0);
            (-b + discriminant.sqrt()) / (2.0 * a)
        };
        s = &midpoint + &(alpha * &w);

        if s.iter().all(|&v| v >= 0.0) {
            return s;
        }

        for i in 0..n {
            if s[i] < 0.0 {
                zeroed[i] = true;
            }
            if zeroed[i] {
                s[i] = 0.0;
            }
        }
        let free = zeroed.iter().filter(|z| !**z).count().max(1) as f64;
        let shift = (s.sum() - l1) / free;
        for i in 0..n {
            if !zeroed[i] {
                s[i] -= shift;
            }
        }
    }
    s.mapv_inplace(|v| v.max(0.0));
    s
}

/// Rescales the sparseness of `x` to `target` while keeping its L2 norm.
pub fn project_to_sparseness(x: ArrayView1<f64>, target: f64) -> Array1<f64> {
    let n = x.len() as f64;
    let l2 = x.dot(&x).sqrt();
    if x.len() < 2 || l2 == 0.0 {
        return x.to_owned();
    }
    let l1 = l2 * (n.sqrt() - target * (n.sqrt() - 1.0));
    hoyer_projection(x, l1, l2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn sparseness_spans_zero_to_one() {
        assert_abs_diff_eq!(sparseness(array![0.0, 3.0, 0.0, 0.0].view()), 1.0);
        assert_abs_diff_eq!(sparseness(array![2.0, 2.0, 2.0, 2.0].view()), 0.0, epsilon = 1e-12);
        let mid = sparseness(array![1.0, 0.5, 0.0, 0.1].view());
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn projection_hits_the_requested_norms() {
        let x = array![0.9, 0.1, 0.4, 0.7, 0.2, 0.05];
        let (l1, l2) = (1.5, 1.0);
        let s = hoyer_projection(x.view(), l1, l2);
        assert!(s.iter().all(|&v| v >= 0.0));
        assert_abs_diff_eq!(s.sum(), l1, epsilon = 1e-9);
        assert_abs_diff_eq!(s.dot(&s).sqrt(), l2, epsilon = 1e-9);
    }

    #[test]
    fn projection_reaches_target_sparseness() {
        let x = array![0.3, 0.8, 0.5, 0.1, 0.6, 0.4, 0.2, 0.9];
        for target in [0.2, 0.5, 0.8] {
            let s = project_to_sparseness(x.view(), target);
            assert_abs_diff_eq!(sparseness(s.view()), target, epsilon = 1e-6);
            assert_abs_diff_eq!(s.dot(&s), x.dot(&x), epsilon = 1e-9);
        }
    }

    #[test]
    fn zero_rows_are_left_alone() {
        let zero = array![0.0, 0.0, 0.0];
        assert_eq!(project_to_sparseness(zero.view(), 0.7), zero);
    }
}
