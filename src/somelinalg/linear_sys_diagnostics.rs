use log::warn;
use nalgebra::{DMatrix, DVector};

/// The condition number of a matrix is the ratio of its largest singular value to its smallest one.
/// Returns the reciprocal, which stays finite (zero) for singular matrices.
pub fn rcond_svd(A: &DMatrix<f64>) -> f64 {
    let singular_values = A.singular_values();
    rcond_from_singular_values(&singular_values)
}

pub fn rcond_from_singular_values(singular_values: &DVector<f64>) -> f64 {
    if singular_values.is_empty() {
        return 0.0;
    }
    let max_sigma = singular_values.max();
    let min_sigma = singular_values.min();
    if max_sigma <= 0.0 || !max_sigma.is_finite() {
        return 0.0;
    }
    min_sigma / max_sigma
}

/// A system of linear equations is said to be poorly conditioned if the solution is sensitive to small changes in the input data.
pub fn poorly_conditioned(A: &DMatrix<f64>, threshold: f64) -> bool {
    let rcond = rcond_svd(A);
    let poorly_conditioned = rcond * threshold < 1.0;
    if poorly_conditioned {
        warn!(
            "The system of linear equations is poorly conditioned. Condition number = {:.2e}",
            1.0 / rcond
        );
    }
    poorly_conditioned
}

/// Moore-Penrose pseudo-inverse of a symmetric positive semi-definite matrix;
/// singular values below eps * sigma_max are treated as zero
pub fn pseudo_inverse_spd(A: &DMatrix<f64>, eps: f64) -> Option<DMatrix<f64>> {
    let svd = A.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    svd.pseudo_inverse(eps * sigma_max.max(f64::MIN_POSITIVE)).ok()
}

/// famous example of ill-conditioned matrix
#[cfg(test)]
fn hilbert_matrix(n: usize) -> DMatrix<f64> {
    DMatrix::from_fn(n, n, |i, j| 1.0 / ((i + j + 1) as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;

    #[test]
    fn test_rcond_identity() {
        assert_relative_eq!(rcond_svd(&DMatrix::identity(4, 4)), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn test_poorly_conditioned_hilbert() {
        let A = hilbert_matrix(10);
        assert!(poorly_conditioned(&A, 1e10));
        assert!(!poorly_conditioned(&DMatrix::identity(3, 3), 1e10));
    }

    #[test]
    fn test_singular_has_zero_rcond() {
        let A = dmatrix![1.0, 1.0; 1.0, 1.0];
        assert!(rcond_svd(&A) < 1e-15);
    }

    #[test]
    fn test_pseudo_inverse() {
        let A = dmatrix![2.0, 1.0; 1.0, 2.0];
        let inv = pseudo_inverse_spd(&A, 1e-12).unwrap();
        assert_relative_eq!(&A * inv, DMatrix::identity(2, 2), epsilon = 1e-12);
    }
}
