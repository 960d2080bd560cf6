//! dense Cholesky factorization working inside a caller-owned buffer,
//! so repeated factorizations of the damped normal matrix allocate nothing
use nalgebra::{DMatrix, DVector};

/// Overwrites the lower triangle of `a` with L such that A = L L^T.
/// Only the lower triangle of `a` is read. Returns false if A is not positive definite.
pub fn cholesky_decomp(a: &mut DMatrix<f64>) -> bool {
    let n = a.nrows();
    for j in 0..n {
        let mut d = a[(j, j)];
        for k in 0..j {
            d -= a[(j, k)] * a[(j, k)];
        }
        if !(d > 0.0) || !d.is_finite() {
            return false;
        }
        let ljj = d.sqrt();
        a[(j, j)] = ljj;
        for i in (j + 1)..n {
            let mut s = a[(i, j)];
            for k in 0..j {
                s -= a[(i, k)] * a[(j, k)];
            }
            a[(i, j)] = s / ljj;
        }
    }
    true
}

/// Solves L L^T x = x in place, L is the lower triangle of `l`.
pub fn cholesky_svx(l: &DMatrix<f64>, x: &mut DVector<f64>) {
    let n = l.nrows();
    // L y = b
    for i in 0..n {
        let mut s = x[i];
        for k in 0..i {
            s -= l[(i, k)] * x[k];
        }
        x[i] = s / l[(i, i)];
    }
    // L^T x = y
    for i in (0..n).rev() {
        let mut s = x[i];
        for k in (i + 1)..n {
            s -= l[(k, i)] * x[k];
        }
        x[i] = s / l[(i, i)];
    }
}

/// 1-norm of a symmetric matrix given by its lower triangle
pub fn symmetric_norm1(a: &DMatrix<f64>) -> f64 {
    let n = a.nrows();
    let mut max_sum: f64 = 0.0;
    for j in 0..n {
        let mut sum = 0.0;
        for i in 0..n {
            let aij = if i >= j { a[(i, j)] } else { a[(j, i)] };
            sum += aij.abs();
        }
        max_sum = max_sum.max(sum);
    }
    max_sum
}

/// Reciprocal condition number 1 / (||A||_1 ||A^{-1}||_1) from the factor of A.
/// `work` must have length n; the columns of A^{-1} are formed one at a time.
pub fn cholesky_rcond(anorm: f64, l: &DMatrix<f64>, work: &mut DVector<f64>) -> f64 {
    let n = l.nrows();
    if anorm == 0.0 {
        return 0.0;
    }
    let mut ainv_norm: f64 = 0.0;
    for j in 0..n {
        work.fill(0.0);
        work[j] = 1.0;
        cholesky_svx(l, work);
        ainv_norm = ainv_norm.max(work.iter().map(|v| v.abs()).sum::<f64>());
    }
    if ainv_norm == 0.0 || !ainv_norm.is_finite() {
        return 0.0;
    }
    1.0 / (anorm * ainv_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_factor_and_solve() {
        let a = dmatrix![4.0, 2.0, 0.4; 2.0, 5.0, 1.0; 0.4, 1.0, 3.0];
        let b = dvector![1.0, -2.0, 0.5];
        let mut l = a.clone();
        assert!(cholesky_decomp(&mut l));
        let mut x = b.clone();
        cholesky_svx(&l, &mut x);
        let expected = a.clone().lu().solve(&b).unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_indefinite_matrix_fails() {
        let mut a = dmatrix![1.0, 2.0; 2.0, 1.0];
        assert!(!cholesky_decomp(&mut a));
        let mut z = dmatrix![0.0, 0.0; 0.0, 1.0];
        assert!(!cholesky_decomp(&mut z));
    }

    #[test]
    fn test_rcond() {
        let mut l = DMatrix::<f64>::identity(3, 3);
        let anorm = symmetric_norm1(&l);
        assert!(cholesky_decomp(&mut l));
        let mut work = DVector::zeros(3);
        assert_relative_eq!(cholesky_rcond(anorm, &l, &mut work), 1.0);

        let a = dmatrix![2.0, 0.0; 0.0, 0.5];
        let mut l = a.clone();
        assert!(cholesky_decomp(&mut l));
        let mut work = DVector::zeros(2);
        // ||A||_1 = 2, ||A^-1||_1 = 2
        assert_relative_eq!(
            cholesky_rcond(symmetric_norm1(&a), &l, &mut work),
            0.25,
            epsilon = 1e-14
        );
    }
}
