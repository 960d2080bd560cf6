use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::parameters::TrsKind;
use crate::numerical::multilarge::trs::{
    TrustRegionSubproblem, TrustView, quadratic_preduction, scaled_norm,
};
use log::trace;
use nalgebra::{DVector, Matrix2, Vector2};

const SECULAR_MAX_ITER: usize = 50;
const SECULAR_RTOL: f64 = 1e-10;

/*
Two dimensional subspace minimization (Byrd, Schnabel & Shultz, 1988).

Working in the scaled variables y = D dx the model is
    m(y) = g_s^T y + 1/2 y^T B y,   g_s = D^{-1} g,   B = D^{-1} J^T J D^{-1}
and it is minimized over span{D dx_gn, D dx_sd} subject to ||y|| <= delta.
With an orthonormal basis Q of the subspace the problem reduces to
    min  gh^T z + 1/2 z^T Bh z,  ||z|| <= delta,   gh = Q^T g_s,  Bh = Q^T B Q
whose boundary solution z = -(Bh + lambda I)^{-1} gh solves the secular equation
    1/||z(lambda)|| - 1/delta = 0
which is found by Newton's method from the left of the root.
*/
pub struct Subspace2dSubproblem {
    dx_gn: DVector<f64>,
    dx_sd: DVector<f64>,
    norm_dgn: f64,
    /// orthonormal basis of the scaled subspace
    q1: DVector<f64>,
    q2: DVector<f64>,
    dim: usize,
    gh: Vector2<f64>,
    bh: Matrix2<f64>,
    workp: DVector<f64>,
    workp2: DVector<f64>,
    /// subspace of the current iterate is built
    ready: bool,
}

impl Subspace2dSubproblem {
    pub fn new(_n: usize, p: usize) -> Self {
        Self {
            dx_gn: DVector::zeros(p),
            dx_sd: DVector::zeros(p),
            norm_dgn: 0.0,
            q1: DVector::zeros(p),
            q2: DVector::zeros(p),
            dim: 0,
            gh: Vector2::zeros(),
            bh: Matrix2::zeros(),
            workp: DVector::zeros(p),
            workp2: DVector::zeros(p),
            ready: false,
        }
    }

    /// Gauss-Newton and Cauchy points, basis and reduced model of the current iterate
    fn build(&mut self, view: &mut TrustView) -> Result<()> {
        let diag = view.diag;
        let p = diag.len();

        view.solver.presolve(0.0, view.jtj, diag)?;
        view.solver.solve(view.g, &mut self.dx_gn)?;
        self.norm_dgn = scaled_norm(diag, &self.dx_gn);

        // Cauchy point along -D^{-2} g
        for i in 0..p {
            self.workp[i] = view.g[i] / (diag[i] * diag[i]);
        }
        self.workp2.gemv(1.0, view.jtj, &self.workp, 0.0);
        let curvature = self.workp.dot(&self.workp2);
        let gnorm2: f64 = (0..p).map(|i| (view.g[i] / diag[i]).powi(2)).sum();
        self.dx_sd.copy_from(&self.workp);
        if curvature > 0.0 {
            self.dx_sd.scale_mut(-gnorm2 / curvature);
        } else {
            self.dx_sd.neg_mut();
        }

        // q1, q2 from D dx_gn and D dx_sd by Gram-Schmidt
        self.dim = 0;
        for (k, src) in [&self.dx_gn, &self.dx_sd].into_iter().enumerate() {
            for i in 0..p {
                self.workp[i] = diag[i] * src[i];
            }
            let norm0 = self.workp.norm();
            if norm0 == 0.0 {
                continue;
            }
            if self.dim == 1 {
                let proj = self.q1.dot(&self.workp);
                self.workp.axpy(-proj, &self.q1, 1.0);
            }
            let norm = self.workp.norm();
            if norm <= 1e-12 * norm0 {
                continue;
            }
            let q = if self.dim == 0 { &mut self.q1 } else { &mut self.q2 };
            q.copy_from(&self.workp);
            q.unscale_mut(norm);
            self.dim += 1;
            trace!("subspace2d: basis vector {} from source {}", self.dim, k);
        }
        if self.dim == 0 {
            return Err(MultilargeError::StepFailed(
                "subspace2d: gradient vanishes".to_string(),
            ));
        }

        // reduced gradient and Hessian
        self.gh = Vector2::zeros();
        self.bh = Matrix2::zeros();
        for k in 0..self.dim {
            let qk = if k == 0 { &self.q1 } else { &self.q2 };
            let mut ghk = 0.0;
            for i in 0..p {
                self.workp[i] = qk[i] / diag[i];
                ghk += qk[i] * view.g[i] / diag[i];
            }
            self.gh[k] = ghk;
            self.workp2.gemv(1.0, view.jtj, &self.workp, 0.0);
            for l in 0..self.dim {
                let ql = if l == 0 { &self.q1 } else { &self.q2 };
                let mut b = 0.0;
                for i in 0..p {
                    b += ql[i] / diag[i] * self.workp2[i];
                }
                self.bh[(l, k)] = b;
            }
        }
        // symmetrize against rounding
        let off = 0.5 * (self.bh[(0, 1)] + self.bh[(1, 0)]);
        self.bh[(0, 1)] = off;
        self.bh[(1, 0)] = off;
        self.ready = true;
        Ok(())
    }

    /// coordinates z of the minimizer in the basis (q1, q2)
    fn reduced_solution(&self, delta: f64) -> Result<Vector2<f64>> {
        if self.dim == 1 {
            let (g, b) = (self.gh[0], self.bh[(0, 0)]);
            let z = if b > 0.0 && (g / b).abs() <= delta {
                -g / b
            } else {
                -g.signum() * delta
            };
            return Ok(Vector2::new(z, 0.0));
        }
        solve_trust_2x2(&self.bh, &self.gh, delta)
    }
}

/// eigenvalues (ascending) and eigenvectors of a symmetric 2x2 matrix
fn symmetric_eigen_2x2(m: &Matrix2<f64>) -> (f64, f64, Vector2<f64>, Vector2<f64>) {
    let (a, b, c) = (m[(0, 0)], m[(0, 1)], m[(1, 1)]);
    if b == 0.0 {
        return if a <= c {
            (a, c, Vector2::new(1.0, 0.0), Vector2::new(0.0, 1.0))
        } else {
            (c, a, Vector2::new(0.0, 1.0), Vector2::new(1.0, 0.0))
        };
    }
    let mean = 0.5 * (a + c);
    let r = (0.5 * (a - c)).hypot(b);
    let (e1, e2) = (mean - r, mean + r);
    let cand1 = Vector2::new(b, e1 - a);
    let cand2 = Vector2::new(e1 - c, b);
    let v1 = if cand1.norm() >= cand2.norm() { cand1 } else { cand2 }.normalize();
    let v2 = Vector2::new(-v1[1], v1[0]);
    (e1, e2, v1, v2)
}

/// min g^T z + 1/2 z^T B z subject to ||z|| <= delta for symmetric 2x2 B
fn solve_trust_2x2(bh: &Matrix2<f64>, gh: &Vector2<f64>, delta: f64) -> Result<Vector2<f64>> {
    let (e1, e2, v1, v2) = symmetric_eigen_2x2(bh);
    let gamma1 = v1.dot(gh);
    let gamma2 = v2.dot(gh);
    let znorm = |lambda: f64| {
        ((gamma1 / (e1 + lambda)).powi(2) + (gamma2 / (e2 + lambda)).powi(2)).sqrt()
    };
    let z_of = |lambda: f64| v1 * (-gamma1 / (e1 + lambda)) + v2 * (-gamma2 / (e2 + lambda));

    // interior Newton point
    if e1 > 0.0 && znorm(0.0) <= delta {
        return Ok(z_of(0.0));
    }

    let lambda_low = (-e1).max(0.0);
    let gscale = gh.norm().max(f64::MIN_POSITIVE);
    if gamma1.abs() <= 1e-12 * gscale {
        // hard case: the step along v2 alone does not reach the boundary
        let z2 = if e2 + lambda_low > 0.0 {
            -gamma2 / (e2 + lambda_low)
        } else {
            0.0
        };
        if z2.abs() <= delta {
            let tau = (delta * delta - z2 * z2).max(0.0).sqrt();
            return Ok(v1 * tau + v2 * z2);
        }
    }

    // start left of the root where ||z|| > delta
    let mut lambda = if e1 > 0.0 {
        0.0
    } else {
        lambda_low + gamma1.abs() / (2.0 * delta)
    };
    for _ in 0..SECULAR_MAX_ITER {
        let norm = znorm(lambda);
        if !norm.is_finite() {
            break;
        }
        if (norm - delta).abs() <= SECULAR_RTOL * delta {
            return Ok(z_of(lambda));
        }
        let phi = 1.0 / norm - 1.0 / delta;
        let dnorm3 = (gamma1 * gamma1 / (e1 + lambda).powi(3)
            + gamma2 * gamma2 / (e2 + lambda).powi(3))
            / norm.powi(3);
        if dnorm3 <= 0.0 {
            break;
        }
        let mut next = lambda - phi / dnorm3;
        if next <= lambda_low {
            next = 0.5 * (lambda + lambda_low);
        }
        lambda = next;
    }
    let z = z_of(lambda);
    let norm = z.norm();
    if !norm.is_finite() || norm == 0.0 {
        return Err(MultilargeError::StepFailed(
            "subspace2d: secular equation did not converge".to_string(),
        ));
    }
    // scale onto the boundary
    Ok(z * (delta / norm))
}

impl TrustRegionSubproblem for Subspace2dSubproblem {
    fn kind(&self) -> TrsKind {
        TrsKind::Subspace2D
    }

    fn init(&mut self, view: &mut TrustView) -> Result<()> {
        view.solver.init()
    }

    fn preloop(&mut self, _view: &mut TrustView) -> Result<()> {
        // built on the first trial step so a failure there counts as a rejection
        self.ready = false;
        Ok(())
    }

    fn step(&mut self, view: &mut TrustView, delta: f64, dx: &mut DVector<f64>) -> Result<()> {
        if !self.ready {
            self.build(view)?;
        }
        if self.norm_dgn <= delta {
            dx.copy_from(&self.dx_gn);
            return Ok(());
        }
        let z = self.reduced_solution(delta)?;
        // dx = D^{-1} (z1 q1 + z2 q2)
        dx.copy_from(&self.q1);
        dx.scale_mut(z[0]);
        if self.dim == 2 {
            dx.axpy(z[1], &self.q2, 1.0);
        }
        dx.component_div_assign(view.diag);
        Ok(())
    }

    fn preduction(&mut self, view: &TrustView, dx: &DVector<f64>) -> Result<f64> {
        Ok(quadratic_preduction(
            view.f,
            view.g,
            view.jtj,
            dx,
            &mut self.workp,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{matrix, vector};

    #[test]
    fn test_eigen_2x2() {
        let m = matrix![2.0, 1.0; 1.0, 2.0];
        let (e1, e2, v1, v2) = symmetric_eigen_2x2(&m);
        assert_relative_eq!(e1, 1.0, epsilon = 1e-14);
        assert_relative_eq!(e2, 3.0, epsilon = 1e-14);
        assert_relative_eq!(m * v1, v1 * e1, epsilon = 1e-14);
        assert_relative_eq!(m * v2, v2 * e2, epsilon = 1e-14);
    }

    #[test]
    fn test_interior_solution_is_newton_point() {
        let b = matrix![2.0, 0.0; 0.0, 4.0];
        let g = vector![1.0, 1.0];
        let z = solve_trust_2x2(&b, &g, 10.0).unwrap();
        assert_relative_eq!(z, vector![-0.5, -0.25], epsilon = 1e-14);
    }

    #[test]
    fn test_boundary_solution_satisfies_optimality() {
        let b = matrix![2.0, 0.5; 0.5, 1.0];
        let g = vector![3.0, -2.0];
        let delta = 0.5;
        let z = solve_trust_2x2(&b, &g, delta).unwrap();
        assert_relative_eq!(z.norm(), delta, epsilon = 1e-9);
        // (B + lambda I) z = -g for some lambda >= 0: g + B z is parallel to -z
        let r = g + b * z;
        let lambda = -r.dot(&z) / z.norm_squared();
        assert!(lambda >= 0.0);
        assert_relative_eq!(r + z * lambda, vector![0.0, 0.0], epsilon = 1e-8);
    }

    #[test]
    fn test_indefinite_model_goes_to_boundary() {
        let b = matrix![-1.0, 0.0; 0.0, 2.0];
        let g = vector![0.5, 1.0];
        let z = solve_trust_2x2(&b, &g, 1.0).unwrap();
        assert_relative_eq!(z.norm(), 1.0, epsilon = 1e-9);
    }
}
