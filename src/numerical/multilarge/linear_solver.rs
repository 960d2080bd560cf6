//! Solvers for the damped normal equations (J^T J + mu D^2) dx = -rhs.
//! The Cholesky solver works inside buffers allocated once; the QR and SVD solvers delegate to
//! nalgebra decompositions and allocate their factors on every `presolve`.
use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::parameters::SolverKind;
use crate::somelinalg::cholesky_dense::{
    cholesky_decomp, cholesky_rcond, cholesky_svx, symmetric_norm1,
};
use crate::somelinalg::linear_sys_diagnostics::rcond_svd;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Dyn, QR, SVD};

pub trait LinearSolver {
    fn name(&self) -> &'static str;
    /// forget any previous factorization
    fn init(&mut self) -> Result<()>;
    /// factorize J^T J + mu D^2
    fn presolve(&mut self, mu: f64, jtj: &DMatrix<f64>, diag: &DVector<f64>) -> Result<()>;
    /// out = -(J^T J + mu D^2)^{-1} rhs with the matrix of the last `presolve`
    fn solve(&mut self, rhs: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;
    /// reciprocal condition number of J^T J
    fn rcond(&mut self, jtj: &DMatrix<f64>) -> Result<f64>;
}

/// a = J^T J + mu D^2, written into a preallocated buffer
fn damped_normal_matrix(a: &mut DMatrix<f64>, mu: f64, jtj: &DMatrix<f64>, diag: &DVector<f64>) {
    a.copy_from(jtj);
    for i in 0..diag.len() {
        a[(i, i)] += mu * diag[i] * diag[i];
    }
}

fn not_factorized(name: &str) -> MultilargeError {
    MultilargeError::SolverFailed(format!("{}: solve called before presolve", name))
}

////////////////////////////////////////////////////////////////////////////////////////////////
//                      CHOLESKY
////////////////////////////////////////////////////////////////////////////////////////////////
pub struct CholeskySolver {
    factor: DMatrix<f64>,
    rcond_factor: DMatrix<f64>,
    work: DVector<f64>,
    factored: bool,
}

impl CholeskySolver {
    pub fn new(p: usize) -> Self {
        Self {
            factor: DMatrix::zeros(p, p),
            rcond_factor: DMatrix::zeros(p, p),
            work: DVector::zeros(p),
            factored: false,
        }
    }
}

impl LinearSolver for CholeskySolver {
    fn name(&self) -> &'static str {
        "cholesky"
    }

    fn init(&mut self) -> Result<()> {
        self.factored = false;
        Ok(())
    }

    fn presolve(&mut self, mu: f64, jtj: &DMatrix<f64>, diag: &DVector<f64>) -> Result<()> {
        damped_normal_matrix(&mut self.factor, mu, jtj, diag);
        if !cholesky_decomp(&mut self.factor) {
            // semi-definite matrix (typically mu = 0 with rank deficient J): retry with a
            // small shift of the diagonal
            damped_normal_matrix(&mut self.factor, mu, jtj, diag);
            let shift = f64::EPSILON.sqrt() * symmetric_norm1(&self.factor).max(1.0);
            for i in 0..diag.len() {
                self.factor[(i, i)] += shift;
            }
            debug!("cholesky: matrix not positive definite, shifted by {:e}", shift);
            if !cholesky_decomp(&mut self.factor) {
                self.factored = false;
                return Err(MultilargeError::SolverFailed(
                    "cholesky: damped normal matrix is not positive definite".to_string(),
                ));
            }
        }
        self.factored = true;
        Ok(())
    }

    fn solve(&mut self, rhs: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        if !self.factored {
            return Err(not_factorized(self.name()));
        }
        out.copy_from(rhs);
        cholesky_svx(&self.factor, out);
        out.neg_mut();
        Ok(())
    }

    fn rcond(&mut self, jtj: &DMatrix<f64>) -> Result<f64> {
        self.rcond_factor.copy_from(jtj);
        let anorm = symmetric_norm1(&self.rcond_factor);
        if !cholesky_decomp(&mut self.rcond_factor) {
            // singular J^T J
            return Ok(0.0);
        }
        Ok(cholesky_rcond(anorm, &self.rcond_factor, &mut self.work))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////
//                      QR
////////////////////////////////////////////////////////////////////////////////////////////////
pub struct QrSolver {
    a: DMatrix<f64>,
    qr: Option<QR<f64, Dyn, Dyn>>,
}

impl QrSolver {
    pub fn new(p: usize) -> Self {
        Self {
            a: DMatrix::zeros(p, p),
            qr: None,
        }
    }
}

/// |r_min| / |r_max| over the diagonal of the R factor
fn rcond_from_r(r: &DMatrix<f64>) -> f64 {
    let d = r.diagonal().abs();
    let max = d.max();
    if max == 0.0 || !max.is_finite() {
        return 0.0;
    }
    d.min() / max
}

impl LinearSolver for QrSolver {
    fn name(&self) -> &'static str {
        "qr"
    }

    fn init(&mut self) -> Result<()> {
        self.qr = None;
        Ok(())
    }

    fn presolve(&mut self, mu: f64, jtj: &DMatrix<f64>, diag: &DVector<f64>) -> Result<()> {
        damped_normal_matrix(&mut self.a, mu, jtj, diag);
        self.qr = Some(self.a.clone().qr());
        Ok(())
    }

    fn solve(&mut self, rhs: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let qr = self.qr.as_ref().ok_or_else(|| not_factorized("qr"))?;
        let x = qr.solve(rhs).ok_or_else(|| {
            MultilargeError::SolverFailed("qr: damped normal matrix is singular".to_string())
        })?;
        out.copy_from(&x);
        out.neg_mut();
        Ok(())
    }

    fn rcond(&mut self, jtj: &DMatrix<f64>) -> Result<f64> {
        Ok(rcond_from_r(&jtj.clone().qr().r()))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////
//                      SVD
////////////////////////////////////////////////////////////////////////////////////////////////
pub struct SvdSolver {
    a: DMatrix<f64>,
    svd: Option<SVD<f64, Dyn, Dyn>>,
}

impl SvdSolver {
    pub fn new(p: usize) -> Self {
        Self {
            a: DMatrix::zeros(p, p),
            svd: None,
        }
    }
}

impl LinearSolver for SvdSolver {
    fn name(&self) -> &'static str {
        "svd"
    }

    fn init(&mut self) -> Result<()> {
        self.svd = None;
        Ok(())
    }

    fn presolve(&mut self, mu: f64, jtj: &DMatrix<f64>, diag: &DVector<f64>) -> Result<()> {
        damped_normal_matrix(&mut self.a, mu, jtj, diag);
        self.svd = Some(self.a.clone().svd(true, true));
        Ok(())
    }

    fn solve(&mut self, rhs: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let svd = self.svd.as_ref().ok_or_else(|| not_factorized("svd"))?;
        // truncate singular values below eps * sigma_max
        let eps = f64::EPSILON * svd.singular_values.max();
        let x = svd
            .solve(rhs, eps)
            .map_err(|e| MultilargeError::SolverFailed(format!("svd: {}", e)))?;
        out.copy_from(&x);
        out.neg_mut();
        Ok(())
    }

    fn rcond(&mut self, jtj: &DMatrix<f64>) -> Result<f64> {
        Ok(rcond_svd(jtj))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////
/// placeholder for subproblems that never factorize (cgst)
pub struct NoLinearSolver;

impl LinearSolver for NoLinearSolver {
    fn name(&self) -> &'static str {
        "none"
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn presolve(&mut self, _mu: f64, _jtj: &DMatrix<f64>, _diag: &DVector<f64>) -> Result<()> {
        Err(MultilargeError::SolverFailed("no linear solver selected".to_string()))
    }

    fn solve(&mut self, _rhs: &DVector<f64>, _out: &mut DVector<f64>) -> Result<()> {
        Err(MultilargeError::SolverFailed("no linear solver selected".to_string()))
    }

    fn rcond(&mut self, _jtj: &DMatrix<f64>) -> Result<f64> {
        Err(MultilargeError::SolverFailed("no linear solver selected".to_string()))
    }
}

impl SolverKind {
    pub fn alloc(&self, p: usize) -> Box<dyn LinearSolver> {
        match self {
            SolverKind::Cholesky => Box::new(CholeskySolver::new(p)),
            SolverKind::Qr => Box::new(QrSolver::new(p)),
            SolverKind::Svd => Box::new(SvdSolver::new(p)),
            SolverKind::NoSolver => {
                warn!("no linear solver selected, only the cgst subproblem can run");
                Box::new(NoLinearSolver)
            }
        }
    }
}
