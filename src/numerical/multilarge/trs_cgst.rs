//! Steihaug-Toint truncated conjugate gradient subproblem.
//!
//! CG is run on the scaled normal equations B y = -D^{-1} g with B = D^{-1} J^T J D^{-1}
//! and y = D dx, starting from y = 0. The iteration stops at the first direction of
//! non-positive curvature or the first iterate leaving ||y|| <= delta, and in both cases
//! moves to the boundary. Only products with J^T J are needed, so no linear solver is used.
use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::parameters::{MultilargeParameters, TrsKind};
use crate::numerical::multilarge::trs::{
    TrustRegionSubproblem, TrustView, boundary_tau, quadratic_preduction,
};
use log::trace;
use nalgebra::{DMatrix, DVector};

pub struct CgstSubproblem {
    max_iter: usize,
    tol: f64,
    /// iterate y
    z: DVector<f64>,
    r: DVector<f64>,
    d: DVector<f64>,
    bd: DVector<f64>,
    workp: DVector<f64>,
    /// CG iterations of the last step
    pub niter: usize,
}

impl CgstSubproblem {
    pub fn new(params: &MultilargeParameters, _n: usize, p: usize) -> Self {
        let max_iter = if params.cgst_max_iter == 0 {
            p
        } else {
            params.cgst_max_iter
        };
        Self {
            max_iter,
            tol: params.cgst_tol,
            z: DVector::zeros(p),
            r: DVector::zeros(p),
            d: DVector::zeros(p),
            bd: DVector::zeros(p),
            workp: DVector::zeros(p),
            niter: 0,
        }
    }

    /// bd = D^{-1} J^T J D^{-1} d
    fn scaled_product(&mut self, jtj: &DMatrix<f64>, diag: &DVector<f64>) {
        self.workp.copy_from(&self.d);
        self.workp.component_div_assign(diag);
        self.bd.gemv(1.0, jtj, &self.workp, 0.0);
        self.bd.component_div_assign(diag);
    }

    fn to_boundary(&mut self, delta: f64) -> Result<()> {
        let tau = boundary_tau(&self.z, &self.d, delta).ok_or_else(|| {
            MultilargeError::StepFailed("cgst: zero search direction".to_string())
        })?;
        self.z.axpy(tau, &self.d, 1.0);
        Ok(())
    }

    fn truncated_cg(&mut self, view: &TrustView, delta: f64) -> Result<()> {
        let diag = view.diag;
        self.z.fill(0.0);
        // r = -D^{-1} g
        self.r.copy_from(view.g);
        self.r.component_div_assign(diag);
        self.r.neg_mut();
        self.d.copy_from(&self.r);

        let r0 = self.r.norm();
        if r0 == 0.0 {
            return Err(MultilargeError::StepFailed(
                "cgst: gradient vanishes".to_string(),
            ));
        }
        let mut rr = r0 * r0;
        for i in 0..self.max_iter {
            self.niter = i + 1;
            self.scaled_product(view.jtj, diag);
            let kappa = self.d.dot(&self.bd);
            if kappa <= 0.0 {
                trace!("cgst: negative curvature at iteration {}", i);
                return self.to_boundary(delta);
            }
            let alpha = rr / kappa;
            // ||z + alpha d|| without forming it
            let znext2 =
                self.z.norm_squared() + 2.0 * alpha * self.z.dot(&self.d)
                    + alpha * alpha * self.d.norm_squared();
            if znext2.sqrt() >= delta {
                trace!("cgst: boundary reached at iteration {}", i);
                return self.to_boundary(delta);
            }
            self.z.axpy(alpha, &self.d, 1.0);
            self.r.axpy(-alpha, &self.bd, 1.0);
            let rr_new = self.r.norm_squared();
            if rr_new.sqrt() <= self.tol * r0 {
                return Ok(());
            }
            let beta = rr_new / rr;
            rr = rr_new;
            // d = r + beta d
            self.d.axpy(1.0, &self.r, beta);
        }
        Err(MultilargeError::StepFailed(format!(
            "cgst: no convergence in {} iterations",
            self.max_iter
        )))
    }
}

impl TrustRegionSubproblem for CgstSubproblem {
    fn kind(&self) -> TrsKind {
        TrsKind::Cgst
    }

    fn init(&mut self, _view: &mut TrustView) -> Result<()> {
        self.niter = 0;
        Ok(())
    }

    fn preloop(&mut self, _view: &mut TrustView) -> Result<()> {
        Ok(())
    }

    fn step(&mut self, view: &mut TrustView, delta: f64, dx: &mut DVector<f64>) -> Result<()> {
        self.truncated_cg(view, delta)?;
        dx.copy_from(&self.z);
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
