//! Levenberg-Marquardt step, optionally with geodesic acceleration
//! (Transtrum & Sethna, "Improvements to the Levenberg-Marquardt algorithm for nonlinear
//! least-squares minimization", 2012):
//!     v = -(J^T J + mu D^2)^{-1} g
//!     a = -(J^T J + mu D^2)^{-1} J^T fvv(v)
//!     dx = v + a / 2
//! The radius is not used, the damping mu plays its role.
use crate::numerical::multilarge::error::Result;
use crate::numerical::multilarge::fdf::{JacobianOp, eval_df, eval_fvv};
use crate::numerical::multilarge::parameters::TrsKind;
use crate::numerical::multilarge::trs::{
    TrustRegionSubproblem, TrustView, quadratic_preduction, scaled_norm,
};
use log::trace;
use nalgebra::DVector;

pub struct LmSubproblem {
    accel: bool,
    /// velocity v
    vel: DVector<f64>,
    /// acceleration a
    acc: DVector<f64>,
    /// second directional derivative of the residual along v, length n
    fvv: DVector<f64>,
    workp: DVector<f64>,
}

impl LmSubproblem {
    pub fn new(accel: bool, n: usize, p: usize) -> Self {
        Self {
            accel,
            vel: DVector::zeros(p),
            acc: DVector::zeros(p),
            fvv: DVector::zeros(if accel { n } else { 0 }),
            workp: DVector::zeros(p),
        }
    }

    pub fn velocity(&self) -> &DVector<f64> {
        &self.vel
    }

    pub fn acceleration(&self) -> &DVector<f64> {
        &self.acc
    }
}

impl TrustRegionSubproblem for LmSubproblem {
    fn kind(&self) -> TrsKind {
        if self.accel {
            TrsKind::LmAccel
        } else {
            TrsKind::Lm
        }
    }

    fn init(&mut self, view: &mut TrustView) -> Result<()> {
        view.solver.init()
    }

    fn preloop(&mut self, _view: &mut TrustView) -> Result<()> {
        Ok(())
    }

    fn step(&mut self, view: &mut TrustView, _delta: f64, dx: &mut DVector<f64>) -> Result<()> {
        // mu grows after every rejected step, so refactor for each trial
        view.solver.presolve(view.mu, view.jtj, view.diag)?;
        view.solver.solve(view.g, &mut self.vel)?;
        if !self.accel {
            dx.copy_from(&self.vel);
            return Ok(());
        }

        eval_fvv(
            view.x,
            &self.vel,
            view.f,
            view.sqrt_wts,
            view.params,
            view.fdf,
            view.fdf_ws,
            &mut self.fvv,
        )?;
        // workp = J^T fvv
        eval_df(
            JacobianOp::Trans,
            view.x,
            view.f,
            &self.fvv,
            view.sqrt_wts,
            view.params,
            view.fdf,
            view.fdf_ws,
            &mut self.workp,
            None,
        )?;
        view.solver.solve(&self.workp, &mut self.acc)?;

        let anorm = scaled_norm(view.diag, &self.acc);
        let vnorm = scaled_norm(view.diag, &self.vel);
        *view.avratio = if vnorm > 0.0 { anorm / vnorm } else { 0.0 };
        trace!("lmaccel: |a| = {:e}, |v| = {:e}", anorm, vnorm);

        dx.copy_from(&self.vel);
        dx.axpy(0.5, &self.acc, 1.0);
        Ok(())
    }

    fn preduction(&mut self, view: &TrustView, dx: &DVector<f64>) -> Result<f64> {
        if !self.accel {
            return Ok(quadratic_preduction(view.f, view.g, view.jtj, dx, &mut self.workp));
        }
        // the acceleration is a second order correction, the model is evaluated on v;
        // a zero step predicts nothing
        if dx.iter().all(|di| *di == 0.0) {
            return Ok(0.0);
        }
        Ok(quadratic_preduction(
            view.f,
            view.g,
            view.jtj,
            &self.vel,
            &mut self.workp,
        ))
    }
}
