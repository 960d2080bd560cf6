/*
Trust region driver for large nonlinear least squares problems
    min 1/2 ||sqrt(W) f(x)||^2

Only J^T J and g = J^T f are kept (p x p and p), never the n x p Jacobian.
One call of `iterate` runs trial steps until one is accepted:

  1) the subproblem proposes dx with ||D dx|| <= delta
  2) f_trial = f(x + dx)
  3) rho = actual_reduction / predicted_reduction,
         actual_reduction = 1 - (||f_trial|| / ||f||)^2
     rho = -1 if ||f_trial|| >= ||f||, the subproblem failed, or pred <= 0
  4) delta *= factor_up if rho > 0.75, delta /= factor_down if rho < 0.25
  5) rho > 0: accept, refresh g, J^T J and D, decrease mu
     otherwise increase mu; give up with NoProgress after max_bad_steps + 1 rejections

With the lmaccel subproblem a step is also rejected when |a| / |v| > avmax.
*/
use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::fdf::{
    FdfWorkspace, JacobianOp, MultilargeFdf, eval_df, eval_f,
};
use crate::numerical::multilarge::linear_solver::LinearSolver;
use crate::numerical::multilarge::nielsen::NielsenDamping;
use crate::numerical::multilarge::parameters::{MultilargeParameters, TrsKind};
use crate::numerical::multilarge::scaling::ScalingPolicy;
use crate::numerical::multilarge::trs::{TrustRegionSubproblem, TrustView, scaled_norm};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

/// New trust radius after a trial step with acceptance ratio `rho`.
pub fn update_radius(rho: f64, delta: f64, params: &MultilargeParameters) -> f64 {
    if rho > 0.75 {
        delta * params.factor_up
    } else if rho < 0.25 {
        delta / params.factor_down
    } else {
        delta
    }
}

/// view of the driver state for the subproblem, built from disjoint field borrows
macro_rules! trust_view {
    ($s:ident, $fdf:expr) => {
        TrustView {
            x: &$s.x,
            f: &$s.f,
            g: &$s.g,
            jtj: &$s.jtj,
            diag: &$s.diag,
            sqrt_wts: $s.sqrt_wts.as_ref(),
            mu: $s.damping.mu,
            params: &$s.params,
            solver: $s.solver.as_mut(),
            fdf: &mut *$fdf,
            fdf_ws: &mut $s.fdf_ws,
            avratio: &mut $s.avratio,
        }
    };
}

pub struct TrustRegionDriver {
    n: usize,
    p: usize,
    params: MultilargeParameters,
    /// current parameters
    x: DVector<f64>,
    /// sqrt(W) f(x)
    f: DVector<f64>,
    /// J_w^T f
    g: DVector<f64>,
    jtj: DMatrix<f64>,
    /// last trial step
    dx: DVector<f64>,
    /// scaling D
    diag: DVector<f64>,
    sqrt_wts: Option<DVector<f64>>,
    x_trial: DVector<f64>,
    f_trial: DVector<f64>,
    /// gradient and J^T J of a restart, committed only when the start point evaluates
    g_trial: DVector<f64>,
    jtj_trial: DMatrix<f64>,
    /// trust radius
    delta: f64,
    damping: NielsenDamping,
    /// |a| / |v| of the last lmaccel step
    avratio: f64,
    /// consecutive rejected steps of the current iteration
    bad_steps: usize,
    trs: Box<dyn TrustRegionSubproblem>,
    solver: Box<dyn LinearSolver>,
    scale: &'static dyn ScalingPolicy,
    fdf_ws: FdfWorkspace,
    initialized: bool,
}

impl TrustRegionDriver {
    pub fn new(params: MultilargeParameters, n: usize, p: usize) -> Result<Self> {
        params.validate()?;
        if p == 0 || n < p {
            return Err(MultilargeError::Domain(format!(
                "need 1 <= p <= n, got n = {}, p = {}",
                n, p
            )));
        }
        p.checked_mul(p)
            .ok_or_else(|| MultilargeError::NoMemory(format!("J^T J of size {} x {}", p, p)))?;
        let fdf_ws = FdfWorkspace::new(n, p, params.block_rows)?;
        let trs = params.trs.alloc(&params, n, p);
        let solver = params.solver.alloc(p);
        let scale = params.scale.policy();
        Ok(Self {
            n,
            p,
            params,
            x: DVector::zeros(p),
            f: DVector::zeros(n),
            g: DVector::zeros(p),
            jtj: DMatrix::zeros(p, p),
            dx: DVector::zeros(p),
            diag: DVector::from_element(p, 1.0),
            sqrt_wts: None,
            x_trial: DVector::zeros(p),
            f_trial: DVector::zeros(n),
            g_trial: DVector::zeros(p),
            jtj_trial: DMatrix::zeros(p, p),
            delta: 0.0,
            damping: NielsenDamping::default(),
            avratio: 0.0,
            bad_steps: 0,
            trs,
            solver,
            scale,
            fdf_ws,
            initialized: false,
        })
    }

    /// Replaces the subproblem chosen by `params.trs`. Takes effect at the next `init`.
    pub fn with_subproblem(mut self, trs: Box<dyn TrustRegionSubproblem>) -> Self {
        self.trs = trs;
        self.initialized = false;
        self
    }

    /// Evaluates f, g and J^T J at `x0` and sets up D, delta, mu and the subproblem.
    /// `weights` are the data weights w_i >= 0 of the weighted problem.
    /// On error the previous point (x, f, g, J^T J, weights) is left as it was, but the driver
    /// needs a successful `init` before it iterates again.
    pub fn init(
        &mut self,
        x0: &DVector<f64>,
        weights: Option<&DVector<f64>>,
        fdf: &mut MultilargeFdf,
    ) -> Result<()> {
        self.initialized = false;
        if fdf.n != self.n || fdf.p != self.p {
            return Err(MultilargeError::Domain(format!(
                "problem has n = {}, p = {}, solver was allocated for n = {}, p = {}",
                fdf.n, fdf.p, self.n, self.p
            )));
        }
        if x0.len() != self.p {
            return Err(MultilargeError::Domain(format!(
                "x0 has length {}, expected {}",
                x0.len(),
                self.p
            )));
        }
        let sqrt_wts = match weights {
            Some(w) => {
                if w.len() != self.n {
                    return Err(MultilargeError::Domain(format!(
                        "weights have length {}, expected {}",
                        w.len(),
                        self.n
                    )));
                }
                if let Some(i) = w.iter().position(|wi| !(wi.is_finite() && *wi >= 0.0)) {
                    return Err(MultilargeError::Domain(format!(
                        "weight {} is {}, weights must be finite and non-negative",
                        i, w[i]
                    )));
                }
                Some(w.map(f64::sqrt))
            }
            None => None,
        };
        if !fdf.has_jacobian() && self.fdf_ws.block_rows() < self.n {
            warn!(
                "finite difference Jacobian in blocks of {} rows: every block repeats the residual evaluations",
                self.fdf_ws.block_rows()
            );
        }

        // evaluate into the trial buffers first so a failed start leaves the state untouched
        self.x_trial.copy_from(x0);
        eval_f(fdf, &self.x_trial, sqrt_wts.as_ref(), &mut self.f_trial)
            .map_err(initial_domain_error)?;
        eval_df(
            JacobianOp::Trans,
            &self.x_trial,
            &self.f_trial,
            &self.f_trial,
            sqrt_wts.as_ref(),
            &self.params,
            fdf,
            &mut self.fdf_ws,
            &mut self.g_trial,
            Some(&mut self.jtj_trial),
        )
        .map_err(initial_domain_error)?;
        self.sqrt_wts = sqrt_wts;
        self.x.copy_from(&self.x_trial);
        self.f.copy_from(&self.f_trial);
        self.g.copy_from(&self.g_trial);
        self.jtj.copy_from(&self.jtj_trial);
        self.dx.fill(0.0);

        self.scale.init(&self.jtj, &mut self.diag);
        self.delta = 0.3 * scaled_norm(&self.diag, &self.x).max(1.0);
        self.damping.init(self.params.tau, &self.jtj, &self.diag);
        self.avratio = 0.0;
        self.bad_steps = 0;

        self.trs.init(&mut trust_view!(self, fdf))?;
        self.avratio = 0.0;
        self.initialized = true;
        info!(
            "trust region ({}, {} solver, {} scaling) initialized: n = {}, p = {}, ||f|| = {:e}, delta = {:e}, mu = {:e}",
            self.params.trs,
            self.solver.name(),
            self.scale.name(),
            self.n,
            self.p,
            self.f.norm(),
            self.delta,
            self.damping.mu
        );
        Ok(())
    }

    /// One iteration: trial steps until one is accepted.
    /// On success x, f, g and J^T J describe the new point; on NoProgress they are unchanged.
    ///
    /// A trial point where f is not finite is rejected like an uphill step (rho = -1) and
    /// shrinks the radius, so `BadFunc` only comes back from the Jacobian refresh of an
    /// accepted point. A user callback error always ends the iteration.
    pub fn iterate(&mut self, fdf: &mut MultilargeFdf) -> Result<()> {
        if !self.initialized {
            return Err(MultilargeError::Domain(
                "iterate called before init".to_string(),
            ));
        }
        self.bad_steps = 0;
        self.trs.preloop(&mut trust_view!(self, fdf))?;

        loop {
            let step = self
                .trs
                .step(&mut trust_view!(self, fdf), self.delta, &mut self.dx);
            let mut vetoed = false;
            let rho = match step {
                Ok(()) => {
                    self.x_trial.copy_from(&self.x);
                    self.x_trial.axpy(1.0, &self.dx, 1.0);
                    match eval_f(fdf, &self.x_trial, self.sqrt_wts.as_ref(), &mut self.f_trial) {
                        Ok(()) => {
                            if self.trs.kind() == TrsKind::LmAccel
                                && self.avratio > self.params.avmax
                            {
                                // acceleration too large compared to velocity
                                vetoed = true;
                            }
                            self.calc_rho(fdf)
                        }
                        Err(MultilargeError::BadFunc(msg)) => {
                            warn!("trial point rejected: {}", msg);
                            -1.0
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(MultilargeError::UserCallback(msg)) => {
                    return Err(MultilargeError::UserCallback(msg));
                }
                Err(e) => {
                    // iterative subproblems may fail to find a step
                    debug!("no trial step: {}", e);
                    -1.0
                }
            };

            debug!(
                "delta = {:e}, |D dx| = {:e}, |dx| = {:e}, |f_trial| = {:e}, rho = {:e}{}",
                self.delta,
                scaled_norm(&self.diag, &self.dx),
                self.dx.norm(),
                self.f_trial.norm(),
                rho,
                if vetoed { " (avratio too large)" } else { "" }
            );

            self.delta = update_radius(rho, self.delta, &self.params);

            if rho > 0.0 && !vetoed {
                self.accept(rho, fdf)?;
                return Ok(());
            }

            self.damping.reject();
            self.bad_steps += 1;
            if self.bad_steps > self.params.max_bad_steps {
                warn!(
                    "no progress after {} rejected steps, delta = {:e}",
                    self.bad_steps, self.delta
                );
                return Err(MultilargeError::NoProgress);
            }
        }
    }

    fn accept(&mut self, rho: f64, fdf: &mut MultilargeFdf) -> Result<()> {
        self.x.copy_from(&self.x_trial);
        self.f.copy_from(&self.f_trial);
        eval_df(
            JacobianOp::Trans,
            &self.x,
            &self.f,
            &self.f,
            self.sqrt_wts.as_ref(),
            &self.params,
            fdf,
            &mut self.fdf_ws,
            &mut self.g,
            Some(&mut self.jtj),
        )?;
        self.scale.update(&self.jtj, &mut self.diag);
        self.damping.accept(rho);
        self.bad_steps = 0;
        Ok(())
    }

    /// rho = actual_reduction / predicted_reduction, -1 if the step does not reduce ||f||
    fn calc_rho(&mut self, fdf: &mut MultilargeFdf) -> f64 {
        let normf = self.f.norm();
        let normf_trial = self.f_trial.norm();
        if !(normf_trial < normf) {
            return -1.0;
        }
        let u = normf_trial / normf;
        let actual_reduction = 1.0 - u * u;

        // the model, and with it the predicted reduction, belongs to the subproblem
        let pred = {
            let view = trust_view!(self, fdf);
            self.trs.preduction(&view, &self.dx)
        };
        match pred {
            Ok(pred) if pred > 0.0 => actual_reduction / pred,
            Ok(_) => -1.0,
            Err(e) => {
                debug!("predicted reduction failed: {}", e);
                -1.0
            }
        }
    }

    /// reciprocal condition number of the current J^T J
    pub fn rcond(&mut self) -> Result<f64> {
        self.solver.rcond(&self.jtj)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn p(&self) -> usize {
        self.p
    }

    pub fn params(&self) -> &MultilargeParameters {
        &self.params
    }

    pub fn trs_kind(&self) -> TrsKind {
        self.trs.kind()
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn f(&self) -> &DVector<f64> {
        &self.f
    }

    pub fn g(&self) -> &DVector<f64> {
        &self.g
    }

    pub fn jtj(&self) -> &DMatrix<f64> {
        &self.jtj
    }

    pub fn dx(&self) -> &DVector<f64> {
        &self.dx
    }

    pub fn diag(&self) -> &DVector<f64> {
        &self.diag
    }

    pub fn sqrt_weights(&self) -> Option<&DVector<f64>> {
        self.sqrt_wts.as_ref()
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn mu(&self) -> f64 {
        self.damping.mu
    }

    pub fn nu(&self) -> f64 {
        self.damping.nu
    }

    pub fn avratio(&self) -> f64 {
        self.avratio
    }

    pub fn bad_steps(&self) -> usize {
        self.bad_steps
    }
}

fn initial_domain_error(e: MultilargeError) -> MultilargeError {
    match e {
        MultilargeError::BadFunc(msg) => {
            MultilargeError::Domain(format!("non-finite initial evaluation: {}", msg))
        }
        other => other,
    }
}
