use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::parameters::TrsKind;
use crate::numerical::multilarge::trs::{
    TrustRegionSubproblem, TrustView, quadratic_preduction, scaled_norm,
};
use log::trace;
use nalgebra::DVector;

/// recommended value from Dennis and Mei
const ALPHA_FAC: f64 = 0.8;

/// Powell dogleg and the Dennis-Mei double dogleg on the normal equations.
///
/// The path runs from the Cauchy point
///     dx_sd = -(||D^{-1} g||^2 / ||J D^{-2} g||^2) D^{-2} g
/// to the Gauss-Newton point dx_gn = -(J^T J)^{-1} g. With only J^T J available,
/// ||J D^{-2} g||^2 is formed as (D^{-2} g)^T J^T J (D^{-2} g).
pub struct DoglegSubproblem {
    double: bool,
    dx_gn: DVector<f64>,
    dx_sd: DVector<f64>,
    /// ||D dx_gn||, valid when `gn_computed`
    norm_dgn: f64,
    /// ||D dx_sd||
    norm_dsd: f64,
    /// ||D^{-1} g||
    norm_dinvg: f64,
    /// ||J D^{-2} g||
    norm_jdinv2g: f64,
    workp: DVector<f64>,
    workp2: DVector<f64>,
    gn_computed: bool,
}

impl DoglegSubproblem {
    pub fn new(double: bool, _n: usize, p: usize) -> Self {
        Self {
            double,
            dx_gn: DVector::zeros(p),
            dx_sd: DVector::zeros(p),
            norm_dgn: -1.0,
            norm_dsd: 0.0,
            norm_dinvg: 0.0,
            norm_jdinv2g: 0.0,
            workp: DVector::zeros(p),
            workp2: DVector::zeros(p),
            gn_computed: false,
        }
    }

    fn gauss_newton(&mut self, view: &mut TrustView) -> Result<()> {
        if !self.gn_computed {
            view.solver.presolve(0.0, view.jtj, view.diag)?;
            view.solver.solve(view.g, &mut self.dx_gn)?;
            self.norm_dgn = scaled_norm(view.diag, &self.dx_gn);
            self.gn_computed = true;
        }
        Ok(())
    }

    /// beta in [0, 1] with ||D (dx_sd + beta (t dx_gn - dx_sd))|| = delta
    fn dogleg_beta(&mut self, t: f64, delta: f64, diag: &DVector<f64>) -> Result<f64> {
        // workp = t dx_gn - dx_sd
        self.workp.copy_from(&self.dx_sd);
        self.workp.axpy(t, &self.dx_gn, -1.0);

        let a = scaled_norm(diag, &self.workp).powi(2);
        for i in 0..self.workp.len() {
            self.workp[i] *= diag[i] * diag[i];
        }
        let b = 2.0 * self.dx_sd.dot(&self.workp);
        // c = ||D dx_sd||^2 - delta^2
        let c = (self.norm_dsd + delta) * (self.norm_dsd - delta);

        let discriminant = b * b - 4.0 * a * c;
        if discriminant < 0.0 || a == 0.0 {
            return Err(MultilargeError::StepFailed(format!(
                "dogleg: no intersection with the trust region, a = {:e}, disc = {:e}",
                a, discriminant
            )));
        }
        let beta = if b > 0.0 {
            (-2.0 * c) / (b + discriminant.sqrt())
        } else {
            (-b + discriminant.sqrt()) / (2.0 * a)
        };
        Ok(beta.clamp(0.0, 1.0))
    }

    /// dx = dx_sd + beta (t dx_gn - dx_sd)
    fn path_point(&self, t: f64, beta: f64, dx: &mut DVector<f64>) {
        dx.copy_from(&self.dx_sd);
        dx.scale_mut(1.0 - beta);
        dx.axpy(beta * t, &self.dx_gn, 1.0);
    }
}

impl TrustRegionSubproblem for DoglegSubproblem {
    fn kind(&self) -> TrsKind {
        if self.double {
            TrsKind::DDogleg
        } else {
            TrsKind::Dogleg
        }
    }

    fn init(&mut self, view: &mut TrustView) -> Result<()> {
        view.solver.init()
    }

    /// Cauchy point of the current iterate
    fn preloop(&mut self, view: &mut TrustView) -> Result<()> {
        let diag = view.diag;
        // workp = D^{-2} g
        for i in 0..self.workp.len() {
            self.workp[i] = view.g[i] / diag[i];
        }
        self.norm_dinvg = self.workp.norm();
        for i in 0..self.workp.len() {
            self.workp[i] /= diag[i];
        }
        self.workp2.gemv(1.0, view.jtj, &self.workp, 0.0);
        self.norm_jdinv2g = self.workp.dot(&self.workp2).max(0.0).sqrt();

        self.gn_computed = false;
        self.norm_dgn = -1.0;

        if self.norm_jdinv2g == 0.0 {
            // zero gradient (or J g = 0): no descent direction
            self.dx_sd.fill(0.0);
            self.norm_dsd = 0.0;
            return Ok(());
        }
        let u = self.norm_dinvg / self.norm_jdinv2g;
        let alpha = u * u;
        self.dx_sd.copy_from(&self.workp);
        self.dx_sd.scale_mut(-alpha);
        self.norm_dsd = scaled_norm(diag, &self.dx_sd);
        Ok(())
    }

    fn step(&mut self, view: &mut TrustView, delta: f64, dx: &mut DVector<f64>) -> Result<()> {
        if self.norm_dsd == 0.0 {
            return Err(MultilargeError::StepFailed(
                "dogleg: steepest descent step vanishes".to_string(),
            ));
        }
        if self.norm_dsd >= delta {
            // Cauchy point outside the region: truncate steepest descent
            dx.copy_from(&self.dx_sd);
            dx.scale_mut(delta / self.norm_dsd);
            return Ok(());
        }

        self.gauss_newton(view)?;
        if self.norm_dgn <= delta {
            dx.copy_from(&self.dx_gn);
            return Ok(());
        }

        let t = if self.double {
            let u = self.norm_dinvg / self.norm_jdinv2g;
            let v = view.g.dot(&self.dx_gn);
            // c = ||D^{-1} g||^4 / (||J D^{-2} g||^2 |g^T dx_gn|)
            let c = u * u * self.norm_dinvg * self.norm_dinvg / v.abs();
            let t = 1.0 - ALPHA_FAC * (1.0 - c);
            if t * self.norm_dgn <= delta {
                dx.copy_from(&self.dx_gn);
                dx.scale_mut(delta / self.norm_dgn);
                return Ok(());
            }
            t
        } else {
            1.0
        };

        let beta = self.dogleg_beta(t, delta, view.diag)?;
        trace!("dogleg: t = {}, beta = {}", t, beta);
        self.path_point(t, beta, dx);
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
