/*
Outer layer of the large scale least squares solver: owns the problem definition and the
trust region driver, counts iterations, tests for convergence and runs the full loop.

    let mut w = MultilargeWorkspace::new(params, n, p)?;
    w.init(&x0, fdf)?;
    let info = w.driver(200, 1e-8, 1e-8, 0.0, None)?;
*/
use crate::Utils::history::{IterationHistory, IterationRecord};
use crate::Utils::logging::SolverLogger;
use crate::numerical::multilarge::convergence::{ConvergenceInfo, test_convergence};
use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::fdf::MultilargeFdf;
use crate::numerical::multilarge::parameters::{DriverSettings, MultilargeParameters, describe};
use crate::numerical::multilarge::trust::TrustRegionDriver;
use crate::somelinalg::linear_sys_diagnostics::{poorly_conditioned, pseudo_inverse_spd};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::time::Instant;

/// callback invoked after every iteration of [`MultilargeWorkspace::driver`]
pub type IterationCallback<'a> = &'a mut dyn FnMut(usize, &MultilargeWorkspace);

pub struct MultilargeWorkspace {
    trust: TrustRegionDriver,
    fdf: Option<MultilargeFdf>,
    niter: usize,
    history: Option<IterationHistory>,
    logger: Option<SolverLogger>,
    statistics: HashMap<String, usize>,
}

impl MultilargeWorkspace {
    pub fn new(params: MultilargeParameters, n: usize, p: usize) -> Result<Self> {
        let trust = TrustRegionDriver::new(params, n, p)?;
        Ok(Self {
            trust,
            fdf: None,
            niter: 0,
            history: None,
            logger: None,
            statistics: HashMap::new(),
        })
    }

    /// Replaces the driver's subproblem by a user supplied one. Call before `init`.
    pub fn with_subproblem(
        mut self,
        trs: Box<dyn crate::numerical::multilarge::trs::TrustRegionSubproblem>,
    ) -> Self {
        self.trust = self.trust.with_subproblem(trs);
        self
    }

    /// Starts an unweighted problem at `x0`.
    pub fn init(&mut self, x0: &DVector<f64>, fdf: MultilargeFdf) -> Result<()> {
        self.start(x0, None, fdf)
    }

    /// Starts a weighted problem at `x0`, minimizing 1/2 sum_i w_i f_i^2.
    pub fn winit(
        &mut self,
        x0: &DVector<f64>,
        weights: &DVector<f64>,
        fdf: MultilargeFdf,
    ) -> Result<()> {
        self.start(x0, Some(weights), fdf)
    }

    fn start(
        &mut self,
        x0: &DVector<f64>,
        weights: Option<&DVector<f64>>,
        mut fdf: MultilargeFdf,
    ) -> Result<()> {
        fdf.reset_counters();
        let status = self.trust.init(x0, weights, &mut fdf);
        // keep the problem even on failure so its counters can be inspected
        self.fdf = Some(fdf);
        status?;
        self.niter = 0;
        if let Some(history) = self.history.as_mut() {
            history.records.clear();
        }
        Ok(())
    }

    /// One iteration of the trust region driver.
    pub fn iterate(&mut self) -> Result<()> {
        let fdf = self.fdf.as_mut().ok_or_else(|| {
            MultilargeError::Domain("workspace has no problem, call init first".to_string())
        })?;
        let status = self.trust.iterate(fdf);
        self.niter += 1;
        if status.is_ok() {
            if let Some(history) = self.history.as_mut() {
                history.push(IterationRecord {
                    iter: self.niter,
                    fnorm: self.trust.f().norm(),
                    delta: self.trust.delta(),
                    mu: self.trust.mu(),
                    dxnorm: self.trust.dx().norm(),
                    avratio: self.trust.avratio(),
                });
            }
        }
        status
    }

    /// Convergence test on the last step and the current gradient.
    pub fn test(&self, xtol: f64, gtol: f64, ftol: f64) -> Option<ConvergenceInfo> {
        test_convergence(
            self.trust.x(),
            self.trust.dx(),
            self.trust.g(),
            self.trust.f(),
            xtol,
            gtol,
            ftol,
        )
    }

    /// Iterates until convergence or `maxiter` iterations.
    ///
    /// NoProgress on the first iteration means the starting point cannot be improved and is
    /// returned; later ones leave a short last step behind, which the step test picks up.
    pub fn driver(
        &mut self,
        maxiter: usize,
        xtol: f64,
        gtol: f64,
        ftol: f64,
        mut callback: Option<IterationCallback>,
    ) -> Result<ConvergenceInfo> {
        if let Some(logger) = self.logger.as_ref() {
            logger.init();
        }
        info!("multilarge solver started with {:?}", describe(self.trust.params()));
        let start = Instant::now();

        let mut iter = 0;
        let mut outcome = None;
        while iter < maxiter {
            match self.iterate() {
                Ok(()) => {}
                Err(MultilargeError::NoProgress) if iter == 0 => {
                    warn!("no progress possible from the starting point");
                    self.record_statistics(start);
                    return Err(MultilargeError::NoProgress);
                }
                Err(MultilargeError::NoProgress) => {}
                Err(e) => {
                    self.record_statistics(start);
                    return Err(e);
                }
            }
            iter += 1;
            if let Some(cb) = callback.as_mut() {
                cb(iter, self);
            }
            outcome = self.test(xtol, gtol, ftol);
            if outcome.is_some() {
                break;
            }
        }
        self.record_statistics(start);
        match outcome {
            Some(reason) => {
                info!(
                    "multilarge solver converged ({}) after {} iterations, ||f|| = {:e}",
                    reason,
                    iter,
                    self.trust.f().norm()
                );
                Ok(reason)
            }
            None => {
                warn!("maximum number of iterations {} reached", maxiter);
                Err(MultilargeError::MaxIter)
            }
        }
    }

    /// `driver` with tolerances read from a parameter document
    pub fn driver_with(
        &mut self,
        settings: &DriverSettings,
        callback: Option<IterationCallback>,
    ) -> Result<ConvergenceInfo> {
        self.driver(
            settings.maxiter,
            settings.xtol,
            settings.gtol,
            settings.ftol,
            callback,
        )
    }

    fn record_statistics(&mut self, start: Instant) {
        self.statistics
            .insert("time elapsed, ms".to_string(), start.elapsed().as_millis() as usize);
        self.statistics.insert("iterations".to_string(), self.niter);
        if let Some(fdf) = self.fdf.as_ref() {
            self.statistics
                .insert("function evaluations".to_string(), fdf.nevalf);
            self.statistics
                .insert("jacobian evaluations".to_string(), fdf.nevaldf);
            self.statistics.insert("fvv evaluations".to_string(), fdf.nevalfvv);
        }
        for (k, v) in self.statistics.iter() {
            info!("{}: {}", k, v);
        }
    }

    /// Covariance of the best fit parameters, (J^T J)^{-1} with singular directions
    /// (relative to `epsrel`) removed.
    pub fn covariance(&self, epsrel: f64) -> Result<DMatrix<f64>> {
        if !self.trust.is_initialized() {
            return Err(MultilargeError::Domain(
                "covariance requested before init".to_string(),
            ));
        }
        // only logs; the pseudo inverse drops the offending directions
        poorly_conditioned(self.trust.jtj(), 1e12);
        pseudo_inverse_spd(self.trust.jtj(), epsrel).ok_or_else(|| {
            MultilargeError::SolverFailed("SVD of J^T J did not converge".to_string())
        })
    }

    /// reciprocal condition number of J^T J at the current point
    pub fn rcond(&mut self) -> Result<f64> {
        self.trust.rcond()
    }

    pub fn enable_history(&mut self) {
        if self.history.is_none() {
            self.history = Some(IterationHistory::new());
        }
    }

    pub fn history(&self) -> Option<&IterationHistory> {
        self.history.as_ref()
    }

    /// Level "off", "error", "warn", "info", "debug" or "trace"; the logger is installed when
    /// `driver` starts. Returns false for an unknown level.
    pub fn set_log_level(&mut self, level: &str) -> bool {
        match SolverLogger::level_from_str(level) {
            Some(level) => {
                let logger = self.logger.get_or_insert_with(SolverLogger::default);
                logger.level = level;
                true
            }
            None => false,
        }
    }

    /// also write the log into `path`
    pub fn set_log_file(&mut self, path: &str) {
        let logger = self.logger.get_or_insert_with(SolverLogger::default);
        logger.file = Some(path.to_string());
    }

    pub fn logger(&self) -> Option<&SolverLogger> {
        self.logger.as_ref()
    }

    pub fn statistics(&self) -> &HashMap<String, usize> {
        &self.statistics
    }

    pub fn name(&self) -> String {
        format!("trust-region/{}", self.trust.trs_kind())
    }

    pub fn trs_name(&self) -> String {
        self.trust.trs_kind().to_string()
    }

    pub fn niter(&self) -> usize {
        self.niter
    }

    pub fn position(&self) -> &DVector<f64> {
        self.trust.x()
    }

    /// weighted residual sqrt(W) f
    pub fn residual(&self) -> &DVector<f64> {
        self.trust.f()
    }

    pub fn gradient(&self) -> &DVector<f64> {
        self.trust.g()
    }

    pub fn jtj(&self) -> &DMatrix<f64> {
        self.trust.jtj()
    }

    pub fn step(&self) -> &DVector<f64> {
        self.trust.dx()
    }

    pub fn normf(&self) -> f64 {
        self.trust.f().norm()
    }

    pub fn avratio(&self) -> f64 {
        self.trust.avratio()
    }

    pub fn trust(&self) -> &TrustRegionDriver {
        &self.trust
    }

    pub fn fdf(&self) -> Option<&MultilargeFdf> {
        self.fdf.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::multilarge::parameters::TrsKind;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrixViewMut, dmatrix, dvector};
    use std::fs;
    use strum::IntoEnumIterator;
    use tempfile::tempdir;

    fn linear_problem() -> MultilargeFdf {
        MultilargeFdf::new(3, 2, |x, f| {
            f[0] = x[0] - 1.0;
            f[1] = x[1] - 2.0;
            f[2] = x[0] + x[1];
            Ok(())
        })
        .with_jacobian(|_x, row0, mut block: DMatrixViewMut<f64>| {
            let a = dmatrix![1.0, 0.0; 0.0, 1.0; 1.0, 1.0];
            for i in 0..block.nrows() {
                block.set_row(i, &a.row(row0 + i));
            }
            Ok(())
        })
    }

    fn rosenbrock() -> MultilargeFdf {
        MultilargeFdf::new(2, 2, |x, f| {
            f[0] = 10.0 * (x[1] - x[0] * x[0]);
            f[1] = 1.0 - x[0];
            Ok(())
        })
    }

    #[test]
    fn test_driver_solves_linear_problem() {
        let mut w = MultilargeWorkspace::new(MultilargeParameters::default(), 3, 2).unwrap();
        w.init(&dvector![0.0, 0.0], linear_problem()).unwrap();
        let info = w.driver(100, 1e-12, 1e-12, 0.0, None).unwrap();
        assert!(matches!(
            info,
            ConvergenceInfo::SmallStep | ConvergenceInfo::SmallGradient
        ));
        assert_relative_eq!(w.position(), &dvector![1.0 / 3.0, 4.0 / 3.0], epsilon = 1e-10);

        // covariance of the linear fit is (A^T A)^{-1}
        let expected = dmatrix![2.0, 1.0; 1.0, 2.0].try_inverse().unwrap();
        assert_relative_eq!(w.covariance(1e-12).unwrap(), expected, epsilon = 1e-10);
        let rcond = w.rcond().unwrap();
        assert_relative_eq!(rcond, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_every_method_solves_rosenbrock() {
        for kind in TrsKind::iter() {
            let params = MultilargeParameters::default().with_trs(kind);
            let mut w = MultilargeWorkspace::new(params, 2, 2).unwrap();
            w.init(&dvector![-1.2, 1.0], rosenbrock()).unwrap();
            let result = w.driver(500, 1e-10, 1e-10, 0.0, None);
            assert!(result.is_ok(), "{}: {:?}", kind, result);
            assert!(w.normf() < 1e-6, "{}: ||f|| = {}", kind, w.normf());
            assert_eq!(w.trs_name(), kind.to_string());
        }
    }

    #[test]
    fn test_weighted_driver_matches_scaled_problem() {
        let mut weighted = MultilargeWorkspace::new(MultilargeParameters::default(), 3, 2).unwrap();
        weighted
            .winit(&dvector![5.0, -5.0], &dvector![4.0, 4.0, 4.0], linear_problem())
            .unwrap();
        weighted.driver(200, 1e-14, 1e-14, 0.0, None).unwrap();

        let doubled = MultilargeFdf::new(3, 2, |x, f| {
            f[0] = 2.0 * (x[0] - 1.0);
            f[1] = 2.0 * (x[1] - 2.0);
            f[2] = 2.0 * (x[0] + x[1]);
            Ok(())
        });
        let mut scaled = MultilargeWorkspace::new(MultilargeParameters::default(), 3, 2).unwrap();
        scaled
            .winit(&dvector![5.0, -5.0], &dvector![1.0, 1.0, 1.0], doubled)
            .unwrap();
        scaled.driver(200, 1e-14, 1e-14, 0.0, None).unwrap();
        assert_relative_eq!(weighted.position(), scaled.position(), epsilon = 1e-12);
        assert_relative_eq!(weighted.normf(), scaled.normf(), epsilon = 1e-12);
    }

    #[test]
    fn test_callback_and_history() {
        let mut w = MultilargeWorkspace::new(MultilargeParameters::default(), 2, 2).unwrap();
        w.enable_history();
        w.init(&dvector![-1.2, 1.0], rosenbrock()).unwrap();
        let mut seen = Vec::new();
        let mut cb = |iter: usize, ws: &MultilargeWorkspace| seen.push((iter, ws.normf()));
        w.driver(500, 1e-10, 1e-10, 0.0, Some(&mut cb)).unwrap();
        assert_eq!(seen.len(), w.niter());
        assert_eq!(seen[0].0, 1);

        let history = w.history().unwrap();
        assert!(!history.is_empty());
        assert!(history.len() <= w.niter());
        let dir = tempdir().unwrap();
        let path = dir.path().join("rosenbrock.csv");
        history.save_to_csv(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), history.len() + 1);

        let stats = w.statistics();
        assert_eq!(stats["iterations"], w.niter());
        assert!(stats["function evaluations"] > w.niter());
    }

    #[test]
    fn test_max_iterations() {
        let mut w = MultilargeWorkspace::new(MultilargeParameters::default(), 2, 2).unwrap();
        w.init(&dvector![-1.2, 1.0], rosenbrock()).unwrap();
        assert_eq!(
            w.driver(2, 1e-15, 1e-15, 0.0, None),
            Err(MultilargeError::MaxIter)
        );
        assert_eq!(w.niter(), 2);
    }

    #[test]
    fn test_no_progress_at_start_is_fatal() {
        // ||f|| = 1 everywhere: no step can reduce it
        let flat = MultilargeFdf::new(1, 1, |_x, f| {
            f[0] = 1.0;
            Ok(())
        })
        .with_jacobian(|_x, _row0, mut block: DMatrixViewMut<f64>| {
            block[(0, 0)] = 1.0;
            Ok(())
        });
        let mut w = MultilargeWorkspace::new(MultilargeParameters::default(), 1, 1).unwrap();
        w.init(&dvector![0.0], flat).unwrap();
        assert_eq!(
            w.driver(10, 1e-8, 1e-8, 0.0, None),
            Err(MultilargeError::NoProgress)
        );
        assert_eq!(w.niter(), 1);
    }

    #[test]
    fn test_settings_from_document() {
        let document = "trust_region\n  trs: ddogleg\n  scale: marquardt\ndriver\n  maxiter: 300\n  xtol: 1e-10\n  gtol: 1e-10\n";
        let (params, settings) = MultilargeParameters::from_document(document).unwrap();
        let mut w = MultilargeWorkspace::new(params, 2, 2).unwrap();
        w.init(&dvector![-1.2, 1.0], rosenbrock()).unwrap();
        w.driver_with(&settings, None).unwrap();
        assert_eq!(w.trs_name(), "ddogleg");
        assert!(w.normf() < 1e-6);
    }

    #[test]
    fn test_logging_configuration() {
        let mut w = MultilargeWorkspace::new(MultilargeParameters::default(), 2, 2).unwrap();
        assert!(w.logger().is_none());
        assert!(!w.set_log_level("chatty"));
        assert!(w.set_log_level("off"));
        w.set_log_file("solver.log");
        let logger = w.logger().unwrap();
        assert_eq!(logger.level, log::LevelFilter::Off);
        assert_eq!(logger.file.as_deref(), Some("solver.log"));
        assert!(w.iterate().is_err());
    }
}
