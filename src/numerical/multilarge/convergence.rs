//! stopping tests of the outer iteration
use log::{debug, info};
use nalgebra::DVector;
use strum_macros::Display;

/// why the iteration stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConvergenceInfo {
    /// |dx_i| < xtol (|x_i| + xtol) for all i
    #[strum(serialize = "small step")]
    SmallStep = 1,
    /// max_i |g_i| max(|x_i|, 1) <= gtol max(1/2 ||f||^2, 1)
    #[strum(serialize = "small gradient")]
    SmallGradient = 2,
}

/// Tests the last accepted step and the gradient at the new point.
/// `ftol` is accepted for interface compatibility; the relative function change test is disabled.
pub fn test_convergence(
    x: &DVector<f64>,
    dx: &DVector<f64>,
    g: &DVector<f64>,
    f: &DVector<f64>,
    xtol: f64,
    gtol: f64,
    _ftol: f64,
) -> Option<ConvergenceInfo> {
    if test_small_step(dx, x, xtol) {
        info!("converged: step below xtol = {:e}", xtol);
        return Some(ConvergenceInfo::SmallStep);
    }

    let gnorm = scaled_infnorm(x, g);
    let fnorm = f.norm();
    let phi = 0.5 * fnorm * fnorm;
    let threshold = gtol * phi.max(1.0);
    debug!("gradient test: gnorm = {:e}, threshold = {:e}", gnorm, threshold);
    if gnorm <= threshold {
        info!("converged: scaled gradient {:e} <= {:e}", gnorm, threshold);
        return Some(ConvergenceInfo::SmallGradient);
    }
    None
}

fn test_small_step(dx: &DVector<f64>, x: &DVector<f64>, xtol: f64) -> bool {
    x.iter()
        .zip(dx.iter())
        .all(|(xi, dxi)| dxi.abs() < xtol * (xi.abs() + xtol))
}

/// max_i |g_i| max(|x_i|, 1)
fn scaled_infnorm(x: &DVector<f64>, g: &DVector<f64>) -> f64 {
    x.iter()
        .zip(g.iter())
        .map(|(xi, gi)| (gi * xi.abs().max(1.0)).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_small_step() {
        let x = dvector![1.0, 100.0];
        let dx = dvector![1e-9, 1e-7];
        let g = dvector![1.0, 1.0];
        let f = dvector![10.0];
        assert_eq!(
            test_convergence(&x, &dx, &g, &f, 1e-8, 1e-8, 0.0),
            Some(ConvergenceInfo::SmallStep)
        );
        let dx = dvector![1e-9, 1e-5];
        assert_eq!(test_convergence(&x, &dx, &g, &f, 1e-8, 1e-8, 0.0), None);
    }

    #[test]
    fn test_small_gradient() {
        let x = dvector![2.0, 0.0];
        let dx = dvector![1.0, 1.0];
        // phi = 50, threshold = 5e-7; gnorm = max(2 * 2e-7, 1e-7)
        let g = dvector![2e-7, 1e-7];
        let f = dvector![10.0];
        assert_eq!(
            test_convergence(&x, &dx, &g, &f, 1e-8, 1e-8, 0.0),
            Some(ConvergenceInfo::SmallGradient)
        );
        assert_eq!(ConvergenceInfo::SmallGradient.to_string(), "small gradient");
    }

    #[test]
    fn test_zero_step_at_origin_is_small() {
        // bound is xtol^2 at x = 0
        let x = dvector![0.0];
        let dx = dvector![0.0];
        assert_eq!(
            test_convergence(&x, &dx, &dvector![1.0], &dvector![1.0], 1e-8, 1e-12, 0.0),
            Some(ConvergenceInfo::SmallStep)
        );
    }
}
