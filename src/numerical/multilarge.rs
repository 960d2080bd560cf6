//! Trust region solver for large nonlinear least squares problems,
//! min_x 1/2 ||f(x)||^2 with f: R^p -> R^n and n possibly much larger than p.
//!
//! The Jacobian is never stored: it is evaluated in row blocks that are folded into
//! J^T J (p x p) and J^T f. Each iteration solves a trust region subproblem on these
//! normal equations with one of six methods:
//!
//! * `lm`         Levenberg-Marquardt with Nielsen damping
//! * `lmaccel`    Levenberg-Marquardt with geodesic acceleration
//! * `dogleg`     Powell dogleg
//! * `ddogleg`    double dogleg
//! * `subspace2d` exact solution in the span of the Gauss-Newton and gradient directions
//! * `cgst`       Steihaug-Toint truncated conjugate gradient
//!
//! Example
//! ```ignore
//!    use nalgebra::{DVector, dvector};
//!    use RustedMultilarge::numerical::multilarge::fdf::MultilargeFdf;
//!    use RustedMultilarge::numerical::multilarge::parameters::{MultilargeParameters, TrsKind};
//!    use RustedMultilarge::numerical::multilarge::workspace::MultilargeWorkspace;
//!
//!    let fdf = MultilargeFdf::new(2, 2, |x: &DVector<f64>, f: &mut DVector<f64>| {
//!        f[0] = 10.0 * (x[1] - x[0] * x[0]);
//!        f[1] = 1.0 - x[0];
//!        Ok(())
//!    });
//!    let params = MultilargeParameters::default().with_trs(TrsKind::Dogleg);
//!    let mut w = MultilargeWorkspace::new(params, 2, 2)?;
//!    w.init(&dvector![-1.2, 1.0], fdf)?;
//!    let info = w.driver(200, 1e-10, 1e-10, 0.0, None)?;
//!    println!("{} after {} iterations: {}", info, w.niter(), w.position());
//! ```
pub mod convergence;
pub mod error;
pub mod fdf;
pub mod linear_solver;
pub mod nielsen;
pub mod parameters;
pub mod scaling;
pub mod trs;
pub mod trs_cgst;
pub mod trs_dogleg;
pub mod trs_lm;
pub mod trs_subspace2d;
pub mod trust;
pub mod workspace;
