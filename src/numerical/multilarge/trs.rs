//! Trust region subproblem interface.
//!
//! A subproblem produces a step dx with ||D dx|| <= delta (the LM variants ignore delta and let
//! the driver enforce the region through the acceptance ratio) and the reduction the quadratic
//! model predicts for it. The driver hands every call a [`TrustView`] of its current state.
use crate::numerical::multilarge::error::Result;
use crate::numerical::multilarge::fdf::{FdfWorkspace, MultilargeFdf};
use crate::numerical::multilarge::linear_solver::LinearSolver;
use crate::numerical::multilarge::parameters::{MultilargeParameters, TrsKind};
use crate::numerical::multilarge::trs_cgst::CgstSubproblem;
use crate::numerical::multilarge::trs_dogleg::DoglegSubproblem;
use crate::numerical::multilarge::trs_lm::LmSubproblem;
use crate::numerical::multilarge::trs_subspace2d::Subspace2dSubproblem;
use nalgebra::{DMatrix, DVector};

/// Borrowed view of the driver state passed to the subproblem.
pub struct TrustView<'a> {
    pub x: &'a DVector<f64>,
    /// weighted residual sqrt(W) f(x)
    pub f: &'a DVector<f64>,
    /// gradient J_w^T f
    pub g: &'a DVector<f64>,
    pub jtj: &'a DMatrix<f64>,
    pub diag: &'a DVector<f64>,
    pub sqrt_wts: Option<&'a DVector<f64>>,
    pub mu: f64,
    pub params: &'a MultilargeParameters,
    pub solver: &'a mut dyn LinearSolver,
    pub fdf: &'a mut MultilargeFdf,
    pub fdf_ws: &'a mut FdfWorkspace,
    /// |a| / |v| of the last geodesic acceleration step
    pub avratio: &'a mut f64,
}

pub trait TrustRegionSubproblem {
    /// variant tag; the driver inspects it only for the geodesic acceleration test
    fn kind(&self) -> TrsKind;
    /// called once after the initial evaluation of f, g and J^T J
    fn init(&mut self, view: &mut TrustView) -> Result<()>;
    /// called at the start of every iteration, before any trial step
    fn preloop(&mut self, view: &mut TrustView) -> Result<()>;
    /// trial step for radius `delta`; an error means no step was found
    fn step(&mut self, view: &mut TrustView, delta: f64, dx: &mut DVector<f64>) -> Result<()>;
    /// predicted reduction of the model for the step returned by the last `step`
    fn preduction(&mut self, view: &TrustView, dx: &DVector<f64>) -> Result<f64>;
}

/// ||D a||
pub fn scaled_norm(diag: &DVector<f64>, a: &DVector<f64>) -> f64 {
    diag.iter()
        .zip(a.iter())
        .map(|(d, ai)| (d * ai) * (d * ai))
        .sum::<f64>()
        .sqrt()
}

/// Reduction predicted by the Gauss-Newton model m(dx) = 1/2 ||f + J dx||^2, relative to
/// 1/2 ||f||^2:
///     pred = -(2 g^T dx + dx^T J^T J dx) / ||f||^2
/// `work` is a length p scratch vector.
pub fn quadratic_preduction(
    f: &DVector<f64>,
    g: &DVector<f64>,
    jtj: &DMatrix<f64>,
    dx: &DVector<f64>,
    work: &mut DVector<f64>,
) -> f64 {
    let normf = f.norm();
    if normf == 0.0 {
        return 0.0;
    }
    work.gemv(1.0, jtj, dx, 0.0);
    let num = 2.0 * g.dot(dx) + dx.dot(work);
    -num / (normf * normf)
}

/// Position along the line x + tau p where ||x + tau p|| = delta, tau >= 0.
/// Returns None if p = 0.
pub fn boundary_tau(x: &DVector<f64>, p: &DVector<f64>, delta: f64) -> Option<f64> {
    let a = p.norm_squared();
    if a == 0.0 {
        return None;
    }
    let b = x.dot(p);
    let c = x.norm_squared() - delta * delta;
    let disc = (b * b - a * c).max(0.0);
    Some((-b + disc.sqrt()) / a)
}

impl TrsKind {
    pub fn alloc(
        &self,
        params: &MultilargeParameters,
        n: usize,
        p: usize,
    ) -> Box<dyn TrustRegionSubproblem> {
        match self {
            TrsKind::Lm => Box::new(LmSubproblem::new(false, n, p)),
            TrsKind::LmAccel => Box::new(LmSubproblem::new(true, n, p)),
            TrsKind::Dogleg => Box::new(DoglegSubproblem::new(false, n, p)),
            TrsKind::DDogleg => Box::new(DoglegSubproblem::new(true, n, p)),
            TrsKind::Subspace2D => Box::new(Subspace2dSubproblem::new(n, p)),
            TrsKind::Cgst => Box::new(CgstSubproblem::new(params, n, p)),
        }
    }
}
