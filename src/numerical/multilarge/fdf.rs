//! user callbacks and the adapter that evaluates them with the sqrt(W) data weights applied.
//!
//! The Jacobian is requested from the user in blocks of rows. Each block is weighted, folded into
//! J^T u (or J u) and into J^T J, and then discarded, so for `block_rows < n` the dense n x p
//! Jacobian never exists in memory.
use crate::numerical::multilarge::error::{MultilargeError, Result};
use crate::numerical::multilarge::parameters::{FdType, MultilargeParameters};
use log::debug;
use nalgebra::{DMatrix, DMatrixViewMut, DVector};

/// f(x) -> f, unweighted
pub type ResidualFn =
    Box<dyn FnMut(&DVector<f64>, &mut DVector<f64>) -> std::result::Result<(), String>>;
/// rows `row0 .. row0 + block.nrows()` of the unweighted Jacobian at x
pub type JacobianRowsFn =
    Box<dyn FnMut(&DVector<f64>, usize, DMatrixViewMut<'_, f64>) -> std::result::Result<(), String>>;
/// second directional derivative D^2 f(x)[v, v], unweighted
pub type FvvFn = Box<
    dyn FnMut(&DVector<f64>, &DVector<f64>, &mut DVector<f64>) -> std::result::Result<(), String>,
>;

/// which product with the Jacobian a pass computes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianOp {
    /// v = J u, u has length p, v has length n
    NoTrans,
    /// v = J^T u, u has length n, v has length p
    Trans,
}

/// Definition of the least squares problem: residual function plus optional analytic derivatives.
/// Without `df` the Jacobian is approximated by finite differences, without `fvv` the second
/// directional derivative is approximated by finite differences as well.
pub struct MultilargeFdf {
    /// number of observations
    pub n: usize,
    /// number of parameters
    pub p: usize,
    f: ResidualFn,
    df: Option<JacobianRowsFn>,
    fvv: Option<FvvFn>,
    /// number of residual evaluations, finite difference ones included
    pub nevalf: usize,
    /// number of Jacobian passes
    pub nevaldf: usize,
    /// number of second directional derivative evaluations
    pub nevalfvv: usize,
}

impl MultilargeFdf {
    pub fn new<F>(n: usize, p: usize, f: F) -> Self
    where
        F: FnMut(&DVector<f64>, &mut DVector<f64>) -> std::result::Result<(), String> + 'static,
    {
        Self {
            n,
            p,
            f: Box::new(f),
            df: None,
            fvv: None,
            nevalf: 0,
            nevaldf: 0,
            nevalfvv: 0,
        }
    }

    pub fn with_jacobian<J>(mut self, df: J) -> Self
    where
        J: FnMut(&DVector<f64>, usize, DMatrixViewMut<'_, f64>) -> std::result::Result<(), String>
            + 'static,
    {
        self.df = Some(Box::new(df));
        self
    }

    pub fn with_fvv<V>(mut self, fvv: V) -> Self
    where
        V: FnMut(&DVector<f64>, &DVector<f64>, &mut DVector<f64>) -> std::result::Result<(), String>
            + 'static,
    {
        self.fvv = Some(Box::new(fvv));
        self
    }

    pub fn has_jacobian(&self) -> bool {
        self.df.is_some()
    }

    pub fn has_fvv(&self) -> bool {
        self.fvv.is_some()
    }

    pub fn reset_counters(&mut self) {
        self.nevalf = 0;
        self.nevaldf = 0;
        self.nevalfvv = 0;
    }
}

/// scratch buffers of the adapter, allocated once together with the solver
#[derive(Debug, Clone)]
pub struct FdfWorkspace {
    /// weighted Jacobian rows of the current block
    block: DMatrix<f64>,
    /// perturbed residuals, length n
    fwork: DVector<f64>,
    fwork2: DVector<f64>,
    /// perturbed parameters, length p
    xwork: DVector<f64>,
}

impl FdfWorkspace {
    pub fn new(n: usize, p: usize, block_rows: usize) -> Result<Self> {
        let rows = if block_rows == 0 { n } else { block_rows.min(n) };
        rows.checked_mul(p).ok_or_else(|| {
            MultilargeError::NoMemory(format!("Jacobian block of {} x {} elements", rows, p))
        })?;
        Ok(Self {
            block: DMatrix::zeros(rows, p),
            fwork: DVector::zeros(n),
            fwork2: DVector::zeros(n),
            xwork: DVector::zeros(p),
        })
    }

    pub fn block_rows(&self) -> usize {
        self.block.nrows()
    }
}

fn call_f(
    f: &mut ResidualFn,
    nevalf: &mut usize,
    x: &DVector<f64>,
    swts: Option<&DVector<f64>>,
    out: &mut DVector<f64>,
) -> Result<()> {
    f(x, out).map_err(MultilargeError::UserCallback)?;
    *nevalf += 1;
    if let Some(i) = out.iter().position(|v| !v.is_finite()) {
        return Err(MultilargeError::BadFunc(format!(
            "residual component {} is {}",
            i, out[i]
        )));
    }
    if let Some(w) = swts {
        out.component_mul_assign(w);
    }
    Ok(())
}

/// f = sqrt(W) f(x)
pub fn eval_f(
    fdf: &mut MultilargeFdf,
    x: &DVector<f64>,
    swts: Option<&DVector<f64>>,
    f: &mut DVector<f64>,
) -> Result<()> {
    call_f(&mut fdf.f, &mut fdf.nevalf, x, swts, f)
}

/// Finite difference step for parameter j
fn fd_step(h_df: f64, xj: f64) -> f64 {
    let h = h_df * xj.abs();
    if h == 0.0 { h_df } else { h }
}

/// Fills `ws.block[0..len]` with the weighted Jacobian rows `row0..row0+len`.
fn fill_block(
    x: &DVector<f64>,
    f: &DVector<f64>,
    swts: Option<&DVector<f64>>,
    params: &MultilargeParameters,
    fdf: &mut MultilargeFdf,
    ws: &mut FdfWorkspace,
    row0: usize,
    len: usize,
) -> Result<()> {
    let p = fdf.p;
    if let Some(df) = fdf.df.as_mut() {
        let mut blk = ws.block.rows_mut(0, len);
        blk.fill(0.0);
        df(x, row0, blk).map_err(MultilargeError::UserCallback)?;
        if let Some(w) = swts {
            for i in 0..len {
                let wi = w[row0 + i];
                ws.block.row_mut(i).scale_mut(wi);
            }
        }
        return Ok(());
    }

    // finite differences of the weighted residual, so the weights are already in place
    ws.xwork.copy_from(x);
    for j in 0..p {
        let xj = x[j];
        let h = fd_step(params.h_df, xj);
        match params.fdtype {
            FdType::Forward => {
                ws.xwork[j] = xj + h;
                call_f(&mut fdf.f, &mut fdf.nevalf, &ws.xwork, swts, &mut ws.fwork)?;
                for i in 0..len {
                    ws.block[(i, j)] = (ws.fwork[row0 + i] - f[row0 + i]) / h;
                }
            }
            FdType::Centered => {
                ws.xwork[j] = xj + 0.5 * h;
                call_f(&mut fdf.f, &mut fdf.nevalf, &ws.xwork, swts, &mut ws.fwork)?;
                ws.xwork[j] = xj - 0.5 * h;
                call_f(&mut fdf.f, &mut fdf.nevalf, &ws.xwork, swts, &mut ws.fwork2)?;
                for i in 0..len {
                    ws.block[(i, j)] = (ws.fwork[row0 + i] - ws.fwork2[row0 + i]) / h;
                }
            }
        }
        ws.xwork[j] = xj;
    }
    Ok(())
}

/// One pass over the weighted Jacobian J_w = sqrt(W) J at x.
///
/// `op = Trans`: v = J_w^T u; `op = NoTrans`: v = J_w u.
/// If `jtj` is given it receives J_w^T J_w. `f` must hold sqrt(W) f(x); it is only read by
/// the finite difference approximation.
pub fn eval_df(
    op: JacobianOp,
    x: &DVector<f64>,
    f: &DVector<f64>,
    u: &DVector<f64>,
    swts: Option<&DVector<f64>>,
    params: &MultilargeParameters,
    fdf: &mut MultilargeFdf,
    ws: &mut FdfWorkspace,
    v: &mut DVector<f64>,
    mut jtj: Option<&mut DMatrix<f64>>,
) -> Result<()> {
    let (n, p) = (fdf.n, fdf.p);
    let (ulen, vlen) = match op {
        JacobianOp::Trans => (n, p),
        JacobianOp::NoTrans => (p, n),
    };
    if u.len() != ulen || v.len() != vlen || x.len() != p || f.len() != n {
        return Err(MultilargeError::Domain(format!(
            "Jacobian pass {:?}: |u| = {}, |v| = {}, expected {} and {}",
            op,
            u.len(),
            v.len(),
            ulen,
            vlen
        )));
    }

    if let Some(m) = jtj.as_deref_mut() {
        m.fill(0.0);
    }
    if op == JacobianOp::Trans {
        v.fill(0.0);
    }

    let rows = ws.block_rows();
    let mut row0 = 0;
    while row0 < n {
        let len = rows.min(n - row0);
        fill_block(x, f, swts, params, fdf, ws, row0, len)?;
        let blk = ws.block.rows(0, len);
        match op {
            JacobianOp::Trans => v.gemv_tr(1.0, &blk, &u.rows(row0, len), 1.0),
            JacobianOp::NoTrans => v.rows_mut(row0, len).gemv(1.0, &blk, u, 0.0),
        }
        if let Some(m) = jtj.as_deref_mut() {
            m.gemm_tr(1.0, &blk, &blk, 1.0);
        }
        row0 += len;
    }
    fdf.nevaldf += 1;

    if v.iter().any(|vi| !vi.is_finite()) {
        return Err(MultilargeError::BadFunc(
            "Jacobian product is not finite".to_string(),
        ));
    }
    if let Some(m) = jtj.as_deref() {
        if m.iter().any(|mij| !mij.is_finite()) {
            return Err(MultilargeError::BadFunc("J^T J is not finite".to_string()));
        }
    }
    debug!("Jacobian pass {:?} over {} rows in blocks of {}", op, n, rows);
    Ok(())
}

/// fvv = sqrt(W) D^2 f(x)[v, v]; finite differences use
/// fvv ~ 2/h ( (f(x + h v) - f(x)) / h - J v )
pub fn eval_fvv(
    x: &DVector<f64>,
    v: &DVector<f64>,
    f: &DVector<f64>,
    swts: Option<&DVector<f64>>,
    params: &MultilargeParameters,
    fdf: &mut MultilargeFdf,
    ws: &mut FdfWorkspace,
    fvv: &mut DVector<f64>,
) -> Result<()> {
    if let Some(user_fvv) = fdf.fvv.as_mut() {
        user_fvv(x, v, fvv).map_err(MultilargeError::UserCallback)?;
        if let Some(w) = swts {
            fvv.component_mul_assign(w);
        }
    } else {
        let h = params.h_fvv;
        // fvv <- J v
        eval_df(JacobianOp::NoTrans, x, f, v, swts, params, fdf, ws, fvv, None)?;
        ws.xwork.copy_from(x);
        ws.xwork.axpy(h, v, 1.0);
        call_f(&mut fdf.f, &mut fdf.nevalf, &ws.xwork, swts, &mut ws.fwork)?;
        let c = 2.0 / h;
        for i in 0..fdf.n {
            fvv[i] = c * ((ws.fwork[i] - f[i]) / h - fvv[i]);
        }
    }
    fdf.nevalfvv += 1;
    if fvv.iter().any(|fi| !fi.is_finite()) {
        return Err(MultilargeError::BadFunc(
            "second directional derivative is not finite".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    /// f_i = y_i - a exp(b t_i), t = 0, 1, 2, 3
    fn exp_model() -> MultilargeFdf {
        let t = [0.0, 1.0, 2.0, 3.0];
        let y = [2.0, 3.1, 5.2, 8.4];
        MultilargeFdf::new(4, 2, move |x: &DVector<f64>, f: &mut DVector<f64>| {
            for i in 0..4 {
                f[i] = y[i] - x[0] * (x[1] * t[i]).exp();
            }
            Ok(())
        })
    }

    fn exp_jacobian(x: &DVector<f64>) -> DMatrix<f64> {
        let t = [0.0, 1.0, 2.0, 3.0];
        DMatrix::from_fn(4, 2, |i, j| {
            let e = (x[1] * t[i]).exp();
            if j == 0 { -e } else { -x[0] * t[i] * e }
        })
    }

    fn with_analytic(fdf: MultilargeFdf) -> MultilargeFdf {
        fdf.with_jacobian(|x: &DVector<f64>, row0: usize, mut block: DMatrixViewMut<f64>| {
            let t = [0.0, 1.0, 2.0, 3.0];
            for i in 0..block.nrows() {
                let ti = t[row0 + i];
                let e = (x[1] * ti).exp();
                block[(i, 0)] = -e;
                block[(i, 1)] = -x[0] * ti * e;
            }
            Ok(())
        })
    }

    #[test]
    fn test_weights_applied_to_residual() {
        let mut fdf = exp_model();
        let x = dvector![1.0, 0.5];
        let swts = dvector![1.0, 2.0, 3.0, 0.5];
        let mut f = DVector::zeros(4);
        let mut fw = DVector::zeros(4);
        eval_f(&mut fdf, &x, None, &mut f).unwrap();
        eval_f(&mut fdf, &x, Some(&swts), &mut fw).unwrap();
        assert_relative_eq!(fw, f.component_mul(&swts), epsilon = 1e-15);
        assert_eq!(fdf.nevalf, 2);
    }

    #[test]
    fn test_blocked_accumulation_matches_dense() {
        let x = dvector![1.0, 0.5];
        let swts = dvector![1.0, 2.0, 3.0, 0.5];
        let mut params = MultilargeParameters::default();
        params.block_rows = 3;
        let mut fdf = with_analytic(exp_model());
        let mut ws = FdfWorkspace::new(4, 2, params.block_rows).unwrap();
        assert_eq!(ws.block_rows(), 3);

        let mut f = DVector::zeros(4);
        eval_f(&mut fdf, &x, Some(&swts), &mut f).unwrap();
        let mut g = DVector::zeros(2);
        let mut jtj = DMatrix::zeros(2, 2);
        eval_df(
            JacobianOp::Trans,
            &x,
            &f,
            &f,
            Some(&swts),
            &params,
            &mut fdf,
            &mut ws,
            &mut g,
            Some(&mut jtj),
        )
        .unwrap();

        let jw = DMatrix::from_diagonal(&swts) * exp_jacobian(&x);
        assert_relative_eq!(jtj, jw.transpose() * &jw, epsilon = 1e-12);
        assert_relative_eq!(g, jw.transpose() * &f, epsilon = 1e-12);

        let u = dvector![0.3, -1.0];
        let mut ju = DVector::zeros(4);
        eval_df(
            JacobianOp::NoTrans,
            &x,
            &f,
            &u,
            Some(&swts),
            &params,
            &mut fdf,
            &mut ws,
            &mut ju,
            None,
        )
        .unwrap();
        assert_relative_eq!(ju, &jw * u, epsilon = 1e-12);
    }

    #[test]
    fn test_finite_differences_match_analytic() {
        let x = dvector![1.5, 0.3];
        let swts = dvector![2.0, 1.0, 1.0, 0.5];
        let jw = DMatrix::from_diagonal(&swts) * exp_jacobian(&x);
        let exact = jw.transpose() * &jw;
        for fdtype in [FdType::Forward, FdType::Centered] {
            let mut params = MultilargeParameters::default();
            params.fdtype = fdtype;
            let mut fdf = exp_model();
            let mut ws = FdfWorkspace::new(4, 2, 0).unwrap();
            let mut f = DVector::zeros(4);
            eval_f(&mut fdf, &x, Some(&swts), &mut f).unwrap();
            let mut g = DVector::zeros(2);
            let mut jtj = DMatrix::zeros(2, 2);
            eval_df(
                JacobianOp::Trans,
                &x,
                &f,
                &f,
                Some(&swts),
                &params,
                &mut fdf,
                &mut ws,
                &mut g,
                Some(&mut jtj),
            )
            .unwrap();
            assert_relative_eq!(jtj, exact, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_finite_difference_cost_grows_with_blocks() {
        let x = dvector![1.5, 0.3];
        let params = MultilargeParameters::default();
        let mut f = DVector::zeros(4);
        let mut g = DVector::zeros(2);
        for (block_rows, expected) in [(0, 2), (2, 4), (1, 8)] {
            let mut fdf = exp_model();
            let mut ws = FdfWorkspace::new(4, 2, block_rows).unwrap();
            eval_f(&mut fdf, &x, None, &mut f).unwrap();
            fdf.reset_counters();
            eval_df(
                JacobianOp::Trans,
                &x,
                &f,
                &f,
                None,
                &params,
                &mut fdf,
                &mut ws,
                &mut g,
                None,
            )
            .unwrap();
            assert_eq!(fdf.nevalf, expected, "block_rows = {}", block_rows);
            assert_eq!(fdf.nevaldf, 1);
        }
    }

    #[test]
    fn test_fvv_finite_difference() {
        // f = [x0^2 + x1^2, x0 x1], D^2 f [v, v] = [2 v0^2 + 2 v1^2, 2 v0 v1]
        let mut fdf = MultilargeFdf::new(2, 2, |x: &DVector<f64>, f: &mut DVector<f64>| {
            f[0] = x[0] * x[0] + x[1] * x[1];
            f[1] = x[0] * x[1];
            Ok(())
        })
        .with_jacobian(|x: &DVector<f64>, row0: usize, mut block: DMatrixViewMut<f64>| {
            let full = dmatrix![2.0 * x[0], 2.0 * x[1]; x[1], x[0]];
            for i in 0..block.nrows() {
                block.set_row(i, &full.row(row0 + i));
            }
            Ok(())
        });
        let params = MultilargeParameters::default();
        let mut ws = FdfWorkspace::new(2, 2, 0).unwrap();
        let x = dvector![1.0, 2.0];
        let v = dvector![0.5, -1.0];
        let mut f = DVector::zeros(2);
        eval_f(&mut fdf, &x, None, &mut f).unwrap();
        let mut fvv = DVector::zeros(2);
        eval_fvv(&x, &v, &f, None, &params, &mut fdf, &mut ws, &mut fvv).unwrap();
        // quadratic model: the difference formula is exact up to rounding
        assert_relative_eq!(fvv, dvector![2.5, -1.0], epsilon = 1e-10);
        assert_eq!(fdf.nevalfvv, 1);
    }

    #[test]
    fn test_user_error_is_verbatim_and_nan_is_badfunc() {
        let mut failing = MultilargeFdf::new(1, 1, |_x: &DVector<f64>, _f: &mut DVector<f64>| {
            Err("sensor offline".to_string())
        });
        let mut f = DVector::zeros(1);
        let err = eval_f(&mut failing, &dvector![0.0], None, &mut f).unwrap_err();
        assert_eq!(err, MultilargeError::UserCallback("sensor offline".to_string()));

        let mut nan = MultilargeFdf::new(1, 1, |x: &DVector<f64>, f: &mut DVector<f64>| {
            f[0] = x[0].ln();
            Ok(())
        });
        let err = eval_f(&mut nan, &dvector![-1.0], None, &mut f).unwrap_err();
        assert!(matches!(err, MultilargeError::BadFunc(_)));
    }

    #[test]
    fn test_bad_lengths_are_domain_errors() {
        let mut fdf = with_analytic(exp_model());
        let params = MultilargeParameters::default();
        let mut ws = FdfWorkspace::new(4, 2, 0).unwrap();
        let x = dvector![1.0, 0.5];
        let f = DVector::zeros(4);
        let mut v = DVector::zeros(3);
        let err = eval_df(
            JacobianOp::Trans,
            &x,
            &f,
            &f,
            None,
            &params,
            &mut fdf,
            &mut ws,
            &mut v,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MultilargeError::Domain(_)));
    }
}
