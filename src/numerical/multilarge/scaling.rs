//! diagonal scaling D of the parameter space, derived from diag(J^T J)
use crate::numerical::multilarge::parameters::ScaleKind;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

/// Scaling strategy. Implementors are stateless, the vector D lives in the driver.
pub trait ScalingPolicy {
    fn name(&self) -> &'static str;
    /// D from the first J^T J
    fn init(&self, jtj: &DMatrix<f64>, diag: &mut DVector<f64>);
    /// D after an accepted step
    fn update(&self, jtj: &DMatrix<f64>, diag: &mut DVector<f64>);
}

/// sqrt((J^T J)_ii), or 1 if the entry is not usable as a scale
fn column_norm(jtj: &DMatrix<f64>, i: usize) -> f64 {
    let d = jtj[(i, i)];
    if d > 0.0 && d.is_finite() {
        d.sqrt()
    } else {
        warn!("diag(J^T J)[{}] = {}, using unit scale", i, d);
        1.0
    }
}

/// D_i = sqrt((J^T J)_ii) on init, then never decreases
pub struct Levenberg;
/// D_i = sqrt((J^T J)_ii) recomputed each iteration
pub struct Marquardt;
/// D = 1
pub struct NoScaling;

impl ScalingPolicy for Levenberg {
    fn name(&self) -> &'static str {
        "levenberg"
    }

    fn init(&self, jtj: &DMatrix<f64>, diag: &mut DVector<f64>) {
        for i in 0..diag.len() {
            diag[i] = column_norm(jtj, i);
        }
        debug!("levenberg scaling D = {:?}", diag.as_slice());
    }

    fn update(&self, jtj: &DMatrix<f64>, diag: &mut DVector<f64>) {
        for i in 0..diag.len() {
            let d = jtj[(i, i)];
            if d > 0.0 && d.is_finite() {
                diag[i] = diag[i].max(d.sqrt());
            }
        }
    }
}

impl ScalingPolicy for Marquardt {
    fn name(&self) -> &'static str {
        "marquardt"
    }

    fn init(&self, jtj: &DMatrix<f64>, diag: &mut DVector<f64>) {
        self.update(jtj, diag);
        debug!("marquardt scaling D = {:?}", diag.as_slice());
    }

    fn update(&self, jtj: &DMatrix<f64>, diag: &mut DVector<f64>) {
        for i in 0..diag.len() {
            diag[i] = column_norm(jtj, i);
        }
    }
}

impl ScalingPolicy for NoScaling {
    fn name(&self) -> &'static str {
        "none"
    }

    fn init(&self, _jtj: &DMatrix<f64>, diag: &mut DVector<f64>) {
        diag.fill(1.0);
    }

    fn update(&self, _jtj: &DMatrix<f64>, _diag: &mut DVector<f64>) {}
}

impl ScaleKind {
    pub fn policy(&self) -> &'static dyn ScalingPolicy {
        match self {
            ScaleKind::Levenberg => &Levenberg,
            ScaleKind::Marquardt => &Marquardt,
            ScaleKind::NoScaling => &NoScaling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_levenberg_is_non_decreasing() {
        let policy = ScaleKind::Levenberg.policy();
        let mut diag = DVector::zeros(2);
        policy.init(&dmatrix![4.0, 1.0; 1.0, 9.0], &mut diag);
        assert_relative_eq!(diag, dvector![2.0, 3.0]);
        policy.update(&dmatrix![1.0, 0.0; 0.0, 16.0], &mut diag);
        assert_relative_eq!(diag, dvector![2.0, 4.0]);
    }

    #[test]
    fn test_marquardt_follows_jtj() {
        let policy = ScaleKind::Marquardt.policy();
        let mut diag = DVector::zeros(2);
        policy.init(&dmatrix![4.0, 0.0; 0.0, 9.0], &mut diag);
        policy.update(&dmatrix![1.0, 0.0; 0.0, 16.0], &mut diag);
        assert_relative_eq!(diag, dvector![1.0, 4.0]);
    }

    #[test]
    fn test_degenerate_column_gets_unit_scale() {
        let mut diag = DVector::zeros(2);
        ScaleKind::Levenberg
            .policy()
            .init(&dmatrix![0.0, 0.0; 0.0, 25.0], &mut diag);
        assert_relative_eq!(diag, dvector![1.0, 5.0]);
    }

    #[test]
    fn test_no_scaling() {
        let policy = ScaleKind::NoScaling.policy();
        let mut diag = DVector::zeros(3);
        policy.init(&DMatrix::identity(3, 3).scale(7.0), &mut diag);
        assert_relative_eq!(diag, DVector::from_element(3, 1.0));
        assert_eq!(policy.name(), ScaleKind::NoScaling.to_string());
    }
}
