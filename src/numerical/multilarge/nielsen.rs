/*
Nielsen's control of the LM damping parameter
(H.B. Nielsen, "Damping parameter in Marquardt's method", IMM-REP-1999-05):
    mu0 = tau * max_i (J^T J)_ii / D_i^2,   nu0 = 2
    accept: mu := mu * max(1/3, 1 - (2 rho - 1)^3),   nu := 2
    reject: mu := mu * nu,   nu := 2 nu
*/
use log::debug;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone, PartialEq)]
pub struct NielsenDamping {
    pub mu: f64,
    pub nu: f64,
}

impl Default for NielsenDamping {
    fn default() -> Self {
        Self { mu: 0.0, nu: 2.0 }
    }
}

impl NielsenDamping {
    pub fn init(&mut self, tau: f64, jtj: &DMatrix<f64>, diag: &DVector<f64>) {
        let mut max_ratio: f64 = 0.0;
        for i in 0..diag.len() {
            let di = diag[i];
            max_ratio = max_ratio.max(jtj[(i, i)] / (di * di));
        }
        self.mu = tau * max_ratio;
        self.nu = 2.0;
        debug!("initial damping mu = {:e}", self.mu);
    }

    pub fn accept(&mut self, rho: f64) {
        let b = 2.0 * rho - 1.0;
        let factor = (1.0 - b * b * b).max(1.0 / 3.0);
        self.mu *= factor;
        self.nu = 2.0;
    }

    pub fn reject(&mut self) {
        self.mu *= self.nu;
        // nu doubles on every consecutive rejection; cap it well below overflow
        if self.nu < 0.5 * f64::MAX {
            self.nu *= 2.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_init_uses_scaled_diagonal() {
        let mut damping = NielsenDamping::default();
        damping.init(1e-3, &dmatrix![4.0, 0.0; 0.0, 18.0], &dvector![1.0, 3.0]);
        assert_relative_eq!(damping.mu, 4e-3);
        assert_eq!(damping.nu, 2.0);
    }

    #[test]
    fn test_accept_and_reject_sequence() {
        let mut damping = NielsenDamping { mu: 1.0, nu: 2.0 };
        damping.reject();
        damping.reject();
        assert_relative_eq!(damping.mu, 8.0);
        assert_eq!(damping.nu, 8.0);
        // rho = 1 gives the smallest factor 1/3
        damping.accept(1.0);
        assert_relative_eq!(damping.mu, 8.0 / 3.0);
        assert_eq!(damping.nu, 2.0);
        // rho = 0.5 leaves mu unchanged
        damping.accept(0.5);
        assert_relative_eq!(damping.mu, 8.0 / 3.0);
    }
}
