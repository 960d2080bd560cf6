/// trust region nonlinear least squares for problems with many residuals
pub mod multilarge;
