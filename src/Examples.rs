//! examples of usage of RustedMultilarge
/// nonlinear least squares examples
pub mod multilarge_examples;
