//! error type shared by every layer of the trust region solver
use std::fmt;

/// Status codes of the trust region driver. `Ok(())` plays the role of SUCCESS.
#[derive(Debug, Clone, PartialEq)]
pub enum MultilargeError {
    /// more than `max_bad_steps` consecutive trial steps were rejected
    NoProgress,
    /// invalid problem shape, invalid parameters or non-finite initial evaluation
    Domain(String),
    /// requested workspace size cannot be represented
    NoMemory(String),
    /// user callback reported a failure; message is passed through untouched
    UserCallback(String),
    /// residual, gradient or J^T J contains NaN or infinity
    BadFunc(String),
    /// outer driver ran out of iterations
    MaxIter,
    /// linear solver could not factorize or solve
    SolverFailed(String),
    /// trust region subproblem could not produce a step
    StepFailed(String),
}

impl fmt::Display for MultilargeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MultilargeError::NoProgress => {
                write!(f, "no progress: too many consecutive rejected steps")
            }
            MultilargeError::Domain(msg) => write!(f, "domain error: {}", msg),
            MultilargeError::NoMemory(msg) => write!(f, "failed to allocate memory: {}", msg),
            MultilargeError::UserCallback(msg) => write!(f, "{}", msg),
            MultilargeError::BadFunc(msg) => write!(f, "non-finite function value: {}", msg),
            MultilargeError::MaxIter => write!(f, "maximum number of iterations reached"),
            MultilargeError::SolverFailed(msg) => write!(f, "linear solver failed: {}", msg),
            MultilargeError::StepFailed(msg) => write!(f, "trust region step failed: {}", msg),
        }
    }
}

impl std::error::Error for MultilargeError {}

pub type Result<T> = std::result::Result<T, MultilargeError>;
