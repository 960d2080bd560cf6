//! tunable parameters of the trust region solver and their text representation
use crate::Utils::task_parser::{Value, parse_document_as};
use crate::numerical::multilarge::error::{MultilargeError, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString};

/// trust region subproblem method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum TrsKind {
    /// Levenberg-Marquardt
    Lm,
    /// Levenberg-Marquardt with geodesic acceleration
    LmAccel,
    Dogleg,
    /// double dogleg (Dennis and Mei)
    DDogleg,
    /// 2D subspace spanned by the Gauss-Newton and steepest descent directions
    Subspace2D,
    /// Steihaug-Toint truncated conjugate gradient
    Cgst,
}

impl TrsKind {
    /// methods that factorize J^T J + mu D^2 and need a linear solver
    pub fn needs_solver(&self) -> bool {
        !matches!(self, TrsKind::Cgst)
    }
}

/// diagonal scaling policy for D
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ScaleKind {
    /// D_i = max(D_i, sqrt(J^T J)_ii), never decreases
    Levenberg,
    /// D_i = sqrt(J^T J)_ii recomputed every iteration
    Marquardt,
    /// D = I
    #[strum(serialize = "none")]
    NoScaling,
}

/// linear solver for the damped normal equations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum SolverKind {
    Cholesky,
    Qr,
    Svd,
    #[strum(serialize = "none")]
    NoSolver,
}

/// finite difference scheme used when no analytic Jacobian is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum FdType {
    Forward,
    Centered,
}

#[derive(Debug, Clone)]
pub struct MultilargeParameters {
    pub trs: TrsKind,
    pub scale: ScaleKind,
    pub solver: SolverKind,
    pub fdtype: FdType,
    /// trust radius is multiplied by this after a very good step
    pub factor_up: f64,
    /// trust radius is divided by this after a poor step
    pub factor_down: f64,
    /// largest |a|/|v| admitted by the geodesic acceleration method
    pub avmax: f64,
    /// finite difference step for the Jacobian
    pub h_df: f64,
    /// finite difference step for the second directional derivative
    pub h_fvv: f64,
    /// initial damping mu_0 = tau * max_i (J^T J)_ii / D_i^2
    pub tau: f64,
    /// consecutive rejected steps tolerated before NoProgress
    pub max_bad_steps: usize,
    /// relative residual tolerance of the Steihaug CG iteration
    pub cgst_tol: f64,
    /// iteration cap of the Steihaug CG iteration, 0 means p
    pub cgst_max_iter: usize,
    /// rows of J handled per accumulation block, 0 means all n rows at once.
    /// Without an analytic Jacobian every block repeats the p (centered: 2p) residual
    /// evaluations of the finite difference pass, so a pass costs ceil(n / block_rows) times more.
    pub block_rows: usize,
}

impl Default for MultilargeParameters {
    fn default() -> Self {
        Self {
            trs: TrsKind::Lm,
            scale: ScaleKind::Levenberg,
            solver: SolverKind::Cholesky,
            fdtype: FdType::Forward,
            factor_up: 2.0,
            factor_down: 3.0,
            avmax: 0.75,
            h_df: f64::EPSILON.sqrt(),
            h_fvv: 0.02,
            tau: 1e-3,
            max_bad_steps: 15,
            cgst_tol: 1e-6,
            cgst_max_iter: 0,
            block_rows: 0,
        }
    }
}

impl MultilargeParameters {
    pub fn with_trs(mut self, trs: TrsKind) -> Self {
        self.trs = trs;
        self
    }

    pub fn with_scale(mut self, scale: ScaleKind) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    /// Checks the numeric tunables and the trs/solver combination.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("factor_up", self.factor_up),
            ("factor_down", self.factor_down),
            ("avmax", self.avmax),
            ("h_df", self.h_df),
            ("h_fvv", self.h_fvv),
            ("tau", self.tau),
            ("cgst_tol", self.cgst_tol),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(MultilargeError::Domain(format!(
                    "parameter {} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        if self.factor_up <= 1.0 || self.factor_down <= 1.0 {
            return Err(MultilargeError::Domain(
                "factor_up and factor_down must exceed 1".to_string(),
            ));
        }
        if self.trs.needs_solver() && self.solver == SolverKind::NoSolver {
            return Err(MultilargeError::Domain(format!(
                "trust region method {} requires a linear solver",
                self.trs
            )));
        }
        Ok(())
    }

    /// Reads parameters from a document of the form
    /// ```text
    /// trust_region
    ///   trs: dogleg
    ///   scale: marquardt
    ///   factor_up: 2.0
    /// driver
    ///   maxiter: 100
    ///   xtol: 1e-10
    /// ```
    /// Missing keys keep their defaults.
    pub fn from_document(
        document: &str,
    ) -> std::result::Result<(Self, DriverSettings), ParameterError> {
        let parsed = parse_document_as(document, None).map_err(ParameterError::Syntax)?;
        let mut params = Self::default();
        let mut settings = DriverSettings::default();
        for (title, section) in parsed.iter() {
            match title.as_str() {
                "trust_region" => {
                    for (key, values) in section {
                        params.set_key(key, single_value(key, values)?)?;
                    }
                }
                "driver" => {
                    for (key, values) in section {
                        settings.set_key(key, single_value(key, values)?)?;
                    }
                }
                other => return Err(ParameterError::UnknownSection(other.to_string())),
            }
        }
        Ok((params, settings))
    }

    fn set_key(&mut self, key: &str, value: &Value) -> std::result::Result<(), ParameterError> {
        match key {
            "trs" => self.trs = parse_selector(key, value)?,
            "scale" => self.scale = parse_selector(key, value)?,
            "solver" => self.solver = parse_selector(key, value)?,
            "fdtype" => self.fdtype = parse_selector(key, value)?,
            "factor_up" => self.factor_up = as_f64(key, value)?,
            "factor_down" => self.factor_down = as_f64(key, value)?,
            "avmax" => self.avmax = as_f64(key, value)?,
            "h_df" => self.h_df = as_f64(key, value)?,
            "h_fvv" => self.h_fvv = as_f64(key, value)?,
            "tau" => self.tau = as_f64(key, value)?,
            "cgst_tol" => self.cgst_tol = as_f64(key, value)?,
            "max_bad_steps" => self.max_bad_steps = as_usize(key, value)?,
            "cgst_max_iter" => self.cgst_max_iter = as_usize(key, value)?,
            "block_rows" => self.block_rows = as_usize(key, value)?,
            _ => return Err(ParameterError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

/// stopping rules of the outer driver loop
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub maxiter: usize,
    pub xtol: f64,
    pub gtol: f64,
    pub ftol: f64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            maxiter: 200,
            xtol: 1e-8,
            gtol: 1e-8,
            ftol: 1e-8,
        }
    }
}

impl DriverSettings {
    fn set_key(&mut self, key: &str, value: &Value) -> std::result::Result<(), ParameterError> {
        match key {
            "maxiter" => self.maxiter = as_usize(key, value)?,
            "xtol" => self.xtol = as_f64(key, value)?,
            "gtol" => self.gtol = as_f64(key, value)?,
            "ftol" => self.ftol = as_f64(key, value)?,
            _ => return Err(ParameterError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

/// problems found while reading a parameter document
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterError {
    Syntax(String),
    UnknownSection(String),
    UnknownKey(String),
    InvalidValue { key: String, value: String },
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParameterError::Syntax(msg) => write!(f, "cannot parse parameters: {}", msg),
            ParameterError::UnknownSection(s) => write!(f, "unknown section '{}'", s),
            ParameterError::UnknownKey(k) => write!(f, "unknown parameter '{}'", k),
            ParameterError::InvalidValue { key, value } => {
                write!(f, "invalid value '{}' for parameter '{}'", value, key)
            }
        }
    }
}

impl std::error::Error for ParameterError {}

fn single_value<'a>(
    key: &str,
    values: &'a Option<Vec<Value>>,
) -> std::result::Result<&'a Value, ParameterError> {
    match values.as_deref() {
        Some([value]) => Ok(value),
        other => Err(ParameterError::InvalidValue {
            key: key.to_string(),
            value: format!("{:?}", other),
        }),
    }
}

fn invalid(key: &str, value: &Value) -> ParameterError {
    ParameterError::InvalidValue {
        key: key.to_string(),
        value: value.to_string_value(),
    }
}

fn parse_selector<T: FromStr>(key: &str, value: &Value) -> std::result::Result<T, ParameterError> {
    T::from_str(&value.to_string_value().to_lowercase()).map_err(|_| invalid(key, value))
}

fn as_f64(key: &str, value: &Value) -> std::result::Result<f64, ParameterError> {
    match value {
        Value::Float(v) => Ok(*v),
        Value::Integer(v) => Ok(*v as f64),
        _ => Err(invalid(key, value)),
    }
}

fn as_usize(key: &str, value: &Value) -> std::result::Result<usize, ParameterError> {
    match value {
        Value::Integer(v) if *v >= 0 => Ok(*v as usize),
        _ => Err(invalid(key, value)),
    }
}

/// Collects the selectors of a parameter set, handy for log headers.
pub fn describe(params: &MultilargeParameters) -> HashMap<&'static str, String> {
    HashMap::from([
        ("trs", params.trs.to_string()),
        ("scale", params.scale.to_string()),
        ("solver", params.solver.to_string()),
        ("fdtype", params.fdtype.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn selector_names_round_trip() {
        for kind in TrsKind::iter() {
            assert_eq!(TrsKind::from_str(&kind.to_string()).unwrap(), kind);
        }
        assert_eq!(TrsKind::LmAccel.to_string(), "lmaccel");
        assert_eq!(TrsKind::Subspace2D.to_string(), "subspace2d");
        assert_eq!(ScaleKind::from_str("none").unwrap(), ScaleKind::NoScaling);
        assert_eq!(SolverKind::from_str("none").unwrap(), SolverKind::NoSolver);
        assert_eq!(FdType::Centered.to_string(), "centered");
    }

    #[test]
    fn defaults_are_valid() {
        let params = MultilargeParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.factor_up, 2.0);
        assert_eq!(params.factor_down, 3.0);
        assert_eq!(params.avmax, 0.75);
        assert_eq!(params.max_bad_steps, 15);
    }

    #[test]
    fn cgst_runs_without_solver_but_lm_does_not() {
        let cg = MultilargeParameters::default()
            .with_trs(TrsKind::Cgst)
            .with_solver(SolverKind::NoSolver);
        assert!(cg.validate().is_ok());
        let lm = MultilargeParameters::default().with_solver(SolverKind::NoSolver);
        assert!(matches!(lm.validate(), Err(MultilargeError::Domain(_))));
    }

    #[test]
    fn shrink_factor_must_exceed_one() {
        let mut params = MultilargeParameters::default();
        params.factor_down = 0.5;
        assert!(params.validate().is_err());
    }

    #[test]
    fn document_is_read_into_parameters() {
        let document = "trust_region\n trs: dogleg\n scale: marquardt\n factor_up: 4\n avmax: 0.5\n max_bad_steps: 20\ndriver\n maxiter: 50\n xtol: 1e-10\n";
        let (params, settings) = MultilargeParameters::from_document(document).unwrap();
        assert_eq!(params.trs, TrsKind::Dogleg);
        assert_eq!(params.scale, ScaleKind::Marquardt);
        assert_eq!(params.factor_up, 4.0);
        assert_eq!(params.avmax, 0.5);
        assert_eq!(params.max_bad_steps, 20);
        assert_eq!(params.solver, SolverKind::Cholesky);
        assert_eq!(settings.maxiter, 50);
        assert_eq!(settings.xtol, 1e-10);
        assert_eq!(settings.gtol, 1e-8);
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let document = "trust_region\n trs: newton\n";
        let err = MultilargeParameters::from_document(document).unwrap_err();
        assert!(matches!(err, ParameterError::InvalidValue { .. }));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let document = "trust_region\n radius: 3.0\n";
        let err = MultilargeParameters::from_document(document).unwrap_err();
        assert_eq!(err, ParameterError::UnknownKey("radius".to_string()));
    }

    #[test]
    fn describe_lists_selectors() {
        let map = describe(&MultilargeParameters::default());
        assert_eq!(map["trs"], "lm");
        assert_eq!(map["scale"], "levenberg");
    }
}
