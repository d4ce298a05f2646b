use thiserror::Error;

/// Failures of the dense linear algebra behind the stochastic Newton proposal.
///
/// These are never regularised away inside the crate. Callers decide whether
/// to damp the Hessian and retry or to fall back to a fixed covariance.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericalError {
    #[error("matrix is not positive definite (pivot {pivot})")]
    NotPositiveDefinite { pivot: usize },
    #[error("dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("non-finite value encountered in {0}")]
    NonFinite(&'static str),
    #[error("invalid distribution parameter: {0}")]
    InvalidParameter(&'static str),
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum JumpError {
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0} must be configured before perturbing")]
    NotConfigured(&'static str),
    #[error("gradient was read after a mutation without being recomputed")]
    GradientStale,
    #[error(transparent)]
    Numerical(#[from] NumericalError),
    #[error("forward model returned unrecoverable error")]
    Forward(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, JumpError>;
