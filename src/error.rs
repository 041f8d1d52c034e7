//! Error type shared by the variational family, the gradient estimator and the
//! inference loop.

use std::fmt;

/// Crate-wide result alias.
pub type VIResult<T> = Result<T, VIError>;

#[derive(Debug, Clone, PartialEq)]
pub enum VIError {
    /// Malformed configuration or call argument. Never retried.
    InvalidArgument { reason: String },

    /// Two components disagree on the dimension `D`.
    DimensionMismatch { expected: usize, found: usize },

    /// Every sample in the batch produced a non-finite ELBO term.
    DegenerateGradient { excluded: usize },

    /// Parameters became non-finite after an optimizer step.
    NumericalDivergence { iteration: usize },

    /// Cooperative cancellation was honored between iterations.
    Cancelled,
}

impl VIError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        VIError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// `DimensionMismatch` is a specialized form of `InvalidArgument`.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            VIError::InvalidArgument { .. } | VIError::DimensionMismatch { .. }
        )
    }
}

impl fmt::Display for VIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VIError::InvalidArgument { reason } => write!(f, "invalid argument: {reason}"),
            VIError::DimensionMismatch { expected, found } => write!(
                f,
                "dimension mismatch: expected {expected}, found {found}"
            ),
            VIError::DegenerateGradient { excluded } => write!(
                f,
                "degenerate gradient: all {excluded} samples produced non-finite terms"
            ),
            VIError::NumericalDivergence { iteration } => write!(
                f,
                "numerical divergence: parameters became non-finite at iteration {iteration}"
            ),
            VIError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for VIError {}
