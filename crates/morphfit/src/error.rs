//! Error conditions reported by the fitting core.

use std::fmt;

use thiserror::Error;

/// The fitting step an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStep {
    /// Input validation before the first iteration.
    Setup,
    /// Camera pose estimation.
    Pose,
    /// Contour correspondence resolution.
    Contour,
    /// Shape coefficient solve.
    Shape,
    /// Expression coefficient solve.
    Expression,
}

impl fmt::Display for FitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FitStep::Setup => "setup",
            FitStep::Pose => "pose estimation",
            FitStep::Contour => "contour resolution",
            FitStep::Shape => "shape fitting",
            FitStep::Expression => "expression fitting",
        })
    }
}

/// Errors that abort a fit.
///
/// There is no partial result: when any step fails, the whole fit fails with the error of that
/// step.
#[derive(Debug, Error)]
pub enum FitError {
    /// Not enough non-degenerate correspondences to determine all unknowns of a step.
    #[error("{step}: need at least {required} non-degenerate correspondences, got {correspondences}")]
    InsufficientConstraints {
        step: FitStep,
        correspondences: usize,
        required: usize,
    },

    /// A (regularized) linear system could not be solved.
    #[error("{step}: linear system with {unknowns} unknowns is singular")]
    SingularSystem { step: FitStep, unknowns: usize },

    /// The landmark collection passed to the fit is empty.
    #[error("no landmarks given")]
    EmptyLandmarks,

    /// The same landmark name was given more than once.
    #[error("duplicate landmark '{0}'")]
    DuplicateLandmark(String),

    /// A contour definition refers to a landmark that is not part of the observations.
    #[error("contour landmark '{0}' is not among the observed landmarks")]
    UnknownContourLandmark(String),

    /// A blendshape deformation does not match the model's vertex count.
    #[error("blendshape '{name}' has {len} components, expected {expected}")]
    BlendshapeLength {
        name: String,
        len: usize,
        expected: usize,
    },

    /// Any other inconsistent input, described by the message.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl FitError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Returns the step this error originated from.
    ///
    /// Input validation errors are always attributed to [`FitStep::Setup`].
    pub fn step(&self) -> FitStep {
        match self {
            FitError::InsufficientConstraints { step, .. } | FitError::SingularSystem { step, .. } => {
                *step
            }
            _ => FitStep::Setup,
        }
    }

    /// Returns whether this error signals invalid input, as opposed to a numerical failure.
    pub fn is_invalid_input(&self) -> bool {
        !matches!(
            self,
            FitError::InsufficientConstraints { .. } | FitError::SingularSystem { .. }
        )
    }
}

pub type Result<T, E = FitError> = std::result::Result<T, E>;
