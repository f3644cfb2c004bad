use cb_core::{DType, ValueError};

/// Errors surfaced by the foreign provider boundary. Every variant
/// propagates to the host caller unmodified; there is no recovery here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForeignError {
    /// Argument count does not match the program's fixed arity.
    ArityMismatch { expected: usize, actual: usize },
    /// An argument's dtype violates its declared constraint.
    TypeMismatch {
        index: usize,
        expected: DType,
        actual: DType,
    },
    /// A shape disagreement: either an argument violating its declared
    /// constraint, or the concrete output contradicting abstract evaluation.
    ShapeMismatch {
        at: String,
        expected: String,
        actual: String,
    },
    /// The provider declares no tangent rule at this point.
    DifferentiationUnsupported { program: String, detail: String },
    /// A compiled artifact was invoked with arguments whose signature does
    /// not match the one it was specialized for.
    SignatureMismatch { expected: String, actual: String },
    /// A declared batch axis does not exist on the value it refers to.
    BatchRankMismatch { axis: usize, rank: usize },
    /// Batched arguments disagree on the batch-axis size.
    BatchSizeMismatch {
        index: usize,
        expected: u32,
        actual: u32,
    },
    /// Provider-internal evaluation failure.
    EvalFailed { program: String, detail: String },
    /// Value construction failed while marshalling results.
    Value(ValueError),
}

impl std::fmt::Display for ForeignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch { expected, actual } => {
                write!(f, "arity mismatch: expected {}, got {}", expected, actual)
            }
            Self::TypeMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "dtype mismatch at argument {}: expected {}, got {}",
                index,
                expected.as_str(),
                actual.as_str()
            ),
            Self::ShapeMismatch {
                at,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch at {}: expected {}, got {}",
                at, expected, actual
            ),
            Self::DifferentiationUnsupported { program, detail } => {
                write!(f, "program {} is not differentiable: {}", program, detail)
            }
            Self::SignatureMismatch { expected, actual } => write!(
                f,
                "call signature mismatch: artifact compiled for [{}], called with [{}]",
                expected, actual
            ),
            Self::BatchRankMismatch { axis, rank } => write!(
                f,
                "batch axis {} out of bounds for rank {}",
                axis, rank
            ),
            Self::BatchSizeMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "batch size mismatch at argument {}: expected {}, got {}",
                index, expected, actual
            ),
            Self::EvalFailed { program, detail } => {
                write!(f, "program {} evaluation failed: {}", program, detail)
            }
            Self::Value(err) => write!(f, "value error: {err}"),
        }
    }
}

impl std::error::Error for ForeignError {}

impl From<ValueError> for ForeignError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}
