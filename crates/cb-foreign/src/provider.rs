//! The foreign-provider contract: the narrow interface every externally
//! compiled function exposes to the host. The host never looks past it.

use cb_core::{AbstractValue, ArrayValue, DType, Shape};

use crate::error::ForeignError;

/// Declared shape constraint for one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeConstraint {
    /// Exactly this shape.
    Exact(Shape),
    /// Any shape of this rank.
    Rank(usize),
    /// Rank-polymorphic: any shape.
    AnyRank,
}

impl ShapeConstraint {
    #[must_use]
    pub fn admits(&self, shape: &Shape) -> bool {
        match self {
            Self::Exact(expected) => expected == shape,
            Self::Rank(rank) => shape.rank() == *rank,
            Self::AnyRank => true,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exact(shape) => format!("{:?}", shape.dims),
            Self::Rank(rank) => format!("rank {rank}"),
            Self::AnyRank => "any rank".to_owned(),
        }
    }
}

/// Declared dtype and shape constraint for one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub dtype: DType,
    pub constraint: ShapeConstraint,
}

impl ParamSpec {
    #[must_use]
    pub fn new(dtype: DType, constraint: ShapeConstraint) -> Self {
        Self { dtype, constraint }
    }

    #[must_use]
    pub fn exact(dtype: DType, dims: &[u32]) -> Self {
        Self {
            dtype,
            constraint: ShapeConstraint::Exact(Shape::of(dims)),
        }
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            constraint: ShapeConstraint::Exact(Shape::scalar()),
        }
    }

    #[must_use]
    pub fn any_rank(dtype: DType) -> Self {
        Self {
            dtype,
            constraint: ShapeConstraint::AnyRank,
        }
    }
}

/// An opaque, pure, array-valued foreign function.
///
/// Implementations must be deterministic and side-effect-free; the host
/// invokes them concurrently across independent call contexts. The mapped
/// forms carry a canonical leading batch axis on every argument flagged in
/// `mapped`; unflagged arguments are constant across the batch. The default
/// mapped implementations slice, apply, and stack — providers with a
/// natively vectorized form should override them.
pub trait ForeignFn: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> &[ParamSpec];

    fn evaluate(&self, args: &[ArrayValue]) -> Result<ArrayValue, ForeignError>;

    fn abstract_evaluate(&self, avals: &[AbstractValue]) -> Result<AbstractValue, ForeignError>;

    fn evaluate_with_tangent(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(ArrayValue, ArrayValue), ForeignError> {
        let _ = (primals, tangents);
        Err(ForeignError::DifferentiationUnsupported {
            program: self.name().to_owned(),
            detail: "provider declares no tangent rule".to_owned(),
        })
    }

    fn evaluate_mapped(
        &self,
        args: &[ArrayValue],
        mapped: &[bool],
    ) -> Result<ArrayValue, ForeignError> {
        let batch = mapped_batch_size(args, mapped)?;
        if batch == 0 {
            // Nothing to apply over; the output is the inferred per-element
            // descriptor under an empty leading axis.
            let out = self
                .abstract_evaluate(&element_avals(args, mapped)?)?
                .with_leading_axis(0);
            return Ok(ArrayValue::zeros(out.dtype, out.shape)?);
        }
        let mut slices = Vec::with_capacity(batch);
        for index in 0..batch {
            let per_index = select_index(args, mapped, index)?;
            slices.push(self.evaluate(&per_index)?);
        }
        Ok(ArrayValue::stack_axis0(&slices)?)
    }

    fn evaluate_with_tangent_mapped(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
        mapped: &[bool],
    ) -> Result<(ArrayValue, ArrayValue), ForeignError> {
        let batch = mapped_batch_size(primals, mapped)?;
        if batch == 0 {
            let out = self
                .abstract_evaluate(&element_avals(primals, mapped)?)?
                .with_leading_axis(0);
            let empty = ArrayValue::zeros(out.dtype, out.shape)?;
            return Ok((empty.clone(), empty));
        }
        let mut primal_slices = Vec::with_capacity(batch);
        let mut tangent_slices = Vec::with_capacity(batch);
        for index in 0..batch {
            let primal_args = select_index(primals, mapped, index)?;
            let tangent_args = select_index(tangents, mapped, index)?;
            let (primal, tangent) = self.evaluate_with_tangent(&primal_args, &tangent_args)?;
            primal_slices.push(primal);
            tangent_slices.push(tangent);
        }
        Ok((
            ArrayValue::stack_axis0(&primal_slices)?,
            ArrayValue::stack_axis0(&tangent_slices)?,
        ))
    }
}

/// Batch size shared by all mapped arguments; errors when they disagree.
pub(crate) fn mapped_batch_size(
    args: &[ArrayValue],
    mapped: &[bool],
) -> Result<usize, ForeignError> {
    let mut batch: Option<(usize, u32)> = None;
    for (index, (arg, &is_mapped)) in args.iter().zip(mapped.iter()).enumerate() {
        if !is_mapped {
            continue;
        }
        let leading = *arg.shape().dims.first().ok_or(ForeignError::ShapeMismatch {
            at: format!("argument {index}"),
            expected: "rank >= 1 for a mapped argument".to_owned(),
            actual: "rank 0".to_owned(),
        })?;
        match batch {
            None => batch = Some((index, leading)),
            Some((_, expected)) if expected != leading => {
                return Err(ForeignError::BatchSizeMismatch {
                    index,
                    expected,
                    actual: leading,
                });
            }
            Some(_) => {}
        }
    }
    batch
        .map(|(_, size)| size as usize)
        .ok_or_else(|| ForeignError::ShapeMismatch {
            at: "mapped mask".to_owned(),
            expected: "at least one mapped argument".to_owned(),
            actual: "none".to_owned(),
        })
}

/// Per-element descriptors: mapped arguments lose their leading batch axis.
fn element_avals(
    args: &[ArrayValue],
    mapped: &[bool],
) -> Result<Vec<AbstractValue>, ForeignError> {
    args.iter()
        .zip(mapped.iter())
        .map(|(arg, &is_mapped)| {
            if is_mapped {
                let (_, inner) = arg.aval().without_leading_axis()?;
                Ok(inner)
            } else {
                Ok(arg.aval())
            }
        })
        .collect()
}

fn select_index(
    args: &[ArrayValue],
    mapped: &[bool],
    index: usize,
) -> Result<Vec<ArrayValue>, ForeignError> {
    args.iter()
        .zip(mapped.iter())
        .map(|(arg, &is_mapped)| {
            if is_mapped {
                Ok(arg.slice_axis0(index)?)
            } else {
                Ok(arg.clone())
            }
        })
        .collect()
}
