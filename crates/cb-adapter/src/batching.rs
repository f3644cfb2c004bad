//! Batching rule for foreign-program calls.
//!
//! A batched call carries batch-axis metadata per argument rather than
//! looping on the host side: every batched argument is normalized so its
//! batch axis is the leading axis, then the provider's dimension-mapped
//! entry point runs once over the whole batch. Outputs always carry their
//! batch axis at position 0.

use cb_core::{AbstractValue, ArrayValue, BatchDescriptor, Shape};
use cb_foreign::{ExternalProgram, ForeignError};

/// A value paired with an optional batch axis.
///
/// When `batch_axis` is `Some(i)`, dimension `i` of `value` is the batch
/// dimension. When it is `None`, the value is constant across the batch.
#[derive(Debug, Clone)]
pub struct BatchedValue {
    pub value: ArrayValue,
    pub batch_axis: Option<usize>,
}

impl BatchedValue {
    #[must_use]
    pub fn batched(value: ArrayValue, batch_axis: usize) -> Self {
        Self {
            value,
            batch_axis: Some(batch_axis),
        }
    }

    #[must_use]
    pub fn unbatched(value: ArrayValue) -> Self {
        Self {
            value,
            batch_axis: None,
        }
    }

    #[must_use]
    pub fn is_batched(&self) -> bool {
        self.batch_axis.is_some()
    }
}

/// Apply the batching rule to one foreign call.
///
/// With no batched input this degenerates to a plain evaluation and the
/// output is unbatched. Otherwise batched inputs are moved to canonical
/// leading-axis position and the mapped form runs once; the output's batch
/// axis is 0.
pub fn batch_rule(
    program: &ExternalProgram,
    inputs: &[BatchedValue],
) -> Result<BatchedValue, ForeignError> {
    if inputs.len() != program.arity() {
        return Err(ForeignError::ArityMismatch {
            expected: program.arity(),
            actual: inputs.len(),
        });
    }
    let descriptor = BatchDescriptor::new(inputs.iter().map(|input| input.batch_axis).collect());
    if descriptor.is_unbatched() {
        let args: Vec<ArrayValue> = inputs.iter().map(|input| input.value.clone()).collect();
        return Ok(BatchedValue::unbatched(program.evaluate(&args)?));
    }
    let normalized = normalize_args(inputs)?;
    let out = program.evaluate_mapped(&normalized, &descriptor.mapped_mask())?;
    Ok(BatchedValue::batched(out, 0))
}

/// Batched forward-mode rule. Tangents must carry the same batch axes as
/// their primals.
pub fn batch_jvp_rule(
    program: &ExternalProgram,
    primals: &[BatchedValue],
    tangents: &[BatchedValue],
) -> Result<(BatchedValue, BatchedValue), ForeignError> {
    if primals.len() != program.arity() {
        return Err(ForeignError::ArityMismatch {
            expected: program.arity(),
            actual: primals.len(),
        });
    }
    check_tangent_axes(primals, tangents)?;
    let descriptor = BatchDescriptor::new(primals.iter().map(|input| input.batch_axis).collect());
    if descriptor.is_unbatched() {
        let primal_args: Vec<ArrayValue> =
            primals.iter().map(|input| input.value.clone()).collect();
        let tangent_args: Vec<ArrayValue> =
            tangents.iter().map(|input| input.value.clone()).collect();
        let (primal, tangent) = program.evaluate_with_tangent(&primal_args, &tangent_args)?;
        return Ok((
            BatchedValue::unbatched(primal),
            BatchedValue::unbatched(tangent),
        ));
    }
    let primal_args = normalize_args(primals)?;
    let tangent_args = normalize_args(tangents)?;
    let (primal, tangent) = program.evaluate_with_tangent_mapped(
        &primal_args,
        &tangent_args,
        &descriptor.mapped_mask(),
    )?;
    Ok((
        BatchedValue::batched(primal, 0),
        BatchedValue::batched(tangent, 0),
    ))
}

fn check_tangent_axes(
    primals: &[BatchedValue],
    tangents: &[BatchedValue],
) -> Result<(), ForeignError> {
    if tangents.len() != primals.len() {
        return Err(ForeignError::ArityMismatch {
            expected: primals.len(),
            actual: tangents.len(),
        });
    }
    for (index, (primal, tangent)) in primals.iter().zip(tangents.iter()).enumerate() {
        if primal.batch_axis != tangent.batch_axis {
            return Err(ForeignError::ShapeMismatch {
                at: format!("tangent {index} batch axis"),
                expected: format!("{:?}", primal.batch_axis),
                actual: format!("{:?}", tangent.batch_axis),
            });
        }
    }
    Ok(())
}

pub(crate) fn normalize_args(inputs: &[BatchedValue]) -> Result<Vec<ArrayValue>, ForeignError> {
    inputs
        .iter()
        .map(|input| match input.batch_axis {
            None => Ok(input.value.clone()),
            Some(axis) if axis >= input.value.rank() => Err(ForeignError::BatchRankMismatch {
                axis,
                rank: input.value.rank(),
            }),
            Some(0) => Ok(input.value.clone()),
            Some(axis) => Ok(input.value.move_axis_to_front(axis)?),
        })
        .collect()
}

/// Move a descriptor's batch axis to leading position, shape-only.
pub(crate) fn aval_axis_to_front(
    aval: &AbstractValue,
    axis: usize,
) -> Result<AbstractValue, ForeignError> {
    let rank = aval.shape.rank();
    if axis >= rank {
        return Err(ForeignError::BatchRankMismatch { axis, rank });
    }
    if axis == 0 {
        return Ok(aval.clone());
    }
    let mut dims = Vec::with_capacity(rank);
    dims.push(aval.shape.dims[axis]);
    for (position, &dim) in aval.shape.dims.iter().enumerate() {
        if position != axis {
            dims.push(dim);
        }
    }
    Ok(AbstractValue::new(aval.dtype, Shape::of(&dims)))
}

#[cfg(test)]
mod tests {
    use cb_core::{DType, ElementBuffer};
    use cb_foreign::{ClosureProgram, ParamSpec};

    use super::*;

    fn double() -> ExternalProgram {
        ClosureProgram::new(
            "double",
            vec![ParamSpec::any_rank(DType::F64)],
            |args| {
                let out: Vec<f64> = args[0].to_f64_vec().iter().map(|x| x * 2.0).collect();
                Ok(ArrayValue::from_f64_vec(
                    DType::F64,
                    args[0].shape().clone(),
                    out,
                )?)
            },
            |avals| Ok(avals[0].clone()),
        )
        .bind()
    }

    #[test]
    fn leading_axis_batch() {
        let program = double();
        let input = BatchedValue::batched(ArrayValue::vector_f64(&[1.0, 2.0, 3.0]), 0);
        let out = batch_rule(&program, &[input]).unwrap();
        assert_eq!(out.batch_axis, Some(0));
        assert_eq!(out.value.to_f64_vec(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn nonzero_axis_is_normalized_to_front() {
        let program = double();
        // 2x3: rows are the mapped slices when axis=1.
        let value = ArrayValue::new(
            Shape::of(&[2, 3]),
            ElementBuffer::F64(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )
        .unwrap();
        let out = batch_rule(&program, &[BatchedValue::batched(value, 1)]).unwrap();
        assert_eq!(out.batch_axis, Some(0));
        assert_eq!(out.value.shape(), &Shape::of(&[3, 2]));
        assert_eq!(
            out.value.to_f64_vec(),
            vec![2.0, 8.0, 4.0, 10.0, 6.0, 12.0]
        );
    }

    #[test]
    fn all_unbatched_degenerates_to_plain_eval() {
        let program = double();
        let input = BatchedValue::unbatched(ArrayValue::vector_f64(&[1.0, 2.0]));
        let out = batch_rule(&program, &[input]).unwrap();
        assert_eq!(out.batch_axis, None);
        assert_eq!(out.value.to_f64_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn axis_beyond_rank_is_rejected() {
        let program = double();
        let input = BatchedValue::batched(ArrayValue::vector_f64(&[1.0, 2.0]), 3);
        let err = batch_rule(&program, &[input]).unwrap_err();
        assert!(matches!(
            err,
            ForeignError::BatchRankMismatch { axis: 3, rank: 1 }
        ));
    }

    #[test]
    fn tangent_axes_must_mirror_primal_axes() {
        let program = double();
        let primal = BatchedValue::batched(ArrayValue::vector_f64(&[1.0, 2.0]), 0);
        let tangent = BatchedValue::unbatched(ArrayValue::vector_f64(&[1.0, 1.0]));
        let err = batch_jvp_rule(&program, &[primal], &[tangent]).unwrap_err();
        assert!(matches!(err, ForeignError::ShapeMismatch { .. }));
    }
}
