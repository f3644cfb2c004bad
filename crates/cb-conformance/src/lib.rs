//! Conformance fixture programs.
//!
//! A small stable of foreign programs exercised by the suites under
//! `tests/`: elementwise, mixed-arity, dtype-changing, and differentiable
//! shapes of the same boundary. Each constructor binds a fresh program, so
//! suites can attach them to private or shared caches as they need.

#![forbid(unsafe_code)]

use cb_core::{AbstractValue, ArrayValue, DType, Shape};
use cb_foreign::{ClosureProgram, ExternalProgram, ForeignError, ParamSpec, ShapeConstraint};

/// `f(x) = x + 2` over f32 vectors of a fixed length.
#[must_use]
pub fn add_two(len: u32) -> ExternalProgram {
    ClosureProgram::new(
        "add_two",
        vec![ParamSpec::new(
            DType::F32,
            ShapeConstraint::Exact(Shape::vector(len)),
        )],
        |args| {
            let out: Vec<f64> = args[0].to_f64_vec().iter().map(|x| x + 2.0).collect();
            Ok(ArrayValue::from_f64_vec(
                DType::F32,
                args[0].shape().clone(),
                out,
            )?)
        },
        |avals| Ok(avals[0].clone()),
    )
    .bind()
}

/// Scalar flavor of [`add_two`].
#[must_use]
pub fn add_two_scalar() -> ExternalProgram {
    ClosureProgram::new(
        "add_two_scalar",
        vec![ParamSpec::scalar(DType::F32)],
        |args| {
            let x = args[0].to_f64_vec()[0];
            Ok(ArrayValue::scalar_f32((x + 2.0) as f32))
        },
        |avals| Ok(avals[0].clone()),
    )
    .bind()
}

/// `f(x) = round(x + 2)` with an i32 output: the output descriptor differs
/// from the input in dtype, so shape-only inference must come from the
/// provider rather than from echoing the input.
#[must_use]
pub fn add_two_to_int(len: u32) -> ExternalProgram {
    ClosureProgram::new(
        "add_two_to_int",
        vec![ParamSpec::new(
            DType::F32,
            ShapeConstraint::Exact(Shape::vector(len)),
        )],
        |args| {
            let out: Vec<i32> = args[0]
                .to_f64_vec()
                .iter()
                .map(|x| (x + 2.0).round() as i32)
                .collect();
            Ok(ArrayValue::vector_i32(&out))
        },
        |avals| Ok(AbstractValue::new(DType::I32, avals[0].shape.clone())),
    )
    .bind()
}

/// `f(x, factor) = x * factor`; the factor stays scalar under batching.
#[must_use]
pub fn scale() -> ExternalProgram {
    ClosureProgram::new(
        "scale",
        vec![
            ParamSpec::any_rank(DType::F32),
            ParamSpec::scalar(DType::F32),
        ],
        |args| {
            let factor = args[1].to_f64_vec()[0];
            let out: Vec<f64> = args[0].to_f64_vec().iter().map(|x| x * factor).collect();
            Ok(ArrayValue::from_f64_vec(
                DType::F32,
                args[0].shape().clone(),
                out,
            )?)
        },
        |avals| Ok(avals[0].clone()),
    )
    .bind()
}

/// Elementwise sum of two equal-length f32 vectors.
#[must_use]
pub fn add_arrays(len: u32) -> ExternalProgram {
    ClosureProgram::new(
        "add_arrays",
        vec![
            ParamSpec::new(DType::F32, ShapeConstraint::Exact(Shape::vector(len))),
            ParamSpec::new(DType::F32, ShapeConstraint::Exact(Shape::vector(len))),
        ],
        |args| {
            let lhs = args[0].to_f64_vec();
            let rhs = args[1].to_f64_vec();
            let out: Vec<f64> = lhs.iter().zip(rhs.iter()).map(|(a, b)| a + b).collect();
            Ok(ArrayValue::from_f64_vec(
                DType::F32,
                args[0].shape().clone(),
                out,
            )?)
        },
        |avals| Ok(avals[0].clone()),
    )
    .bind()
}

/// `f(x, y) = x^2 + 2y`, elementwise over f64 arrays of one shared shape,
/// with the exact tangent rule `df = 2x dx + 2 dy`.
#[must_use]
pub fn square_plus_linear() -> ExternalProgram {
    ClosureProgram::new(
        "square_plus_linear",
        vec![
            ParamSpec::any_rank(DType::F64),
            ParamSpec::any_rank(DType::F64),
        ],
        |args| {
            let out = square_plus_linear_values(args)?;
            Ok(ArrayValue::from_f64_vec(
                DType::F64,
                args[0].shape().clone(),
                out,
            )?)
        },
        |avals| {
            check_same_shape(&avals[0].shape, &avals[1].shape)?;
            Ok(avals[0].clone())
        },
    )
    .with_tangent(|primals, tangents| {
        let primal_out = square_plus_linear_values(primals)?;
        let xs = primals[0].to_f64_vec();
        let dxs = tangents[0].to_f64_vec();
        let dys = tangents[1].to_f64_vec();
        let tangent_out: Vec<f64> = xs
            .iter()
            .zip(dxs.iter().zip(dys.iter()))
            .map(|(x, (dx, dy))| 2.0 * x * dx + 2.0 * dy)
            .collect();
        let shape = primals[0].shape().clone();
        Ok((
            ArrayValue::from_f64_vec(DType::F64, shape.clone(), primal_out)?,
            ArrayValue::from_f64_vec(DType::F64, shape, tangent_out)?,
        ))
    })
    .bind()
}

fn square_plus_linear_values(args: &[ArrayValue]) -> Result<Vec<f64>, ForeignError> {
    check_same_shape(args[0].shape(), args[1].shape())?;
    Ok(args[0]
        .to_f64_vec()
        .iter()
        .zip(args[1].to_f64_vec().iter())
        .map(|(x, y)| x * x + 2.0 * y)
        .collect())
}

fn check_same_shape(lhs: &Shape, rhs: &Shape) -> Result<(), ForeignError> {
    if lhs == rhs {
        Ok(())
    } else {
        Err(ForeignError::ShapeMismatch {
            at: "argument 1".to_owned(),
            expected: format!("{:?}", lhs.dims),
            actual: format!("{:?}", rhs.dims),
        })
    }
}

/// A provider that always fails, for exercising failure propagation.
#[must_use]
pub fn always_failing() -> ExternalProgram {
    ClosureProgram::new(
        "always_failing",
        vec![ParamSpec::any_rank(DType::F32)],
        |_| {
            Err(ForeignError::EvalFailed {
                program: "always_failing".to_owned(),
                detail: "provider backend unavailable".to_owned(),
            })
        },
        |_| {
            Err(ForeignError::EvalFailed {
                program: "always_failing".to_owned(),
                detail: "provider backend unavailable".to_owned(),
            })
        },
    )
    .bind()
}

/// `[0, 1, ..., n-1]` as f32.
#[must_use]
pub fn arange_f32(n: u32) -> ArrayValue {
    let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
    ArrayValue::vector_f32(&values)
}

/// `n` evenly spaced f64 samples over `[start, stop]`.
#[must_use]
pub fn linspace_f64(start: f64, stop: f64, n: u32) -> ArrayValue {
    let values: Vec<f64> = if n <= 1 {
        vec![start]
    } else {
        let step = (stop - start) / f64::from(n - 1);
        (0..n).map(|i| start + step * f64::from(i)).collect()
    };
    ArrayValue::vector_f64(&values)
}
