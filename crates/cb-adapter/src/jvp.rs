//! Forward-mode rule for foreign-program calls.
//!
//! The provider is responsible for its own derivative: the rule pushes the
//! primal/tangent pair through `evaluate_with_tangent` in one call, so the
//! host never differentiates through the opaque body. Providers without a
//! tangent rule surface `DifferentiationUnsupported` unchanged.

use cb_core::{AbstractValue, ArrayValue};
use cb_foreign::{ExternalProgram, ForeignError};

/// Apply the forward-mode rule: one paired primal/tangent evaluation.
pub fn jvp_rule(
    program: &ExternalProgram,
    primals: &[ArrayValue],
    tangents: &[ArrayValue],
) -> Result<(ArrayValue, ArrayValue), ForeignError> {
    program.evaluate_with_tangent(primals, tangents)
}

/// The zero tangent for a descriptor, used when an input is a constant of
/// the differentiated computation.
pub fn zero_tangent(aval: &AbstractValue) -> Result<ArrayValue, ForeignError> {
    Ok(ArrayValue::zeros(aval.dtype, aval.shape.clone())?)
}

#[cfg(test)]
mod tests {
    use cb_core::{DType, Shape};
    use cb_foreign::{ClosureProgram, ParamSpec};

    use super::*;

    // f(x, y) = x^2 + 2y, df = 2x dx + 2 dy
    fn square_plus_linear() -> ExternalProgram {
        ClosureProgram::new(
            "square_plus_linear",
            vec![
                ParamSpec::scalar(DType::F64),
                ParamSpec::scalar(DType::F64),
            ],
            |args| {
                let x = args[0].to_f64_vec()[0];
                let y = args[1].to_f64_vec()[0];
                Ok(ArrayValue::scalar_f64(x * x + 2.0 * y))
            },
            |_| Ok(AbstractValue::new(DType::F64, Shape::scalar())),
        )
        .with_tangent(|primals, tangents| {
            let x = primals[0].to_f64_vec()[0];
            let y = primals[1].to_f64_vec()[0];
            let dx = tangents[0].to_f64_vec()[0];
            let dy = tangents[1].to_f64_vec()[0];
            Ok((
                ArrayValue::scalar_f64(x * x + 2.0 * y),
                ArrayValue::scalar_f64(2.0 * x * dx + 2.0 * dy),
            ))
        })
        .bind()
    }

    #[test]
    fn primal_and_tangent_come_back_together() {
        let program = square_plus_linear();
        let (primal, tangent) = jvp_rule(
            &program,
            &[ArrayValue::scalar_f64(3.0), ArrayValue::scalar_f64(4.0)],
            &[ArrayValue::scalar_f64(1.0), ArrayValue::scalar_f64(1.0)],
        )
        .unwrap();
        assert_eq!(primal.to_f64_vec(), vec![17.0]);
        assert_eq!(tangent.to_f64_vec(), vec![8.0]);
    }

    #[test]
    fn zero_tangent_matches_the_descriptor() {
        let aval = AbstractValue::new(DType::F64, Shape::vector(3));
        let zero = zero_tangent(&aval).unwrap();
        assert_eq!(zero.aval(), aval);
        assert_eq!(zero.to_f64_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn rule_is_linear_in_the_tangent() {
        let program = square_plus_linear();
        let primals = [ArrayValue::scalar_f64(2.0), ArrayValue::scalar_f64(1.0)];
        let (_, t1) = jvp_rule(
            &program,
            &primals,
            &[ArrayValue::scalar_f64(1.0), ArrayValue::scalar_f64(0.0)],
        )
        .unwrap();
        let (_, t2) = jvp_rule(
            &program,
            &primals,
            &[ArrayValue::scalar_f64(3.0), ArrayValue::scalar_f64(0.0)],
        )
        .unwrap();
        assert_eq!(t2.to_f64_vec()[0], 3.0 * t1.to_f64_vec()[0]);
    }
}
