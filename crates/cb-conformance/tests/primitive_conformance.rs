//! Concrete and shape-only evaluation through the adapter.

use cb_adapter::{AdapterError, PrimitiveAdapter};
use cb_conformance::{add_two, add_two_scalar, add_two_to_int, arange_f32, scale};
use cb_core::{AbstractValue, ArrayValue, CallContext, DType, Shape};
use cb_foreign::ForeignError;
use cb_test_utils::assert_allclose;

#[test]
fn scalar_eval() {
    let adapter = PrimitiveAdapter::new(add_two_scalar());
    let out = adapter.eval_rule(&[ArrayValue::scalar_f32(5.0)]).unwrap();
    assert_eq!(out.to_f64_vec(), vec![7.0]);
    assert_eq!(out.shape(), &Shape::scalar());
}

#[test]
fn array_eval() {
    let adapter = PrimitiveAdapter::new(add_two(10));
    let out = adapter.eval_rule(&[arange_f32(10)]).unwrap();
    let expected: Vec<f64> = (0..10).map(|i| f64::from(i) + 2.0).collect();
    assert_allclose(&out.to_f64_vec(), &expected, 1e-6, 1e-6);
}

#[test]
fn two_argument_eval() {
    let adapter = PrimitiveAdapter::new(scale());
    let out = adapter
        .eval_rule(&[arange_f32(4), ArrayValue::scalar_f32(3.0)])
        .unwrap();
    assert_eq!(out.to_f64_vec(), vec![0.0, 3.0, 6.0, 9.0]);
}

#[test]
fn abstract_rule_reports_the_provider_output_dtype() {
    let adapter = PrimitiveAdapter::new(add_two_to_int(10));
    let out_aval = adapter
        .abstract_rule(&[AbstractValue::new(DType::F32, Shape::vector(10))])
        .unwrap();
    assert_eq!(out_aval, AbstractValue::new(DType::I32, Shape::vector(10)));
}

#[test]
fn abstract_and_concrete_agree_on_the_dtype_change() {
    let adapter = PrimitiveAdapter::new(add_two_to_int(3));
    let arg = ArrayValue::vector_f32(&[0.6, 1.2, 2.0]);
    let aval = adapter.abstract_rule(&[arg.aval()]).unwrap();
    let out = adapter.eval_rule(&[arg]).unwrap();
    assert_eq!(out.aval(), aval);
    assert_eq!(out.to_f64_vec(), vec![3.0, 3.0, 4.0]);
}

#[test]
fn wrong_arity_is_a_concrete_rule_error() {
    let adapter = PrimitiveAdapter::new(add_two_scalar());
    let err = adapter
        .eval_rule(&[ArrayValue::scalar_f32(1.0), ArrayValue::scalar_f32(2.0)])
        .unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Rule {
            context: CallContext::Concrete,
            fault: ForeignError::ArityMismatch {
                expected: 1,
                actual: 2
            },
            ..
        }
    ));
}

#[test]
fn wrong_dtype_names_the_offending_argument() {
    let adapter = PrimitiveAdapter::new(scale());
    let err = adapter
        .eval_rule(&[arange_f32(4), ArrayValue::scalar_i32(3)])
        .unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Rule {
            fault: ForeignError::TypeMismatch { index: 1, .. },
            ..
        }
    ));
}

#[test]
fn wrong_shape_is_rejected_shape_only_too() {
    let adapter = PrimitiveAdapter::new(add_two(10));
    let err = adapter
        .abstract_rule(&[AbstractValue::new(DType::F32, Shape::vector(7))])
        .unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Rule {
            context: CallContext::ShapeOnly,
            fault: ForeignError::ShapeMismatch { .. },
            ..
        }
    ));
}
