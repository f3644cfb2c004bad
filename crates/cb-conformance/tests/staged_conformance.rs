//! Staged execution through the signature cache.

use std::sync::Arc;

use cb_adapter::{AdapterError, PrimitiveAdapter};
use cb_cache::SignatureCache;
use cb_conformance::{add_two, add_two_scalar, always_failing, arange_f32, scale};
use cb_core::{AbstractSignature, AbstractValue, ArrayValue, DType, Shape};
use cb_foreign::ForeignError;
use cb_test_utils::assert_allclose;

fn scalar_signature() -> AbstractSignature {
    AbstractSignature::new([AbstractValue::new(DType::F32, Shape::scalar())])
}

#[test]
fn staged_scalar_matches_direct_eval() {
    let adapter = PrimitiveAdapter::new(add_two_scalar());
    let staged = adapter.stage_rule(&scalar_signature()).unwrap();
    let out = staged.execute(&[ArrayValue::scalar_f32(5.0)]).unwrap();
    assert_eq!(out.to_f64_vec(), vec![7.0]);
}

#[test]
fn staged_array_matches_direct_eval() {
    let adapter = PrimitiveAdapter::new(add_two(10));
    let signature = AbstractSignature::new([AbstractValue::new(DType::F32, Shape::vector(10))]);
    let staged = adapter.stage_rule(&signature).unwrap();

    let direct = adapter.eval_rule(&[arange_f32(10)]).unwrap();
    let via_cache = staged.execute(&[arange_f32(10)]).unwrap();
    assert_allclose(&via_cache.to_f64_vec(), &direct.to_f64_vec(), 1e-6, 1e-6);
}

#[test]
fn staged_two_argument_call() {
    let adapter = PrimitiveAdapter::new(scale());
    let signature = AbstractSignature::new([
        AbstractValue::new(DType::F32, Shape::vector(4)),
        AbstractValue::new(DType::F32, Shape::scalar()),
    ]);
    let staged = adapter.stage_rule(&signature).unwrap();
    let out = staged
        .execute(&[arange_f32(4), ArrayValue::scalar_f32(2.0)])
        .unwrap();
    assert_eq!(out.to_f64_vec(), vec![0.0, 2.0, 4.0, 6.0]);
}

#[test]
fn out_aval_is_known_before_any_execution() {
    let adapter = PrimitiveAdapter::new(add_two(10));
    let signature = AbstractSignature::new([AbstractValue::new(DType::F32, Shape::vector(10))]);
    let staged = adapter.stage_rule(&signature).unwrap();
    assert_eq!(
        staged.out_aval(),
        &AbstractValue::new(DType::F32, Shape::vector(10))
    );
}

#[test]
fn repeat_staging_hits_the_cache() {
    let adapter = PrimitiveAdapter::new(add_two_scalar());
    let first = adapter.stage_rule(&scalar_signature()).unwrap();
    let second = adapter.stage_rule(&scalar_signature()).unwrap();
    assert!(Arc::ptr_eq(first.artifact(), second.artifact()));
    assert_eq!(adapter.cache().entry_count(), 1);
}

#[test]
fn each_new_signature_compiles_its_own_artifact() {
    let cache = Arc::new(SignatureCache::new());
    let small = PrimitiveAdapter::with_cache(add_two(4), Arc::clone(&cache));
    let large = PrimitiveAdapter::with_cache(add_two(8), Arc::clone(&cache));

    small
        .stage_rule(&AbstractSignature::new([AbstractValue::new(
            DType::F32,
            Shape::vector(4),
        )]))
        .unwrap();
    large
        .stage_rule(&AbstractSignature::new([AbstractValue::new(
            DType::F32,
            Shape::vector(8),
        )]))
        .unwrap();
    assert_eq!(cache.entry_count(), 2);
}

#[test]
fn staged_call_rejects_a_different_signature() {
    let adapter = PrimitiveAdapter::new(add_two_scalar());
    let staged = adapter.stage_rule(&scalar_signature()).unwrap();
    let err = staged.execute(&[arange_f32(3)]).unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Rule {
            fault: ForeignError::SignatureMismatch { .. },
            ..
        }
    ));
}

#[test]
fn compilation_failure_surfaces_and_is_not_cached() {
    let adapter = PrimitiveAdapter::new(always_failing());
    let signature = AbstractSignature::new([AbstractValue::new(DType::F32, Shape::vector(2))]);
    let err = adapter.stage_rule(&signature).unwrap_err();
    assert!(matches!(err, AdapterError::Compilation { .. }));
    assert_eq!(adapter.cache().entry_count(), 0);
}
