//! The immutable host-side handle to one bound foreign function.
//!
//! `ExternalProgram` owns the provider and validates every call against the
//! declared parameter constraints before anything crosses the boundary.
//! Created once at binding time; immutable thereafter.

use std::sync::Arc;

use cb_core::{AbstractSignature, AbstractValue, ArrayValue};

use crate::artifact::CompiledArtifact;
use crate::error::ForeignError;
use crate::provider::{ForeignFn, ParamSpec};

#[derive(Clone)]
pub struct ExternalProgram {
    inner: Arc<dyn ForeignFn>,
}

impl std::fmt::Debug for ExternalProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalProgram")
            .field("name", &self.inner.name())
            .field("arity", &self.arity())
            .finish()
    }
}

impl ExternalProgram {
    /// Bind a provider into an immutable program handle.
    #[must_use]
    pub fn bind(provider: Arc<dyn ForeignFn>) -> Self {
        Self { inner: provider }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.inner.params().len()
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        self.inner.params()
    }

    fn check_aval(&self, index: usize, spec: &ParamSpec, aval: &AbstractValue) -> Result<(), ForeignError> {
        if aval.dtype != spec.dtype {
            return Err(ForeignError::TypeMismatch {
                index,
                expected: spec.dtype,
                actual: aval.dtype,
            });
        }
        if !spec.constraint.admits(&aval.shape) {
            return Err(ForeignError::ShapeMismatch {
                at: format!("argument {index}"),
                expected: spec.constraint.describe(),
                actual: format!("{:?}", aval.shape.dims),
            });
        }
        Ok(())
    }

    fn check_avals(&self, avals: &[AbstractValue]) -> Result<(), ForeignError> {
        let params = self.inner.params();
        if avals.len() != params.len() {
            return Err(ForeignError::ArityMismatch {
                expected: params.len(),
                actual: avals.len(),
            });
        }
        for (index, (spec, aval)) in params.iter().zip(avals.iter()).enumerate() {
            self.check_aval(index, spec, aval)?;
        }
        Ok(())
    }

    fn check_args(&self, args: &[ArrayValue]) -> Result<(), ForeignError> {
        let avals: Vec<AbstractValue> = args.iter().map(ArrayValue::aval).collect();
        self.check_avals(&avals)
    }

    /// Concrete evaluation. Deterministic and side-effect-free.
    pub fn evaluate(&self, args: &[ArrayValue]) -> Result<ArrayValue, ForeignError> {
        self.check_args(args)?;
        self.inner.evaluate(args)
    }

    /// Shape/dtype-only evaluation; never materializes data.
    pub fn abstract_evaluate(&self, avals: &[AbstractValue]) -> Result<AbstractValue, ForeignError> {
        self.check_avals(avals)?;
        self.inner.abstract_evaluate(avals)
    }

    /// Primal-plus-directional-derivative evaluation. Each tangent must
    /// structurally match its primal.
    pub fn evaluate_with_tangent(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(ArrayValue, ArrayValue), ForeignError> {
        self.check_args(primals)?;
        self.check_tangent_structure(primals, tangents)?;
        self.inner.evaluate_with_tangent(primals, tangents)
    }

    fn check_tangent_structure(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(), ForeignError> {
        if tangents.len() != primals.len() {
            return Err(ForeignError::ArityMismatch {
                expected: primals.len(),
                actual: tangents.len(),
            });
        }
        for (index, (primal, tangent)) in primals.iter().zip(tangents.iter()).enumerate() {
            if primal.aval() != tangent.aval() {
                return Err(ForeignError::ShapeMismatch {
                    at: format!("tangent {index}"),
                    expected: AbstractSignature::new([primal.aval()]).canonical_fingerprint(),
                    actual: AbstractSignature::new([tangent.aval()]).canonical_fingerprint(),
                });
            }
        }
        Ok(())
    }

    /// Dimension-mapped evaluation: arguments flagged in `mapped` carry a
    /// canonical leading batch axis; the rest are constant across it.
    pub fn evaluate_mapped(
        &self,
        args: &[ArrayValue],
        mapped: &[bool],
    ) -> Result<ArrayValue, ForeignError> {
        self.check_mapped_args(args, mapped)?;
        self.inner.evaluate_mapped(args, mapped)
    }

    /// Dimension-mapped JVP; tangents share the primal mapping.
    pub fn evaluate_with_tangent_mapped(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
        mapped: &[bool],
    ) -> Result<(ArrayValue, ArrayValue), ForeignError> {
        self.check_mapped_args(primals, mapped)?;
        self.check_tangent_structure(primals, tangents)?;
        self.inner
            .evaluate_with_tangent_mapped(primals, tangents, mapped)
    }

    fn check_mapped_args(&self, args: &[ArrayValue], mapped: &[bool]) -> Result<(), ForeignError> {
        if mapped.len() != self.arity() {
            return Err(ForeignError::ArityMismatch {
                expected: self.arity(),
                actual: mapped.len(),
            });
        }
        let signature = AbstractSignature::of_args(args);
        let (_, inner_avals) = split_mapped_signature(&signature, mapped)?;
        self.check_avals(&inner_avals)
    }

    /// The staged-compilation entry point: a specialization of abstract
    /// evaluation that also emits an executable for exactly this signature
    /// (and mapped-argument mask).
    pub fn specialize(
        &self,
        signature: &AbstractSignature,
        mapped: &[bool],
    ) -> Result<CompiledArtifact, ForeignError> {
        if mapped.len() != self.arity() {
            return Err(ForeignError::ArityMismatch {
                expected: self.arity(),
                actual: mapped.len(),
            });
        }
        let (batch, inner_avals) = split_mapped_signature(signature, mapped)?;
        self.check_avals(&inner_avals)?;
        let inner_out = self.inner.abstract_evaluate(&inner_avals)?;
        let out_aval = match batch {
            Some(size) => inner_out.with_leading_axis(size),
            None => inner_out,
        };
        Ok(CompiledArtifact::new(
            self.clone(),
            signature.clone(),
            mapped.to_vec(),
            out_aval,
        ))
    }
}

/// Strip the canonical leading batch axis off every mapped descriptor,
/// verifying mapped arguments agree on the batch size. Returns the shared
/// batch size (None when nothing is mapped) and the inner descriptors.
fn split_mapped_signature(
    signature: &AbstractSignature,
    mapped: &[bool],
) -> Result<(Option<u32>, Vec<AbstractValue>), ForeignError> {
    if mapped.len() != signature.arity() {
        return Err(ForeignError::ArityMismatch {
            expected: signature.arity(),
            actual: mapped.len(),
        });
    }
    let mut batch: Option<u32> = None;
    let mut inner = Vec::with_capacity(signature.arity());
    for (index, (aval, &is_mapped)) in signature.avals.iter().zip(mapped.iter()).enumerate() {
        if !is_mapped {
            inner.push(aval.clone());
            continue;
        }
        let (size, inner_aval) = aval.without_leading_axis()?;
        match batch {
            None => batch = Some(size),
            Some(expected) if expected != size => {
                return Err(ForeignError::BatchSizeMismatch {
                    index,
                    expected,
                    actual: size,
                });
            }
            Some(_) => {}
        }
        inner.push(inner_aval);
    }
    Ok((batch, inner))
}
