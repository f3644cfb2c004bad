//! Primitive adapter: the host-tracing face of a foreign program.
//!
//! `PrimitiveAdapter` exposes one rule per call context the host tracer
//! can be in: concrete evaluation, shape-only inference, staged execution
//! through the signature cache, batched execution, and forward-mode
//! differentiation. The rules compose; a staged call can itself be batched
//! or differentiated, and the adapter routes every specialization through
//! one shared [`SignatureCache`].

#![forbid(unsafe_code)]

pub mod batching;
pub mod jvp;

use std::sync::Arc;

use cb_cache::{CacheError, CacheKey, SignatureCache, build_cache_key};
use cb_core::{AbstractSignature, AbstractValue, ArrayValue, BatchDescriptor, CallContext};
use cb_foreign::{CompiledArtifact, ExternalProgram, ForeignError};

pub use batching::{BatchedValue, batch_jvp_rule, batch_rule};
pub use jvp::{jvp_rule, zero_tangent};

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// A rule failed while interpreting a call.
    Rule {
        context: CallContext,
        program: String,
        fault: ForeignError,
    },
    /// Specialization through the cache failed.
    Compilation { program: String, fault: CacheError },
    /// A program with this name is already registered.
    DuplicateProgram { name: String },
    /// No registered program under this name.
    ProgramNotFound { name: String, available: Vec<String> },
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rule {
                context,
                program,
                fault,
            } => write!(
                f,
                "{} rule failed for program {}: {}",
                context.as_str(),
                program,
                fault
            ),
            Self::Compilation { program, fault } => {
                write!(f, "staging failed for program {}: {}", program, fault)
            }
            Self::DuplicateProgram { name } => {
                write!(f, "program already registered: {}", name)
            }
            Self::ProgramNotFound { name, available } => write!(
                f,
                "program not found: {} (available: {})",
                name,
                available.join(",")
            ),
        }
    }
}

impl std::error::Error for AdapterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rule { fault, .. } => Some(fault),
            Self::Compilation { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

// ── PrimitiveAdapter ───────────────────────────────────────────────

/// One foreign program wired into every host call context.
#[derive(Debug, Clone)]
pub struct PrimitiveAdapter {
    program: ExternalProgram,
    cache: Arc<SignatureCache>,
}

impl PrimitiveAdapter {
    /// Adapt a program with its own private cache.
    #[must_use]
    pub fn new(program: ExternalProgram) -> Self {
        Self::with_cache(program, Arc::new(SignatureCache::new()))
    }

    /// Adapt a program against a shared cache.
    #[must_use]
    pub fn with_cache(program: ExternalProgram, cache: Arc<SignatureCache>) -> Self {
        Self { program, cache }
    }

    #[must_use]
    pub fn program(&self) -> &ExternalProgram {
        &self.program
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.program.name()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<SignatureCache> {
        &self.cache
    }

    fn rule_error(&self, context: CallContext) -> impl Fn(ForeignError) -> AdapterError {
        let program = self.program.name().to_owned();
        move |fault| AdapterError::Rule {
            context,
            program: program.clone(),
            fault,
        }
    }

    /// Concrete evaluation rule.
    pub fn eval_rule(&self, args: &[ArrayValue]) -> Result<ArrayValue, AdapterError> {
        self.program
            .evaluate(args)
            .map_err(self.rule_error(CallContext::Concrete))
    }

    /// Shape-only inference rule. No data moves.
    pub fn abstract_rule(&self, avals: &[AbstractValue]) -> Result<AbstractValue, AdapterError> {
        self.program
            .abstract_evaluate(avals)
            .map_err(self.rule_error(CallContext::ShapeOnly))
    }

    /// Stage for one signature: compile once through the cache, then hand
    /// back an executable bound to that signature.
    pub fn stage_rule(&self, signature: &AbstractSignature) -> Result<StagedCall, AdapterError> {
        let mapped = vec![false; signature.arity()];
        let artifact = self.specialize(signature, &mapped)?;
        Ok(StagedCall {
            artifact,
            key: build_cache_key(&self.program, signature, &mapped),
        })
    }

    /// Batching rule: one mapped evaluation instead of a host-side loop.
    pub fn batch_rule(&self, inputs: &[BatchedValue]) -> Result<BatchedValue, AdapterError> {
        batching::batch_rule(&self.program, inputs)
            .map_err(self.rule_error(CallContext::Batched))
    }

    /// Forward-mode rule.
    pub fn jvp_rule(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(ArrayValue, ArrayValue), AdapterError> {
        jvp::jvp_rule(&self.program, primals, tangents)
            .map_err(self.rule_error(CallContext::Tangent))
    }

    /// Batched forward-mode rule.
    pub fn batch_jvp_rule(
        &self,
        primals: &[BatchedValue],
        tangents: &[BatchedValue],
    ) -> Result<(BatchedValue, BatchedValue), AdapterError> {
        batching::batch_jvp_rule(&self.program, primals, tangents)
            .map_err(self.rule_error(CallContext::Tangent))
    }

    /// Stage a batched call. `avals` describe the arguments as the caller
    /// holds them, batch axes where `descriptor` says they sit; the
    /// compiled artifact expects batch axes normalized to the front and
    /// [`StagedBatchedCall::execute`] performs that normalization per call.
    pub fn stage_batch_rule(
        &self,
        avals: &[AbstractValue],
        descriptor: &BatchDescriptor,
    ) -> Result<StagedBatchedCall, AdapterError> {
        let to_rule_error = self.rule_error(CallContext::Batched);
        if avals.len() != descriptor.axes.len() {
            return Err(to_rule_error(ForeignError::ArityMismatch {
                expected: descriptor.axes.len(),
                actual: avals.len(),
            }));
        }
        let normalized: Vec<AbstractValue> = avals
            .iter()
            .zip(descriptor.axes.iter())
            .map(|(aval, axis)| match axis {
                Some(axis) => batching::aval_axis_to_front(aval, *axis),
                None => Ok(aval.clone()),
            })
            .collect::<Result<_, _>>()
            .map_err(&to_rule_error)?;
        let signature = AbstractSignature::new(normalized);
        let mapped = descriptor.mapped_mask();
        let artifact = self.specialize(&signature, &mapped)?;
        Ok(StagedBatchedCall {
            key: build_cache_key(&self.program, &signature, &mapped),
            artifact,
            descriptor: descriptor.clone(),
        })
    }

    fn specialize(
        &self,
        signature: &AbstractSignature,
        mapped: &[bool],
    ) -> Result<Arc<CompiledArtifact>, AdapterError> {
        self.cache
            .lookup_or_compile(&self.program, signature, mapped)
            .map_err(|fault| AdapterError::Compilation {
                program: self.program.name().to_owned(),
                fault,
            })
    }
}

// ── Staged calls ───────────────────────────────────────────────────

/// An executable bound to one compiled signature. Repeat executions skip
/// inference and validation against the parameter constraints; only the
/// signature identity check remains.
#[derive(Debug, Clone)]
pub struct StagedCall {
    artifact: Arc<CompiledArtifact>,
    key: CacheKey,
}

impl StagedCall {
    #[must_use]
    pub fn out_aval(&self) -> &AbstractValue {
        self.artifact.out_aval()
    }

    #[must_use]
    pub fn artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    /// Key under which the artifact is memoized.
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn execute(&self, args: &[ArrayValue]) -> Result<ArrayValue, AdapterError> {
        self.artifact.call(args).map_err(|fault| AdapterError::Rule {
            context: CallContext::Staged,
            program: self.artifact.program_name().to_owned(),
            fault,
        })
    }

    /// Differentiate through the staged call.
    pub fn execute_with_tangent(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(ArrayValue, ArrayValue), AdapterError> {
        self.artifact
            .call_with_tangent(primals, tangents)
            .map_err(|fault| AdapterError::Rule {
                context: CallContext::Tangent,
                program: self.artifact.program_name().to_owned(),
                fault,
            })
    }
}

/// A staged call specialized for batched arguments. Holds the original
/// batch-axis placement so callers pass values as they hold them.
#[derive(Debug, Clone)]
pub struct StagedBatchedCall {
    artifact: Arc<CompiledArtifact>,
    key: CacheKey,
    descriptor: BatchDescriptor,
}

impl StagedBatchedCall {
    /// Output descriptor, batch axis leading when any input is batched.
    #[must_use]
    pub fn out_aval(&self) -> &AbstractValue {
        self.artifact.out_aval()
    }

    #[must_use]
    pub fn artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    /// Key under which the artifact is memoized.
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn execute(&self, inputs: &[ArrayValue]) -> Result<BatchedValue, AdapterError> {
        let args = self.normalize(inputs)?;
        let out = self.artifact.call(&args).map_err(|fault| AdapterError::Rule {
            context: CallContext::Batched,
            program: self.artifact.program_name().to_owned(),
            fault,
        })?;
        Ok(self.tag_output(out))
    }

    pub fn execute_with_tangent(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(BatchedValue, BatchedValue), AdapterError> {
        let primal_args = self.normalize(primals)?;
        let tangent_args = self.normalize(tangents)?;
        let (primal, tangent) = self
            .artifact
            .call_with_tangent(&primal_args, &tangent_args)
            .map_err(|fault| AdapterError::Rule {
                context: CallContext::Tangent,
                program: self.artifact.program_name().to_owned(),
                fault,
            })?;
        Ok((self.tag_output(primal), self.tag_output(tangent)))
    }

    fn normalize(&self, inputs: &[ArrayValue]) -> Result<Vec<ArrayValue>, AdapterError> {
        let tagged: Vec<BatchedValue> = inputs
            .iter()
            .zip(self.descriptor.axes.iter())
            .map(|(value, axis)| BatchedValue {
                value: value.clone(),
                batch_axis: *axis,
            })
            .collect();
        batching::normalize_args(&tagged).map_err(|fault| AdapterError::Rule {
            context: CallContext::Batched,
            program: self.artifact.program_name().to_owned(),
            fault,
        })
    }

    fn tag_output(&self, value: ArrayValue) -> BatchedValue {
        if self.descriptor.is_unbatched() {
            BatchedValue::unbatched(value)
        } else {
            BatchedValue::batched(value, 0)
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Name-keyed registry of adapted programs.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    adapters: Vec<PrimitiveAdapter>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: PrimitiveAdapter) -> Result<(), AdapterError> {
        if self.adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(AdapterError::DuplicateProgram {
                name: adapter.name().to_owned(),
            });
        }
        self.adapters.push(adapter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&PrimitiveAdapter, AdapterError> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| AdapterError::ProgramNotFound {
                name: name.to_owned(),
                available: self.adapters.iter().map(|a| a.name().to_owned()).collect(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cb_core::{DType, Shape};
    use cb_foreign::{ClosureProgram, ParamSpec};

    use super::*;

    fn add_two() -> PrimitiveAdapter {
        let program = ClosureProgram::new(
            "add_two",
            vec![ParamSpec::any_rank(DType::F64)],
            |args| {
                let out: Vec<f64> = args[0].to_f64_vec().iter().map(|x| x + 2.0).collect();
                Ok(ArrayValue::from_f64_vec(
                    DType::F64,
                    args[0].shape().clone(),
                    out,
                )?)
            },
            |avals| Ok(avals[0].clone()),
        )
        .bind();
        PrimitiveAdapter::new(program)
    }

    #[test]
    fn eval_and_abstract_rules_agree() {
        let adapter = add_two();
        let arg = ArrayValue::vector_f64(&[1.0, 2.0, 3.0]);
        let out = adapter.eval_rule(std::slice::from_ref(&arg)).unwrap();
        let aval = adapter.abstract_rule(&[arg.aval()]).unwrap();
        assert_eq!(out.aval(), aval);
        assert_eq!(out.to_f64_vec(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn staged_call_reuses_one_artifact() {
        let adapter = add_two();
        let signature =
            AbstractSignature::new([AbstractValue::new(DType::F64, Shape::vector(3))]);
        let first = adapter.stage_rule(&signature).unwrap();
        let second = adapter.stage_rule(&signature).unwrap();
        assert!(Arc::ptr_eq(first.artifact(), second.artifact()));
        assert_eq!(first.cache_key(), second.cache_key());

        let out = first
            .execute(&[ArrayValue::vector_f64(&[0.0, 0.0, 0.0])])
            .unwrap();
        assert_eq!(out.to_f64_vec(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn staged_batched_call_round_trips_axes() {
        let adapter = add_two();
        let aval = AbstractValue::new(DType::F64, Shape::of(&[4, 2]));
        let descriptor = BatchDescriptor::new(vec![Some(0)]);
        let staged = adapter.stage_batch_rule(&[aval], &descriptor).unwrap();
        assert_eq!(
            staged.out_aval(),
            &AbstractValue::new(DType::F64, Shape::of(&[4, 2]))
        );

        let input = ArrayValue::from_f64_vec(
            DType::F64,
            Shape::of(&[4, 2]),
            vec![0.0; 8],
        )
        .unwrap();
        let out = staged.execute(&[input]).unwrap();
        assert_eq!(out.batch_axis, Some(0));
        assert_eq!(out.value.to_f64_vec(), vec![2.0; 8]);
    }

    #[test]
    fn rule_errors_carry_the_call_context() {
        let adapter = add_two();
        let err = adapter
            .eval_rule(&[ArrayValue::vector_i32(&[1, 2])])
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Rule {
                context: CallContext::Concrete,
                ..
            }
        ));
    }

    #[test]
    fn registry_rejects_duplicates_and_reports_available() {
        let mut registry = AdapterRegistry::new();
        registry.register(add_two()).unwrap();
        let err = registry.register(add_two()).unwrap_err();
        assert!(matches!(err, AdapterError::DuplicateProgram { name } if name == "add_two"));

        let err = registry.get("missing").unwrap_err();
        assert!(
            matches!(err, AdapterError::ProgramNotFound { available, .. } if available == vec!["add_two".to_owned()])
        );
    }
}
