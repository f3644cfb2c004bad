//! Closure-backed providers: bind native Rust functions as foreign
//! programs. This is the binding path used by fixtures and by embedders
//! that already hold a compiled function in-process.

use cb_core::{AbstractValue, ArrayValue};

use crate::error::ForeignError;
use crate::program::ExternalProgram;
use crate::provider::{ForeignFn, ParamSpec};

type EvalFn = dyn Fn(&[ArrayValue]) -> Result<ArrayValue, ForeignError> + Send + Sync;
type AbstractFn = dyn Fn(&[AbstractValue]) -> Result<AbstractValue, ForeignError> + Send + Sync;
type TangentFn =
    dyn Fn(&[ArrayValue], &[ArrayValue]) -> Result<(ArrayValue, ArrayValue), ForeignError>
        + Send
        + Sync;

/// A foreign program backed by Rust closures. Evaluation and abstract
/// evaluation are mandatory; a tangent rule is optional — without one,
/// differentiation fails with DifferentiationUnsupported.
pub struct ClosureProgram {
    name: String,
    params: Vec<ParamSpec>,
    eval: Box<EvalFn>,
    abstract_eval: Box<AbstractFn>,
    tangent: Option<Box<TangentFn>>,
}

impl ClosureProgram {
    pub fn new<E, A>(name: &str, params: Vec<ParamSpec>, eval: E, abstract_eval: A) -> Self
    where
        E: Fn(&[ArrayValue]) -> Result<ArrayValue, ForeignError> + Send + Sync + 'static,
        A: Fn(&[AbstractValue]) -> Result<AbstractValue, ForeignError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            params,
            eval: Box::new(eval),
            abstract_eval: Box::new(abstract_eval),
            tangent: None,
        }
    }

    /// Attach a tangent rule.
    #[must_use]
    pub fn with_tangent<T>(mut self, tangent: T) -> Self
    where
        T: Fn(&[ArrayValue], &[ArrayValue]) -> Result<(ArrayValue, ArrayValue), ForeignError>
            + Send
            + Sync
            + 'static,
    {
        self.tangent = Some(Box::new(tangent));
        self
    }

    /// Finish binding: wrap into the immutable program handle.
    #[must_use]
    pub fn bind(self) -> ExternalProgram {
        ExternalProgram::bind(std::sync::Arc::new(self))
    }
}

impl std::fmt::Debug for ClosureProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureProgram")
            .field("name", &self.name)
            .field("arity", &self.params.len())
            .field("differentiable", &self.tangent.is_some())
            .finish()
    }
}

impl ForeignFn for ClosureProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn evaluate(&self, args: &[ArrayValue]) -> Result<ArrayValue, ForeignError> {
        (self.eval)(args)
    }

    fn abstract_evaluate(&self, avals: &[AbstractValue]) -> Result<AbstractValue, ForeignError> {
        (self.abstract_eval)(avals)
    }

    fn evaluate_with_tangent(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(ArrayValue, ArrayValue), ForeignError> {
        match &self.tangent {
            Some(rule) => rule(primals, tangents),
            None => Err(ForeignError::DifferentiationUnsupported {
                program: self.name.clone(),
                detail: "provider declares no tangent rule".to_owned(),
            }),
        }
    }
}
