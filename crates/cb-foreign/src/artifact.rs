//! Compiled artifacts: opaque executables specialized to one abstract
//! signature (and mapped-argument mask). Owned by the signature cache for
//! the process lifetime.

use cb_core::{AbstractSignature, AbstractValue, ArrayValue};

use crate::error::ForeignError;
use crate::program::ExternalProgram;

#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    program: ExternalProgram,
    signature: AbstractSignature,
    mapped: Vec<bool>,
    out_aval: AbstractValue,
}

impl CompiledArtifact {
    pub(crate) fn new(
        program: ExternalProgram,
        signature: AbstractSignature,
        mapped: Vec<bool>,
        out_aval: AbstractValue,
    ) -> Self {
        Self {
            program,
            signature,
            mapped,
            out_aval,
        }
    }

    #[must_use]
    pub fn program_name(&self) -> &str {
        self.program.name()
    }

    #[must_use]
    pub fn signature(&self) -> &AbstractSignature {
        &self.signature
    }

    #[must_use]
    pub fn mapped(&self) -> &[bool] {
        &self.mapped
    }

    fn is_mapped(&self) -> bool {
        self.mapped.iter().any(|&m| m)
    }

    /// Output descriptor fixed at compile time.
    #[must_use]
    pub fn out_aval(&self) -> &AbstractValue {
        &self.out_aval
    }

    fn check_call_signature(&self, args: &[ArrayValue]) -> Result<(), ForeignError> {
        let actual = AbstractSignature::of_args(args);
        if actual != self.signature {
            return Err(ForeignError::SignatureMismatch {
                expected: self.signature.canonical_fingerprint(),
                actual: actual.canonical_fingerprint(),
            });
        }
        Ok(())
    }

    fn check_output(&self, at: &str, out: &ArrayValue) -> Result<(), ForeignError> {
        if out.aval() != self.out_aval {
            // Concrete evaluation contradicting the compiled descriptor is
            // an abstract-eval soundness violation, not a caller error.
            return Err(ForeignError::ShapeMismatch {
                at: at.to_owned(),
                expected: AbstractSignature::new([self.out_aval.clone()]).canonical_fingerprint(),
                actual: AbstractSignature::new([out.aval()]).canonical_fingerprint(),
            });
        }
        Ok(())
    }

    /// Execute on arguments matching the compiled signature exactly.
    pub fn call(&self, args: &[ArrayValue]) -> Result<ArrayValue, ForeignError> {
        self.check_call_signature(args)?;
        let out = if self.is_mapped() {
            self.program.evaluate_mapped(args, &self.mapped)
        } else {
            self.program.evaluate(args)
        }?;
        self.check_output("output", &out)?;
        Ok(out)
    }

    /// Execute the tangent specialization. Primals and tangents must both
    /// match the compiled signature.
    pub fn call_with_tangent(
        &self,
        primals: &[ArrayValue],
        tangents: &[ArrayValue],
    ) -> Result<(ArrayValue, ArrayValue), ForeignError> {
        self.check_call_signature(primals)?;
        self.check_call_signature(tangents)?;
        let (primal, tangent) = if self.is_mapped() {
            self.program
                .evaluate_with_tangent_mapped(primals, tangents, &self.mapped)
        } else {
            self.program.evaluate_with_tangent(primals, tangents)
        }?;
        self.check_output("output", &primal)?;
        // The tangent mirrors the primal output descriptor.
        self.check_output("tangent", &tangent)?;
        Ok((primal, tangent))
    }
}
