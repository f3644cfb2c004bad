//! Foreign-function boundary for callbridge.
//!
//! Externally compiled array programs enter the host through the
//! [`ForeignFn`] contract and are bound into immutable [`ExternalProgram`]
//! handles. A handle validates every call against the provider's declared
//! parameter constraints, and can be specialized into a
//! [`CompiledArtifact`] for one abstract signature so repeat calls skip
//! inference entirely.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod closure;
pub mod error;
pub mod program;
pub mod provider;

pub use artifact::CompiledArtifact;
pub use closure::ClosureProgram;
pub use error::ForeignError;
pub use program::ExternalProgram;
pub use provider::{ForeignFn, ParamSpec, ShapeConstraint};
