//! Signature-keyed artifact cache.
//!
//! Compilation is memoized per (program, abstract signature, mapped mask):
//! the first caller to present a signature pays the specialization cost,
//! every later caller gets the same `Arc<CompiledArtifact>` back. Entries
//! never expire; artifacts live for the process lifetime.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use cb_core::AbstractSignature;
use cb_foreign::{CompiledArtifact, ExternalProgram, ForeignError};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

/// Deterministic key over everything the specialization depends on.
#[must_use]
pub fn build_cache_key(
    program: &ExternalProgram,
    signature: &AbstractSignature,
    mapped: &[bool],
) -> CacheKey {
    let payload = canonical_payload(program, signature, mapped);
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    CacheKey {
        namespace: "cbx",
        digest_hex: bytes_to_hex(&digest),
    }
}

fn canonical_payload(
    program: &ExternalProgram,
    signature: &AbstractSignature,
    mapped: &[bool],
) -> String {
    let mask = mapped
        .iter()
        .map(|&m| if m { '1' } else { '0' })
        .collect::<String>();
    format!(
        "program={}|signature={}|mapped={}",
        program.name(),
        signature.canonical_fingerprint(),
        mask,
    )
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", byte));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Specialization failed; nothing was cached.
    Compilation { key: CacheKey, source: ForeignError },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compilation { key, source } => {
                write!(f, "compilation failed for {}: {}", key.as_string(), source)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Compilation { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Default)]
struct CompileSlot {
    artifact: Mutex<Option<Arc<CompiledArtifact>>>,
}

/// Process-wide memoization of compiled artifacts.
///
/// The outer map lock is held only to find or insert a slot; compilation
/// runs under the slot's own lock, so concurrent callers with the same
/// signature serialize on that slot while callers with other signatures
/// proceed. A failed compilation leaves no entry behind, so a later call
/// with the same signature retries.
#[derive(Debug, Default)]
pub struct SignatureCache {
    slots: Mutex<FxHashMap<CacheKey, Arc<CompileSlot>>>,
}

impl SignatureCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_or_compile(
        &self,
        program: &ExternalProgram,
        signature: &AbstractSignature,
        mapped: &[bool],
    ) -> Result<Arc<CompiledArtifact>, CacheError> {
        let key = build_cache_key(program, signature, mapped);
        let slot = {
            let mut slots = self.slots.lock().expect("cache map lock poisoned");
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut entry = slot.artifact.lock().expect("cache slot lock poisoned");
        if let Some(artifact) = entry.as_ref() {
            return Ok(Arc::clone(artifact));
        }
        match program.specialize(signature, mapped) {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                *entry = Some(Arc::clone(&artifact));
                Ok(artifact)
            }
            Err(source) => {
                drop(entry);
                let mut slots = self.slots.lock().expect("cache map lock poisoned");
                if let Some(current) = slots.get(&key)
                    && Arc::ptr_eq(current, &slot)
                {
                    slots.remove(&key);
                }
                Err(CacheError::Compilation { key, source })
            }
        }
    }

    /// Number of signatures with a live or in-flight entry.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.slots.lock().expect("cache map lock poisoned").len()
    }
}
