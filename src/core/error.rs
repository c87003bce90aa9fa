// ============================================================================
// trellis - Error Types
// Failure modes of the reactive runtime
// ============================================================================

use thiserror::Error;

/// Errors produced by the reactive runtime.
///
/// Fallible entry points come in pairs: `try_get`/`try_set` return these,
/// while the plain `get`/`set` wrappers panic with the same message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    /// A write happened where state changes are forbidden: inside a computed
    /// value's getter, or outside an action while strict mode is enabled.
    #[error(
        "state mutation of '{name}' is not allowed here; \
         wrap the write in an action or disable strict mode"
    )]
    StateMutationDisallowed { name: String },

    /// A computed value read itself, directly or through other derivations.
    #[error("cycle detected while computing '{name}': a computed value cannot depend on itself")]
    CycleDetected { name: String },

    /// The reaction queue kept refilling itself for too many passes.
    #[error(
        "reactions did not converge after {iterations} iterations; \
         '{name}' keeps scheduling new work from its own side effects"
    )]
    ReactionDivergence { name: String, iterations: u32 },

    /// Internal bookkeeping inconsistency or invalid configuration.
    #[error("reactive graph invariant violated: {message}")]
    InvariantViolation { message: String },

    /// A computed value's getter panicked. The error is memoized and
    /// returned from every read until one of the inputs changes.
    #[error("computed value '{name}' failed: {message}")]
    ComputedPanicked { name: String, message: String },
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, ReactiveError>;
