//! Error types for the runtime.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Every way a Frame's outcome can resolve to something other than a plain
/// return value.
///
/// One enum carries all of the error kinds from the error handling design:
/// a user error, a halt, a closed-scope admission failure, a runtime
/// protocol violation, and a cleanup-time error. Keeping them in a single
/// `thiserror` enum means propagation paths are exhaustively matched at
/// compile time instead of living behind a trait object.
///
/// `Clone`able (the `source` is `Arc`, not `Box`) because an unrecovered
/// child error is simultaneously the scope's `first_error` and that
/// child's own settled outcome — both need to be independently readable.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Thrown from user code. Carries a chain of errors that raced it and
    /// lost: "first wins, rest suppressed" (see DESIGN.md open questions).
    #[error("{source}")]
    User {
        source: Arc<dyn std::error::Error + Send + Sync>,
        suppressed: Vec<RuntimeError>,
    },

    /// Cooperative cancellation. Not a failure; a distinct terminal state.
    #[error("halted")]
    Halted,

    /// Admission into a scope that is already `closing` or `closed`.
    #[error("scope closed")]
    ScopeClosed,

    /// Misuse of the runtime itself: two concurrent `next()` waiters on one
    /// subscription, `provide` called outside a resource body, and so on.
    /// Fatal to the offending Frame; propagates like a user error.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// An error raised while draining a Frame's cleanup stack. Attached to
    /// whatever outcome was already in flight rather than replacing it.
    #[error("cleanup error: {cleanup_error} (while settling: {during})")]
    Cleanup {
        during: Box<RuntimeError>,
        cleanup_error: Box<RuntimeError>,
    },

    /// A spawned Frame's thread panicked.
    #[error("panic: {0}")]
    Panicked(String),
}

impl RuntimeError {
    /// Wrap an arbitrary user error with no suppressed causes.
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RuntimeError::User {
            source: Arc::new(err),
            suppressed: Vec::new(),
        }
    }

    /// Wrap a user error carrying a string message (for sites that don't
    /// have a concrete `std::error::Error` on hand).
    pub fn message(msg: impl Into<String>) -> Self {
        RuntimeError::user(Message(msg.into()))
    }

    /// Attach `other` as a suppressed cause of `self`. Used when a second
    /// concurrent child error arrives after the first has already been
    /// recorded as the scope's driving error.
    pub fn with_suppressed(mut self, other: RuntimeError) -> Self {
        match &mut self {
            RuntimeError::User { suppressed, .. } => {
                suppressed.push(other);
                self
            }
            _ => {
                // Non-User variants (Halted, ScopeClosed, ...) have no
                // suppressed-chain slot; fold by wrapping both in a User.
                RuntimeError::User {
                    source: Arc::new(Message(self.to_string())),
                    suppressed: vec![other],
                }
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, RuntimeError::Halted)
    }

    /// Whether `self` and `other` trace back to the same underlying
    /// failure rather than two distinct errors that happen to look alike.
    /// `User` sources are compared by `Arc` identity, since cloning a
    /// `RuntimeError` (to park a copy on a scope's `first_error` while the
    /// original keeps propagating through an explicit `.join()`) shares the
    /// same `Arc` rather than allocating a new one.
    pub(crate) fn same_origin(&self, other: &RuntimeError) -> bool {
        match (self, other) {
            (RuntimeError::User { source: a, .. }, RuntimeError::User { source: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (RuntimeError::Halted, RuntimeError::Halted) => true,
            (RuntimeError::ScopeClosed, RuntimeError::ScopeClosed) => true,
            (RuntimeError::ProtocolError(a), RuntimeError::ProtocolError(b)) => a == b,
            (RuntimeError::Panicked(a), RuntimeError::Panicked(b)) => a == b,
            _ => false,
        }
    }

    /// All suppressed causes attached to this error, if any.
    pub fn suppressed(&self) -> &[RuntimeError] {
        match self {
            RuntimeError::User { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wraps_and_displays() {
        let err = RuntimeError::message("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn with_suppressed_chains_onto_user() {
        let first = RuntimeError::message("first");
        let second = RuntimeError::message("second");
        let combined = first.with_suppressed(second);
        assert_eq!(combined.suppressed().len(), 1);
        assert_eq!(combined.suppressed()[0].to_string(), "second");
    }

    #[test]
    fn with_suppressed_on_non_user_folds_into_user() {
        let combined = RuntimeError::ScopeClosed.with_suppressed(RuntimeError::Halted);
        assert_eq!(combined.suppressed().len(), 1);
        assert!(combined.suppressed()[0].is_halted());
    }

    #[test]
    fn halted_is_not_an_error_kind_mistaken_for_user() {
        assert!(RuntimeError::Halted.is_halted());
        assert!(!RuntimeError::ScopeClosed.is_halted());
    }

    #[test]
    fn same_origin_follows_arc_identity_not_message() {
        let err = RuntimeError::message("boom");
        let clone = err.clone();
        assert!(err.same_origin(&clone));

        let lookalike = RuntimeError::message("boom");
        assert!(!err.same_origin(&lookalike));
    }
}
