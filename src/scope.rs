//! The Scope: a node in the task tree.
//!
//! Rewritten from `aria-runtime/src/scope.rs`. The teacher's `Scope` owns a
//! `CancelToken`, an active-child count, and a first-error slot, and tears
//! its children down via `Drop` — that shape survives here. What doesn't
//! survive is the teacher's actual teardown mechanics: `Scope::join_all`
//! joins every child thread concurrently, which is exactly the "parallel
//! execution" §1 rules out. Halting here is driven entirely by
//! `Runtime::halt_frame`/`Runtime::close_scope` in `runtime.rs`, strictly
//! serially in reverse insertion order (§4.2 "Halt ordering").

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RuntimeError;
use crate::id::FrameId;

/// Scope lifecycle: `open → closing → closed` (§4.5). `closing` is entered
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeLifecycle {
    Open,
    Closing,
    Closed,
}

/// An opaque key into a scope's local map, generated per call site (the
/// pattern `useAbortSignal` uses to lazily install its cleanup entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalKey<T> {
    id: u64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> LocalKey<T> {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        LocalKey {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            _marker: std::marker::PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> u64 {
        self.id
    }
}

impl<T> Default for LocalKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the runtime keeps about one Scope, held in the arena behind
/// `Runtime::inner`.
pub(crate) struct ScopeState {
    pub(crate) parent: Option<crate::id::ScopeId>,
    /// The Frame this scope belongs to: an unrecovered child error is
    /// injected here at its next suspension point (§4.2). `None` for a
    /// detached scope created via `createScope`, which has no driving body
    /// to inject into — its error is surfaced through `destroy()` instead.
    pub(crate) driving_frame: Option<FrameId>,
    /// Children in insertion order; halted in reverse on teardown.
    pub(crate) children: Vec<FrameId>,
    pub(crate) lifecycle: ScopeLifecycle,
    pub(crate) first_error: Option<RuntimeError>,
    pub(crate) locals: HashMap<u64, Box<dyn Any + Send>>,
}

impl ScopeState {
    pub(crate) fn new(parent: Option<crate::id::ScopeId>, driving_frame: Option<FrameId>) -> Self {
        ScopeState {
            parent,
            driving_frame,
            children: Vec::new(),
            lifecycle: ScopeLifecycle::Open,
            first_error: None,
            locals: HashMap::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.lifecycle, ScopeLifecycle::Open)
    }

    /// Record a child error under "first wins, rest suppressed" (§9).
    pub(crate) fn record_error(&mut self, err: RuntimeError) {
        match self.first_error.take() {
            None => self.first_error = Some(err),
            Some(first) => self.first_error = Some(first.with_suppressed(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_key_ids_are_unique() {
        let a: LocalKey<u32> = LocalKey::new();
        let b: LocalKey<u32> = LocalKey::new();
        assert_ne!(a.raw(), b.raw());
    }

    #[test]
    fn record_error_first_wins_rest_suppressed() {
        let mut scope = ScopeState::new(None, Some(FrameId(0)));
        scope.record_error(RuntimeError::message("first"));
        scope.record_error(RuntimeError::message("second"));
        let err = scope.first_error.take().unwrap();
        assert_eq!(err.to_string(), "first");
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(err.suppressed()[0].to_string(), "second");
    }
}
