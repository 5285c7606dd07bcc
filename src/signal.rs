//! `useAbortSignal`: §4.2 "scope-local state", §6 "external cancellation
//! bridge".
//!
//! New file, no teacher counterpart. The host abort-signal shape described
//! in §6 (`addEventListener('abort', fn)` / `removeEventListener` /
//! readonly `aborted`) is realized as a small observer-list type so host
//! adapters (an HTTP client's cancellation hook, a socket's shutdown path)
//! can be wired to it directly. `use_abort_signal` installs one lazily per
//! scope, keyed by a single process-wide `LocalKey` so that any Frame in a
//! scope's subtree can find its nearest enclosing signal via the normal
//! scope-local parent-chain walk, without having to thread a handle through
//! every call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::frame::Cx;
use crate::scope::LocalKey;

struct Inner {
    aborted: AtomicBool,
    listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// The observer half: readonly `aborted`, `on_abort` in place of
/// `addEventListener('abort', ..)`.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Register a listener to run when this signal fires. Runs immediately,
    /// inline, if the signal has already fired.
    pub fn on_abort<F: FnOnce() + Send + 'static>(&self, f: F) {
        let mut listeners = self.inner.listeners.lock();
        if self.inner.aborted.load(Ordering::Acquire) {
            drop(listeners);
            f();
        } else {
            listeners.push(Box::new(f));
        }
    }
}

/// The controller half: fires the signal exactly once.
pub struct AbortController {
    inner: Arc<Inner>,
}

impl AbortController {
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            listener();
        }
    }
}

fn new_pair() -> (AbortSignal, AbortController) {
    let inner = Arc::new(Inner {
        aborted: AtomicBool::new(false),
        listeners: Mutex::new(Vec::new()),
    });
    (
        AbortSignal {
            inner: Arc::clone(&inner),
        },
        AbortController { inner },
    )
}

fn abort_signal_key() -> LocalKey<AbortSignal> {
    static KEY: OnceLock<LocalKey<AbortSignal>> = OnceLock::new();
    *KEY.get_or_init(LocalKey::new)
}

/// `useAbortSignal()` — lazily install (or return the already-installed)
/// abort signal for this Frame's own scope. A cleanup is registered that
/// fires `abort` when the scope begins teardown, so any code holding the
/// signal (an in-flight HTTP request, say) learns about cancellation at
/// the moment its scope starts closing rather than only once it has fully
/// closed.
pub fn use_abort_signal(cx: &mut Cx) -> Result<AbortSignal, RuntimeError> {
    let key = abort_signal_key();
    if let Some(existing) = cx.local_get(key) {
        return Ok(existing);
    }
    let (signal, controller) = new_pair();
    cx.local_set(key, signal.clone());
    cx.ensure(move |_cx| {
        controller.abort();
        Ok(())
    })?;
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::task::run;
    use std::sync::atomic::Ordering as O;
    use std::sync::Arc;

    #[test]
    fn abort_signal_fires_once_on_scope_teardown() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);

        let task = run(RuntimeConfig::default(), move |cx| {
            let signal = use_abort_signal(cx)?;
            assert!(!signal.aborted());
            signal.on_abort(move || fired2.store(true, O::SeqCst));
            Ok::<_, RuntimeError>(())
        });
        task.join().unwrap();
        assert!(fired.load(O::SeqCst));
    }

    #[test]
    fn repeated_calls_in_same_scope_share_one_signal() {
        let task = run(RuntimeConfig::default(), move |cx| {
            let a = use_abort_signal(cx)?;
            let b = use_abort_signal(cx)?;
            a.on_abort(|| {});
            assert!(!b.aborted());
            Ok::<_, RuntimeError>(())
        });
        task.join().unwrap();
    }
}
