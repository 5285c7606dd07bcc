//! `race` and `call`: §4.5.
//!
//! New file, no teacher counterpart. `race` is implemented entirely on top
//! of `Cx::spawn`/`Cx::wait` and `Resume`'s own idempotence (§4.1: "exactly
//! one of (resume, abort) takes effect") rather than any dedicated runtime
//! surface: each racer is spawned as a child of one coordinator Frame, and
//! whichever racer calls the shared `Resume` first wins — every later call
//! is a guaranteed no-op. The coordinator Frame settling with that result
//! is itself what tears down (and so cancels) the rest via the ordinary
//! scope-close path in `runtime.rs`.

use crate::error::RuntimeError;
use crate::frame::{AbortThunk, Cx, Resume};

/// `race([ops...])` — run every op concurrently (each as a child Frame of a
/// fresh nursery scope); the first to settle wins and the rest are halted.
/// Enqueue-order is the tie-break for simultaneous completions, i.e. `ops`
/// earlier in the slice win ties (best-effort: true simultaneity can't
/// occur under this runtime's one-event-at-a-time driver, so in practice
/// the tie-break only matters for ops that settle synchronously before any
/// of them suspend).
pub fn race<T, F>(cx: &mut Cx, ops: Vec<F>) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
{
    let coordinator = cx.spawn(move |coord_cx| race_in_fresh_scope(coord_cx, ops))?;
    coordinator.join()
}

fn race_in_fresh_scope<T, F>(coord_cx: &mut Cx, ops: Vec<F>) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
{
    coord_cx.wait(move |coord_cx, resume: Resume<Result<T, RuntimeError>>| -> AbortThunk {
        for op in ops {
            let winner = resume.clone();
            // Admission can only fail if this coordinator's own scope is
            // already closing (an ancestor halted the whole race), in
            // which case the coordinator's `wait()` is about to be
            // unblocked with `Halted` directly and this racer never
            // mattered.
            let _ = coord_cx.spawn(move |child_cx| -> Result<(), RuntimeError> {
                let outcome = op(child_cx);
                winner.resume(outcome);
                Ok(())
            });
        }
        Box::new(|| {})
    })?
}

/// Something this runtime can await the settlement of without owning it —
/// a host future/promise bridge (§9 "Promise integration", §6 "External
/// cancellation bridge"). `subscribe` must call `on_settle` at most once,
/// safely from any thread: it only ever needs to reach `Resume::resume`,
/// which just enqueues onto the runtime's external-event channel.
pub trait HostPromise<T: Send + 'static>: Send + 'static {
    fn subscribe(
        self: Box<Self>,
        on_settle: Box<dyn FnOnce(Result<T, RuntimeError>) + Send>,
    ) -> AbortThunk;
}

/// `call(promise)` — the promise-bridging half of §4.5's `call`: wait on
/// the host promise's settlement, propagating whatever outcome it reports.
pub fn call<T>(cx: &mut Cx, promise: Box<dyn HostPromise<T>>) -> Result<T, RuntimeError>
where
    T: Send + 'static,
{
    cx.wait(move |_cx, resume: Resume<Result<T, RuntimeError>>| {
        promise.subscribe(Box::new(move |result| resume.resume(result)))
    })?
}

/// `call(op)` — the op-bridging half of §4.5's `call`: inline-execute,
/// propagating the outcome as-is. Trivial, but named to mirror `call`'s
/// two-shaped input at call sites that accept either.
pub fn call_op<T, F>(cx: &mut Cx, op: F) -> Result<T, RuntimeError>
where
    F: FnOnce(&mut Cx) -> Result<T, RuntimeError>,
{
    op(cx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::task::run;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn race_returns_first_completion_and_cancels_loser_timer() {
        let loser_fired = Arc::new(AtomicBool::new(false));
        let loser_fired2 = Arc::clone(&loser_fired);

        let task = run(RuntimeConfig::default(), move |cx| {
            race(
                cx,
                vec![
                    Box::new(move |cx: &mut Cx| {
                        crate::timer::sleep(cx, Duration::from_millis(5))?;
                        Ok::<u32, RuntimeError>(1)
                    }) as Box<dyn FnOnce(&mut Cx) -> Result<u32, RuntimeError> + Send>,
                    Box::new(move |cx: &mut Cx| {
                        crate::timer::sleep(cx, Duration::from_millis(500))?;
                        loser_fired2.store(true, Ordering::SeqCst);
                        Ok::<u32, RuntimeError>(2)
                    }),
                ],
            )
        });
        assert_eq!(task.join().unwrap(), 1);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!loser_fired.load(Ordering::SeqCst));
    }

    #[test]
    fn race_surfaces_first_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let task = run(RuntimeConfig::default(), move |cx| {
            race(
                cx,
                vec![
                    Box::new(move |cx: &mut Cx| {
                        crate::timer::sleep(cx, Duration::from_millis(5))?;
                        Err::<u32, RuntimeError>(RuntimeError::user(Boom))
                    }) as Box<dyn FnOnce(&mut Cx) -> Result<u32, RuntimeError> + Send>,
                    Box::new(move |cx: &mut Cx| {
                        crate::timer::sleep(cx, Duration::from_millis(500))?;
                        Ok::<u32, RuntimeError>(2)
                    }),
                ],
            )
        });
        let err = task.join().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
