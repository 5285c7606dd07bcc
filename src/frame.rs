//! The Frame: a single cooperative computation.
//!
//! A Frame is realized as one dedicated OS thread parked on a pair of
//! rendezvous channels (`Mutex<Option<T>> + Condvar`, the same idiom the
//! teacher uses for `TaskInner`/`ScopedTaskInner` in `task.rs`/`scope.rs`).
//! The thread only ever does two things: run user code, or block waiting
//! to be told to run more user code. Because the runtime thread (see
//! `runtime.rs`) only ever unblocks one Frame at a time and waits for that
//! Frame to report back before unblocking another, at most one Frame's
//! user code is ever executing — DESIGN NOTES §9 option (c) ("OS-thread-
//! per-Frame parked on condition variables") realized directly.
//!
//! A Frame's own scope (the nursery holding whatever it `spawn`s) must be
//! fully torn down before the Frame's own cleanup stack drains (a function
//! doesn't return until its children have). So a Frame's thread reports in
//! two stages: `BodySettled` once its body produces a raw outcome, then
//! blocks again for the runtime to hand back a (possibly child-error-
//! overridden) outcome to carry into its own cleanup drain, then `Done`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::RuntimeError;
use crate::id::{FrameId, ScopeId};
use crate::runtime::Runtime;

/// A thunk the runtime invokes to cancel whatever a `wait` registrar set up
/// (clear a timer, unsubscribe a listener, ...).
pub type AbortThunk = Box<dyn FnOnce() + Send>;

/// A boxed user computation, type-erased at the Frame boundary per
/// DESIGN NOTES §9 ("Dynamic dispatch across heterogeneous computations").
pub(crate) type BoxedBody = Box<dyn FnOnce(&mut Cx) -> StepResult + Send>;

/// What a user body (or a cleanup closure) produces: a value to box into
/// the outcome, or a propagated error/halt.
pub(crate) type StepResult = Result<Box<dyn Any + Send>, RuntimeError>;

/// A terminal Frame outcome, per §3's `returned(v) | errored(e) | halted`.
pub enum Outcome {
    Returned(Box<dyn Any + Send>),
    Errored(RuntimeError),
    Halted,
}

impl Outcome {
    pub(crate) fn from_step(result: StepResult) -> Self {
        match result {
            Ok(v) => Outcome::Returned(v),
            Err(e) if e.is_halted() => Outcome::Halted,
            Err(e) => Outcome::Errored(e),
        }
    }

    pub(crate) fn as_error(&self) -> Option<&RuntimeError> {
        match self {
            Outcome::Errored(e) => Some(e),
            _ => None,
        }
    }
}

/// What the scheduler hears back after unblocking a Frame for one step.
pub(crate) enum Report {
    /// The Frame parked again (it called `wait`); nothing more to do now.
    Suspended,
    /// The body has produced a raw outcome; the Frame is now blocked
    /// waiting for its own scope to close before it can drain its own
    /// cleanup stack.
    BodySettled(Outcome),
    /// The Frame (body, own scope, and cleanup stack) has fully settled.
    Done(Outcome),
}

/// What is delivered to a parked Frame to unblock it.
pub(crate) enum Injected {
    Resume(Box<dyn Any + Send>),
    Halted,
    /// An unrecovered child error, injected at this Frame's next
    /// suspension point (§4.2).
    Errored(RuntimeError),
}

/// `Mutex<Option<T>> + Condvar`, the teacher's rendezvous idiom
/// (`aria-runtime/src/task.rs::TaskInner`), reused as the primitive both
/// directions of Frame/scheduler handoff are built from.
pub(crate) struct Rendezvous<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Rendezvous<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn put(&self, value: T) {
        let mut slot = self.slot.lock();
        *slot = Some(value);
        self.ready.notify_one();
    }

    pub(crate) fn take_blocking(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Frame lifecycle, per §4.5's state machine:
/// `fresh → running ⇄ parked → tearing-down → closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Fresh,
    Running,
    Parked,
    TearingDown,
    Closed,
}

/// Everything the runtime keeps about one Frame, held in the arena behind
/// `Runtime::inner`.
pub(crate) struct FrameState {
    pub(crate) parent_scope: Option<ScopeId>,
    pub(crate) own_scope: ScopeId,
    pub(crate) phase: Phase,
    pub(crate) pending_halt: bool,
    pub(crate) pending_error: Option<RuntimeError>,
    pub(crate) abort_thunk: Option<AbortThunk>,
    pub(crate) to_frame: Arc<Rendezvous<Injected>>,
    pub(crate) to_scheduler: Arc<Rendezvous<Report>>,
    pub(crate) thread: Option<thread::JoinHandle<()>>,
    /// Bumped every time this Frame's next wake-up changes identity: the
    /// initial spawn kickoff, each `wait()`'s resume, and any direct
    /// halt/error injection that bypasses the external-event channel. A
    /// channel message carries the generation it was enqueued against; if
    /// it no longer matches by the time it's popped, the frame has moved
    /// on to a different wake since and the message is dropped as stale.
    pub(crate) generation: u64,
    /// Set once `Done` has been reported; lets external joiners and
    /// `close_scope` tell "settled" apart from "still in flight".
    pub(crate) outcome: Option<Outcome>,
}

impl FrameState {
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }
}

/// The per-Frame handle user bodies and cleanup closures run with.
///
/// `Cx` carries no state of its own beyond which Frame it is and a handle
/// to the runtime; every primitive method is a thin wrapper that either
/// mutates shared arena state directly (for the synchronous suspension
/// descriptors: `spawn`, `register_cleanup`, `scope_local_get/set`) or goes
/// through `wait` (the one descriptor that actually blocks this thread).
pub struct Cx {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) frame: FrameId,
}

impl Cx {
    pub(crate) fn new(runtime: Arc<Runtime>, frame: FrameId) -> Self {
        Cx { runtime, frame }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame
    }

    pub(crate) fn own_scope(&self) -> ScopeId {
        self.runtime.frame_own_scope(self.frame)
    }

    /// `wait(registrar)`. `registrar` receives this `Cx` (so it can issue
    /// further primitives, e.g. `acquire` spawning its provider from inside
    /// a `wait` call) and a `Resume` handle; it returns the abort thunk.
    ///
    /// Returns `Err` immediately, without parking at all, if this Frame
    /// already has a halt or an unrecovered child error pending from the
    /// moment `wait` was called — the short-circuit that makes halting or
    /// erroring an actively-running Frame safe (`Runtime::interrupt_frame`
    /// only has to set a flag in that case, not reach into a running
    /// thread).
    pub fn wait<T, F>(&mut self, registrar: F) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Cx, Resume<T>) -> AbortThunk,
    {
        if let Some(err) = self.runtime.take_pending_error(self.frame) {
            return Err(err);
        }
        if self.runtime.take_pending_halt(self.frame) {
            return Err(RuntimeError::Halted);
        }

        let generation = self.runtime.next_generation(self.frame);
        let resume = Resume::new(Arc::clone(&self.runtime), self.frame, generation);
        let abort_thunk = registrar(self, resume);
        self.runtime.park(self.frame, abort_thunk);

        let to_frame = self.runtime.frame_to_frame(self.frame);
        self.runtime.report(self.frame, Report::Suspended);
        let injected = to_frame.take_blocking();
        self.runtime.unpark(self.frame);

        match injected {
            Injected::Halted => Err(RuntimeError::Halted),
            Injected::Errored(e) => Err(e),
            Injected::Resume(boxed) => Ok(*boxed
                .downcast::<T>()
                .expect("resume value type mismatch for this wait()")),
        }
    }

    /// `suspend()` — parks until halted; registers no resume path at all.
    pub fn suspend(&mut self) -> Result<std::convert::Infallible, RuntimeError> {
        self.wait(|_cx, _resume: Resume<std::convert::Infallible>| {
            Box::new(|| {}) as AbortThunk
        })
    }

    /// `register-cleanup(thunk)` — push onto the LIFO cleanup stack and
    /// return immediately; no suspension.
    pub fn ensure<F>(&mut self, cleanup: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&mut Cx) -> Result<(), RuntimeError> + Send + 'static,
    {
        self.runtime.push_cleanup(
            self.frame,
            Box::new(move |cx| cleanup(cx).map(|()| Box::new(()) as Box<dyn Any + Send>)),
        );
        Ok(())
    }

    /// `spawn(computation)` — admit a new child Frame into this Frame's own
    /// scope and immediately return a handle; does not suspend the caller.
    pub fn spawn<T, F>(&mut self, body: F) -> Result<crate::task::ChildHandle<T>, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
    {
        let boxed: BoxedBody =
            Box::new(move |cx| body(cx).map(|v| Box::new(v) as Box<dyn Any + Send>));
        let frame_id = self
            .runtime
            .admit(self.own_scope(), boxed)
            .map_err(|_| RuntimeError::ScopeClosed)?;
        Ok(crate::task::ChildHandle::new(
            Arc::clone(&self.runtime),
            frame_id,
        ))
    }

    /// Scope-local get: walks up the parent chain from this Frame's own
    /// scope until a binding is found.
    pub fn local_get<T: Clone + Send + 'static>(
        &self,
        key: crate::scope::LocalKey<T>,
    ) -> Option<T> {
        self.runtime.local_get(self.own_scope(), key)
    }

    /// Scope-local set, installed on this Frame's own scope.
    pub fn local_set<T: Send + 'static>(&mut self, key: crate::scope::LocalKey<T>, value: T) {
        self.runtime.local_set(self.own_scope(), key, value);
    }
}

/// Resolves a parked Frame's `wait()`. `resume` is idempotent across clones
/// of the same handle (`fired` guards that); staleness against a Frame that
/// has since moved on to a different wake entirely is a separate check the
/// runtime makes against `generation` when the message is delivered.
pub struct Resume<T> {
    runtime: Arc<Runtime>,
    frame: FrameId,
    generation: u64,
    fired: Arc<AtomicBool>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + 'static> Resume<T> {
    pub(crate) fn new(runtime: Arc<Runtime>, frame: FrameId, generation: u64) -> Self {
        Resume {
            runtime,
            frame,
            generation,
            fired: Arc::new(AtomicBool::new(false)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Resolve the Frame's `wait()` with `value`. Safe to call from any
    /// thread, including a foreign host callback thread: this only ever
    /// enqueues onto the runtime's external-event channel, never touches
    /// stepper state directly (§5 "Suspension points").
    pub fn resume(self, value: T) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runtime.enqueue_resume(
            self.frame,
            self.generation,
            Injected::Resume(Box::new(value)),
        );
    }

    /// Whether this handle (or one of its clones) has already fired.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl<T> Clone for Resume<T> {
    fn clone(&self) -> Self {
        Resume {
            runtime: Arc::clone(&self.runtime),
            frame: self.frame,
            generation: self.generation,
            fired: Arc::clone(&self.fired),
            _marker: std::marker::PhantomData,
        }
    }
}

/// Spawn the dedicated OS thread for a fresh Frame. The thread blocks on
/// its own `to_frame` rendezvous for the initial go-ahead (or an immediate
/// halt, if this Frame was halted before it ever ran), runs `body` to a raw
/// outcome (catching panics, per the teacher's `executor::spawn`
/// convention), reports `BodySettled` and waits for the runtime to close
/// this Frame's own scope and hand back a final outcome, then drains the
/// cleanup stack and reports `Done`.
pub(crate) fn spawn_frame_thread(
    runtime: Arc<Runtime>,
    frame_id: FrameId,
    body: BoxedBody,
    thread_name_prefix: &str,
    stack_size: Option<usize>,
) -> thread::JoinHandle<()> {
    let thread_name = format!("{}-{}", thread_name_prefix, frame_id);
    let mut builder = thread::Builder::new().name(thread_name);
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }

    builder
        .spawn(move || {
            let to_frame = runtime.frame_to_frame(frame_id);
            let mut cx = Cx::new(Arc::clone(&runtime), frame_id);

            let raw_outcome = match to_frame.take_blocking() {
                Injected::Halted => Outcome::Halted,
                Injected::Errored(e) => Outcome::Errored(e),
                Injected::Resume(_) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut cx)));
                    match result {
                        Ok(step_result) => Outcome::from_step(step_result),
                        Err(panic) => Outcome::Errored(RuntimeError::Panicked(panic_message(panic))),
                    }
                }
            };

            runtime.report(frame_id, Report::BodySettled(raw_outcome));
            let settled_outcome = match to_frame.take_blocking() {
                Injected::Resume(boxed) => *boxed
                    .downcast::<Outcome>()
                    .expect("runtime handed back a non-Outcome continuation"),
                Injected::Halted => Outcome::Halted,
                Injected::Errored(e) => Outcome::Errored(e),
            };

            let final_outcome = runtime.drain_cleanups(frame_id, &mut cx, settled_outcome);
            runtime.report(frame_id, Report::Done(final_outcome));
        })
        .expect("failed to spawn frame thread")
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn rendezvous_put_then_take() {
        let r: Rendezvous<u32> = Rendezvous::new();
        r.put(7);
        assert_eq!(r.take_blocking(), 7);
    }

    #[test]
    fn rendezvous_blocks_until_put_from_another_thread() {
        let r = Arc::new(Rendezvous::<u32>::new());
        let r2 = Arc::clone(&r);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);

        let handle = thread::spawn(move || {
            let v = r2.take_blocking();
            seen2.store(v as usize, Ordering::SeqCst);
        });

        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        r.put(42);
        handle.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }
}
