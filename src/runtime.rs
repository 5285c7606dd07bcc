//! The scheduler: arena ownership, the external-event bridge, and the
//! single driver loop that realizes cooperative, strictly-serial execution
//! on top of one OS thread per Frame.
//!
//! No direct teacher counterpart; closest analogues are
//! `aria-runtime/src/executor.rs`'s `CONFIG: OnceLock<RuntimeConfig>`
//! global (here, an owned `RuntimeConfig` on `Runtime` — global state isn't
//! needed once the arena itself is the shared handle) and
//! `timer.rs::WheelInner`'s tick loop, which this module's external-event
//! channel generalizes to any host-originated wake-up, not just timers.
//!
//! # The driver
//!
//! Exactly one logical authority ever puts a value into a Frame's
//! `to_frame` rendezvous and then blocks reading its `to_scheduler`: the
//! driver. There is only ever one driver OS thread alive per `Runtime`
//! (spawned by `run`/`main`/`createScope` in `task.rs`), but "the driver"
//! is a role, not a fixed call frame — `dispatch_sync` recurses into itself
//! (still on that one thread) whenever a Frame's own scope needs closing,
//! which is how a deeply nested halt during scope teardown composes
//! without a second thread ever touching the arena.
//!
//! Three kinds of event reach a Frame: a message that arrived through
//! `external` (crossbeam-channel; anything a foreign thread, a timer, or a
//! same-runtime `Resume::resume()` call enqueues), a direct halt/error
//! injected by `close_scope`/`interrupt_frame` while the driver is already
//! active (bypassing the channel so it can block for the result inline),
//! and the continuation handed back into a Frame after its own scope
//! closes (`Report::BodySettled` → `Report::Done`).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::error::RuntimeError;
use crate::frame::{
    self, AbortThunk, BoxedBody, Cx, FrameState, Injected, Outcome, Phase, Report, StepResult,
};
use crate::id::{FrameId, ScopeId};
use crate::scope::{LocalKey, ScopeLifecycle, ScopeState};

pub(crate) type CleanupFn = Box<dyn FnOnce(&mut Cx) -> StepResult + Send>;

/// Runtime-wide knobs, mirroring the shape of the teacher's
/// `RuntimeConfig` (`aria-runtime/src/lib.rs`) with one addition
/// (`timer_resolution`) for the adapted timer wheel.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) thread_name_prefix: String,
    pub(crate) stack_size: Option<usize>,
    pub(crate) timer_resolution: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            thread_name_prefix: "ward-frame".to_string(),
            stack_size: None,
            timer_resolution: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn with_timer_resolution(mut self, resolution: Duration) -> Self {
        self.timer_resolution = resolution;
        self
    }
}

struct ExternalMsg {
    frame: FrameId,
    generation: u64,
    injected: Injected,
}

/// Everything that can reach the single driver thread through the shared
/// channel: either a Frame wake-up, or a request to tear a detached scope
/// down. Folding `destroy()` into this enum (rather than running it
/// synchronously on whatever thread calls it) keeps "only one thread ever
/// dispatches against this `Runtime`" true even for a `createScope` nursery,
/// whose driver thread otherwise has no other reason to be interrupted.
enum DriverWork {
    Frame(ExternalMsg),
    CloseScope {
        scope: ScopeId,
        reply: Arc<frame::Rendezvous<Option<RuntimeError>>>,
    },
}

struct Inner {
    frames: Slab<FrameState>,
    scopes: Slab<ScopeState>,
}

/// Owns the Frame/Scope arenas and the external-event bridge. One
/// `Runtime` backs one `run`/`main`/`createScope` call; every `Task`,
/// `Cx`, and `Scope` handle created from it shares this `Arc`.
pub struct Runtime {
    inner: Mutex<Inner>,
    /// Each Frame's `ensure`-registered cleanup stack, LIFO, kept apart
    /// from the arena proper since it's drained on the Frame's own thread
    /// (`drain_cleanups`) rather than under the scheduler's dispatch lock.
    cleanups: Mutex<HashMap<FrameId, Vec<CleanupFn>>>,
    sender: Sender<DriverWork>,
    receiver: Receiver<DriverWork>,
    /// Signalled whenever a Frame reaches `Closed`, so a non-driving caller
    /// (`ScopedTask::join`) can block without itself becoming a second
    /// dispatcher on `receiver`.
    completion: parking_lot::Condvar,
    config: RuntimeConfig,
}

impl Runtime {
    pub(crate) fn new(config: RuntimeConfig) -> Arc<Runtime> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new(Runtime {
            inner: Mutex::new(Inner {
                frames: Slab::new(),
                scopes: Slab::new(),
            }),
            cleanups: Mutex::new(HashMap::new()),
            sender,
            receiver,
            completion: parking_lot::Condvar::new(),
            config,
        })
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ---- arena accessors used by `frame.rs` -----------------------------

    pub(crate) fn frame_to_frame(&self, frame: FrameId) -> Arc<frame::Rendezvous<Injected>> {
        Arc::clone(&self.inner.lock().frames[frame.0].to_frame)
    }

    fn frame_to_scheduler(&self, frame: FrameId) -> Arc<frame::Rendezvous<Report>> {
        Arc::clone(&self.inner.lock().frames[frame.0].to_scheduler)
    }

    pub(crate) fn frame_own_scope(&self, frame: FrameId) -> ScopeId {
        self.inner.lock().frames[frame.0].own_scope
    }

    pub(crate) fn take_pending_halt(&self, frame: FrameId) -> bool {
        let mut inner = self.inner.lock();
        let f = &mut inner.frames[frame.0];
        std::mem::replace(&mut f.pending_halt, false)
    }

    pub(crate) fn take_pending_error(&self, frame: FrameId) -> Option<RuntimeError> {
        self.inner.lock().frames[frame.0].pending_error.take()
    }

    pub(crate) fn next_generation(&self, frame: FrameId) -> u64 {
        let mut inner = self.inner.lock();
        let f = &mut inner.frames[frame.0];
        f.generation += 1;
        f.generation
    }

    pub(crate) fn park(&self, frame: FrameId, abort_thunk: AbortThunk) {
        let mut inner = self.inner.lock();
        let f = &mut inner.frames[frame.0];
        f.abort_thunk = Some(abort_thunk);
    }

    pub(crate) fn unpark(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        inner.frames[frame.0].abort_thunk = None;
    }

    pub(crate) fn report(&self, frame: FrameId, report: Report) {
        self.frame_to_scheduler(frame).put(report);
    }

    pub(crate) fn push_cleanup(&self, frame: FrameId, cleanup: CleanupFn) {
        self.cleanups.lock().entry(frame).or_default().push(cleanup);
    }

    pub(crate) fn drain_cleanups(&self, frame: FrameId, cx: &mut Cx, outcome: Outcome) -> Outcome {
        let stack = self.cleanups.lock().remove(&frame).unwrap_or_default();
        let mut outcome = outcome;
        for cleanup in stack.into_iter().rev() {
            match cleanup(cx) {
                Ok(_) => {}
                Err(cleanup_error) => {
                    outcome = match outcome {
                        Outcome::Errored(during) => Outcome::Errored(RuntimeError::Cleanup {
                            during: Box::new(during),
                            cleanup_error: Box::new(cleanup_error),
                        }),
                        Outcome::Halted => Outcome::Errored(RuntimeError::Cleanup {
                            during: Box::new(RuntimeError::Halted),
                            cleanup_error: Box::new(cleanup_error),
                        }),
                        Outcome::Returned(_) => Outcome::Errored(cleanup_error),
                    };
                }
            }
        }
        outcome
    }

    pub(crate) fn admit(self: &Arc<Self>, scope: ScopeId, body: BoxedBody) -> Result<FrameId, ()> {
        let frame_id = {
            let mut inner = self.inner.lock();
            if !inner.scopes[scope.0].is_open() {
                return Err(());
            }
            let to_frame = Arc::new(frame::Rendezvous::new());
            let to_scheduler = Arc::new(frame::Rendezvous::new());

            let frame_entry = inner.frames.vacant_entry();
            let frame_id = FrameId(frame_entry.key());
            let own_scope_id =
                ScopeId(inner.scopes.insert(ScopeState::new(Some(scope), Some(frame_id))) as usize);
            frame_entry.insert(FrameState {
                parent_scope: Some(scope),
                own_scope: own_scope_id,
                phase: Phase::Fresh,
                pending_halt: false,
                pending_error: None,
                abort_thunk: None,
                to_frame,
                to_scheduler,
                thread: None,
                generation: 0,
                outcome: None,
            });
            inner.scopes[scope.0].children.push(frame_id);
            frame_id
        };
        self.start_frame_thread(frame_id, body);
        self.enqueue_resume(frame_id, 0, Injected::Resume(Box::new(())));
        Ok(frame_id)
    }

    fn start_frame_thread(self: &Arc<Self>, frame_id: FrameId, body: BoxedBody) {
        let handle = frame::spawn_frame_thread(
            Arc::clone(self),
            frame_id,
            body,
            &self.config.thread_name_prefix,
            self.config.stack_size,
        );
        self.inner.lock().frames[frame_id.0].thread = Some(handle);
    }

    pub(crate) fn local_get<T: Clone + Send + 'static>(
        &self,
        scope: ScopeId,
        key: LocalKey<T>,
    ) -> Option<T> {
        let inner = self.inner.lock();
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let s = &inner.scopes[id.0];
            if let Some(boxed) = s.locals.get(&key.raw()) {
                return boxed.downcast_ref::<T>().cloned();
            }
            cur = s.parent;
        }
        None
    }

    pub(crate) fn local_set<T: Send + 'static>(&self, scope: ScopeId, key: LocalKey<T>, value: T) {
        let mut inner = self.inner.lock();
        inner.scopes[scope.0]
            .locals
            .insert(key.raw(), Box::new(value) as Box<dyn Any + Send>);
    }

    pub(crate) fn enqueue_resume(&self, frame: FrameId, generation: u64, injected: Injected) {
        let _ = self.sender.send(DriverWork::Frame(ExternalMsg {
            frame,
            generation,
            injected,
        }));
    }

    // ---- the driver ------------------------------------------------------

    /// Deliver one event to `frame_id` and drive it until it next parks or
    /// fully closes, recursing into scope-teardown as needed. Always
    /// called from the single driver thread (top-level, or nested inside
    /// another `dispatch_sync` call's teardown handling).
    fn dispatch_sync(&self, frame_id: FrameId, generation: u64, injected: Injected) {
        let to_frame = {
            let mut inner = self.inner.lock();
            let f = &mut inner.frames[frame_id.0];
            if f.is_closed() {
                trace!(%frame_id, "dropping event for already-closed frame");
                return;
            }
            if f.generation != generation {
                trace!(%frame_id, "dropping stale event (frame moved to a new wake)");
                return;
            }
            let injected = if let Some(err) = f.pending_error.take() {
                Injected::Errored(err)
            } else if std::mem::replace(&mut f.pending_halt, false) {
                Injected::Halted
            } else {
                injected
            };
            f.phase = Phase::Running;
            (Arc::clone(&f.to_frame), injected)
        };
        let (to_frame, injected) = to_frame;
        to_frame.put(injected);
        self.drive_until_parked_or_closed(frame_id);
    }

    /// Block on `frame_id`'s report and act on it; loops internally across
    /// the `BodySettled → close own scope → Done` handoff.
    fn drive_until_parked_or_closed(&self, frame_id: FrameId) {
        loop {
            let to_scheduler = self.frame_to_scheduler(frame_id);
            match to_scheduler.take_blocking() {
                Report::Suspended => {
                    self.inner.lock().frames[frame_id.0].phase = Phase::Parked;
                    return;
                }
                Report::BodySettled(raw_outcome) => {
                    self.inner.lock().frames[frame_id.0].phase = Phase::TearingDown;
                    let own_scope = self.frame_own_scope(frame_id);
                    self.close_scope(own_scope);
                    let final_outcome =
                        self.apply_child_failure_policy(own_scope, raw_outcome);
                    self.frame_to_frame(frame_id)
                        .put(Injected::Resume(Box::new(final_outcome)));
                    continue;
                }
                Report::Done(outcome) => {
                    self.on_frame_done(frame_id, outcome);
                    return;
                }
            }
        }
    }

    /// Drain the external-event channel, dispatching each message, until
    /// `done` holds. Used both as the top-level driver loop (`done` never
    /// holds until the root settles, or, for a detached scope, until the
    /// scope closes) and, recursively, to await a specific Frame reaching
    /// `Closed` after it has been halted out-of-band.
    pub(crate) fn pump_until(&self, done: impl Fn() -> bool) {
        while !done() {
            match self.receiver.recv() {
                Ok(work) => self.dispatch_work(work),
                Err(_) => break,
            }
        }
    }

    fn dispatch_work(&self, work: DriverWork) {
        match work {
            DriverWork::Frame(msg) => self.dispatch_sync(msg.frame, msg.generation, msg.injected),
            DriverWork::CloseScope { scope, reply } => {
                self.close_scope(scope);
                let error = self.inner.lock().scopes[scope.0].first_error.take();
                reply.put(error);
            }
        }
    }

    /// Request that a detached scope be torn down, and block until it has.
    /// Never runs the teardown itself — hands the work to the scope's
    /// single driver thread through the same channel every Frame wake-up
    /// goes through, so a `createScope` nursery never gets torn down by a
    /// second thread racing its own driver.
    pub(crate) fn request_close_scope(&self, scope: ScopeId) -> Option<RuntimeError> {
        let reply = Arc::new(frame::Rendezvous::new());
        if self
            .sender
            .send(DriverWork::CloseScope {
                scope,
                reply: Arc::clone(&reply),
            })
            .is_err()
        {
            return None;
        }
        reply.take_blocking()
    }

    /// Block the calling thread (never the driver itself) until `frame`
    /// reaches `Closed`, without polling `receiver`. Used by `ScopedTask`,
    /// whose Frame is driven by a detached scope's own background driver
    /// thread rather than one it owns.
    pub(crate) fn await_frame_closed(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        while !inner.frames[frame.0].is_closed() {
            self.completion.wait(&mut inner);
        }
    }

    /// Halt an existing (possibly not-yet-started) Frame and block until it
    /// reaches `Closed`. Only ever called from the driver thread (from
    /// `close_scope`'s reverse-order teardown).
    fn halt_and_await_closed(&self, frame_id: FrameId) {
        let deliver = {
            let mut inner = self.inner.lock();
            let f = &mut inner.frames[frame_id.0];
            if f.is_closed() {
                return;
            }
            f.generation += 1;
            let thunk = f.abort_thunk.take();
            f.phase = Phase::Running;
            (Arc::clone(&f.to_frame), thunk)
        };
        let (to_frame, thunk) = deliver;
        if let Some(t) = thunk {
            t();
        }
        to_frame.put(Injected::Halted);
        self.drive_until_parked_or_closed(frame_id);
        self.pump_until(|| self.inner.lock().frames[frame_id.0].is_closed());
    }

    /// External entry point (`Task::halt`, `ChildHandle::halt`): may be
    /// called from any thread, including one with no business driving the
    /// scheduler. If the Frame is actively running synchronous user code
    /// right now, all this can safely do is flag it — `Cx::wait`'s
    /// pre-check picks the flag up at the Frame's next suspension point.
    /// If it's already parked, the flag is backed by an immediate abort +
    /// injection so cancellation doesn't wait for an unrelated timeout.
    pub(crate) fn request_halt(&self, frame_id: FrameId) {
        let action = {
            let mut inner = self.inner.lock();
            let f = &mut inner.frames[frame_id.0];
            if f.is_closed() {
                return;
            }
            f.pending_halt = true;
            if f.phase == Phase::Parked {
                f.generation += 1;
                let thunk = f.abort_thunk.take();
                Some((Arc::clone(&f.to_frame), thunk))
            } else {
                None
            }
        };
        if let Some((to_frame, thunk)) = action {
            if let Some(t) = thunk {
                t();
            }
            to_frame.put(Injected::Halted);
        }
    }

    /// Close `scope_id`: halt every child in reverse insertion order,
    /// strictly serially (§4.2 "Halt ordering"). Idempotent — a scope
    /// already `closing`/`closed` (because a child error got there first)
    /// is left alone.
    fn close_scope(&self, scope_id: ScopeId) {
        let children = {
            let mut inner = self.inner.lock();
            let scope = &mut inner.scopes[scope_id.0];
            if !scope.is_open() {
                return;
            }
            scope.lifecycle = ScopeLifecycle::Closing;
            scope.children.clone()
        };
        for child in children.into_iter().rev() {
            self.halt_and_await_closed(child);
        }
        self.inner.lock().scopes[scope_id.0].lifecycle = ScopeLifecycle::Closed;
    }

    /// After `scope_id` has closed, fold any recorded child error into
    /// `raw_outcome` per §4.2: a successful or halted body outcome is
    /// overridden by an unrecovered child error; an already-errored body
    /// outcome keeps its own error and suppresses the child's.
    fn apply_child_failure_policy(&self, scope_id: ScopeId, raw_outcome: Outcome) -> Outcome {
        let child_error = self.inner.lock().scopes[scope_id.0].first_error.take();
        match (raw_outcome, child_error) {
            (Outcome::Errored(body_err), Some(child_err)) if body_err.same_origin(&child_err) => {
                // The driving Frame already observed this exact error
                // through an explicit `.join()?` and is propagating it
                // itself; folding `child_err` in again would suppress a
                // clone of `body_err` onto itself. Keep only whatever else
                // raced it.
                let outcome = child_err
                    .suppressed()
                    .iter()
                    .cloned()
                    .fold(body_err, RuntimeError::with_suppressed);
                Outcome::Errored(outcome)
            }
            (Outcome::Errored(body_err), Some(child_err)) => {
                Outcome::Errored(body_err.with_suppressed(child_err))
            }
            (_, Some(child_err)) => Outcome::Errored(child_err),
            (outcome, None) => outcome,
        }
    }

    /// Handle a Frame's `Done` report: record its outcome and, on an
    /// unrecovered error, fold it into its parent scope's bookkeeping and
    /// begin closing the scope / notifying the driving Frame (§4.2, §7).
    fn on_frame_done(&self, frame_id: FrameId, outcome: Outcome) {
        let (parent_scope, error) = {
            let mut inner = self.inner.lock();
            let f = &mut inner.frames[frame_id.0];
            f.phase = Phase::Closed;
            let error = outcome.as_error().cloned();
            f.outcome = Some(outcome);
            (f.parent_scope, error)
        };
        self.completion.notify_all();
        let Some(error) = error else { return };

        let Some(scope_id) = parent_scope else {
            warn!(%frame_id, "root frame errored with no parent scope to report to");
            return;
        };

        let was_open = {
            let mut inner = self.inner.lock();
            let scope = &mut inner.scopes[scope_id.0];
            let was_open = scope.is_open();
            scope.record_error(error);
            was_open
        };

        if was_open {
            self.close_scope(scope_id);
            self.notify_driving_frame(scope_id);
        }
        // If the scope was already closing, whatever triggered that will
        // pick up `first_error` via `apply_child_failure_policy` itself.
    }

    /// Deliver the scope's recorded error to its driving Frame right now,
    /// if it isn't already mid-teardown on the same call stack (in which
    /// case `apply_child_failure_policy` will see it naturally).
    fn notify_driving_frame(&self, scope_id: ScopeId) {
        let driving_frame = self.inner.lock().scopes[scope_id.0].driving_frame;
        let Some(frame_id) = driving_frame else {
            return; // detached scope (createScope) — surfaced via destroy()
        };
        let phase = self.inner.lock().frames[frame_id.0].phase;
        if phase != Phase::Parked {
            // Running (still executing body) or TearingDown (already past
            // BodySettled, already on this call stack closing this very
            // scope): nothing to inject now, it'll be picked up naturally.
            return;
        }
        let error = self.inner.lock().scopes[scope_id.0].first_error.take();
        let Some(error) = error else { return };
        let deliver = {
            let mut inner = self.inner.lock();
            let f = &mut inner.frames[frame_id.0];
            if f.is_closed() || f.phase != Phase::Parked {
                inner.scopes[scope_id.0].first_error = Some(error);
                return;
            }
            f.generation += 1;
            let thunk = f.abort_thunk.take();
            f.phase = Phase::Running;
            (Arc::clone(&f.to_frame), thunk, error)
        };
        let (to_frame, thunk, error) = deliver;
        if let Some(t) = thunk {
            t();
        }
        to_frame.put(Injected::Errored(error));
        self.drive_until_parked_or_closed(frame_id);
    }

    // ---- root / detached-scope bootstrap ---------------------------------

    /// Create the root Frame for `run`/`main`: a Frame with no parent scope
    /// of its own, driving a fresh nursery. Enqueues its kickoff but does
    /// not drive it — the caller spawns the dedicated driver thread that
    /// pumps it to completion (`task.rs::run`).
    pub(crate) fn new_root_frame(self: &Arc<Self>, body: BoxedBody) -> FrameId {
        let frame_id = {
            let mut inner = self.inner.lock();
            let to_frame = Arc::new(frame::Rendezvous::new());
            let to_scheduler = Arc::new(frame::Rendezvous::new());
            let entry = inner.frames.vacant_entry();
            let frame_id = FrameId(entry.key());
            let own_scope = ScopeId(
                inner
                    .scopes
                    .insert(ScopeState::new(None, Some(frame_id))) as usize,
            );
            entry.insert(FrameState {
                parent_scope: None,
                own_scope,
                phase: Phase::Fresh,
                pending_halt: false,
                pending_error: None,
                abort_thunk: None,
                to_frame,
                to_scheduler,
                thread: None,
                generation: 0,
                outcome: None,
            });
            frame_id
        };
        self.start_frame_thread(frame_id, body);
        self.enqueue_resume(frame_id, 0, Injected::Resume(Box::new(())));
        debug!(%frame_id, "root frame created");
        frame_id
    }

    pub(crate) fn create_detached_scope(&self) -> ScopeId {
        let mut inner = self.inner.lock();
        ScopeId(inner.scopes.insert(ScopeState::new(None, None)) as usize)
    }

    pub(crate) fn is_frame_closed(&self, frame: FrameId) -> bool {
        self.inner.lock().frames[frame.0].is_closed()
    }

    pub(crate) fn is_scope_closed(&self, scope: ScopeId) -> bool {
        matches!(
            self.inner.lock().scopes[scope.0].lifecycle,
            ScopeLifecycle::Closed
        )
    }

    /// Take a closed Frame's outcome. Panics if called before the Frame
    /// closes; callers (`Task::join`, `ChildHandle::join`, `ScopedTask::join`)
    /// always wait for it to close first, via `pump_until` or
    /// `await_frame_closed`.
    pub(crate) fn take_frame_outcome(&self, frame: FrameId) -> Outcome {
        self.inner.lock().frames[frame.0]
            .outcome
            .take()
            .expect("frame outcome requested before it closed")
    }
}
