//! Entry points and outward-facing handles: `run`, `main`, `createScope`,
//! and the `Task`/`ChildHandle`/`ScopedTask` types joining/halting resolve
//! through.
//!
//! Rewritten from `aria-runtime/src/task.rs`. The teacher's `TaskInner`
//! (`Mutex<TaskState>` + `Mutex<Option<Result<T, TaskError>>>` + `Condvar`)
//! is the exact rendezvous idiom `frame::Rendezvous` generalizes; what
//! doesn't survive is per-task thread ownership — a `Task` here is a thin
//! handle into the runtime's arena, not an owner of a thread itself (the
//! Frame's own OS thread, spawned in `frame.rs`, outlives any particular
//! handle to it).

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::error::RuntimeError;
use crate::frame::{BoxedBody, Cx, Outcome};
use crate::id::{FrameId, ScopeId};
use crate::runtime::{Runtime, RuntimeConfig};

fn downcast_outcome<T: 'static>(outcome: Outcome) -> Result<T, RuntimeError> {
    match outcome {
        Outcome::Returned(v) => Ok(*v
            .downcast::<T>()
            .expect("frame outcome type mismatch against its handle's T")),
        Outcome::Errored(e) => Err(e),
        Outcome::Halted => Err(RuntimeError::Halted),
    }
}

fn box_body<T, F>(body: F) -> BoxedBody
where
    T: Send + 'static,
    F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
{
    Box::new(move |cx| body(cx).map(|v| Box::new(v) as Box<dyn Any + Send>))
}

/// A handle to a top-level computation started by `run`/`main`. Owns the
/// dedicated driver thread that pumps this Frame (and everything it
/// spawns) to completion.
pub struct Task<T> {
    runtime: Arc<Runtime>,
    frame: FrameId,
    driver: Option<thread::JoinHandle<()>>,
    _marker: PhantomData<T>,
}

impl<T: Send + 'static> Task<T> {
    fn spawn_driver(runtime: Arc<Runtime>, frame: FrameId) -> Self {
        let driver_runtime = Arc::clone(&runtime);
        let driver = thread::Builder::new()
            .name("ward-driver".to_string())
            .spawn(move || {
                driver_runtime.pump_until(|| driver_runtime.is_frame_closed(frame));
            })
            .expect("failed to spawn driver thread");
        Task {
            runtime,
            frame,
            driver: Some(driver),
            _marker: PhantomData,
        }
    }

    /// Request cooperative cancellation of the whole task tree rooted
    /// here. Returns immediately; the tree tears down on its own time.
    pub fn halt(&self) {
        self.runtime.request_halt(self.frame);
    }

    /// Block until the task (its whole tree) has settled, and return its
    /// outcome.
    pub fn join(mut self) -> Result<T, RuntimeError> {
        self.runtime
            .pump_until(|| self.runtime.is_frame_closed(self.frame));
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        downcast_outcome(self.runtime.take_frame_outcome(self.frame))
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // `join()` already consumed `self` in the common path; a
            // dropped-without-joining Task still needs its driver thread
            // reclaimed so the process can exit cleanly.
            let _ = driver.join();
        }
    }
}

/// A handle to a child Frame spawned via `Cx::spawn`. Does not own a
/// driver thread — the same driver that's already pumping its ancestors
/// also pumps this Frame, since it's a member of one of their scopes.
pub struct ChildHandle<T> {
    runtime: Arc<Runtime>,
    frame: FrameId,
    _marker: PhantomData<T>,
}

impl<T: Send + 'static> ChildHandle<T> {
    pub(crate) fn new(runtime: Arc<Runtime>, frame: FrameId) -> Self {
        ChildHandle {
            runtime,
            frame,
            _marker: PhantomData,
        }
    }

    pub fn halt(&self) {
        self.runtime.request_halt(self.frame);
    }

    /// Block the calling Frame until this child settles. Must be called
    /// from within another Frame's body (it drives the shared external
    /// channel exactly like any other blocking primitive would), not from
    /// outside the runtime.
    pub fn join(self) -> Result<T, RuntimeError> {
        self.runtime
            .pump_until(|| self.runtime.is_frame_closed(self.frame));
        downcast_outcome(self.runtime.take_frame_outcome(self.frame))
    }
}

/// `run(computation)` — start a fresh runtime with `computation` as the
/// root Frame and return a `Task` handle to it (§6).
pub fn run<T, F>(config: RuntimeConfig, computation: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
{
    let runtime = Runtime::new(config);
    let frame = runtime.new_root_frame(box_body(computation));
    debug!(%frame, "run() started");
    Task::spawn_driver(runtime, frame)
}

/// `main(computation)` — like `run`, but installs handlers for SIGINT and
/// SIGTERM that halt the root task, so host process signals become
/// ordinary cooperative cancellation instead of an abrupt kill (§6).
pub fn main<T, F>(config: RuntimeConfig, computation: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
{
    let task = run(config, computation);
    install_signal_halt(&task);
    task
}

fn install_signal_halt<T: Send + 'static>(task: &Task<T>) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, "failed to install SIGINT/SIGTERM handler");
            return;
        }
    };
    let frame = task.frame;
    let runtime = Arc::clone(&task.runtime);
    let _ = thread::Builder::new()
        .name("ward-signal-watch".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                debug!(sig, "received host interrupt, halting root task");
                runtime.request_halt(frame);
            }
        });
}

/// A handle to a computation admitted into a detached scope via
/// `Scope::run`. Unlike `Task`, does not own a driver thread of its own —
/// the scope's single background driver (spawned once by `create_scope`)
/// is already pumping this Frame, same as every other Frame admitted into
/// that scope. `join` therefore waits passively instead of competing with
/// that driver for the shared external channel.
pub struct ScopedTask<T> {
    runtime: Arc<Runtime>,
    frame: FrameId,
    _marker: PhantomData<T>,
}

impl<T: Send + 'static> ScopedTask<T> {
    fn new(runtime: Arc<Runtime>, frame: FrameId) -> Self {
        ScopedTask {
            runtime,
            frame,
            _marker: PhantomData,
        }
    }

    pub fn halt(&self) {
        self.runtime.request_halt(self.frame);
    }

    /// Block until this computation (its whole tree) has settled, and
    /// return its outcome.
    pub fn join(self) -> Result<T, RuntimeError> {
        self.runtime.await_frame_closed(self.frame);
        downcast_outcome(self.runtime.take_frame_outcome(self.frame))
    }
}

/// A detached scope created via `createScope`: a nursery with no driving
/// Frame of its own, only ever torn down by an explicit `destroy()` call
/// (§4.3). A single background driver thread, spawned once by
/// `create_scope`, pumps every Frame ever admitted into it — `scope.run`
/// hands its admitted Frame to that one driver rather than starting a
/// second one, since two independent drivers racing the same `Runtime`'s
/// channel could dispatch two different Frames at once.
pub struct Scope {
    runtime: Arc<Runtime>,
    scope: ScopeId,
}

impl Scope {
    /// `scope.run(computation)` — admit `computation` as a Frame in this
    /// scope and return a handle driven by the scope's existing background
    /// driver thread.
    pub fn run<T, F>(&self, computation: F) -> Result<ScopedTask<T>, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Cx) -> Result<T, RuntimeError> + Send + 'static,
    {
        let frame = self
            .runtime
            .admit(self.scope, box_body(computation))
            .map_err(|_| RuntimeError::ScopeClosed)?;
        Ok(ScopedTask::new(Arc::clone(&self.runtime), frame))
    }
}

/// `createScope()` — a nursery independent of any enclosing Frame body,
/// for hosting long-lived work whose lifetime is managed externally (a
/// server's listener loop, a connection pool). Returns the scope handle
/// and a `destroy` thunk that halts every child in reverse order and
/// surfaces whatever error (if any) they left behind (§4.3).
pub fn create_scope(config: RuntimeConfig) -> (Scope, impl FnOnce() -> Option<RuntimeError>) {
    let runtime = Runtime::new(config);
    let scope = runtime.create_detached_scope();

    let driver_runtime = Arc::clone(&runtime);
    thread::Builder::new()
        .name("ward-scope-driver".to_string())
        .spawn(move || {
            driver_runtime.pump_until(|| driver_runtime.is_scope_closed(scope));
        })
        .expect("failed to spawn scope driver thread");

    let destroy_runtime = Arc::clone(&runtime);
    let destroy = move || destroy_runtime.request_close_scope(scope);
    (Scope { runtime, scope }, destroy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_simple_value() {
        let task = run(RuntimeConfig::default(), |_cx| Ok::<_, RuntimeError>(42));
        assert_eq!(task.join().unwrap(), 42);
    }

    #[test]
    fn run_propagates_user_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let task = run(RuntimeConfig::default(), |_cx| -> Result<(), RuntimeError> {
            Err(RuntimeError::user(Boom))
        });
        let err = task.join().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn spawn_child_and_join_from_parent() {
        let task = run(RuntimeConfig::default(), |cx| {
            let child = cx.spawn(|_cx| Ok::<_, RuntimeError>(7))?;
            child.join()
        });
        assert_eq!(task.join().unwrap(), 7);
    }

    #[test]
    fn create_scope_runs_and_destroys() {
        let (scope, destroy) = create_scope(RuntimeConfig::default());
        let task = scope.run(|_cx| Ok::<_, RuntimeError>(1)).unwrap();
        assert_eq!(task.join().unwrap(), 1);
        assert!(destroy().is_none());
    }
}
