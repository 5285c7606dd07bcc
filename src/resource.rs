//! Resource-with-provide: §4.4.
//!
//! No teacher counterpart (`aria-runtime` has no acquire/release primitive).
//! Built directly on `frame::Cx::wait`/`Cx::spawn`/`Cx::suspend`: the caller
//! parks in a `wait()` whose registrar spawns the provider as a child Frame
//! of the caller's own scope; the provider's one `Provide::call` both
//! resumes the caller and parks the provider (via `suspend()`) until the
//! caller's scope tears down and halts it, which is exactly when its
//! `ensure`-registered cleanup needs to run.

use crate::error::RuntimeError;
use crate::frame::{AbortThunk, Cx, Resume};

/// Handed to a resource body in place of a bare `provide(value)` yield.
/// Consuming `self` by value makes "called more than once" a compile error
/// rather than a `ProtocolError` the runtime has to detect at run time.
pub struct Provide<T: Send + 'static> {
    resume: Resume<T>,
}

impl<T: Send + 'static> Provide<T> {
    pub(crate) fn new(resume: Resume<T>) -> Self {
        Provide { resume }
    }
}

/// `acquire(resource_body)` — run `resource_body` as a child Frame of the
/// caller's own scope and return whatever value it hands back via
/// `provide`. The provider keeps running (parked) until the caller's scope
/// closes, guaranteeing setup and teardown are defined in one place but run
/// at the caller's lifetime boundary (§4.4).
pub fn acquire<T, F>(cx: &mut Cx, body: F) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: FnOnce(&mut Cx, Provide<T>) -> Result<(), RuntimeError> + Send + 'static,
{
    cx.wait(move |cx, resume: Resume<T>| -> AbortThunk {
        let provide = Provide::new(resume);
        // Admission only fails if the caller's own scope is already
        // closing, which can only happen here if an ancestor halted it
        // concurrently with this call — in that case the caller's own
        // `wait()` is about to be unblocked with `Halted` anyway via the
        // normal halt-a-parked-frame path, so dropping the resume handle
        // unfired is harmless.
        let spawned = cx.spawn(move |body_cx| body(body_cx, provide));
        match spawned {
            Ok(handle) => Box::new(move || handle.halt()),
            Err(_) => Box::new(|| {}),
        }
    })
}

/// `provide(value)` — the free-function form used from inside a resource
/// body: `provide(cx, handle, value)?`.
pub fn provide<T: Send + 'static>(
    cx: &mut Cx,
    handle: Provide<T>,
    value: T,
) -> Result<std::convert::Infallible, RuntimeError> {
    handle.resume.resume(value);
    cx.suspend()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::task::run;
    use crate::runtime::RuntimeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn resource_teardown_happens_once_after_caller_returns() {
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = Arc::clone(&closes);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_provider = Arc::clone(&order);
        let order_caller = Arc::clone(&order);

        let task = run(RuntimeConfig::default(), move |cx| {
            let socket = acquire(cx, move |body_cx, handle| {
                order_provider.lock().unwrap().push("connect");
                body_cx.ensure(move |_cx| {
                    closes2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                provide(body_cx, handle, 7u32)?;
                unreachable!("provider only resumes via halt, which short-circuits via `?`");
            })?;
            assert_eq!(socket, 7);
            order_caller.lock().unwrap().push("return");
            Ok::<_, RuntimeError>(())
        });
        task.join().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["connect", "return"]);
    }
}
