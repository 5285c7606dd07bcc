//! ward - a structured concurrency runtime.
//!
//! Structured concurrency means a task's lifetime is always bounded by the
//! scope that spawned it: a scope cannot finish closing until every task it
//! owns has either returned or been halted and fully torn down, and
//! cancellation/errors propagate deterministically through that same scope
//! tree rather than leaking to unrelated tasks.
//!
//! # Kernel
//!
//! - [`frame::Cx`] - per-task context: `wait`, `spawn`, `ensure`, scope-local
//!   state.
//! - [`scope`] - the tree node owning child frames and scope-local state.
//! - [`runtime::Runtime`] - the single-threaded cooperative scheduler that
//!   drives frames one suspension point at a time.
//! - [`task::Task`] / [`task::ScopedTask`] / [`task::run`] / [`task::main`]
//!   / [`task::create_scope`] - external entry points and handles.
//! - [`error::RuntimeError`] - the unified error type; first error wins,
//!   later concurrent errors are suppressed onto it.
//!
//! # Derived primitives
//!
//! - [`timer::sleep`]
//! - [`race::race`] / [`race::call`]
//! - [`resource::acquire`] / [`resource::provide`]
//! - [`signal::use_abort_signal`]
//! - [`channel::Channel`] / [`channel::Subscription`] / [`channel::Stream`]
//!   / [`channel::Signal`] / [`channel::each`]
//!
//! None of these need any scheduler support beyond `Cx::wait`/`Cx::spawn`/
//! `Cx::ensure` and `Resume`'s own idempotence; they're built entirely on
//! the kernel surface above.

pub mod channel;
pub mod error;
pub mod frame;
pub mod id;
pub mod race;
pub mod resource;
pub mod runtime;
pub mod scope;
pub mod signal;
pub mod task;
pub mod timer;

pub use channel::{each, Channel, Item, Signal, Stream, Subscription};
pub use error::RuntimeError;
pub use frame::{AbortThunk, Cx, Outcome, Resume};
pub use id::{FrameId, ScopeId};
pub use race::{call, call_op, race, HostPromise};
pub use resource::{acquire, provide, Provide};
pub use runtime::{Runtime, RuntimeConfig};
pub use scope::LocalKey;
pub use signal::{use_abort_signal, AbortController, AbortSignal};
pub use task::{create_scope, main, run, ChildHandle, Scope, ScopedTask, Task};
pub use timer::sleep;
