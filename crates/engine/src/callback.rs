//! Completion delivery back to the issuing thread
//!
//! Each request captures a [`CallbackTarget`] on the thread that submitted
//! it. When the I/O thread finishes the request it hands the callback to that
//! target instead of running it in place, so a caller with its own run loop
//! (or tokio runtime) gets its callbacks where it issued the calls.

use common::{Task, TaskRunner};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error};

use crate::transfer::ResultCallback;

/// Where a completion callback runs
#[derive(Debug, Clone)]
pub enum CallbackTarget {
    /// Posted to the issuing thread's [`common::RunLoop`]
    RunLoop(TaskRunner),
    /// Spawned onto the tokio runtime the request was issued from
    Runtime(tokio::runtime::Handle),
    /// Run directly on the I/O thread
    Inline,
}

impl CallbackTarget {
    /// Target for the calling thread
    ///
    /// A run loop registered on this thread wins over an ambient tokio
    /// runtime; with neither, callbacks run on the I/O thread.
    pub fn capture() -> Self {
        if let Some(runner) = TaskRunner::current() {
            return CallbackTarget::RunLoop(runner);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => CallbackTarget::Runtime(handle),
            Err(_) => CallbackTarget::Inline,
        }
    }

    /// Run `task` on this target
    ///
    /// A task whose destination is gone runs inline rather than being lost.
    pub fn deliver(&self, task: Task) {
        match self {
            CallbackTarget::RunLoop(runner) => {
                if let Err(task) = runner.post(task) {
                    debug!("Run loop of {:?} is gone, running callback inline", runner);
                    run_inline(task);
                }
            }
            CallbackTarget::Runtime(handle) => {
                let guard = DeliveryGuard(Some(task));
                handle.spawn(async move { guard.run() });
            }
            CallbackTarget::Inline => run_inline(task),
        }
    }

    /// Deliver the outcome of a device control operation
    pub fn deliver_result(&self, callback: ResultCallback, success: bool) {
        self.deliver(Box::new(move || callback(success)));
    }
}

/// Runs its task when dropped unless it already ran
///
/// A runtime that is shutting down drops spawned futures without polling
/// them; the callback still fires.
struct DeliveryGuard(Option<Task>);

impl DeliveryGuard {
    fn run(mut self) {
        if let Some(task) = self.0.take() {
            task();
        }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            debug!("Runtime dropped a completion callback, running it inline");
            run_inline(task);
        }
    }
}

fn run_inline(task: Task) {
    if let Err(e) = catch_unwind(AssertUnwindSafe(task)) {
        error!("Panic in completion callback: {:?}", e);
    }
}
