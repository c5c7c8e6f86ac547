//! Per-thread task queue
//!
//! A thread that wants work (typically completion callbacks) delivered back to
//! itself creates a [`RunLoop`] and pumps it. While the loop is alive,
//! [`TaskRunner::current`] on that thread returns a cloneable handle other
//! threads use to post tasks into it.

use async_channel::{Receiver, Sender, unbounded};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::thread::{self, Thread, ThreadId};
use std::time::{Duration, Instant};
use tracing::trace;

/// A unit of work posted to a run loop
pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<TaskRunner>> = const { RefCell::new(None) };
}

/// Posting handle for one thread's run loop
#[derive(Clone)]
pub struct TaskRunner {
    tx: Sender<Task>,
    thread: Thread,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("thread", &self.thread.id())
            .field("name", &self.thread.name())
            .finish()
    }
}

impl TaskRunner {
    /// Runner of the run loop registered on the calling thread, if any
    pub fn current() -> Option<TaskRunner> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Queue a task on the owning thread
    ///
    /// Hands the task back if the run loop has been dropped.
    pub fn post(&self, task: Task) -> std::result::Result<(), Task> {
        self.tx.try_send(task).map_err(|e| e.into_inner())?;
        self.thread.unpark();
        Ok(())
    }

    /// Thread that runs the posted tasks
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        self.thread.id() == thread::current().id()
    }
}

/// Task loop owned by one thread
///
/// Not `Send`: it must be pumped by the thread that created it.
pub struct RunLoop {
    rx: Receiver<Task>,
    runner: TaskRunner,
    _not_send: PhantomData<*const ()>,
}

impl RunLoop {
    /// Create and register a run loop for the calling thread
    pub fn new() -> crate::Result<Self> {
        if TaskRunner::current().is_some() {
            return Err(crate::Error::RunLoop(
                "thread already has a run loop".to_string(),
            ));
        }

        let (tx, rx) = unbounded();
        let runner = TaskRunner {
            tx,
            thread: thread::current(),
        };
        CURRENT.with(|current| *current.borrow_mut() = Some(runner.clone()));

        Ok(Self {
            rx,
            runner,
            _not_send: PhantomData,
        })
    }

    pub fn runner(&self) -> TaskRunner {
        self.runner.clone()
    }

    /// Run every task already queued; returns how many ran
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        if ran > 0 {
            trace!("Run loop executed {} tasks", ran);
        }
        ran
    }

    /// Pump tasks until `done` holds or `timeout` elapses
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_until_idle();
            if done() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.rx.is_empty() {
                thread::park_timeout(deadline - now);
            }
        }
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        // Later posts bounce back to their sender; queued tasks still run.
        self.rx.close();
        CURRENT.with(|current| current.borrow_mut().take());
        self.run_until_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_current_runner_registration() {
        assert!(TaskRunner::current().is_none());
        {
            let run_loop = RunLoop::new().unwrap();
            let runner = TaskRunner::current().unwrap();
            assert_eq!(runner.thread_id(), run_loop.runner().thread_id());
            assert!(runner.runs_tasks_on_current_thread());
            assert!(RunLoop::new().is_err());
        }
        assert!(TaskRunner::current().is_none());
    }

    #[test]
    fn test_tasks_run_on_owning_thread() {
        let run_loop = RunLoop::new().unwrap();
        let runner = run_loop.runner();
        let owner = thread::current().id();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        thread::spawn(move || {
            let task: Task = Box::new(move || {
                assert_eq!(thread::current().id(), owner);
                h.fetch_add(1, Ordering::SeqCst);
            });
            assert!(runner.post(task).is_ok());
        })
        .join()
        .unwrap();

        assert!(run_loop.run_until(
            || hits.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn test_run_until_times_out() {
        let run_loop = RunLoop::new().unwrap();
        let start = Instant::now();
        assert!(!run_loop.run_until(|| false, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_post_after_drop_returns_task() {
        let runner = {
            let run_loop = RunLoop::new().unwrap();
            run_loop.runner()
        };
        let task: Task = Box::new(|| {});
        assert!(runner.post(task).is_err());
    }

    #[test]
    fn test_drop_runs_queued_tasks() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let run_loop = RunLoop::new().unwrap();
            let h = hits.clone();
            let task: Task = Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
            assert!(run_loop.runner().post(task).is_ok());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
