//! Deferred work unit executed by group threads.
//!
//! A `Task` pairs a *run* action with a *finalize* action. A worker
//! executes run first, then finalize, on the same thread. Finalize is
//! the reclaim step: it fires even when run panics, so resources tied
//! to the task are always released exactly once.
//!
//! Tasks are produced by callbacks and timer owners, pushed through a
//! group's work queue or timer heap, and consumed by exactly one
//! worker. Taking a task out of its slot leaves an empty task behind;
//! an empty task executes as a no-op.

/// A deferred unit of work: run action plus finalize action.
pub struct Task {
    run: Option<Box<dyn FnOnce() + Send>>,
    finalize: Option<Box<dyn FnOnce() + Send>>,
}

impl Task {
    /// Create a task with separate run and finalize actions.
    pub fn new<R, F>(run: R, finalize: F) -> Self
    where
        R: FnOnce() + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            run: Some(Box::new(run)),
            finalize: Some(Box::new(finalize)),
        }
    }

    /// Create a task with only a run action.
    pub fn from_fn<R>(run: R) -> Self
    where
        R: FnOnce() + Send + 'static,
    {
        Self {
            run: Some(Box::new(run)),
            finalize: None,
        }
    }

    /// An empty task. Executing it does nothing.
    pub fn empty() -> Self {
        Self {
            run: None,
            finalize: None,
        }
    }

    /// True when there is no run action (the task was moved from or
    /// created empty).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.run.is_none()
    }

    /// Move the task out, leaving an empty one behind.
    #[inline]
    pub fn take(&mut self) -> Task {
        std::mem::take(self)
    }

    /// Run the task, then finalize it. Finalize also runs when the run
    /// action panics (the panic continues to propagate afterwards).
    pub fn execute(mut self) {
        struct Finalize(Option<Box<dyn FnOnce() + Send>>);
        impl Drop for Finalize {
            fn drop(&mut self) {
                if let Some(f) = self.0.take() {
                    f();
                }
            }
        }

        let _finalize = Finalize(self.finalize.take());
        if let Some(run) = self.run.take() {
            run();
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("run", &self.run.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_then_finalize_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let task = Task::new(
            move || o1.lock().unwrap().push("run"),
            move || o2.lock().unwrap().push("finalize"),
        );
        task.execute();

        assert_eq!(*order.lock().unwrap(), vec!["run", "finalize"]);
    }

    #[test]
    fn test_take_leaves_empty() {
        let mut task = Task::from_fn(|| {});
        assert!(!task.is_empty());

        let moved = task.take();
        assert!(task.is_empty());
        assert!(!moved.is_empty());

        moved.execute();
        task.execute(); // no-op
    }

    #[test]
    fn test_finalize_runs_on_panic() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = finalized.clone();

        let task = Task::new(|| panic!("task failure"), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.execute();
        }));
        assert!(result.is_err());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalize_runs_exactly_once() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = finalized.clone();

        Task::new(|| {}, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .execute();

        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }
}
