//! QuickJS runtime wrapper owned by one actor thread.

use crate::runtime::error::ActorError;
use rquickjs::Runtime;
use std::cell::Cell;

/// How close to the configured limit usage must be for a `null` throw to be
/// treated as an allocation failure. QuickJS throws `null` when it cannot even
/// allocate the error object.
const OOM_SLACK: usize = 16 * 1024;

/// The embedded interpreter: heap, collector and job queue.
///
/// Not `Send`; it is created, used and dropped on the actor thread. None of
/// these methods may be called from inside [`ScriptContext::with`].
///
/// [`ScriptContext::with`]: crate::runtime::context::ScriptContext::with
pub struct Engine {
    runtime: Runtime,
    memory_limit: Cell<usize>,
}

impl Engine {
    pub(crate) fn new() -> Result<Self, ActorError> {
        let runtime =
            Runtime::new().map_err(|err| ActorError::Startup(format!("engine: {}", err)))?;
        Ok(Self {
            runtime,
            memory_limit: Cell::new(0),
        })
    }

    pub(crate) fn raw(&self) -> &Runtime {
        &self.runtime
    }

    /// Cap the engine heap at `bytes`. Zero removes the cap.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.runtime.set_memory_limit(bytes);
        self.memory_limit.set(bytes);
    }

    pub fn memory_limit(&self) -> Option<usize> {
        match self.memory_limit.get() {
            0 => None,
            limit => Some(limit),
        }
    }

    pub fn set_max_stack_size(&self, bytes: usize) {
        self.runtime.set_max_stack_size(bytes);
    }

    pub fn set_gc_threshold(&self, bytes: usize) {
        self.runtime.set_gc_threshold(bytes);
    }

    pub fn run_gc(&self) {
        self.runtime.run_gc();
    }

    /// Bytes currently allocated by the engine.
    pub fn memory_used(&self) -> usize {
        let usage = self.runtime.memory_usage();
        usize::try_from(usage.malloc_size).unwrap_or(0)
    }

    /// True when a limit is set and usage has reached it.
    pub(crate) fn at_memory_limit(&self) -> bool {
        match self.memory_limit() {
            Some(limit) => self.memory_used().saturating_add(OOM_SLACK) >= limit,
            None => false,
        }
    }

    /// Run `f` with the memory limit removed, restoring it afterwards.
    pub(crate) fn with_limit_lifted<R>(&self, f: impl FnOnce() -> R) -> R {
        let limit = self.memory_limit.get();
        if limit == 0 {
            return f();
        }
        self.runtime.set_memory_limit(0);
        let result = f();
        self.runtime.set_memory_limit(limit);
        result
    }

    /// Drain the promise job queue. Returns the number of jobs run.
    pub(crate) fn run_pending_jobs(&self) -> usize {
        let mut executed = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(_) => {
                    executed += 1;
                    tracing::warn!("pending job threw an unhandled exception");
                }
            }
        }
        executed
    }
}
