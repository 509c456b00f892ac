//! Thread-safe handle for submitting work to an actor.

use crate::runtime::config::ActorConfig;
use crate::runtime::error::ActorError;
use crate::runtime::host::HostInterface;
use crate::runtime::js_value::{FunctionId, JsValue};
use crate::runtime::mode::EvalMode;
use crate::runtime::registry::HandleRegistry;
use crate::runtime::runner::{spawn_actor_thread, CallRequest, EvalRequest, Reply};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    /// Set once the actor thread has finished tearing down.
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
}

/// Handle to a running actor.
///
/// Cheap to clone and usable from any thread. Every request is executed on
/// the actor's own thread, one at a time. The actor runs until
/// [`ActorHandle::close`] is called on any clone.
#[derive(Clone)]
pub struct ActorHandle {
    eval_tx: async_mpsc::UnboundedSender<EvalRequest>,
    call_tx: async_mpsc::UnboundedSender<CallRequest>,
    close_tx: async_mpsc::UnboundedSender<()>,
    registry: Arc<HandleRegistry>,
    shared: Arc<Shared>,
}

impl ActorHandle {
    /// Start an actor with a private handle registry.
    pub fn spawn(config: ActorConfig, host: impl HostInterface) -> Result<Self, ActorError> {
        Self::spawn_with_registry(config, Arc::new(HandleRegistry::new()), host)
    }

    /// Start an actor whose callbacks and host objects live in `registry`.
    /// Several actors may share one registry.
    pub fn spawn_with_registry(
        config: ActorConfig,
        registry: Arc<HandleRegistry>,
        host: impl HostInterface,
    ) -> Result<Self, ActorError> {
        spawn_actor_thread(config, registry, Box::new(host))
    }

    pub(crate) fn new(
        eval_tx: async_mpsc::UnboundedSender<EvalRequest>,
        call_tx: async_mpsc::UnboundedSender<CallRequest>,
        close_tx: async_mpsc::UnboundedSender<()>,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            eval_tx,
            call_tx,
            close_tx,
            registry,
            shared: Arc::new(Shared::default()),
        }
    }

    pub(crate) fn bind_current_thread(&self) {
        let _ = self.shared.thread_id.set(thread::current().id());
    }

    pub(crate) fn attach_thread(&self, thread: JoinHandle<()>) {
        *self.lock_thread() = Some(thread);
    }

    pub(crate) fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        let mut stopped = self
            .shared
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.shared.stopped_cv.notify_all();
    }

    fn wait_stopped(&self) {
        let mut stopped = self
            .shared
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            stopped = self
                .shared
                .stopped_cv
                .wait(stopped)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait for the actor thread to exit. No-op when called from it.
    pub(crate) fn join_thread(&self) {
        if self.on_actor_thread() {
            return;
        }
        let thread = self.lock_thread().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("actor thread panicked");
            }
        }
    }

    fn lock_thread(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_actor_thread(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    fn guard(&self) -> Result<(), ActorError> {
        if self.is_closed() {
            return Err(ActorError::Closed);
        }
        if self.on_actor_thread() {
            return Err(ActorError::Reentrant);
        }
        Ok(())
    }

    /// The registry shared with this actor's callback bridge.
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Evaluate `source`, blocking until the actor answers.
    pub fn eval(&self, source: &str, mode: EvalMode) -> Result<JsValue, ActorError> {
        self.guard()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.eval_tx
            .send(EvalRequest {
                source: source.to_string(),
                mode,
                reply: Reply::Blocking(reply_tx),
            })
            .map_err(|_| ActorError::Closed)?;

        reply_rx.recv().map_err(|_| ActorError::Closed)?
    }

    pub async fn eval_async(&self, source: &str, mode: EvalMode) -> Result<JsValue, ActorError> {
        self.guard()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.eval_tx
            .send(EvalRequest {
                source: source.to_string(),
                mode,
                reply: Reply::Async(reply_tx),
            })
            .map_err(|_| ActorError::Closed)?;

        reply_rx.await.map_err(|_| ActorError::Closed)?
    }

    /// Call a function previously returned by this actor.
    ///
    /// A null or undefined `this` binds the object the function was read
    /// from, or the global object for free-standing functions.
    pub fn call(
        &self,
        this: JsValue,
        function: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ActorError> {
        self.guard()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.call_tx
            .send(CallRequest::Invoke {
                this,
                function,
                args,
                reply: Reply::Blocking(reply_tx),
            })
            .map_err(|_| ActorError::Closed)?;

        reply_rx.recv().map_err(|_| ActorError::Closed)?
    }

    pub async fn call_async(
        &self,
        this: JsValue,
        function: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ActorError> {
        self.guard()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.call_tx
            .send(CallRequest::Invoke {
                this,
                function,
                args,
                reply: Reply::Async(reply_tx),
            })
            .map_err(|_| ActorError::Closed)?;

        reply_rx.await.map_err(|_| ActorError::Closed)?
    }

    /// Drop a function retained by an earlier result. Returns false if the
    /// id was unknown.
    pub fn release(&self, id: FunctionId) -> Result<bool, ActorError> {
        self.guard()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.call_tx
            .send(CallRequest::Release {
                id,
                reply: Reply::Blocking(reply_tx),
            })
            .map_err(|_| ActorError::Closed)?;

        reply_rx.recv().map_err(|_| ActorError::Closed)?
    }

    /// Stop the actor. Idempotent.
    ///
    /// Requests still queued are answered with [`ActorError::Closed`]. Every
    /// caller blocks until the actor thread has torn down, unless called from
    /// that thread.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("closing actor");
            let _ = self.close_tx.send(());
        }
        if self.on_actor_thread() {
            return;
        }
        self.wait_stopped();
        self.join_thread();
    }
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("closed", &self.is_closed())
            .field("registry_len", &self.registry.len())
            .finish()
    }
}
