//! The seam between an actor and the host application that owns it.

use crate::runtime::context::ScriptContext;
use crate::runtime::engine::Engine;
use crate::runtime::handle::ActorHandle;

/// Host-specific setup and teardown run on the actor thread.
///
/// `register` runs once after the engine, context, console and bootstrap
/// are ready, and before the first request is serviced. Returning `false`
/// aborts startup; `unregister` is then never called. Otherwise
/// `unregister` runs exactly once when the actor stops, before the context
/// is torn down.
///
/// Both hooks run on the actor thread: submitting a request through `actor`
/// from inside them fails with [`ActorError::Reentrant`]. Keep a clone of the
/// handle to use it from other threads later.
///
/// [`ActorError::Reentrant`]: crate::runtime::error::ActorError::Reentrant
pub trait HostInterface: Send + 'static {
    fn register(&mut self, engine: &Engine, context: &ScriptContext, actor: &ActorHandle) -> bool;

    fn unregister(&mut self, _engine: &Engine, _context: &ScriptContext, _actor: &ActorHandle) {}
}

/// A host with nothing to install.
impl HostInterface for () {
    fn register(
        &mut self,
        _engine: &Engine,
        _context: &ScriptContext,
        _actor: &ActorHandle,
    ) -> bool {
        true
    }
}
