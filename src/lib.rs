//! QuickJS engines pinned to their own threads.
//!
//! An [`ActorHandle`] owns one engine and one script context on a dedicated
//! thread and serializes every evaluation and call onto it. Host objects and
//! host closures are reached from script through opaque [`Handle`]s kept in a
//! [`HandleRegistry`].
//!
//! ```no_run
//! use jsactor::{ActorConfig, ActorHandle, EvalMode, JsValue};
//!
//! let actor = ActorHandle::spawn(ActorConfig::default(), ()).unwrap();
//! assert_eq!(actor.eval("6 * 7", EvalMode::GLOBAL).unwrap(), JsValue::Int(42));
//! actor.close();
//! ```

pub mod runtime;

pub use runtime::{
    host_function, ActorConfig, ActorError, ActorHandle, BridgeError, CallbackScope,
    ClosureRecord, ContextId, ConversionError, Engine, Entry, EntryKind, EvalMode, FunctionId,
    Handle, HandleRegistry, HostFunction, HostInterface, JsValue, RegistryError, ScriptContext,
    ScriptError,
};

/// Engine bindings, for host closures that work with engine values directly.
pub use rquickjs;
