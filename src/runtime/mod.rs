//! Thread-confined JavaScript actors.
//!
//! Each actor owns a single QuickJS engine and context running on a dedicated
//! OS thread with a Tokio event loop. Hosts talk to it through a cloneable
//! [`ActorHandle`]; script talks back to the host through closures registered
//! in a shared [`HandleRegistry`].

pub mod bridge;
pub mod config;
pub mod context;
pub(crate) mod conversion;
pub mod engine;
pub mod error;
pub mod handle;
pub mod host;
pub mod js_value;
pub mod mode;
pub mod registry;
mod runner;

// Re-export key types for convenience
pub use bridge::{host_function, CallbackScope, ClosureRecord, ContextId, HostFunction};
pub use config::ActorConfig;
pub use context::{ScriptContext, CONSOLE_TARGET};
pub use engine::Engine;
pub use error::{ActorError, BridgeError, ScriptError};
pub use handle::ActorHandle;
pub use host::HostInterface;
pub use js_value::{ConversionError, FunctionId, JsValue};
pub use mode::EvalMode;
pub use registry::{Entry, EntryKind, Handle, HandleRegistry, RegistryError};
