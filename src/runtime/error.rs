//! Error types surfaced to hosts.
//!
//! Two tiers: [`ScriptError`] carries what the engine reported for a failed
//! evaluation or call (syntax errors, thrown values, runtime faults), and
//! [`ActorError`] wraps it together with host-side failures of the request
//! protocol itself.

use super::js_value::{ConversionError, FunctionId};
use super::registry::{Handle, RegistryError};
use rquickjs::convert::Coerced;
use rquickjs::Value;
use thiserror::Error;

const OUT_OF_MEMORY_CAUSE: &str = "InternalError: out of memory";

/// Structured error captured from the engine at the eval/call boundary.
///
/// `Display` yields the cause, e.g. `SyntaxError: unexpected end of string`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{cause}")]
pub struct ScriptError {
    /// `name: message` of the thrown error, or the thrown value as a string.
    pub cause: String,
    pub message: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
    /// Omitted when the thrown value carries no stack.
    pub stack: Option<String>,
}

impl ScriptError {
    /// Error with only a cause.
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            message: None,
            file_name: None,
            line_number: None,
            stack: None,
        }
    }

    pub fn out_of_memory() -> Self {
        Self {
            message: Some("out of memory".to_string()),
            ..Self::new(OUT_OF_MEMORY_CAUSE)
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.cause == OUT_OF_MEMORY_CAUSE
    }

    /// Build from a value caught after an exception.
    pub(crate) fn from_thrown(value: &Value<'_>) -> Self {
        let Some(exception) = value.as_exception() else {
            let cause = value
                .get::<Coerced<String>>()
                .map(|coerced| coerced.0)
                .unwrap_or_else(|_| "uncaught exception".to_string());
            return Self::new(cause);
        };

        let name = exception
            .as_object()
            .get::<_, Option<Coerced<String>>>("name")
            .ok()
            .flatten()
            .map(|coerced| coerced.0)
            .unwrap_or_else(|| "Error".to_string());
        let message = exception.message();
        let cause = match message.as_deref() {
            Some(msg) if !msg.is_empty() => format!("{}: {}", name, msg),
            _ => name,
        };

        let stack = exception.stack().filter(|stack| !stack.is_empty());
        if stack.is_none() {
            return Self {
                message,
                ..Self::new(cause)
            };
        }

        let object = exception.as_object();
        let file_name = object.get::<_, Option<String>>("fileName").ok().flatten();
        let line_number = object
            .get::<_, Option<i32>>("lineNumber")
            .ok()
            .flatten()
            .and_then(|line| u32::try_from(line).ok());
        Self {
            cause,
            message,
            file_name,
            line_number,
            stack,
        }
    }

    /// Drop source-position details.
    pub(crate) fn stripped(self) -> Self {
        Self {
            file_name: None,
            line_number: None,
            stack: None,
            ..self
        }
    }
}

/// Failures of the callback bridge. Thrown into script as `InternalError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("callback invoked without a handle")]
    MissingHandle,
    #[error("callback handle argument is not a valid handle")]
    InvalidHandle,
    #[error("callback {0}")]
    Registry(#[from] RegistryError),
    #[error("callback handle {0} belongs to another context")]
    ForeignContext(Handle),
    #[error("callback context has been torn down")]
    ContextGone,
}

/// Errors returned to callers of the actor submission API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActorError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("actor has been closed")]
    Closed,
    #[error("request submitted from the actor's own thread would deadlock")]
    Reentrant,
    #[error("failed to spawn actor thread: {0}")]
    Spawn(String),
    #[error("actor startup failed: {0}")]
    Startup(String),
    #[error("invalid actor configuration: {0}")]
    InvalidConfig(String),
    #[error("host interface rejected registration")]
    RegisterRejected,
    #[error("function ID {0} not found")]
    UnknownFunction(FunctionId),
    #[error("call target is not a function")]
    NotAFunction,
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ActorError {
    /// The engine-level error, if this is one.
    pub fn as_script(&self) -> Option<&ScriptError> {
        match self {
            ActorError::Script(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_display() {
        let err = ScriptError::out_of_memory();
        assert!(err.is_out_of_memory());
        assert_eq!(err.to_string(), "InternalError: out of memory");
        assert!(!ScriptError::new("Error: boom").is_out_of_memory());
    }

    #[test]
    fn test_stripped_drops_positions() {
        let err = ScriptError {
            cause: "Error: x".to_string(),
            message: Some("x".to_string()),
            file_name: Some("<eval>".to_string()),
            line_number: Some(3),
            stack: Some("    at <eval>:3\n".to_string()),
        }
        .stripped();

        assert_eq!(err.cause, "Error: x");
        assert_eq!(err.message.as_deref(), Some("x"));
        assert!(err.file_name.is_none());
        assert!(err.line_number.is_none());
        assert!(err.stack.is_none());
    }

    #[test]
    fn test_bridge_error_messages() {
        let handle = Handle::from_raw(1001);
        let err = BridgeError::from(RegistryError::UnknownHandle(handle));
        assert_eq!(err.to_string(), "callback handle #1001 is not registered");
        assert_eq!(
            ActorError::from(ScriptError::new("TypeError: nope")).to_string(),
            "TypeError: nope"
        );
    }
}
