//! Script context - one global object bound to an engine and a bridge.

use crate::runtime::bridge::{host_function, Bridge, CallbackScope, ContextId};
use crate::runtime::conversion::FunctionTable;
use crate::runtime::engine::Engine;
use crate::runtime::error::ActorError;
use crate::runtime::registry::{Handle, HandleRegistry};
use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, Function, Object, Value};
use std::rc::Rc;
use std::sync::Arc;

/// Target used for events emitted by the script `console` object.
pub const CONSOLE_TARGET: &str = "jsactor::console";

#[derive(Debug, Clone, Copy)]
enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// An engine context with its callback bridge.
///
/// Each context has its own global object. Handles minted through
/// [`ScriptContext::function`] belong to this context and are freed when it
/// is torn down.
pub struct ScriptContext {
    context: Context,
    bridge: Rc<Bridge>,
}

impl ScriptContext {
    pub(crate) fn new(engine: &Engine, registry: Arc<HandleRegistry>) -> Result<Self, ActorError> {
        let context = Context::full(engine.raw())
            .map_err(|err| ActorError::Startup(format!("context: {}", err)))?;
        let bridge = Bridge::new(ContextId::next(), registry);
        tracing::debug!(context = %bridge.context_id(), "script context created");
        Ok(Self { context, bridge })
    }

    pub fn id(&self) -> ContextId {
        self.bridge.context_id()
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        self.bridge.registry()
    }

    pub(crate) fn functions(&self) -> &FunctionTable {
        self.bridge.functions()
    }

    /// Enter the context. Must not be nested.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.context.with(f)
    }

    /// Bridge services for host code already inside [`ScriptContext::with`].
    pub fn scope<'js>(&self, ctx: Ctx<'js>) -> CallbackScope<'js> {
        CallbackScope::new(ctx, self.bridge.clone())
    }

    /// Expose a host closure to script as a function.
    pub fn function<'js, F>(&self, ctx: &Ctx<'js>, function: F) -> rquickjs::Result<Function<'js>>
    where
        F: for<'a> Fn(&CallbackScope<'a>, Value<'a>, Vec<Value<'a>>) -> rquickjs::Result<Value<'a>>
            + Send
            + Sync
            + 'static,
    {
        self.function_with_handle(ctx, function)
            .map(|(proxy, _)| proxy)
    }

    pub fn function_with_handle<'js, F>(
        &self,
        ctx: &Ctx<'js>,
        function: F,
    ) -> rquickjs::Result<(Function<'js>, Handle)>
    where
        F: for<'a> Fn(&CallbackScope<'a>, Value<'a>, Vec<Value<'a>>) -> rquickjs::Result<Value<'a>>
            + Send
            + Sync
            + 'static,
    {
        self.bridge.function(ctx, host_function(function))
    }

    /// Install a global `console` whose methods log through `tracing`.
    pub(crate) fn install_console(&self) -> rquickjs::Result<()> {
        self.with(|ctx| {
            let console = Object::new(ctx.clone())?;
            for (name, level) in [
                ("log", ConsoleLevel::Info),
                ("info", ConsoleLevel::Info),
                ("debug", ConsoleLevel::Debug),
                ("warn", ConsoleLevel::Warn),
                ("error", ConsoleLevel::Error),
            ] {
                let method = self.function(&ctx, move |scope, _this, args| {
                    emit(level, scope.context_id(), &join_args(&args));
                    Ok(Value::new_undefined(scope.ctx().clone()))
                })?;
                console.set(name, method)?;
            }
            ctx.globals().set("console", console)
        })
    }

    /// Drop bridge state and free minted handles. Returns the number of
    /// retained functions the host never released. Safe to call twice.
    pub(crate) fn teardown(&self) -> usize {
        self.with(|_ctx| self.bridge.teardown())
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn join_args(args: &[Value<'_>]) -> String {
    args.iter()
        .map(|arg| {
            arg.get::<Coerced<String>>()
                .map(|coerced| coerced.0)
                .unwrap_or_else(|_| "<unprintable>".to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn emit(level: ConsoleLevel, context: ContextId, line: &str) {
    match level {
        ConsoleLevel::Debug => tracing::debug!(target: CONSOLE_TARGET, %context, "{}", line),
        ConsoleLevel::Info => tracing::info!(target: CONSOLE_TARGET, %context, "{}", line),
        ConsoleLevel::Warn => tracing::warn!(target: CONSOLE_TARGET, %context, "{}", line),
        ConsoleLevel::Error => tracing::error!(target: CONSOLE_TARGET, %context, "{}", line),
    }
}
