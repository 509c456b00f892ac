//! Callback bridge: script-callable proxies for host closures.
//!
//! Every context owns one native entry point. For each exposed host closure a
//! small script function is built that calls the entry point with its own
//! handle as a hidden leading argument:
//!
//! ```js
//! (proxy, id) => function() { return proxy.call(this, id, ...arguments); }
//! ```
//!
//! The entry point resolves the handle through the [`HandleRegistry`] and runs
//! the host closure synchronously on the actor thread, inside the current
//! script call stack.

use crate::runtime::conversion::{from_js_value, to_js_value, FunctionTable};
use crate::runtime::error::BridgeError;
use crate::runtime::js_value::JsValue;
use crate::runtime::registry::{Handle, HandleRegistry};
use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Exception, Function, Persistent, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const PROXY_FACTORY: &str =
    "(proxy, id) => function() { return proxy.call(this, id, ...arguments); }";

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a script context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Host closure invoked by script through the bridge.
///
/// Arguments are views over the current call; they must not be kept past the
/// call without [`CallbackScope::retain`].
pub type HostFunction = Arc<
    dyn for<'js> Fn(&CallbackScope<'js>, Value<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>>
        + Send
        + Sync,
>;

/// Box a closure as a [`HostFunction`].
pub fn host_function<F>(function: F) -> HostFunction
where
    F: for<'js> Fn(&CallbackScope<'js>, Value<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(function)
}

/// Registry entry backing one script proxy: the owning context and the host
/// function to run.
#[derive(Clone)]
pub struct ClosureRecord {
    context: ContextId,
    function: HostFunction,
}

impl ClosureRecord {
    pub fn new(context: ContextId, function: HostFunction) -> Self {
        Self { context, function }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }
}

impl fmt::Debug for ClosureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureRecord")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct BridgeCache {
    native: Persistent<Function<'static>>,
    factory: Persistent<Function<'static>>,
}

/// Per-context bridge state. Lives on the actor thread only.
pub(crate) struct Bridge {
    context_id: ContextId,
    registry: Arc<HandleRegistry>,
    functions: FunctionTable,
    cache: RefCell<Option<BridgeCache>>,
    minted: RefCell<Vec<Handle>>,
}

impl Bridge {
    pub(crate) fn new(context_id: ContextId, registry: Arc<HandleRegistry>) -> Rc<Self> {
        Rc::new(Self {
            context_id,
            registry,
            functions: FunctionTable::default(),
            cache: RefCell::new(None),
            minted: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub(crate) fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub(crate) fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Native entry point and proxy factory, created on first use.
    fn parts<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
    ) -> rquickjs::Result<(Function<'js>, Function<'js>)> {
        let cached = self
            .cache
            .borrow()
            .as_ref()
            .map(|cache| (cache.native.clone(), cache.factory.clone()));
        if let Some((native, factory)) = cached {
            return Ok((native.restore(ctx)?, factory.restore(ctx)?));
        }

        let weak = Rc::downgrade(self);
        let native = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, this: This<Value<'js>>, args: Rest<Value<'js>>| {
                dispatch(&weak, ctx, this.0, args.0)
            },
        )?;
        let factory: Function<'js> = ctx.eval(PROXY_FACTORY)?;

        *self.cache.borrow_mut() = Some(BridgeCache {
            native: Persistent::save(ctx, native.clone()),
            factory: Persistent::save(ctx, factory.clone()),
        });
        Ok((native, factory))
    }

    /// Register `function` and build its script proxy.
    pub(crate) fn function<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        function: HostFunction,
    ) -> rquickjs::Result<(Function<'js>, Handle)> {
        let (native, factory) = self.parts(ctx)?;

        let handle = self
            .registry
            .put_closure(ClosureRecord::new(self.context_id, function));
        self.minted.borrow_mut().push(handle);

        let raw = i64::try_from(handle.get())
            .map_err(|_| Exception::throw_internal(ctx, "callback handle space exhausted"))?;
        let proxy: Function<'js> = factory.call((native, raw))?;
        Ok((proxy, handle))
    }

    /// Release everything this bridge holds. Returns the number of retained
    /// functions that were never released by the host.
    pub(crate) fn teardown(&self) -> usize {
        self.cache.borrow_mut().take();
        let leaked = self.functions.clear();
        for mut handle in self.minted.borrow_mut().drain(..) {
            self.registry.free(&mut handle);
        }
        leaked
    }
}

fn decode_handle(value: &Value<'_>) -> Option<Handle> {
    let raw = match value.as_int() {
        Some(int) => i64::from(int),
        None => {
            let float = value.as_float()?;
            if !float.is_finite() || float.fract() != 0.0 {
                return None;
            }
            float as i64
        }
    };
    u64::try_from(raw)
        .ok()
        .filter(|raw| *raw != 0)
        .map(Handle::from_raw)
}

fn throw(ctx: &Ctx<'_>, err: BridgeError) -> rquickjs::Error {
    tracing::debug!(error = %err, "callback bridge rejected call");
    Exception::throw_internal(ctx, &err.to_string())
}

/// The shared native entry point.
fn dispatch<'js>(
    bridge: &Weak<Bridge>,
    ctx: Ctx<'js>,
    this: Value<'js>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let Some(bridge) = bridge.upgrade() else {
        return Err(throw(&ctx, BridgeError::ContextGone));
    };

    let mut args = args.into_iter();
    let handle = match args.next() {
        Some(first) => decode_handle(&first).ok_or(BridgeError::InvalidHandle),
        None => Err(BridgeError::MissingHandle),
    }
    .map_err(|err| throw(&ctx, err))?;

    let record = bridge
        .registry
        .get_closure(handle)
        .map_err(|err| throw(&ctx, err.into()))?;
    if record.context != bridge.context_id {
        return Err(throw(&ctx, BridgeError::ForeignContext(handle)));
    }

    let scope = CallbackScope {
        ctx,
        bridge: bridge.clone(),
    };
    (record.function)(&scope, this, args.collect())
}

/// What a host closure sees while it runs: the live engine context plus the
/// bridge services bound to it.
pub struct CallbackScope<'js> {
    ctx: Ctx<'js>,
    bridge: Rc<Bridge>,
}

impl<'js> CallbackScope<'js> {
    pub(crate) fn new(ctx: Ctx<'js>, bridge: Rc<Bridge>) -> Self {
        Self { ctx, bridge }
    }

    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub fn context_id(&self) -> ContextId {
        self.bridge.context_id
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.bridge.registry
    }

    /// Snapshot a value so it can outlive this call and cross threads.
    ///
    /// Functions are retained on the actor thread and must later be released
    /// with `ActorHandle::release`.
    pub fn retain(&self, value: Value<'js>) -> rquickjs::Result<JsValue> {
        to_js_value(&self.ctx, &self.bridge.functions, value)
            .map_err(|err| self.throw_internal(err))
    }

    /// Materialize a snapshot in this context.
    pub fn restore(&self, value: &JsValue) -> rquickjs::Result<Value<'js>> {
        from_js_value(&self.ctx, &self.bridge.functions, value)
            .map_err(|err| self.throw_internal(err))
    }

    /// Expose a host closure to script. The handle is freed with the context.
    pub fn function<F>(&self, function: F) -> rquickjs::Result<Function<'js>>
    where
        F: for<'a> Fn(&CallbackScope<'a>, Value<'a>, Vec<Value<'a>>) -> rquickjs::Result<Value<'a>>
            + Send
            + Sync
            + 'static,
    {
        self.function_with_handle(function).map(|(proxy, _)| proxy)
    }

    /// Like [`CallbackScope::function`], also returning the registry handle so
    /// the host can revoke the proxy early.
    pub fn function_with_handle<F>(&self, function: F) -> rquickjs::Result<(Function<'js>, Handle)>
    where
        F: for<'a> Fn(&CallbackScope<'a>, Value<'a>, Vec<Value<'a>>) -> rquickjs::Result<Value<'a>>
            + Send
            + Sync
            + 'static,
    {
        self.bridge.function(&self.ctx, host_function(function))
    }

    /// Throw an `InternalError` into script and return the matching error.
    pub fn throw_internal(&self, message: impl fmt::Display) -> rquickjs::Error {
        Exception::throw_internal(&self.ctx, &message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    struct Fixture {
        context: Context,
        bridge: Rc<Bridge>,
        registry: Arc<HandleRegistry>,
        _runtime: Runtime,
    }

    impl Fixture {
        fn new() -> Self {
            let runtime = Runtime::new().unwrap();
            let context = Context::full(&runtime).unwrap();
            let registry = Arc::new(HandleRegistry::new());
            let bridge = Bridge::new(ContextId::next(), registry.clone());
            Self {
                context,
                bridge,
                registry,
                _runtime: runtime,
            }
        }

        fn eval_err(&self, source: &str) -> String {
            self.context.with(|ctx| {
                let result: rquickjs::Result<Value> = ctx.eval(source);
                assert!(result.is_err(), "expected `{}` to throw", source);
                let caught = ctx.catch();
                crate::runtime::error::ScriptError::from_thrown(&caught).cause
            })
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let bridge = self.bridge.clone();
            self.context.with(|_| bridge.teardown());
        }
    }

    fn install(fixture: &Fixture, name: &str, function: HostFunction) -> Handle {
        fixture.context.with(|ctx| {
            let (proxy, handle) = fixture.bridge.function(&ctx, function).unwrap();
            ctx.globals().set(name, proxy).unwrap();
            handle
        })
    }

    #[test]
    fn test_proxy_passes_arguments_and_this() {
        let fixture = Fixture::new();
        install(
            &fixture,
            "describe",
            host_function(|scope, this, args| {
                let tag = this
                    .as_object()
                    .and_then(|obj| obj.get::<_, String>("tag").ok())
                    .unwrap_or_default();
                let text = format!("{}:{}", tag, args.len());
                scope.restore(&JsValue::String(text))
            }),
        );

        fixture.context.with(|ctx| {
            let result: String = ctx
                .eval("({ tag: 'obj', describe }).describe(1, 'a', null)")
                .unwrap();
            assert_eq!(result, "obj:3");
        });
    }

    #[test]
    fn test_host_error_becomes_script_exception() {
        let fixture = Fixture::new();
        install(
            &fixture,
            "fail",
            host_function(|scope, _this, _args| Err(scope.throw_internal("host refused"))),
        );

        assert_eq!(fixture.eval_err("fail()"), "InternalError: host refused");
        fixture.context.with(|ctx| {
            let caught: bool = ctx
                .eval("try { fail(); false } catch (e) { e instanceof InternalError }")
                .unwrap();
            assert!(caught);
        });
    }

    #[test]
    fn test_freed_handle_fails_descriptively() {
        let fixture = Fixture::new();
        let mut handle = install(
            &fixture,
            "gone",
            host_function(|scope, _this, _args| scope.restore(&JsValue::Int(1))),
        );
        let raw = handle.get();
        fixture.registry.free(&mut handle);

        let cause = fixture.eval_err("gone()");
        assert_eq!(
            cause,
            format!("InternalError: callback handle #{} is not registered", raw)
        );
    }

    #[test]
    fn test_entry_of_wrong_kind_is_rejected() {
        let fixture = Fixture::new();
        let object = fixture.registry.put_object(String::from("not a closure"));
        fixture.context.with(|ctx| {
            let (native, _) = fixture.bridge.parts(&ctx).unwrap();
            ctx.globals().set("rawProxy", native).unwrap();
        });

        let cause = fixture.eval_err(&format!("rawProxy({})", object.get()));
        assert!(cause.contains("expected a closure"), "{}", cause);
        assert_eq!(
            fixture.eval_err("rawProxy()"),
            "InternalError: callback invoked without a handle"
        );
        assert_eq!(
            fixture.eval_err("rawProxy('x')"),
            "InternalError: callback handle argument is not a valid handle"
        );
    }

    #[test]
    fn test_record_from_other_context_is_rejected() {
        let fixture = Fixture::new();
        let foreign = fixture.registry.put_closure(ClosureRecord::new(
            ContextId::next(),
            host_function(|scope, _this, _args| scope.restore(&JsValue::Null)),
        ));
        fixture.context.with(|ctx| {
            let (native, _) = fixture.bridge.parts(&ctx).unwrap();
            ctx.globals().set("rawProxy", native).unwrap();
        });

        let cause = fixture.eval_err(&format!("rawProxy({})", foreign.get()));
        assert!(cause.contains("another context"), "{}", cause);
    }

    #[test]
    fn test_closure_can_use_registry_reentrantly() {
        let fixture = Fixture::new();
        install(
            &fixture,
            "mint",
            host_function(|scope, _this, args| {
                let label = scope.retain(args[0].clone())?;
                let mut handle = scope.registry().put_object(label);
                let live = scope.registry().contains(handle);
                scope.registry().free(&mut handle);
                scope.restore(&JsValue::Bool(live && handle.is_nil()))
            }),
        );

        fixture.context.with(|ctx| {
            let ok: bool = ctx.eval("mint('x')").unwrap();
            assert!(ok);
        });
    }

    #[test]
    fn test_teardown_frees_minted_handles() {
        let fixture = Fixture::new();
        let handle = install(
            &fixture,
            "noop",
            host_function(|scope, _this, _args| scope.restore(&JsValue::Undefined)),
        );
        assert!(fixture.registry.contains(handle));

        let bridge = fixture.bridge.clone();
        fixture.context.with(|_| bridge.teardown());
        assert!(!fixture.registry.contains(handle));
    }
}
