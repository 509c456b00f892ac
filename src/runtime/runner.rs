//! Actor thread backed by a QuickJS engine.
//!
//! This module hosts one engine and one script context on a dedicated OS
//! thread with a single-threaded Tokio runtime. Requests arrive on three
//! queues (evaluations, calls, close) and are executed one at a time on
//! that thread.

use crate::runtime::config::ActorConfig;
use crate::runtime::context::ScriptContext;
use crate::runtime::conversion::{from_js_value, to_js_value};
use crate::runtime::engine::Engine;
use crate::runtime::error::{ActorError, ScriptError};
use crate::runtime::handle::ActorHandle;
use crate::runtime::host::HostInterface;
use crate::runtime::js_value::{ConversionError, FunctionId, JsValue};
use crate::runtime::mode::EvalMode;
use crate::runtime::registry::HandleRegistry;
use rquickjs::context::EvalOptions;
use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Module, Persistent, Type, Value};
use std::cell::Cell;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};

type InitSignalChannel = (
    StdSender<Result<(), ActorError>>,
    StdReceiver<Result<(), ActorError>>,
);

/// Where to deliver the result of a request.
pub(crate) enum Reply<T> {
    Blocking(StdSender<Result<T, ActorError>>),
    Async(oneshot::Sender<Result<T, ActorError>>),
}

impl<T> Reply<T> {
    pub(crate) fn send(self, result: Result<T, ActorError>) {
        match self {
            Reply::Blocking(tx) => {
                let _ = tx.send(result);
            }
            Reply::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

pub(crate) struct EvalRequest {
    pub(crate) source: String,
    pub(crate) mode: EvalMode,
    pub(crate) reply: Reply<JsValue>,
}

pub(crate) enum CallRequest {
    Invoke {
        this: JsValue,
        function: JsValue,
        args: Vec<JsValue>,
        reply: Reply<JsValue>,
    },
    Release {
        id: FunctionId,
        reply: Reply<bool>,
    },
}

/// Receiving ends of the actor's queues.
pub(crate) struct Queues {
    eval: mpsc::UnboundedReceiver<EvalRequest>,
    call: mpsc::UnboundedReceiver<CallRequest>,
    close: mpsc::UnboundedReceiver<()>,
}

impl Queues {
    /// Refuse new submissions and answer everything still queued.
    fn reject_pending(&mut self) -> usize {
        self.eval.close();
        self.call.close();

        let mut rejected = 0;
        while let Ok(request) = self.eval.try_recv() {
            request.reply.send(Err(ActorError::Closed));
            rejected += 1;
        }
        while let Ok(request) = self.call.try_recv() {
            match request {
                CallRequest::Invoke { reply, .. } => reply.send(Err(ActorError::Closed)),
                CallRequest::Release { reply, .. } => reply.send(Err(ActorError::Closed)),
            }
            rejected += 1;
        }
        rejected
    }
}

pub(crate) fn spawn_actor_thread(
    config: ActorConfig,
    registry: Arc<HandleRegistry>,
    host: Box<dyn HostInterface>,
) -> Result<ActorHandle, ActorError> {
    config.validate()?;

    let (eval_tx, eval_rx) = mpsc::unbounded_channel::<EvalRequest>();
    let (call_tx, call_rx) = mpsc::unbounded_channel::<CallRequest>();
    let (close_tx, close_rx) = mpsc::unbounded_channel::<()>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();

    let handle = ActorHandle::new(eval_tx, call_tx, close_tx, registry.clone());
    let actor = handle.clone();
    let queues = Queues {
        eval: eval_rx,
        call: call_rx,
        close: close_rx,
    };

    let thread = std::thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            actor.bind_current_thread();
            // Dropped last, after the core and the Tokio runtime.
            let _stopped = StopSignal(actor.clone());

            let tokio_rt = match tokio::runtime::Builder::new_current_thread().build() {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(ActorError::Startup(format!(
                        "tokio runtime: {}",
                        err
                    ))));
                    return;
                }
            };

            let core = match ActorCore::start(&config, registry, host, actor) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            let span = tracing::info_span!("actor", context = %core.context.id());
            let _entered = span.enter();
            tokio_rt.block_on(core.run(queues));
        })
        .map_err(|err| ActorError::Spawn(err.to_string()))?;
    handle.attach_thread(thread);

    let started = match init_rx.recv() {
        Ok(result) => result,
        Err(_) => Err(ActorError::Startup(
            "actor thread exited during startup".to_string(),
        )),
    };
    if let Err(err) = started {
        handle.mark_closed();
        handle.join_thread();
        return Err(err);
    }
    Ok(handle)
}

/// Tells every waiting closer that the actor thread is done, including when
/// it unwinds.
struct StopSignal(ActorHandle);

impl Drop for StopSignal {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

enum Outcome {
    Returned(Persistent<Value<'static>>),
    Thrown(Persistent<Value<'static>>),
}

struct ActorCore {
    // Declared before `engine`: the context must go first.
    context: ScriptContext,
    engine: Engine,
    actor: ActorHandle,
    /// Present once registration has committed.
    host: Option<Box<dyn HostInterface>>,
    module_seq: Cell<u64>,
}

impl ActorCore {
    #[instrument(name = "actor_start", skip_all, fields(thread = %config.thread_name))]
    fn start(
        config: &ActorConfig,
        registry: Arc<HandleRegistry>,
        mut host: Box<dyn HostInterface>,
        actor: ActorHandle,
    ) -> Result<Self, ActorError> {
        let engine = Engine::new()?;
        config.apply_engine_tuning(&engine);
        let context = ScriptContext::new(&engine, registry)?;
        let mut core = ActorCore {
            context,
            engine,
            actor,
            host: None,
            module_seq: Cell::new(0),
        };

        if config.enable_console {
            core.context
                .install_console()
                .map_err(|err| ActorError::Startup(format!("console: {}", err)))?;
        }

        if let Some(script) = &config.bootstrap_script {
            core.eval(script, EvalMode::GLOBAL)
                .map_err(|err| ActorError::Startup(format!("bootstrap: {}", err)))?;
        }

        if let Some(limit) = config.memory_limit {
            core.engine.set_memory_limit(limit);
        }

        if !host.register(&core.engine, &core.context, &core.actor) {
            warn!(context = %core.context.id(), "host rejected registration");
            return Err(ActorError::RegisterRejected);
        }

        core.host = Some(host);
        info!(context = %core.context.id(), "actor started");
        Ok(core)
    }

    async fn run(self, mut queues: Queues) {
        loop {
            tokio::select! {
                Some(request) = queues.eval.recv() => self.handle_eval(request),
                Some(request) = queues.call.recv() => self.handle_call(request),
                _ = queues.close.recv() => break,
                else => break,
            }
        }

        let rejected = queues.reject_pending();
        if rejected > 0 {
            debug!(rejected, "answered queued requests after close");
        }
    }

    fn handle_eval(&self, request: EvalRequest) {
        let EvalRequest {
            source,
            mode,
            reply,
        } = request;
        trace!(?mode, bytes = source.len(), "eval");
        reply.send(self.eval(&source, mode));
    }

    fn handle_call(&self, request: CallRequest) {
        match request {
            CallRequest::Invoke {
                this,
                function,
                args,
                reply,
            } => {
                trace!(args = args.len(), "call");
                reply.send(self.call(this, function, args));
            }
            CallRequest::Release { id, reply } => {
                let released = self.context.with(|_ctx| self.context.functions().release(id));
                trace!(id, released, "release function");
                reply.send(Ok(released));
            }
        }
    }

    fn eval(&self, source: &str, mode: EvalMode) -> Result<JsValue, ActorError> {
        let module_name = mode.is_module().then(|| self.next_module_name());
        let outcome = self.context.with(|ctx| {
            let result = match &module_name {
                Some(name) => Module::evaluate(ctx.clone(), name.as_str(), source)
                    .and_then(|promise| promise.finish::<Value>()),
                None => {
                    let mut options = EvalOptions::default();
                    options.global = true;
                    options.strict = mode.is_strict();
                    ctx.eval_with_options::<Value, _>(source, options)
                }
            };
            capture(&ctx, result)
        });
        self.engine.run_pending_jobs();
        self.settle(outcome).map_err(|err| strip_if(err, mode.is_strip()))
    }

    fn call(
        &self,
        this: JsValue,
        function: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ActorError> {
        let id = function.function_id().ok_or(ActorError::NotAFunction)?;
        let outcome = self.context.with(|ctx| -> Result<_, ActorError> {
            let table = self.context.functions();
            let (target, receiver) = table.get(&ctx, id).map_err(|err| match err {
                ConversionError::UnknownFunction(id) => ActorError::UnknownFunction(id),
                other => ActorError::Conversion(other),
            })?;

            let this = if this.is_nullish() {
                match receiver {
                    Some(receiver) => receiver,
                    None => ctx.globals().into_value(),
                }
            } else {
                from_js_value(&ctx, table, &this)?
            };
            let args = args
                .iter()
                .map(|arg| from_js_value(&ctx, table, arg))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(capture(&ctx, target.call((This(this), Rest(args)))))
        })?;
        self.engine.run_pending_jobs();
        self.settle(outcome)
    }

    /// Snapshot a result or describe a thrown value. Runs with the memory
    /// limit lifted so a heap at its cap can still be read.
    fn settle(&self, outcome: Result<Outcome, ActorError>) -> Result<JsValue, ActorError> {
        match outcome? {
            Outcome::Returned(value) => self.engine.with_limit_lifted(|| {
                self.context.with(|ctx| -> Result<JsValue, ActorError> {
                    let value = value.restore(&ctx).map_err(ConversionError::from)?;
                    Ok(to_js_value(&ctx, self.context.functions(), value)?)
                })
            }),
            Outcome::Thrown(thrown) => {
                let at_limit = self.engine.at_memory_limit();
                let err = self.engine.with_limit_lifted(|| {
                    self.context.with(|ctx| match thrown.restore(&ctx) {
                        Ok(value) => Ok(classify(&value, at_limit)),
                        Err(err) => Err(ActorError::Internal(err.to_string())),
                    })
                })?;
                if err.is_out_of_memory() {
                    warn!(
                        limit = ?self.engine.memory_limit(),
                        used = self.engine.memory_used(),
                        "script ran out of memory"
                    );
                }
                Err(err.into())
            }
        }
    }

    fn next_module_name(&self) -> String {
        let seq = self.module_seq.get();
        self.module_seq.set(seq + 1);
        format!("<module-{}>", seq)
    }
}

impl Drop for ActorCore {
    fn drop(&mut self) {
        if let Some(mut host) = self.host.take() {
            host.unregister(&self.engine, &self.context, &self.actor);
        }
        self.actor.mark_closed();

        let leaked = self.context.teardown();
        if leaked > 0 {
            warn!(
                context = %self.context.id(),
                leaked,
                "function handles not released before shutdown"
            );
        }
        info!(context = %self.context.id(), "actor stopped");
    }
}

/// Pin the result of an engine operation so it can be read in a later
/// `with` block.
fn capture<'js>(
    ctx: &Ctx<'js>,
    result: rquickjs::Result<Value<'js>>,
) -> Result<Outcome, ActorError> {
    match result {
        Ok(value) => Ok(Outcome::Returned(Persistent::save(ctx, value))),
        Err(rquickjs::Error::Exception) => Ok(Outcome::Thrown(Persistent::save(ctx, ctx.catch()))),
        Err(rquickjs::Error::Allocation) => Err(ScriptError::out_of_memory().into()),
        Err(err) => Err(ActorError::Internal(err.to_string())),
    }
}

/// When the heap is at its cap the engine cannot allocate the error object
/// itself and throws `null` instead. Any other thrown value keeps its cause.
fn classify(thrown: &Value<'_>, at_limit: bool) -> ScriptError {
    let bare = thrown.is_null() || thrown.type_of() == Type::Uninitialized;
    if at_limit && bare {
        return ScriptError::out_of_memory();
    }
    let err = ScriptError::from_thrown(thrown);
    if err.is_out_of_memory() {
        ScriptError::out_of_memory()
    } else {
        err
    }
}

fn strip_if(err: ActorError, strip: bool) -> ActorError {
    match err {
        ActorError::Script(script) if strip => ActorError::Script(script.stripped()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(config: ActorConfig) -> ActorHandle {
        spawn_actor_thread(config, Arc::new(HandleRegistry::new()), Box::new(())).unwrap()
    }

    #[test]
    fn test_eval_returns_last_expression() {
        let actor = spawn(ActorConfig::default());
        assert_eq!(actor.eval("1 + 2", EvalMode::GLOBAL).unwrap(), JsValue::Int(3));
        assert_eq!(
            actor.eval("'a' + 'b'", EvalMode::GLOBAL).unwrap(),
            JsValue::from("ab")
        );
        actor.close();
    }

    #[test]
    fn test_strict_flag_rejects_undeclared_assignment() {
        let actor = spawn(ActorConfig::default());
        assert!(actor.eval("undeclared = 1", EvalMode::GLOBAL).is_ok());

        let err = actor
            .eval("alsoUndeclared = 1", EvalMode::GLOBAL.strict())
            .unwrap_err();
        let script = err.as_script().unwrap();
        assert!(script.cause.starts_with("ReferenceError"), "{}", script.cause);
        actor.close();
    }

    #[test]
    fn test_thrown_error_carries_position_unless_stripped() {
        let actor = spawn(ActorConfig::default());
        let source = "\nthrow new TypeError('bad input');";

        let err = actor.eval(source, EvalMode::GLOBAL).unwrap_err();
        let script = err.as_script().unwrap();
        assert_eq!(script.cause, "TypeError: bad input");
        assert_eq!(script.message.as_deref(), Some("bad input"));
        assert!(script.stack.is_some());

        let syntax = "var ok = 1;\nvar broken = ;";
        let err = actor.eval(syntax, EvalMode::GLOBAL).unwrap_err();
        let script = err.as_script().unwrap();
        assert!(script.cause.starts_with("SyntaxError"), "{}", script.cause);
        assert!(script.file_name.is_some());
        assert_eq!(script.line_number, Some(2));

        let err = actor.eval(syntax, EvalMode::GLOBAL.strip()).unwrap_err();
        let script = err.as_script().unwrap();
        assert!(script.file_name.is_none());
        assert!(script.line_number.is_none());

        let err = actor.eval(source, EvalMode::GLOBAL.strip()).unwrap_err();
        let script = err.as_script().unwrap();
        assert_eq!(script.cause, "TypeError: bad input");
        assert!(script.stack.is_none());
        assert!(script.file_name.is_none());
        assert!(script.line_number.is_none());
        actor.close();
    }

    #[test]
    fn test_thrown_primitive_becomes_cause() {
        let actor = spawn(ActorConfig::default());
        let err = actor.eval("throw 'plain'", EvalMode::GLOBAL).unwrap_err();
        assert_eq!(err.as_script().unwrap().cause, "plain");
        actor.close();
    }

    #[test]
    fn test_thrown_primitive_near_memory_cap_keeps_cause() {
        struct TightCap;

        impl HostInterface for TightCap {
            fn register(
                &mut self,
                engine: &Engine,
                _context: &ScriptContext,
                _actor: &ActorHandle,
            ) -> bool {
                engine.set_memory_limit(engine.memory_used() + 12 * 1024);
                true
            }
        }

        let actor = spawn_actor_thread(
            ActorConfig::default(),
            Arc::new(HandleRegistry::new()),
            Box::new(TightCap),
        )
        .unwrap();
        assert_eq!(actor.eval("1", EvalMode::GLOBAL).unwrap(), JsValue::Int(1));

        let err = actor.eval("throw 7", EvalMode::GLOBAL).unwrap_err();
        assert_eq!(err.as_script().unwrap().cause, "7");
        let err = actor.eval("throw 'plain'", EvalMode::GLOBAL).unwrap_err();
        assert_eq!(err.as_script().unwrap().cause, "plain");
        actor.close();
    }

    #[test]
    fn test_classify_only_treats_null_at_cap_as_out_of_memory() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let null = Value::new_null(ctx.clone());
            assert!(classify(&null, true).is_out_of_memory());
            assert!(!classify(&null, false).is_out_of_memory());

            let seven = Value::new_int(ctx.clone(), 7);
            assert_eq!(classify(&seven, true).cause, "7");
        });
    }

    #[test]
    fn test_engine_failure_is_internal() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let failed = capture(&ctx, Err(rquickjs::Error::new_from_js("object", "int")));
            assert!(matches!(failed, Err(ActorError::Internal(_))));

            let oom = capture(&ctx, Err(rquickjs::Error::Allocation));
            assert!(matches!(oom, Err(ActorError::Script(err)) if err.is_out_of_memory()));
        });
    }

    #[test]
    fn test_module_eval_runs_and_propagates_errors() {
        let actor = spawn(ActorConfig::default());
        let result = actor
            .eval("globalThis.fromModule = 40 + 2;", EvalMode::MODULE)
            .unwrap();
        assert!(result.is_nullish());
        assert_eq!(
            actor.eval("fromModule", EvalMode::GLOBAL).unwrap(),
            JsValue::Int(42)
        );

        let err = actor
            .eval("throw new RangeError('in module');", EvalMode::MODULE)
            .unwrap_err();
        assert_eq!(err.as_script().unwrap().cause, "RangeError: in module");
        actor.close();
    }

    #[test]
    fn test_promise_jobs_drain_after_eval() {
        let actor = spawn(ActorConfig::default());
        actor
            .eval(
                "var settled = false; Promise.resolve().then(() => { settled = true; });",
                EvalMode::GLOBAL,
            )
            .unwrap();
        assert_eq!(
            actor.eval("settled", EvalMode::GLOBAL).unwrap(),
            JsValue::Bool(true)
        );
        actor.close();
    }

    #[test]
    fn test_call_uses_captured_receiver() {
        let actor = spawn(ActorConfig::default());
        let counter = actor
            .eval(
                "({ count: 10, bump(by) { this.count += by; return this.count; } })",
                EvalMode::GLOBAL,
            )
            .unwrap();
        let JsValue::Object(fields) = counter else {
            panic!("expected object");
        };
        let bump = fields.get("bump").cloned().unwrap();

        let first = actor
            .call(JsValue::Null, bump.clone(), vec![JsValue::Int(5)])
            .unwrap();
        assert_eq!(first, JsValue::Int(15));
        let second = actor
            .call(JsValue::Undefined, bump, vec![JsValue::Int(1)])
            .unwrap();
        assert_eq!(second, JsValue::Int(16));
        actor.close();
    }

    #[test]
    fn test_call_with_explicit_this() {
        let actor = spawn(ActorConfig::default());
        let describe = actor
            .eval("(function () { return this.name; })", EvalMode::GLOBAL)
            .unwrap();
        let mut this = indexmap::IndexMap::new();
        this.insert("name".to_string(), JsValue::from("explicit"));

        let result = actor.call(JsValue::Object(this), describe, vec![]).unwrap();
        assert_eq!(result, JsValue::from("explicit"));
        actor.close();
    }

    #[test]
    fn test_call_errors() {
        let actor = spawn(ActorConfig::default());
        assert_eq!(
            actor.call(JsValue::Null, JsValue::Int(1), vec![]),
            Err(ActorError::NotAFunction)
        );
        assert_eq!(
            actor.call(JsValue::Null, JsValue::Function { id: 9999 }, vec![]),
            Err(ActorError::UnknownFunction(9999))
        );

        let thrower = actor
            .eval("(() => { throw new Error('from call'); })", EvalMode::GLOBAL)
            .unwrap();
        let err = actor.call(JsValue::Null, thrower, vec![]).unwrap_err();
        assert_eq!(err.as_script().unwrap().cause, "Error: from call");
        actor.close();
    }

    #[test]
    fn test_release_forgets_function() {
        let actor = spawn(ActorConfig::default());
        let function = actor.eval("(() => 7)", EvalMode::GLOBAL).unwrap();
        let id = function.function_id().unwrap();

        assert_eq!(actor.release(id), Ok(true));
        assert_eq!(actor.release(id), Ok(false));
        assert_eq!(
            actor.call(JsValue::Null, function, vec![]),
            Err(ActorError::UnknownFunction(id))
        );
        actor.close();
    }

    #[test]
    fn test_bootstrap_runs_before_first_request() {
        let actor = spawn(ActorConfig::new().with_bootstrap("var greeting = 'hi';"));
        assert_eq!(
            actor.eval("greeting", EvalMode::GLOBAL).unwrap(),
            JsValue::from("hi")
        );
        actor.close();
    }

    #[test]
    fn test_failing_bootstrap_aborts_spawn() {
        let err = spawn_actor_thread(
            ActorConfig::new().with_bootstrap("throw new Error('nope')"),
            Arc::new(HandleRegistry::new()),
            Box::new(()),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ActorError::Startup("bootstrap: Error: nope".to_string())
        );
    }

    #[test]
    fn test_console_can_be_disabled() {
        let actor = spawn(ActorConfig::new().with_console(false));
        assert_eq!(
            actor.eval("typeof console", EvalMode::GLOBAL).unwrap(),
            JsValue::from("undefined")
        );
        assert!(actor.registry().is_empty());
        actor.close();
    }
}
