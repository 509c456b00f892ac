//! Conversion between engine values and [`JsValue`] snapshots.
//!
//! Functions cannot be copied out of the engine, so they are kept alive in a
//! per-context [`FunctionTable`] on the actor thread and the snapshot carries
//! only their id.

use crate::runtime::js_value::{
    ConversionError, FunctionId, JsValue, LimitTracker, MAX_JS_BYTES, MAX_JS_DEPTH,
};
use indexmap::IndexMap;
use rquickjs::convert::Coerced;
use rquickjs::{Array, BigInt, Ctx, Function, Object, Persistent, Type, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Stored function with optional receiver for 'this' binding
struct StoredFunction {
    function: Persistent<Function<'static>>,
    receiver: Option<Persistent<Value<'static>>>,
}

/// Script functions retained past the borrow that produced them.
///
/// Only touched on the actor thread. Entries hold engine memory, so the table
/// must be cleared before its context is freed.
#[derive(Default)]
pub(crate) struct FunctionTable {
    functions: RefCell<HashMap<FunctionId, StoredFunction>>,
    next_id: Cell<FunctionId>,
}

impl FunctionTable {
    pub(crate) fn retain<'js>(
        &self,
        ctx: &Ctx<'js>,
        function: Function<'js>,
        receiver: Option<Value<'js>>,
    ) -> FunctionId {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));

        let stored = StoredFunction {
            function: Persistent::save(ctx, function),
            receiver: receiver.map(|receiver| Persistent::save(ctx, receiver)),
        };
        self.functions.borrow_mut().insert(id, stored);
        id
    }

    /// Restore a retained function (and its captured receiver) into `ctx`.
    pub(crate) fn get<'js>(
        &self,
        ctx: &Ctx<'js>,
        id: FunctionId,
    ) -> Result<(Function<'js>, Option<Value<'js>>), ConversionError> {
        let (function, receiver) = {
            let functions = self.functions.borrow();
            let stored = functions
                .get(&id)
                .ok_or(ConversionError::UnknownFunction(id))?;
            (stored.function.clone(), stored.receiver.clone())
        };

        let function = function.restore(ctx)?;
        let receiver = match receiver {
            Some(receiver) => Some(receiver.restore(ctx)?),
            None => None,
        };
        Ok((function, receiver))
    }

    /// Drop a retained function. Returns false if the id was unknown.
    pub(crate) fn release(&self, id: FunctionId) -> bool {
        self.functions.borrow_mut().remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.functions.borrow().len()
    }

    /// Drop every entry, returning how many were still retained.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<StoredFunction> = self
            .functions
            .borrow_mut()
            .drain()
            .map(|(_, stored)| stored)
            .collect();
        drained.len()
    }
}

/// Convert an engine value into a snapshot, retaining any functions found.
///
/// On failure, functions retained before the error are released again.
pub(crate) fn to_js_value<'js>(
    ctx: &Ctx<'js>,
    table: &FunctionTable,
    value: Value<'js>,
) -> Result<JsValue, ConversionError> {
    let mut walk = Walk {
        ancestors: Vec::new(),
        tracker: LimitTracker::new(MAX_JS_DEPTH, MAX_JS_BYTES),
        retained: Vec::new(),
    };
    let result = to_js_value_internal(ctx, table, value, &mut walk, None);
    if result.is_err() {
        for id in walk.retained {
            table.release(id);
        }
    }
    result
}

/// State of one snapshot walk.
struct Walk<'js> {
    ancestors: Vec<Value<'js>>,
    tracker: LimitTracker,
    retained: Vec<FunctionId>,
}

/// Internal recursive converter with cycle detection and optional receiver capture.
fn to_js_value_internal<'js>(
    ctx: &Ctx<'js>,
    table: &FunctionTable,
    value: Value<'js>,
    walk: &mut Walk<'js>,
    receiver: Option<Value<'js>>,
) -> Result<JsValue, ConversionError> {
    walk.tracker.enter()?;

    let result = match value.type_of() {
        Type::Uninitialized | Type::Undefined => {
            walk.tracker.add_bytes(9)?; // "undefined"
            Ok(JsValue::Undefined)
        }
        Type::Null => {
            walk.tracker.add_bytes(4)?;
            Ok(JsValue::Null)
        }
        Type::Bool => {
            walk.tracker.add_bytes(5)?; // "false" (worst case)
            Ok(JsValue::Bool(value.as_bool().unwrap_or_default()))
        }
        Type::Int => {
            walk.tracker.add_bytes(20)?;
            Ok(JsValue::Int(value.as_int().unwrap_or_default().into()))
        }
        Type::Float => {
            walk.tracker.add_bytes(24)?;
            Ok(number_to_js_value(value.as_float().unwrap_or(f64::NAN)))
        }
        Type::String => {
            let string = value
                .as_string()
                .ok_or(ConversionError::Unsupported("string"))?
                .to_string()?;
            walk.tracker.add_bytes(string.len())?;
            Ok(JsValue::String(string))
        }
        Type::BigInt => {
            let bigint: BigInt<'js> = value
                .as_big_int()
                .cloned()
                .ok_or(ConversionError::Unsupported("bigint"))?;
            walk.tracker.add_bytes(20)?;
            bigint
                .to_i64()
                .map(JsValue::BigInt)
                .map_err(|_| ConversionError::Unsupported("BigInt value too large for i64"))
        }
        Type::Symbol => Err(ConversionError::Unsupported("symbol")),
        Type::Function | Type::Constructor => {
            let function = value
                .as_function()
                .cloned()
                .ok_or(ConversionError::Unsupported("function"))?;
            walk.tracker.add_bytes(8)?; // ID size
            let id = table.retain(ctx, function, receiver);
            walk.retained.push(id);
            Ok(JsValue::Function { id })
        }
        Type::Array => {
            if walk.ancestors.contains(&value) {
                return Err(ConversionError::Circular);
            }
            let array: Array<'js> = value
                .as_array()
                .cloned()
                .ok_or(ConversionError::Unsupported("array"))?;

            walk.ancestors.push(value.clone());
            let mut items = Vec::with_capacity(array.len());
            for i in 0..array.len() {
                let item: Value<'js> = array.get(i)?;
                items.push(to_js_value_internal(ctx, table, item, walk, None)?);
            }
            walk.ancestors.pop();
            Ok(JsValue::Array(items))
        }
        Type::Object | Type::Exception => {
            if walk.ancestors.contains(&value) {
                return Err(ConversionError::Circular);
            }
            let object: Object<'js> = value
                .as_object()
                .cloned()
                .ok_or(ConversionError::Unsupported("object"))?;

            walk.ancestors.push(value.clone());
            let mut map = IndexMap::new();
            for prop in object.props::<String, Value<'js>>() {
                let (key, val) = prop?;
                // Functions found on an object keep the object as 'this'.
                let receiver_for_val = if val.is_function() {
                    Some(value.clone())
                } else {
                    None
                };
                walk.tracker.add_bytes(key.len())?;
                let converted = to_js_value_internal(ctx, table, val, walk, receiver_for_val)?;
                map.insert(key, converted);
            }
            walk.ancestors.pop();
            Ok(JsValue::Object(map))
        }
        _ => {
            // Fallback: convert to string
            let string = value.get::<Coerced<String>>()?.0;
            walk.tracker.add_bytes(string.len())?;
            Ok(JsValue::String(string))
        }
    };

    walk.tracker.exit();
    result
}

fn number_to_js_value(num: f64) -> JsValue {
    let integral = num.is_finite() && num.fract() == 0.0 && !(num == 0.0 && num.is_sign_negative());
    if integral && num >= i64::MIN as f64 && num < i64::MAX as f64 {
        JsValue::Int(num as i64)
    } else {
        JsValue::Float(num)
    }
}

/// Materialize a snapshot inside `ctx`.
pub(crate) fn from_js_value<'js>(
    ctx: &Ctx<'js>,
    table: &FunctionTable,
    value: &JsValue,
) -> Result<Value<'js>, ConversionError> {
    let converted = match value {
        JsValue::Undefined => Value::new_undefined(ctx.clone()),
        JsValue::Null => Value::new_null(ctx.clone()),
        JsValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        JsValue::Int(i) => match i32::try_from(*i) {
            Ok(small) => Value::new_int(ctx.clone(), small),
            Err(_) => Value::new_float(ctx.clone(), *i as f64),
        },
        JsValue::Float(f) => Value::new_float(ctx.clone(), *f),
        JsValue::BigInt(i) => BigInt::from_i64(ctx.clone(), *i)?.into_value(),
        JsValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        JsValue::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, from_js_value(ctx, table, item)?)?;
            }
            array.into_value()
        }
        JsValue::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), from_js_value(ctx, table, item)?)?;
            }
            object.into_value()
        }
        JsValue::Function { id } => table.get(ctx, *id)?.0.into_value(),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_ctx<R>(f: impl FnOnce(Ctx<'_>, &FunctionTable) -> R) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let table = FunctionTable::default();
        context.with(|ctx| {
            let result = f(ctx, &table);
            table.clear();
            result
        })
    }

    #[test]
    fn test_plain_values() {
        with_ctx(|ctx, table| {
            let value: Value = ctx
                .eval(r#"({ a: 1, b: 2.5, c: "x", d: [true, null, undefined], e: 2 ** 3 })"#)
                .unwrap();
            let converted = to_js_value(&ctx, table, value).unwrap();

            let JsValue::Object(map) = converted else {
                panic!("expected object, got {:?}", converted);
            };
            assert_eq!(map["a"], JsValue::Int(1));
            assert_eq!(map["b"], JsValue::Float(2.5));
            assert_eq!(map["c"], JsValue::String("x".to_string()));
            assert_eq!(
                map["d"],
                JsValue::Array(vec![JsValue::Bool(true), JsValue::Null, JsValue::Undefined])
            );
            assert_eq!(map["e"], JsValue::Int(8));
        });
    }

    #[test]
    fn test_special_floats_and_bigint() {
        with_ctx(|ctx, table| {
            let value: Value = ctx.eval("[NaN, Infinity, -0, 10n]").unwrap();
            let JsValue::Array(items) = to_js_value(&ctx, table, value).unwrap() else {
                panic!("expected array");
            };
            assert!(matches!(items[0], JsValue::Float(f) if f.is_nan()));
            assert_eq!(items[1], JsValue::Float(f64::INFINITY));
            assert!(matches!(items[2], JsValue::Float(f) if f == 0.0 && f.is_sign_negative()));
            assert_eq!(items[3], JsValue::BigInt(10));
        });
    }

    #[test]
    fn test_circular_reference_detected() {
        with_ctx(|ctx, table| {
            let value: Value = ctx.eval("const o = { name: 'loop' }; o.self = o; o").unwrap();
            let err = to_js_value(&ctx, table, value).unwrap_err();
            assert_eq!(err, ConversionError::Circular);
        });
    }

    #[test]
    fn test_failed_conversion_releases_functions() {
        with_ctx(|ctx, table| {
            for _ in 0..3 {
                let value: Value = ctx
                    .eval("var o = { f() {}, g() {} }; o.self = o; o")
                    .unwrap();
                let err = to_js_value(&ctx, table, value).unwrap_err();
                assert_eq!(err, ConversionError::Circular);
            }
            assert_eq!(table.len(), 0);

            let value: Value = ctx.eval("[() => 1, Symbol('late')]").unwrap();
            assert!(to_js_value(&ctx, table, value).is_err());
            assert_eq!(table.len(), 0);

            let value: Value = ctx.eval("[() => 1]").unwrap();
            to_js_value(&ctx, table, value).unwrap();
            assert_eq!(table.len(), 1);
        });
    }

    #[test]
    fn test_shared_reference_is_not_circular() {
        with_ctx(|ctx, table| {
            let value: Value = ctx.eval("const s = [1]; [s, s]").unwrap();
            let converted = to_js_value(&ctx, table, value).unwrap();
            let inner = JsValue::Array(vec![JsValue::Int(1)]);
            assert_eq!(converted, JsValue::Array(vec![inner.clone(), inner]));
        });
    }

    #[test]
    fn test_symbol_unsupported() {
        with_ctx(|ctx, table| {
            let value: Value = ctx.eval("Symbol('s')").unwrap();
            assert!(matches!(
                to_js_value(&ctx, table, value),
                Err(ConversionError::Unsupported(_))
            ));
        });
    }

    #[test]
    fn test_functions_are_retained_with_receiver() {
        with_ctx(|ctx, table| {
            let value: Value = ctx
                .eval("({ n: 41, next() { return this.n + 1; } })")
                .unwrap();
            let JsValue::Object(map) = to_js_value(&ctx, table, value).unwrap() else {
                panic!("expected object");
            };
            let id = map["next"].function_id().unwrap();
            assert_eq!(table.len(), 1);

            let (function, receiver) = table.get(&ctx, id).unwrap();
            let receiver = receiver.unwrap();
            let result: i32 = function.call((rquickjs::function::This(receiver),)).unwrap();
            assert_eq!(result, 42);

            assert!(table.release(id));
            assert!(!table.release(id));
            assert!(matches!(
                table.get(&ctx, id),
                Err(ConversionError::UnknownFunction(_))
            ));
        });
    }

    #[test]
    fn test_round_trip_into_engine() {
        with_ctx(|ctx, table| {
            let snapshot = JsValue::from(serde_json::json!({
                "list": [1, "two", 3.5],
                "big": 5_000_000_000_i64,
            }));
            let value = from_js_value(&ctx, table, &snapshot).unwrap();
            ctx.globals().set("input", value).unwrap();

            let joined: String = ctx.eval("input.list.join('|') + ':' + input.big").unwrap();
            assert_eq!(joined, "1|two|3.5:5000000000");
        });
    }
}
