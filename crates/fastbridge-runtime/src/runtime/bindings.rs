//! Native bindings exposed to handler scripts.
//!
//! Handler code sees a single global `fastbridge` object. Scripts bind
//! route handlers through it at load time:
//!
//! ```js
//! fastbridge.register('orders.create', function(args) {
//!     return { id: 1 };
//! });
//! ```
//!
//! Registered functions land in a private `__registry` object that the
//! execution context consults on every dispatch. This module is the single
//! place where native functions enter the interpreter.

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    Context, JsNativeError,
};
use fastbridge_common::{BridgeError, Result};

/// Name of the global binding object.
pub const GLOBAL_OBJECT: &str = "fastbridge";

/// Property on the global object holding route -> function bindings.
pub const REGISTRY_PROPERTY: &str = "__registry";

/// Installs the `fastbridge` global and its `register` function.
pub(crate) fn install_bindings(ctx: &mut Context) -> Result<()> {
    let bridge_object = JsObject::with_object_proto(ctx.intrinsics());

    let registry = JsObject::with_object_proto(ctx.intrinsics());
    bridge_object
        .set(js_string!(REGISTRY_PROPERTY), registry, false, ctx)
        .map_err(|e| BridgeError::CompileError(e.to_string()))?;

    let register_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure(|_this, args, context| {
            let route = args
                .first()
                .and_then(|v| v.as_string())
                .ok_or_else(|| {
                    JsNativeError::typ().with_message("route name must be a string")
                })?
                .to_std_string()
                .map_err(|e| {
                    JsNativeError::typ().with_message(format!("invalid route name: {e:?}"))
                })?;

            let handler = args.get(1).ok_or_else(|| {
                JsNativeError::typ().with_message("handler function required")
            })?;
            if !handler
                .as_object()
                .map_or(false, |o| o.is_callable())
            {
                return Err(JsNativeError::typ()
                    .with_message("handler must be a function")
                    .into());
            }

            let bridge = context
                .global_object()
                .get(js_string!(GLOBAL_OBJECT), context)?;
            let bridge_obj = bridge.as_object().ok_or_else(|| {
                JsNativeError::typ().with_message("fastbridge global is not an object")
            })?;
            let registry = bridge_obj
                .get(js_string!(REGISTRY_PROPERTY), context)?;
            let registry_obj = registry.as_object().ok_or_else(|| {
                JsNativeError::typ().with_message("handler registry is not an object")
            })?;

            // duplicate registration within one handler set is a load error
            let existing = registry_obj.get(js_string!(route.as_str()), context)?;
            if !existing.is_undefined() {
                return Err(JsNativeError::typ()
                    .with_message(format!("route '{route}' is already registered"))
                    .into());
            }

            registry_obj.set(
                js_string!(route.as_str()),
                handler.clone(),
                false,
                context,
            )?;
            Ok(boa_engine::JsValue::undefined())
        }),
    )
    .name("register")
    .length(2)
    .build();

    bridge_object
        .set(js_string!("register"), register_fn, false, ctx)
        .map_err(|e| BridgeError::CompileError(e.to_string()))?;

    ctx.register_global_property(
        js_string!(GLOBAL_OBJECT),
        bridge_object,
        boa_engine::property::Attribute::all(),
    )
    .map_err(|e| BridgeError::CompileError(e.to_string()))?;

    Ok(())
}
