//! One isolated interpreter instance.
//!
//! A [`ScriptContext`] owns a private Boa `Context` with its own global
//! state and handler bindings. Boa contexts are not thread-safe and never
//! leave the worker thread that created them; isolation between contexts
//! is the guarantee, not parallelism within one.
//!
//! Loading is all-or-nothing: a new context is built from scratch for the
//! incoming handler set and only replaces the old one if every script
//! evaluates cleanly, so bindings are always fully the old set or fully
//! the new set.

use crate::runtime::bindings::{self, GLOBAL_OBJECT, REGISTRY_PROPERTY};
use crate::runtime::conversions::{bytes_to_js_value, js_value_to_json, json_to_js_value};
use crate::runtime::handler_set::HandlerSource;
use boa_engine::{js_string, object::JsObject, property::PropertyKey, Context, Source};
use fastbridge_common::{BridgeError, Result};
use serde_json::Value as JsonValue;

/// Handler input, already decoded from the transfer buffer.
#[derive(Debug)]
pub enum HandlerArgs {
    Json(JsonValue),
    Bytes(Vec<u8>),
}

/// A private interpreter with an evaluated handler set.
pub struct ScriptContext {
    ctx: Context,
    routes: Vec<String>,
}

impl ScriptContext {
    /// Builds a fresh context and evaluates every script in `sources`.
    ///
    /// Any evaluation failure aborts the whole build with
    /// [`BridgeError::CompileError`]; no partially-loaded context is ever
    /// observable.
    pub fn compile(sources: &[HandlerSource]) -> Result<Self> {
        let mut ctx = Context::default();
        bindings::install_bindings(&mut ctx)?;

        for script in sources {
            ctx.eval(Source::from_bytes(script.source.as_ref()))
                .map_err(|e| {
                    BridgeError::CompileError(format!("{}: {}", script.name, e))
                })?;
        }

        let routes = read_registered_routes(&mut ctx)?;
        Ok(Self { ctx, routes })
    }

    /// Routes registered by the loaded handler set, in registration order.
    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    /// Runs the handler bound to `route` against already-decoded arguments.
    ///
    /// A script-level throw surfaces as [`BridgeError::HandlerPanicked`];
    /// the context itself remains usable afterwards.
    pub fn invoke(&mut self, route: &str, args: HandlerArgs) -> Result<JsonValue> {
        let registry = self.registry()?;

        let handler = registry
            .get(js_string!(route), &mut self.ctx)
            .map_err(|e| BridgeError::HandlerPanicked {
                route: route.into(),
                message: format!("registry lookup failed: {e}"),
            })?;
        if handler.is_undefined() {
            return Err(BridgeError::HandlerNotFound(route.into()));
        }
        let handler_obj = handler
            .as_object()
            .ok_or_else(|| BridgeError::HandlerNotFound(route.into()))?;

        let js_args = match args {
            HandlerArgs::Json(json) => json_to_js_value(&json, &mut self.ctx)?,
            HandlerArgs::Bytes(bytes) => bytes_to_js_value(&bytes, &mut self.ctx)?,
        };

        let result = handler_obj
            .call(
                &boa_engine::JsValue::undefined(),
                &[js_args],
                &mut self.ctx,
            )
            .map_err(|e| BridgeError::HandlerPanicked {
                route: route.into(),
                message: e.to_string(),
            })?;

        js_value_to_json(result, &mut self.ctx)
    }

    fn registry(&mut self) -> Result<JsObject> {
        let bridge = self
            .ctx
            .global_object()
            .get(js_string!(GLOBAL_OBJECT), &mut self.ctx)
            .map_err(|e| BridgeError::CompileError(e.to_string()))?;
        let registry = bridge
            .as_object()
            .and_then(|o| o.get(js_string!(REGISTRY_PROPERTY), &mut self.ctx).ok())
            .ok_or_else(|| BridgeError::CompileError("handler registry missing".into()))?;
        registry
            .as_object()
            .cloned()
            .ok_or_else(|| BridgeError::CompileError("handler registry is not an object".into()))
    }
}

/// Reads the route names out of the `__registry` object, preserving
/// registration order.
fn read_registered_routes(ctx: &mut Context) -> Result<Vec<String>> {
    let bridge = ctx
        .global_object()
        .get(js_string!(GLOBAL_OBJECT), ctx)
        .map_err(|e| BridgeError::CompileError(e.to_string()))?;
    let registry = bridge
        .as_object()
        .and_then(|o| o.get(js_string!(REGISTRY_PROPERTY), ctx).ok())
        .ok_or_else(|| BridgeError::CompileError("handler registry missing".into()))?;
    let registry_obj = registry
        .as_object()
        .ok_or_else(|| BridgeError::CompileError("handler registry is not an object".into()))?;

    let keys = registry_obj
        .own_property_keys(ctx)
        .map_err(|e| BridgeError::CompileError(e.to_string()))?;

    let mut routes = Vec::with_capacity(keys.len());
    for key in keys {
        match key {
            PropertyKey::String(s) => routes.push(s.to_std_string().map_err(|e| {
                BridgeError::CompileError(format!("invalid route name: {e:?}"))
            })?),
            PropertyKey::Index(i) => routes.push(i.get().to_string()),
            PropertyKey::Symbol(_) => continue,
        }
    }
    Ok(routes)
}
