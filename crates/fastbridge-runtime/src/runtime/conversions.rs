//! JSON <-> JavaScript value conversions.
//!
//! Handler arguments arrive as JSON (or raw bytes) in a transfer buffer and
//! must cross into the interpreter as native values; results make the trip
//! back. Symbol keys are skipped on the way out and `undefined` collapses
//! to JSON `null`.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use fastbridge_common::{BridgeError, Result};
use serde_json::Value as JsonValue;

/// Converts a JSON value to its interpreter equivalent.
pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .or_else(|| n.as_i64().map(JsValue::new))
            .ok_or_else(|| BridgeError::Encoding("number out of range".into())),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.iter().enumerate() {
                let element = json_to_js_value(v, ctx)?;
                js_array.push(element, ctx).map_err(|e| {
                    BridgeError::Encoding(format!("failed to push array element {i}: {e}"))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let element = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.as_str()), element, ctx)
                    .map_err(|e| {
                        BridgeError::Encoding(format!("failed to set property '{key}': {e}"))
                    })?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Converts raw payload bytes to a JavaScript array of byte values.
pub fn bytes_to_js_value(bytes: &[u8], ctx: &mut Context) -> Result<JsValue> {
    let js_array = JsArray::new(ctx);
    for (i, b) in bytes.iter().enumerate() {
        js_array.push(JsValue::new(*b as i32), ctx).map_err(|e| {
            BridgeError::Encoding(format!("failed to push byte {i}: {e}"))
        })?;
    }
    Ok(js_array.into())
}

/// Converts an interpreter value back to JSON.
pub fn js_value_to_json(value: JsValue, ctx: &mut Context) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let JsValue::Integer(i) = &value {
        return Ok(JsonValue::Number((*i).into()));
    }

    if let Some(n) = value.as_number() {
        // whole numbers come back as JSON integers regardless of how the
        // interpreter represented them internally
        if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
            return Ok(JsonValue::Number((n as i64).into()));
        }
        return serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .ok_or_else(|| BridgeError::Encoding("non-finite number in handler result".into()));
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string().map_err(|e| {
            BridgeError::Encoding(format!("string conversion error: {e:?}"))
        })?));
    }

    if let Some(obj) = value.as_object() {
        if obj.is_array() {
            let array = JsArray::from_object(obj.clone())
                .map_err(|e| BridgeError::Encoding(format!("not a valid array: {e}")))?;
            let length: usize = array
                .length(ctx)
                .map_err(|e| BridgeError::Encoding(format!("failed to get array length: {e}")))?
                .try_into()
                .map_err(|_| BridgeError::Encoding("array length overflow".into()))?;

            let mut result = Vec::with_capacity(length);
            for i in 0..length {
                let element = array.get(i, ctx).map_err(|e| {
                    BridgeError::Encoding(format!("failed to get array element {i}: {e}"))
                })?;
                result.push(js_value_to_json(element, ctx)?);
            }
            return Ok(JsonValue::Array(result));
        }

        let keys = obj
            .own_property_keys(ctx)
            .map_err(|e| BridgeError::Encoding(format!("failed to get object keys: {e}")))?;

        let mut result = serde_json::Map::new();
        for key in keys {
            let key_str = match &key {
                PropertyKey::String(s) => s.to_std_string().map_err(|e| {
                    BridgeError::Encoding(format!("string conversion error: {e:?}"))
                })?,
                PropertyKey::Index(i) => i.get().to_string(),
                PropertyKey::Symbol(_) => continue,
            };
            let prop = obj.get(key, ctx).map_err(|e| {
                BridgeError::Encoding(format!("failed to get property '{key_str}': {e}"))
            })?;
            result.insert(key_str, js_value_to_json(prop, ctx)?);
        }
        return Ok(JsonValue::Object(result));
    }

    // symbols and anything else without a JSON shape
    Ok(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(value: JsonValue) -> JsonValue {
        let mut ctx = Context::default();
        let js = json_to_js_value(&value, &mut ctx).unwrap();
        js_value_to_json(js, &mut ctx).unwrap()
    }

    #[test]
    fn test_primitives_round_trip() {
        assert_eq!(round_trip(json!(null)), json!(null));
        assert_eq!(round_trip(json!(true)), json!(true));
        assert_eq!(round_trip(json!("hello")), json!("hello"));
        assert_eq!(round_trip(json!(42)), json!(42));
        assert_eq!(round_trip(json!(1.5)), json!(1.5));
    }

    #[test]
    fn test_nested_structure_round_trips() {
        let value = json!({"a": [1, 2, {"b": "c"}], "d": null});
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_bytes_become_array_of_numbers() {
        let mut ctx = Context::default();
        let js = bytes_to_js_value(&[0, 127, 255], &mut ctx).unwrap();
        let back = js_value_to_json(js, &mut ctx).unwrap();
        assert_eq!(back, json!([0, 127, 255]));
    }

    #[test]
    fn test_undefined_maps_to_null() {
        let mut ctx = Context::default();
        let back = js_value_to_json(JsValue::undefined(), &mut ctx).unwrap();
        assert_eq!(back, json!(null));
    }
}
