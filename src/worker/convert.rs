//! JSON <-> script value conversion at the namespace boundary.
use rhai::{Array, Dynamic, Map as ScriptMap};
use serde_json::{Map, Number, Value};

pub fn json_to_dynamic(value: &Value) -> Result<Dynamic, String> {
    rhai::serde::to_dynamic(value).map_err(|e| e.to_string())
}

/// Convert a script value into JSON. Values with no JSON form (function
/// pointers, non-finite floats, host objects) are rejected with a
/// Python-style message naming the offending type.
pub fn dynamic_to_json(value: &Dynamic) -> Result<Value, String> {
    let value = value.flatten_clone();

    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("Out of range float values are not JSON compliant: {f}"));
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if value.is_string() {
        return Ok(Value::String(value.to_string()));
    }
    if value.is_array() {
        let items = value.cast::<Array>();
        return items.iter().map(dynamic_to_json).collect::<Result<_, _>>().map(Value::Array);
    }
    if value.is_map() {
        let entries = value.cast::<ScriptMap>();
        let mut object = Map::with_capacity(entries.len());
        for (key, item) in &entries {
            object.insert(key.to_string(), dynamic_to_json(item)?);
        }
        return Ok(Value::Object(object));
    }
    if value.is_blob() {
        let bytes = value.cast::<rhai::Blob>();
        return Ok(Value::Array(bytes.into_iter().map(Value::from).collect()));
    }

    Err(format!(
        "Object of type {} is not JSON serializable",
        value.type_name()
    ))
}
