//! JSON Schema helpers over `schemars`.
//!
//! Schemas are generated from the Rust types, so prompts that embed them and
//! the validator that checks model output cannot drift from the types.

use schemars::JsonSchema;
use serde_json::Value;

/// The generated schema for `T` as a plain JSON value.
pub fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

/// Pretty-printed schema for embedding in prompts.
pub fn schema_text<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_value::<T>()).unwrap_or_default()
}

/// Follows `$ref` (and single-element `allOf`) to the schema it points at.
fn resolve<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        let pointer = reference.trim_start_matches('#');
        return match root.pointer(pointer) {
            Some(target) => resolve(target, root),
            None => schema,
        };
    }
    if let Some([only]) = schema.get("allOf").and_then(Value::as_array).map(Vec::as_slice) {
        return resolve(only, root);
    }
    schema
}

/// Dot paths of every leaf field (strings and lists) in `T`'s schema.
pub fn leaf_paths<T: JsonSchema>() -> Vec<String> {
    let root = schema_value::<T>();
    let mut paths = Vec::new();
    collect_leaves(&root, &root, "", &mut paths);
    paths
}

fn collect_leaves(schema: &Value, root: &Value, prefix: &str, out: &mut Vec<String>) {
    let schema = resolve(schema, root);
    match schema.get("properties").and_then(Value::as_object) {
        Some(props) => {
            for (name, child) in props {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}.{name}")
                };
                collect_leaves(child, root, &path, out);
            }
        }
        None if !prefix.is_empty() => out.push(prefix.to_string()),
        None => {}
    }
}

/// Validates `value` against `T`'s schema, returning every violation found.
pub fn violations<T: JsonSchema>(value: &Value) -> Vec<String> {
    let root = schema_value::<T>();
    let mut errors = Vec::new();
    check(value, &root, &root, "$", &mut errors);
    errors
}

fn check(value: &Value, schema: &Value, root: &Value, path: &str, errors: &mut Vec<String>) {
    let schema = resolve(schema, root);

    if let Some(expected) = schema.get("type")
        && !type_matches(value, expected)
    {
        errors.push(format!(
            "{path}: expected {}, found {}",
            type_label(expected),
            kind_of(value)
        ));
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        errors.push(format!("{path}: {value} is not one of {}", Value::Array(allowed.clone())));
        return;
    }

    if let Value::Object(map) = value {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    errors.push(format!("{path}: missing required field `{name}`"));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, child_schema) in props {
                if let Some(child) = map.get(name) {
                    check(child, child_schema, root, &format!("{path}.{name}"), errors);
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, root, &format!("{path}[{i}]"), errors);
        }
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(name) => is_kind(value, name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_kind(value, name)),
        _ => true,
    }
}

fn is_kind(value: &Value, name: &str) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        _ => true,
    }
}

fn type_label(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
