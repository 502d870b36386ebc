//! Structural check for structured-output JSON schemas.
//!
//! Only the strict-mode subset accepted by chat-completions structured output
//! is allowed. `$ref` targets are checked for shape, not resolved.

use serde_json::{Map, Value};

pub const MAX_NESTING_DEPTH: usize = 5;
pub const MAX_TOTAL_PROPERTIES: usize = 100;

const SUPPORTED_TYPES: &[&str] = &[
    "string", "number", "integer", "boolean", "object", "array", "null",
];

const SUPPORTED_KEYWORDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "items",
    "enum",
    "const",
    "description",
    "additionalProperties",
    "anyOf",
    "$defs",
    "definitions",
    "$ref",
    "title",
    "default",
];

/// First offending node found while validating a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON-pointer-like location, `#` for the root.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub fn validate_response_schema(schema: &Value) -> Result<(), SchemaViolation> {
    let mut walker = Walker { properties: 0 };
    walker.node(schema, "#", 0)
}

struct Walker {
    properties: usize,
}

impl Walker {
    fn node(&mut self, value: &Value, path: &str, depth: usize) -> Result<(), SchemaViolation> {
        let Some(obj) = value.as_object() else {
            return Err(violation(path, "schema node must be a JSON object"));
        };
        for key in obj.keys() {
            if !SUPPORTED_KEYWORDS.contains(&key.as_str()) {
                return Err(violation(path, format!("unsupported keyword '{key}'")));
            }
        }
        if let Some(t) = obj.get("type") {
            check_type(t, path)?;
        }
        if let Some(r) = obj.get("$ref") {
            check_ref(r, path)?;
        }

        let is_object = obj.contains_key("properties")
            || obj
                .get("type")
                .is_some_and(|t| type_includes(t, "object"));
        let depth = if is_object { depth + 1 } else { depth };
        if depth > MAX_NESTING_DEPTH {
            return Err(violation(
                path,
                format!("nesting depth exceeds {MAX_NESTING_DEPTH}"),
            ));
        }

        if let Some(props) = obj.get("properties") {
            let Some(props) = props.as_object() else {
                return Err(violation(path, "'properties' must be an object"));
            };
            self.properties += props.len();
            if self.properties > MAX_TOTAL_PROPERTIES {
                return Err(violation(
                    path,
                    format!("more than {MAX_TOTAL_PROPERTIES} properties in total"),
                ));
            }
            for (name, child) in props {
                self.node(child, &format!("{path}/properties/{name}"), depth)?;
            }
        }
        check_required(obj, path)?;

        if let Some(items) = obj.get("items") {
            self.node(items, &format!("{path}/items"), depth)?;
        }
        if let Some(ap) = obj.get("additionalProperties")
            && !ap.is_boolean()
        {
            self.node(ap, &format!("{path}/additionalProperties"), depth)?;
        }
        if let Some(any) = obj.get("anyOf") {
            let Some(list) = any.as_array() else {
                return Err(violation(path, "'anyOf' must be an array"));
            };
            for (i, child) in list.iter().enumerate() {
                self.node(child, &format!("{path}/anyOf/{i}"), depth)?;
            }
        }
        for defs_key in ["$defs", "definitions"] {
            if let Some(defs) = obj.get(defs_key) {
                let Some(defs) = defs.as_object() else {
                    return Err(violation(path, format!("'{defs_key}' must be an object")));
                };
                for (name, child) in defs {
                    self.node(child, &format!("{path}/{defs_key}/{name}"), depth)?;
                }
            }
        }
        if let Some(e) = obj.get("enum")
            && !e.is_array()
        {
            return Err(violation(path, "'enum' must be an array"));
        }
        Ok(())
    }
}

fn check_type(t: &Value, path: &str) -> Result<(), SchemaViolation> {
    let names: Vec<&Value> = match t {
        Value::Array(list) if !list.is_empty() => list.iter().collect(),
        Value::Array(_) => return Err(violation(path, "'type' list must not be empty")),
        other => vec![other],
    };
    for n in names {
        match n.as_str() {
            Some(s) if SUPPORTED_TYPES.contains(&s) => {}
            Some(s) => return Err(violation(path, format!("unsupported type '{s}'"))),
            None => return Err(violation(path, "'type' must be a string or list of strings")),
        }
    }
    Ok(())
}

fn type_includes(t: &Value, name: &str) -> bool {
    match t {
        Value::String(s) => s == name,
        Value::Array(list) => list.iter().any(|v| v.as_str() == Some(name)),
        _ => false,
    }
}

fn check_ref(r: &Value, path: &str) -> Result<(), SchemaViolation> {
    match r.as_str() {
        Some(s) if s.starts_with("#/$defs/") || s.starts_with("#/definitions/") || s == "#" => {
            Ok(())
        }
        Some(s) => Err(violation(path, format!("'$ref' must be a local pointer, got '{s}'"))),
        None => Err(violation(path, "'$ref' must be a string")),
    }
}

fn check_required(obj: &Map<String, Value>, path: &str) -> Result<(), SchemaViolation> {
    let Some(required) = obj.get("required") else {
        return Ok(());
    };
    let Some(list) = required.as_array() else {
        return Err(violation(path, "'required' must be an array"));
    };
    let props = obj.get("properties").and_then(Value::as_object);
    for entry in list {
        let Some(name) = entry.as_str() else {
            return Err(violation(path, "'required' entries must be strings"));
        };
        if !props.is_some_and(|p| p.contains_key(name)) {
            return Err(violation(
                path,
                format!("required property '{name}' is not declared"),
            ));
        }
    }
    Ok(())
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}
