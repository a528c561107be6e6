//! JSON schemas for plugin configs, operations, and services.
//!
//! Schemas are draft-07 documents compiled with `jsonschema`. Validation
//! collects every violation rather than stopping at the first one.

use std::fmt;
use std::sync::{Arc, LazyLock};

use jsonschema::Validator;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// A single place where an instance breaks its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// JSON-pointer style location, `/` for the root.
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A schema document that is itself malformed.
#[derive(Debug, Clone, Error)]
#[error("invalid schema at {path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

/// A compiled schema ready for validation.
#[derive(Clone)]
pub struct Schema {
    root: Value,
    validator: Arc<Validator>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("root", &self.root).finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl Schema {
    /// Compile a schema document, checking it against the draft-07 meta-schema.
    pub fn compile(root: Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::draft7::options()
            .build(&root)
            .map_err(|e| SchemaError {
                path: display_path(&e.instance_path.to_string()),
                message: e.to_string(),
            })?;
        Ok(Self {
            root,
            validator: Arc::new(validator),
        })
    }

    /// Compile a schema literal defined in this crate.
    #[allow(clippy::expect_used)]
    pub(crate) fn builtin(root: Value) -> Self {
        Self::compile(root).expect("built-in schema must compile")
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Validate an instance, returning every violation found.
    pub fn validate(&self, instance: &Value) -> Vec<SchemaViolation> {
        self.validator
            .iter_errors(instance)
            .map(|e| SchemaViolation::new(display_path(&e.instance_path.to_string()), e.to_string()))
            .collect()
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

static PLUGIN_CONFIG_SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
    Schema::builtin(json!({
        "type": "object",
        "required": ["name", "type"],
        "properties": {
            "name": { "type": "string", "minLength": 1 },
            "type": { "type": "string", "minLength": 1 },
            "tags": { "type": "array", "items": { "type": "string" } },
            "version": { "type": "string" },
            "api_version": { "type": "string" },
            "description": { "type": "string" },
            "ui": { "type": ["string", "array", "null"] },
            "inputs": { "type": ["object", "null"] },
            "outputs": { "type": ["object", "null"] },
            "dependencies": { "type": "array", "items": { "type": "string" } },
            "requirements": { "type": ["array", "string", "null"] },
            "flags": { "type": "array", "items": { "type": "string" } },
            "icon": { "type": ["string", "null"] },
            "cover": { "type": ["string", "array", "null"] },
            "env": { "type": ["string", "array", "object", "null"] },
            "defaults": { "type": ["object", "null"] },
            "runnable": { "type": "boolean" },
            "resumed": { "type": "boolean" },
            "lang": { "type": "string" }
        }
    }))
});

static OP_SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
    Schema::builtin(json!({
        "type": "object",
        "required": ["name"],
        "properties": {
            "name": { "type": "string", "minLength": 1 },
            "type": { "type": "string" },
            "ui": { "type": ["string", "array", "null"] },
            "inputs": { "type": ["object", "null"] },
            "outputs": { "type": ["object", "null"] },
            "show_panel": { "type": "boolean" }
        }
    }))
});

/// Schema every parsed plugin config must satisfy.
pub fn plugin_config_schema() -> &'static Schema {
    &PLUGIN_CONFIG_SCHEMA
}

/// Schema for operation-style registrations.
pub fn op_schema() -> &'static Schema {
    &OP_SCHEMA
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn compile_rejects_unknown_type() {
        assert!(Schema::compile(json!({ "type": "text" })).is_err());
    }

    #[test]
    fn compile_rejects_malformed_keywords() {
        assert!(Schema::compile(json!({ "type": "object", "required": "name" })).is_err());
        assert!(Schema::compile(json!({ "minimum": "zero" })).is_err());
    }

    #[test]
    fn reports_all_object_violations() {
        let schema = Schema::compile(json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {
                "a": { "type": "number" },
                "c": { "type": "array", "items": { "type": "string" } }
            }
        }))
        .unwrap();

        let violations = schema.validate(&json!({ "a": "one", "c": ["x", 2] }));
        let rendered: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert_eq!(violations.len(), 3, "{rendered:?}");
        assert!(violations.iter().any(|v| v.path == "/" && v.message.contains("\"b\"")));
        assert!(violations.iter().any(|v| v.path == "/a"));
        assert!(violations.iter().any(|v| v.path == "/c/1"));
    }

    #[test]
    fn numeric_string_and_combinator_keywords_are_enforced() {
        let schema = Schema::compile(json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "minimum": 0 },
                "b": { "maxLength": 2 },
                "c": { "const": 5 },
                "d": { "oneOf": [{ "type": "string" }, { "type": "number" }] }
            }
        }))
        .unwrap();

        let violations = schema.validate(&json!({ "a": -5, "b": "toolong", "c": 7, "d": true }));
        let mut paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["/a", "/b", "/c", "/d"]);
        assert!(schema.is_valid(&json!({ "a": 1, "b": "ok", "c": 5, "d": "x" })));
    }

    #[test]
    fn refs_resolve_against_definitions() {
        let schema = Schema::compile(json!({
            "definitions": { "port": { "type": "integer", "maximum": 65535 } },
            "type": "object",
            "properties": { "port": { "$ref": "#/definitions/port" } }
        }))
        .unwrap();
        assert!(schema.is_valid(&json!({ "port": 8080 })));
        assert!(!schema.is_valid(&json!({ "port": 70000 })));
    }

    #[test]
    fn any_of_and_enum() {
        let schema = Schema::compile(json!({
            "anyOf": [
                { "type": "string", "enum": ["a", "b"] },
                { "type": "null" }
            ]
        }))
        .unwrap();
        assert!(schema.is_valid(&json!("a")));
        assert!(schema.is_valid(&Value::Null));
        assert!(!schema.is_valid(&json!("c")));
    }

    #[test]
    fn closed_objects_reject_extra_keys() {
        let schema = Schema::compile(json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "additionalProperties": false
        }))
        .unwrap();
        let violations = schema.validate(&json!({ "url": "x", "port": 1 }));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("port"));
    }

    #[test]
    fn plugin_schema_requires_name_and_type() {
        let violations = plugin_config_schema().validate(&json!({ "version": "0.1.0" }));
        assert_eq!(violations.len(), 2);
    }
}
