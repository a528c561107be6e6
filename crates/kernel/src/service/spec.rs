//! Schemas of the service types the host knows about.
//!
//! Services of these types are validated on registration. Any other type must
//! carry the `#` prefix to mark it as an ad hoc, unchecked type.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde_json::json;

use crate::plugin::schema::Schema;

/// Prefix reserved for service types without a declared schema.
pub const CUSTOM_TYPE_PREFIX: char = '#';

static SERVICE_SPECS: LazyLock<BTreeMap<&'static str, Schema>> = LazyLock::new(|| {
    let mut specs = BTreeMap::new();
    specs.insert(
        "operator",
        Schema::builtin(json!({
            "type": "object",
            "required": ["name", "type"],
            "properties": {
                "name": { "type": "string", "minLength": 1 },
                "type": { "enum": ["operator"] },
                "ui": { "type": ["string", "array", "null"] },
                "inputs": { "type": ["object", "null"] },
                "outputs": { "type": ["object", "null"] }
            }
        })),
    );
    specs.insert(
        "engine",
        Schema::builtin(json!({
            "type": "object",
            "required": ["name", "type", "url"],
            "properties": {
                "name": { "type": "string", "minLength": 1 },
                "type": { "enum": ["engine"] },
                "url": { "type": "string", "minLength": 1 },
                "pluginType": { "type": "string" },
                "icon": { "type": "string" },
                "description": { "type": "string" }
            }
        })),
    );
    specs.insert(
        "engine-factory",
        Schema::builtin(json!({
            "type": "object",
            "required": ["name", "type"],
            "properties": {
                "name": { "type": "string", "minLength": 1 },
                "type": { "enum": ["engine-factory"] },
                "icon": { "type": "string" },
                "description": { "type": "string" }
            }
        })),
    );
    specs.insert(
        "file-manager",
        Schema::builtin(json!({
            "type": "object",
            "required": ["name", "type", "url"],
            "properties": {
                "name": { "type": "string", "minLength": 1 },
                "type": { "enum": ["file-manager"] },
                "url": { "type": "string", "minLength": 1 },
                "icon": { "type": "string" },
                "description": { "type": "string" }
            }
        })),
    );
    specs
});

/// Schema for a known service type.
pub fn service_schema(service_type: &str) -> Option<&'static Schema> {
    SERVICE_SPECS.get(service_type)
}

pub fn known_service_types() -> Vec<&'static str> {
    SERVICE_SPECS.keys().copied().collect()
}
