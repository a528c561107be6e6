//! Normalizes older config shapes to the current schema.
//!
//! Rules are keyed off the declared `api_version`. Each rule is applied at
//! most once and the names of the applied rules are returned for logging.

use serde_json::{Map, Value};

use super::version::compare_versions;

/// `api_version` assumed when a config omits it.
pub const DEFAULT_API_VERSION: &str = "0.1.0";

fn at_most(api_version: &str, limit: &str) -> bool {
    compare_versions(api_version, limit) != std::cmp::Ordering::Greater
}

fn stringify(config: &mut Map<String, Value>, key: &str) -> bool {
    match config.get(key) {
        Some(Value::Number(n)) => {
            let s = n.to_string();
            config.insert(key.to_string(), Value::String(s));
            true
        }
        _ => false,
    }
}

fn legacy_type(name: &str) -> Option<&'static str> {
    match name {
        "webworker" => Some("web-worker"),
        "webpython" => Some("web-python"),
        "python" | "pyworker" => Some("native-python"),
        _ => None,
    }
}

/// Upgrade a raw config map in place.
pub fn upgrade_config(config: &mut Map<String, Value>) -> Vec<&'static str> {
    let mut applied = Vec::new();

    if stringify(config, "api_version") {
        applied.push("api_version as string");
    }
    if stringify(config, "version") {
        applied.push("version as string");
    }
    if !config.get("api_version").is_some_and(Value::is_string) {
        config.insert(
            "api_version".to_string(),
            Value::String(DEFAULT_API_VERSION.to_string()),
        );
        applied.push("default api_version");
    }

    let api_version = config
        .get("api_version")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_API_VERSION)
        .to_string();

    if at_most(&api_version, "0.1.1")
        && let Some(mode) = config.remove("mode")
    {
        if !config.contains_key("type") {
            config.insert("type".to_string(), mode);
        }
        applied.push("mode renamed to type");
    }

    if at_most(&api_version, "0.1.5") {
        let renamed = config
            .get("type")
            .and_then(Value::as_str)
            .and_then(legacy_type);
        if let Some(new_type) = renamed {
            config.insert("type".to_string(), Value::String(new_type.to_string()));
            applied.push("legacy type name");
        }
    }

    if let Some(Value::String(req)) = config.get("requirements") {
        let wrapped = if req.is_empty() {
            Vec::new()
        } else {
            vec![Value::String(req.clone())]
        };
        config.insert("requirements".to_string(), Value::Array(wrapped));
        applied.push("requirements as list");
    }

    applied
}
