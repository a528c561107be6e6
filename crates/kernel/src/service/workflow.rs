//! Projection of operations into the visual workflow registry.

use serde::Serialize;
use serde_json::Value;

/// What the workflow editor needs to show an operation as a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub tags: Vec<String>,
    /// The operation key, used as the node type.
    #[serde(rename = "type")]
    pub op_type: String,
    /// Normalized ui description.
    pub init: String,
}

impl WorkflowTemplate {
    pub fn new(name: &str, op_key: &str, plugin_type: Option<&str>, ui: &Value) -> Self {
        let mut tags = vec!["op".to_string(), "plugin".to_string()];
        if let Some(tag) = plugin_type.and_then(workflow_tag) {
            tags.push(tag.to_string());
        }
        Self {
            name: name.to_string(),
            tags,
            op_type: op_key.to_string(),
            init: normalize_ui(ui),
        }
    }
}

/// Workflow tag for a plugin type.
pub fn workflow_tag(plugin_type: &str) -> Option<&'static str> {
    match plugin_type {
        "window" => Some("window"),
        "rpc-window" => Some("rpc-window"),
        "rpc-worker" => Some("rpc-worker"),
        "native-python" => Some("python"),
        "web-worker" => Some("web-worker"),
        "web-python" => Some("web-python"),
        "iframe" => Some("iframe"),
        _ => None,
    }
}

/// Flatten a ui description (string, list of lines, or structured entries)
/// into the single string the workflow editor renders.
pub fn normalize_ui(ui: &Value) -> String {
    match ui {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Array(lines) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("<br>"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn templates_tag_plugin_types() {
        let t = WorkflowTemplate::new("sum", "P/sum", Some("native-python"), &json!(["a: {id: 'a', type: 'number'}", " "]));
        assert_eq!(t.tags, vec!["op", "plugin", "python"]);
        assert_eq!(t.op_type, "P/sum");
        assert_eq!(t.init, "a: {id: 'a', type: 'number'}");

        let plain = WorkflowTemplate::new("x", "x", Some("collection"), &Value::Null);
        assert_eq!(plain.tags, vec!["op", "plugin"]);
        assert_eq!(plain.init, "");
    }
}
