//! plughost test utilities.
//!
//! Fixture builders for integration tests: plugin source text and
//! repository manifests, written the way plugin authors write them.

use serde_json::{Map, Value as JsonValue, json};

/// Config block languages a fixture can be rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLang {
    Json,
    Yaml,
}

/// Builder for plugin source text (`<config>`, `<script>`, `<docs>`,
/// `<attachment>` blocks).
#[derive(Debug, Clone)]
pub struct PluginSource {
    config: Map<String, JsonValue>,
    config_lang: ConfigLang,
    scripts: Vec<(Option<String>, String)>,
    docs: Option<String>,
    attachments: Vec<(String, String)>,
}

/// Start a plugin source with `name` and `type` set.
pub fn plugin_source(name: &str, plugin_type: &str) -> PluginSource {
    let mut config = Map::new();
    config.insert("name".into(), json!(name));
    config.insert("type".into(), json!(plugin_type));
    config.insert("version".into(), json!("0.1.0"));
    config.insert("api_version".into(), json!("0.1.8"));
    PluginSource {
        config,
        config_lang: ConfigLang::Json,
        scripts: Vec::new(),
        docs: None,
        attachments: Vec::new(),
    }
}

impl PluginSource {
    /// Set any config field.
    pub fn with_field(mut self, key: &str, value: JsonValue) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_version(self, version: &str) -> Self {
        self.with_field("version", json!(version))
    }

    pub fn with_tags(self, tags: &[&str]) -> Self {
        self.with_field("tags", json!(tags))
    }

    pub fn with_dependencies(self, dependencies: &[&str]) -> Self {
        self.with_field("dependencies", json!(dependencies))
    }

    /// Mark the plugin as not runnable (no setup/run expected).
    pub fn not_runnable(self) -> Self {
        self.with_field("runnable", json!(false))
    }

    /// Render the config block as YAML instead of JSON.
    pub fn yaml(mut self) -> Self {
        self.config_lang = ConfigLang::Yaml;
        self
    }

    /// Add an untagged script block.
    pub fn with_script(mut self, body: &str) -> Self {
        self.scripts.push((None, body.to_string()));
        self
    }

    /// Add a script block only used when `tag` is selected.
    pub fn with_tagged_script(mut self, tag: &str, body: &str) -> Self {
        self.scripts.push((Some(tag.to_string()), body.to_string()));
        self
    }

    pub fn with_docs(mut self, docs: &str) -> Self {
        self.docs = Some(docs.to_string());
        self
    }

    pub fn with_attachment(mut self, name: &str, content: &str) -> Self {
        self.attachments.push((name.to_string(), content.to_string()));
        self
    }

    /// Name set in the config.
    pub fn name(&self) -> &str {
        self.config
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }

    /// The config as a JSON value.
    pub fn config(&self) -> JsonValue {
        JsonValue::Object(self.config.clone())
    }

    /// Render the plugin source text.
    pub fn build(&self) -> String {
        let config = JsonValue::Object(self.config.clone());
        let mut out = match self.config_lang {
            ConfigLang::Json => format!(
                "<config lang=\"json\">\n{}\n</config>\n",
                serde_json::to_string_pretty(&config).unwrap_or_default()
            ),
            ConfigLang::Yaml => format!(
                "<config lang=\"yaml\">\n{}</config>\n",
                serde_yml::to_string(&config).unwrap_or_default()
            ),
        };

        let scripts: Vec<(Option<String>, String)> = if self.scripts.is_empty() {
            vec![(None, "api.export({setup() {}, run() {}});".to_string())]
        } else {
            self.scripts.clone()
        };
        for (tag, body) in &scripts {
            match tag {
                Some(tag) => out.push_str(&format!(
                    "<script lang=\"javascript\" tag=\"{tag}\">\n{body}\n</script>\n"
                )),
                None => out.push_str(&format!("<script lang=\"javascript\">\n{body}\n</script>\n")),
            }
        }

        if let Some(docs) = &self.docs {
            out.push_str(&format!("<docs lang=\"markdown\">\n{docs}\n</docs>\n"));
        }
        for (name, content) in &self.attachments {
            out.push_str(&format!("<attachment name=\"{name}\">\n{content}\n</attachment>\n"));
        }
        out
    }
}

/// One `plugins` entry of a repository manifest.
pub fn manifest_entry(name: &str, uri: &str) -> JsonValue {
    json!({ "name": name, "uri": uri })
}

/// A repository manifest (`manifest.imjoy.json`) body.
///
/// Relative plugin uris are resolved against `uri_root` by the host.
pub fn manifest_json(name: &str, uri_root: &str, plugins: &[JsonValue]) -> String {
    json!({
        "name": name,
        "description": format!("{name} test repository"),
        "uri_root": uri_root,
        "plugins": plugins,
    })
    .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn builds_tagged_scripts_in_order() {
        let source = plugin_source("Demo", "window")
            .with_tags(&["stable", "dev"])
            .with_tagged_script("stable", "// stable")
            .with_tagged_script("dev", "// dev")
            .build();
        let stable = source.find("// stable").unwrap();
        let dev = source.find("// dev").unwrap();
        assert!(stable < dev);
        assert!(source.starts_with("<config lang=\"json\">"));
        assert!(source.contains("tag=\"dev\""));
    }

    #[test]
    fn default_script_is_added() {
        let source = plugin_source("Demo", "web-worker").build();
        assert!(source.contains("api.export"));
    }

    #[test]
    fn yaml_config_keeps_fields() {
        let source = plugin_source("Demo", "web-worker").yaml().build();
        assert!(source.starts_with("<config lang=\"yaml\">"));
        assert!(source.contains("name: Demo"));
    }

    #[test]
    fn manifest_lists_plugins() {
        let body = manifest_json("Test", "https://example.com/repo", &[manifest_entry("A", "A.imjoy.html")]);
        let value: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(value["plugins"][0]["name"], "A");
        assert_eq!(value["uri_root"], "https://example.com/repo");
    }
}
