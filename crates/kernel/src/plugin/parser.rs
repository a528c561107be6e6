//! Plugin source parsing and validation.
//!
//! [`parse`] is pure: it takes the full source text and caller overrides and
//! produces a validated [`PluginDescriptor`] or an error. Nothing is partially
//! applied on failure.

use std::cmp::Ordering;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::descriptor::{
    Block, BlockKind, PluginDescriptor, content_digest, doc_id_for, instance_id_for,
};
use super::error::PluginError;
use super::schema::plugin_config_schema;
use super::source::{compose, split_blocks};
use super::upgrade::upgrade_config;
use super::version::compare_versions;

/// Fields that may be keyed by tag (`"requirements": {"gpu": [...], "cpu": [...]}`).
pub const CONFIGURABLE_FIELDS: &[&str] = &[
    "env",
    "requirements",
    "dependencies",
    "icon",
    "ui",
    "type",
    "flags",
    "cover",
];

/// Newest `api_version` that may use a config language other than json/yaml.
const LEGACY_LANG_API_VERSION: &str = "0.1.5";

const UNNAMED: &str = "<unnamed>";

/// Values supplied by the caller that take precedence over the source.
#[derive(Debug, Clone, Default)]
pub struct ParseOverrides {
    pub tag: Option<String>,
    pub doc_id: Option<String>,
    pub uri: Option<String>,
    pub origin: Option<String>,
    pub namespace: Option<String>,
    pub engine_mode: Option<String>,
    pub hot_reloading: bool,
    /// Record the digest of the source in `hash`.
    pub compute_hash: bool,
}

impl ParseOverrides {
    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

fn read_config(block: &Block) -> Result<Map<String, Value>, PluginError> {
    let text = &block.content;
    let value: Value = match block.lang() {
        Some("yaml") => serde_yml::from_str(text)
            .map_err(|e| PluginError::malformed(UNNAMED, format!("config is not valid YAML: {e}")))?,
        Some("json") => serde_json::from_str(text)
            .map_err(|e| PluginError::malformed(UNNAMED, format!("config is not valid JSON: {e}")))?,
        other => {
            let value: Value = serde_json::from_str(text).map_err(|e| {
                PluginError::malformed(UNNAMED, format!("config is not valid JSON: {e}"))
            })?;
            let api_version = value
                .get("api_version")
                .and_then(Value::as_str)
                .unwrap_or("0.0.0");
            if compare_versions(api_version, LEGACY_LANG_API_VERSION) == Ordering::Greater {
                let plugin = value.get("name").and_then(Value::as_str).unwrap_or(UNNAMED);
                return Err(PluginError::UnsupportedConfigLanguage {
                    plugin: plugin.to_string(),
                    lang: other.unwrap_or("none").to_string(),
                });
            }
            value
        }
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(PluginError::malformed(
            UNNAMED,
            format!("config block must hold an object, found {other}"),
        )),
    }
}

fn blocks_value(blocks: &[Block]) -> Value {
    serde_json::to_value(blocks).unwrap_or(Value::Array(Vec::new()))
}

/// Parse and validate plugin source text.
pub fn parse(source: &str, overrides: &ParseOverrides) -> Result<PluginDescriptor, PluginError> {
    let blocks =
        split_blocks(source).map_err(|e| PluginError::malformed(UNNAMED, e.to_string()))?;
    let config_block = blocks
        .iter()
        .find(|b| b.kind == BlockKind::Config)
        .ok_or_else(|| PluginError::malformed(UNNAMED, "missing <config> block"))?;
    let mut config = read_config(config_block)?;
    let plugin = config
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(UNNAMED)
        .to_string();

    let tag = overrides.tag.clone().or_else(|| {
        config
            .get("tags")
            .and_then(Value::as_array)
            .and_then(|tags| tags.first())
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    // Variant selection: a block tagged with the selected tag wins, the first
    // untagged block is the fallback, mismatched tags are dropped.
    let mut active: Option<&Block> = None;
    let mut scripts = Vec::new();
    for block in blocks.iter().filter(|b| b.kind == BlockKind::Script) {
        match (block.tag(), tag.as_deref()) {
            (Some(t), Some(selected)) if t == selected => {
                active = Some(block);
                scripts.push(block.clone());
            }
            (None, _) => scripts.push(block.clone()),
            _ => {}
        }
    }
    if active.is_none() {
        active = blocks
            .iter()
            .find(|b| b.kind == BlockKind::Script && b.tag().is_none());
    }

    for field in CONFIGURABLE_FIELDS {
        let Some(Value::Object(variants)) = config.get(*field) else {
            continue;
        };
        let Some(selected) = tag.as_deref() else {
            return Err(PluginError::ConfigurableFieldWithoutTag {
                plugin,
                field: (*field).to_string(),
            });
        };
        match variants.get(selected).cloned() {
            Some(value) => {
                config.insert((*field).to_string(), value);
            }
            None => {
                warn!(plugin = %plugin, field = %field, tag = %selected, "configurable field has no entry for the selected tag");
                config.remove(*field);
            }
        }
    }

    let of_kind = |kind: BlockKind| -> Vec<Block> {
        blocks.iter().filter(|b| b.kind == kind).cloned().collect()
    };

    let lang = active
        .and_then(Block::lang)
        .map(str::to_string)
        .or_else(|| config.get("lang").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "javascript".to_string());
    let docs = blocks
        .iter()
        .find(|b| b.kind == BlockKind::Docs)
        .map(|b| Value::String(b.content.clone()))
        .or_else(|| config.get("docs").filter(|d| d.is_string()).cloned())
        .unwrap_or(Value::Null);

    config.insert("tag".into(), tag.clone().map_or(Value::Null, Value::String));
    config.insert(
        "script".into(),
        active.map_or(Value::Null, |b| Value::String(b.content.clone())),
    );
    config.insert("scripts".into(), blocks_value(&scripts));
    config.insert("styles".into(), blocks_value(&of_kind(BlockKind::Style)));
    config.insert("links".into(), blocks_value(&of_kind(BlockKind::Link)));
    config.insert("windows".into(), blocks_value(&of_kind(BlockKind::Window)));
    config.insert(
        "attachments".into(),
        blocks_value(&of_kind(BlockKind::Attachment)),
    );
    config.insert("docs".into(), docs);
    config.insert("lang".into(), Value::String(lang));
    config.insert("code".into(), Value::String(source.to_string()));
    config.insert("hot_reloading".into(), Value::Bool(overrides.hot_reloading));
    for (key, value) in [
        ("uri", &overrides.uri),
        ("origin", &overrides.origin),
        ("namespace", &overrides.namespace),
    ] {
        config.insert(key.into(), value.clone().map_or(Value::Null, Value::String));
    }

    if let Some(name) = config.get("name").and_then(Value::as_str).map(str::to_string) {
        let doc_id = overrides.doc_id.clone().unwrap_or_else(|| doc_id_for(&name));
        config.insert("_id".into(), Value::String(doc_id));
        config.insert("id".into(), Value::String(instance_id_for(&name)));
    }
    let runnable = !matches!(config.get("runnable"), Some(Value::Bool(false)));
    config.insert("runnable".into(), Value::Bool(runnable));
    if config.get("requirements").is_none_or(Value::is_null) {
        config.insert("requirements".into(), json!([]));
    }

    let applied = upgrade_config(&mut config);
    if !applied.is_empty() {
        debug!(plugin = %plugin, rules = ?applied, "upgraded legacy plugin config");
    }

    let config = Value::Object(config);
    let violations = plugin_config_schema().validate(&config);
    if !violations.is_empty() {
        return Err(PluginError::InvalidPluginConfig { plugin, violations });
    }

    let mut descriptor: PluginDescriptor = serde_json::from_value(config)
        .map_err(|e| PluginError::malformed(plugin.clone(), e.to_string()))?;

    descriptor.engine_mode = if descriptor.has_backend() {
        None
    } else {
        Some(
            overrides
                .engine_mode
                .clone()
                .unwrap_or_else(|| "auto".to_string()),
        )
    };
    if overrides.compute_hash {
        descriptor.hash = Some(content_digest(source));
    }

    Ok(descriptor)
}

/// Build a descriptor for a plugin whose config was obtained outside a plugin
/// file, such as a window app served from an arbitrary URL.
///
/// The config is wrapped into a single `<config>` block so the descriptor can
/// be stored and restored like any other plugin.
pub fn parse_external(
    config: Value,
    uri: &str,
    overrides: &ParseOverrides,
) -> Result<PluginDescriptor, PluginError> {
    let Value::Object(mut map) = config else {
        return Err(PluginError::malformed(
            uri,
            "external plugin config must be an object",
        ));
    };
    map.entry("src").or_insert_with(|| Value::String(uri.to_string()));
    let block = Block::new(
        BlockKind::Config,
        serde_json::to_string_pretty(&Value::Object(map))
            .map_err(|e| PluginError::malformed(uri, e.to_string()))?,
    )
    .with_attr("lang", "json");
    let mut overrides = overrides.clone();
    overrides.uri = overrides.uri.or_else(|| Some(uri.to_string()));
    parse(&compose(&[block]), &overrides)
}

/// Render a descriptor back to plugin source text with its selected tag first.
pub fn serialize(descriptor: &PluginDescriptor) -> String {
    let mut config = descriptor.extra.clone();
    let mut tags = descriptor.tags.clone();
    if let Some(tag) = &descriptor.tag {
        tags.retain(|t| t != tag);
        tags.insert(0, tag.clone());
    }
    config.insert("name".into(), json!(descriptor.name));
    config.insert("type".into(), json!(descriptor.plugin_type));
    config.insert("tags".into(), json!(tags));
    for (key, value) in [
        ("version", &descriptor.version),
        ("api_version", &descriptor.api_version),
        ("description", &descriptor.description),
    ] {
        if let Some(v) = value {
            config.insert(key.into(), json!(v));
        }
    }
    config.insert("dependencies".into(), json!(descriptor.dependencies));
    config.insert("requirements".into(), descriptor.requirements.clone());
    config.insert("flags".into(), json!(descriptor.flags));
    config.insert("ui".into(), descriptor.ui.clone());
    config.insert("inputs".into(), json!(descriptor.inputs));
    config.insert("outputs".into(), json!(descriptor.outputs));
    config.insert("defaults".into(), json!(descriptor.defaults));
    config.insert("runnable".into(), json!(descriptor.runnable));
    config.insert("resumed".into(), json!(descriptor.resumed));

    let config_text = serde_json::to_string_pretty(&Value::Object(config)).unwrap_or_default();
    let mut blocks = vec![Block::new(BlockKind::Config, config_text).with_attr("lang", "json")];
    blocks.extend(descriptor.scripts.iter().cloned());
    blocks.extend(descriptor.styles.iter().cloned());
    blocks.extend(descriptor.links.iter().cloned());
    blocks.extend(descriptor.windows.iter().cloned());
    if let Some(docs) = &descriptor.docs {
        blocks.push(Block::new(BlockKind::Docs, docs.clone()));
    }
    blocks.extend(descriptor.attachments.iter().cloned());
    compose(&blocks)
}
