//! Parsed plugin descriptors and the source blocks they are built from.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::error::PluginError;

/// Sandbox/runtime kind a plugin asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginType {
    Window,
    RpcWindow,
    Iframe,
    WebWorker,
    WebPython,
    RpcWorker,
    Collection,
    NativePython,
    Other(String),
}

impl PluginType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Window => "window",
            Self::RpcWindow => "rpc-window",
            Self::Iframe => "iframe",
            Self::WebWorker => "web-worker",
            Self::WebPython => "web-python",
            Self::RpcWorker => "rpc-worker",
            Self::Collection => "collection",
            Self::NativePython => "native-python",
            Self::Other(s) => s,
        }
    }

    /// Whether the host can run this type itself, without a remote engine.
    pub fn has_backend(&self) -> bool {
        !matches!(self, Self::NativePython | Self::Other(_))
    }

    /// Window plugins are represented by a proxy instead of a sandbox.
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Window | Self::RpcWindow)
    }

    /// Types that get the short handshake timeout.
    pub fn uses_window_handshake(&self) -> bool {
        matches!(self, Self::Window | Self::RpcWindow | Self::Iframe)
    }
}

impl From<String> for PluginType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "window" => Self::Window,
            "rpc-window" => Self::RpcWindow,
            "iframe" => Self::Iframe,
            "web-worker" => Self::WebWorker,
            "web-python" => Self::WebPython,
            "rpc-worker" => Self::RpcWorker,
            "collection" => Self::Collection,
            "native-python" => Self::NativePython,
            _ => Self::Other(s),
        }
    }
}

impl From<PluginType> for String {
    fn from(t: PluginType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Config,
    Script,
    Style,
    Link,
    Window,
    Docs,
    Attachment,
}

impl BlockKind {
    pub const ALL: [BlockKind; 7] = [
        Self::Config,
        Self::Script,
        Self::Style,
        Self::Link,
        Self::Window,
        Self::Docs,
        Self::Attachment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Script => "script",
            Self::Style => "style",
            Self::Link => "link",
            Self::Window => "window",
            Self::Docs => "docs",
            Self::Attachment => "attachment",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    /// `<link>` carries attributes only.
    pub fn is_void(self) -> bool {
        matches!(self, Self::Link)
    }
}

/// One top-level block of a plugin source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub content: String,
}

impl Block {
    pub fn new(kind: BlockKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
            content: content.into(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn tag(&self) -> Option<&str> {
        self.attr("tag")
    }

    pub fn lang(&self) -> Option<&str> {
        self.attr("lang")
    }

    pub fn name(&self) -> Option<&str> {
        self.attr("name")
    }
}

fn runnable_default() -> bool {
    true
}

/// A parsed and validated plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Storage key: the name with spaces replaced by underscores.
    #[serde(rename = "_id")]
    pub doc_id: String,
    /// Instance identity: sanitized name plus a random suffix.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requirements: Value,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub ui: Value,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub defaults: Option<Value>,
    #[serde(default = "runnable_default")]
    pub runnable: bool,
    #[serde(default)]
    pub resumed: bool,
    #[serde(default)]
    pub lang: Option<String>,
    /// Active script body for the selected tag.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub scripts: Vec<Block>,
    #[serde(default)]
    pub styles: Vec<Block>,
    #[serde(default)]
    pub links: Vec<Block>,
    #[serde(default)]
    pub windows: Vec<Block>,
    #[serde(default)]
    pub attachments: Vec<Block>,
    #[serde(default)]
    pub docs: Option<String>,
    /// Full source text the descriptor was parsed from.
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub uri: Option<String>,
    /// Canonical reference used for update checks.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub engine_mode: Option<String>,
    #[serde(default)]
    pub hot_reloading: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PluginDescriptor {
    pub fn has_backend(&self) -> bool {
        self.plugin_type.has_backend()
    }

    pub fn attachment(&self, name: &str) -> Option<&str> {
        self.attachments
            .iter()
            .find(|b| b.name() == Some(name))
            .map(|b| b.content.as_str())
    }

    /// Value of a top-level config field, if it is set to something truthy.
    pub fn readonly_field(&self, field: &str) -> Option<Value> {
        let value = serde_json::to_value(self).ok()?;
        let found = value.get(field)?.clone();
        let truthy = match &found {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            _ => true,
        };
        truthy.then_some(found)
    }

    /// Reject the descriptor when its recorded digest no longer matches its code.
    pub fn verify_content_hash(&self) -> Result<(), PluginError> {
        let Some(expected) = &self.hash else {
            return Ok(());
        };
        let actual = content_digest(&self.code);
        if *expected == actual {
            Ok(())
        } else {
            Err(PluginError::ContentHashMismatch {
                plugin: self.name.clone(),
                expected: expected.clone(),
                actual,
            })
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Lowercase hex SHA-256 of a plugin source.
pub fn content_digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Ten random lowercase alphanumerics.
pub fn rand_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Document id for a plugin name.
pub fn doc_id_for(name: &str) -> String {
    name.replace(' ', "_")
}

/// Fresh instance id for a plugin name.
pub fn instance_id_for(name: &str) -> String {
    format!("{}_{}", name.trim().replace(' ', "_"), rand_id())
}
