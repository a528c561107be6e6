//! Plugin sources and descriptors.
//!
//! This module handles:
//! - Splitting a plugin source into its tagged blocks and parsing the config
//! - Upgrading configs written against older API versions
//! - Resolving references (urls, gists, `repo:name@tag`) to sources
//! - Reading repository manifests
//! - Detecting dependency cycles

pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod github;
pub mod manifest;
pub mod parser;
pub mod reference;
pub mod schema;
pub mod source;
pub mod upgrade;
pub mod version;

pub use dependency::DependencyChain;
pub use descriptor::{Block, BlockKind, PluginDescriptor, PluginType};
pub use error::PluginError;
pub use manifest::{ManifestCache, ManifestEntry, RepoManifest};
pub use parser::{ParseOverrides, parse, parse_external, serialize};
pub use reference::{PluginReference, Resolution, ResolvedSource, SourceResolver};
