//! Plugin host error types with clear, actionable messages.
//!
//! Every error names the plugin, service, or reference it concerns so a
//! failure deep inside a dependency chain can still be traced back.
//! Validation errors carry the structured violation list rather than a
//! flattened message.

use thiserror::Error;

use super::schema::SchemaViolation;
use crate::fetch::FetchError;
use crate::store::StoreError;

/// Errors that can occur while resolving, parsing, loading, or calling plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A `repo:name` reference is missing one of its halves.
    #[error("reference '{reference}' is malformed: {details}")]
    InvalidReferenceFormat { reference: String, details: String },

    /// The named plugin is absent from the manifest or scope list.
    #[error("plugin '{name}' cannot be found in {scope}")]
    ReferenceNotFound { name: String, scope: String },

    /// Config block declared a language other than json/yaml on a modern api_version.
    #[error(
        "plugin '{plugin}': unsupported config language '{lang}', set lang=\"json\" or lang=\"yaml\""
    )]
    UnsupportedConfigLanguage { plugin: String, lang: String },

    /// The parsed config failed schema validation.
    #[error("plugin '{plugin}': invalid config: {}", join_violations(violations))]
    InvalidPluginConfig {
        plugin: String,
        violations: Vec<SchemaViolation>,
    },

    /// A configurable field is keyed by tag but no tag was selected.
    #[error(
        "plugin '{plugin}': field '{field}' is keyed by tag, declare `tags` to use configurable fields"
    )]
    ConfigurableFieldWithoutTag { plugin: String, field: String },

    /// Source text could not be split or deserialized.
    #[error("plugin '{plugin}': failed to parse plugin source: {details}")]
    MalformedSource { plugin: String, details: String },

    /// Plugin names are used as registry keys and must not contain '/'.
    #[error("plugin name '{name}' must not contain '/'")]
    InvalidPluginName { name: String },

    /// A dependency failed to load; siblings loaded before it stay loaded.
    #[error("plugin '{plugin}': failed to load dependency '{dependency}': {cause}")]
    DependencyLoadFailed {
        plugin: String,
        dependency: String,
        #[source]
        cause: Box<PluginError>,
    },

    /// A dependency chain revisited an origin that is still loading.
    #[error("plugin '{plugin}': dependency cycle detected: {chain}")]
    DependencyCycleDetected { plugin: String, chain: String },

    /// The sandbox did not connect in time. Reported as a warning only.
    #[error("plugin '{plugin}': no connection from the sandbox within {seconds}s")]
    HandshakeTimeout { plugin: String, seconds: u64 },

    /// The plugin's `setup()` rejected.
    #[error("plugin '{plugin}': setup() failed: {message}")]
    SetupFailed { plugin: String, message: String },

    /// The plugin's `resume()` rejected.
    #[error("plugin '{plugin}': resume() failed: {message}")]
    ResumeFailed { plugin: String, message: String },

    /// The sandbox reported a failure instead of connecting.
    #[error("plugin '{plugin}': sandbox failed: {message}")]
    SandboxFailed { plugin: String, message: String },

    /// The instance was unloaded while it was still connecting.
    #[error("plugin '{plugin}': unloaded before it finished connecting")]
    LoadAborted { plugin: String },

    /// Stored source no longer matches its recorded digest.
    #[error("plugin '{plugin}': source digest mismatch (recorded {expected}, computed {actual})")]
    ContentHashMismatch {
        plugin: String,
        expected: String,
        actual: String,
    },

    /// A service registration must carry both `type` and `name`.
    #[error("service registered by '{provider}' must specify both `type` and `name`")]
    MissingServiceIdentity { provider: String },

    /// A known service type rejected the config.
    #[error(
        "service '{service}': does not satisfy the '{service_type}' schema: {}",
        join_violations(violations)
    )]
    ServiceSchemaViolation {
        service: String,
        service_type: String,
        violations: Vec<SchemaViolation>,
    },

    /// Unknown service types must use the `#` namespace.
    #[error(
        "service '{service}': unregistered service type '{service_type}' must start with '#'"
    )]
    UnnamespacedUnknownServiceType {
        service: String,
        service_type: String,
    },

    /// No operation is registered under the key.
    #[error("operation '{key}' is not registered")]
    OperationNotFound { key: String },

    /// No plugin matches the query.
    #[error("plugin not found: {name}")]
    PluginNotFound { name: String },

    /// The plugin api does not expose the requested function.
    #[error("plugin '{plugin}': function '{capability}' is not available")]
    CapabilityMissing { plugin: String, capability: String },

    /// A plugin function returned an error.
    #[error("plugin '{plugin}': call to '{capability}' failed: {message}")]
    CallFailed {
        plugin: String,
        capability: String,
        message: String,
    },

    /// `_`-prefixed settings mirror config fields and cannot be written.
    #[error("plugin '{plugin}': '{field}' is a readonly field defined in the config block")]
    ReadonlyConfigField { plugin: String, field: String },

    /// Fetching a manifest or plugin source failed.
    #[error("'{target}': fetch failed: {source}")]
    Fetch {
        target: String,
        #[source]
        source: FetchError,
    },

    /// The document store rejected a read or write.
    #[error("'{target}': store error: {source}")]
    Store {
        target: String,
        #[source]
        source: StoreError,
    },
}

impl PluginError {
    /// Create a malformed source error.
    pub fn malformed(plugin: impl Into<String>, details: impl Into<String>) -> Self {
        Self::MalformedSource {
            plugin: plugin.into(),
            details: details.into(),
        }
    }

    /// Create a capability missing error.
    pub fn capability_missing(plugin: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::CapabilityMissing {
            plugin: plugin.into(),
            capability: capability.into(),
        }
    }

    /// Create a call failure from the error a plugin function returned.
    pub fn call_failed(
        plugin: impl Into<String>,
        capability: impl Into<String>,
        error: &anyhow::Error,
    ) -> Self {
        Self::CallFailed {
            plugin: plugin.into(),
            capability: capability.into(),
            message: format!("{error:#}"),
        }
    }

    /// Wrap a fetch error with the url or reference it concerns.
    pub fn fetch(target: impl Into<String>, source: FetchError) -> Self {
        Self::Fetch {
            target: target.into(),
            source,
        }
    }

    /// Wrap a store error with the document it concerns.
    pub fn store(target: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            target: target.into(),
            source,
        }
    }

    /// Schema violations carried by validation errors.
    pub fn violations(&self) -> &[SchemaViolation] {
        match self {
            Self::InvalidPluginConfig { violations, .. }
            | Self::ServiceSchemaViolation { violations, .. } => violations,
            _ => &[],
        }
    }

    /// Hard lifecycle failures tear the sandbox down before surfacing.
    pub fn is_hard_lifecycle_failure(&self) -> bool {
        matches!(
            self,
            Self::SetupFailed { .. } | Self::ResumeFailed { .. } | Self::SandboxFailed { .. }
        )
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_errors_list_every_violation() {
        let err = PluginError::InvalidPluginConfig {
            plugin: "Image Viewer".to_string(),
            violations: vec![
                SchemaViolation::new("/type", "expected string, got number"),
                SchemaViolation::new("/", "missing required property 'name'"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Image Viewer"));
        assert!(msg.contains("/type: expected string"));
        assert!(msg.contains("missing required property 'name'"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn dependency_failure_names_both_sides() {
        let err = PluginError::DependencyLoadFailed {
            plugin: "parent".to_string(),
            dependency: "repo/x:child".to_string(),
            cause: Box::new(PluginError::ReferenceNotFound {
                name: "child".to_string(),
                scope: "repository 'repo/x'".to_string(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("parent"));
        assert!(msg.contains("repo/x:child"));
        assert!(msg.contains("cannot be found"));
    }

    #[test]
    fn unnamespaced_type_suggests_prefix() {
        let err = PluginError::UnnamespacedUnknownServiceType {
            service: "foo".to_string(),
            service_type: "custom".to_string(),
        };
        assert!(err.to_string().contains("must start with '#'"));
    }

    #[test]
    fn hard_failures_are_classified() {
        let setup = PluginError::SetupFailed {
            plugin: "p".to_string(),
            message: "boom".to_string(),
        };
        let timeout = PluginError::HandshakeTimeout {
            plugin: "p".to_string(),
            seconds: 10,
        };
        assert!(setup.is_hard_lifecycle_failure());
        assert!(!timeout.is_hard_lifecycle_failure());
    }
}
