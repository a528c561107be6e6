//! Configuration loaded from environment variables.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::host::{HostConfig, InternalPlugin};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace selected at startup (default: "default").
    pub workspace: String,

    /// Directory for the file-backed document store. When None, documents
    /// are kept in memory and lost on exit.
    pub data_dir: Option<PathBuf>,

    /// Handshake timeout for worker-class plugins in seconds (default: 180).
    pub worker_handshake_secs: u64,

    /// Handshake timeout for window-class plugins in seconds (default: 10).
    pub window_handshake_secs: u64,

    /// Repositories seeded into an empty repository list (comma-separated).
    pub default_repositories: Vec<String>,

    /// Internal plugins by name, read from the JSON file named by
    /// PLUGHOST_INTERNAL_PLUGINS.
    pub internal_plugins: BTreeMap<String, InternalPlugin>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = HostConfig::default();

        let workspace = env::var("PLUGHOST_WORKSPACE").unwrap_or_else(|_| defaults.workspace.clone());

        let data_dir = env::var("PLUGHOST_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let worker_handshake_secs = env::var("PLUGHOST_WORKER_HANDSHAKE_SECS")
            .unwrap_or_else(|_| defaults.worker_handshake.as_secs().to_string())
            .parse()
            .context("PLUGHOST_WORKER_HANDSHAKE_SECS must be a valid u64")?;

        let window_handshake_secs = env::var("PLUGHOST_WINDOW_HANDSHAKE_SECS")
            .unwrap_or_else(|_| defaults.window_handshake.as_secs().to_string())
            .parse()
            .context("PLUGHOST_WINDOW_HANDSHAKE_SECS must be a valid u64")?;

        let default_repositories = env::var("PLUGHOST_DEFAULT_REPOSITORIES")
            .map(|v| parse_list(&v))
            .unwrap_or(defaults.default_repositories);

        let internal_plugins = match env::var("PLUGHOST_INTERNAL_PLUGINS") {
            Ok(path) => load_internal_plugins(Path::new(&path))?,
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            workspace,
            data_dir,
            worker_handshake_secs,
            window_handshake_secs,
            default_repositories,
            internal_plugins,
        })
    }

    /// Host knobs derived from this configuration.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            workspace: self.workspace.clone(),
            worker_handshake: Duration::from_secs(self.worker_handshake_secs),
            window_handshake: Duration::from_secs(self.window_handshake_secs),
            default_repositories: self.default_repositories.clone(),
            internal_plugins: self.internal_plugins.clone(),
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn load_internal_plugins(path: &Path) -> Result<BTreeMap<String, InternalPlugin>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read internal plugins from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} must map plugin names to {{uri, startup}}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn lists_drop_blank_entries() {
        assert_eq!(
            parse_list(" a/b, ,c/d ,"),
            vec!["a/b".to_string(), "c/d".to_string()]
        );
    }

    #[test]
    fn host_config_carries_timeouts() {
        let config = Config {
            workspace: "lab".into(),
            data_dir: None,
            worker_handshake_secs: 5,
            window_handshake_secs: 1,
            default_repositories: Vec::new(),
            internal_plugins: BTreeMap::new(),
        };
        let host = config.host_config();
        assert_eq!(host.workspace, "lab");
        assert_eq!(host.worker_handshake, Duration::from_secs(5));
        assert_eq!(host.window_handshake, Duration::from_secs(1));
    }

    #[test]
    fn internal_plugins_file_is_json_map() {
        let dir = std::env::temp_dir().join(format!("plughost-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("internal.json");
        std::fs::write(
            &path,
            r#"{"Viewer": {"uri": "https://example.com/viewer.imjoy.html", "startup": true}}"#,
        )
        .unwrap();
        let plugins = load_internal_plugins(&path).unwrap();
        assert!(plugins["Viewer"].startup);
        std::fs::remove_dir_all(&dir).ok();
    }
}
