//! `plughost`: inspect, resolve and install plugins from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use plughost_kernel::config::Config;
use plughost_kernel::fetch::HttpFetcher;
use plughost_kernel::host::PluginHost;
use plughost_kernel::plugin::manifest::ManifestEntry;
use plughost_kernel::plugin::{ParseOverrides, parse};
use plughost_kernel::sandbox::LoopbackTransport;
use plughost_kernel::store::FileStoreFactory;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a local plugin file and print its descriptor.
    Inspect {
        file: PathBuf,
        /// Select the blocks of this tag.
        #[arg(long)]
        tag: Option<String>,
    },
    /// Resolve a plugin reference and print where its source lives.
    Resolve { reference: String },
    /// Fetch a repository manifest and print it normalized.
    Manifest { repo: String },
    /// Install a plugin (and its dependencies) into the workspace.
    Install {
        reference: String,
        #[arg(long)]
        tag: Option<String>,
    },
    /// List installed plugins of the workspace.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    let host = build_host(&config);

    match cli.command {
        Command::Inspect { file, tag } => cmd_inspect(&file, tag)?,
        Command::Resolve { reference } => cmd_resolve(&host, &reference).await?,
        Command::Manifest { repo } => cmd_manifest(&host, &repo).await?,
        Command::Install { reference, tag } => cmd_install(&host, &reference, tag).await?,
        Command::List => cmd_list(&host).await?,
    }

    Ok(())
}

fn build_host(config: &Config) -> PluginHost {
    let mut builder = PluginHost::builder(Arc::new(LoopbackTransport::new()))
        .config(config.host_config())
        .fetcher(Arc::new(HttpFetcher::default()));
    if let Some(dir) = &config.data_dir {
        info!(dir = %dir.display(), "using file-backed document store");
        builder = builder.stores(Arc::new(FileStoreFactory::new(dir)));
    }
    builder.build()
}

fn cmd_inspect(file: &PathBuf, tag: Option<String>) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let overrides = ParseOverrides::default().with_tag(tag);
    let descriptor = parse(&source, &overrides)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

/// Plugins of the configured default repositories, for resolving bare names.
async fn default_scope(host: &PluginHost) -> Vec<ManifestEntry> {
    let mut scope = Vec::new();
    for repo in &host.config().default_repositories {
        match host.resolver().manifests().get(repo, None).await {
            Ok(manifest) => scope.extend(manifest.plugins),
            Err(e) => warn!(repository = %repo, error = %e, "skipping repository"),
        }
    }
    scope
}

async fn cmd_resolve(host: &PluginHost, reference: &str) -> Result<()> {
    let scope = default_scope(host).await;
    let resolution = host
        .resolver()
        .resolve(reference, &scope)
        .await
        .with_context(|| format!("failed to resolve {reference}"))?;
    let out = json!({
        "uri": resolution.uri(),
        "tag": resolution.tag,
        "external": resolution.external,
        "scope": resolution.scope.iter().map(|p| &p.name).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_manifest(host: &PluginHost, repo: &str) -> Result<()> {
    let manifest = host
        .resolver()
        .manifests()
        .refresh(repo, None)
        .await
        .with_context(|| format!("failed to load manifest of {repo}"))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn cmd_install(host: &PluginHost, reference: &str, tag: Option<String>) -> Result<()> {
    let repositories = host
        .load_repository_list()
        .await
        .context("failed to load repository list")?;
    if let Some(first) = repositories.first()
        && let Err(e) = host.reload_repository(first).await
    {
        warn!(repository = %first.name, error = %e, "bare plugin names will not resolve");
    }
    let descriptor = host
        .install_plugin(reference, tag, true)
        .await
        .with_context(|| format!("failed to install {reference}"))?;
    println!(
        "Installed {} {} into workspace {}",
        descriptor.name,
        descriptor.version.as_deref().unwrap_or("(no version)"),
        host.workspace()
    );
    Ok(())
}

async fn cmd_list(host: &PluginHost) -> Result<()> {
    let installed = host
        .installed_plugins()
        .await
        .context("failed to list installed plugins")?;
    if installed.is_empty() {
        println!("No plugins installed in workspace {}.", host.workspace());
        return Ok(());
    }

    println!("{:<24} {:<12} {:<10} {:<9}", "PLUGIN", "VERSION", "TAG", "VERIFIED");
    println!("{}", "-".repeat(58));
    for plugin in installed {
        println!(
            "{:<24} {:<12} {:<10} {:<9}",
            plugin.name,
            plugin.version.as_deref().unwrap_or("-"),
            plugin.tag.as_deref().unwrap_or("-"),
            if plugin.verified { "yes" } else { "NO" }
        );
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
