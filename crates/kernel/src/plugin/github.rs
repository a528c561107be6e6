//! GitHub URL rewriting for plugin sources and repository manifests.

use std::sync::LazyLock;

use regex::Regex;

pub const RAW_BASE: &str = "https://raw.githubusercontent.com";
pub const MANIFEST_FILE: &str = "manifest.imjoy.json";

/// `https://github.com/{owner}/{repo}[/tree/{branch}[/{path}]]`
///
/// # Panics
///
/// Panics if the regex pattern is invalid (compile-time constant, should never fail).
#[allow(clippy::expect_used)]
static REPO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://github\.com/([\w.-]+)/([\w.-]+?)(?:\.git)?(?:/tree/([\w.-]+)(?:/(.*?))?)?/?$")
        .expect("github repo regex is valid")
});

/// `https://gist.github.com/{owner}/{id}`
///
/// # Panics
///
/// Panics if the regex pattern is invalid (compile-time constant, should never fail).
#[allow(clippy::expect_used)]
static GIST_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://gist\.github\.com/([\w.-]+)/([0-9a-fA-F]+)")
        .expect("gist regex is valid")
});

/// Whether the url points at a rendered GitHub page rather than raw content.
pub fn is_rewritable(url: &str) -> bool {
    (url.contains("github.com") && url.contains("/blob/")) || url.contains("gist.github.com")
}

/// Rewrite blob and gist urls to their raw-content form.
///
/// Gists resolve to the `/raw` endpoint, which serves the gist's single (or
/// first) file. Other urls are returned unchanged.
pub fn raw_url(url: &str) -> String {
    if let Some(caps) = GIST_URL.captures(url) {
        return format!(
            "https://gist.githubusercontent.com/{}/{}/raw",
            &caps[1], &caps[2]
        );
    }
    if url.contains("github.com") && url.contains("/blob/") {
        return url
            .replacen("github.com", "raw.githubusercontent.com", 1)
            .replacen("/blob/", "/", 1);
    }
    url.to_string()
}

/// Manifest url for a GitHub repository page, `None` for other urls.
pub fn manifest_url(repo_url: &str) -> Option<String> {
    let caps = REPO_URL.captures(repo_url)?;
    let branch = caps.get(3).map_or("master", |m| m.as_str());
    let path = caps
        .get(4)
        .map(|m| m.as_str().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default();
    Some(format!(
        "{RAW_BASE}/{}/{}/{branch}/{path}{MANIFEST_FILE}",
        &caps[1], &caps[2]
    ))
}

/// `owner/repo` for a GitHub repository url.
pub fn repo_slug(repo_url: &str) -> Option<String> {
    let caps = REPO_URL.captures(repo_url)?;
    Some(format!("{}/{}", &caps[1], &caps[2]))
}
