//! Cycle guard for recursive dependency loading.
//!
//! Dependencies are loaded depth-first, each through the full resolve/parse/
//! load pipeline. The chain of origins currently being loaded is threaded
//! through that recursion; revisiting an origin still on the chain means the
//! dependency graph has a cycle.

use std::fmt;

/// Origins currently being loaded, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyChain {
    path: Vec<String>,
}

impl DependencyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the chain with `origin`.
    ///
    /// # Errors
    ///
    /// Returns the rendered cycle (`a -> b -> a`) when `origin` is already on
    /// the chain.
    pub fn enter(&self, origin: &str) -> Result<Self, String> {
        let origin = normalize(origin);
        if self.path.iter().any(|p| *p == origin) {
            let mut cycle = self.path.clone();
            cycle.push(origin);
            return Err(cycle.join(" -> "));
        }
        let mut path = self.path.clone();
        path.push(origin);
        Ok(Self { path })
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn contains(&self, origin: &str) -> bool {
        let origin = normalize(origin);
        self.path.iter().any(|p| *p == origin)
    }
}

/// Origins differ only by cache-busting query strings and tags.
fn normalize(origin: &str) -> String {
    let origin = origin.trim();
    let origin = origin.split('?').next().unwrap_or(origin);
    if origin.contains('\n') {
        return origin.to_string();
    }
    match origin.rsplit_once('@') {
        Some((head, tag)) if !head.is_empty() && !tag.contains([':', '/']) => head.to_string(),
        _ => origin.to_string(),
    }
}

impl fmt::Display for DependencyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.join(" -> "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_is_accepted() {
        let chain = DependencyChain::new()
            .enter("repo/x:A")
            .unwrap()
            .enter("repo/x:B")
            .unwrap();
        assert_eq!(chain.depth(), 2);
        assert_eq!(chain.to_string(), "repo/x:A -> repo/x:B");
    }

    #[test]
    fn direct_cycle() {
        let chain = DependencyChain::new().enter("A").unwrap();
        assert_eq!(chain.enter("A").unwrap_err(), "A -> A");
    }

    #[test]
    fn indirect_cycle_ignores_tags_and_queries() {
        let chain = DependencyChain::new()
            .enter("https://x.org/A.imjoy.html")
            .unwrap()
            .enter("https://x.org/B.imjoy.html")
            .unwrap();
        let err = chain.enter("https://x.org/A.imjoy.html@v2?abc").unwrap_err();
        assert_eq!(
            err,
            "https://x.org/A.imjoy.html -> https://x.org/B.imjoy.html -> https://x.org/A.imjoy.html"
        );
    }

    #[test]
    fn siblings_do_not_collide() {
        let parent = DependencyChain::new().enter("P").unwrap();
        assert!(parent.enter("A").is_ok());
        assert!(parent.enter("A").is_ok());
        assert!(parent.contains("P"));
    }
}
