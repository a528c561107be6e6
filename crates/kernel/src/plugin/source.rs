//! Splitting plugin source files into blocks, and composing them back.
//!
//! A plugin file is a sequence of top-level HTML-like blocks:
//!
//! ```text
//! <config lang="json">{ "name": "Demo", "type": "web-worker" }</config>
//! <script lang="javascript" tag="stable">api.export({ setup() {} })</script>
//! <docs>Usage notes</docs>
//! ```
//!
//! Text between blocks is ignored. Block bodies are not parsed further, so a
//! `<window>` may hold arbitrary markup as long as it does not contain its own
//! closing tag.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::descriptor::{Block, BlockKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("<{kind}> block opened at byte {offset} is never closed")]
pub struct UnclosedBlock {
    pub kind: &'static str,
    pub offset: usize,
}

/// Opening tag of a recognised top-level block.
///
/// # Panics
///
/// Panics if the regex pattern is invalid (compile-time constant, should never fail).
#[allow(clippy::expect_used)]
static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(config|script|style|link|window|docs|attachment)(\s[^>]*)?>")
        .expect("block open-tag regex is valid")
});

/// A single `key`, `key=value`, `key="value"` or `key='value'` attribute.
///
/// # Panics
///
/// Panics if the regex pattern is invalid (compile-time constant, should never fail).
#[allow(clippy::expect_used)]
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`/]+)))?"#,
    )
    .expect("attribute regex is valid")
});

/// Split source text into its top-level blocks, in document order.
pub fn split_blocks(source: &str) -> Result<Vec<Block>, UnclosedBlock> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(caps) = OPEN_TAG.captures_at(source, pos) {
        let Some(whole) = caps.get(0) else { break };
        let Some(kind) = caps.get(1).and_then(|m| BlockKind::from_tag(m.as_str())) else {
            break;
        };
        let raw_attrs = caps.get(2).map_or("", |m| m.as_str());
        let attrs = parse_attrs(raw_attrs.trim_end_matches('/'));
        let body_start = whole.end();

        if kind.is_void() || raw_attrs.trim_end().ends_with('/') {
            let close = format!("</{}>", kind.as_str());
            pos = match source[body_start..].trim_start().strip_prefix(close.as_str()) {
                Some(rest) => source.len() - rest.len(),
                None => body_start,
            };
            blocks.push(Block {
                kind,
                attrs,
                content: String::new(),
            });
            continue;
        }

        let close = format!("</{}>", kind.as_str());
        let Some(rel_end) = source[body_start..].find(&close) else {
            return Err(UnclosedBlock {
                kind: kind.as_str(),
                offset: whole.start(),
            });
        };
        let body = &source[body_start..body_start + rel_end];
        blocks.push(Block {
            kind,
            attrs,
            content: trim_body(body).to_string(),
        });
        pos = body_start + rel_end + close.len();
    }

    Ok(blocks)
}

fn trim_body(body: &str) -> &str {
    body.trim_start_matches(['\r', '\n']).trim_end()
}

fn parse_attrs(raw: &str) -> std::collections::BTreeMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_string();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or_else(|| "true".to_string(), |m| m.as_str().to_string());
            Some((key, value))
        })
        .collect()
}

fn render_attrs(block: &Block) -> String {
    block
        .attrs
        .iter()
        .map(|(k, v)| format!(" {k}=\"{v}\""))
        .collect()
}

/// Render blocks back into plugin source text.
pub fn compose(blocks: &[Block]) -> String {
    let mut out = String::new();
    for block in blocks {
        let kind = block.kind.as_str();
        let attrs = render_attrs(block);
        if block.kind.is_void() {
            out.push_str(&format!("<{kind}{attrs}>\n\n"));
        } else {
            out.push_str(&format!("<{kind}{attrs}>\n{}\n</{kind}>\n\n", block.content));
        }
    }
    out
}
