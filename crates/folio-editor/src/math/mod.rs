//! Legacy math notation: scanning markup for `\(..\)`, `\[..\]` and `$$..$$`, rewriting it
//! into canonical math nodes, and turning inline `$..$` runs of a live document into
//! `inline_math` nodes.

mod dollar;
mod migrate;

pub use self::dollar::*;
pub use self::migrate::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathKind {
    Inline,
    Block,
}

impl MathKind {
    /// The node kind this math renders as.
    pub fn node_kind(self) -> &'static str {
        match self {
            MathKind::Inline => "inline_math",
            MathKind::Block => "block_math",
        }
    }

    pub fn insert_command(self) -> &'static str {
        match self {
            MathKind::Inline => "math.insert_inline",
            MathKind::Block => "math.insert_block",
        }
    }

    pub fn from_node_kind(kind: &str) -> Option<Self> {
        match kind {
            "inline_math" => Some(MathKind::Inline),
            "block_math" => Some(MathKind::Block),
            _ => None,
        }
    }
}

/// Escapes text for a double- or single-quoted HTML attribute. `&` goes first so the
/// entities introduced by later steps are not escaped twice.
pub fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Decodes the handful of entities a serializer emits inside text content.
pub fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(ix) = rest.find('&') {
        out.push_str(&rest[..ix]);
        rest = &rest[ix..];
        let decoded = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&#39;", '\''),
            ("&#x27;", '\''),
            ("&nbsp;", '\u{a0}'),
        ]
        .into_iter()
        .find(|(entity, _)| rest.starts_with(entity));
        match decoded {
            Some((entity, ch)) => {
                out.push(ch);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
