use std::borrow::Cow;
use std::ops::Range;
use std::sync::LazyLock;

use folio_core::{ApplyError, Editor, HtmlError, parse_html, to_html};
use regex::{Captures, Regex};
use thiserror::Error;

use super::{MathKind, decode_entities, escape_attr};

static BRACKET_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\[([\s\S]*?)\\\]").expect("bracket block pattern"));
static DOLLAR_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$([\s\S]*?)\$\$").expect("dollar block pattern"));
static PAREN_INLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\(([\s\S]*?)\\\)").expect("paren inline pattern"));
static DOLLAR_BLOCK_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$[^$]+\$\$").expect("dollar hint pattern"));
static CANONICAL_INLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<span[^>]*data-type="inline-math"[^>]*>[\s\S]*?</span>"#)
        .expect("canonical inline pattern")
});
static CANONICAL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<div[^>]*data-type="block-math"[^>]*>[\s\S]*?</div>"#)
        .expect("canonical block pattern")
});

/// One legacy math span found in markup. Offsets are byte offsets into the scanned string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MathMatch {
    pub start: usize,
    pub end: usize,
    pub latex: String,
    pub kind: MathKind,
    pub raw: String,
}

impl MathMatch {
    /// The canonical element that replaces this span.
    pub fn replacement(&self) -> String {
        let latex = escape_attr(&self.latex);
        match self.kind {
            MathKind::Block => format!(r#"<div data-type="block-math" data-latex="{latex}"></div>"#),
            MathKind::Inline => {
                format!(r#"<span data-type="inline-math" data-latex="{latex}"></span>"#)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to serialize document: {0}")]
    Html(#[from] HtmlError),
    #[error("failed to replace document: {0}")]
    Apply(#[from] ApplyError),
}

/// True when the markup may contain a delimiter the migrator rewrites.
pub fn has_legacy_math(markup: &str) -> bool {
    markup.contains("\\(") || markup.contains("\\[") || DOLLAR_BLOCK_HINT.is_match(markup)
}

/// Spans of markup that already are canonical math elements.
fn canonical_regions(markup: &str) -> Vec<Range<usize>> {
    let mut regions: Vec<Range<usize>> = CANONICAL_INLINE
        .find_iter(markup)
        .chain(CANONICAL_BLOCK.find_iter(markup))
        .map(|m| m.range())
        .collect();
    regions.sort_by_key(|r| r.start);
    regions
}

/// Whether `at` sits inside an unclosed `<` within the last `lookback` characters.
fn inside_open_tag(markup: &str, at: usize, lookback: usize) -> bool {
    let before = &markup[..at];
    let window_start = before
        .char_indices()
        .rev()
        .nth(lookback.saturating_sub(1))
        .map_or(0, |(ix, _)| ix);
    let window = &before[window_start..];
    match window.rfind('<') {
        Some(open) => !window[open..].contains('>'),
        None => false,
    }
}

/// Scans left to right for `\[..\]`, `$$..$$` and `\(..\)`, keeping non-overlapping
/// matches. At each step the earliest match wins, ties going to the patterns in that
/// order. Matches inside canonical math elements or open tags, and empty ones, are dropped.
pub fn find_legacy_math(markup: &str, lookback: usize) -> Vec<MathMatch> {
    let patterns: [(&Regex, MathKind); 3] = [
        (&BRACKET_BLOCK, MathKind::Block),
        (&DOLLAR_BLOCK, MathKind::Block),
        (&PAREN_INLINE, MathKind::Inline),
    ];
    let regions = canonical_regions(markup);
    let mut matches = Vec::new();
    // Next candidate per pattern; a pattern is only searched again once `at` passes it.
    let mut next: [Option<Captures<'_>>; 3] = [None, None, None];
    let mut exhausted = [false; 3];
    let mut at = 0;

    while at < markup.len() {
        for (ix, (re, _)) in patterns.iter().enumerate() {
            let stale = next[ix]
                .as_ref()
                .is_none_or(|caps| caps.get(0).is_none_or(|m| m.start() < at));
            if stale && !exhausted[ix] {
                next[ix] = re.captures_at(markup, at);
                exhausted[ix] = next[ix].is_none();
            }
        }
        let Some(ix) = (0..patterns.len())
            .filter(|ix| next[*ix].is_some())
            .min_by_key(|ix| {
                next[*ix]
                    .as_ref()
                    .and_then(|caps| caps.get(0))
                    .map_or(usize::MAX, |m| m.start())
            })
        else {
            break;
        };
        let kind = patterns[ix].1;
        let Some(caps) = next[ix].take() else {
            break;
        };
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let (start, end) = (whole.start(), whole.end());

        if let Some(region) = regions.iter().find(|r| r.contains(&start)) {
            at = region.end;
            continue;
        }
        let latex = decode_entities(inner.as_str()).trim().to_string();
        let overlaps = regions.iter().any(|r| start < r.end && r.start < end);
        if overlaps || latex.is_empty() || inside_open_tag(markup, start, lookback) {
            // Resume right after the rejected opening delimiter.
            at = inner.start();
            continue;
        }

        matches.push(MathMatch {
            start,
            end,
            latex,
            kind,
            raw: whole.as_str().to_string(),
        });
        at = end;
    }

    matches
}

/// Rewrites legacy delimiters in raw markup into canonical math elements. Markup without
/// legacy delimiters is returned borrowed.
pub fn preprocess_math_content(markup: &str, lookback: usize) -> Cow<'_, str> {
    if !has_legacy_math(markup) {
        return Cow::Borrowed(markup);
    }
    let mut matches = find_legacy_math(markup, lookback);
    if matches.is_empty() {
        return Cow::Borrowed(markup);
    }

    matches.sort_by(|a, b| b.start.cmp(&a.start));
    let mut out = markup.to_string();
    for m in &matches {
        debug_assert_eq!(m.end - m.start, m.raw.len());
        out.replace_range(m.start..m.end, &m.replacement());
    }
    tracing::debug!(rewritten = matches.len(), "rewrote legacy math delimiters");
    Cow::Owned(out)
}

/// Migrates a live editor: serializes it, rewrites legacy delimiters and, when anything
/// changed, replaces the content without emitting an update. Returns whether it did.
pub fn migrate_editor(editor: &mut Editor, lookback: usize) -> Result<bool, MigrationError> {
    let html = to_html(editor.doc())?;
    let next = match preprocess_math_content(&html, lookback) {
        Cow::Borrowed(_) => return Ok(false),
        Cow::Owned(next) if next == html => return Ok(false),
        Cow::Owned(next) => next,
    };
    editor.set_content(parse_html(&next), true)?;
    tracing::debug!("committed math migration");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_window_counts_characters() {
        let markup = r#"<img alt="ééé \(x\)">"#;
        let start = markup.find("\\(").unwrap();
        assert!(inside_open_tag(markup, start, 500));
        assert!(!inside_open_tag(markup, start, 3));
    }

    #[test]
    fn earliest_match_wins_and_overlaps_drop() {
        let found = find_legacy_math(r"\[ a \( b \] c \)", 500);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, MathKind::Block);
        assert_eq!(found[0].latex, r"a \( b");
    }

    #[test]
    fn empty_spans_are_skipped() {
        assert!(find_legacy_math(r"\(\) and \[   \]", 500).is_empty());
    }
}
