use std::sync::LazyLock;

use folio_core::position::descendants;
use folio_core::{ApplyError, Editor, Node, Op, Path, TextNode, Transaction};
use regex::Regex;

static INLINE_DOLLAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([^$\n]+)\$").expect("inline dollar pattern"));

/// A piece of a text leaf after `$..$` runs are cut out.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Math(&'a str),
}

/// Splits text around `$..$` runs. A run must not touch another `$`, must not follow a
/// backslash, and must hold something besides whitespace.
fn split_dollars(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut copied = 0;
    let mut at = 0;

    while let Some(caps) = INLINE_DOLLAR.captures_at(text, at) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let (start, end) = (whole.start(), whole.end());
        let escaped = start > 0 && matches!(bytes[start - 1], b'$' | b'\\');
        let doubled = bytes.get(end) == Some(&b'$');
        let latex = inner.as_str().trim();
        if escaped || doubled || latex.is_empty() {
            at = start + 1;
            continue;
        }
        if start > copied {
            segments.push(Segment::Text(&text[copied..start]));
        }
        segments.push(Segment::Math(latex));
        copied = end;
        at = end;
    }

    if segments.is_empty() {
        return segments;
    }
    if copied < text.len() {
        segments.push(Segment::Text(&text[copied..]));
    }
    segments
}

/// Replaces inline `$..$` runs in the text of non-code blocks with `inline_math` nodes, in
/// one silent transaction. Leaves marked as code are left alone. Returns whether anything
/// changed.
pub fn canonicalize_dollars(editor: &mut Editor) -> Result<bool, ApplyError> {
    let doc = editor.doc();
    let registry = editor.registry();
    let mut ops: Vec<Op> = Vec::new();
    let mut replaced = 0usize;

    let leaves: Vec<(Path, &TextNode)> = descendants(doc)
        .into_iter()
        .filter_map(|(path, d)| match d.node {
            Node::Text(t) if t.text.contains('$') && !t.marks.code => Some((path, t)),
            _ => None,
        })
        .collect();

    // Later leaves first so earlier paths stay valid.
    for (path, leaf) in leaves.into_iter().rev() {
        let Some((ix, parent)) = path.split_last() else {
            continue;
        };
        let in_code = doc
            .node(parent)
            .is_some_and(|block| registry.is_code(block.kind()));
        if in_code {
            continue;
        }
        let segments = split_dollars(&leaf.text);
        if segments.is_empty() {
            continue;
        }

        ops.push(Op::RemoveNode { path: path.clone() });
        for (offset, segment) in segments.into_iter().enumerate() {
            let node = match segment {
                Segment::Text(text) => Node::Text(TextNode {
                    text: text.to_string(),
                    marks: leaf.marks.clone(),
                }),
                Segment::Math(latex) => {
                    replaced += 1;
                    Node::inline_math(latex)
                }
            };
            let mut at = parent.to_vec();
            at.push(ix + offset);
            ops.push(Op::InsertNode { path: at, node });
        }
    }

    if ops.is_empty() {
        return Ok(false);
    }
    editor.apply(
        Transaction::new(ops)
            .source("math:canonicalize_dollars")
            .silent(true),
    )?;
    tracing::debug!(replaced, "canonicalized inline dollar math");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_around_single_dollar_runs() {
        assert_eq!(
            split_dollars("cost $x^2$ and $y$."),
            vec![
                Segment::Text("cost "),
                Segment::Math("x^2"),
                Segment::Text(" and "),
                Segment::Math("y"),
                Segment::Text("."),
            ]
        );
    }

    #[test]
    fn ignores_display_escaped_and_blank_runs() {
        assert!(split_dollars("$$x$$").is_empty());
        assert!(split_dollars(r"price \$5$ today").is_empty());
        assert!(split_dollars("$ $").is_empty());
        assert!(split_dollars("$5 and\n$6").is_empty());
    }
}
