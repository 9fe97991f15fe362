//! Integer document positions.
//!
//! A text leaf occupies its byte length, a void node occupies 1 and an element occupies its
//! content plus an opening and a closing boundary. Position 0 is the start of the document
//! content, before the first top-level block.

use crate::core::{Document, Node, Point, Selection, clamp_to_char_boundary, node_ref};
use crate::ops::Path;

pub fn node_size(node: &Node) -> usize {
    match node {
        Node::Text(t) => t.text.len(),
        Node::Void(_) => 1,
        Node::Element(el) => 2 + children_size(&el.children),
    }
}

fn children_size(children: &[Node]) -> usize {
    children.iter().map(node_size).sum()
}

pub fn content_size(doc: &Document) -> usize {
    children_size(&doc.children)
}

/// Position directly before the node at `path`.
pub fn position_of(doc: &Document, path: &[usize]) -> Option<usize> {
    let (first, rest) = path.split_first()?;
    if *first >= doc.children.len() {
        return None;
    }
    let mut pos = children_size(&doc.children[..*first]);
    let mut node = &doc.children[*first];
    for &ix in rest {
        let Node::Element(el) = node else {
            return None;
        };
        if ix >= el.children.len() {
            return None;
        }
        pos += 1 + children_size(&el.children[..ix]);
        node = &el.children[ix];
    }
    Some(pos)
}

/// Position directly after the node at `path`.
pub fn position_after(doc: &Document, path: &[usize]) -> Option<usize> {
    let node = node_ref(doc, path)?;
    Some(position_of(doc, path)? + node_size(node))
}

/// The outermost node that starts at `pos`, or the text leaf `pos` falls inside.
pub fn node_at_pos(doc: &Document, pos: usize) -> Option<(Path, &Node)> {
    let mut children: &[Node] = &doc.children;
    let mut path: Path = Vec::new();
    let mut rel = pos;

    loop {
        let mut cursor = 0usize;
        let mut descend: Option<&[Node]> = None;
        for (ix, child) in children.iter().enumerate() {
            let size = node_size(child);
            if rel == cursor {
                path.push(ix);
                return Some((path, child));
            }
            if rel < cursor + size {
                path.push(ix);
                match child {
                    Node::Text(_) => return Some((path, child)),
                    Node::Void(_) => return None,
                    Node::Element(el) => {
                        rel = rel - cursor - 1;
                        descend = Some(&el.children);
                    }
                }
                break;
            }
            cursor += size;
        }
        children = descend?;
    }
}

/// Where a position lands inside the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPos {
    pub pos: usize,
    /// Path of the innermost element containing the position (empty for the document).
    pub parent_path: Path,
    /// Index of the child at or after the position within the parent.
    pub index: usize,
    /// Offset from the start of the parent's content.
    pub parent_offset: usize,
    /// Set when the position falls strictly inside the text leaf at `index`.
    pub text_offset: Option<usize>,
}

impl ResolvedPos {
    pub fn depth(&self) -> usize {
        self.parent_path.len()
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_path.is_empty()
    }
}

pub fn resolve(doc: &Document, pos: usize) -> Option<ResolvedPos> {
    if pos > content_size(doc) {
        return None;
    }

    let mut children: &[Node] = &doc.children;
    let mut parent_path: Path = Vec::new();
    let mut rel = pos;

    'outer: loop {
        let mut cursor = 0usize;
        for (ix, child) in children.iter().enumerate() {
            let size = node_size(child);
            if rel == cursor {
                return Some(ResolvedPos {
                    pos,
                    parent_path,
                    index: ix,
                    parent_offset: rel,
                    text_offset: None,
                });
            }
            if rel < cursor + size {
                match child {
                    Node::Text(_) => {
                        return Some(ResolvedPos {
                            pos,
                            parent_path,
                            index: ix,
                            parent_offset: rel,
                            text_offset: Some(rel - cursor),
                        });
                    }
                    Node::Void(_) => return None,
                    Node::Element(el) => {
                        parent_path.push(ix);
                        rel = rel - cursor - 1;
                        children = &el.children;
                        continue 'outer;
                    }
                }
            }
            cursor += size;
        }
        return Some(ResolvedPos {
            pos,
            parent_path,
            index: children.len(),
            parent_offset: rel,
            text_offset: None,
        });
    }
}

/// Maps a position inside a text block onto a text leaf. At a leaf boundary the end of the
/// preceding leaf wins. Positions between blocks have no point.
pub fn pos_to_point(doc: &Document, pos: usize) -> Option<Point> {
    let resolved = resolve(doc, pos)?;
    if resolved.parent_path.is_empty() {
        return None;
    }
    let Some(Node::Element(parent)) = node_ref(doc, &resolved.parent_path) else {
        return None;
    };
    if parent.children.iter().any(|n| matches!(n, Node::Element(_))) {
        return None;
    }

    let leaf_path = |ix: usize| {
        let mut path = resolved.parent_path.clone();
        path.push(ix);
        path
    };

    if let Some(offset) = resolved.text_offset {
        let Some(Node::Text(t)) = parent.children.get(resolved.index) else {
            return None;
        };
        return Some(Point::new(
            leaf_path(resolved.index),
            clamp_to_char_boundary(&t.text, offset),
        ));
    }

    if let Some(prev_ix) = resolved.index.checked_sub(1) {
        if let Some(Node::Text(t)) = parent.children.get(prev_ix) {
            return Some(Point::new(leaf_path(prev_ix), t.text.len()));
        }
    }
    match parent.children.get(resolved.index) {
        Some(Node::Text(_)) => Some(Point::new(leaf_path(resolved.index), 0)),
        _ => None,
    }
}

pub fn point_to_pos(doc: &Document, point: &Point) -> Option<usize> {
    let start = position_of(doc, &point.path)?;
    match node_ref(doc, &point.path)? {
        Node::Text(t) => Some(start + point.offset.min(t.text.len())),
        _ => Some(start),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Descendant<'a> {
    pub pos: usize,
    pub node: &'a Node,
}

/// Every node in document order, paired with its path and start position.
pub fn descendants(doc: &Document) -> Vec<(Path, Descendant<'_>)> {
    fn walk<'a>(
        children: &'a [Node],
        mut pos: usize,
        path: &mut Vec<usize>,
        out: &mut Vec<(Path, Descendant<'a>)>,
    ) {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            out.push((path.clone(), Descendant { pos, node }));
            if let Node::Element(el) = node {
                walk(&el.children, pos + 1, path, out);
            }
            path.pop();
            pos += node_size(node);
        }
    }

    let mut out = Vec::new();
    walk(&doc.children, 0, &mut Vec::new(), &mut out);
    out
}

/// A text selection covering `from..to`, snapped inward to the nearest text leaves.
pub fn text_selection_between(doc: &Document, from: usize, to: usize) -> Option<Selection> {
    let (from, to) = if from <= to { (from, to) } else { (to, from) };
    let leaves: Vec<(Path, usize, &str)> = descendants(doc)
        .into_iter()
        .filter_map(|(path, d)| match d.node {
            Node::Text(t) => Some((path, d.pos, t.text.as_str())),
            _ => None,
        })
        .collect();

    let (anchor_path, anchor_start, anchor_text) = leaves
        .iter()
        .find(|(_, start, text)| start + text.len() >= from)?;
    let anchor = Point::new(
        anchor_path.clone(),
        clamp_to_char_boundary(anchor_text, from.saturating_sub(*anchor_start)),
    );

    let focus = leaves
        .iter()
        .rev()
        .find(|(_, start, _)| *start <= to)
        .map(|(path, start, text)| {
            Point::new(
                path.clone(),
                clamp_to_char_boundary(text, to.saturating_sub(*start)),
            )
        })
        .filter(|focus| point_to_pos(doc, focus) >= point_to_pos(doc, &anchor))
        .unwrap_or_else(|| anchor.clone());

    Some(Selection { anchor, focus })
}
