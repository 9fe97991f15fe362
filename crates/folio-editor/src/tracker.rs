use folio_core::position::descendants;
use folio_core::{Editor, Node};

use crate::view::EditorView;

/// Class stamped on every tagged block element.
pub const BLOCK_NODE_CLASS: &str = "folio-block-node";

/// Annotation carried by a rendered block element. Only block-level nodes below the root
/// are tagged. Recomputed on every refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTag {
    pub node_type: String,
    pub position: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub tagged: usize,
    pub skipped: usize,
}

/// Stamps every block-level node's element with its kind and start position. Nodes the
/// view cannot map are skipped; the next refresh retries them.
pub fn refresh_block_tags(editor: &Editor, view: &mut dyn EditorView) -> RefreshReport {
    let registry = editor.registry();
    let mut report = RefreshReport::default();

    for (path, descendant) in descendants(editor.doc()) {
        let kind = match descendant.node {
            Node::Element(el) => el.kind.as_str(),
            Node::Void(v) => v.kind.as_str(),
            Node::Text(_) => continue,
        };
        if !registry.is_block(kind) {
            continue;
        }

        let element = match view.node_dom(descendant.pos) {
            Ok(Some(element)) => element,
            Ok(None) => {
                tracing::trace!(?path, pos = descendant.pos, kind, "no element for block");
                report.skipped += 1;
                continue;
            }
            Err(err) => {
                tracing::debug!(?path, %err, "skipping block tag");
                report.skipped += 1;
                continue;
            }
        };

        let tag = BlockTag {
            node_type: kind.to_string(),
            position: descendant.pos,
        };
        match view.tag(element, &tag) {
            Ok(()) => {
                view.set_class(element, BLOCK_NODE_CLASS, true);
                report.tagged += 1;
            }
            Err(err) => {
                tracing::debug!(?path, %err, "skipping block tag");
                report.skipped += 1;
            }
        }
    }

    report
}
