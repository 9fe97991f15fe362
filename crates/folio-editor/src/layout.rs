use std::collections::{BTreeSet, HashMap};

use folio_core::position::{content_size, node_size};
use folio_core::{Document, Node, Path, PluginRegistry};

use crate::tracker::BlockTag;
use crate::view::{EditorView, ElementId, Rect, ViewError, Viewport};

const LINE_HEIGHT: f32 = 24.0;
const BLOCK_GAP: f32 = 8.0;
const CONTAINER_PADDING: f32 = 12.0;
const NESTING_INDENT: f32 = 24.0;
const IMAGE_HEIGHT: f32 = 240.0;
const MATH_HEIGHT: f32 = 48.0;
const CONTENT_MARGIN: f32 = 48.0;

#[derive(Debug, Clone)]
struct LaidOutBlock {
    id: ElementId,
    path: Path,
    kind: String,
    pos: usize,
    end: usize,
    depth: usize,
    top: f32,
    height: f32,
    tag: Option<BlockTag>,
    classes: BTreeSet<String>,
}

/// A view without a renderer: block-level nodes are stacked vertically, one box per block,
/// nested blocks indented inside their container. Elements keep their identity across
/// syncs while their path and kind stay the same.
pub struct HeadlessView {
    blocks: Vec<LaidOutBlock>,
    doc_size: usize,
    viewport: Viewport,
    focused: bool,
    next_id: u64,
    tag_writes: usize,
}

impl Default for HeadlessView {
    fn default() -> Self {
        Self::new(800.0, 600.0)
    }
}

impl HeadlessView {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            blocks: Vec::new(),
            doc_size: 0,
            viewport: Viewport {
                scroll_x: 0.0,
                scroll_y: 0.0,
                width,
                height,
            },
            focused: false,
            next_id: 1,
            tag_writes: 0,
        }
    }

    /// The element rendered for the block at `path`.
    pub fn element_for_path(&self, path: &[usize]) -> Option<ElementId> {
        self.blocks
            .iter()
            .find(|block| block.path == path)
            .map(|block| block.id)
    }

    pub fn elements(&self) -> Vec<ElementId> {
        self.blocks.iter().map(|block| block.id).collect()
    }

    pub fn has_class(&self, element: ElementId, class: &str) -> bool {
        self.block(element)
            .is_some_and(|block| block.classes.contains(class))
    }

    /// Number of tag writes that changed an element.
    pub fn tag_writes(&self) -> usize {
        self.tag_writes
    }

    pub fn scroll_to(&mut self, x: f32, y: f32) {
        self.viewport.scroll_x = x.max(0.0);
        self.viewport.scroll_y = y.max(0.0);
    }

    pub fn resize(&mut self, width: f32, height: f32) {
        self.viewport.width = width;
        self.viewport.height = height;
    }

    pub fn blur(&mut self) {
        self.focused = false;
    }

    fn block(&self, element: ElementId) -> Option<&LaidOutBlock> {
        self.blocks.iter().find(|block| block.id == element)
    }

    fn block_mut(&mut self, element: ElementId) -> Option<&mut LaidOutBlock> {
        self.blocks.iter_mut().find(|block| block.id == element)
    }

    fn viewport_rect(&self, block: &LaidOutBlock) -> Rect {
        let indent = block.depth as f32 * NESTING_INDENT;
        Rect::new(
            CONTENT_MARGIN + indent - self.viewport.scroll_x,
            block.top - self.viewport.scroll_y,
            (self.viewport.width - 2.0 * CONTENT_MARGIN - indent).max(0.0),
            block.height,
        )
    }

    fn fresh_id(&mut self) -> ElementId {
        let id = ElementId(self.next_id);
        self.next_id += 1;
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn lay_out(
        &mut self,
        nodes: &[Node],
        parent: &[usize],
        mut pos: usize,
        depth: usize,
        y: &mut f32,
        registry: &PluginRegistry,
        previous: &mut HashMap<(Path, String), LaidOutBlock>,
        out: &mut Vec<LaidOutBlock>,
    ) {
        for (ix, node) in nodes.iter().enumerate() {
            let size = node_size(node);
            let kind = node.kind();
            if node.is_text() || !registry.is_block(kind) {
                pos += size;
                continue;
            }

            let mut path = parent.to_vec();
            path.push(ix);
            let reused = previous.remove(&(path.clone(), kind.to_string()));
            let (id, tag, classes) = match reused {
                Some(block) => (block.id, block.tag, block.classes),
                None => (self.fresh_id(), None, BTreeSet::new()),
            };

            let top = *y;
            let slot = out.len();
            out.push(LaidOutBlock {
                id,
                path: path.clone(),
                kind: kind.to_string(),
                pos,
                end: pos + size,
                depth,
                top,
                height: 0.0,
                tag,
                classes,
            });

            let height = match node {
                Node::Void(_) if kind == "image" => IMAGE_HEIGHT,
                Node::Void(_) => MATH_HEIGHT,
                Node::Element(el) if !registry.is_text_block(el) => {
                    *y += CONTAINER_PADDING;
                    self.lay_out(
                        &el.children,
                        &path,
                        pos + 1,
                        depth + 1,
                        y,
                        registry,
                        previous,
                        out,
                    );
                    *y - top + CONTAINER_PADDING - BLOCK_GAP
                }
                _ => {
                    let lines = node.text_content().split('\n').count().max(1);
                    LINE_HEIGHT * lines as f32
                }
            };
            out[slot].height = height;
            *y = top + height + BLOCK_GAP;
            pos += size;
        }
    }
}

impl EditorView for HeadlessView {
    fn sync(&mut self, doc: &Document, registry: &PluginRegistry) {
        let mut previous: HashMap<(Path, String), LaidOutBlock> = std::mem::take(&mut self.blocks)
            .into_iter()
            .map(|block| ((block.path.clone(), block.kind.clone()), block))
            .collect();

        let mut out = Vec::new();
        let mut y = 0.0;
        self.lay_out(
            &doc.children,
            &[],
            0,
            0,
            &mut y,
            registry,
            &mut previous,
            &mut out,
        );
        if !previous.is_empty() {
            tracing::trace!(detached = previous.len(), "headless view dropped elements");
        }
        self.blocks = out;
        self.doc_size = content_size(doc);
    }

    fn node_dom(&self, pos: usize) -> Result<Option<ElementId>, ViewError> {
        if pos > self.doc_size {
            return Err(ViewError::OutOfRange(pos));
        }
        Ok(self
            .blocks
            .iter()
            .find(|block| block.pos == pos)
            .map(|block| block.id))
    }

    fn tag(&mut self, element: ElementId, tag: &BlockTag) -> Result<(), ViewError> {
        let block = self
            .block_mut(element)
            .ok_or(ViewError::Detached(element))?;
        if block.tag.as_ref() == Some(tag) {
            return Ok(());
        }
        block.tag = Some(tag.clone());
        self.tag_writes += 1;
        Ok(())
    }

    fn block_tag(&self, element: ElementId) -> Option<&BlockTag> {
        self.block(element)?.tag.as_ref()
    }

    fn set_class(&mut self, element: ElementId, class: &str, enabled: bool) {
        let Some(block) = self.block_mut(element) else {
            return;
        };
        if enabled {
            block.classes.insert(class.to_string());
        } else {
            block.classes.remove(class);
        }
    }

    fn rect(&self, element: ElementId) -> Option<Rect> {
        self.block(element).map(|block| self.viewport_rect(block))
    }

    fn is_connected(&self, element: ElementId) -> bool {
        self.block(element).is_some()
    }

    fn element_at(&self, x: f32, y: f32) -> Option<ElementId> {
        // Preorder, so the last hit is the innermost one.
        self.blocks
            .iter()
            .filter(|block| block.tag.is_some() && self.viewport_rect(block).contains(x, y))
            .last()
            .map(|block| block.id)
    }

    fn element_for_pos(&self, pos: usize) -> Option<ElementId> {
        self.blocks
            .iter()
            .filter(|block| {
                block.tag.is_some()
                    && (block.pos == pos || (block.pos < pos && pos < block.end))
            })
            .last()
            .map(|block| block.id)
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn focus(&mut self) {
        self.focused = true;
    }

    fn has_focus(&self) -> bool {
        self.focused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::Attrs;

    fn registry() -> PluginRegistry {
        PluginRegistry::richtext()
    }

    #[test]
    fn stacks_blocks_and_indents_nested_ones() {
        let doc = Document::new(vec![
            Node::paragraph("a"),
            Node::element("blockquote", Attrs::default(), vec![Node::paragraph("b")]),
            Node::image("i.png", None),
        ]);
        let mut view = HeadlessView::default();
        view.sync(&doc, &registry());

        let p = view.rect(view.element_for_path(&[0]).unwrap()).unwrap();
        let quote = view.rect(view.element_for_path(&[1]).unwrap()).unwrap();
        let inner = view.rect(view.element_for_path(&[1, 0]).unwrap()).unwrap();
        let image = view.rect(view.element_for_path(&[2]).unwrap()).unwrap();

        assert_eq!(p, Rect::new(48.0, 0.0, 704.0, 24.0));
        assert_eq!(quote.y, 32.0);
        assert_eq!(inner, Rect::new(72.0, 44.0, 680.0, 24.0));
        assert_eq!(quote.height, 48.0);
        assert_eq!(image.y, 88.0);
        assert_eq!(image.height, 240.0);
    }

    #[test]
    fn identity_survives_edits_that_keep_path_and_kind() {
        let mut view = HeadlessView::default();
        let registry = registry();
        view.sync(
            &Document::new(vec![Node::paragraph("a"), Node::paragraph("b")]),
            &registry,
        );
        let first = view.element_for_path(&[0]).unwrap();
        let second = view.element_for_path(&[1]).unwrap();

        view.sync(
            &Document::new(vec![Node::paragraph("changed"), Node::heading(1, "b")]),
            &registry,
        );
        assert_eq!(view.element_for_path(&[0]), Some(first));
        assert!(view.is_connected(first));
        assert!(!view.is_connected(second));
        assert_ne!(view.element_for_path(&[1]), Some(second));
    }

    #[test]
    fn scrolling_moves_rects_not_layout() {
        let doc = Document::new(vec![Node::paragraph("a"), Node::paragraph("b")]);
        let mut view = HeadlessView::default();
        view.sync(&doc, &registry());
        let second = view.element_for_path(&[1]).unwrap();

        view.scroll_to(0.0, 20.0);
        assert_eq!(view.rect(second).unwrap().y, 12.0);
        assert_eq!(view.node_dom(3).unwrap(), Some(second));
        assert_eq!(view.node_dom(40), Err(ViewError::OutOfRange(40)));
    }
}
