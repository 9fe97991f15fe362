use folio_core::position::{node_at_pos, node_size, point_to_pos};
use folio_core::Editor;
use serde_json::json;

use crate::config::EditorConfig;
use crate::view::{EditorView, ElementId, Rect};

/// Class carried by the element the controls are currently attached to.
pub const CONTROLS_CLASS: &str = "has-block-controls";

/// Overrides the default "insert below" behavior. Receives the position right after the
/// hovered block and its node type.
pub type AddBlockHandler = Box<dyn FnMut(&mut Editor, usize, &str)>;

/// The single block the floating controls are attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct HoverBlock {
    pub node_type: String,
    pub position: usize,
    pub rect: Rect,
    pub element: ElementId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayPosition {
    pub top: f32,
    pub left: f32,
}

/// What a drag carries out of the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragPayload {
    pub node_type: String,
    pub position: usize,
    pub text: String,
}

/// Hover-driven overlay state: idle, showing, or showing with a pending hide.
pub struct BlockControls {
    hover: Option<HoverBlock>,
    hide_deadline: Option<u64>,
    hovering_controls: bool,
    dragging: Option<usize>,
    marked: Option<ElementId>,
    hide_delay_ms: u64,
    offset_px: f32,
    min_left_px: f32,
}

impl BlockControls {
    pub fn new(config: &EditorConfig) -> Self {
        Self {
            hover: None,
            hide_deadline: None,
            hovering_controls: false,
            dragging: None,
            marked: None,
            hide_delay_ms: config.hide_delay_ms,
            offset_px: config.controls_offset_px,
            min_left_px: config.controls_min_left_px,
        }
    }

    pub fn hover(&self) -> Option<&HoverBlock> {
        self.hover.as_ref()
    }

    pub fn is_hide_pending(&self) -> bool {
        self.hide_deadline.is_some()
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging.is_some()
    }

    /// Pointer moved inside the editor. `target` is the tagged element under it, if any.
    pub fn pointer_move(
        &mut self,
        editor: &Editor,
        view: &mut dyn EditorView,
        target: Option<ElementId>,
        now: u64,
    ) {
        if !editor.is_editable() {
            self.clear(view);
            return;
        }
        match target {
            Some(element) if self.show(view, element) => {}
            _ if self.hovering_controls => {}
            _ => self.schedule_hide(now),
        }
    }

    /// Pointer left the editor surface.
    pub fn pointer_leave(&mut self, now: u64) {
        if !self.hovering_controls {
            self.schedule_hide(now);
        }
    }

    pub fn enter_controls(&mut self) {
        self.hovering_controls = true;
        self.hide_deadline = None;
    }

    pub fn leave_controls(&mut self, now: u64) {
        self.hovering_controls = false;
        self.schedule_hide(now);
    }

    /// Follows the caret into the block that contains it.
    pub fn selection_changed(&mut self, editor: &Editor, view: &mut dyn EditorView) {
        if !editor.is_editable() {
            return;
        }
        let Some(pos) = point_to_pos(editor.doc(), &editor.selection().focus) else {
            return;
        };
        if let Some(element) = view.element_for_pos(pos) {
            self.show(view, element);
        }
    }

    /// Advances the hide timer. Also drops the state when its element left the view.
    pub fn tick(&mut self, view: &mut dyn EditorView, now: u64) {
        let detached = self
            .hover
            .as_ref()
            .is_some_and(|hover| !view.is_connected(hover.element));
        let expired = self.hide_deadline.is_some_and(|deadline| now >= deadline);
        if detached || expired {
            self.clear(view);
        }
    }

    /// Re-reads the tracked element after layout, scroll or re-tagging.
    pub fn refresh_geometry(&mut self, view: &mut dyn EditorView) {
        let Some(element) = self.hover.as_ref().map(|hover| hover.element) else {
            return;
        };
        let rect = view.rect(element);
        let tag = view.block_tag(element).cloned();
        let (Some(rect), Some(tag)) = (rect, tag) else {
            self.clear(view);
            return;
        };
        if let Some(hover) = self.hover.as_mut() {
            hover.rect = rect;
            hover.node_type = tag.node_type;
            hover.position = tag.position;
        }
    }

    /// Inserts an empty block right after the hovered one and moves the caret into it.
    pub fn insert_below(
        &mut self,
        editor: &mut Editor,
        view: &mut dyn EditorView,
        handler: Option<&mut AddBlockHandler>,
    ) -> bool {
        if !editor.is_editable() {
            return false;
        }
        let Some(hover) = self.hover.as_ref() else {
            return false;
        };
        let Some((_, node)) = node_at_pos(editor.doc(), hover.position) else {
            tracing::warn!(position = hover.position, "hovered block no longer exists");
            return false;
        };
        let after = hover.position + node_size(node);

        let inserted = match handler {
            Some(handler) => {
                handler(editor, after, &hover.node_type);
                true
            }
            None => match editor
                .run_command("block.insert_paragraph_at", Some(json!({ "pos": after })))
            {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(pos = after, error = err.message(), "insert below failed");
                    false
                }
            },
        };
        view.focus();
        inserted
    }

    /// Selects the hovered node so it can be dragged: as a whole node when its kind allows
    /// it, as a text range spanning it otherwise.
    pub fn drag_start(
        &mut self,
        editor: &mut Editor,
        view: &mut dyn EditorView,
    ) -> Option<DragPayload> {
        if !editor.is_editable() {
            return None;
        }
        let hover = self.hover.clone()?;
        let Some((path, node)) = node_at_pos(editor.doc(), hover.position) else {
            tracing::warn!(position = hover.position, "drag source no longer exists");
            return None;
        };
        let size = node_size(node);
        let text = node.text_content();
        let selectable = editor.registry().is_selectable(node.kind());

        if selectable {
            if let Err(err) = editor.select_node(path) {
                tracing::warn!(%err, "failed to select dragged node");
            }
        } else if !editor.select_range(hover.position, hover.position + size) {
            tracing::warn!(position = hover.position, "failed to select dragged range");
        }
        view.focus();
        self.dragging = Some(hover.position);

        Some(DragPayload {
            node_type: hover.node_type,
            position: hover.position,
            text,
        })
    }

    /// Drops the dragged block at a block boundary.
    pub fn drop_at(&mut self, editor: &mut Editor, to: usize) -> bool {
        let Some(from) = self.dragging.take() else {
            return false;
        };
        if !editor.is_editable() {
            return false;
        }
        match editor.run_command("block.move", Some(json!({ "from": from, "to": to }))) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(from, to, error = err.message(), "block drop rejected");
                false
            }
        }
    }

    pub fn drag_end(&mut self, view: &mut dyn EditorView, now: u64) {
        self.dragging = None;
        view.focus();
        self.schedule_hide(now);
    }

    /// Where the overlay renders, in document coordinates. `None` hides it.
    pub fn overlay_position(
        &self,
        editor: &Editor,
        view: &dyn EditorView,
    ) -> Option<OverlayPosition> {
        if !editor.is_editable() {
            return None;
        }
        let hover = self.hover.as_ref()?;
        let viewport = view.viewport();
        Some(OverlayPosition {
            top: hover.rect.center_y() + viewport.scroll_y,
            left: (hover.rect.x + viewport.scroll_x - self.offset_px).max(self.min_left_px),
        })
    }

    fn show(&mut self, view: &mut dyn EditorView, element: ElementId) -> bool {
        let Some(tag) = view.block_tag(element) else {
            return false;
        };
        let Some(rect) = view.rect(element) else {
            return false;
        };
        let next = HoverBlock {
            node_type: tag.node_type.clone(),
            position: tag.position,
            rect,
            element,
        };

        self.hide_deadline = None;
        let unchanged = self
            .hover
            .as_ref()
            .is_some_and(|hover| hover.element == next.element && hover.rect == next.rect);
        if unchanged {
            return true;
        }
        tracing::trace!(node_type = %next.node_type, position = next.position, "block controls");
        self.mark(view, Some(element));
        self.hover = Some(next);
        true
    }

    fn schedule_hide(&mut self, now: u64) {
        if self.hover.is_none() {
            return;
        }
        self.hide_deadline = Some(now + self.hide_delay_ms);
    }

    fn clear(&mut self, view: &mut dyn EditorView) {
        self.hover = None;
        self.hide_deadline = None;
        self.mark(view, None);
    }

    fn mark(&mut self, view: &mut dyn EditorView, element: Option<ElementId>) {
        if self.marked == element {
            return;
        }
        if let Some(previous) = self.marked.take() {
            view.set_class(previous, CONTROLS_CLASS, false);
        }
        if let Some(element) = element {
            view.set_class(element, CONTROLS_CLASS, true);
        }
        self.marked = element;
    }
}
