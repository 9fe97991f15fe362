use folio_core::{Document, PluginRegistry};
use thiserror::Error;

use crate::tracker::BlockTag;

/// Identity of a rendered block element. Stable for as long as the view keeps the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

/// Viewport-relative geometry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    pub fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scroll_x: f32,
    pub scroll_y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("position {0} is outside the document")]
    OutOfRange(usize),
    #[error("element {0:?} is detached")]
    Detached(ElementId),
}

/// The rendering surface the controllers talk to. Content is never written through this
/// seam; only ephemeral presentation (tags, classes, focus) is.
pub trait EditorView {
    /// Re-renders after the document changed.
    fn sync(&mut self, doc: &Document, registry: &PluginRegistry);

    /// The element rendered for the node starting at `pos`.
    fn node_dom(&self, pos: usize) -> Result<Option<ElementId>, ViewError>;

    fn tag(&mut self, element: ElementId, tag: &BlockTag) -> Result<(), ViewError>;

    fn block_tag(&self, element: ElementId) -> Option<&BlockTag>;

    fn set_class(&mut self, element: ElementId, class: &str, enabled: bool);

    fn rect(&self, element: ElementId) -> Option<Rect>;

    fn is_connected(&self, element: ElementId) -> bool;

    /// The innermost tagged element under a viewport point.
    fn element_at(&self, x: f32, y: f32) -> Option<ElementId>;

    /// The innermost tagged element containing a document position.
    fn element_for_pos(&self, pos: usize) -> Option<ElementId>;

    fn viewport(&self) -> Viewport;

    fn focus(&mut self);

    fn has_focus(&self) -> bool;
}

/// Asks the person at the keyboard for a line of text. `None` means the prompt was cancelled.
pub trait Prompter {
    fn prompt(&mut self, message: &str, default: &str) -> Option<String>;
}

impl<F> Prompter for F
where
    F: FnMut(&str, &str) -> Option<String>,
{
    fn prompt(&mut self, message: &str, default: &str) -> Option<String> {
        self(message, default)
    }
}
