use std::rc::Rc;
use std::sync::LazyLock;

use folio_core::position::descendants;
use folio_core::{Document, Editor, Node, Path};
use pulldown_latex::config::{DisplayMode, RenderConfig};
use pulldown_latex::mathml::push_mathml;
use pulldown_latex::{Parser, Storage};
use serde_json::json;
use syntect::html::{ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;
use thiserror::Error;

use crate::config::EditorConfig;
use crate::image::ImageNodeView;
use crate::math::{MathKind, escape_attr};
use crate::view::Prompter;

static SYNTAXES: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);

/// Identity of a mounted node view. Survives edits that keep the node recognizable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

/// A controller bound to exactly one document node.
pub trait NodeView {
    fn id(&self) -> ViewId;

    fn path(&self) -> &[usize];

    /// The node as last seen by the view.
    fn node(&self) -> &Node;

    /// Updates in place. `false` means the node is no longer of this view's kind and the
    /// view has to be recreated.
    fn update(&mut self, node: &Node, path: &[usize]) -> bool;

    fn render(&self) -> String;

    fn destroy(&mut self);
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid latex: {0}")]
    Latex(String),
    #[error("highlighting failed: {0}")]
    Highlight(#[from] syntect::Error),
}

/// Renders LaTeX to MathML.
pub fn render_math(latex: &str, kind: MathKind) -> Result<String, RenderError> {
    let storage = Storage::new();
    let parser = Parser::new(latex, &storage);
    let config = RenderConfig {
        display_mode: match kind {
            MathKind::Block => DisplayMode::Block,
            MathKind::Inline => DisplayMode::Inline,
        },
        ..Default::default()
    };

    let events: Vec<_> = parser.collect();
    let errors: Vec<String> = events
        .iter()
        .filter_map(|event| event.as_ref().err().map(|err| err.to_string()))
        .collect();
    if !errors.is_empty() {
        return Err(RenderError::Latex(errors.join("; ")));
    }

    let mut mathml = String::new();
    push_mathml(&mut mathml, events.into_iter(), config)
        .map_err(|err| RenderError::Latex(err.to_string()))?;
    Ok(mathml)
}

/// Turns code into presentation markup. Swappable so hosts can bring their own highlighter.
pub trait CodeRenderer {
    fn render(&self, content: &str, language: Option<&str>) -> String;
}

/// Class-based syntect highlighting. `latex`, `math` and `tex` blocks render as display
/// math instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntectRenderer;

impl SyntectRenderer {
    fn try_render(&self, content: &str, language: Option<&str>) -> Result<String, RenderError> {
        if matches!(language, Some("latex" | "math" | "tex")) {
            let mathml = render_math(content, MathKind::Block)?;
            return Ok(format!(r#"<div class="math-display">{mathml}</div>"#));
        }

        let syntax = language
            .and_then(|token| SYNTAXES.find_syntax_by_token(token))
            .unwrap_or_else(|| SYNTAXES.find_syntax_plain_text());
        let mut generator =
            ClassedHTMLGenerator::new_with_class_style(syntax, &SYNTAXES, ClassStyle::Spaced);
        for line in LinesWithEndings::from(content) {
            generator.parse_html_for_line_which_includes_newline(line)?;
        }
        Ok(format!(
            r#"<pre class="code-block"><code class="language-{}">{}</code></pre>"#,
            escape_attr(language.unwrap_or("plaintext")),
            generator.finalize()
        ))
    }
}

impl CodeRenderer for SyntectRenderer {
    fn render(&self, content: &str, language: Option<&str>) -> String {
        match self.try_render(content, language) {
            Ok(html) => html,
            Err(err) => {
                tracing::warn!(%err, language, "code rendering fell back to plain text");
                plain_code(content, language)
            }
        }
    }
}

fn plain_code(content: &str, language: Option<&str>) -> String {
    format!(
        r#"<pre class="code-block"><code class="language-{}">{}</code></pre>"#,
        escape_attr(language.unwrap_or("plaintext")),
        escape_attr(content)
    )
}

pub struct CodeBlockView {
    id: ViewId,
    path: Path,
    node: Node,
    renderer: Rc<dyn CodeRenderer>,
}

impl CodeBlockView {
    pub fn new(id: ViewId, node: &Node, path: &[usize], renderer: Rc<dyn CodeRenderer>) -> Self {
        Self {
            id,
            path: path.to_vec(),
            node: node.clone(),
            renderer,
        }
    }

    pub fn language(&self) -> Option<&str> {
        self.node.attr_str("language")
    }
}

impl NodeView for CodeBlockView {
    fn id(&self) -> ViewId {
        self.id
    }

    fn path(&self) -> &[usize] {
        &self.path
    }

    fn node(&self) -> &Node {
        &self.node
    }

    fn update(&mut self, node: &Node, path: &[usize]) -> bool {
        if node.kind() != "code_block" {
            return false;
        }
        self.node = node.clone();
        self.path = path.to_vec();
        true
    }

    fn render(&self) -> String {
        self.renderer
            .render(&self.node.text_content(), self.language())
    }

    fn destroy(&mut self) {}
}

pub struct MathNodeView {
    id: ViewId,
    path: Path,
    node: Node,
    kind: MathKind,
}

impl MathNodeView {
    pub fn new(id: ViewId, node: &Node, path: &[usize], kind: MathKind) -> Self {
        Self {
            id,
            path: path.to_vec(),
            node: node.clone(),
            kind,
        }
    }

    pub fn latex(&self) -> &str {
        self.node.attr_str("latex").unwrap_or_default()
    }

    pub fn kind(&self) -> MathKind {
        self.kind
    }

    /// Prompts for new LaTeX, prefilled with the current source, and writes it back.
    /// Cancelled or blank input leaves the node alone.
    pub fn click(&self, editor: &mut Editor, prompter: &mut dyn Prompter) -> bool {
        if !editor.is_editable() {
            return false;
        }
        let Some(input) = prompter.prompt("Enter new calculation:", self.latex()) else {
            return false;
        };
        let latex = input.trim();
        if latex.is_empty() {
            return false;
        }

        let path = self.path.clone();
        let result = editor.transact("math:edit", |editor| {
            editor
                .select_node(path.clone())
                .map_err(|err| err.to_string())?;
            editor
                .run_command("math.update", Some(json!({ "path": path, "latex": latex })))
                .map_err(|err| err.message().to_string())
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = ?self.path, error = %err, "math edit failed");
                false
            }
        }
    }
}

impl NodeView for MathNodeView {
    fn id(&self) -> ViewId {
        self.id
    }

    fn path(&self) -> &[usize] {
        &self.path
    }

    fn node(&self) -> &Node {
        &self.node
    }

    fn update(&mut self, node: &Node, path: &[usize]) -> bool {
        if MathKind::from_node_kind(node.kind()) != Some(self.kind) {
            return false;
        }
        self.node = node.clone();
        self.path = path.to_vec();
        true
    }

    fn render(&self) -> String {
        let (tag, class) = match self.kind {
            MathKind::Inline => ("span", "math-inline"),
            MathKind::Block => ("div", "math-display"),
        };
        match render_math(self.latex(), self.kind) {
            Ok(mathml) => format!(r#"<{tag} class="{class}">{mathml}</{tag}>"#),
            Err(err) => {
                tracing::warn!(%err, "math rendering fell back to source");
                format!(
                    r#"<{tag} class="{class} math-error"><code>{}</code></{tag}>"#,
                    escape_attr(self.latex())
                )
            }
        }
    }

    fn destroy(&mut self) {}
}

/// A node view of any supported kind, dispatched by the node's kind tag.
pub enum MountedView {
    Image(ImageNodeView),
    Code(CodeBlockView),
    Math(MathNodeView),
}

impl MountedView {
    fn create(
        id: ViewId,
        node: &Node,
        path: &[usize],
        config: &EditorConfig,
        renderer: &Rc<dyn CodeRenderer>,
    ) -> Option<Self> {
        match node.kind() {
            "image" => ImageNodeView::new(id, node, path, config.upload_settle_ms)
                .map(MountedView::Image),
            "code_block" => Some(MountedView::Code(CodeBlockView::new(
                id,
                node,
                path,
                Rc::clone(renderer),
            ))),
            kind => MathKind::from_node_kind(kind)
                .map(|kind| MountedView::Math(MathNodeView::new(id, node, path, kind))),
        }
    }

    fn view(&self) -> &dyn NodeView {
        match self {
            MountedView::Image(view) => view,
            MountedView::Code(view) => view,
            MountedView::Math(view) => view,
        }
    }

    fn view_mut(&mut self) -> &mut dyn NodeView {
        match self {
            MountedView::Image(view) => view,
            MountedView::Code(view) => view,
            MountedView::Math(view) => view,
        }
    }
}

impl NodeView for MountedView {
    fn id(&self) -> ViewId {
        self.view().id()
    }

    fn path(&self) -> &[usize] {
        self.view().path()
    }

    fn node(&self) -> &Node {
        self.view().node()
    }

    fn update(&mut self, node: &Node, path: &[usize]) -> bool {
        self.view_mut().update(node, path)
    }

    fn render(&self) -> String {
        self.view().render()
    }

    fn destroy(&mut self) {
        self.view_mut().destroy()
    }
}

/// The node views mounted for a document, kept in document order.
pub struct NodeViews {
    views: Vec<MountedView>,
    next_id: u64,
    renderer: Rc<dyn CodeRenderer>,
    config: EditorConfig,
}

impl NodeViews {
    pub fn new(config: &EditorConfig, renderer: Rc<dyn CodeRenderer>) -> Self {
        Self {
            views: Vec::new(),
            next_id: 1,
            renderer,
            config: config.clone(),
        }
    }

    /// Brings the mounted views in line with `doc`. A view follows its node when the node
    /// moved unchanged, otherwise the view at the same path is updated in place. Views
    /// left without a node are destroyed.
    pub fn sync(&mut self, doc: &Document) {
        let mut previous: Vec<Option<MountedView>> =
            std::mem::take(&mut self.views).into_iter().map(Some).collect();
        let mut next = Vec::new();

        for (path, descendant) in descendants(doc) {
            let node = descendant.node;
            if !is_viewed_kind(node.kind()) {
                continue;
            }
            let claim = |pred: &dyn Fn(&MountedView) -> bool| {
                previous
                    .iter()
                    .position(|slot| slot.as_ref().is_some_and(|view| pred(view)))
            };
            let slot = claim(&|view: &MountedView| {
                view.path() == path.as_slice() && view.node() == node
            })
                .or_else(|| claim(&|view: &MountedView| view.node() == node))
                .or_else(|| claim(&|view: &MountedView| view.path() == path.as_slice()));

            let reused = slot.and_then(|ix| previous[ix].take()).and_then(|mut view| {
                if view.update(node, &path) {
                    Some(view)
                } else {
                    view.destroy();
                    None
                }
            });
            let view = match reused {
                Some(view) => Some(view),
                None => self.mount(node, &path),
            };
            next.extend(view);
        }

        for mut view in previous.into_iter().flatten() {
            tracing::trace!(id = ?view.id(), "unmounting node view");
            view.destroy();
        }
        self.views = next;
    }

    /// Unmounts every view. Used when the whole document is replaced, so no view (and no
    /// upload bound to one) carries over to a node of the new document.
    pub fn reset(&mut self) {
        for mut view in self.views.drain(..) {
            tracing::trace!(id = ?view.id(), "unmounting node view");
            view.destroy();
        }
    }

    fn mount(&mut self, node: &Node, path: &[usize]) -> Option<MountedView> {
        let id = ViewId(self.next_id);
        self.next_id += 1;
        MountedView::create(id, node, path, &self.config, &self.renderer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountedView> {
        self.views.iter()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn get(&self, id: ViewId) -> Option<&MountedView> {
        self.views.iter().find(|view| view.id() == id)
    }

    pub fn at_path(&self, path: &[usize]) -> Option<&MountedView> {
        self.views.iter().find(|view| view.path() == path)
    }

    pub fn image(&self, id: ViewId) -> Option<&ImageNodeView> {
        match self.get(id)? {
            MountedView::Image(view) => Some(view),
            _ => None,
        }
    }

    pub fn image_mut(&mut self, id: ViewId) -> Option<&mut ImageNodeView> {
        self.views.iter_mut().find_map(|view| match view {
            MountedView::Image(image) if image.id() == id => Some(image),
            _ => None,
        })
    }

    pub fn image_at_mut(&mut self, path: &[usize]) -> Option<&mut ImageNodeView> {
        self.views.iter_mut().find_map(|view| match view {
            MountedView::Image(image) if image.path() == path => Some(image),
            _ => None,
        })
    }

    pub fn images_mut(&mut self) -> impl Iterator<Item = &mut ImageNodeView> {
        self.views.iter_mut().filter_map(|view| match view {
            MountedView::Image(image) => Some(image),
            _ => None,
        })
    }

    pub fn math_at(&self, path: &[usize]) -> Option<&MathNodeView> {
        match self.at_path(path)? {
            MountedView::Math(view) => Some(view),
            _ => None,
        }
    }
}

fn is_viewed_kind(kind: &str) -> bool {
    matches!(kind, "image" | "code_block") || MathKind::from_node_kind(kind).is_some()
}
