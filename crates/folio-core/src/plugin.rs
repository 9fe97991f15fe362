use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::{
    AttrPatch, Attrs, Document, Editor, ElementNode, Marks, Node, Point, Selection, TextNode,
    VoidNode, apply_op_to, clamp_to_char_boundary, node_ref,
};
use crate::ops::{Op, Path, Transaction};
use crate::position;

/// Smallest container width an image may take, in percent of its column.
pub const IMAGE_MIN_WIDTH_PERCENT: u64 = 30;
pub const IMAGE_MAX_WIDTH_PERCENT: u64 = 100;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("duplicate node spec kind: {0}")]
    DuplicateKind(String),
    #[error("duplicate command id: {0}")]
    DuplicateCommand(String),
    #[error("duplicate query id: {0}")]
    DuplicateQuery(String),
}

type CommandHandler =
    dyn Fn(&mut Editor, Option<Value>) -> Result<(), CommandError> + Send + Sync;
type QueryHandler = dyn Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync;

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub args_example: Option<Value>,
    pub handler: std::sync::Arc<CommandHandler>,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        handler: impl Fn(&mut Editor, Option<Value>) -> Result<(), CommandError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            keywords: Vec::new(),
            args_example: None,
            handler: std::sync::Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn args_example(mut self, args_example: Value) -> Self {
        self.args_example = Some(args_example);
        self
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: std::sync::Arc<QueryHandler>,
}

impl QuerySpec {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            handler: std::sync::Arc::new(handler),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Block,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildConstraint {
    None,
    BlockOnly,
    InlineOnly,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: String,
    pub role: NodeRole,
    pub is_void: bool,
    pub children: ChildConstraint,
    /// Content is verbatim source text; marks and input rules do not apply inside.
    #[serde(default)]
    pub code: bool,
    /// The node can be selected as a unit.
    #[serde(default)]
    pub selectable: bool,
}

impl NodeSpec {
    fn text_block(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            role: NodeRole::Block,
            is_void: false,
            children: ChildConstraint::InlineOnly,
            code: false,
            selectable: true,
        }
    }

    fn void(kind: &str, role: NodeRole) -> Self {
        Self {
            kind: kind.to_string(),
            role,
            is_void: true,
            children: ChildConstraint::None,
            code: false,
            selectable: true,
        }
    }
}

pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op>;
}

pub trait FolioPlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }
    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    node_specs: HashMap<String, NodeSpec>,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
}

impl PluginRegistry {
    pub fn new(
        plugins: impl IntoIterator<Item = Box<dyn FolioPlugin>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for plugin in plugins {
            registry.register_plugin(plugin)?;
        }
        Ok(registry)
    }

    /// The full schema and command set used by the editor.
    pub fn richtext() -> Self {
        let plugins: Vec<Box<dyn FolioPlugin>> = vec![
            Box::new(CoreParagraphPlugin),
            Box::new(CoreNormalizePlugin),
            Box::new(CoreCommandsPlugin),
            Box::new(MarksCommandsPlugin),
            Box::new(HeadingPlugin),
            Box::new(ListPlugin),
            Box::new(BlockquotePlugin),
            Box::new(CodeBlockPlugin),
            Box::new(ImagePlugin),
            Box::new(MathPlugin),
        ];
        let mut registry = Self::default();
        for plugin in plugins {
            let id = plugin.id();
            if let Err(err) = registry.register_plugin(plugin) {
                tracing::error!(plugin = id, %err, "skipping built-in plugin");
            }
        }
        registry
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn FolioPlugin>) -> Result<(), RegistryError> {
        for spec in plugin.node_specs() {
            if self.node_specs.contains_key(&spec.kind) {
                return Err(RegistryError::DuplicateKind(spec.kind));
            }
            self.node_specs.insert(spec.kind.clone(), spec);
        }

        self.normalize_passes.extend(plugin.normalize_passes());

        for cmd in plugin.commands() {
            if self.commands.contains_key(&cmd.id) {
                return Err(RegistryError::DuplicateCommand(cmd.id));
            }
            self.commands.insert(cmd.id.clone(), cmd);
        }

        for query in plugin.queries() {
            if self.queries.contains_key(&query.id) {
                return Err(RegistryError::DuplicateQuery(query.id));
            }
            self.queries.insert(query.id.clone(), query);
        }

        Ok(())
    }

    pub fn node_specs(&self) -> &HashMap<String, NodeSpec> {
        &self.node_specs
    }

    pub fn normalize_passes(&self) -> &[Box<dyn NormalizePass>] {
        &self.normalize_passes
    }

    pub fn commands(&self) -> &HashMap<String, CommandSpec> {
        &self.commands
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    pub fn is_known_kind(&self, kind: &str) -> bool {
        self.node_specs.contains_key(kind)
    }

    pub fn is_block(&self, kind: &str) -> bool {
        self.node_specs
            .get(kind)
            .is_some_and(|spec| spec.role == NodeRole::Block)
    }

    pub fn is_code(&self, kind: &str) -> bool {
        self.node_specs.get(kind).is_some_and(|spec| spec.code)
    }

    pub fn is_selectable(&self, kind: &str) -> bool {
        self.node_specs.get(kind).is_some_and(|spec| spec.selectable)
    }

    pub fn normalize(&self, doc: &Document) -> Vec<Op> {
        // One pass per round; the engine re-runs until nothing is left to fix.
        for pass in &self.normalize_passes {
            let ops = pass.run(doc, self);
            if !ops.is_empty() {
                tracing::trace!(pass = pass.id(), ops = ops.len(), "normalize");
                return ops;
            }
        }
        Vec::new()
    }

    pub fn normalize_selection(&self, doc: &Document, selection: &Selection) -> Selection {
        let fallback = first_text_point(doc).unwrap_or(Point {
            path: vec![0],
            offset: 0,
        });

        let anchor =
            normalize_point_to_existing_text(doc, &selection.anchor).unwrap_or_else(|| {
                normalize_point_to_existing_text(doc, &selection.focus)
                    .unwrap_or_else(|| fallback.clone())
            });
        let focus = normalize_point_to_existing_text(doc, &selection.focus)
            .unwrap_or_else(|| anchor.clone());

        Selection { anchor, focus }
    }

    fn child_constraint(&self, el: &ElementNode) -> ChildConstraint {
        match self.node_specs.get(&el.kind) {
            Some(spec) => spec.children.clone(),
            None if el.children.iter().any(|n| !matches!(n, Node::Element(_))) => {
                ChildConstraint::InlineOnly
            }
            None => ChildConstraint::Any,
        }
    }

    pub fn is_text_block(&self, el: &ElementNode) -> bool {
        self.child_constraint(el) == ChildConstraint::InlineOnly
    }
}

fn first_text_point(doc: &Document) -> Option<Point> {
    first_text_point_in(&doc.children, &mut Vec::new())
}

fn first_text_point_in(children: &[Node], path: &mut Vec<usize>) -> Option<Point> {
    for (ix, node) in children.iter().enumerate() {
        path.push(ix);
        let found = match node {
            Node::Text(_) => Some(Point::new(path.clone(), 0)),
            Node::Element(el) => first_text_point_in(&el.children, path),
            Node::Void(_) => None,
        };
        path.pop();
        if found.is_some() {
            return found;
        }
    }
    None
}

fn normalize_point_to_existing_text(doc: &Document, point: &Point) -> Option<Point> {
    if point.path.is_empty() || doc.children.is_empty() {
        return None;
    }

    let mut resolved_path: Vec<usize> = Vec::new();
    let mut children: &[Node] = &doc.children;

    for &wanted in &point.path {
        if children.is_empty() {
            break;
        }
        let ix = wanted.min(children.len() - 1);
        resolved_path.push(ix);
        match &children[ix] {
            Node::Text(t) => {
                return Some(Point {
                    path: resolved_path,
                    offset: clamp_to_char_boundary(&t.text, point.offset),
                });
            }
            Node::Element(el) => {
                children = &el.children;
            }
            Node::Void(_) => break,
        }
    }

    match node_ref(doc, &resolved_path)? {
        Node::Text(t) => Some(Point {
            path: resolved_path,
            offset: clamp_to_char_boundary(&t.text, point.offset),
        }),
        Node::Element(el) => {
            let mut path = resolved_path.clone();
            first_text_point_in(&el.children, &mut path)
        }
        Node::Void(_) => {
            // Voids have no caret; use the nearest text after them, then before them.
            let start = position::position_of(doc, &resolved_path)?;
            position::text_selection_between(doc, start + 1, start + 1)
                .map(|sel| sel.anchor)
                .or_else(|| first_text_point(doc))
        }
    }
}

fn for_each_element<'a>(
    children: &'a [Node],
    path: &mut Vec<usize>,
    f: &mut dyn FnMut(&[usize], &'a ElementNode),
) {
    for (ix, node) in children.iter().enumerate() {
        let Node::Element(el) = node else {
            continue;
        };
        path.push(ix);
        f(path, el);
        for_each_element(&el.children, path, f);
        path.pop();
    }
}

fn for_each_void<'a>(
    children: &'a [Node],
    path: &mut Vec<usize>,
    f: &mut dyn FnMut(&[usize], &'a VoidNode),
) {
    for (ix, node) in children.iter().enumerate() {
        path.push(ix);
        match node {
            Node::Void(v) => f(path, v),
            Node::Element(el) => for_each_void(&el.children, path, f),
            Node::Text(_) => {}
        }
        path.pop();
    }
}

fn child_path(parent: &[usize], ix: usize) -> Path {
    let mut path = parent.to_vec();
    path.push(ix);
    path
}

struct CoreParagraphPlugin;

impl FolioPlugin for CoreParagraphPlugin {
    fn id(&self) -> &'static str {
        "core.paragraph"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::text_block("paragraph")]
    }
}

struct CoreNormalizePlugin;

impl FolioPlugin for CoreNormalizePlugin {
    fn id(&self) -> &'static str {
        "core.normalize"
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![
            Box::new(EnsureNonEmptyDocument),
            Box::new(EnsureTextLeavesAroundInlines),
            Box::new(MergeAdjacentTextLeaves),
        ]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "core.ensure_non_empty_document"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        if doc.children.is_empty() {
            return vec![Op::InsertNode {
                path: vec![0],
                node: Node::paragraph(""),
            }];
        }
        Vec::new()
    }
}

/// Every text block has a text leaf, and inline voids always have a text leaf on each side
/// so the caret can sit before and after them.
struct EnsureTextLeavesAroundInlines;

impl NormalizePass for EnsureTextLeavesAroundInlines {
    fn id(&self) -> &'static str {
        "core.ensure_text_leaves"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
            if !registry.is_text_block(el) {
                return;
            }
            let children = &el.children;
            let is_void = |ix: usize| matches!(children.get(ix), Some(Node::Void(_)));
            let mut gaps: Vec<usize> = Vec::new();
            if children.is_empty() {
                gaps.push(0);
            }
            for gap in 0..=children.len() {
                let before_void = gap > 0 && is_void(gap - 1);
                let after_void = is_void(gap);
                let needs_leaf = match (gap == 0, gap == children.len()) {
                    (true, _) => after_void,
                    (_, true) => before_void,
                    _ => before_void && after_void,
                };
                if needs_leaf && !children.is_empty() {
                    gaps.push(gap);
                }
            }
            for gap in gaps.into_iter().rev() {
                ops.push(Op::InsertNode {
                    path: child_path(path, gap),
                    node: Node::text(""),
                });
            }
        });
        ops
    }
}

struct MergeAdjacentTextLeaves;

impl NormalizePass for MergeAdjacentTextLeaves {
    fn id(&self) -> &'static str {
        "core.merge_adjacent_text_leaves"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
            if !registry.is_text_block(el) || el.children.len() < 2 {
                return;
            }
            // Right to left: each left leaf's text is prepended to the run already merged
            // on its right, so indices below the current pair never move.
            for ix in (1..el.children.len()).rev() {
                let (Node::Text(left), Node::Text(right)) = (&el.children[ix - 1], &el.children[ix])
                else {
                    continue;
                };
                if left.marks != right.marks {
                    continue;
                }
                if !left.text.is_empty() {
                    ops.push(Op::InsertText {
                        path: child_path(path, ix),
                        offset: 0,
                        text: left.text.clone(),
                    });
                }
                ops.push(Op::RemoveNode {
                    path: child_path(path, ix - 1),
                });
            }
        });
        ops
    }
}

struct CoreCommandsPlugin;

impl FolioPlugin for CoreCommandsPlugin {
    fn id(&self) -> &'static str {
        "core.commands"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("core.insert_text", "Insert text", |editor, args| {
                let text = args
                    .as_ref()
                    .and_then(|v| v.get("text"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CommandError::new("Missing args.text"))?
                    .to_string();
                let tx = insert_text(editor, text).map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert text: {e}")))
            })
            .description("Insert text at the caret, replacing the selected text.")
            .keywords(["text", "type", "insert"])
            .args_example(serde_json::json!({ "text": "hello" })),
            CommandSpec::new("core.delete_range", "Delete range", |editor, args| {
                let from = parse_pos_arg(args.as_ref(), "from")?;
                let to = parse_pos_arg(args.as_ref(), "to")?;
                let tx = delete_range(editor, from, to).map_err(CommandError::new)?;
                if tx.is_empty() {
                    return Ok(());
                }
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to delete range: {e}")))
            })
            .description("Delete the content between two positions of one text block.")
            .keywords(["delete", "remove", "range"])
            .args_example(serde_json::json!({ "from": 1, "to": 3 })),
            CommandSpec::new("block.set_paragraph", "Set paragraph", |editor, _args| {
                let tx = set_paragraph(editor).map_err(CommandError::new)?;
                if tx.is_empty() {
                    return Ok(());
                }
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to set paragraph: {e}")))
            })
            .description("Convert the active text block into a plain paragraph.")
            .keywords(["paragraph", "text", "plain"]),
            CommandSpec::new(
                "block.insert_paragraph_at",
                "Insert paragraph",
                |editor, args| {
                    let pos = parse_pos_arg(args.as_ref(), "pos")?;
                    let tx = insert_paragraph_at(editor, pos).map_err(CommandError::new)?;
                    editor.apply(tx).map_err(|e| {
                        CommandError::new(format!("Failed to insert paragraph: {e}"))
                    })
                },
            )
            .description("Insert an empty paragraph at a block boundary and place the caret in it.")
            .keywords(["paragraph", "insert", "block"])
            .args_example(serde_json::json!({ "pos": 0 })),
            CommandSpec::new("block.move", "Move block", |editor, args| {
                let from = parse_pos_arg(args.as_ref(), "from")?;
                let to = parse_pos_arg(args.as_ref(), "to")?;
                let tx = move_block(editor, from, to).map_err(CommandError::new)?;
                if tx.is_empty() {
                    return Ok(());
                }
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to move block: {e}")))
            })
            .description("Move the block starting at `from` to the block boundary `to`.")
            .keywords(["move", "drag", "reorder"])
            .args_example(serde_json::json!({ "from": 0, "to": 8 })),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("block.active_kind", |editor, _args| {
            Ok(active_block_kind(editor)
                .map(Value::String)
                .unwrap_or(Value::Null))
        })]
    }
}

fn parse_pos_arg(args: Option<&Value>, key: &str) -> Result<usize, CommandError> {
    args.and_then(|v| v.get(key))
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| CommandError::new(format!("Missing args.{key}")))
}

fn parse_path_arg(args: Option<&Value>) -> Option<Vec<usize>> {
    let path = args?.get("path")?.as_array()?;
    let mut out = Vec::with_capacity(path.len());
    for v in path {
        out.push(v.as_u64()? as usize);
    }
    Some(out)
}

fn active_block_path(editor: &Editor) -> Option<Path> {
    if let Some(path) = editor.node_selection() {
        return Some(path.clone());
    }
    editor
        .selection()
        .focus
        .path
        .split_last()
        .map(|(_, p)| p.to_vec())
        .filter(|p| !p.is_empty())
}

fn active_block_kind(editor: &Editor) -> Option<String> {
    let path = active_block_path(editor)?;
    node_ref(editor.doc(), &path).map(|n| n.kind().to_string())
}

/// Runs `ops` against a copy of the document to learn where the current selection lands.
fn preview_selection(editor: &Editor, ops: &[Op]) -> Selection {
    let mut doc = editor.doc().clone();
    let mut selection = editor.selection().clone();
    for op in ops {
        if apply_op_to(&mut doc, &mut selection, op.clone()).is_err() {
            break;
        }
    }
    selection
}

fn insert_text(editor: &Editor, text: String) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    let mut ops: Vec<Op> = Vec::new();
    let mut caret = sel.focus.clone();

    if !sel.is_collapsed() {
        let doc = editor.doc();
        let from = position::point_to_pos(doc, &sel.anchor).ok_or("Invalid selection")?;
        let to = position::point_to_pos(doc, &sel.focus).ok_or("Invalid selection")?;
        let (delete_ops, point) = delete_range_ops(editor, from.min(to), from.max(to))?;
        ops = delete_ops;
        caret = point;
    }

    if text.is_empty() {
        return Ok(Transaction::new(ops)
            .selection_after(Selection::collapsed(caret))
            .source("command:core.insert_text"));
    }

    let mut doc = editor.doc().clone();
    let mut scratch = sel;
    for op in &ops {
        apply_op_to(&mut doc, &mut scratch, op.clone()).map_err(|e| e.to_string())?;
    }
    let Some(Node::Text(leaf)) = node_ref(&doc, &caret.path) else {
        return Err("Selection is not in a text node".into());
    };
    let offset = clamp_to_char_boundary(&leaf.text, caret.offset);
    let len = text.len();
    ops.push(Op::InsertText {
        path: caret.path.clone(),
        offset,
        text,
    });

    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(Point::new(caret.path, offset + len)))
        .source("command:core.insert_text"))
}

fn delete_range(editor: &Editor, from: usize, to: usize) -> Result<Transaction, String> {
    let (from, to) = if from <= to { (from, to) } else { (to, from) };
    if from == to {
        return Ok(Transaction::new(Vec::new()).source("command:core.delete_range"));
    }
    let (ops, caret) = delete_range_ops(editor, from, to)?;
    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(caret))
        .source("command:core.delete_range"))
}

fn delete_range_ops(editor: &Editor, from: usize, to: usize) -> Result<(Vec<Op>, Point), String> {
    let doc = editor.doc();
    let start = position::resolve(doc, from).ok_or("Range start is out of bounds")?;
    let end = position::resolve(doc, to).ok_or("Range end is out of bounds")?;
    if start.parent_path.is_empty() || start.parent_path != end.parent_path {
        return Err("Range must stay within one text block".into());
    }
    let block_path = start.parent_path;
    let Some(Node::Element(block)) = node_ref(doc, &block_path) else {
        return Err("Range is not in a text block".into());
    };
    if !editor.registry().is_text_block(block) {
        return Err("Range is not in a text block".into());
    }

    let start_global = start.parent_offset;
    let end_global = end.parent_offset;
    if start_global == end_global {
        let caret = point_for_global_offset(&block_path, &block.children, start_global);
        return Ok((Vec::new(), caret));
    }

    if let (Some(a), Some(b)) = (
        position::pos_to_point(doc, from),
        position::pos_to_point(doc, to),
    ) {
        if a.path == b.path {
            let caret = a.clone();
            return Ok((
                vec![Op::RemoveText {
                    path: a.path,
                    range: a.offset..b.offset,
                }],
                caret,
            ));
        }
    }

    let new_children = splice_inline(&block.children, start_global, end_global);
    let mut ops: Vec<Op> = (0..block.children.len())
        .rev()
        .map(|ix| Op::RemoveNode {
            path: child_path(&block_path, ix),
        })
        .collect();
    for (ix, node) in new_children.iter().cloned().enumerate() {
        ops.push(Op::InsertNode {
            path: child_path(&block_path, ix),
            node,
        });
    }
    let caret = point_for_global_offset(&block_path, &new_children, start_global);
    Ok((ops, caret))
}

/// Removes the inline content between two offsets of a text block.
fn splice_inline(children: &[Node], start: usize, end: usize) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    let mut cursor = 0usize;
    for node in children {
        let size = position::node_size(node);
        let (node_start, node_end) = (cursor, cursor + size);
        cursor = node_end;

        if node_end <= start || node_start >= end {
            out.push(node.clone());
            continue;
        }
        let Node::Text(t) = node else {
            continue;
        };
        let keep_left = clamp_to_char_boundary(&t.text, start.saturating_sub(node_start));
        let keep_right = clamp_to_char_boundary(&t.text, end.saturating_sub(node_start));
        let text = format!(
            "{}{}",
            t.text.get(..keep_left).unwrap_or(""),
            t.text.get(keep_right..).unwrap_or("")
        );
        out.push(Node::Text(TextNode {
            text,
            marks: t.marks.clone(),
        }));
    }
    if out.is_empty() {
        out.push(Node::text(""));
    }
    out
}

fn point_global_offset(children: &[Node], child_ix: usize, offset: usize) -> usize {
    let mut global = 0usize;
    for (ix, node) in children.iter().enumerate() {
        if ix < child_ix {
            global += position::node_size(node);
            continue;
        }
        if ix == child_ix {
            if let Node::Text(t) = node {
                global += clamp_to_char_boundary(&t.text, offset);
            }
        }
        break;
    }
    global
}

fn point_for_global_offset(block_path: &[usize], children: &[Node], global_offset: usize) -> Point {
    let mut remaining = global_offset;
    for (child_ix, node) in children.iter().enumerate() {
        match node {
            Node::Text(t) => {
                if remaining <= t.text.len() {
                    return Point::new(
                        child_path(block_path, child_ix),
                        clamp_to_char_boundary(&t.text, remaining),
                    );
                }
                remaining -= t.text.len();
            }
            Node::Void(_) => {
                if remaining == 0 {
                    for (ix, next) in children.iter().enumerate().skip(child_ix + 1) {
                        if matches!(next, Node::Text(_)) {
                            return Point::new(child_path(block_path, ix), 0);
                        }
                    }
                }
                remaining = remaining.saturating_sub(1);
            }
            Node::Element(_) => {}
        }
    }

    // Fallback to end of last text node.
    for (child_ix, node) in children.iter().enumerate().rev() {
        if let Node::Text(t) = node {
            return Point::new(child_path(block_path, child_ix), t.text.len());
        }
    }
    Point::new(child_path(block_path, 0), 0)
}

fn retype_block(el: ElementNode, kind: &str, attrs: Attrs) -> Node {
    Node::Element(ElementNode {
        kind: kind.to_string(),
        attrs,
        children: el.children,
    })
}

fn strip_block_attrs(attrs: &mut Attrs) {
    for key in ["level", "list_type", "checked", "language"] {
        attrs.remove(key);
    }
}

/// Replaces the block at `path` in one remove/insert pair, keeping the selection.
fn replace_block(editor: &Editor, path: &[usize], next: Node, source: &str) -> Transaction {
    Transaction::new(vec![
        Op::RemoveNode {
            path: path.to_vec(),
        },
        Op::InsertNode {
            path: path.to_vec(),
            node: next,
        },
    ])
    .selection_after(editor.selection().clone())
    .source(source)
}

fn active_text_block(editor: &Editor) -> Result<(Path, ElementNode), String> {
    let focus = &editor.selection().focus;
    let block_path = focus
        .path
        .split_last()
        .map(|(_, p)| p.to_vec())
        .filter(|p| !p.is_empty())
        .ok_or("No active block")?;
    let Some(Node::Element(el)) = node_ref(editor.doc(), &block_path).cloned() else {
        return Err("Active block is not a text block".into());
    };
    if !editor.registry().is_text_block(&el) {
        return Err("Active block is not a text block".into());
    }
    Ok((block_path, el))
}

fn set_paragraph(editor: &Editor) -> Result<Transaction, String> {
    let (block_path, el) = active_text_block(editor)?;
    if el.kind == "paragraph" {
        return Ok(Transaction::new(Vec::new()).source("command:block.set_paragraph"));
    }
    let mut attrs = el.attrs.clone();
    strip_block_attrs(&mut attrs);
    let next = retype_block(el, "paragraph", attrs);
    Ok(replace_block(
        editor,
        &block_path,
        next,
        "command:block.set_paragraph",
    ))
}

fn insert_paragraph_at(editor: &Editor, pos: usize) -> Result<Transaction, String> {
    let doc = editor.doc();
    let resolved = position::resolve(doc, pos).ok_or("Position is out of bounds")?;
    if resolved.text_offset.is_some() {
        return Err("Position is inside text".into());
    }
    if !resolved.parent_path.is_empty() {
        let Some(Node::Element(parent)) = node_ref(doc, &resolved.parent_path) else {
            return Err("Position is not between blocks".into());
        };
        if editor.registry().is_text_block(parent) {
            return Err("Position is not between blocks".into());
        }
    }

    let path = child_path(&resolved.parent_path, resolved.index);
    let caret = child_path(&path, 0);
    Ok(Transaction::new(vec![Op::InsertNode {
        path,
        node: Node::paragraph(""),
    }])
    .selection_after(Selection::collapsed(Point::new(caret, 0)))
    .source("command:block.insert_paragraph_at"))
}

fn block_boundary(editor: &Editor, pos: usize) -> Result<(Path, usize), String> {
    let doc = editor.doc();
    let resolved = position::resolve(doc, pos).ok_or("Position is out of bounds")?;
    if resolved.text_offset.is_some() {
        return Err("Position is inside text".into());
    }
    if !resolved.parent_path.is_empty() {
        match node_ref(doc, &resolved.parent_path) {
            Some(Node::Element(parent)) if !editor.registry().is_text_block(parent) => {}
            _ => return Err("Position is not between blocks".into()),
        }
    }
    Ok((resolved.parent_path, resolved.index))
}

fn move_block(editor: &Editor, from: usize, to: usize) -> Result<Transaction, String> {
    let (source_parent, source_ix) = block_boundary(editor, from)?;
    let source_path = child_path(&source_parent, source_ix);
    let Some(node) = node_ref(editor.doc(), &source_path).cloned() else {
        return Err("No block starts at the source position".into());
    };
    let (target_parent, target_ix) = block_boundary(editor, to)?;

    if target_parent.starts_with(&source_path) {
        return Err("Cannot move a block into itself".into());
    }
    if target_parent == source_parent && (target_ix == source_ix || target_ix == source_ix + 1) {
        return Ok(Transaction::new(Vec::new()).source("command:block.move"));
    }

    // Indices after the source shift down by one once it is removed.
    let mut target_path = child_path(&target_parent, target_ix);
    let depth = source_parent.len();
    if target_path.len() > depth
        && target_path.starts_with(&source_parent)
        && target_path[depth] > source_ix
    {
        target_path[depth] -= 1;
    }

    let ops = vec![
        Op::RemoveNode {
            path: source_path.clone(),
        },
        Op::InsertNode {
            path: target_path.clone(),
            node,
        },
    ];

    let remap = |point: &Point, fallback: Point| -> Point {
        if point.path.starts_with(&source_path) {
            let mut path = target_path.clone();
            path.extend_from_slice(&point.path[source_path.len()..]);
            return Point::new(path, point.offset);
        }
        fallback
    };
    let previewed = preview_selection(editor, &ops);
    let sel = editor.selection();
    let selection_after = Selection {
        anchor: remap(&sel.anchor, previewed.anchor),
        focus: remap(&sel.focus, previewed.focus),
    };

    Ok(Transaction::new(ops)
        .selection_after(selection_after)
        .source("command:block.move"))
}

struct MarksCommandsPlugin;

#[derive(Clone, Copy)]
struct BoolMark {
    id: &'static str,
    label: &'static str,
    keywords: &'static [&'static str],
    get: fn(&Marks) -> bool,
    set: fn(&mut Marks, bool),
}

const BOOL_MARKS: &[BoolMark] = &[
    BoolMark {
        id: "marks.toggle_bold",
        label: "Toggle bold",
        keywords: &["bold", "strong", "mark"],
        get: |m| m.bold,
        set: |m, v| m.bold = v,
    },
    BoolMark {
        id: "marks.toggle_italic",
        label: "Toggle italic",
        keywords: &["italic", "emphasis", "mark"],
        get: |m| m.italic,
        set: |m, v| m.italic = v,
    },
    BoolMark {
        id: "marks.toggle_code",
        label: "Toggle code",
        keywords: &["code", "monospace", "mark"],
        get: |m| m.code,
        set: |m, v| m.code = v,
    },
];

impl FolioPlugin for MarksCommandsPlugin {
    fn id(&self) -> &'static str {
        "marks.commands"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let mut commands: Vec<CommandSpec> = BOOL_MARKS
            .iter()
            .map(|mark| {
                let mark = *mark;
                CommandSpec::new(mark.id, mark.label, move |editor, _args| {
                    let tx = toggle_bool_mark(editor, mark).map_err(CommandError::new)?;
                    editor.apply(tx).map_err(|e| {
                        CommandError::new(format!("Failed to {}: {e}", mark.label.to_lowercase()))
                    })
                })
                .description(format!("{} on the current selection or caret.", mark.label))
                .keywords(mark.keywords.iter().copied())
            })
            .collect();

        commands.push(
            CommandSpec::new("marks.set_highlight", "Set highlight", |editor, args| {
                let color = args
                    .as_ref()
                    .and_then(|v| v.get("color"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let tx = apply_marks(
                    editor,
                    &move |mut marks: Marks| {
                        marks.highlight = true;
                        marks.highlight_color = color.clone();
                        marks
                    },
                    "command:marks.set_highlight",
                )
                .map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to set highlight: {e}")))
            })
            .description("Highlight the current selection, optionally with a color.")
            .keywords(["highlight", "mark", "background"])
            .args_example(serde_json::json!({ "color": "#fff59d" })),
        );
        commands.push(
            CommandSpec::new("marks.unset_highlight", "Unset highlight", |editor, _args| {
                let tx = apply_marks(
                    editor,
                    &|mut marks: Marks| {
                        marks.highlight = false;
                        marks.highlight_color = None;
                        marks
                    },
                    "command:marks.unset_highlight",
                )
                .map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to unset highlight: {e}")))
            })
            .description("Remove the highlight from the current selection.")
            .keywords(["highlight", "mark", "reset"]),
        );
        commands
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("marks.get_active", |editor, _args| {
            serde_json::to_value(active_marks(editor))
                .map_err(|err| QueryError::new(format!("Failed to encode marks: {err}")))
        })]
    }
}

fn active_marks(editor: &Editor) -> Marks {
    let focus = &editor.selection().focus;
    match node_ref(editor.doc(), &focus.path) {
        Some(Node::Text(text)) => text.marks.clone(),
        _ => Marks::default(),
    }
}

fn ordered_selection_points(sel: &Selection) -> (Point, Point) {
    let mut start = sel.anchor.clone();
    let mut end = sel.focus.clone();

    if start.path == end.path {
        if end.offset < start.offset {
            std::mem::swap(&mut start, &mut end);
        }
        return (start, end);
    }
    if end.path < start.path {
        std::mem::swap(&mut start, &mut end);
    }
    (start, end)
}

struct TextBlock<'a> {
    path: Path,
    el: &'a ElementNode,
}

fn text_blocks_in_order<'a>(doc: &'a Document, registry: &PluginRegistry) -> Vec<TextBlock<'a>> {
    let mut out = Vec::new();
    for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
        if registry.is_text_block(el) && !registry.is_code(&el.kind) {
            out.push(TextBlock {
                path: path.to_vec(),
                el,
            });
        }
    });
    out
}

/// Global offset ranges of the selection within each text block it touches.
fn selected_block_ranges<'a>(
    editor: &'a Editor,
    sel: &Selection,
) -> Result<Vec<(TextBlock<'a>, usize, usize)>, String> {
    let (start, end) = ordered_selection_points(sel);
    let start_block = start
        .path
        .split_last()
        .map(|(_, p)| p.to_vec())
        .ok_or("Selection start is not in a text block")?;
    let end_block = end
        .path
        .split_last()
        .map(|(_, p)| p.to_vec())
        .ok_or("Selection end is not in a text block")?;

    let blocks = text_blocks_in_order(editor.doc(), editor.registry());
    let start_index = blocks
        .iter()
        .position(|b| b.path == start_block)
        .ok_or("Selection start is not in a text block")?;
    let end_index = blocks
        .iter()
        .position(|b| b.path == end_block)
        .ok_or("Selection end is not in a text block")?;
    let (start_index, end_index) = (start_index.min(end_index), start_index.max(end_index));

    let start_inline_ix = start.path.last().copied().unwrap_or(0);
    let end_inline_ix = end.path.last().copied().unwrap_or(0);

    let mut out = Vec::new();
    for (index, block) in blocks.into_iter().enumerate() {
        if index < start_index || index > end_index {
            continue;
        }
        let children = block.el.children.as_slice();
        let total: usize = children.iter().map(position::node_size).sum();
        let from = if index == start_index {
            point_global_offset(children, start_inline_ix, start.offset)
        } else {
            0
        };
        let to = if index == end_index {
            point_global_offset(children, end_inline_ix, end.offset)
        } else {
            total
        };
        if from < to {
            out.push((block, from, to));
        }
    }
    Ok(out)
}

fn toggle_bool_mark(editor: &Editor, mark: BoolMark) -> Result<Transaction, String> {
    let source = format!("command:{}", mark.id);
    let sel = editor.selection().clone();
    let target = if sel.is_collapsed() {
        !(mark.get)(&active_marks(editor))
    } else {
        let mut all_set = true;
        for (block, from, to) in selected_block_ranges(editor, &sel)? {
            let mut cursor = 0usize;
            for node in &block.el.children {
                let size = position::node_size(node);
                let overlaps = cursor < to && cursor + size > from;
                cursor += size;
                if let (true, Node::Text(t)) = (overlaps, node) {
                    all_set &= (mark.get)(&t.marks);
                }
            }
        }
        !all_set
    };
    apply_marks(
        editor,
        &move |mut marks: Marks| {
            (mark.set)(&mut marks, target);
            marks
        },
        &source,
    )
}

fn apply_marks(
    editor: &Editor,
    apply: &dyn Fn(Marks) -> Marks,
    source: &str,
) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    let (ops, selection_after) = if sel.is_collapsed() {
        toggle_mark_at_caret(editor, apply)?
    } else {
        apply_mark_range(editor, &sel, apply)?
    };
    Ok(Transaction::new(ops)
        .selection_after(selection_after)
        .source(source))
}

fn toggle_mark_at_caret(
    editor: &Editor,
    apply: &dyn Fn(Marks) -> Marks,
) -> Result<(Vec<Op>, Selection), String> {
    let focus = editor.selection().focus.clone();
    let (child_ix, block_path) = focus
        .path
        .split_last()
        .ok_or("Selection is not in a text node")?;

    let Some(Node::Element(el)) = node_ref(editor.doc(), block_path) else {
        return Err("Selection is not in a text block".into());
    };
    if editor.registry().is_code(&el.kind) {
        return Err("Marks are not allowed in code".into());
    }
    let Some(Node::Text(text)) = el.children.get(*child_ix) else {
        return Err("Selection is not in a text node".into());
    };

    let cursor = clamp_to_char_boundary(&text.text, focus.offset);
    let marks_before = text.marks.clone();
    let marks_after = apply(marks_before.clone());
    if marks_after == marks_before {
        return Ok((Vec::new(), editor.selection().clone()));
    }

    if text.text.is_empty() {
        return Ok((
            vec![Op::SetTextMarks {
                path: focus.path.clone(),
                marks: marks_after,
            }],
            Selection::collapsed(Point::new(focus.path.clone(), 0)),
        ));
    }

    let mut replacement: Vec<Node> = Vec::new();
    let mut caret_child_ix = *child_ix;

    let left = text.text.get(..cursor).unwrap_or("").to_string();
    let right = text.text.get(cursor..).unwrap_or("").to_string();

    if !left.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: left,
            marks: marks_before.clone(),
        }));
        caret_child_ix += 1;
    }
    replacement.push(Node::Text(TextNode {
        text: String::new(),
        marks: marks_after,
    }));
    if !right.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: right,
            marks: marks_before,
        }));
    }

    let mut ops: Vec<Op> = vec![Op::RemoveNode {
        path: focus.path.clone(),
    }];
    for (i, node) in replacement.into_iter().enumerate() {
        ops.push(Op::InsertNode {
            path: child_path(block_path, child_ix + i),
            node,
        });
    }

    Ok((
        ops,
        Selection::collapsed(Point::new(child_path(block_path, caret_child_ix), 0)),
    ))
}

fn apply_marks_in_block(
    children: &[Node],
    start_global: usize,
    end_global: usize,
    apply: &dyn Fn(Marks) -> Marks,
) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    let mut cursor = 0usize;

    for node in children {
        let node_start = cursor;
        cursor += position::node_size(node);
        let Node::Text(t) = node else {
            out.push(node.clone());
            continue;
        };
        let node_end = cursor;

        if end_global <= node_start || start_global >= node_end {
            out.push(node.clone());
            continue;
        }

        let sel_start = clamp_to_char_boundary(&t.text, start_global.saturating_sub(node_start));
        let sel_end = clamp_to_char_boundary(&t.text, end_global.saturating_sub(node_start));

        let prefix = t.text.get(..sel_start).unwrap_or("");
        let middle = t.text.get(sel_start..sel_end).unwrap_or("");
        let suffix = t.text.get(sel_end..).unwrap_or("");

        for (text, marks) in [
            (prefix, t.marks.clone()),
            (middle, apply(t.marks.clone())),
            (suffix, t.marks.clone()),
        ] {
            if !text.is_empty() {
                out.push(Node::Text(TextNode {
                    text: text.to_string(),
                    marks,
                }));
            }
        }
    }

    if out.is_empty() {
        out.push(Node::text(""));
    }
    out
}

fn apply_mark_range(
    editor: &Editor,
    sel: &Selection,
    apply: &dyn Fn(Marks) -> Marks,
) -> Result<(Vec<Op>, Selection), String> {
    let mut ops: Vec<Op> = Vec::new();
    let mut new_anchor = sel.anchor.clone();
    let mut new_focus = sel.focus.clone();

    for (block, from, to) in selected_block_ranges(editor, sel)? {
        let children = block.el.children.as_slice();
        let new_children = apply_marks_in_block(children, from, to, apply);

        for child_ix in (0..children.len()).rev() {
            ops.push(Op::RemoveNode {
                path: child_path(&block.path, child_ix),
            });
        }
        for (child_ix, node) in new_children.iter().cloned().enumerate() {
            ops.push(Op::InsertNode {
                path: child_path(&block.path, child_ix),
                node,
            });
        }

        for point in [&mut new_anchor, &mut new_focus] {
            let in_block = point.path.len() == block.path.len() + 1
                && point.path.starts_with(&block.path);
            if in_block {
                let global = point_global_offset(
                    children,
                    point.path.last().copied().unwrap_or(0),
                    point.offset,
                );
                *point = point_for_global_offset(&block.path, &new_children, global);
            }
        }
    }

    Ok((
        ops,
        Selection {
            anchor: new_anchor,
            focus: new_focus,
        },
    ))
}

struct HeadingPlugin;

impl FolioPlugin for HeadingPlugin {
    fn id(&self) -> &'static str {
        "heading"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::text_block("heading")]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeHeadingLevels)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("block.set_heading", "Set heading", |editor, args| {
                let level = args
                    .as_ref()
                    .and_then(|v| v.get("level"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1)
                    .clamp(1, 3);
                let tx = set_heading(editor, level).map_err(CommandError::new)?;
                if tx.is_empty() {
                    return Ok(());
                }
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to set heading: {e}")))
            })
            .description("Convert the active text block into a heading.")
            .keywords(["heading", "title", "h1", "h2", "h3"])
            .args_example(serde_json::json!({ "level": 2 })),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("block.heading_level", |editor, _args| {
            Ok(active_heading_level(editor))
        })]
    }
}

fn heading_level(el: &ElementNode) -> u64 {
    el.attrs
        .get("level")
        .and_then(|v| v.as_u64())
        .unwrap_or(1)
        .clamp(1, 3)
}

fn active_heading_level(editor: &Editor) -> Value {
    match active_text_block(editor) {
        Ok((_, el)) if el.kind == "heading" => Value::from(heading_level(&el)),
        _ => Value::Null,
    }
}

fn set_heading(editor: &Editor, level: u64) -> Result<Transaction, String> {
    let (block_path, el) = active_text_block(editor)?;
    if el.kind == "heading" && heading_level(&el) == level {
        return Ok(Transaction::new(Vec::new()).source("command:block.set_heading"));
    }
    let mut attrs = el.attrs.clone();
    strip_block_attrs(&mut attrs);
    attrs.insert("level".to_string(), Value::from(level));
    let next = retype_block(el, "heading", attrs);
    Ok(replace_block(
        editor,
        &block_path,
        next,
        "command:block.set_heading",
    ))
}

struct NormalizeHeadingLevels;

impl NormalizePass for NormalizeHeadingLevels {
    fn id(&self) -> &'static str {
        "heading.normalize_levels"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
            if el.kind != "heading" {
                return;
            }
            let level = heading_level(el);
            if el.attrs.get("level").and_then(|v| v.as_u64()) != Some(level) {
                ops.push(Op::SetNodeAttrs {
                    path: path.to_vec(),
                    patch: AttrPatch::default().set("level", level),
                });
            }
        });
        ops
    }
}

struct ListPlugin;

const LIST_TYPES: [&str; 3] = ["bulleted", "ordered", "task"];

impl FolioPlugin for ListPlugin {
    fn id(&self) -> &'static str {
        "list"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::text_block("list_item")]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeListItemAttrs)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let mut commands: Vec<CommandSpec> = LIST_TYPES
            .iter()
            .map(|list_type| {
                let list_type = *list_type;
                CommandSpec::new(
                    format!("list.toggle_{list_type}"),
                    format!("Toggle {list_type} list"),
                    move |editor, _args| {
                        let tx = toggle_list(editor, list_type).map_err(CommandError::new)?;
                        editor
                            .apply(tx)
                            .map_err(|e| CommandError::new(format!("Failed to toggle list: {e}")))
                    },
                )
                .description(format!("Toggle a {list_type} list item for the active block."))
                .keywords(["list", list_type])
            })
            .collect();

        commands.push(
            CommandSpec::new("task.toggle_checked", "Toggle task checked", |editor, args| {
                let tx = toggle_task_checked(editor, args.as_ref()).map_err(CommandError::new)?;
                if tx.is_empty() {
                    return Ok(());
                }
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to toggle task: {e}")))
            })
            .description("Toggle the checked state of a task item.")
            .keywords(["task", "todo", "checkbox", "checked"])
            .args_example(serde_json::json!({ "path": [0] })),
        );
        commands
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("list.active_type", |editor, _args| {
            Ok(active_list_type(editor)
                .map(Value::String)
                .unwrap_or(Value::Null))
        })]
    }
}

fn active_list_type(editor: &Editor) -> Option<String> {
    let (_, el) = active_text_block(editor).ok()?;
    if el.kind != "list_item" {
        return None;
    }
    el.attrs
        .get("list_type")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn toggle_list(editor: &Editor, list_type: &str) -> Result<Transaction, String> {
    let (block_path, el) = active_text_block(editor)?;
    if editor.registry().is_code(&el.kind) {
        return Err("Cannot turn code into a list".into());
    }
    let source = format!("command:list.toggle_{list_type}");

    let current = (el.kind == "list_item")
        .then(|| el.attrs.get("list_type").and_then(|v| v.as_str()))
        .flatten();
    let mut attrs = el.attrs.clone();
    strip_block_attrs(&mut attrs);

    let next = if current == Some(list_type) {
        retype_block(el, "paragraph", attrs)
    } else {
        attrs.insert("list_type".to_string(), Value::String(list_type.to_string()));
        if list_type == "task" {
            attrs.insert("checked".to_string(), Value::Bool(false));
        }
        retype_block(el, "list_item", attrs)
    };
    Ok(replace_block(editor, &block_path, next, &source))
}

fn toggle_task_checked(editor: &Editor, args: Option<&Value>) -> Result<Transaction, String> {
    let block_path = parse_path_arg(args)
        .or_else(|| active_text_block(editor).ok().map(|(path, _)| path))
        .ok_or("No active block")?;

    let Some(Node::Element(el)) = node_ref(editor.doc(), &block_path) else {
        return Ok(Transaction::new(Vec::new()).source("command:task.toggle_checked"));
    };
    if el.kind != "list_item" || el.attrs.get("list_type").and_then(|v| v.as_str()) != Some("task")
    {
        return Ok(Transaction::new(Vec::new()).source("command:task.toggle_checked"));
    }

    let checked = el
        .attrs
        .get("checked")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Ok(Transaction::new(vec![Op::SetNodeAttrs {
        path: block_path,
        patch: AttrPatch::default().set("checked", !checked),
    }])
    .selection_after(editor.selection().clone())
    .source("command:task.toggle_checked"))
}

struct NormalizeListItemAttrs;

impl NormalizePass for NormalizeListItemAttrs {
    fn id(&self) -> &'static str {
        "list.normalize_attrs"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
            if el.kind != "list_item" {
                return;
            }
            let list_type = el.attrs.get("list_type").and_then(|v| v.as_str());
            let mut patch = AttrPatch::default();
            if !list_type.is_some_and(|t| LIST_TYPES.contains(&t)) {
                patch = patch.set("list_type", "bulleted");
            }
            let is_task = list_type == Some("task");
            match el.attrs.get("checked") {
                Some(Value::Bool(_)) if is_task => {}
                Some(_) if !is_task => patch = patch.remove("checked"),
                _ if is_task => patch = patch.set("checked", false),
                _ => {}
            }
            if !patch.is_empty() {
                ops.push(Op::SetNodeAttrs {
                    path: path.to_vec(),
                    patch,
                });
            }
        });
        ops
    }
}

struct BlockquotePlugin;

impl FolioPlugin for BlockquotePlugin {
    fn id(&self) -> &'static str {
        "blockquote"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "blockquote".to_string(),
            role: NodeRole::Block,
            is_void: false,
            children: ChildConstraint::BlockOnly,
            code: false,
            selectable: true,
        }]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeBlockquoteChildren)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(
                "blockquote.wrap_selection",
                "Wrap selection in blockquote",
                |editor, _args| {
                    let tx = wrap_selection_in_blockquote(editor).map_err(CommandError::new)?;
                    editor.apply(tx).map_err(|e| {
                        CommandError::new(format!("Failed to wrap blockquote: {e}"))
                    })
                },
            )
            .description("Wrap selected blocks in a blockquote container.")
            .keywords(["blockquote", "quote", "wrap"]),
            CommandSpec::new("blockquote.unwrap", "Unwrap blockquote", |editor, _args| {
                let tx = unwrap_nearest_blockquote(editor).map_err(CommandError::new)?;
                if tx.is_empty() {
                    return Ok(());
                }
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to unwrap blockquote: {e}")))
            })
            .description("Unwrap the nearest blockquote container.")
            .keywords(["blockquote", "quote", "unwrap"]),
        ]
    }
}

fn nearest_blockquote_path(doc: &Document, point_path: &[usize]) -> Option<Path> {
    let mut path: Path = point_path.to_vec();
    while !path.is_empty() {
        if let Some(Node::Element(el)) = node_ref(doc, &path) {
            if el.kind == "blockquote" {
                return Some(path);
            }
        }
        path.pop();
    }
    None
}

fn children_at_path<'a>(doc: &'a Document, parent_path: &[usize]) -> Option<&'a [Node]> {
    if parent_path.is_empty() {
        return Some(&doc.children);
    }
    match node_ref(doc, parent_path)? {
        Node::Element(el) => Some(&el.children),
        Node::Void(_) | Node::Text(_) => None,
    }
}

fn wrap_selection_in_blockquote(editor: &Editor) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    let (start, end) = ordered_selection_points(&sel);
    let start_block_path = start
        .path
        .split_last()
        .map(|(_, p)| p.to_vec())
        .ok_or("Selection start is not in a text block")?;
    let end_block_path = end
        .path
        .split_last()
        .map(|(_, p)| p.to_vec())
        .ok_or("Selection end is not in a text block")?;

    let (start_ix, start_parent) = start_block_path
        .split_last()
        .ok_or("Selection start is not a block node")?;
    let (end_ix, end_parent) = end_block_path
        .split_last()
        .ok_or("Selection end is not a block node")?;

    if start_parent != end_parent {
        return Err("Selection must be within a single block container".into());
    }
    let (start_ix, end_ix) = ((*start_ix).min(*end_ix), (*start_ix).max(*end_ix));

    let parent_children =
        children_at_path(editor.doc(), start_parent).ok_or("Selection parent is not a container")?;
    if end_ix >= parent_children.len() {
        return Err("Selection block range is out of bounds".into());
    }

    let quote = Node::element(
        "blockquote",
        Attrs::default(),
        parent_children[start_ix..=end_ix].to_vec(),
    );

    let mut ops: Vec<Op> = (start_ix..=end_ix)
        .rev()
        .map(|ix| Op::RemoveNode {
            path: child_path(start_parent, ix),
        })
        .collect();
    ops.push(Op::InsertNode {
        path: child_path(start_parent, start_ix),
        node: quote,
    });

    let remap_point = |point: &Point| -> Point {
        if !point.path.starts_with(start_parent) || point.path.len() < start_parent.len() + 2 {
            return point.clone();
        }
        let block_ix = point.path[start_parent.len()];
        if block_ix < start_ix || block_ix > end_ix {
            return point.clone();
        }
        let mut new_path = child_path(start_parent, start_ix);
        new_path.push(block_ix - start_ix);
        new_path.extend_from_slice(&point.path[start_parent.len() + 1..]);
        Point::new(new_path, point.offset)
    };

    Ok(Transaction::new(ops)
        .selection_after(Selection {
            anchor: remap_point(&sel.anchor),
            focus: remap_point(&sel.focus),
        })
        .source("command:blockquote.wrap_selection"))
}

fn unwrap_nearest_blockquote(editor: &Editor) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    let Some(quote_path) = nearest_blockquote_path(editor.doc(), &sel.focus.path) else {
        return Ok(Transaction::new(Vec::new()).source("command:blockquote.unwrap"));
    };
    let (quote_ix, parent_path) = quote_path
        .split_last()
        .map(|(ix, parent)| (*ix, parent.to_vec()))
        .ok_or("Invalid blockquote path")?;
    let Some(Node::Element(quote_el)) = node_ref(editor.doc(), &quote_path).cloned() else {
        return Err("Blockquote node not found".into());
    };

    let mut ops: Vec<Op> = vec![Op::RemoveNode {
        path: quote_path.clone(),
    }];
    for (i, node) in quote_el.children.into_iter().enumerate() {
        ops.push(Op::InsertNode {
            path: child_path(&parent_path, quote_ix + i),
            node,
        });
    }

    let remap_point = |point: &Point| -> Point {
        if point.path.len() < quote_path.len() + 1 || !point.path.starts_with(&quote_path) {
            return point.clone();
        }
        let inner_ix = point.path[quote_path.len()];
        let mut new_path = child_path(&parent_path, quote_ix + inner_ix);
        new_path.extend_from_slice(&point.path[quote_path.len() + 1..]);
        Point::new(new_path, point.offset)
    };

    Ok(Transaction::new(ops)
        .selection_after(Selection {
            anchor: remap_point(&sel.anchor),
            focus: remap_point(&sel.focus),
        })
        .source("command:blockquote.unwrap"))
}

struct NormalizeBlockquoteChildren;

impl NormalizePass for NormalizeBlockquoteChildren {
    fn id(&self) -> &'static str {
        "blockquote.ensure_non_empty"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
            if el.kind == "blockquote" && el.children.is_empty() {
                ops.push(Op::InsertNode {
                    path: child_path(path, 0),
                    node: Node::paragraph(""),
                });
            }
        });
        ops
    }
}

struct CodeBlockPlugin;

impl FolioPlugin for CodeBlockPlugin {
    fn id(&self) -> &'static str {
        "code_block"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            code: true,
            ..NodeSpec::text_block("code_block")
        }]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeCodeBlockContent)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("code_block.toggle", "Toggle code block", |editor, args| {
                let language = args
                    .as_ref()
                    .and_then(|v| v.get("language"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let tx = toggle_code_block(editor, language).map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to toggle code block: {e}")))
            })
            .description("Toggle a code block for the active text block.")
            .keywords(["code block", "code", "pre", "monospace"])
            .args_example(serde_json::json!({ "language": "rust" })),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("code_block.is_active", |editor, _args| {
            Ok(Value::Bool(
                active_text_block(editor).is_ok_and(|(_, el)| el.kind == "code_block"),
            ))
        })]
    }
}

/// Inline content as source text: math keeps its dollar form so nothing is lost.
fn inline_source_text(children: &[Node]) -> String {
    children
        .iter()
        .map(|node| match node {
            Node::Text(t) => t.text.clone(),
            Node::Void(v) if v.kind == "inline_math" => format!(
                "${}$",
                v.attrs.get("latex").and_then(|l| l.as_str()).unwrap_or("")
            ),
            _ => String::new(),
        })
        .collect()
}

fn toggle_code_block(editor: &Editor, language: Option<String>) -> Result<Transaction, String> {
    let (block_path, el) = active_text_block(editor)?;
    let focus = editor.selection().focus.clone();
    let global = point_global_offset(
        &el.children,
        focus.path.last().copied().unwrap_or(0),
        focus.offset,
    );

    let next = if el.kind == "code_block" {
        let mut attrs = el.attrs.clone();
        attrs.remove("language");
        retype_block(el, "paragraph", attrs)
    } else {
        let mut attrs = el.attrs.clone();
        strip_block_attrs(&mut attrs);
        if let Some(language) = language {
            attrs.insert("language".to_string(), Value::String(language));
        }
        let text = inline_source_text(&el.children);
        Node::element("code_block", attrs, vec![Node::text(text)])
    };

    let Node::Element(next_el) = &next else {
        return Err("Active block is not a text block".into());
    };
    let caret = point_for_global_offset(&block_path, &next_el.children, global);

    Ok(Transaction::new(vec![
        Op::RemoveNode {
            path: block_path.clone(),
        },
        Op::InsertNode {
            path: block_path,
            node: next,
        },
    ])
    .selection_after(Selection::collapsed(caret))
    .source("command:code_block.toggle"))
}

/// Code blocks hold plain text only.
struct NormalizeCodeBlockContent;

impl NormalizePass for NormalizeCodeBlockContent {
    fn id(&self) -> &'static str {
        "code_block.plain_text"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_element(&doc.children, &mut Vec::new(), &mut |path, el| {
            if !registry.is_code(&el.kind) {
                return;
            }
            for (ix, node) in el.children.iter().enumerate() {
                if let Node::Text(t) = node {
                    if t.marks != Marks::default() {
                        ops.push(Op::SetTextMarks {
                            path: child_path(path, ix),
                            marks: Marks::default(),
                        });
                    }
                }
            }
        });
        ops
    }
}

struct ImagePlugin;

impl FolioPlugin for ImagePlugin {
    fn id(&self) -> &'static str {
        "image"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::void("image", NodeRole::Block)]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeImageAttrs)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("image.insert", "Insert image", |editor, args| {
                let src = args
                    .as_ref()
                    .and_then(|v| v.get("src"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| CommandError::new("Missing args.src"))?
                    .to_string();
                let alt = args
                    .as_ref()
                    .and_then(|v| v.get("alt"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);

                let tx = insert_block_void(editor, Node::image(src, alt), "command:image.insert")
                    .map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert image: {e}")))
            })
            .description("Insert a block image node (void).")
            .keywords(["image", "img", "media", "picture"])
            .args_example(
                serde_json::json!({ "src": "https://example.com/image.png", "alt": "Alt text" }),
            ),
        ]
    }
}

/// Inserts a block void at the caret's block: an empty paragraph is replaced, any other
/// block is kept and the void goes after it. A paragraph always follows the void and
/// receives the caret.
fn insert_block_void(editor: &Editor, node: Node, source: &str) -> Result<Transaction, String> {
    let (block_path, el) = match active_text_block(editor) {
        Ok(found) => found,
        Err(_) => {
            let ix = editor.doc().children.len();
            let paragraph_path = vec![ix + 1];
            return Ok(Transaction::new(vec![
                Op::InsertNode {
                    path: vec![ix],
                    node,
                },
                Op::InsertNode {
                    path: paragraph_path.clone(),
                    node: Node::paragraph(""),
                },
            ])
            .selection_after(Selection::collapsed(Point::new(
                child_path(&paragraph_path, 0),
                0,
            )))
            .source(source));
        }
    };
    let (block_ix, parent_path) = block_path
        .split_last()
        .map(|(ix, parent)| (*ix, parent.to_vec()))
        .ok_or("No active block")?;

    let replace = el.kind == "paragraph"
        && el.children.iter().all(|n| matches!(n, Node::Text(t) if t.text.is_empty()));

    let mut ops: Vec<Op> = Vec::new();
    let insert_at = if replace {
        ops.push(Op::RemoveNode {
            path: block_path.clone(),
        });
        block_ix
    } else {
        block_ix + 1
    };
    ops.push(Op::InsertNode {
        path: child_path(&parent_path, insert_at),
        node,
    });
    let paragraph_path = child_path(&parent_path, insert_at + 1);
    ops.push(Op::InsertNode {
        path: paragraph_path.clone(),
        node: Node::paragraph(""),
    });

    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(Point::new(
            child_path(&paragraph_path, 0),
            0,
        )))
        .source(source))
}

struct NormalizeImageAttrs;

impl NormalizePass for NormalizeImageAttrs {
    fn id(&self) -> &'static str {
        "image.normalize_attrs"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for_each_void(&doc.children, &mut Vec::new(), &mut |path, void| {
            if void.kind != "image" {
                return;
            }
            let attrs = &void.attrs;
            let mut patch = AttrPatch::default();

            let width = attrs.get("width").and_then(|v| v.as_u64());
            let clamped = width
                .unwrap_or(IMAGE_MAX_WIDTH_PERCENT)
                .clamp(IMAGE_MIN_WIDTH_PERCENT, IMAGE_MAX_WIDTH_PERCENT);
            if width != Some(clamped) {
                patch = patch.set("width", clamped);
            }

            let align = attrs.get("align").and_then(|v| v.as_str());
            if !matches!(align, Some("left" | "center" | "right")) {
                patch = patch.set("align", "center");
            }
            if !attrs.get("caption").is_some_and(Value::is_string) {
                patch = patch.set("caption", "");
            }
            for key in ["image_width", "image_height"] {
                match attrs.get(key) {
                    None => {}
                    Some(v) if v.as_u64().is_some_and(|px| px > 0) => {}
                    Some(_) => patch = patch.remove(key),
                }
            }

            if !patch.is_empty() {
                ops.push(Op::SetNodeAttrs {
                    path: path.to_vec(),
                    patch,
                });
            }
        });
        ops
    }
}

struct MathPlugin;

impl FolioPlugin for MathPlugin {
    fn id(&self) -> &'static str {
        "math"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec::void("inline_math", NodeRole::Inline),
            NodeSpec::void("block_math", NodeRole::Block),
        ]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("math.insert_inline", "Insert inline math", |editor, args| {
                let latex = parse_latex_arg(args.as_ref())?;
                let tx = insert_inline_math(editor, latex).map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert math: {e}")))
            })
            .description("Insert an inline math node at the caret.")
            .keywords(["math", "latex", "formula", "inline"])
            .args_example(serde_json::json!({ "latex": "E=mc^2" })),
            CommandSpec::new("math.insert_block", "Insert block math", |editor, args| {
                let latex = parse_latex_arg(args.as_ref())?;
                let tx = insert_block_void(
                    editor,
                    Node::block_math(latex),
                    "command:math.insert_block",
                )
                .map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert math: {e}")))
            })
            .description("Insert a display math block.")
            .keywords(["math", "latex", "formula", "equation", "block"])
            .args_example(serde_json::json!({ "latex": "\\int_0^1 x\\,dx" })),
            CommandSpec::new("math.update", "Update math", |editor, args| {
                let latex = parse_latex_arg(args.as_ref())?;
                let path = parse_path_arg(args.as_ref())
                    .ok_or_else(|| CommandError::new("Missing args.path"))?;
                match node_ref(editor.doc(), &path) {
                    Some(Node::Void(v)) if v.kind == "inline_math" || v.kind == "block_math" => {}
                    _ => return Err(CommandError::new("No math node at args.path")),
                }
                editor
                    .set_node_attrs(
                        path,
                        AttrPatch::default().set("latex", latex),
                        "command:math.update",
                    )
                    .map_err(|e| CommandError::new(format!("Failed to update math: {e}")))
            })
            .description("Replace the LaTeX source of a math node.")
            .keywords(["math", "latex", "edit"])
            .args_example(serde_json::json!({ "path": [0, 1], "latex": "a^2+b^2" })),
        ]
    }
}

fn parse_latex_arg(args: Option<&Value>) -> Result<String, CommandError> {
    args.and_then(|v| v.get("latex"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CommandError::new("Missing args.latex"))
}

fn insert_inline_math(editor: &Editor, latex: String) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    if !sel.is_collapsed() {
        return Err("Selection must be collapsed".into());
    }

    let focus = sel.focus;
    let (child_ix, block_path) = focus
        .path
        .split_last()
        .ok_or("Selection is not in a text node")?;

    let Some(Node::Element(el)) = node_ref(editor.doc(), block_path) else {
        return Err("Selection is not in a text block".into());
    };
    if editor.registry().is_code(&el.kind) {
        return Err("Math is not allowed in code".into());
    }
    let Some(Node::Text(text)) = el.children.get(*child_ix) else {
        return Err("Selection is not in a text node".into());
    };

    let cursor = clamp_to_char_boundary(&text.text, focus.offset);
    let left = text.text.get(..cursor).unwrap_or("").to_string();
    let right = text.text.get(cursor..).unwrap_or("").to_string();
    let marks = text.marks.clone();

    let mut replacement: Vec<Node> = Vec::new();
    let mut math_ix = *child_ix;
    if !left.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: left,
            marks: marks.clone(),
        }));
        math_ix += 1;
    }
    replacement.push(Node::inline_math(latex));
    replacement.push(Node::Text(TextNode { text: right, marks }));

    let mut ops: Vec<Op> = vec![Op::RemoveNode {
        path: focus.path.clone(),
    }];
    for (i, node) in replacement.into_iter().enumerate() {
        ops.push(Op::InsertNode {
            path: child_path(block_path, child_ix + i),
            node,
        });
    }

    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(Point::new(
            child_path(block_path, math_ix + 1),
            0,
        )))
        .source("command:math.insert_inline"))
}
