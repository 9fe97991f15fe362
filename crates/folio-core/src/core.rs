use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ops::{Op, Path, Transaction};
use crate::plugin::{CommandError, CommandSpec, NodeSpec, PluginRegistry, QueryError};
use crate::position;

pub type Attrs = BTreeMap<String, serde_json::Value>;
pub type ElementKind = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Document {
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    pub fn node(&self, path: &[usize]) -> Option<&Node> {
        node_ref(self, path)
    }

    pub fn text_content(&self) -> String {
        self.children.iter().map(Node::text_content).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
    Void(VoidNode),
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            marks: Marks::default(),
        })
    }

    pub fn element(kind: impl Into<String>, attrs: Attrs, children: Vec<Node>) -> Self {
        Node::Element(ElementNode {
            kind: kind.into(),
            attrs,
            children,
        })
    }

    pub fn void(kind: impl Into<String>, attrs: Attrs) -> Self {
        Node::Void(VoidNode {
            kind: kind.into(),
            attrs,
        })
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Node::element("paragraph", Attrs::default(), vec![Node::text(text)])
    }

    pub fn heading(level: u64, text: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("level".to_string(), Value::from(level));
        Node::element("heading", attrs, vec![Node::text(text)])
    }

    pub fn list_item(list_type: &str, text: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("list_type".to_string(), Value::String(list_type.to_string()));
        if list_type == "task" {
            attrs.insert("checked".to_string(), Value::Bool(false));
        }
        Node::element("list_item", attrs, vec![Node::text(text)])
    }

    pub fn code_block(language: Option<&str>, code: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        if let Some(language) = language {
            attrs.insert("language".to_string(), Value::String(language.to_string()));
        }
        Node::element("code_block", attrs, vec![Node::text(code)])
    }

    pub fn image(src: impl Into<String>, alt: Option<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("src".to_string(), Value::String(src.into()));
        if let Some(alt) = alt {
            attrs.insert("alt".to_string(), Value::String(alt));
        }
        attrs.insert("caption".to_string(), Value::String(String::new()));
        attrs.insert("width".to_string(), Value::from(100u64));
        attrs.insert("align".to_string(), Value::String("center".to_string()));
        Node::void("image", attrs)
    }

    pub fn inline_math(latex: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("latex".to_string(), Value::String(latex.into()));
        Node::void("inline_math", attrs)
    }

    pub fn block_math(latex: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("latex".to_string(), Value::String(latex.into()));
        Node::void("block_math", attrs)
    }

    pub fn kind(&self) -> &str {
        match self {
            Node::Element(el) => &el.kind,
            Node::Void(v) => &v.kind,
            Node::Text(_) => "text",
        }
    }

    pub fn attrs(&self) -> Option<&Attrs> {
        match self {
            Node::Element(el) => Some(&el.attrs),
            Node::Void(v) => Some(&v.attrs),
            Node::Text(_) => None,
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs()?.get(key)?.as_str()
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Node::Text(_))
    }

    /// Concatenated text of all text leaves below this node. Voids contribute nothing.
    pub fn text_content(&self) -> String {
        match self {
            Node::Text(t) => t.text.clone(),
            Node::Void(_) => String::new(),
            Node::Element(el) => el.children.iter().map(Node::text_content).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub kind: ElementKind,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidNode {
    pub kind: ElementKind,
    #[serde(default)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default)]
    pub marks: Marks,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Marks {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub underline: bool,
    #[serde(default)]
    pub strikethrough: bool,
    #[serde(default)]
    pub code: bool,
    #[serde(default)]
    pub highlight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

/// Notifications drained by the host after each editing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    Create,
    Transaction {
        source: Option<String>,
        doc_changed: bool,
    },
    SelectionUpdate,
    Update,
}

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub inverse_ops: Vec<Op>,
    pub selection_before: Selection,
    pub selection_after: Selection,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineConfig {
    pub max_undo: usize,
    pub max_normalize_iterations: usize,
}

impl EngineConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.max_undo == 0 {
            self.max_undo = 200;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 100;
        }
        self
    }
}

struct Batch {
    source: String,
    undo_len: usize,
    selection_before: Selection,
    doc_changed: bool,
    emit_update: bool,
}

pub struct Editor {
    doc: Document,
    selection: Selection,
    node_selection: Option<Path>,
    registry: PluginRegistry,
    config: EngineConfig,
    editable: bool,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
    events: Vec<EditorEvent>,
    batch: Option<Batch>,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: PluginRegistry) -> Self {
        Self::with_config(doc, selection, registry, EngineConfig::default())
    }

    pub fn with_config(
        doc: Document,
        selection: Selection,
        registry: PluginRegistry,
        config: EngineConfig,
    ) -> Self {
        let mut editor = Self {
            doc,
            selection,
            node_selection: None,
            registry,
            config: config.with_defaults(),
            editable: true,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            events: vec![EditorEvent::Create],
            batch: None,
        };
        editor.normalize_in_place();
        editor
    }

    pub fn with_richtext_plugins() -> Self {
        Self::with_document(Document::new(vec![Node::paragraph("")]))
    }

    /// Creates an editor over `doc` with the caret at the first text position.
    pub fn with_document(doc: Document) -> Self {
        let selection = Selection::collapsed(Point::new(vec![0, 0], 0));
        Self::new(doc, selection, PluginRegistry::richtext())
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: Selection) {
        let before = self.selection.clone();
        self.selection = selection;
        self.node_selection = None;
        self.normalize_selection_in_place();
        if self.selection != before && self.batch.is_none() {
            self.events.push(EditorEvent::SelectionUpdate);
        }
    }

    /// Selects the text between two document positions, snapping to the nearest text leaves.
    pub fn select_range(&mut self, from: usize, to: usize) -> bool {
        let Some(selection) = position::text_selection_between(&self.doc, from, to) else {
            return false;
        };
        self.set_selection(selection);
        true
    }

    /// Selects a whole node. The text selection moves to the node's first text leaf when it
    /// has one, so commands that read the caret still resolve inside the node.
    pub fn select_node(&mut self, path: Path) -> Result<(), PathError> {
        if node_ref(&self.doc, &path).is_none() {
            return Err(PathError(format!("No node at {path:?}")));
        }
        let start = position::position_of(&self.doc, &path)
            .ok_or_else(|| PathError(format!("No node at {path:?}")))?;
        if let Some(point) = position::text_selection_between(&self.doc, start, start)
            .map(|sel| sel.anchor)
            .filter(|p| p.path.starts_with(&path))
        {
            self.selection = Selection::collapsed(point);
        }
        self.node_selection = Some(path);
        if self.batch.is_none() {
            self.events.push(EditorEvent::SelectionUpdate);
        }
        Ok(())
    }

    pub fn node_selection(&self) -> Option<&Path> {
        self.node_selection.as_ref()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn node_spec(&self, kind: &str) -> Option<&NodeSpec> {
        self.registry.node_specs().get(kind)
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    /// Drains the pending notifications in emission order.
    pub fn take_events(&mut self) -> Vec<EditorEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let redo_ops = self.replay(inverse_ops);

        self.selection = selection_before.clone();
        self.node_selection = None;
        self.normalize_in_place();

        self.redo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: redo_ops,
        });
        self.emit_history("history:undo");
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let undo_ops = self.replay(inverse_ops);

        self.selection = selection_after.clone();
        self.node_selection = None;
        self.normalize_in_place();

        self.undo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: undo_ops,
        });
        self.emit_history("history:redo");
        true
    }

    fn replay(&mut self, ops: Vec<Op>) -> Vec<Op> {
        let mut inverse: Vec<Op> = Vec::new();
        for op in ops {
            match self.apply_op(op) {
                Ok(inv) => inverse.push(inv),
                Err(err) => {
                    tracing::warn!(%err, "history replay stopped early");
                    break;
                }
            }
        }
        inverse.reverse();
        inverse
    }

    fn emit_history(&mut self, source: &str) {
        self.events.push(EditorEvent::Transaction {
            source: Some(source.to_string()),
            doc_changed: true,
        });
        self.events.push(EditorEvent::SelectionUpdate);
        self.events.push(EditorEvent::Update);
    }

    /// Applies a transaction atomically: either every op lands and one undo step is
    /// recorded, or the document is left untouched.
    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let selection_before = self.selection.clone();
        let Transaction {
            ops,
            selection_after,
            meta,
        } = tx;
        let doc_changed = !ops.is_empty();

        let mut inverse_ops: Vec<Op> = Vec::new();
        for op in ops {
            match self.apply_op(op) {
                Ok(inv) => inverse_ops.push(inv),
                Err(err) => {
                    self.rollback(inverse_ops);
                    self.selection = selection_before;
                    return Err(err);
                }
            }
        }

        if let Some(sel) = selection_after {
            self.selection = sel;
        }

        match self.normalize_with_inverse_ops() {
            Ok(mut inverse_normalize) => inverse_ops.append(&mut inverse_normalize),
            Err(err) => {
                self.rollback(inverse_ops);
                self.selection = selection_before;
                return Err(err);
            }
        }
        inverse_ops.reverse();

        self.normalize_selection_in_place();
        let selection_after = self.selection.clone();

        if doc_changed {
            self.node_selection = None;
            self.undo_stack.push(UndoRecord {
                inverse_ops,
                selection_before: selection_before.clone(),
                selection_after: selection_after.clone(),
            });
            self.redo_stack.clear();
            if self.batch.is_none() {
                self.trim_undo();
            }
        }

        match self.batch.as_mut() {
            Some(batch) => {
                batch.doc_changed |= doc_changed;
                batch.emit_update |= doc_changed && !meta.silent;
            }
            None => {
                self.events.push(EditorEvent::Transaction {
                    source: meta.source,
                    doc_changed,
                });
                if selection_after != selection_before {
                    self.events.push(EditorEvent::SelectionUpdate);
                }
                if doc_changed && !meta.silent {
                    self.events.push(EditorEvent::Update);
                }
            }
        }

        Ok(())
    }

    /// Runs several commands as one atomic change: a single undo step and a single
    /// round of events. When `f` fails every change it made is reverted.
    pub fn transact<R, E>(
        &mut self,
        source: &str,
        f: impl FnOnce(&mut Editor) -> Result<R, E>,
    ) -> Result<R, E> {
        if self.batch.is_some() {
            return f(self);
        }

        self.batch = Some(Batch {
            source: source.to_string(),
            undo_len: self.undo_stack.len(),
            selection_before: self.selection.clone(),
            doc_changed: false,
            emit_update: false,
        });

        let result = f(self);

        let Some(batch) = self.batch.take() else {
            return result;
        };

        if result.is_err() {
            while self.undo_stack.len() > batch.undo_len {
                if let Some(record) = self.undo_stack.pop() {
                    let _ = self.replay(record.inverse_ops);
                }
            }
            self.selection = batch.selection_before;
            self.normalize_in_place();
            return result;
        }

        if self.undo_stack.len() > batch.undo_len + 1 {
            let records: Vec<UndoRecord> = self.undo_stack.drain(batch.undo_len..).collect();
            let selection_before = records[0].selection_before.clone();
            let selection_after = self.selection.clone();
            let inverse_ops = records
                .into_iter()
                .rev()
                .flat_map(|record| record.inverse_ops)
                .collect();
            self.undo_stack.push(UndoRecord {
                inverse_ops,
                selection_before,
                selection_after,
            });
        }
        self.trim_undo();

        self.events.push(EditorEvent::Transaction {
            source: Some(batch.source),
            doc_changed: batch.doc_changed,
        });
        if self.selection != batch.selection_before {
            self.events.push(EditorEvent::SelectionUpdate);
        }
        if batch.emit_update {
            self.events.push(EditorEvent::Update);
        }

        result
    }

    /// Replaces the whole document in one transaction. A silent replacement does not
    /// emit `Update`.
    pub fn set_content(&mut self, doc: Document, silent: bool) -> Result<(), ApplyError> {
        let mut ops: Vec<Op> = (0..self.doc.children.len())
            .rev()
            .map(|ix| Op::RemoveNode { path: vec![ix] })
            .collect();
        for (ix, node) in doc.children.into_iter().enumerate() {
            ops.push(Op::InsertNode {
                path: vec![ix],
                node,
            });
        }
        let tx = Transaction::new(ops)
            .selection_after(Selection::collapsed(Point::new(vec![0, 0], 0)))
            .source("core.set_content")
            .silent(silent);
        self.apply(tx)
    }

    pub fn set_node_attrs(
        &mut self,
        path: Path,
        patch: AttrPatch,
        source: &str,
    ) -> Result<(), ApplyError> {
        let selection_after = self.selection.clone();
        self.apply(
            Transaction::new(vec![Op::SetNodeAttrs { path, patch }])
                .selection_after(selection_after)
                .source(source),
        )
    }

    pub fn delete_node(&mut self, path: Path, source: &str) -> Result<(), ApplyError> {
        if node_ref(&self.doc, &path).is_none() {
            return Err(ApplyError::InvalidPath(format!("No node at {path:?}")));
        }
        self.apply(Transaction::new(vec![Op::RemoveNode { path }]).source(source))
    }

    pub fn run_command(
        &mut self,
        id: &str,
        args: Option<serde_json::Value>,
    ) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    pub fn commands(&self) -> &HashMap<String, CommandSpec> {
        self.registry.commands()
    }

    fn trim_undo(&mut self) {
        while self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }
    }

    fn rollback(&mut self, mut inverse_ops: Vec<Op>) {
        inverse_ops.reverse();
        for op in inverse_ops {
            if let Err(err) = self.apply_op(op) {
                tracing::error!(%err, "rollback failed");
                break;
            }
        }
    }

    fn normalize_in_place(&mut self) {
        if let Err(err) = self.normalize_with_inverse_ops() {
            tracing::warn!(%err, "normalization failed");
        }
        self.normalize_selection_in_place();
    }

    fn normalize_selection_in_place(&mut self) {
        self.selection = self
            .registry
            .normalize_selection(&self.doc, &self.selection);
    }

    fn normalize_with_inverse_ops(&mut self) -> Result<Vec<Op>, ApplyError> {
        let mut inverse_ops: Vec<Op> = Vec::new();
        for _ in 0..self.config.max_normalize_iterations {
            let ops = self.registry.normalize(&self.doc);
            if ops.is_empty() {
                return Ok(inverse_ops);
            }
            for op in ops {
                let inv = self.apply_op(op)?;
                inverse_ops.push(inv);
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    fn apply_op(&mut self, op: Op) -> Result<Op, ApplyError> {
        apply_op_to(&mut self.doc, &mut self.selection, op)
    }
}

pub(crate) fn apply_op_to(
    doc: &mut Document,
    selection: &mut Selection,
    op: Op,
) -> Result<Op, ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            text_node.text.insert_str(offset, &text);
            transform_selection_insert_text(selection, &path, offset, text.len());
            Ok(Op::RemoveText {
                path,
                range: offset..offset + text.len(),
            })
        }
        Op::RemoveText { path, range } => {
            let text_node = node_text_mut(doc, &path)?;
            let start =
                clamp_to_char_boundary(&text_node.text, range.start.min(text_node.text.len()));
            let end = clamp_to_char_boundary(&text_node.text, range.end.min(text_node.text.len()));
            if start >= end {
                return Ok(Op::InsertText {
                    path,
                    offset: start,
                    text: String::new(),
                });
            }
            let removed = text_node.text[start..end].to_string();
            text_node.text.replace_range(start..end, "");
            transform_selection_remove_text(selection, &path, start..end);
            Ok(Op::InsertText {
                path,
                offset: start,
                text: removed,
            })
        }
        Op::InsertNode { path, node } => {
            insert_node(doc, &path, node)?;
            transform_selection_insert_node(selection, &path);
            Ok(Op::RemoveNode { path })
        }
        Op::RemoveNode { path } => {
            let removed = remove_node(doc, &path)?;
            transform_selection_remove_node(selection, &path, &removed, doc);
            Ok(Op::InsertNode {
                path,
                node: removed,
            })
        }
        Op::SetNodeAttrs { path, patch } => {
            let old = match node_mut(doc, &path)? {
                Node::Element(el) => patch_apply(&mut el.attrs, &patch),
                Node::Void(v) => patch_apply(&mut v.attrs, &patch),
                Node::Text(_) => return Err(ApplyError::InvalidPath("Text has no attrs".into())),
            };
            Ok(Op::SetNodeAttrs { path, patch: old })
        }
        Op::SetTextMarks { path, marks } => {
            let text_node = node_text_mut(doc, &path)?;
            let old = std::mem::replace(&mut text_node.marks, marks);
            Ok(Op::SetTextMarks { path, marks: old })
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("normalization did not converge")]
    NormalizeDidNotConverge,
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PathError(pub String);

pub(crate) fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

fn transform_selection_insert_text(
    selection: &mut Selection,
    path: &[usize],
    offset: usize,
    len: usize,
) {
    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.path == path && point.offset >= offset {
            point.offset = point.offset.saturating_add(len);
        }
    }
}

fn transform_selection_remove_text(
    selection: &mut Selection,
    path: &[usize],
    range: std::ops::Range<usize>,
) {
    let removed_len = range.end.saturating_sub(range.start);
    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.path != path || point.offset <= range.start {
            continue;
        }
        if point.offset >= range.end {
            point.offset = point.offset.saturating_sub(removed_len);
        } else {
            point.offset = range.start;
        }
    }
}

fn transform_selection_insert_node(selection: &mut Selection, path: &[usize]) {
    let Some((index, parent_path)) = path.split_last() else {
        return;
    };
    let depth = parent_path.len();

    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.path.len() <= depth || !point.path.starts_with(parent_path) {
            continue;
        }
        if point.path[depth] >= *index {
            point.path[depth] += 1;
        }
    }
}

fn transform_selection_remove_node(
    selection: &mut Selection,
    path: &[usize],
    removed: &Node,
    doc_after_remove: &Document,
) {
    let Some((&index, parent_path)) = path.split_last() else {
        return;
    };

    // A text leaf whose text was prepended to its right neighbour (leaf merging) keeps
    // points inside it on the same characters.
    let absorbed_len = match removed {
        Node::Text(removed_text) => {
            let mut right_path = parent_path.to_vec();
            right_path.push(index);
            match node_ref(doc_after_remove, &right_path) {
                Some(Node::Text(right))
                    if right.marks == removed_text.marks
                        && right.text.starts_with(&removed_text.text) =>
                {
                    Some(removed_text.text.len())
                }
                _ => None,
            }
        }
        _ => None,
    };

    let depth = parent_path.len();
    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.path.len() <= depth || !point.path.starts_with(parent_path) {
            continue;
        }
        let ix = point.path[depth];
        if ix > index {
            point.path[depth] = ix - 1;
            continue;
        }
        if ix < index {
            continue;
        }

        point.path.truncate(depth + 1);
        match absorbed_len {
            Some(len) => {
                point.path[depth] = index;
                point.offset = point.offset.min(len);
            }
            None => {
                point.path[depth] = index.saturating_sub(1);
                point.offset = 0;
            }
        }
    }
}

pub(crate) fn node_ref<'a>(doc: &'a Document, path: &[usize]) -> Option<&'a Node> {
    let (first, rest) = path.split_first()?;
    let mut node = doc.children.get(*first)?;
    for &ix in rest {
        node = match node {
            Node::Element(el) => el.children.get(ix)?,
            Node::Void(_) | Node::Text(_) => return None,
        };
    }
    Some(node)
}

fn node_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Node, PathError> {
    let Some((first, rest)) = path.split_first() else {
        return Err(PathError("Empty path".into()));
    };
    let len = doc.children.len();
    let mut node = doc
        .children
        .get_mut(*first)
        .ok_or_else(|| PathError(format!("Path out of bounds at depth 0: {first} >= {len}")))?;

    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Element(el) => {
                let len = el.children.len();
                match el.children.get_mut(ix) {
                    Some(child) => child,
                    None => {
                        return Err(PathError(format!(
                            "Path out of bounds at depth {}: {ix} >= {len}",
                            depth + 1
                        )));
                    }
                }
            }
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

fn node_text_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut TextNode, PathError> {
    match node_mut(doc, path)? {
        Node::Text(t) => Ok(t),
        _ => Err(PathError("Expected Text node".into())),
    }
}

fn children_mut<'a>(
    doc: &'a mut Document,
    parent_path: &[usize],
) -> Result<&'a mut Vec<Node>, PathError> {
    if parent_path.is_empty() {
        return Ok(&mut doc.children);
    }
    match node_mut(doc, parent_path)? {
        Node::Element(el) => Ok(&mut el.children),
        Node::Void(_) | Node::Text(_) => Err(PathError("Parent is not a container".into())),
    }
}

fn insert_node(doc: &mut Document, path: &[usize], node: Node) -> Result<(), PathError> {
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(PathError("Empty insert path".into()));
    };
    let children = children_mut(doc, parent_path)?;
    if index > children.len() {
        return Err(PathError(format!(
            "Insert index out of bounds: {index} > {}",
            children.len()
        )));
    }
    children.insert(index, node);
    Ok(())
}

fn remove_node(doc: &mut Document, path: &[usize]) -> Result<Node, PathError> {
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(PathError("Empty remove path".into()));
    };
    let children = children_mut(doc, parent_path)?;
    if index >= children.len() {
        return Err(PathError(format!(
            "Remove index out of bounds: {index} >= {}",
            children.len()
        )));
    }
    Ok(children.remove(index))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrPatch {
    #[serde(default)]
    pub set: Attrs,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl AttrPatch {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.remove.push(key.into());
        self
    }

    /// Sets `key` when `value` is present, removes it otherwise.
    pub fn set_or_remove(self, key: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self.remove(key),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

fn patch_apply(attrs: &mut Attrs, patch: &AttrPatch) -> AttrPatch {
    let mut old_set: Attrs = Attrs::new();
    let mut old_remove: Vec<String> = Vec::new();

    for (k, v) in &patch.set {
        if let Some(prev) = attrs.insert(k.clone(), v.clone()) {
            old_set.insert(k.clone(), prev);
        } else {
            old_remove.push(k.clone());
        }
    }

    for key in &patch.remove {
        if let Some(prev) = attrs.remove(key) {
            old_set.insert(key.clone(), prev);
        }
    }

    AttrPatch {
        set: old_set,
        remove: old_remove,
    }
}
