//! Canonical HTML for documents, and a tolerant reader for arbitrary markup.
//!
//! Serialization builds an `RcDom` tree and hands it to the html5ever serializer, so
//! escaping of text and attribute values is the serializer's job. Parsing runs the full
//! html5ever tree builder and then reads the body back into blocks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use html5ever::tendril::TendrilSink;
use html5ever::{
    Attribute, LocalName, ParseOpts, QualName, ns, parse_document, serialize,
    serialize::SerializeOpts, serialize::TraversalScope,
};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};
use serde_json::Value;
use thiserror::Error;

use crate::core::{Attrs, Document, ElementNode, Marks, Node, TextNode, VoidNode};

#[derive(Debug, Error)]
pub enum HtmlError {
    #[error("HTML serialization failed: {0}")]
    Serialize(#[from] std::io::Error),
    #[error("serialized HTML is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub fn to_html(doc: &Document) -> Result<String, HtmlError> {
    let container = create_element("body", vec![]);
    append_blocks(&container, &doc.children);

    let opts = SerializeOpts {
        traversal_scope: TraversalScope::IncludeNode,
        ..Default::default()
    };
    let mut output = Vec::new();
    for child in container.children.borrow().iter() {
        let serializable = SerializableHandle::from(child.clone());
        serialize(&mut output, &serializable, opts.clone())?;
    }
    Ok(String::from_utf8(output)?)
}

fn attr_string(attrs: &Attrs, key: &str) -> Option<String> {
    match attrs.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn list_type(el: &ElementNode) -> &str {
    el.attrs
        .get("list_type")
        .and_then(|v| v.as_str())
        .unwrap_or("bulleted")
}

fn append_blocks(parent: &Handle, blocks: &[Node]) {
    let mut open_list: Option<(String, Handle)> = None;

    for block in blocks {
        if let Node::Element(el) = block {
            if el.kind == "list_item" {
                let kind = list_type(el).to_string();
                let list = match &open_list {
                    Some((open_kind, handle)) if *open_kind == kind => handle.clone(),
                    _ => {
                        let handle = match kind.as_str() {
                            "ordered" => create_element("ol", vec![]),
                            "task" => create_element("ul", vec![("data-type", "taskList")]),
                            _ => create_element("ul", vec![]),
                        };
                        push(parent, handle.clone());
                        open_list = Some((kind.clone(), handle.clone()));
                        handle
                    }
                };
                let li = if kind == "task" {
                    let checked = el
                        .attrs
                        .get("checked")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    create_element(
                        "li",
                        vec![
                            ("data-type", "taskItem"),
                            ("data-checked", if checked { "true" } else { "false" }),
                        ],
                    )
                } else {
                    create_element("li", vec![])
                };
                append_inlines(&li, &el.children);
                push(&list, li);
                continue;
            }
        }
        open_list = None;
        append_block(parent, block);
    }
}

fn append_block(parent: &Handle, block: &Node) {
    match block {
        Node::Element(el) => match el.kind.as_str() {
            "heading" => {
                let level = el
                    .attrs
                    .get("level")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1)
                    .clamp(1, 3);
                let h = create_element(&format!("h{level}"), vec![]);
                append_inlines(&h, &el.children);
                push(parent, h);
            }
            "blockquote" => {
                let quote = create_element("blockquote", vec![]);
                append_blocks(&quote, &el.children);
                push(parent, quote);
            }
            "code_block" => {
                let pre = create_element("pre", vec![]);
                let class = attr_string(&el.attrs, "language").map(|l| format!("language-{l}"));
                let code = match &class {
                    Some(class) => create_element("code", vec![("class", class.as_str())]),
                    None => create_element("code", vec![]),
                };
                let text: String = el.children.iter().map(Node::text_content).collect();
                push(&code, create_text(&text));
                push(&pre, code);
                push(parent, pre);
            }
            _ => {
                let p = create_element("p", vec![]);
                append_inlines(&p, &el.children);
                push(parent, p);
            }
        },
        Node::Void(v) => match v.kind.as_str() {
            "image" => push(parent, image_element(v)),
            "block_math" => {
                let latex = attr_string(&v.attrs, "latex").unwrap_or_default();
                push(
                    parent,
                    create_element(
                        "div",
                        vec![("data-type", "block-math"), ("data-latex", latex.as_str())],
                    ),
                );
            }
            other => {
                tracing::debug!(kind = other, "no HTML form for block void");
            }
        },
        Node::Text(t) => {
            let p = create_element("p", vec![]);
            append_text(&p, t);
            push(parent, p);
        }
    }
}

fn image_element(v: &VoidNode) -> Handle {
    let mut owned: Vec<(&str, String)> = vec![("class", "editor-image-node".to_string())];
    for (key, html_key) in [
        ("src", "src"),
        ("alt", "alt"),
        ("width", "data-width"),
        ("align", "data-align"),
        ("caption", "caption"),
        ("image_width", "width"),
        ("image_height", "height"),
    ] {
        if let Some(value) = attr_string(&v.attrs, key) {
            owned.push((html_key, value));
        }
    }
    create_element(
        "img",
        owned.iter().map(|(k, v)| (*k, v.as_str())).collect(),
    )
}

fn append_inlines(parent: &Handle, children: &[Node]) {
    for child in children {
        match child {
            Node::Text(t) => append_text(parent, t),
            Node::Void(v) if v.kind == "inline_math" => {
                let latex = attr_string(&v.attrs, "latex").unwrap_or_default();
                push(
                    parent,
                    create_element(
                        "span",
                        vec![("data-type", "inline-math"), ("data-latex", latex.as_str())],
                    ),
                );
            }
            Node::Void(v) => {
                tracing::debug!(kind = %v.kind, "no HTML form for inline void");
            }
            Node::Element(el) => append_inlines(parent, &el.children),
        }
    }
}

fn append_text(parent: &Handle, text: &TextNode) {
    if text.text.is_empty() {
        return;
    }
    let marks = &text.marks;
    let mut target = parent.clone();
    let mut wrap = |tag: &str, attrs: Vec<(&str, &str)>| {
        let el = create_element(tag, attrs);
        push(&target, el.clone());
        target = el;
    };

    if let Some(href) = &marks.link {
        wrap("a", vec![("href", href.as_str())]);
    }
    if marks.bold {
        wrap("strong", vec![]);
    }
    if marks.italic {
        wrap("em", vec![]);
    }
    if marks.underline {
        wrap("u", vec![]);
    }
    if marks.strikethrough {
        wrap("s", vec![]);
    }
    if marks.highlight {
        match &marks.highlight_color {
            Some(color) => wrap("mark", vec![("data-color", color.as_str())]),
            None => wrap("mark", vec![]),
        }
    }
    if marks.code {
        wrap("code", vec![]);
    }

    for (ix, line) in text.text.split('\n').enumerate() {
        if ix > 0 {
            push(&target, create_element("br", vec![]));
        }
        if !line.is_empty() {
            push(&target, create_text(line));
        }
    }
}

fn push(parent: &Handle, child: Handle) {
    parent.children.borrow_mut().push(child);
}

/// Create an HTML element with attributes
fn create_element(tag: &str, attrs: Vec<(&str, &str)>) -> Handle {
    let qual_name = QualName::new(None, ns!(html), LocalName::from(tag));
    let attributes = attrs
        .into_iter()
        .map(|(name, value)| Attribute {
            name: QualName::new(None, ns!(), LocalName::from(name)),
            value: value.to_string().into(),
        })
        .collect();

    Rc::new(markup5ever_rcdom::Node {
        parent: Cell::new(None),
        children: RefCell::new(Vec::new()),
        data: NodeData::Element {
            name: qual_name,
            attrs: RefCell::new(attributes),
            template_contents: Default::default(),
            mathml_annotation_xml_integration_point: false,
        },
    })
}

fn create_text(text: &str) -> Handle {
    Rc::new(markup5ever_rcdom::Node {
        parent: Cell::new(None),
        children: RefCell::new(Vec::new()),
        data: NodeData::Text {
            contents: RefCell::new(text.to_string().into()),
        },
    })
}

/// Reads markup into a document. Never fails: anything unrecognised is flattened into
/// its text, and an empty result becomes a single empty paragraph.
pub fn parse_html(markup: &str) -> Document {
    let dom = parse_document(RcDom::default(), ParseOpts::default()).one(markup);
    let Some(body) = find_element(&dom.document, "body") else {
        return Document::new(vec![Node::paragraph("")]);
    };

    let mut reader = Reader::default();
    reader.block_children(&body);
    reader.flush(&BlockCtx::loose());

    let mut children = reader.blocks;
    if children.is_empty() {
        children.push(Node::paragraph(""));
    }
    Document::new(children)
}

fn find_element(handle: &Handle, tag: &str) -> Option<Handle> {
    if element_name(handle).as_deref() == Some(tag) {
        return Some(handle.clone());
    }
    handle
        .children
        .borrow()
        .iter()
        .find_map(|child| find_element(child, tag))
}

fn element_name(handle: &Handle) -> Option<String> {
    match &handle.data {
        NodeData::Element { name, .. } => Some(name.local.to_string()),
        _ => None,
    }
}

fn attr(handle: &Handle, key: &str) -> Option<String> {
    let NodeData::Element { attrs, .. } = &handle.data else {
        return None;
    };
    attrs
        .borrow()
        .iter()
        .find(|a| &*a.name.local == key)
        .map(|a| a.value.to_string())
}

fn raw_text(handle: &Handle, out: &mut String) {
    match &handle.data {
        NodeData::Text { contents } => out.push_str(&contents.borrow()),
        NodeData::Element { name, .. } if &*name.local == "br" => out.push('\n'),
        _ => {
            for child in handle.children.borrow().iter() {
                raw_text(child, out);
            }
        }
    }
}

/// The text block that loose inline content is currently flowing into.
#[derive(Clone)]
struct BlockCtx {
    kind: &'static str,
    attrs: Attrs,
    keep_empty: bool,
}

impl BlockCtx {
    fn loose() -> Self {
        Self {
            kind: "paragraph",
            attrs: Attrs::default(),
            keep_empty: false,
        }
    }

    fn block(kind: &'static str, attrs: Attrs) -> Self {
        Self {
            kind,
            attrs,
            keep_empty: true,
        }
    }
}

#[derive(Default)]
struct Reader {
    blocks: Vec<Node>,
    inline: Vec<Node>,
    /// A block was split out of the current text block; an empty remainder is dropped.
    split: bool,
}

impl Reader {
    fn block_children(&mut self, parent: &Handle) {
        let loose = BlockCtx::loose();
        for child in parent.children.borrow().iter() {
            self.block_node(child, &loose);
        }
    }

    fn block_node(&mut self, handle: &Handle, loose: &BlockCtx) {
        let name = match &handle.data {
            NodeData::Text { contents } => {
                self.push_text(&contents.borrow(), &Marks::default());
                return;
            }
            NodeData::Element { name, .. } => name.local.to_string(),
            _ => return,
        };

        match name.as_str() {
            "p" => self.text_block(handle, BlockCtx::block("paragraph", Attrs::default())),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<u64>().unwrap_or(1).min(3);
                let mut attrs = Attrs::default();
                attrs.insert("level".to_string(), Value::from(level));
                self.text_block(handle, BlockCtx::block("heading", attrs));
            }
            "ul" | "ol" => {
                self.flush(loose);
                self.list(handle);
            }
            "blockquote" => {
                self.flush(loose);
                let mut inner = Reader::default();
                inner.block_children(handle);
                inner.flush(&BlockCtx::loose());
                self.blocks
                    .push(Node::element("blockquote", Attrs::default(), inner.blocks));
            }
            "pre" => {
                self.flush(loose);
                self.code_block(handle);
            }
            "img" => {
                self.flush(loose);
                if let Some(image) = read_image(handle) {
                    self.blocks.push(image);
                }
            }
            "div" if attr(handle, "data-type").as_deref() == Some("block-math") => {
                self.flush(loose);
                self.blocks
                    .push(Node::block_math(attr(handle, "data-latex").unwrap_or_default()));
            }
            "script" | "style" | "template" | "head" | "title" | "hr" => {}
            _ if is_inline_tag(&name) => self.inline_node(handle, &Marks::default(), loose),
            _ => {
                self.flush(loose);
                for child in handle.children.borrow().iter() {
                    self.block_node(child, loose);
                }
                self.flush(loose);
            }
        }
    }

    fn text_block(&mut self, handle: &Handle, ctx: BlockCtx) {
        self.flush(&BlockCtx::loose());
        for child in handle.children.borrow().iter() {
            self.inline_node(child, &Marks::default(), &ctx);
        }
        self.flush(&ctx);
    }

    fn list(&mut self, handle: &Handle) {
        let list_type = match (
            element_name(handle).as_deref(),
            attr(handle, "data-type").as_deref(),
        ) {
            (_, Some("taskList")) => "task",
            (Some("ol"), _) => "ordered",
            _ => "bulleted",
        };

        for item in handle.children.borrow().iter() {
            if element_name(item).as_deref() != Some("li") {
                self.block_node(item, &BlockCtx::loose());
                continue;
            }
            let mut attrs = Attrs::default();
            attrs.insert("list_type".to_string(), Value::String(list_type.to_string()));
            if list_type == "task" {
                let checked = attr(item, "data-checked").as_deref() == Some("true");
                attrs.insert("checked".to_string(), Value::Bool(checked));
            }
            let ctx = BlockCtx::block("list_item", attrs);

            for child in item.children.borrow().iter() {
                match element_name(child).as_deref() {
                    Some("ul" | "ol") => {
                        self.flush(&ctx);
                        self.list(child);
                        self.split = true;
                    }
                    _ => self.inline_node(child, &Marks::default(), &ctx),
                }
            }
            self.flush(&ctx);
        }
    }

    fn code_block(&mut self, pre: &Handle) {
        let code = pre
            .children
            .borrow()
            .iter()
            .find(|c| element_name(c).as_deref() == Some("code"))
            .cloned();
        let language = code
            .as_ref()
            .and_then(|c| attr(c, "class"))
            .and_then(|class| {
                class
                    .split_whitespace()
                    .find_map(|c| c.strip_prefix("language-").map(str::to_string))
            })
            .filter(|l| !l.is_empty());

        let mut text = String::new();
        raw_text(code.as_ref().unwrap_or(pre), &mut text);
        self.blocks
            .push(Node::code_block(language.as_deref(), text));
    }

    fn inline_node(&mut self, handle: &Handle, marks: &Marks, ctx: &BlockCtx) {
        let name = match &handle.data {
            NodeData::Text { contents } => {
                self.push_text(&contents.borrow(), marks);
                return;
            }
            NodeData::Element { name, .. } => name.local.to_string(),
            _ => return,
        };

        let mut marks = marks.clone();
        match name.as_str() {
            "br" => {
                self.inline.push(Node::Text(TextNode {
                    text: "\n".to_string(),
                    marks,
                }));
                return;
            }
            "span" if attr(handle, "data-type").as_deref() == Some("inline-math") => {
                self.inline
                    .push(Node::inline_math(attr(handle, "data-latex").unwrap_or_default()));
                return;
            }
            "img" => {
                // Images are blocks: split the surrounding text block around them.
                self.flush(&BlockCtx { keep_empty: false, ..ctx.clone() });
                if let Some(image) = read_image(handle) {
                    self.blocks.push(image);
                }
                self.split = true;
                return;
            }
            "div" if attr(handle, "data-type").as_deref() == Some("block-math") => {
                self.flush(&BlockCtx { keep_empty: false, ..ctx.clone() });
                self.blocks
                    .push(Node::block_math(attr(handle, "data-latex").unwrap_or_default()));
                self.split = true;
                return;
            }
            "script" | "style" | "template" => return,
            "strong" | "b" => marks.bold = true,
            "em" | "i" => marks.italic = true,
            "u" => marks.underline = true,
            "s" | "strike" | "del" => marks.strikethrough = true,
            "code" => marks.code = true,
            "mark" => {
                marks.highlight = true;
                marks.highlight_color = attr(handle, "data-color");
            }
            "a" => marks.link = attr(handle, "href"),
            _ => {}
        }

        for child in handle.children.borrow().iter() {
            self.inline_node(child, &marks, ctx);
        }
    }

    fn push_text(&mut self, text: &str, marks: &Marks) {
        let collapsed = collapse_whitespace(text);
        if collapsed.is_empty() {
            return;
        }
        self.inline.push(Node::Text(TextNode {
            text: collapsed,
            marks: marks.clone(),
        }));
    }

    fn flush(&mut self, ctx: &BlockCtx) {
        let inline = trim_inline(std::mem::take(&mut self.inline));
        let split = std::mem::take(&mut self.split);
        if inline.is_empty() && (!ctx.keep_empty || split) {
            return;
        }
        let children = if inline.is_empty() {
            vec![Node::text("")]
        } else {
            inline
        };
        self.blocks
            .push(Node::element(ctx.kind, ctx.attrs.clone(), children));
    }
}

fn is_inline_tag(name: &str) -> bool {
    matches!(
        name,
        "a" | "abbr"
            | "b"
            | "bdi"
            | "bdo"
            | "br"
            | "cite"
            | "code"
            | "del"
            | "dfn"
            | "em"
            | "i"
            | "ins"
            | "kbd"
            | "label"
            | "mark"
            | "q"
            | "s"
            | "samp"
            | "small"
            | "span"
            | "strike"
            | "strong"
            | "sub"
            | "sup"
            | "time"
            | "u"
            | "var"
    )
}

fn read_image(handle: &Handle) -> Option<Node> {
    let src = attr(handle, "src").filter(|s| !s.trim().is_empty())?;
    let Node::Void(mut image) = Node::image(src, attr(handle, "alt")) else {
        return None;
    };
    if let Some(caption) = attr(handle, "caption") {
        image
            .attrs
            .insert("caption".to_string(), Value::String(caption));
    }
    if let Some(width) = attr(handle, "data-width").and_then(|w| parse_dimension(&w)) {
        image.attrs.insert("width".to_string(), Value::from(width));
    }
    if let Some(align) = attr(handle, "data-align") {
        image.attrs.insert("align".to_string(), Value::String(align));
    }
    for (html_key, key) in [("width", "image_width"), ("height", "image_height")] {
        if let Some(px) = attr(handle, html_key).and_then(|v| parse_dimension(&v)) {
            image.attrs.insert(key.to_string(), Value::from(px));
        }
    }
    Some(Node::Void(image))
}

fn parse_dimension(value: &str) -> Option<u64> {
    let value = value.trim().trim_end_matches("px").trim_end_matches('%');
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.round() as u64)
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Drops spaces at line starts, doubled spaces across leaf boundaries and trailing spaces.
fn trim_inline(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
    let mut after_break = true;
    let mut after_space = false;

    for node in nodes {
        match node {
            Node::Text(mut t) => {
                let mut text = String::with_capacity(t.text.len());
                for c in t.text.chars() {
                    if c == ' ' && (after_break || after_space) {
                        continue;
                    }
                    if c == '\n' {
                        while text.ends_with(' ') {
                            text.pop();
                        }
                    }
                    text.push(c);
                    after_break = c == '\n';
                    after_space = c == ' ';
                }
                if !text.is_empty() {
                    t.text = text;
                    out.push(Node::Text(t));
                }
            }
            other => {
                after_break = false;
                after_space = false;
                out.push(other);
            }
        }
    }

    while let Some(Node::Text(last)) = out.last_mut() {
        let trimmed = last.text.trim_end_matches(' ').len();
        last.text.truncate(trimmed);
        if !last.text.is_empty() {
            break;
        }
        out.pop();
    }
    out
}

/// Plain-text projection: one entry per leaf block, separated by blank lines.
pub fn to_text(doc: &Document) -> String {
    let mut blocks: Vec<String> = Vec::new();
    collect_text_blocks(&doc.children, &mut blocks);
    blocks.join("\n\n")
}

fn collect_text_blocks(children: &[Node], out: &mut Vec<String>) {
    for node in children {
        match node {
            Node::Element(el) if el.kind == "blockquote" => collect_text_blocks(&el.children, out),
            Node::Element(el) => out.push(
                el.children
                    .iter()
                    .map(|child| match child {
                        Node::Void(v) if v.kind == "inline_math" => {
                            attr_string(&v.attrs, "latex").unwrap_or_default()
                        }
                        other => other.text_content(),
                    })
                    .collect(),
            ),
            Node::Void(v) if v.kind == "block_math" => {
                out.push(attr_string(&v.attrs, "latex").unwrap_or_default());
            }
            Node::Void(_) => {}
            Node::Text(t) => out.push(t.text.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_collapses_outside_pre() {
        let doc = parse_html("<p>  a \n  b  </p><pre><code>x\n  y</code></pre>");
        assert_eq!(doc.children[0].text_content(), "a b");
        assert_eq!(doc.children[1].text_content(), "x\n  y");
    }

    #[test]
    fn loose_text_becomes_paragraph() {
        let doc = parse_html("hello <b>world</b><div>next</div>");
        assert_eq!(doc.children.len(), 2);
        assert_eq!(doc.children[0].kind(), "paragraph");
        assert_eq!(doc.children[0].text_content(), "hello world");
        assert_eq!(doc.children[1].text_content(), "next");
    }

    #[test]
    fn empty_markup_yields_one_paragraph() {
        let doc = parse_html("");
        assert_eq!(doc.children, vec![Node::paragraph("")]);
    }
}
