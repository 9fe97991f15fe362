use std::ops::Range;

use folio_core::position::point_to_pos;
use folio_core::{CommandError, Editor, Node, Point};
use serde_json::{Value, json};

use crate::image::ImageFile;
use crate::math::MathKind;
use crate::view::Prompter;

pub const EMPTY_STATE: &str = "No matches. Try a different search.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Bulleted,
    Ordered,
    Task,
}

impl ListKind {
    fn toggle_command(self) -> &'static str {
        match self {
            ListKind::Bulleted => "list.toggle_bulleted",
            ListKind::Ordered => "list.toggle_ordered",
            ListKind::Task => "list.toggle_task",
        }
    }
}

/// Everything a slash item can do, each with its own payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashCommand {
    ImageUpload,
    ImageUrl,
    Text,
    Heading { level: u8 },
    List(ListKind),
    Blockquote,
    CodeBlock,
    Highlight,
    Math(MathKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashItem {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    pub keywords: &'static [&'static str],
    pub command: SlashCommand,
}

impl SlashItem {
    fn matches(&self, lower_query: &str) -> bool {
        self.title.to_lowercase().contains(lower_query)
            || self
                .keywords
                .iter()
                .any(|keyword| keyword.to_lowercase().contains(lower_query))
    }
}

const fn item(
    id: &'static str,
    title: &'static str,
    description: &'static str,
    icon: &'static str,
    keywords: &'static [&'static str],
    command: SlashCommand,
) -> SlashItem {
    SlashItem {
        id,
        title,
        description,
        icon,
        keywords,
        command,
    }
}

static CATALOG: [SlashItem; 14] = [
    item(
        "image",
        "Image",
        "Upload or paste an image.",
        "image",
        &["image", "photo", "picture", "upload"],
        SlashCommand::ImageUpload,
    ),
    item(
        "image-url",
        "Image from URL",
        "Paste a link to an image.",
        "image",
        &["image", "photo", "url", "link"],
        SlashCommand::ImageUrl,
    ),
    item(
        "text",
        "Text",
        "Start with plain paragraphs.",
        "text",
        &["paragraph", "text", "plain"],
        SlashCommand::Text,
    ),
    item(
        "heading1",
        "Heading 1",
        "Large section heading.",
        "heading-1",
        &["heading", "title", "h1"],
        SlashCommand::Heading { level: 1 },
    ),
    item(
        "heading2",
        "Heading 2",
        "Medium section heading.",
        "heading-2",
        &["heading", "subtitle", "h2"],
        SlashCommand::Heading { level: 2 },
    ),
    item(
        "heading3",
        "Heading 3",
        "Small section heading.",
        "heading-3",
        &["heading", "subtitle", "h3"],
        SlashCommand::Heading { level: 3 },
    ),
    item(
        "bulletList",
        "Bulleted List",
        "Create a bulleted list.",
        "list",
        &["list", "bullet", "unordered"],
        SlashCommand::List(ListKind::Bulleted),
    ),
    item(
        "orderedList",
        "Numbered List",
        "Create a numbered list.",
        "list-ordered",
        &["list", "ordered", "numbered"],
        SlashCommand::List(ListKind::Ordered),
    ),
    item(
        "taskList",
        "To-do List",
        "Track tasks with checkboxes.",
        "check-square",
        &["todo", "task", "list"],
        SlashCommand::List(ListKind::Task),
    ),
    item(
        "blockquote",
        "Quote",
        "Capture a quote.",
        "quote",
        &["quote", "blockquote"],
        SlashCommand::Blockquote,
    ),
    item(
        "codeBlock",
        "Code Block",
        "Show code snippets.",
        "code",
        &["code", "snippet", "block"],
        SlashCommand::CodeBlock,
    ),
    item(
        "highlight",
        "Highlight",
        "Emphasize text with color.",
        "highlighter",
        &["highlight", "color"],
        SlashCommand::Highlight,
    ),
    item(
        "inlineMath",
        "Inline Math",
        "Insert math expression inline (e.g., $x^2 + y^2$).",
        "sigma",
        &["math", "latex", "formula", "equation", "inline"],
        SlashCommand::Math(MathKind::Inline),
    ),
    item(
        "blockMath",
        "Block Math",
        "Insert math expression as a block (centered).",
        "sigma",
        &["math", "latex", "formula", "equation", "block", "display"],
        SlashCommand::Math(MathKind::Block),
    ),
];

/// The built-in catalog, in menu order.
pub fn default_catalog() -> &'static [SlashItem] {
    &CATALOG
}

/// Empty query: the first `limit` items. Otherwise every item whose title or one of whose
/// keywords contains the query, ignoring case, in catalog order, at most `limit`.
pub fn filter_items(query: &str, items: &[SlashItem], limit: usize) -> Vec<SlashItem> {
    if query.is_empty() {
        return items.iter().take(limit).cloned().collect();
    }
    let lower = query.to_lowercase();
    items
        .iter()
        .filter(|item| item.matches(&lower))
        .take(limit)
        .cloned()
        .collect()
}

/// One open slash popup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionSession {
    /// Document range of the trigger character plus the query.
    pub range: Range<usize>,
    pub query: String,
    pub items: Vec<SlashItem>,
    selected: usize,
}

impl SuggestionSession {
    pub fn new(range: Range<usize>, query: impl Into<String>, items: Vec<SlashItem>) -> Self {
        Self {
            range,
            query: query.into(),
            items,
            selected: 0,
        }
    }

    pub fn selected_index(&self) -> Option<usize> {
        match self.items.len() {
            0 => None,
            len => Some(self.selected % len),
        }
    }

    pub fn selected_item(&self) -> Option<&SlashItem> {
        self.items.get(self.selected_index()?)
    }

    pub fn move_down(&mut self) {
        if let Some(ix) = self.selected_index() {
            self.selected = (ix + 1) % self.items.len();
        }
    }

    pub fn move_up(&mut self) {
        if let Some(ix) = self.selected_index() {
            let len = self.items.len();
            self.selected = (ix + len - 1) % len;
        }
    }

    pub fn select(&mut self, index: usize) {
        self.selected = index;
    }

    pub fn empty_state(&self) -> Option<&'static str> {
        self.items.is_empty().then_some(EMPTY_STATE)
    }
}

/// A trigger found before the caret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub range: Range<usize>,
    pub query: String,
}

/// Looks for `trigger` before a collapsed caret in a text leaf. The trigger must open the
/// text block or follow whitespace, the query may not contain whitespace, and verbatim
/// blocks never open a session.
pub fn find_trigger(editor: &Editor, trigger: char) -> Option<TriggerMatch> {
    let selection = editor.selection();
    if !selection.is_collapsed() {
        return None;
    }
    let doc = editor.doc();
    let caret = &selection.focus;
    let (leaf_ix, block_path) = caret.path.split_last()?;
    let Some(Node::Text(leaf)) = doc.node(&caret.path) else {
        return None;
    };
    let block = doc.node(block_path)?;
    if editor.registry().is_code(block.kind()) {
        return None;
    }

    let prefix = leaf.text.get(..caret.offset)?;
    let at = prefix.rfind(trigger)?;
    let query = &prefix[at + trigger.len_utf8()..];
    if query.chars().any(char::is_whitespace) {
        return None;
    }
    let opens_block = at == 0 && *leaf_ix == 0;
    let after_space = prefix[..at]
        .chars()
        .next_back()
        .is_some_and(char::is_whitespace);
    if !opens_block && !after_space {
        return None;
    }

    let from = point_to_pos(doc, &Point::new(caret.path.clone(), at))?;
    let to = point_to_pos(doc, caret)?;
    Some(TriggerMatch {
        range: from..to,
        query: query.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Unchanged,
    Started,
    Updated,
    Exited,
    /// The previous session ended and a new one began at another trigger.
    Restarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashKey {
    Up,
    Down,
    Enter,
    Tab,
    Escape,
}

/// An item picked from the popup, with the range it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashSelection {
    pub item: SlashItem,
    pub range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Ignored,
    Handled,
    Selected(SlashSelection),
}

/// Follows the caret and owns at most one suggestion session.
pub struct SlashTracker {
    trigger: char,
    limit: usize,
    catalog: Vec<SlashItem>,
    session: Option<SuggestionSession>,
    dismissed: Option<usize>,
}

impl SlashTracker {
    pub fn new(trigger: char, limit: usize, catalog: Vec<SlashItem>) -> Self {
        Self {
            trigger,
            limit,
            catalog,
            session: None,
            dismissed: None,
        }
    }

    pub fn session(&self) -> Option<&SuggestionSession> {
        self.session.as_ref()
    }

    /// Re-reads the caret after a transaction or selection change.
    pub fn update(&mut self, editor: &Editor) -> SessionChange {
        let found = if editor.is_editable() {
            find_trigger(editor, self.trigger)
        } else {
            None
        };
        let Some(found) = found else {
            self.dismissed = None;
            return match self.session.take() {
                Some(_) => SessionChange::Exited,
                None => SessionChange::Unchanged,
            };
        };
        if self.dismissed == Some(found.range.start) {
            return match self.session.take() {
                Some(_) => SessionChange::Exited,
                None => SessionChange::Unchanged,
            };
        }
        self.dismissed = None;

        let items = filter_items(&found.query, &self.catalog, self.limit);
        match self.session.as_mut() {
            Some(session) if session.range.start == found.range.start => {
                if session.query != found.query {
                    session.selected = 0;
                }
                session.range = found.range;
                session.query = found.query;
                session.items = items;
                SessionChange::Updated
            }
            previous => {
                let restarted = previous.is_some();
                tracing::trace!(query = %found.query, "slash session");
                self.session = Some(SuggestionSession::new(found.range, found.query, items));
                if restarted {
                    SessionChange::Restarted
                } else {
                    SessionChange::Started
                }
            }
        }
    }

    pub fn key(&mut self, key: SlashKey) -> KeyOutcome {
        let Some(session) = self.session.as_mut() else {
            return KeyOutcome::Ignored;
        };
        match key {
            SlashKey::Down => {
                session.move_down();
                KeyOutcome::Handled
            }
            SlashKey::Up => {
                session.move_up();
                KeyOutcome::Handled
            }
            SlashKey::Enter | SlashKey::Tab => match session.selected_index() {
                Some(ix) => self.choose(ix),
                None => KeyOutcome::Handled,
            },
            SlashKey::Escape => {
                self.dismissed = Some(session.range.start);
                self.session = None;
                KeyOutcome::Handled
            }
        }
    }

    pub fn hover(&mut self, index: usize) {
        if let Some(session) = self.session.as_mut() {
            if index < session.items.len() {
                session.select(index);
            }
        }
    }

    pub fn click(&mut self, index: usize) -> KeyOutcome {
        match self.session.as_ref() {
            Some(session) if index < session.items.len() => self.choose(index),
            _ => KeyOutcome::Ignored,
        }
    }

    fn choose(&mut self, index: usize) -> KeyOutcome {
        let Some(session) = self.session.take() else {
            return KeyOutcome::Ignored;
        };
        let Some(item) = session.items.get(index).cloned() else {
            return KeyOutcome::Ignored;
        };
        // The trigger text may survive a cancelled prompt; do not reopen on it.
        self.dismissed = Some(session.range.start);
        KeyOutcome::Selected(SlashSelection {
            item,
            range: session.range,
        })
    }
}

/// What a slash command needs from the host beyond prompting.
pub trait SlashHost: Prompter {
    /// Lets the user pick an image file. `None` falls back to asking for a URL.
    fn pick_image_file(&mut self) -> Option<ImageFile> {
        None
    }

    fn insert_image_from_url(&mut self, editor: &mut Editor, url: &str) -> Result<(), CommandError> {
        editor.run_command("image.insert", Some(json!({ "src": url })))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashOutcome {
    Applied,
    /// Nothing to insert; the trigger text stays.
    Skipped,
    /// The trigger text is gone and the host should upload this file.
    UploadRequested(ImageFile),
    Failed,
}

/// Runs a selected slash item: the trigger range is deleted and the item's content goes in
/// as one undo step. Failures are logged.
pub fn perform(
    editor: &mut Editor,
    host: &mut dyn SlashHost,
    selection: &SlashSelection,
) -> SlashOutcome {
    if !editor.is_editable() {
        return SlashOutcome::Skipped;
    }
    let id = selection.item.id;
    let range = json!({ "from": selection.range.start, "to": selection.range.end });
    let source = format!("slash:{id}");

    let result = match selection.item.command {
        SlashCommand::Math(kind) => {
            let Some(latex) = prompt_trimmed(host, "Enter LaTeX math expression:", "") else {
                return SlashOutcome::Skipped;
            };
            editor.transact(&source, |editor| {
                editor.run_command("core.delete_range", Some(range))?;
                editor.run_command(kind.insert_command(), Some(json!({ "latex": latex })))
            })
        }
        SlashCommand::ImageUrl => {
            let Some(url) = prompt_trimmed(host, "Paste the image URL", "https://") else {
                return SlashOutcome::Skipped;
            };
            insert_from_url(editor, host, &source, range, &url)
        }
        SlashCommand::ImageUpload => match host.pick_image_file() {
            Some(file) => match editor.run_command("core.delete_range", Some(range)) {
                Ok(()) => return SlashOutcome::UploadRequested(file),
                Err(err) => Err(err),
            },
            None => {
                let Some(url) = prompt_trimmed(host, "Paste the image URL", "https://") else {
                    return SlashOutcome::Skipped;
                };
                insert_from_url(editor, host, &source, range, &url)
            }
        },
        command => editor.transact(&source, |editor| {
            editor.run_command("core.delete_range", Some(range))?;
            for (id, args) in block_steps(command) {
                editor.run_command(id, args)?;
            }
            Ok(())
        }),
    };

    match result {
        Ok(()) => SlashOutcome::Applied,
        Err(err) => {
            tracing::error!(command = id, error = err.message(), "slash command failed");
            SlashOutcome::Failed
        }
    }
}

fn insert_from_url(
    editor: &mut Editor,
    host: &mut dyn SlashHost,
    source: &str,
    range: Value,
    url: &str,
) -> Result<(), CommandError> {
    editor.transact(source, |editor| {
        editor.run_command("core.delete_range", Some(range))?;
        host.insert_image_from_url(editor, url)
    })
}

fn prompt_trimmed(host: &mut dyn SlashHost, message: &str, default: &str) -> Option<String> {
    let input = host.prompt(message, default)?;
    let trimmed = input.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn block_steps(command: SlashCommand) -> Vec<(&'static str, Option<Value>)> {
    match command {
        SlashCommand::Text => vec![("block.set_paragraph", None)],
        SlashCommand::Heading { level } => {
            vec![("block.set_heading", Some(json!({ "level": level })))]
        }
        SlashCommand::List(ListKind::Ordered) => vec![
            ("block.set_paragraph", None),
            (ListKind::Ordered.toggle_command(), None),
        ],
        SlashCommand::List(kind) => vec![(kind.toggle_command(), None)],
        SlashCommand::Blockquote => vec![
            ("block.set_paragraph", None),
            ("blockquote.wrap_selection", None),
        ],
        SlashCommand::CodeBlock => vec![("code_block.toggle", None)],
        SlashCommand::Highlight => vec![("marks.set_highlight", None)],
        SlashCommand::ImageUpload | SlashCommand::ImageUrl | SlashCommand::Math(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_unique() {
        let mut ids: Vec<&str> = default_catalog().iter().map(|item| item.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), default_catalog().len());
    }

    #[test]
    fn out_of_range_selection_is_read_modulo() {
        let mut session = SuggestionSession::new(0..1, "", default_catalog()[..3].to_vec());
        session.select(7);
        assert_eq!(session.selected_index(), Some(1));
        session.move_down();
        assert_eq!(session.selected_index(), Some(2));
    }

    #[test]
    fn empty_session_has_no_selection() {
        let mut session = SuggestionSession::new(0..4, "zzz", Vec::new());
        session.move_down();
        assert_eq!(session.selected_item(), None);
        assert_eq!(session.empty_state(), Some(EMPTY_STATE));
    }
}
