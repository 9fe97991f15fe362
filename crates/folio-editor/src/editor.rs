use std::borrow::Cow;
use std::rc::Rc;

use anyhow::Context as _;
use folio_core::{Document, Editor, EditorEvent, HtmlError, parse_html, to_html, to_text};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::EditorConfig;
use crate::controls::{AddBlockHandler, BlockControls, DragPayload, OverlayPosition};
use crate::image::{
    CompletedUpload, DataUrlUploader, ImageAction, ImageFile, ImageUploader, PendingUpload,
    UploadTarget,
};
use crate::math::{canonicalize_dollars, has_legacy_math, migrate_editor, preprocess_math_content};
use crate::node_view::{CodeRenderer, NodeView, NodeViews, SyntectRenderer};
use crate::slash::{
    KeyOutcome, SlashHost, SlashItem, SlashKey, SlashOutcome, SlashSelection, SlashTracker,
    SuggestionSession, default_catalog, perform,
};
use crate::store::ContentStore;
use crate::tracker::refresh_block_tags;
use crate::view::{EditorView, Prompter};

/// What the host passes in when mounting an editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorOptions {
    /// Initial markup. May still use legacy math delimiters.
    pub content: String,
    pub editable: bool,
    /// When set, content is persisted under this key and read back on mount.
    pub storage_key: Option<String>,
}

impl Default for EditorOptions {
    fn default() -> Self {
        Self {
            content: String::new(),
            editable: true,
            storage_key: None,
        }
    }
}

impl EditorOptions {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn editable(mut self, editable: bool) -> Self {
        self.editable = editable;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }
}

/// Emitted after every content change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub html: String,
    pub text: String,
}

pub type ChangeListener = Box<dyn FnMut(&ContentChange)>;

pub struct FolioEditorBuilder {
    options: EditorOptions,
    config: EditorConfig,
    store: Option<Box<dyn ContentStore>>,
    uploader: Rc<dyn ImageUploader>,
    renderer: Rc<dyn CodeRenderer>,
    catalog: Vec<SlashItem>,
    on_add_block: Option<AddBlockHandler>,
    on_change: Option<ChangeListener>,
}

impl FolioEditorBuilder {
    pub fn new(options: EditorOptions) -> Self {
        Self {
            options,
            config: EditorConfig::default(),
            store: None,
            uploader: Rc::new(DataUrlUploader),
            renderer: Rc::new(SyntectRenderer),
            catalog: default_catalog().to_vec(),
            on_add_block: None,
            on_change: None,
        }
    }

    pub fn config(mut self, config: EditorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: impl ContentStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn uploader(mut self, uploader: impl ImageUploader + 'static) -> Self {
        self.uploader = Rc::new(uploader);
        self
    }

    pub fn code_renderer(mut self, renderer: impl CodeRenderer + 'static) -> Self {
        self.renderer = Rc::new(renderer);
        self
    }

    pub fn catalog(mut self, catalog: Vec<SlashItem>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replaces the default "insert paragraph below" action.
    pub fn on_add_block(mut self, handler: impl FnMut(&mut Editor, usize, &str) + 'static) -> Self {
        self.on_add_block = Some(Box::new(handler));
        self
    }

    pub fn on_change(mut self, listener: impl FnMut(&ContentChange) + 'static) -> Self {
        self.on_change = Some(Box::new(listener));
        self
    }

    pub fn build<V: EditorView>(self, mut view: V) -> anyhow::Result<FolioEditor<V>> {
        let config = self.config.validate().context("invalid editor config")?;

        let stored = match (&self.options.storage_key, &self.store) {
            (Some(key), Some(store)) => store
                .load(key)
                .with_context(|| format!("failed to read stored content for {key:?}"))?,
            _ => None,
        };
        let doc = match stored {
            Some(html) => parse_html(&html),
            None => parse_html(&preprocess_math_content(
                &self.options.content,
                config.tag_lookback_chars,
            )),
        };

        let mut editor = Editor::with_document(doc);
        editor.set_editable(self.options.editable);
        view.sync(editor.doc(), editor.registry());
        let mut node_views = NodeViews::new(&config, self.renderer);
        node_views.sync(editor.doc());

        let mut this = FolioEditor {
            controls: BlockControls::new(&config),
            slash: SlashTracker::new(config.trigger_char, config.max_suggestions, self.catalog),
            editor,
            view,
            node_views,
            config,
            storage_key: self.options.storage_key,
            store: self.store,
            uploader: self.uploader,
            on_add_block: self.on_add_block,
            on_change: self.on_change,
            migration_pending: false,
        };
        this.process_events();
        Ok(this)
    }
}

/// An editor mounted on a view, with every surface controller wired to its events.
///
/// The host forwards input through the methods here and calls [`FolioEditor::tick`] on a
/// timer. The post-mount math migration runs on the first tick.
pub struct FolioEditor<V: EditorView> {
    editor: Editor,
    view: V,
    config: EditorConfig,
    controls: BlockControls,
    node_views: NodeViews,
    slash: SlashTracker,
    storage_key: Option<String>,
    store: Option<Box<dyn ContentStore>>,
    uploader: Rc<dyn ImageUploader>,
    on_add_block: Option<AddBlockHandler>,
    on_change: Option<ChangeListener>,
    migration_pending: bool,
}

impl<V: EditorView> FolioEditor<V> {
    pub fn new(view: V, options: EditorOptions) -> anyhow::Result<Self> {
        FolioEditorBuilder::new(options).build(view)
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn controls(&self) -> &BlockControls {
        &self.controls
    }

    pub fn node_views(&self) -> &NodeViews {
        &self.node_views
    }

    pub fn slash_session(&self) -> Option<&SuggestionSession> {
        self.slash.session()
    }

    pub fn is_migration_pending(&self) -> bool {
        self.migration_pending
    }

    pub fn html(&self) -> Result<String, HtmlError> {
        to_html(self.editor.doc())
    }

    pub fn text(&self) -> String {
        to_text(self.editor.doc())
    }

    pub fn set_editable(&mut self, editable: bool) {
        self.editor.set_editable(editable);
        self.process_events();
    }

    /// Host-driven content replacement. Legacy delimiters are rewritten only when the markup
    /// carries no canonical math yet. Never emits a change.
    pub fn set_content(&mut self, markup: &str) -> bool {
        let has_canonical = markup.contains(r#"data-type="inline-math""#)
            || markup.contains(r#"data-type="block-math""#);
        let markup = if !has_canonical && has_legacy_math(markup) {
            preprocess_math_content(markup, self.config.tag_lookback_chars)
        } else {
            Cow::Borrowed(markup)
        };
        let next = parse_html(&markup);
        if &next == self.editor.doc() {
            return false;
        }
        if let Err(err) = self.editor.set_content(next, true) {
            tracing::warn!(%err, "failed to replace content");
            return false;
        }
        self.node_views.reset();
        self.process_events();
        true
    }

    /// Drains engine events and brings every controller up to date.
    pub fn process_events(&mut self) {
        for event in self.editor.take_events() {
            self.handle_event(event);
        }
        self.slash.update(&self.editor);
    }

    fn handle_event(&mut self, event: EditorEvent) {
        match event {
            EditorEvent::Create => {
                refresh_block_tags(&self.editor, &mut self.view);
                self.migration_pending = true;
            }
            EditorEvent::Transaction {
                source,
                doc_changed: true,
            } => {
                tracing::trace!(source = source.as_deref().unwrap_or("-"), "transaction");
                self.view.sync(self.editor.doc(), self.editor.registry());
                self.node_views.sync(self.editor.doc());
                refresh_block_tags(&self.editor, &mut self.view);
                self.controls.refresh_geometry(&mut self.view);
            }
            EditorEvent::Transaction { .. } => {}
            EditorEvent::SelectionUpdate => {
                refresh_block_tags(&self.editor, &mut self.view);
                self.controls.selection_changed(&self.editor, &mut self.view);
            }
            EditorEvent::Update => self.emit_change(),
        }
    }

    fn emit_change(&mut self) {
        let html = match to_html(self.editor.doc()) {
            Ok(html) => html,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize content");
                return;
            }
        };
        if let (Some(key), Some(store)) = (&self.storage_key, self.store.as_mut()) {
            if let Err(err) = store.save(key, &html) {
                tracing::warn!(key = key.as_str(), %err, "failed to persist content");
            }
        }
        if let Some(listener) = self.on_change.as_mut() {
            let text = to_text(self.editor.doc());
            listener(&ContentChange { html, text });
        }
    }

    /// Advances timers. The first call after mount also runs the math migration.
    pub fn tick(&mut self, now: u64) {
        if std::mem::take(&mut self.migration_pending) {
            self.migrate_math();
        }
        self.controls.tick(&mut self.view, now);
        for image in self.node_views.images_mut() {
            image.tick(now);
        }
        self.process_events();
    }

    fn migrate_math(&mut self) {
        if let Err(err) = canonicalize_dollars(&mut self.editor) {
            tracing::warn!(%err, "inline dollar canonicalization failed");
        }
        match migrate_editor(&mut self.editor, self.config.tag_lookback_chars) {
            Ok(true) => {
                self.node_views.reset();
                tracing::debug!("post-mount math migration applied");
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(%err, "post-mount math migration failed"),
        }
    }

    pub fn run_command(&mut self, id: &str, args: Option<Value>) -> bool {
        if !self.editor.is_editable() {
            return false;
        }
        let ok = match self.editor.run_command(id, args) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(command = id, error = err.message(), "command failed");
                false
            }
        };
        self.process_events();
        ok
    }

    pub fn insert_text(&mut self, text: &str) -> bool {
        self.run_command("core.insert_text", Some(json!({ "text": text })))
    }

    pub fn set_selection(&mut self, selection: folio_core::Selection) {
        self.editor.set_selection(selection);
        self.process_events();
    }

    pub fn undo(&mut self) -> bool {
        let undone = self.editor.is_editable() && self.editor.undo();
        self.process_events();
        undone
    }

    pub fn redo(&mut self) -> bool {
        let redone = self.editor.is_editable() && self.editor.redo();
        self.process_events();
        redone
    }

    pub fn pointer_move(&mut self, x: f32, y: f32, now: u64) {
        let target = self.view.element_at(x, y);
        self.controls
            .pointer_move(&self.editor, &mut self.view, target, now);
    }

    pub fn pointer_leave(&mut self, now: u64) {
        self.controls.pointer_leave(now);
    }

    pub fn enter_controls(&mut self) {
        self.controls.enter_controls();
    }

    pub fn leave_controls(&mut self, now: u64) {
        self.controls.leave_controls(now);
    }

    pub fn overlay_position(&self) -> Option<OverlayPosition> {
        self.controls.overlay_position(&self.editor, &self.view)
    }

    pub fn insert_below(&mut self) -> bool {
        let inserted = self.controls.insert_below(
            &mut self.editor,
            &mut self.view,
            self.on_add_block.as_mut(),
        );
        self.process_events();
        inserted
    }

    pub fn drag_start(&mut self) -> Option<DragPayload> {
        let payload = self.controls.drag_start(&mut self.editor, &mut self.view);
        self.process_events();
        payload
    }

    pub fn drop_at(&mut self, to: usize) -> bool {
        let dropped = self.controls.drop_at(&mut self.editor, to);
        self.process_events();
        dropped
    }

    pub fn drag_end(&mut self, now: u64) {
        self.controls.drag_end(&mut self.view, now);
    }

    /// Routes a key to the open slash popup. `Ignored` means the key belongs to the document.
    pub fn slash_key(&mut self, key: SlashKey) -> KeyOutcome {
        self.slash.key(key)
    }

    pub fn slash_hover(&mut self, index: usize) {
        self.slash.hover(index);
    }

    pub fn slash_click(&mut self, index: usize) -> KeyOutcome {
        self.slash.click(index)
    }

    /// Runs a picked slash item. An `UploadRequested` outcome is finished by handing the
    /// file to [`FolioEditor::insert_image_file`].
    pub fn perform_slash(
        &mut self,
        selection: &SlashSelection,
        host: &mut dyn SlashHost,
    ) -> SlashOutcome {
        let outcome = perform(&mut self.editor, host, selection);
        self.process_events();
        outcome
    }

    pub fn image_action(&mut self, path: &[usize], action: ImageAction) -> bool {
        let Some(image) = self.node_views.image_at_mut(path) else {
            tracing::debug!(?path, "no image view at path");
            return false;
        };
        let applied = image.apply(&mut self.editor, &mut self.view, action);
        self.process_events();
        applied
    }

    /// Starts replacing the image at `path` with `file`.
    pub fn replace_image(
        &mut self,
        path: &[usize],
        file: ImageFile,
        now: u64,
    ) -> Option<PendingUpload> {
        let image = self.node_views.image_at_mut(path)?;
        image.begin_upload(&self.editor, self.uploader.as_ref(), file, now)
    }

    /// Starts uploading `file` as a new image at the caret.
    pub fn insert_image_file(&mut self, file: ImageFile) -> Option<PendingUpload> {
        if !self.editor.is_editable() {
            return None;
        }
        let name = file.name.clone();
        Some(PendingUpload::new(
            UploadTarget::Insert,
            name,
            self.uploader.upload(file),
        ))
    }

    /// Applies a finished upload. Results for images that were removed meanwhile, or that
    /// arrive while the editor is read-only, are dropped.
    pub fn complete_upload(&mut self, completed: CompletedUpload, now: u64) -> bool {
        let CompletedUpload {
            target,
            file_name,
            result,
        } = completed;
        let applied = match target {
            UploadTarget::Replace(id) => match self.node_views.image_mut(id) {
                Some(image) if self.editor.is_editable() => {
                    image.finish_upload(&mut self.editor, &file_name, result, now)
                }
                Some(_) => false,
                None => {
                    tracing::debug!(
                        file = file_name.as_str(),
                        "upload finished after its image was removed"
                    );
                    false
                }
            },
            UploadTarget::Insert => match result {
                Ok(_) if !self.editor.is_editable() => false,
                Ok(src) => match self.editor.run_command(
                    "image.insert",
                    Some(json!({ "src": src, "alt": file_name })),
                ) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(error = err.message(), "failed to insert uploaded image");
                        false
                    }
                },
                Err(err) => {
                    tracing::warn!(file = file_name.as_str(), %err, "image upload failed");
                    false
                }
            },
        };
        self.process_events();
        applied
    }

    pub fn click_math(&mut self, path: &[usize], prompter: &mut dyn Prompter) -> bool {
        let Some(math) = self.node_views.math_at(path) else {
            return false;
        };
        let updated = math.click(&mut self.editor, prompter);
        self.process_events();
        updated
    }

    pub fn render_node(&self, path: &[usize]) -> Option<String> {
        self.node_views.at_path(path).map(|view| view.render())
    }

    pub fn document(&self) -> &Document {
        self.editor.doc()
    }
}
