use std::cell::RefCell;
use std::rc::Rc;

use folio_core::Node;
use folio_editor::{
    ContentChange, ContentStore, EditorConfig, EditorOptions, FileStore, FolioEditor,
    FolioEditorBuilder, HeadlessView, MemoryStore,
};

fn mount(markup: &str) -> FolioEditor<HeadlessView> {
    FolioEditor::new(HeadlessView::default(), EditorOptions::new(markup)).unwrap()
}

fn recorder() -> (
    Rc<RefCell<Vec<ContentChange>>>,
    impl FnMut(&ContentChange) + 'static,
) {
    let changes: Rc<RefCell<Vec<ContentChange>>> = Rc::default();
    let sink = Rc::clone(&changes);
    (changes, move |change: &ContentChange| {
        sink.borrow_mut().push(change.clone())
    })
}

#[test]
fn content_input_is_preprocessed_on_mount() {
    let editor = mount(r"<p>see \(a+b\)</p>");
    assert_eq!(
        editor.html().unwrap(),
        r#"<p>see <span data-type="inline-math" data-latex="a+b"></span></p>"#
    );
    assert!(editor.is_migration_pending());
}

#[test]
fn stored_content_wins_over_the_content_input() {
    let store = MemoryStore::new().with_entry("note", "<p>from store</p>");
    let editor = FolioEditorBuilder::new(EditorOptions::new("<p>from input</p>").storage_key("note"))
        .store(store)
        .build(HeadlessView::default())
        .unwrap();
    assert_eq!(editor.document().children, vec![Node::paragraph("from store")]);
}

#[test]
fn edits_emit_changes_and_persist() {
    let path = std::env::temp_dir().join(format!("folio-editor-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let (changes, listener) = recorder();
    let mut editor = FolioEditorBuilder::new(EditorOptions::new("<p>hi</p>").storage_key("draft"))
        .store(FileStore::open(&path).unwrap())
        .on_change(listener)
        .build(HeadlessView::default())
        .unwrap();
    editor.tick(0);
    assert!(changes.borrow().is_empty());

    editor.set_selection(folio_core::Selection::collapsed(folio_core::Point::new(
        vec![0, 0],
        2,
    )));
    assert!(editor.insert_text("!"));
    assert_eq!(
        *changes.borrow(),
        vec![ContentChange {
            html: "<p>hi!</p>".to_string(),
            text: "hi!".to_string(),
        }]
    );

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.load("draft").unwrap().as_deref(), Some("<p>hi!</p>"));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn post_mount_migration_runs_on_the_first_tick_without_emitting() {
    let (changes, listener) = recorder();
    let mut editor = FolioEditorBuilder::new(EditorOptions::new("<p>cost $x$ here</p>"))
        .on_change(listener)
        .build(HeadlessView::default())
        .unwrap();
    assert_eq!(editor.document().children, vec![Node::paragraph("cost $x$ here")]);

    editor.tick(0);
    assert!(!editor.is_migration_pending());
    assert_eq!(
        editor.html().unwrap(),
        r#"<p>cost <span data-type="inline-math" data-latex="x"></span> here</p>"#
    );
    assert!(changes.borrow().is_empty());
}

#[test]
fn stored_legacy_math_is_migrated_after_mount() {
    let store = MemoryStore::new().with_entry("note", r"<p>\[y\]</p>");
    let mut editor = FolioEditorBuilder::new(EditorOptions::default().storage_key("note"))
        .store(store)
        .build(HeadlessView::default())
        .unwrap();
    assert_eq!(editor.text(), r"\[y\]");

    editor.tick(0);
    assert!(editor.document().children.contains(&Node::block_math("y")));
    assert!(!editor.text().contains(r"\["));
}

#[test]
fn host_set_content_is_silent_and_skips_identical_content() {
    let (changes, listener) = recorder();
    let mut editor = FolioEditorBuilder::new(EditorOptions::new("<p>one</p>"))
        .on_change(listener)
        .build(HeadlessView::default())
        .unwrap();

    assert!(!editor.set_content("<p>one</p>"));
    assert!(editor.set_content(r"<p>two \(z\)</p>"));
    assert_eq!(
        editor.html().unwrap(),
        r#"<p>two <span data-type="inline-math" data-latex="z"></span></p>"#
    );
    assert!(changes.borrow().is_empty());
}

#[test]
fn clicking_math_prompts_with_the_current_latex() {
    let mut editor = mount(r#"<p>a <span data-type="inline-math" data-latex="x"></span></p>"#);
    assert!(editor.render_node(&[0, 1]).unwrap().contains("<math"));

    let mut seen = Vec::new();
    let mut prompter = |message: &str, default: &str| -> Option<String> {
        seen.push((message.to_string(), default.to_string()));
        Some(" y^2 ".to_string())
    };
    assert!(editor.click_math(&[0, 1], &mut prompter));
    assert_eq!(
        seen,
        vec![("Enter new calculation:".to_string(), "x".to_string())]
    );
    assert_eq!(
        editor.html().unwrap(),
        r#"<p>a <span data-type="inline-math" data-latex="y^2"></span></p>"#
    );

    let mut cancel = |_: &str, _: &str| -> Option<String> { None };
    assert!(!editor.click_math(&[0, 1], &mut cancel));
}

#[test]
fn code_blocks_render_highlighted() {
    let editor = mount(r#"<pre><code class="language-rust">fn main() {}</code></pre>"#);
    let html = editor.render_node(&[0]).unwrap();
    assert!(html.starts_with(r#"<pre class="code-block"><code class="language-rust">"#));
}

#[test]
fn read_only_editor_rejects_edits() {
    let mut editor = FolioEditor::new(
        HeadlessView::default(),
        EditorOptions::new("<p>fixed</p>").editable(false),
    )
    .unwrap();
    assert!(!editor.insert_text("/"));
    assert!(editor.slash_session().is_none());
    assert_eq!(editor.document().children, vec![Node::paragraph("fixed")]);

    editor.set_editable(true);
    assert!(editor.insert_text("/"));
    assert!(editor.slash_session().is_some());
}

#[test]
fn invalid_config_fails_the_build() {
    let config = EditorConfig {
        max_suggestions: 0,
        ..EditorConfig::default()
    };
    let built = FolioEditorBuilder::new(EditorOptions::default())
        .config(config)
        .build(HeadlessView::default());
    assert!(built.is_err());
}
