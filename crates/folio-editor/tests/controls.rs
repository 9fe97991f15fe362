use std::cell::RefCell;
use std::rc::Rc;

use folio_core::{Attrs, Document, Editor, Node};
use folio_editor::{
    BLOCK_NODE_CLASS, CONTROLS_CLASS, EditorConfig, EditorOptions, EditorView, FolioEditor,
    FolioEditorBuilder, HeadlessView, OverlayPosition, RefreshReport, refresh_block_tags,
};
use proptest::prelude::*;
use serde_json::json;

fn mount(markup: &str) -> FolioEditor<HeadlessView> {
    FolioEditor::new(HeadlessView::default(), EditorOptions::new(markup)).unwrap()
}

fn marked_elements(editor: &FolioEditor<HeadlessView>) -> usize {
    let view = editor.view();
    view.elements()
        .into_iter()
        .filter(|id| view.has_class(*id, CONTROLS_CLASS))
        .count()
}

#[test]
fn tracker_tags_every_block_with_kind_and_position() {
    let editor = Editor::with_document(Document::new(vec![
        Node::paragraph("a"),
        Node::element(
            "blockquote",
            Attrs::default(),
            vec![Node::paragraph("q")],
        ),
        Node::image("i.png", None),
    ]));
    let mut view = HeadlessView::default();
    view.sync(editor.doc(), editor.registry());

    let report = refresh_block_tags(&editor, &mut view);
    assert_eq!(report, RefreshReport { tagged: 4, skipped: 0 });

    let inner = view.element_for_path(&[1, 0]).unwrap();
    let tag = view.block_tag(inner).unwrap();
    assert_eq!(tag.node_type, "paragraph");
    assert_eq!(tag.position, 4);
    assert!(view.has_class(inner, BLOCK_NODE_CLASS));

    let image = view.element_for_path(&[2]).unwrap();
    assert_eq!(view.block_tag(image).unwrap().position, 8);
}

#[test]
fn tracker_leaves_inline_nodes_untagged() {
    let editor = Editor::with_document(Document::new(vec![Node::element(
        "paragraph",
        Attrs::default(),
        vec![Node::text("a "), Node::inline_math("x"), Node::text(" b")],
    )]));
    let mut view = HeadlessView::default();
    view.sync(editor.doc(), editor.registry());

    let report = refresh_block_tags(&editor, &mut view);
    assert_eq!(report, RefreshReport { tagged: 1, skipped: 0 });
    let paragraph = view.element_for_path(&[0]).unwrap();
    assert_eq!(view.block_tag(paragraph).unwrap().node_type, "paragraph");
}

#[test]
fn tracker_writes_nothing_when_positions_are_unchanged() {
    let editor = Editor::with_document(Document::new(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));
    let mut view = HeadlessView::default();
    view.sync(editor.doc(), editor.registry());

    refresh_block_tags(&editor, &mut view);
    let writes = view.tag_writes();
    refresh_block_tags(&editor, &mut view);
    assert_eq!(view.tag_writes(), writes);
}

#[test]
fn tracker_skips_blocks_a_stale_view_cannot_map() {
    let mut editor = Editor::with_document(Document::new(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));
    let mut view = HeadlessView::default();
    view.sync(editor.doc(), editor.registry());

    editor
        .run_command("block.insert_paragraph_at", Some(json!({ "pos": 3 })))
        .unwrap();
    let report = refresh_block_tags(&editor, &mut view);
    assert_eq!(report, RefreshReport { tagged: 2, skipped: 1 });

    view.sync(editor.doc(), editor.registry());
    let report = refresh_block_tags(&editor, &mut view);
    assert_eq!(report, RefreshReport { tagged: 3, skipped: 0 });
}

#[test]
fn hover_moves_between_blocks_without_hiding() {
    let mut editor = mount("<p>a</p><p>b</p>");
    let first = editor.view().element_for_path(&[0]).unwrap();
    let second = editor.view().element_for_path(&[1]).unwrap();

    editor.pointer_move(100.0, 10.0, 0);
    assert_eq!(editor.controls().hover().unwrap().element, first);

    editor.pointer_move(100.0, 40.0, 5);
    let hover = editor.controls().hover().unwrap();
    assert_eq!(hover.element, second);
    assert_eq!(hover.position, 3);
    assert!(!editor.controls().is_hide_pending());
    assert!(!editor.view().has_class(first, CONTROLS_CLASS));
    assert!(editor.view().has_class(second, CONTROLS_CLASS));

    editor.tick(10_000);
    assert_eq!(editor.controls().hover().unwrap().element, second);
}

#[test]
fn leaving_blocks_hides_after_the_grace_period() {
    let mut editor = mount("<p>a</p><p>b</p>");
    editor.pointer_move(100.0, 10.0, 0);

    // The gap between the two paragraphs.
    editor.pointer_move(100.0, 28.0, 100);
    assert!(editor.controls().is_hide_pending());

    editor.tick(279);
    assert!(editor.controls().hover().is_some());
    editor.tick(280);
    assert!(editor.controls().hover().is_none());
    assert_eq!(marked_elements(&editor), 0);
}

#[test]
fn hovering_the_controls_keeps_them_open() {
    let mut editor = mount("<p>a</p><p>b</p>");
    editor.pointer_move(100.0, 10.0, 0);
    editor.pointer_leave(10);
    editor.enter_controls();
    assert!(!editor.controls().is_hide_pending());

    editor.pointer_move(100.0, 28.0, 20);
    editor.tick(1_000);
    assert!(editor.controls().hover().is_some());

    editor.leave_controls(1_000);
    editor.tick(1_180);
    assert!(editor.controls().hover().is_none());
}

#[test]
fn overlay_sits_left_of_the_block_and_hides_when_read_only() {
    let mut editor = mount("<p>a</p>");
    assert_eq!(editor.overlay_position(), None);

    editor.pointer_move(100.0, 10.0, 0);
    assert_eq!(
        editor.overlay_position(),
        Some(OverlayPosition {
            top: 12.0,
            left: 12.0,
        })
    );

    editor.set_editable(false);
    assert_eq!(editor.overlay_position(), None);
    editor.pointer_move(100.0, 10.0, 10);
    assert!(editor.controls().hover().is_none());
}

#[test]
fn caret_movement_attaches_the_controls() {
    let mut editor = mount("<p>a</p><p>b</p>");
    let second = editor.view().element_for_path(&[1]).unwrap();
    editor.set_selection(folio_core::Selection::collapsed(folio_core::Point::new(
        vec![1, 0],
        1,
    )));
    assert_eq!(editor.controls().hover().unwrap().element, second);
}

#[test]
fn insert_below_adds_a_paragraph_after_the_hovered_block() {
    let mut editor = mount("<p>a</p><p>b</p>");
    editor.pointer_move(100.0, 10.0, 0);

    assert!(editor.insert_below());
    assert_eq!(
        editor.document().children,
        vec![
            Node::paragraph("a"),
            Node::paragraph(""),
            Node::paragraph("b")
        ]
    );
    assert_eq!(editor.editor().selection().focus.path, vec![1, 0]);
    assert!(editor.view().has_focus());
}

#[test]
fn insert_below_defers_to_the_add_block_handler() {
    let calls: Rc<RefCell<Vec<(usize, String)>>> = Rc::default();
    let seen = Rc::clone(&calls);
    let mut editor = FolioEditorBuilder::new(EditorOptions::new("<p>a</p><h2>b</h2>"))
        .on_add_block(move |_editor, pos, node_type| {
            seen.borrow_mut().push((pos, node_type.to_string()));
        })
        .build(HeadlessView::default())
        .unwrap();

    editor.pointer_move(100.0, 40.0, 0);
    assert!(editor.insert_below());
    assert_eq!(*calls.borrow(), vec![(6, "heading".to_string())]);
    assert_eq!(editor.document().children.len(), 2);
}

#[test]
fn dragging_a_block_moves_it() {
    let mut editor = mount("<p>a</p><p>b</p>");
    editor.pointer_move(100.0, 40.0, 0);

    let payload = editor.drag_start().unwrap();
    assert_eq!(payload.node_type, "paragraph");
    assert_eq!(payload.position, 3);
    assert_eq!(payload.text, "b");
    assert!(editor.controls().is_dragging());
    assert_eq!(editor.editor().node_selection(), Some(&vec![1]));

    assert!(editor.drop_at(0));
    editor.drag_end(10);
    assert_eq!(
        editor.document().children,
        vec![Node::paragraph("b"), Node::paragraph("a")]
    );
    assert!(!editor.controls().is_dragging());
}

#[test]
fn nested_blocks_resolve_to_the_innermost_element() {
    let mut editor = mount("<p>a</p><blockquote><p>q</p></blockquote>");
    let quote = editor.view().element_for_path(&[1]).unwrap();
    let inner = editor.view().element_for_path(&[1, 0]).unwrap();

    editor.pointer_move(100.0, 50.0, 0);
    assert_eq!(editor.controls().hover().unwrap().element, inner);

    editor.pointer_move(60.0, 34.0, 5);
    assert_eq!(editor.controls().hover().unwrap().element, quote);
    assert_eq!(marked_elements(&editor), 1);
}

#[test]
fn config_changes_the_grace_period() {
    let config = EditorConfig {
        hide_delay_ms: 50,
        ..EditorConfig::default()
    };
    let mut editor = FolioEditorBuilder::new(EditorOptions::new("<p>a</p>"))
        .config(config)
        .build(HeadlessView::default())
        .unwrap();
    editor.pointer_move(100.0, 10.0, 0);
    editor.pointer_leave(0);
    editor.tick(50);
    assert!(editor.controls().hover().is_none());
}

#[derive(Debug, Clone)]
enum PointerStep {
    Move(f32, f32),
    Leave,
    Tick(u64),
}

fn pointer_step() -> impl Strategy<Value = PointerStep> {
    prop_oneof![
        (0.0f32..800.0, 0.0f32..120.0).prop_map(|(x, y)| PointerStep::Move(x, y)),
        Just(PointerStep::Leave),
        (0u64..400).prop_map(PointerStep::Tick),
    ]
}

proptest! {
    #[test]
    fn at_most_one_block_carries_the_controls(steps in prop::collection::vec(pointer_step(), 0..40)) {
        let mut editor = mount("<p>a</p><p>b</p><p>c</p>");
        let mut now = 0;
        for step in steps {
            now += 7;
            match step {
                PointerStep::Move(x, y) => editor.pointer_move(x, y, now),
                PointerStep::Leave => editor.pointer_leave(now),
                PointerStep::Tick(dt) => {
                    now += dt;
                    editor.tick(now);
                }
            }
            let marked = marked_elements(&editor);
            prop_assert!(marked <= 1);
            match editor.controls().hover() {
                Some(hover) => {
                    prop_assert_eq!(marked, 1);
                    prop_assert!(editor.view().has_class(hover.element, CONTROLS_CLASS));
                }
                None => prop_assert_eq!(marked, 0),
            }
        }
    }
}
