use folio_core::{
    Attrs, Document, Editor, Marks, Node, Point, Selection, TextNode,
};
use serde_json::json;

fn element(node: &Node) -> &folio_core::ElementNode {
    let Node::Element(el) = node else {
        panic!("expected element, got {node:?}");
    };
    el
}

fn void(node: &Node) -> &folio_core::VoidNode {
    let Node::Void(v) = node else {
        panic!("expected void, got {node:?}");
    };
    v
}

#[test]
fn heading_commands_and_query() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("Hello")]));
    assert_eq!(
        editor
            .run_query::<Option<u64>>("block.heading_level", None)
            .unwrap(),
        None
    );

    editor
        .run_command("block.set_heading", Some(json!({ "level": 2 })))
        .unwrap();
    assert_eq!(editor.doc().children[0], Node::heading(2, "Hello"));
    assert_eq!(
        editor
            .run_query::<Option<u64>>("block.heading_level", None)
            .unwrap(),
        Some(2)
    );

    editor
        .run_command("block.set_heading", Some(json!({ "level": 9 })))
        .unwrap();
    assert_eq!(editor.doc().children[0], Node::heading(3, "Hello"));

    editor.run_command("block.set_paragraph", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::paragraph("Hello"));
    assert_eq!(
        editor
            .run_query::<Option<String>>("block.active_kind", None)
            .unwrap(),
        Some("paragraph".to_string())
    );
}

#[test]
fn list_toggles_between_types_and_back() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("item")]));

    editor.run_command("list.toggle_bulleted", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::list_item("bulleted", "item"));
    assert_eq!(
        editor
            .run_query::<Option<String>>("list.active_type", None)
            .unwrap(),
        Some("bulleted".to_string())
    );

    editor.run_command("list.toggle_task", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::list_item("task", "item"));

    editor
        .run_command("task.toggle_checked", Some(json!({ "path": [0] })))
        .unwrap();
    assert_eq!(
        element(&editor.doc().children[0]).attrs.get("checked"),
        Some(&json!(true))
    );

    editor.run_command("list.toggle_ordered", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::list_item("ordered", "item"));

    editor.run_command("list.toggle_ordered", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::paragraph("item"));
}

#[test]
fn lists_are_refused_inside_code() {
    let mut editor = Editor::with_document(Document::new(vec![Node::code_block(None, "x")]));
    assert!(editor.run_command("list.toggle_bulleted", None).is_err());
    assert_eq!(editor.doc().children[0], Node::code_block(None, "x"));
}

#[test]
fn bold_toggles_over_range_and_reports_active_marks() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("hello world")]));
    editor.set_selection(Selection {
        anchor: Point::new(vec![0, 0], 0),
        focus: Point::new(vec![0, 0], 5),
    });

    editor.run_command("marks.toggle_bold", None).unwrap();

    let block = element(&editor.doc().children[0]);
    assert_eq!(
        block.children,
        vec![
            Node::Text(TextNode {
                text: "hello".to_string(),
                marks: Marks {
                    bold: true,
                    ..Marks::default()
                },
            }),
            Node::text(" world"),
        ]
    );
    let active: Marks = editor.run_query("marks.get_active", None).unwrap();
    assert!(active.bold);
}

#[test]
fn highlight_carries_color_and_can_be_removed() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("hi")]));
    editor.set_selection(Selection {
        anchor: Point::new(vec![0, 0], 0),
        focus: Point::new(vec![0, 0], 2),
    });

    editor
        .run_command("marks.set_highlight", Some(json!({ "color": "#fff59d" })))
        .unwrap();
    let active: Marks = editor.run_query("marks.get_active", None).unwrap();
    assert!(active.highlight);
    assert_eq!(active.highlight_color.as_deref(), Some("#fff59d"));

    editor.run_command("marks.unset_highlight", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::paragraph("hi"));
}

#[test]
fn caret_toggle_marks_next_typed_text() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("ab")]));
    editor.set_selection(Selection::collapsed(Point::new(vec![0, 0], 2)));

    editor.run_command("marks.toggle_italic", None).unwrap();
    editor
        .run_command("core.insert_text", Some(json!({ "text": "c" })))
        .unwrap();

    let block = element(&editor.doc().children[0]);
    assert_eq!(block.children.len(), 2);
    assert_eq!(
        block.children[1],
        Node::Text(TextNode {
            text: "c".to_string(),
            marks: Marks {
                italic: true,
                ..Marks::default()
            },
        })
    );
}

#[test]
fn code_block_toggle_flattens_inline_math() {
    let mut editor = Editor::with_document(Document::new(vec![Node::element(
        "paragraph",
        Attrs::default(),
        vec![Node::text("a"), Node::inline_math("x"), Node::text("b")],
    )]));

    editor
        .run_command("code_block.toggle", Some(json!({ "language": "rust" })))
        .unwrap();
    assert_eq!(
        editor.doc().children[0],
        Node::code_block(Some("rust"), "a$x$b")
    );
    assert!(
        editor
            .run_query::<bool>("code_block.is_active", None)
            .unwrap()
    );

    editor.run_command("code_block.toggle", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::paragraph("a$x$b"));
}

#[test]
fn blockquote_wraps_and_unwraps() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("quote")]));

    editor.run_command("blockquote.wrap_selection", None).unwrap();
    assert_eq!(editor.doc().children[0].kind(), "blockquote");
    assert_eq!(editor.selection().focus.path, vec![0, 0, 0]);

    editor.run_command("blockquote.unwrap", None).unwrap();
    assert_eq!(editor.doc().children, vec![Node::paragraph("quote")]);
    assert_eq!(editor.selection().focus.path, vec![0, 0]);
}

#[test]
fn insert_paragraph_at_block_boundary() {
    let mut editor = Editor::with_document(Document::new(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));

    editor
        .run_command("block.insert_paragraph_at", Some(json!({ "pos": 3 })))
        .unwrap();
    assert_eq!(
        editor.doc().children,
        vec![
            Node::paragraph("a"),
            Node::paragraph(""),
            Node::paragraph("b")
        ]
    );
    assert_eq!(
        editor.selection(),
        &Selection::collapsed(Point::new(vec![1, 0], 0))
    );

    assert!(
        editor
            .run_command("block.insert_paragraph_at", Some(json!({ "pos": 1 })))
            .is_err()
    );
}

#[test]
fn move_block_reorders_and_keeps_caret_inside() {
    let mut editor = Editor::with_document(Document::new(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
        Node::paragraph("c"),
    ]));

    editor
        .run_command("block.move", Some(json!({ "from": 0, "to": 9 })))
        .unwrap();
    assert_eq!(
        editor.doc().children,
        vec![
            Node::paragraph("b"),
            Node::paragraph("c"),
            Node::paragraph("a")
        ]
    );
    assert_eq!(editor.selection().focus.path, vec![2, 0]);

    editor
        .run_command("block.move", Some(json!({ "from": 6, "to": 0 })))
        .unwrap();
    assert_eq!(editor.doc().text_content(), "abc");
    assert_eq!(editor.selection().focus.path, vec![0, 0]);

    assert!(editor.undo());
    assert_eq!(editor.doc().text_content(), "bca");
}

#[test]
fn move_to_own_boundary_is_a_no_op() {
    let mut editor = Editor::with_document(Document::new(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));

    editor
        .run_command("block.move", Some(json!({ "from": 0, "to": 3 })))
        .unwrap();
    assert_eq!(editor.doc().text_content(), "ab");
    assert!(!editor.can_undo());
}

#[test]
fn delete_range_spans_inline_voids() {
    let mut editor = Editor::with_document(Document::new(vec![Node::element(
        "paragraph",
        Attrs::default(),
        vec![Node::text("a"), Node::inline_math("x"), Node::text("b")],
    )]));

    editor
        .run_command("core.delete_range", Some(json!({ "from": 1, "to": 4 })))
        .unwrap();
    assert_eq!(editor.doc().children, vec![Node::paragraph("")]);
    assert_eq!(
        editor.selection(),
        &Selection::collapsed(Point::new(vec![0, 0], 0))
    );
}

#[test]
fn image_insert_replaces_empty_paragraph() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("")]));

    editor
        .run_command(
            "image.insert",
            Some(json!({ "src": "a.png", "alt": "A" })),
        )
        .unwrap();

    assert_eq!(
        editor.doc().children,
        vec![
            Node::image("a.png", Some("A".to_string())),
            Node::paragraph("")
        ]
    );
    assert_eq!(editor.selection().focus.path, vec![1, 0]);
}

#[test]
fn image_insert_goes_after_non_empty_block() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("hello")]));

    editor
        .run_command("image.insert", Some(json!({ "src": "a.png" })))
        .unwrap();

    assert_eq!(editor.doc().children.len(), 3);
    assert_eq!(editor.doc().children[1].kind(), "image");
    assert_eq!(editor.selection().focus.path, vec![2, 0]);
    assert!(
        editor
            .run_command("image.insert", Some(json!({ "src": "  " })))
            .is_err()
    );
}

#[test]
fn image_attributes_are_clamped() {
    let mut editor = Editor::with_document(Document::new(vec![
        Node::paragraph(""),
        Node::image("a.png", None),
    ]));

    editor
        .set_node_attrs(
            vec![1],
            folio_core::AttrPatch::default()
                .set("width", 10)
                .set("align", "middle"),
            "test",
        )
        .unwrap();
    let image = void(&editor.doc().children[1]);
    assert_eq!(image.attrs.get("width"), Some(&json!(30)));
    assert_eq!(image.attrs.get("align"), Some(&json!("center")));

    editor
        .set_node_attrs(
            vec![1],
            folio_core::AttrPatch::default().set("width", 150),
            "test",
        )
        .unwrap();
    let image = void(&editor.doc().children[1]);
    assert_eq!(image.attrs.get("width"), Some(&json!(100)));
}

#[test]
fn inline_math_splits_text_and_can_be_updated() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("ab")]));
    editor.set_selection(Selection::collapsed(Point::new(vec![0, 0], 1)));

    editor
        .run_command("math.insert_inline", Some(json!({ "latex": " x^2 " })))
        .unwrap();
    let block = element(&editor.doc().children[0]);
    assert_eq!(
        block.children,
        vec![Node::text("a"), Node::inline_math("x^2"), Node::text("b")]
    );
    assert_eq!(
        editor.selection(),
        &Selection::collapsed(Point::new(vec![0, 2], 0))
    );

    editor
        .run_command(
            "math.update",
            Some(json!({ "path": [0, 1], "latex": "y" })),
        )
        .unwrap();
    let block = element(&editor.doc().children[0]);
    assert_eq!(block.children[1], Node::inline_math("y"));

    assert!(
        editor
            .run_command("math.insert_inline", Some(json!({ "latex": "   " })))
            .is_err()
    );
    assert!(
        editor
            .run_command("math.update", Some(json!({ "path": [0, 0], "latex": "z" })))
            .is_err()
    );
}

#[test]
fn block_math_inserts_after_current_block() {
    let mut editor = Editor::with_document(Document::new(vec![Node::paragraph("text")]));

    editor
        .run_command("math.insert_block", Some(json!({ "latex": "\\int x" })))
        .unwrap();

    assert_eq!(
        editor.doc().children,
        vec![
            Node::paragraph("text"),
            Node::block_math("\\int x"),
            Node::paragraph("")
        ]
    );
}
