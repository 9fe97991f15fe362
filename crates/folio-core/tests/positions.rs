use folio_core::position::{
    content_size, descendants, node_at_pos, point_to_pos, pos_to_point, position_after,
    position_of, resolve,
};
use folio_core::{Attrs, Document, Node, Point};
use proptest::prelude::*;

#[test]
fn nested_blocks_resolve_inside_container() {
    let doc = Document::new(vec![
        Node::element(
            "blockquote",
            Attrs::default(),
            vec![Node::paragraph("ab"), Node::paragraph("c")],
        ),
        Node::paragraph("d"),
    ]);

    // blockquote: 1 + (4 + 3) + 1
    assert_eq!(position_after(&doc, &[0]), Some(9));
    assert_eq!(position_of(&doc, &[0, 1]), Some(5));
    assert_eq!(content_size(&doc), 12);

    let resolved = resolve(&doc, 5).unwrap();
    assert_eq!(resolved.parent_path, vec![0]);
    assert_eq!(resolved.index, 1);
    assert_eq!(resolved.depth(), 1);

    let (path, node) = node_at_pos(&doc, 5).unwrap();
    assert_eq!(path, vec![0, 1]);
    assert_eq!(node.text_content(), "c");

    let starts: Vec<usize> = descendants(&doc).iter().map(|(_, d)| d.pos).collect();
    assert_eq!(starts, vec![0, 1, 2, 5, 6, 9, 10]);
}

#[test]
fn positions_between_leaves_prefer_preceding_text() {
    let doc = Document::new(vec![Node::element(
        "paragraph",
        Attrs::default(),
        vec![Node::text("a"), Node::inline_math("x"), Node::text("b")],
    )]);

    assert_eq!(pos_to_point(&doc, 2), Some(Point::new(vec![0, 0], 1)));
    assert_eq!(pos_to_point(&doc, 3), Some(Point::new(vec![0, 2], 0)));
    assert_eq!(pos_to_point(&doc, 5), None);
}

fn paragraphs() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z ]{0,12}", 1..6)
}

proptest! {
    #[test]
    fn text_points_survive_position_round_trip(texts in paragraphs(), pick in any::<prop::sample::Index>()) {
        let doc = Document::new(texts.iter().map(|t| Node::paragraph(t.as_str())).collect());
        let points: Vec<Point> = texts
            .iter()
            .enumerate()
            .flat_map(|(block, text)| {
                (0..=text.len()).map(move |offset| Point::new(vec![block, 0], offset))
            })
            .collect();
        let point = &points[pick.index(points.len())];

        let pos = point_to_pos(&doc, point).unwrap();
        prop_assert!(pos <= content_size(&doc));
        prop_assert_eq!(pos_to_point(&doc, pos), Some(point.clone()));
    }
}
