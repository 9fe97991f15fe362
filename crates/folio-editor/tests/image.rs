use folio_core::Node;
use folio_editor::{
    EditorOptions, EditorView, FolioEditor, FolioEditorBuilder, HeadlessView, ImageAction,
    ImageAlign, ImageAttrs, ImageFile, ImageNodeView, MountedView, NodeView, UploadError,
    UploadFuture, UploadStage,
};
use proptest::prelude::*;

const IMAGE: &str = r#"<img src="a.png" alt="A"><p>after</p>"#;

fn mount(markup: &str) -> FolioEditor<HeadlessView> {
    FolioEditor::new(HeadlessView::default(), EditorOptions::new(markup)).unwrap()
}

fn attrs(editor: &FolioEditor<HeadlessView>) -> ImageAttrs {
    ImageAttrs::from_node(editor.document().node(&[0]).unwrap()).unwrap()
}

fn image_view(editor: &FolioEditor<HeadlessView>) -> &ImageNodeView {
    match editor.node_views().at_path(&[0]) {
        Some(MountedView::Image(view)) => view,
        _ => panic!("no image view at [0]"),
    }
}

#[test]
fn reset_clears_explicit_size_and_keeps_container_width() {
    let mut editor = mount(IMAGE);
    assert_eq!(attrs(&editor).width, 100);
    assert_eq!(attrs(&editor).image_width, None);

    assert!(editor.image_action(&[0], ImageAction::ImageWidth(300)));
    assert_eq!(attrs(&editor).image_width, Some(300));

    assert!(editor.image_action(&[0], ImageAction::ResetSize));
    let after = attrs(&editor);
    assert_eq!(after.image_width, None);
    assert_eq!(after.image_height, None);
    assert_eq!(after.width, 100);
}

#[test]
fn container_width_is_clamped() {
    let mut editor = mount(IMAGE);
    editor.image_action(&[0], ImageAction::ContainerWidth(10));
    assert_eq!(attrs(&editor).width, 30);
    editor.image_action(&[0], ImageAction::ContainerWidth(150));
    assert_eq!(attrs(&editor).width, 100);
    editor.image_action(&[0], ImageAction::ContainerWidth(60));
    assert!(
        editor
            .render_node(&[0])
            .unwrap()
            .contains(r#"style="width: 60%""#)
    );
}

#[test]
fn alignment_is_written_and_rendered() {
    let mut editor = mount(IMAGE);
    assert_eq!(attrs(&editor).align, ImageAlign::Center);
    assert!(editor.image_action(&[0], ImageAction::Align(ImageAlign::Right)));
    assert_eq!(attrs(&editor).align, ImageAlign::Right);
    assert!(
        editor
            .render_node(&[0])
            .unwrap()
            .contains(r#"data-align="right""#)
    );
}

#[test]
fn caption_commits_on_enter_without_line_breaks() {
    let mut editor = mount(IMAGE);
    assert!(editor.image_action(&[0], ImageAction::CaptionInput("Line\r\none".to_string())));
    assert_eq!(image_view(&editor).caption_draft(), "Lineone");
    assert_eq!(attrs(&editor).caption, "");

    assert!(editor.image_action(&[0], ImageAction::CaptionEnter));
    assert_eq!(attrs(&editor).caption, "Lineone");
    assert!(editor.view().has_focus());

    assert!(editor.image_action(&[0], ImageAction::CaptionBlur));
    assert_eq!(attrs(&editor).caption, "Lineone");
}

#[test]
fn remove_deletes_the_node_and_its_view() {
    let mut editor = mount(IMAGE);
    assert!(editor.image_action(&[0], ImageAction::Remove));
    assert_eq!(editor.document().children, vec![Node::paragraph("after")]);
    assert!(editor.node_views().is_empty());
}

#[test]
fn read_only_editor_ignores_image_actions() {
    let mut editor = mount(IMAGE);
    editor.set_editable(false);
    assert!(!editor.image_action(&[0], ImageAction::ContainerWidth(50)));
    assert!(!editor.image_action(&[0], ImageAction::Remove));
    assert_eq!(attrs(&editor).width, 100);
    assert!(
        editor
            .replace_image(&[0], ImageFile::new("b.png", vec![1]), 0)
            .is_none()
    );
}

#[test]
fn replacing_an_image_walks_through_the_upload_stages() {
    let mut editor = mount(IMAGE);
    let pending = editor
        .replace_image(&[0], ImageFile::new("b.png", vec![1, 2, 3]), 0)
        .unwrap();
    assert_eq!(image_view(&editor).stage(), UploadStage::Started { since_ms: 0 });
    assert!(
        editor
            .render_node(&[0])
            .unwrap()
            .contains(r#"data-progress="15">Uploading…"#)
    );

    editor.tick(800);
    assert_eq!(image_view(&editor).stage(), UploadStage::NearComplete);

    let completed = pollster::block_on(pending.wait());
    assert!(editor.complete_upload(completed, 900));
    let after = attrs(&editor);
    assert_eq!(after.src, "data:image/png;base64,AQID");
    assert_eq!(after.alt.as_deref(), Some("b.png"));
    assert_eq!(
        image_view(&editor).stage(),
        UploadStage::Settled { until_ms: 1_200 }
    );
    assert_eq!(image_view(&editor).stage().label(), Some("Processing…"));

    editor.tick(1_200);
    assert_eq!(image_view(&editor).stage(), UploadStage::Idle);
}

#[test]
fn failed_upload_keeps_the_current_image() {
    let mut editor = FolioEditorBuilder::new(EditorOptions::new(IMAGE))
        .uploader(|file: ImageFile| -> UploadFuture {
            Box::pin(async move { Err(UploadError::Rejected(file.name)) })
        })
        .build(HeadlessView::default())
        .unwrap();

    let pending = editor
        .replace_image(&[0], ImageFile::new("b.png", vec![1]), 0)
        .unwrap();
    let completed = pollster::block_on(pending.wait());
    assert!(!editor.complete_upload(completed, 10));
    assert_eq!(attrs(&editor).src, "a.png");
    assert_eq!(
        image_view(&editor).stage(),
        UploadStage::Settled { until_ms: 310 }
    );
}

#[test]
fn upload_finishing_after_removal_is_discarded() {
    let mut editor = mount(IMAGE);
    let pending = editor
        .replace_image(&[0], ImageFile::new("b.png", vec![1]), 0)
        .unwrap();
    assert!(editor.image_action(&[0], ImageAction::Remove));

    let completed = pollster::block_on(pending.wait());
    assert!(!editor.complete_upload(completed, 10));
    assert_eq!(editor.document().children, vec![Node::paragraph("after")]);
}

#[test]
fn upload_finishing_after_content_swap_is_discarded() {
    let mut editor = mount(IMAGE);
    let pending = editor
        .replace_image(&[0], ImageFile::new("b.png", vec![1]), 0)
        .unwrap();
    assert!(editor.set_content("<p>fresh</p>"));

    let completed = pollster::block_on(pending.wait());
    assert!(!editor.complete_upload(completed, 10));
    assert_eq!(editor.document().children, vec![Node::paragraph("fresh")]);
}

#[test]
fn upload_finishing_after_swap_to_another_image_is_discarded() {
    let mut editor = mount(IMAGE);
    let pending = editor
        .replace_image(&[0], ImageFile::new("b.png", vec![1]), 0)
        .unwrap();
    assert!(editor.set_content(r#"<img src="other.png" alt="Other"><p>new doc</p>"#));
    assert_eq!(image_view(&editor).stage(), UploadStage::Idle);

    let completed = pollster::block_on(pending.wait());
    assert!(!editor.complete_upload(completed, 10));
    let after = attrs(&editor);
    assert_eq!(after.src, "other.png");
    assert_eq!(after.alt.as_deref(), Some("Other"));
}

#[test]
fn uploaded_file_is_inserted_at_the_caret() {
    let mut editor = mount("<p></p>");
    let pending = editor
        .insert_image_file(ImageFile::new("c.gif", vec![0xff]))
        .unwrap();
    let completed = pollster::block_on(pending.wait());
    assert!(editor.complete_upload(completed, 0));
    assert_eq!(
        editor.document().children,
        vec![
            Node::image("data:image/gif;base64,/w==", Some("c.gif".to_string())),
            Node::paragraph("")
        ]
    );
    assert_eq!(editor.node_views().len(), 1);
    assert_eq!(
        editor.node_views().iter().next().map(|view| view.path().to_vec()),
        Some(vec![0])
    );
}

#[test]
fn empty_files_are_rejected_by_the_default_uploader() {
    let mut editor = mount("<p></p>");
    let pending = editor
        .insert_image_file(ImageFile::new("empty.png", Vec::new()))
        .unwrap();
    let completed = pollster::block_on(pending.wait());
    assert!(matches!(completed.result, Err(UploadError::EmptyFile(_))));
    assert!(!editor.complete_upload(completed, 0));
    assert_eq!(editor.document().children, vec![Node::paragraph("")]);
}

proptest! {
    #[test]
    fn container_width_always_lands_in_bounds(percent in 0u64..400) {
        let mut editor = mount(IMAGE);
        editor.image_action(&[0], ImageAction::ContainerWidth(percent));
        prop_assert_eq!(attrs(&editor).width, percent.clamp(30, 100));
    }

    #[test]
    fn reset_always_clears_both_dimensions(width in 0u64..2000, height in 0u64..2000) {
        let mut editor = mount(IMAGE);
        editor.image_action(&[0], ImageAction::ImageWidth(width));
        editor.image_action(&[0], ImageAction::ImageHeight(height));
        editor.image_action(&[0], ImageAction::ResetSize);
        let after = attrs(&editor);
        prop_assert_eq!(after.image_width, None);
        prop_assert_eq!(after.image_height, None);
    }
}
