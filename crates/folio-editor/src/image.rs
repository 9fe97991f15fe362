use std::future::Future;
use std::path::Path as FsPath;
use std::pin::Pin;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use folio_core::{
    AttrPatch, Editor, IMAGE_MAX_WIDTH_PERCENT, IMAGE_MIN_WIDTH_PERCENT, Node, Path,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::escape_attr;
use crate::node_view::{NodeView, ViewId};
use crate::view::EditorView;

const NEAR_COMPLETE_AFTER_MS: u64 = 800;

/// A file picked or pasted by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            mime: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn read(path: impl AsRef<FsPath>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, bytes))
    }

    /// The declared MIME type, or one guessed from the file name.
    pub fn mime_type(&self) -> String {
        match &self.mime {
            Some(mime) => mime.clone(),
            None => mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(&self.bytes))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("{0} is empty")]
    EmptyFile(String),
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

pub type UploadFuture = Pin<Box<dyn Future<Output = Result<String, UploadError>>>>;

/// Turns a file into a displayable image source.
pub trait ImageUploader {
    fn upload(&self, file: ImageFile) -> UploadFuture;
}

impl<F> ImageUploader for F
where
    F: Fn(ImageFile) -> UploadFuture,
{
    fn upload(&self, file: ImageFile) -> UploadFuture {
        self(file)
    }
}

/// Inlines the file as a base64 data URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataUrlUploader;

impl ImageUploader for DataUrlUploader {
    fn upload(&self, file: ImageFile) -> UploadFuture {
        Box::pin(async move {
            if file.bytes.is_empty() {
                return Err(UploadError::EmptyFile(file.name));
            }
            Ok(file.to_data_url())
        })
    }
}

/// Where a finished upload lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    /// A new image at the caret.
    Insert,
    /// The image shown by this view.
    Replace(ViewId),
}

/// An upload in flight. The host drives it to completion and hands the result back.
pub struct PendingUpload {
    target: UploadTarget,
    file_name: String,
    future: UploadFuture,
}

impl PendingUpload {
    pub fn new(target: UploadTarget, file_name: impl Into<String>, future: UploadFuture) -> Self {
        Self {
            target,
            file_name: file_name.into(),
            future,
        }
    }

    pub fn target(&self) -> UploadTarget {
        self.target
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub async fn wait(self) -> CompletedUpload {
        let result = self.future.await;
        CompletedUpload {
            target: self.target,
            file_name: self.file_name,
            result,
        }
    }
}

pub struct CompletedUpload {
    pub target: UploadTarget,
    pub file_name: String,
    pub result: Result<String, UploadError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageAlign {
    Left,
    Center,
    Right,
}

impl ImageAlign {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageAlign::Left => "left",
            ImageAlign::Center => "center",
            ImageAlign::Right => "right",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "left" => Some(ImageAlign::Left),
            "center" => Some(ImageAlign::Center),
            "right" => Some(ImageAlign::Right),
            _ => None,
        }
    }
}

/// Typed view of an image node's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttrs {
    pub src: String,
    pub alt: Option<String>,
    pub caption: String,
    /// Share of the column, in percent.
    pub width: u64,
    pub align: ImageAlign,
    pub image_width: Option<u64>,
    pub image_height: Option<u64>,
}

impl ImageAttrs {
    pub fn from_node(node: &Node) -> Option<Self> {
        if node.kind() != "image" {
            return None;
        }
        let attrs = node.attrs()?;
        let positive = |key: &str| attrs.get(key).and_then(|v| v.as_u64()).filter(|v| *v > 0);
        Some(Self {
            src: node.attr_str("src").unwrap_or_default().to_string(),
            alt: node.attr_str("alt").map(str::to_string),
            caption: node.attr_str("caption").unwrap_or_default().to_string(),
            width: attrs
                .get("width")
                .and_then(|v| v.as_u64())
                .unwrap_or(IMAGE_MAX_WIDTH_PERCENT),
            align: node
                .attr_str("align")
                .and_then(ImageAlign::parse)
                .unwrap_or(ImageAlign::Center),
            image_width: positive("image_width"),
            image_height: positive("image_height"),
        })
    }
}

/// Coarse upload indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Idle,
    Started { since_ms: u64 },
    NearComplete,
    Settled { until_ms: u64 },
}

impl UploadStage {
    pub fn progress(self) -> Option<u8> {
        match self {
            UploadStage::Idle => None,
            UploadStage::Started { .. } => Some(15),
            UploadStage::NearComplete => Some(90),
            UploadStage::Settled { .. } => Some(100),
        }
    }

    pub fn label(self) -> Option<&'static str> {
        match self.progress()? {
            100 => Some("Processing…"),
            _ => Some("Uploading…"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAction {
    Align(ImageAlign),
    ContainerWidth(u64),
    ImageWidth(u64),
    ImageHeight(u64),
    ResetSize,
    Remove,
    CaptionInput(String),
    CaptionBlur,
    CaptionEnter,
}

/// Controller for one image node. Every change goes through the editor; nothing fires
/// while the editor is read-only.
pub struct ImageNodeView {
    id: ViewId,
    path: Path,
    node: Node,
    attrs: ImageAttrs,
    caption_draft: String,
    stage: UploadStage,
    settle_ms: u64,
    mounted: bool,
}

impl ImageNodeView {
    pub fn new(id: ViewId, node: &Node, path: &[usize], settle_ms: u64) -> Option<Self> {
        let attrs = ImageAttrs::from_node(node)?;
        Some(Self {
            id,
            path: path.to_vec(),
            node: node.clone(),
            caption_draft: attrs.caption.clone(),
            attrs,
            stage: UploadStage::Idle,
            settle_ms,
            mounted: true,
        })
    }

    pub fn attrs(&self) -> &ImageAttrs {
        &self.attrs
    }

    pub fn caption_draft(&self) -> &str {
        &self.caption_draft
    }

    pub fn stage(&self) -> UploadStage {
        self.stage
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn apply(
        &mut self,
        editor: &mut Editor,
        view: &mut dyn EditorView,
        action: ImageAction,
    ) -> bool {
        match action {
            ImageAction::Align(align) => self.set_align(editor, align),
            ImageAction::ContainerWidth(percent) => self.set_container_width(editor, percent),
            ImageAction::ImageWidth(px) => self.set_image_width(editor, px),
            ImageAction::ImageHeight(px) => self.set_image_height(editor, px),
            ImageAction::ResetSize => self.reset_size(editor),
            ImageAction::Remove => self.remove(editor),
            ImageAction::CaptionInput(text) => self.caption_input(editor, &text),
            ImageAction::CaptionBlur => self.caption_blur(editor),
            ImageAction::CaptionEnter => self.caption_enter(editor, view),
        }
    }

    pub fn set_align(&mut self, editor: &mut Editor, align: ImageAlign) -> bool {
        self.patch(editor, AttrPatch::default().set("align", align.as_str()), "image:align")
    }

    /// Sets the column share, clamped to the schema bounds.
    pub fn set_container_width(&mut self, editor: &mut Editor, percent: u64) -> bool {
        let width = percent.clamp(IMAGE_MIN_WIDTH_PERCENT, IMAGE_MAX_WIDTH_PERCENT);
        self.patch(editor, AttrPatch::default().set("width", width), "image:resize")
    }

    /// Zero clears the explicit width.
    pub fn set_image_width(&mut self, editor: &mut Editor, px: u64) -> bool {
        let patch = AttrPatch::default().set_or_remove("image_width", (px > 0).then_some(px));
        self.patch(editor, patch, "image:resize")
    }

    /// Zero clears the explicit height.
    pub fn set_image_height(&mut self, editor: &mut Editor, px: u64) -> bool {
        let patch = AttrPatch::default().set_or_remove("image_height", (px > 0).then_some(px));
        self.patch(editor, patch, "image:resize")
    }

    pub fn reset_size(&mut self, editor: &mut Editor) -> bool {
        let patch = AttrPatch::default()
            .remove("image_width")
            .remove("image_height");
        self.patch(editor, patch, "image:reset_size")
    }

    pub fn remove(&mut self, editor: &mut Editor) -> bool {
        if !self.mounted || !editor.is_editable() {
            return false;
        }
        match editor.delete_node(self.path.clone(), "image:remove") {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = ?self.path, %err, "failed to remove image");
                false
            }
        }
    }

    /// Caption text as typed. Line breaks never make it into the caption.
    pub fn caption_input(&mut self, editor: &Editor, text: &str) -> bool {
        if !self.mounted || !editor.is_editable() {
            return false;
        }
        self.caption_draft = text.chars().filter(|c| !matches!(c, '\n' | '\r')).collect();
        true
    }

    pub fn caption_blur(&mut self, editor: &mut Editor) -> bool {
        self.commit_caption(editor)
    }

    /// Commits the caption and hands focus back to the document.
    pub fn caption_enter(&mut self, editor: &mut Editor, view: &mut dyn EditorView) -> bool {
        let committed = self.commit_caption(editor);
        if committed {
            view.focus();
        }
        committed
    }

    fn commit_caption(&mut self, editor: &mut Editor) -> bool {
        if !self.mounted || !editor.is_editable() {
            return false;
        }
        if self.caption_draft == self.attrs.caption {
            return true;
        }
        let caption = self.caption_draft.clone();
        self.patch(editor, AttrPatch::default().set("caption", caption), "image:caption")
    }

    /// Starts replacing the image with `file`.
    pub fn begin_upload(
        &mut self,
        editor: &Editor,
        uploader: &dyn ImageUploader,
        file: ImageFile,
        now: u64,
    ) -> Option<PendingUpload> {
        if !self.mounted || !editor.is_editable() {
            return None;
        }
        self.stage = UploadStage::Started { since_ms: now };
        let name = file.name.clone();
        Some(PendingUpload::new(
            UploadTarget::Replace(self.id),
            name,
            uploader.upload(file),
        ))
    }

    /// Applies a finished upload. A failure keeps the current attributes.
    pub fn finish_upload(
        &mut self,
        editor: &mut Editor,
        file_name: &str,
        result: Result<String, UploadError>,
        now: u64,
    ) -> bool {
        if !self.mounted {
            return false;
        }
        self.stage = UploadStage::Settled {
            until_ms: now + self.settle_ms,
        };
        match result {
            Ok(src) => {
                let patch = AttrPatch::default().set("src", src).set("alt", file_name);
                self.patch(editor, patch, "image:replace")
            }
            Err(err) => {
                tracing::warn!(file = file_name, %err, "image upload failed");
                false
            }
        }
    }

    pub fn tick(&mut self, now: u64) {
        self.stage = match self.stage {
            UploadStage::Started { since_ms } if now >= since_ms + NEAR_COMPLETE_AFTER_MS => {
                UploadStage::NearComplete
            }
            UploadStage::Settled { until_ms } if now >= until_ms => UploadStage::Idle,
            stage => stage,
        };
    }

    fn patch(&mut self, editor: &mut Editor, patch: AttrPatch, source: &str) -> bool {
        if !self.mounted || !editor.is_editable() {
            return false;
        }
        match editor.set_node_attrs(self.path.clone(), patch, source) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = ?self.path, %err, source, "image update failed");
                false
            }
        }
    }
}

impl NodeView for ImageNodeView {
    fn id(&self) -> ViewId {
        self.id
    }

    fn path(&self) -> &[usize] {
        &self.path
    }

    fn node(&self) -> &Node {
        &self.node
    }

    fn update(&mut self, node: &Node, path: &[usize]) -> bool {
        let Some(attrs) = ImageAttrs::from_node(node) else {
            return false;
        };
        if attrs.caption != self.attrs.caption {
            self.caption_draft.clone_from(&attrs.caption);
        }
        self.attrs = attrs;
        self.node = node.clone();
        self.path = path.to_vec();
        true
    }

    fn render(&self) -> String {
        let attrs = &self.attrs;
        let mut img = format!(
            r#"<img class="editor-image-node" src="{}" alt="{}""#,
            escape_attr(&attrs.src),
            escape_attr(attrs.alt.as_deref().unwrap_or_default())
        );
        if let Some(width) = attrs.image_width {
            img.push_str(&format!(r#" width="{width}""#));
        }
        if let Some(height) = attrs.image_height {
            img.push_str(&format!(r#" height="{height}""#));
        }
        img.push('>');

        let progress = match (self.stage.progress(), self.stage.label()) {
            (Some(progress), Some(label)) => format!(
                r#"<div class="image-upload-progress" data-progress="{progress}">{label}</div>"#
            ),
            _ => String::new(),
        };
        let caption = if attrs.caption.is_empty() {
            String::new()
        } else {
            format!("<figcaption>{}</figcaption>", escape_attr(&attrs.caption))
        };

        format!(
            r#"<figure class="image-figure" data-align="{}" style="width: {}%">{img}{progress}{caption}</figure>"#,
            attrs.align.as_str(),
            attrs.width
        )
    }

    fn destroy(&mut self) {
        self.mounted = false;
    }
}
