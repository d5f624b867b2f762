//! Attachment classification for platform-appropriate delivery.
//!
//! Telegram has distinct send methods per media kind (`sendPhoto`,
//! `sendVideo`, `sendDocument`); Discord accepts any file but renders
//! images and videos inline. The classifier decides the delivery path.

/// Delivery category for one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "wmv"];

/// Classify an attachment by content-type hint, falling back to the file
/// extension. Total: every input maps to exactly one kind.
pub fn classify(filename: &str, content_type: Option<&str>) -> AttachmentKind {
    if let Some(hint) = content_type.map(str::trim).filter(|h| !h.is_empty()) {
        let hint = hint.to_ascii_lowercase();
        if hint.starts_with("image") {
            return AttachmentKind::Image;
        }
        if hint.starts_with("video") {
            return AttachmentKind::Video;
        }
    }

    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => AttachmentKind::Image,
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext) => AttachmentKind::Video,
        _ => AttachmentKind::File,
    }
}
