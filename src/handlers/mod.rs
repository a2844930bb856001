pub mod callbacks;
pub mod commands;
pub mod photos;

use teloxide::types::{FileId, MediaGroupId, Message};

const SUPPORTED_DOCUMENT_MIME: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// Everything a non-command message can mean to this bot. Classification is
/// total: every update lands in exactly one arm.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A compressed photo that is part of an album.
    AlbumPhoto {
        album_id: MediaGroupId,
        file_id: FileId,
    },
    /// A compressed photo sent on its own.
    SinglePhoto { file_id: FileId },
    /// An uncompressed image sent as a file attachment.
    ImageDocument { file_id: FileId },
    /// A file attachment we cannot process (video, PDF, ...).
    UnsupportedDocument,
    /// Plain text that is not a command.
    Text,
    /// Stickers, voice notes, location pins and the rest.
    Other,
}

pub fn classify(message: &Message) -> Inbound {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        let file_id = photo.file.id.clone();
        if let Some(album_id) = message.media_group_id() {
            return Inbound::AlbumPhoto {
                album_id: album_id.clone(),
                file_id,
            };
        }
        return Inbound::SinglePhoto { file_id };
    }

    if let Some(document) = message.document() {
        let supported = document
            .mime_type
            .as_ref()
            .map(|mime| SUPPORTED_DOCUMENT_MIME.contains(&mime.essence_str()))
            .unwrap_or(false);
        if supported {
            return Inbound::ImageDocument {
                file_id: document.file.id.clone(),
            };
        }
        return Inbound::UnsupportedDocument;
    }

    if message.text().is_some() {
        return Inbound::Text;
    }
    Inbound::Other
}
