use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::FileId;

use crate::config::CONFIG;
use crate::handlers::{classify, Inbound};
use crate::state::AppState;
use crate::utils::telegram::send_message_with_retry;

/// Entry point for every non-command message.
pub async fn handle_inbound(bot: Bot, state: AppState, message: Message) -> Result<()> {
    match classify(&message) {
        Inbound::AlbumPhoto { album_id, file_id } => {
            enqueue_photo(&state, &message, Some(album_id.0.as_str()), &file_id).await?;
        }
        Inbound::SinglePhoto { file_id } | Inbound::ImageDocument { file_id } => {
            enqueue_photo(&state, &message, None, &file_id).await?;
            send_message_with_retry(
                &bot,
                message.chat.id,
                "Got it, making your passport photo...",
                Some(message.id),
            )
            .await?;
        }
        Inbound::UnsupportedDocument => {
            send_message_with_retry(
                &bot,
                message.chat.id,
                "I can only work with JPEG, PNG or WebP images. Please send a photo.",
                Some(message.id),
            )
            .await?;
        }
        Inbound::Text => {
            send_message_with_retry(
                &bot,
                message.chat.id,
                "Send me a portrait photo to get started, or /help for details.",
                Some(message.id),
            )
            .await?;
        }
        Inbound::Other => {}
    }
    Ok(())
}

/// Registers one photo with the batch tracker. Album parts are buffered by
/// the tracker and acknowledged once, when their batch is processed.
async fn enqueue_photo(
    state: &AppState,
    message: &Message,
    album_id: Option<&str>,
    file_id: &FileId,
) -> Result<()> {
    let Some(from) = message.from.as_ref() else {
        return Ok(());
    };

    let user = state
        .db
        .get_or_create_user(
            i64::try_from(from.id.0).unwrap_or_default(),
            from.username.as_deref(),
            Some(&from.first_name),
            CONFIG.free_credits_count,
        )
        .await?;

    state
        .batches
        .add_photo(message.chat.id.0, user.id, album_id, None, &file_id.0)
        .await?;
    Ok(())
}
