use std::time::Duration;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{FileId, InputFile, MessageId, ReplyParameters};
use teloxide::RequestError;
use tracing::warn;

use crate::config::CONFIG;

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

pub async fn get_file_url(bot: &Bot, file_id: &FileId) -> Result<String> {
    let file = bot.get_file(file_id.clone()).await?;
    Ok(format!(
        "https://api.telegram.org/file/bot{}/{}",
        CONFIG.bot_token, file.path
    ))
}

pub async fn send_message_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<Message> {
    let mut delay = Duration::from_secs_f32(1.5);
    for attempt in 0..TELEGRAM_RETRY_ATTEMPTS {
        let mut request = bot.send_message(chat_id, text.to_string());
        if let Some(reply_to) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(reply_to));
        }
        match request.await {
            Ok(message) => return Ok(message),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt + 1 == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("send_message attempt {} failed: {err}", attempt + 1);
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    unreachable!("send_message retry loop exhausted")
}

pub async fn send_photo_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    photo_bytes: &[u8],
    caption: Option<&str>,
    reply_to: Option<MessageId>,
) -> Result<Message> {
    let mut delay = Duration::from_secs_f32(1.5);
    for attempt in 0..TELEGRAM_RETRY_ATTEMPTS {
        let input = InputFile::memory(photo_bytes.to_vec()).file_name("passport_photo.jpg");
        let mut request = bot.send_photo(chat_id, input);
        if let Some(caption) = caption {
            request = request.caption(caption.to_string());
        }
        if let Some(reply_to) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(reply_to));
        }
        match request.await {
            Ok(message) => return Ok(message),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt + 1 == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("send_photo attempt {} failed: {err}", attempt + 1);
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    unreachable!("send_photo retry loop exhausted")
}
