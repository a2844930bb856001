//! OpenRouter image-generation client. One portrait in, one passport photo
//! out; failures carry a retryable/non-retryable classification so the
//! orchestrator can decide whether another attempt is worth it.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{CONFIG, PASSPORT_PHOTO_PROMPT};
use crate::error::{BotError, BotResult};
use crate::utils::http::get_http_client;
use crate::utils::media;

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = value.pointer("/error/message").and_then(|v| v.as_str()) {
            return message.to_string();
        }
    }
    truncate_for_log(trimmed, 2000)
}

fn build_payload(image_bytes: &[u8]) -> Value {
    let mime_type =
        media::detect_mime_type(image_bytes).unwrap_or_else(|| "image/jpeg".to_string());
    let encoded = general_purpose::STANDARD.encode(image_bytes);
    let data_url = format!("data:{mime_type};base64,{encoded}");

    json!({
        "model": CONFIG.openrouter_model,
        "modalities": ["text", "image"],
        "stream": false,
        "messages": [
            { "role": "system", "content": PASSPORT_PHOTO_PROMPT },
            {
                "role": "user",
                "content": [
                    {
                        "type": "text",
                        "text": "Transform this portrait into a professional passport photo following all requirements."
                    },
                    {
                        "type": "image_url",
                        "image_url": { "url": data_url }
                    }
                ]
            }
        ],
        "temperature": 0.2,
        "top_p": 0.95,
        "max_tokens": 2048
    })
}

/// Pulls the generated image out of a chat-completions response. The API
/// returns either a `message.images` array (data URLs, plain URLs, or nested
/// url objects) or, rarely, a base64 payload in `message.content`.
async fn extract_image(response: &Value) -> BotResult<Vec<u8>> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| BotError::ServiceError {
            message: "no choices in API response".to_string(),
            retryable: false,
        })?;

    let image_ref = message
        .get("images")
        .and_then(|v| v.as_array())
        .and_then(|images| images.first())
        .map(|entry| match entry {
            Value::String(text) => Some(text.clone()),
            Value::Object(_) => entry
                .pointer("/image_url/url")
                .or_else(|| entry.get("url"))
                .or_else(|| entry.get("data"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            _ => None,
        })
        .flatten()
        .or_else(|| {
            message
                .get("content")
                .and_then(|v| v.as_str())
                .filter(|content| content.starts_with("data:"))
                .map(|v| v.to_string())
        })
        .ok_or_else(|| BotError::ServiceError {
            message: "no image data found in API response".to_string(),
            retryable: false,
        })?;

    let bytes = if let Some(rest) = image_ref.strip_prefix("data:") {
        let encoded = rest.split_once(',').map(|(_, data)| data).unwrap_or(rest);
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| BotError::ServiceError {
                message: format!("invalid base64 image payload: {err}"),
                retryable: false,
            })?
    } else if image_ref.starts_with("http") {
        debug!("Downloading generated image from {}", truncate_for_log(&image_ref, 80));
        media::download_media(&image_ref)
            .await
            .ok_or_else(|| BotError::ServiceError {
                message: "failed to download generated image".to_string(),
                retryable: true,
            })?
    } else {
        general_purpose::STANDARD
            .decode(image_ref.trim())
            .map_err(|err| BotError::ServiceError {
                message: format!("invalid base64 image payload: {err}"),
                retryable: false,
            })?
    };

    image::guess_format(&bytes).map_err(|err| BotError::ServiceError {
        message: format!("generated payload is not a valid image: {err}"),
        retryable: true,
    })?;

    Ok(bytes)
}

/// One generation call with a bounded timeout.
pub async fn generate_passport_photo(image_bytes: &[u8]) -> BotResult<Vec<u8>> {
    let payload = build_payload(image_bytes);
    let client = get_http_client();

    let response = client
        .post(format!(
            "{}/chat/completions",
            CONFIG.openrouter_base_url.trim_end_matches('/')
        ))
        .header(
            "Authorization",
            format!("Bearer {}", CONFIG.openrouter_api_key),
        )
        .header("X-Title", "PassportPhotoBot")
        .timeout(Duration::from_secs(CONFIG.ai_timeout_secs))
        .json(&payload)
        .send()
        .await
        .map_err(|err| {
            if err.is_timeout() {
                BotError::ServiceTimeout(CONFIG.ai_timeout_secs)
            } else {
                BotError::ServiceError {
                    message: err.to_string(),
                    retryable: err.is_connect(),
                }
            }
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = summarize_error_body(&body);
        warn!("OpenRouter API error: status={status}, body={detail}");
        return Err(BotError::ServiceError {
            message: format!("API error {status}: {detail}"),
            retryable: status.as_u16() == 429 || status.is_server_error(),
        });
    }

    let value = response
        .json::<Value>()
        .await
        .map_err(|err| BotError::ServiceError {
            message: format!("malformed API response: {err}"),
            retryable: false,
        })?;

    extract_image(&value).await
}

/// Retries retryable failures with doubling backoff; non-retryable errors
/// and exhausted attempts surface to the caller for refund handling.
pub async fn generate_with_retry(image_bytes: &[u8]) -> BotResult<Vec<u8>> {
    let attempts = CONFIG.ai_retry_attempts.max(1);
    let mut delay = Duration::from_secs_f32(1.5);

    for attempt in 0..attempts {
        match generate_passport_photo(image_bytes).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                if !err.is_retryable() || attempt + 1 == attempts {
                    return Err(err);
                }
                warn!("Generation attempt {} failed: {err}", attempt + 1);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    unreachable!("generation retry loop exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes() -> Vec<u8> {
        // Minimal valid PNG header plus IHDR chunk, enough for guess_format.
        vec![
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
            0x44, 0x52,
        ]
    }

    #[tokio::test]
    async fn extracts_image_from_data_url_in_images_array() {
        let encoded = general_purpose::STANDARD.encode(png_bytes());
        let response = json!({
            "choices": [{
                "message": {
                    "images": [{ "image_url": { "url": format!("data:image/png;base64,{encoded}") } }]
                }
            }]
        });

        let bytes = extract_image(&response).await.unwrap();
        assert_eq!(bytes, png_bytes());
    }

    #[tokio::test]
    async fn extracts_image_from_content_fallback() {
        let encoded = general_purpose::STANDARD.encode(png_bytes());
        let response = json!({
            "choices": [{
                "message": { "content": format!("data:image/png;base64,{encoded}") }
            }]
        });

        let bytes = extract_image(&response).await.unwrap();
        assert_eq!(bytes, png_bytes());
    }

    #[tokio::test]
    async fn missing_image_is_a_non_retryable_error() {
        let response = json!({
            "choices": [{ "message": { "content": "sorry, cannot help" } }]
        });

        let err = extract_image(&response).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
