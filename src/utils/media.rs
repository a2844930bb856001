use tracing::warn;

use crate::utils::http::get_http_client;

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

/// Whether the bytes look like an image format the AI service accepts.
pub fn is_supported_image(data: &[u8]) -> bool {
    matches!(
        detect_mime_type(data).as_deref(),
        Some("image/jpeg") | Some("image/png") | Some("image/webp")
    )
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout()
        || err.is_connect()
        || err
            .status()
            .map(|status| status.is_server_error() || status.as_u16() == 429)
            .unwrap_or(false)
}

pub async fn download_media(url: &str) -> Option<Vec<u8>> {
    let client = get_http_client();
    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch media {url}: {err} (attempt {}/{})",
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                if !should_retry_error(&err) || attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS {
                    return None;
                }
                let delay = MEDIA_DOWNLOAD_BASE_DELAY_MS * (attempt as u64 + 1);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                continue;
            }
        };

        if !response.status().is_success() {
            warn!(
                "Media download {url} returned status {}",
                response.status()
            );
            return None;
        }

        match response.bytes().await {
            Ok(bytes) => return Some(bytes.to_vec()),
            Err(err) => {
                warn!("Failed to read media body from {url}: {err}");
                return None;
            }
        }
    }
    None
}
