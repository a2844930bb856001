//! One shared HTTP client for all external calls (Telegram file downloads,
//! the image service, the payment gateway). Call sites set their own
//! per-request timeouts; the client-wide ceiling sits above the slowest of
//! them, which is the AI generation request.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;

use crate::config::CONFIG;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn request_ceiling(ai_timeout_secs: u64) -> Duration {
    Duration::from_secs(ai_timeout_secs.max(30) + 15)
}

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(request_ceiling(CONFIG.ai_timeout_secs))
        .user_agent(concat!("passport-photo-bot/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_always_exceeds_the_ai_timeout() {
        assert_eq!(request_ceiling(60), Duration::from_secs(75));
        assert_eq!(request_ceiling(120), Duration::from_secs(135));
        // Short AI timeouts still leave room for media downloads.
        assert!(request_ceiling(5) >= Duration::from_secs(45));
    }
}
