use std::env;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;

#[derive(Debug, Clone)]
pub struct PackageConfig {
    pub name: String,
    pub credits: i64,
    pub price_rub: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub database_url: String,
    pub admin_ids: Vec<i64>,
    pub openrouter_api_key: String,
    pub openrouter_model: String,
    pub openrouter_base_url: String,
    pub ai_timeout_secs: u64,
    pub ai_retry_attempts: u32,
    pub yookassa_shop_id: String,
    pub yookassa_secret_key: String,
    pub yookassa_base_url: String,
    pub yookassa_return_url: String,
    pub payment_poll_interval_secs: u64,
    pub payment_expiry_minutes: i64,
    pub packages: Vec<PackageConfig>,
    pub free_credits_count: i64,
    pub referral_reward_invitee: i64,
    pub referral_reward_purchase_percent: i64,
    pub album_quiet_period_ms: u64,
    pub album_hard_timeout_ms: u64,
    pub max_batch_size: usize,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_id_list(name: &str) -> Vec<i64> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| entry.trim().parse::<i64>().ok())
        .collect()
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

fn load_packages() -> Vec<PackageConfig> {
    let defaults: [(&str, &str, i64, i64); 4] = [
        ("1", "Starter", 5, 100),
        ("2", "Basic", 10, 180),
        ("3", "Advanced", 25, 400),
        ("4", "Professional", 50, 750),
    ];

    defaults
        .iter()
        .map(|(index, name, credits, price)| PackageConfig {
            name: env_string(&format!("PACKAGE_{index}_NAME"), name),
            credits: env_i64(&format!("PACKAGE_{index}_CREDITS"), *credits),
            price_rub: env_i64(&format!("PACKAGE_{index}_PRICE"), *price),
        })
        .filter(|package| package.credits > 0 && package.price_rub > 0)
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://bot.db?mode=rwc",
            )),
            admin_ids: env_id_list("ADMIN_IDS"),
            openrouter_api_key: env_string("OPENROUTER_API_KEY", ""),
            openrouter_model: env_string(
                "OPENROUTER_MODEL",
                "google/gemini-2.5-flash-image-preview",
            ),
            openrouter_base_url: env_string("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            ai_timeout_secs: env_u64("AI_TIMEOUT_SECS", 60),
            ai_retry_attempts: env_u32("AI_RETRY_ATTEMPTS", 2),
            yookassa_shop_id: env_string("YOOKASSA_SHOP_ID", ""),
            yookassa_secret_key: env_string("YOOKASSA_SECRET_KEY", ""),
            yookassa_base_url: env_string("YOOKASSA_BASE_URL", "https://api.yookassa.ru/v3"),
            yookassa_return_url: env_string("YOOKASSA_RETURN_URL", "https://t.me/your_bot"),
            payment_poll_interval_secs: env_u64("PAYMENT_POLL_INTERVAL_SECS", 30),
            payment_expiry_minutes: env_i64("PAYMENT_EXPIRY_MINUTES", 60),
            packages: load_packages(),
            free_credits_count: env_i64("FREE_CREDITS_COUNT", 3),
            referral_reward_invitee: env_i64("REFERRAL_REWARD_INVITEE", 3),
            referral_reward_purchase_percent: env_i64("REFERRAL_REWARD_PURCHASE_PERCENT", 10),
            album_quiet_period_ms: env_u64("ALBUM_QUIET_PERIOD_MS", 2500),
            album_hard_timeout_ms: env_u64("ALBUM_HARD_TIMEOUT_MS", 30_000),
            max_batch_size: env_usize("MAX_BATCH_SIZE", 10),
        })
    }

    pub fn is_admin(&self, telegram_id: i64) -> bool {
        self.admin_ids.contains(&telegram_id)
    }

    pub fn album_quiet_period(&self) -> Duration {
        Duration::from_millis(self.album_quiet_period_ms)
    }

    pub fn album_hard_timeout(&self) -> Duration {
        Duration::from_millis(self.album_hard_timeout_ms)
    }
}

pub const PASSPORT_PHOTO_PROMPT: &str = r#"You are a professional passport photo specialist. Transform this portrait into a perfect passport/ID photo that meets international biometric passport photo standards.

STRICT REQUIREMENTS:
1. Background: Pure white (#FFFFFF) background - completely uniform, no shadows, no gradients
2. Lighting: Even, diffused lighting on face - no harsh shadows, no glare
3. Composition:
   - Face centered in frame
   - Head and shoulders visible
   - Face occupies 70-80% of photo height
   - Eyes at 2/3 height from bottom
4. Subject Requirements:
   - Neutral facial expression (mouth closed)
   - Eyes open, looking directly at camera
   - Face fully visible, no hair covering eyes or face
5. Technical Quality:
   - High resolution and sharp focus
   - Natural skin tones (no filters, no beauty effects)
   - Proper exposure and no red-eye effect

Output format: High-quality passport photo that meets ICAO biometric passport photo standards."#;
