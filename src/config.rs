use std::env;

use anyhow::Result;
use once_cell::sync::Lazy;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub database_url: String,
    pub admin_ids: Vec<i64>,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub default_model: String,
    pub premium_model: String,
    pub image_model: String,
    pub image_size: String,
    pub image_quality: String,
    pub max_tokens: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub free_user_limit: i64,
    pub price_30_days: u32,
    pub price_90_days: u32,
    pub price_365_days: u32,
    pub notify_before_expiration: i64,
    pub message_retention_days: i64,
    pub welcome_message: String,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_id_list(name: &str) -> Vec<i64> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .filter_map(|value| value.trim().parse::<i64>().ok())
        .collect()
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        let openai_api_key = env::var("OPENAI_API_KEY").unwrap_or_default();
        if openai_api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("OPENAI_API_KEY is required"));
        }

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string("DATABASE_URL", "sqlite://bot.db")),
            admin_ids: env_id_list("ADMIN_IDS"),
            openai_api_key,
            openai_base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            default_model: env_string("DEFAULT_MODEL", "gpt-3.5-turbo"),
            premium_model: env_string("PREMIUM_MODEL", "gpt-4o"),
            image_model: env_string("IMAGE_MODEL", "dall-e-3"),
            image_size: env_string("IMAGE_SIZE", "1024x1024"),
            image_quality: env_string("IMAGE_QUALITY", "standard"),
            max_tokens: env_i32("MAX_TOKENS", 1024),
            temperature: env_f32("TEMPERATURE", 0.7),
            top_p: env_f32("TOP_P", 1.0),
            free_user_limit: env_i64("FREE_USER_LIMIT", 20),
            price_30_days: env_u32("PRICE_30_DAYS", 299),
            price_90_days: env_u32("PRICE_90_DAYS", 799),
            price_365_days: env_u32("PRICE_365_DAYS", 2990),
            notify_before_expiration: env_i64("NOTIFY_BEFORE_EXPIRATION", 3),
            message_retention_days: env_i64("MESSAGE_RETENTION_DAYS", 30),
            welcome_message: env_string(
                "WELCOME_MESSAGE",
                "Привет! Я твой помощник. Готов выслушать и помочь 💬",
            ),
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

/// Seeded into the system_prompt table on first start; admins replace it
/// at runtime with /set_prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Ты — дружелюбный и эмпатичный собеседник. \
Поддерживай диалог, отвечай по делу и помни контекст разговора. \
Отвечай на языке пользователя. Не выдумывай факты: если чего-то не знаешь, скажи об этом прямо.";

pub const SUMMARY_DIRECTIVE: &str = "Создай краткое резюме этого диалога в 1-2 предложениях:";

/// Tests never ship real credentials; this seeds the required variables
/// before the first CONFIG access.
#[cfg(test)]
pub(crate) fn ensure_test_config() {
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        std::env::set_var("BOT_TOKEN", "123456:TEST-TOKEN");
        std::env::set_var("OPENAI_API_KEY", "sk-test");
    });
    Lazy::force(&CONFIG);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_sqlalchemy_style_database_url() {
        let normalized = normalize_database_url("sqlite+aiosqlite:///bot.db".to_string());
        assert_eq!(normalized, "sqlite:///bot.db");
    }

    #[test]
    fn keeps_plain_sqlite_url() {
        let normalized = normalize_database_url("sqlite://bot.db".to_string());
        assert_eq!(normalized, "sqlite://bot.db");
    }
}
